//! Unique inbox subjects and reply tokens.
//!
//! Inboxes are `_INBOX.<22-char-nuid>.<8-char-token>`. The NUID part is a
//! process-wide random prefix plus a monotonically increasing sequence,
//! re-randomized when the sequence space is exhausted.

use std::sync::Mutex;

use rand::Rng;

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub(crate) const INBOX_PREFIX: &str = "_INBOX.";
const NUID_PREFIX_LEN: usize = 12;
const NUID_SEQ_LEN: usize = 10;
pub(crate) const NUID_LEN: usize = NUID_PREFIX_LEN + NUID_SEQ_LEN;
pub(crate) const REPLY_TOKEN_LEN: usize = 8;

struct Nuid {
    prefix: [u8; NUID_PREFIX_LEN],
    seq: u64,
    increment: u64,
}

impl Nuid {
    fn new() -> Self {
        let mut nuid = Nuid {
            prefix: [0; NUID_PREFIX_LEN],
            seq: 0,
            increment: 0,
        };
        nuid.randomize();
        nuid
    }

    fn randomize(&mut self) {
        let mut rng = rand::thread_rng();
        for b in self.prefix.iter_mut() {
            *b = BASE62[rng.gen_range(0..62)];
        }
        self.seq = rng.gen_range(0..u64::pow(62, 10) / 2);
        self.increment = rng.gen_range(33..333);
    }

    fn next(&mut self) -> String {
        self.seq += self.increment;
        if self.seq >= u64::pow(62, 10) {
            self.randomize();
        }
        let mut out = Vec::with_capacity(NUID_LEN);
        out.extend_from_slice(&self.prefix);
        let mut seq = self.seq;
        let mut digits = [0u8; NUID_SEQ_LEN];
        for d in digits.iter_mut().rev() {
            *d = BASE62[(seq % 62) as usize];
            seq /= 62;
        }
        out.extend_from_slice(&digits);
        // Safe: every byte comes from the base62 alphabet.
        String::from_utf8(out).unwrap()
    }
}

fn global() -> &'static Mutex<Nuid> {
    use std::sync::OnceLock;
    static NUID: OnceLock<Mutex<Nuid>> = OnceLock::new();
    NUID.get_or_init(|| Mutex::new(Nuid::new()))
}

/// Next process-unique NUID string.
pub(crate) fn next_nuid() -> String {
    global().lock().unwrap().next()
}

/// Random base62 token of length `n`.
pub(crate) fn token(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| BASE62[rng.gen_range(0..62)] as char).collect()
}

/// Fresh `_INBOX.<nuid>.<token>` subject usable as a request reply-to.
pub(crate) fn new_inbox(prefix: &str) -> String {
    format!("{prefix}{}.{}", next_nuid(), token(REPLY_TOKEN_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn nuids_are_unique_and_sized() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = next_nuid();
            assert_eq!(id.len(), NUID_LEN);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn inbox_shape() {
        let inbox = new_inbox(INBOX_PREFIX);
        assert!(inbox.starts_with("_INBOX."));
        assert_eq!(
            inbox.len(),
            INBOX_PREFIX.len() + NUID_LEN + 1 + REPLY_TOKEN_LEN
        );
        assert_eq!(inbox.split('.').count(), 3);
    }

    #[test]
    fn tokens_are_alphanumeric() {
        let tok = token(REPLY_TOKEN_LEN);
        assert_eq!(tok.len(), REPLY_TOKEN_LEN);
        assert!(tok.bytes().all(|b| b.is_ascii_alphanumeric()));
    }
}
