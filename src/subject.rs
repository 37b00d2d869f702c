//! Subject and queue-group validation.
//!
//! Subjects are dot-separated token sequences. `*` matches exactly one
//! token, `>` matches the rest of the subject and is only valid as the
//! final token. Publish subjects must be literal; subscribe subjects may
//! carry wildcards.

use crate::error::{Error, Result};

/// Validates a subject for publishing (no wildcards, no empty tokens).
pub fn check_publish_subject(subject: &str) -> Result<()> {
    check(subject, false)
}

/// Validates a subject for subscribing (wildcards allowed).
pub fn check_subscribe_subject(subject: &str) -> Result<()> {
    check(subject, true)
}

/// Validates a queue-group name: a single non-empty token with no spaces
/// or wildcards.
pub fn check_queue_name(queue: &str) -> Result<()> {
    if queue.is_empty()
        || queue
            .bytes()
            .any(|b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' || b == b'.')
    {
        return Err(Error::InvalidArg("invalid queue group name"));
    }
    Ok(())
}

fn check(subject: &str, wildcards_ok: bool) -> Result<()> {
    if subject.is_empty() {
        return Err(Error::InvalidSubject);
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    for (i, tok) in tokens.iter().enumerate() {
        if tok.is_empty() {
            return Err(Error::InvalidSubject);
        }
        if tok.bytes().any(|b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n') {
            return Err(Error::InvalidSubject);
        }
        match *tok {
            "*" if !wildcards_ok => return Err(Error::InvalidSubject),
            ">" => {
                if !wildcards_ok || i != last {
                    return Err(Error::InvalidSubject);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// True if the subject contains a wildcard token.
pub fn has_wildcards(subject: &str) -> bool {
    subject.split('.').any(|tok| tok == "*" || tok == ">")
}

/// Matches a literal subject against a possibly wildcarded pattern.
///
/// Used by the in-process router of the micro-service framework; the
/// server performs the authoritative matching for ordinary subscriptions.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_subjects() {
        assert!(check_publish_subject("foo").is_ok());
        assert!(check_publish_subject("foo.bar.baz").is_ok());
        assert!(check_publish_subject("").is_err());
        assert!(check_publish_subject("foo..bar").is_err());
        assert!(check_publish_subject("foo.*").is_err());
        assert!(check_publish_subject("foo.>").is_err());
        assert!(check_publish_subject("foo bar").is_err());
    }

    #[test]
    fn subscribe_subjects() {
        assert!(check_subscribe_subject("foo.*.bar").is_ok());
        assert!(check_subscribe_subject("foo.>").is_ok());
        assert!(check_subscribe_subject(">").is_ok());
        // '>' only valid in final position
        assert!(check_subscribe_subject(">.foo").is_err());
    }

    #[test]
    fn queue_names() {
        assert!(check_queue_name("workers").is_ok());
        assert!(check_queue_name("").is_err());
        assert!(check_queue_name("a b").is_err());
        assert!(check_queue_name("a.b").is_err());
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches("foo.*", "foo.bar"));
        assert!(!matches("foo.*", "foo.bar.baz"));
        assert!(matches("foo.>", "foo.bar.baz"));
        assert!(matches(">", "anything.at.all"));
        assert!(matches("foo.bar", "foo.bar"));
        assert!(!matches("foo.bar", "foo.baz"));
        assert!(!matches("foo.*.baz", "foo.baz"));
    }
}
