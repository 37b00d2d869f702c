//! Server pool and reconnect bookkeeping.
//!
//! The pool is an ordered list of parsed broker URLs. User-supplied
//! entries are `explicit`; entries merged from `INFO.connect_urls` are
//! discovered. Deduplication is by normalized `host:port`. Each entry
//! tracks how many consecutive reconnect attempts it has absorbed and
//! when the last one happened, which drives the backoff computation.

use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Error, Result};

pub(crate) const DEFAULT_PORT: u16 = 4222;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scheme {
    Plain,
    Tls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl ServerUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidArg("empty server url"));
        }
        let (scheme, rest) = match input.split_once("://") {
            Some(("nats", rest)) => (Scheme::Plain, rest),
            Some(("tls", rest)) => (Scheme::Tls, rest),
            Some(_) => return Err(Error::InvalidArg("unsupported url scheme")),
            None => (Scheme::Plain, input),
        };
        let (auth, hostport) = match rest.rsplit_once('@') {
            Some((auth, hostport)) => (Some(auth), hostport),
            None => (None, rest),
        };
        let (user, pass) = match auth {
            Some(auth) => match auth.split_once(':') {
                Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
                None => (Some(auth.to_string()), None),
            },
            None => (None, None),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| Error::InvalidArg("invalid port in server url"))?,
            ),
            None => (hostport, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(Error::InvalidArg("missing host in server url"));
        }
        Ok(ServerUrl {
            scheme,
            host: host.to_string(),
            port,
            user,
            pass,
        })
    }

    /// Dedup key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host.to_ascii_lowercase(), self.port)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
pub(crate) struct ServerEntry {
    pub url: ServerUrl,
    pub explicit: bool,
    pub reconnect_attempts: u32,
    pub last_attempt: Option<Instant>,
}

#[derive(Debug, Default)]
pub(crate) struct ServerPool {
    entries: Vec<ServerEntry>,
    cursor: usize,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the pool from user URLs, optionally randomizing the order.
    pub fn from_urls<S: AsRef<str>>(urls: &[S], randomize: bool) -> Result<Self> {
        let mut pool = ServerPool::new();
        for url in urls {
            pool.add(url.as_ref(), true)?;
        }
        if pool.entries.is_empty() {
            return Err(Error::NoServers);
        }
        if randomize {
            pool.shuffle();
        }
        Ok(pool)
    }

    /// Adds a URL; returns false if an entry with the same `host:port`
    /// already exists.
    pub fn add(&mut self, url: &str, explicit: bool) -> Result<bool> {
        let parsed = ServerUrl::parse(url)?;
        if self.entries.iter().any(|e| e.url.key() == parsed.key()) {
            return Ok(false);
        }
        self.entries.push(ServerEntry {
            url: parsed,
            explicit,
            reconnect_attempts: 0,
            last_attempt: None,
        });
        Ok(true)
    }

    /// Merges server-advertised URLs; returns the ones that were new.
    pub fn merge_discovered(&mut self, urls: &[String]) -> Vec<String> {
        let mut added = Vec::new();
        for url in urls {
            if let Ok(true) = self.add(url, false) {
                added.push(url.clone());
            }
        }
        added
    }

    pub fn shuffle(&mut self) {
        self.entries.shuffle(&mut rand::thread_rng());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn urls(&self) -> impl Iterator<Item = &ServerUrl> {
        self.entries.iter().map(|e| &e.url)
    }

    /// Next candidate for a (re)connect attempt, round-robin. Entries that
    /// have exceeded `max_reconnect` consecutive attempts are skipped;
    /// `None` means every entry is exhausted.
    pub fn select_next(&mut self, max_reconnect: Option<u32>) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let n = self.entries.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            let entry = &self.entries[idx];
            if let Some(max) = max_reconnect {
                if entry.reconnect_attempts >= max {
                    continue;
                }
            }
            self.cursor = (idx + 1) % n;
            return Some(idx);
        }
        None
    }

    pub fn entry(&self, idx: usize) -> &ServerEntry {
        &self.entries[idx]
    }

    /// Delay to respect before attempting `idx`:
    /// `max(0, reconnect_wait - elapsed_since_last_attempt) + jitter`.
    pub fn backoff(&self, idx: usize, reconnect_wait: Duration, jitter: Duration) -> Duration {
        let entry = &self.entries[idx];
        let base = match entry.last_attempt {
            Some(at) => reconnect_wait.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        };
        if jitter.is_zero() {
            base
        } else {
            base + rand::thread_rng().gen_range(Duration::ZERO..jitter)
        }
    }

    pub fn record_attempt(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        entry.reconnect_attempts += 1;
        entry.last_attempt = Some(Instant::now());
    }

    pub fn record_success(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        entry.reconnect_attempts = 0;
        entry.last_attempt = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        let url = ServerUrl::parse("nats://demo.example.com:4333").unwrap();
        assert_eq!(url.scheme, Scheme::Plain);
        assert_eq!(url.host, "demo.example.com");
        assert_eq!(url.port, 4333);

        let url = ServerUrl::parse("localhost").unwrap();
        assert_eq!(url.port, DEFAULT_PORT);

        let url = ServerUrl::parse("tls://u:p@h:1234").unwrap();
        assert_eq!(url.scheme, Scheme::Tls);
        assert_eq!(url.user.as_deref(), Some("u"));
        assert_eq!(url.pass.as_deref(), Some("p"));

        assert!(ServerUrl::parse("http://x").is_err());
        assert!(ServerUrl::parse("nats://:4222").is_err());
        assert!(ServerUrl::parse("nats://h:notaport").is_err());
    }

    #[test]
    fn dedup_by_host_port() {
        let mut pool = ServerPool::new();
        assert!(pool.add("nats://a:4222", true).unwrap());
        assert!(!pool.add("A:4222", false).unwrap());
        assert!(pool.add("a:4223", false).unwrap());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn merge_reports_only_new() {
        let mut pool = ServerPool::from_urls(&["nats://a:4222"], false).unwrap();
        let added = pool.merge_discovered(&[
            "a:4222".to_string(),
            "b:4222".to_string(),
            "b:4222".to_string(),
        ]);
        assert_eq!(added, vec!["b:4222".to_string()]);
        assert_eq!(pool.len(), 2);
        assert!(!pool.entry(1).explicit);
    }

    #[test]
    fn select_skips_exhausted_entries() {
        let mut pool = ServerPool::from_urls(&["a:1", "b:2"], false).unwrap();
        let first = pool.select_next(Some(2)).unwrap();
        pool.record_attempt(first);
        pool.record_attempt(first);
        // first is now exhausted with max_reconnect=2
        let mut seen = Vec::new();
        for _ in 0..3 {
            if let Some(idx) = pool.select_next(Some(2)) {
                seen.push(idx);
                pool.record_attempt(idx);
            }
        }
        assert!(seen.iter().all(|&i| i != first));
        assert!(pool.select_next(Some(2)).is_none());
    }

    #[test]
    fn backoff_respects_recent_attempt() {
        let mut pool = ServerPool::from_urls(&["a:1"], false).unwrap();
        // Never attempted: no wait.
        assert_eq!(
            pool.backoff(0, Duration::from_secs(2), Duration::ZERO),
            Duration::ZERO
        );
        pool.record_attempt(0);
        let delay = pool.backoff(0, Duration::from_secs(2), Duration::ZERO);
        assert!(delay > Duration::from_millis(1500) && delay <= Duration::from_secs(2));
    }

    #[test]
    fn success_resets_attempts() {
        let mut pool = ServerPool::from_urls(&["a:1"], false).unwrap();
        pool.record_attempt(0);
        pool.record_attempt(0);
        assert_eq!(pool.entry(0).reconnect_attempts, 2);
        pool.record_success(0);
        assert_eq!(pool.entry(0).reconnect_attempts, 0);
    }
}
