//! Message headers.
//!
//! The wire form is an HTTP-like block opening with `NATS/1.0`, optionally
//! followed on the same line by a status code and description. Header lines
//! are `Key: Value`; duplicate keys are allowed and their order per key is
//! preserved. A blank line terminates the block.

use crate::error::{Error, Result};

pub(crate) const HDR_PREFIX: &str = "NATS/1.0";
pub(crate) const CRLF: &[u8] = b"\r\n";

/// Status code for in-band control messages (idle heartbeat, flow control).
pub(crate) const STATUS_CTRL: u16 = 100;
/// No messages available for a pull request.
pub(crate) const STATUS_NO_MESSAGES: u16 = 404;
/// Pull request timed out on the server.
pub(crate) const STATUS_REQUEST_TIMEOUT: u16 = 408;
/// Pull request exceeded a server-side limit (e.g. max bytes).
pub(crate) const STATUS_CONFLICT: u16 = 409;
/// No responders available for a request.
pub(crate) const STATUS_NO_RESPONDERS: u16 = 503;

/// Inline status carried on the `NATS/1.0` line of a headers block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderStatus {
    pub code: u16,
    pub description: Option<String>,
}

/// Insertion-ordered header multimap.
///
/// Keys are matched exactly (the protocol is case-sensitive). Values for a
/// repeated key keep their insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all values for `key` with `value`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, vals)) => {
                vals.clear();
                vals.push(value);
            }
            None => self.entries.push((key, vec![value])),
        }
    }

    /// Adds a value for `key`, keeping any existing ones.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, vals)) => vals.push(value),
            None => self.entries.push((key, vec![value])),
        }
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, vals)| vals.first().map(String::as_str))
    }

    /// All values for `key` in insertion order.
    pub fn values(&self, key: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, vals)| vals.as_slice())
            .unwrap_or(&[])
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, vals)| vals.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vals)| vals.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Encodes the block including the `NATS/1.0` line and terminating
    /// blank line.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(HDR_PREFIX.as_bytes());
        buf.extend_from_slice(CRLF);
        for (key, vals) in &self.entries {
            for val in vals {
                buf.extend_from_slice(key.as_bytes());
                buf.extend_from_slice(b": ");
                buf.extend_from_slice(val.as_bytes());
                buf.extend_from_slice(CRLF);
            }
        }
        buf.extend_from_slice(CRLF);
    }

    pub(crate) fn encoded_len(&self) -> usize {
        let mut n = HDR_PREFIX.len() + 4;
        for (key, vals) in &self.entries {
            for val in vals {
                n += key.len() + 2 + val.len() + 2;
            }
        }
        n
    }

    /// Parses a full headers block, returning the map and any inline status.
    pub fn parse(buf: &[u8]) -> Result<(HeaderMap, Option<HeaderStatus>)> {
        let text = std::str::from_utf8(buf)
            .map_err(|_| Error::Protocol("headers are not valid utf-8".to_string()))?;
        let mut lines = text.split("\r\n");
        let first = lines
            .next()
            .ok_or_else(|| Error::Protocol("empty headers block".to_string()))?;
        if !first.starts_with(HDR_PREFIX) {
            return Err(Error::Protocol(format!("bad headers prefix: {first}")));
        }
        let status = parse_status(first[HDR_PREFIX.len()..].trim());

        let mut map = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Protocol(format!("bad header line: {line}")))?;
            map.append(key.trim(), value.trim());
        }
        Ok((map, status))
    }
}

fn parse_status(rest: &str) -> Option<HeaderStatus> {
    if rest.is_empty() {
        return None;
    }
    let (code_str, desc) = match rest.split_once(' ') {
        Some((code, desc)) => (code, Some(desc.trim().to_string())),
        None => (rest, None),
    };
    let code = code_str.parse::<u16>().ok()?;
    Some(HeaderStatus {
        code,
        description: desc.filter(|d| !d.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_append() {
        let mut h = HeaderMap::new();
        h.append("My-Key1", "value1");
        h.append("My-Key2", "value2");
        h.append("My-Key1", "value3");

        assert_eq!(h.get("My-Key1"), Some("value1"));
        assert_eq!(h.values("My-Key1"), &["value1", "value3"]);
        assert_eq!(h.get("My-Key2"), Some("value2"));
        assert_eq!(h.get("missing"), None);
        assert_eq!(h.len(), 3);

        h.insert("My-Key1", "only");
        assert_eq!(h.values("My-Key1"), &["only"]);
    }

    #[test]
    fn round_trip_preserves_duplicates() {
        let mut h = HeaderMap::new();
        h.append("A", "1");
        h.append("B", "x");
        h.append("A", "2");

        let mut buf = Vec::new();
        h.encode_to(&mut buf);
        assert_eq!(buf.len(), h.encoded_len());

        let (parsed, status) = HeaderMap::parse(&buf).unwrap();
        assert!(status.is_none());
        assert_eq!(parsed.values("A"), &["1", "2"]);
        assert_eq!(parsed.values("B"), &["x"]);
    }

    #[test]
    fn status_line_with_description() {
        let buf = b"NATS/1.0 404 No Messages\r\n\r\n";
        let (map, status) = HeaderMap::parse(buf).unwrap();
        assert!(map.is_empty());
        let status = status.unwrap();
        assert_eq!(status.code, STATUS_NO_MESSAGES);
        assert_eq!(status.description.as_deref(), Some("No Messages"));
    }

    #[test]
    fn status_line_bare_code() {
        let (_, status) = HeaderMap::parse(b"NATS/1.0 408\r\n\r\n").unwrap();
        assert_eq!(status.unwrap().code, STATUS_REQUEST_TIMEOUT);
    }

    #[test]
    fn status_with_headers_after() {
        let buf = b"NATS/1.0 100 Idle Heartbeat\r\nNats-Last-Consumer: 5\r\n\r\n";
        let (map, status) = HeaderMap::parse(buf).unwrap();
        assert_eq!(status.unwrap().code, STATUS_CTRL);
        assert_eq!(map.get("Nats-Last-Consumer"), Some("5"));
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(HeaderMap::parse(b"NATS/1.0\r\nno-colon-here\r\n\r\n").is_err());
        assert!(HeaderMap::parse(b"HTTP/1.1\r\n\r\n").is_err());
    }
}
