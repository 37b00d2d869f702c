//! Outbound frame encoding and handshake payloads.
//!
//! The protocol is line-based ASCII, `\r\n` terminated. All append
//! functions write complete frames into the connection's outbound buffer;
//! the flusher owns getting them onto the socket.

use serde::{Deserialize, Serialize};

use crate::headers::{HeaderMap, CRLF};

pub(crate) const PING_FRAME: &[u8] = b"PING\r\n";
pub(crate) const PONG_FRAME: &[u8] = b"PONG\r\n";

/// Server `INFO` payload. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub proto: i32,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub max_payload: usize,
    #[serde(default)]
    pub client_id: u64,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub headers: bool,
    /// Cluster-advertised URLs, merged into the server pool.
    #[serde(default)]
    pub connect_urls: Vec<String>,
    /// Lame-duck mode notification.
    #[serde(default)]
    pub ldm: bool,
}

/// Client `CONNECT` payload.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ConnectRequest {
    pub verbose: bool,
    pub pedantic: bool,
    pub ssl_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    pub no_responders: bool,
    pub headers: bool,
    pub echo: bool,
}

impl Default for ConnectRequest {
    fn default() -> Self {
        ConnectRequest {
            verbose: false,
            pedantic: false,
            ssl_required: false,
            name: None,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
            user: None,
            pass: None,
            auth_token: None,
            jwt: None,
            sig: None,
            no_responders: true,
            headers: true,
            echo: true,
        }
    }
}

pub(crate) fn append_connect(buf: &mut Vec<u8>, req: &ConnectRequest) {
    buf.extend_from_slice(b"CONNECT ");
    // ConnectRequest has no non-serializable fields; this cannot fail.
    serde_json::to_writer(&mut *buf, req).expect("connect serialization");
    buf.extend_from_slice(CRLF);
}

pub(crate) fn append_pub(buf: &mut Vec<u8>, subject: &str, reply: Option<&str>, payload: &[u8]) {
    buf.extend_from_slice(b"PUB ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(reply) = reply {
        buf.push(b' ');
        buf.extend_from_slice(reply.as_bytes());
    }
    buf.push(b' ');
    buf.extend_from_slice(itoa(payload.len()).as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

pub(crate) fn append_hpub(
    buf: &mut Vec<u8>,
    subject: &str,
    reply: Option<&str>,
    headers: &HeaderMap,
    payload: &[u8],
) {
    let hdr_len = headers.encoded_len();
    let total = hdr_len + payload.len();
    buf.extend_from_slice(b"HPUB ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(reply) = reply {
        buf.push(b' ');
        buf.extend_from_slice(reply.as_bytes());
    }
    buf.push(b' ');
    buf.extend_from_slice(itoa(hdr_len).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(itoa(total).as_bytes());
    buf.extend_from_slice(CRLF);
    headers.encode_to(buf);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

pub(crate) fn append_sub(buf: &mut Vec<u8>, subject: &str, queue: Option<&str>, sid: u64) {
    buf.extend_from_slice(b"SUB ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(queue) = queue {
        buf.push(b' ');
        buf.extend_from_slice(queue.as_bytes());
    }
    buf.push(b' ');
    buf.extend_from_slice(itoa(sid as usize).as_bytes());
    buf.extend_from_slice(CRLF);
}

pub(crate) fn append_unsub(buf: &mut Vec<u8>, sid: u64, max: Option<u64>) {
    buf.extend_from_slice(b"UNSUB ");
    buf.extend_from_slice(itoa(sid as usize).as_bytes());
    if let Some(max) = max {
        buf.push(b' ');
        buf.extend_from_slice(itoa(max as usize).as_bytes());
    }
    buf.extend_from_slice(CRLF);
}

fn itoa(n: usize) -> String {
    n.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pub_frame_shape() {
        let mut buf = Vec::new();
        append_pub(&mut buf, "foo", None, b"hi");
        assert_eq!(buf, b"PUB foo 2\r\nhi\r\n");

        buf.clear();
        append_pub(&mut buf, "foo", Some("bar"), b"");
        assert_eq!(buf, b"PUB foo bar 0\r\n\r\n");
    }

    #[test]
    fn hpub_frame_shape() {
        let mut headers = HeaderMap::new();
        headers.append("a", "b");
        let mut buf = Vec::new();
        append_hpub(&mut buf, "x", None, &headers, b"body");
        // NATS/1.0\r\na: b\r\n\r\n == 18 bytes of headers
        assert_eq!(buf, b"HPUB x 18 22\r\nNATS/1.0\r\na: b\r\n\r\nbody\r\n");
    }

    #[test]
    fn sub_unsub_frames() {
        let mut buf = Vec::new();
        append_sub(&mut buf, "foo.*", Some("workers"), 4);
        append_unsub(&mut buf, 4, Some(1));
        append_unsub(&mut buf, 5, None);
        assert_eq!(buf, b"SUB foo.* workers 4\r\nUNSUB 4 1\r\nUNSUB 5\r\n");
    }

    #[test]
    fn connect_line_is_json() {
        let mut buf = Vec::new();
        let mut req = ConnectRequest::default();
        req.user = Some("bob".to_string());
        append_connect(&mut buf, &req);
        assert!(buf.starts_with(b"CONNECT {"));
        assert!(buf.ends_with(b"}\r\n"));
        let json: serde_json::Value =
            serde_json::from_slice(&buf[b"CONNECT ".len()..buf.len() - 2]).unwrap();
        assert_eq!(json["user"], "bob");
        assert_eq!(json["protocol"], 1);
        // Unset credentials stay off the wire entirely.
        assert!(json.get("pass").is_none());
    }

    #[test]
    fn server_info_ignores_unknown_fields() {
        let info: ServerInfo = serde_json::from_str(
            r#"{"server_id":"S","max_payload":1048576,"connect_urls":["10.0.0.1:4222"],"nonce":"x","extra":1}"#,
        )
        .unwrap();
        assert_eq!(info.server_id, "S");
        assert_eq!(info.max_payload, 1048576);
        assert_eq!(info.connect_urls, vec!["10.0.0.1:4222"]);
    }
}
