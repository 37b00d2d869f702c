//! Message record.
//!
//! A `Message` is immutable once parsed off the wire. Inbound messages
//! carry a back-reference to the subscription that received them so that
//! reply and acknowledgement helpers can reach the connection.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::headers::{HeaderMap, HeaderStatus};
use crate::subscription::SubState;

pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Vec<u8>,
    /// Inline status parsed from the headers block, if any.
    pub(crate) status: Option<HeaderStatus>,
    /// Owning subscription, set when the message is enqueued.
    pub(crate) sub: Option<Arc<SubState>>,
    /// Set once a stream acknowledgement has been sent for this message.
    pub(crate) acked: AtomicBool,
}

impl Message {
    /// Builds an outbound message. Inbound messages are built by the
    /// connection from parser events.
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Message {
            subject: subject.into(),
            reply: None,
            headers: None,
            payload: payload.into(),
            status: None,
            sub: None,
            acked: AtomicBool::new(false),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub(crate) fn inbound(
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        status: Option<HeaderStatus>,
        payload: Vec<u8>,
    ) -> Self {
        Message {
            subject,
            reply,
            headers,
            payload,
            status,
            sub: None,
            acked: AtomicBool::new(false),
        }
    }

    /// Inline status code, if the message carried one (`NATS/1.0 <code>`).
    pub fn status(&self) -> Option<u16> {
        self.status.as_ref().map(|s| s.code)
    }

    pub fn status_description(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.description.as_deref())
    }

    /// Bytes this message accounts for against subscription pending limits.
    pub(crate) fn wire_len(&self) -> usize {
        let hdr = self.headers.as_ref().map_or(0, HeaderMap::encoded_len);
        hdr + self.payload.len()
    }

    /// Publishes `payload` on this message's reply subject.
    pub fn respond(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        let reply = self.reply.as_deref().ok_or(Error::InvalidArg("message has no reply subject"))?;
        let conn = self.connection()?;
        conn.publish(reply, payload.as_ref())
    }

    pub(crate) fn connection(&self) -> Result<crate::connection::Connection> {
        let sub = self.sub.as_ref().ok_or(Error::InvalidSubscription)?;
        sub.connection().ok_or(Error::ConnectionClosed)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("headers", &self.headers)
            .field("payload_len", &self.payload.len())
            .field("status", &self.status)
            .finish()
    }
}
