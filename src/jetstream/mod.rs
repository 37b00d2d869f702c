//! Persistent-stream (JetStream-style) client layer.
//!
//! A [`JetStream`] context is a per-connection handle carrying the API
//! prefix, the asynchronous-publish state, and one shared wildcard reply
//! subscription through which all publish acknowledgements return.
//!
//! Async publish bookkeeping invariant: every in-flight publish is in the
//! reply map, and additionally in the deadline list iff it was given a
//! per-message wait; it leaves both on acknowledgement or timeout.

pub mod admin;
pub mod sub;
pub mod types;

pub use admin::DirectGetRequest;
pub use sub::{
    AckMetadata, FetchCounters, FetchOptions, FetchOutcome, JsSubOptions, PullSubscription,
    PushSubscription,
};
pub use types::{
    AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, DiscardPolicy, PubAck,
    ReplayPolicy, RetentionPolicy, SequencePair, StorageType, StreamConfig, StreamInfo,
    StreamState,
};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::debug;

use crate::connection::{ConnCore, Connection};
use crate::error::{Error, Result};
use crate::headers::{HeaderMap, STATUS_NO_RESPONDERS};
use crate::inbox::{self, INBOX_PREFIX, REPLY_TOKEN_LEN};
use crate::message::Message;
use crate::subscription::Subscription;
use crate::timer::Timer;
use types::decode_api_response;

pub(crate) const DEFAULT_API_PREFIX: &str = "$JS.API.";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STALL_WAIT: Duration = Duration::from_millis(200);

/// Message-ID / expectation headers understood by the server.
pub const HDR_MSG_ID: &str = "Nats-Msg-Id";
pub const HDR_EXPECTED_STREAM: &str = "Nats-Expected-Stream";
pub const HDR_EXPECTED_LAST_SEQ: &str = "Nats-Expected-Last-Sequence";
pub const HDR_EXPECTED_LAST_MSG_ID: &str = "Nats-Expected-Last-Msg-Id";

/// A failed asynchronous publish, carrying the original message so the
/// caller may resend it.
#[derive(Debug)]
pub struct PublishAsyncError {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Option<HeaderMap>,
    pub error: Error,
}

pub type AckHandler =
    Arc<dyn Fn(std::result::Result<PubAck, PublishAsyncError>) + Send + Sync>;
pub type PublishErrorHandler = Arc<dyn Fn(PublishAsyncError) + Send + Sync>;

/// Context options.
#[derive(Clone)]
pub struct JetStreamOptions {
    pub(crate) prefix: String,
    pub(crate) domain: Option<String>,
    pub(crate) request_timeout: Duration,
    /// Max in-flight async publishes; 0 means unlimited.
    pub(crate) publish_async_max_pending: usize,
    /// How long a stalled async publish waits for capacity.
    pub(crate) stall_wait: Duration,
    pub(crate) ack_handler: Option<AckHandler>,
    pub(crate) error_handler: Option<PublishErrorHandler>,
}

impl Default for JetStreamOptions {
    fn default() -> Self {
        JetStreamOptions {
            prefix: DEFAULT_API_PREFIX.to_string(),
            domain: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            publish_async_max_pending: 0,
            stall_wait: DEFAULT_STALL_WAIT,
            ack_handler: None,
            error_handler: None,
        }
    }
}

impl JetStreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Custom API prefix (defaults to `$JS.API.`).
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('.') {
            prefix.push('.');
        }
        self.prefix = prefix;
        self
    }

    /// Addresses the API of a specific domain (`$JS.<domain>.API.`).
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn publish_async_max_pending(mut self, max: usize) -> Self {
        self.publish_async_max_pending = max;
        self
    }

    pub fn stall_wait(mut self, wait: Duration) -> Self {
        self.stall_wait = wait;
        self
    }

    /// Called with the outcome of every async publish.
    pub fn ack_handler(
        mut self,
        handler: impl Fn(std::result::Result<PubAck, PublishAsyncError>) + Send + Sync + 'static,
    ) -> Self {
        self.ack_handler = Some(Arc::new(handler));
        self
    }

    /// Called only for failed async publishes. Ignored when an ack
    /// handler is configured.
    pub fn publish_error_handler(
        mut self,
        handler: impl Fn(PublishAsyncError) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub msg_id: Option<String>,
    pub expected_stream: Option<String>,
    pub expected_last_seq: Option<u64>,
    pub expected_last_msg_id: Option<String>,
    /// Per-message acknowledgement deadline for async publishes.
    pub max_wait: Option<Duration>,
}

struct PendingPub {
    subject: String,
    payload: Vec<u8>,
    headers: Option<HeaderMap>,
}

struct DeadlineEntry {
    expires: Instant,
    token: String,
}

pub(crate) struct AsyncPubState {
    reply_prefix: String,
    reply_sub: Option<Subscription>,
    pending: HashMap<String, PendingPub>,
    /// Sorted by expiry; holds only publishes with a per-message wait.
    deadlines: VecDeque<DeadlineEntry>,
    timer: Option<Timer>,
}

pub(crate) struct JsCtx {
    pub(crate) conn: Weak<ConnCore>,
    pub(crate) opts: JetStreamOptions,
    /// Resolved API prefix including the trailing dot.
    pub(crate) prefix: String,
    pub(crate) pub_state: Mutex<AsyncPubState>,
    stall_cv: Condvar,
    done_cv: Condvar,
}

/// Handle to the persistent-stream layer of a connection.
#[derive(Clone)]
pub struct JetStream {
    pub(crate) ctx: Arc<JsCtx>,
}

impl Connection {
    /// Persistent-stream context with default options.
    pub fn jetstream(&self) -> JetStream {
        self.jetstream_with_options(JetStreamOptions::default())
    }

    pub fn jetstream_with_options(&self, opts: JetStreamOptions) -> JetStream {
        let prefix = match &opts.domain {
            Some(domain) => format!("$JS.{domain}.API."),
            None => opts.prefix.clone(),
        };
        let reply_prefix = format!(
            "{}{}.",
            INBOX_PREFIX,
            inbox::token(REPLY_TOKEN_LEN)
        );
        JetStream {
            ctx: Arc::new(JsCtx {
                conn: Arc::downgrade(&self.core),
                opts,
                prefix,
                pub_state: Mutex::new(AsyncPubState {
                    reply_prefix,
                    reply_sub: None,
                    pending: HashMap::new(),
                    deadlines: VecDeque::new(),
                    timer: None,
                }),
                stall_cv: Condvar::new(),
                done_cv: Condvar::new(),
            }),
        }
    }
}

impl JetStream {
    pub(crate) fn connection(&self) -> Result<Connection> {
        self.ctx.connection()
    }

    /// Publishes and waits for the server acknowledgement.
    pub fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) -> Result<PubAck> {
        self.publish_with_options(subject, payload, &PublishOptions::default())
    }

    pub fn publish_with_options(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        opts: &PublishOptions,
    ) -> Result<PubAck> {
        let conn = self.connection()?;
        let headers = publish_headers(opts);
        let timeout = self.ctx.opts.request_timeout;
        let msg = match &headers {
            Some(h) => conn.request_with_headers(subject, h, payload.as_ref(), timeout),
            None => conn.request(subject, payload.as_ref(), timeout),
        };
        let msg = match msg {
            Err(Error::NoResponders) => return Err(Error::NoResponders),
            other => other?,
        };
        decode_api_response::<PubAck>(&msg.payload)
    }

    /// Fire-and-track publish. The acknowledgement (or failure) is
    /// reported through the context's ack/error handlers.
    pub fn publish_async(&self, subject: &str, payload: impl AsRef<[u8]>) -> Result<()> {
        self.publish_async_with_options(subject, payload, &PublishOptions::default())
    }

    pub fn publish_async_with_options(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        opts: &PublishOptions,
    ) -> Result<()> {
        let conn = self.connection()?;
        let payload = payload.as_ref();
        let headers = publish_headers(opts);

        let ctx = &self.ctx;
        let mut st = ctx.pub_state.lock().unwrap();
        self.ensure_reply_sub(&conn, &mut st)?;

        // Stall gate.
        let max = ctx.opts.publish_async_max_pending;
        if max > 0 {
            let deadline = Instant::now() + ctx.opts.stall_wait;
            while st.pending.len() >= max {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout);
                }
                let (guard, _) = ctx.stall_cv.wait_timeout(st, deadline - now).unwrap();
                st = guard;
            }
        }

        let token = inbox::next_nuid();
        let reply = format!("{}{}", st.reply_prefix, token);
        st.pending.insert(
            token.clone(),
            PendingPub {
                subject: subject.to_string(),
                payload: payload.to_vec(),
                headers: headers.clone(),
            },
        );
        if let Some(max_wait) = opts.max_wait {
            let expires = Instant::now() + max_wait;
            insert_deadline(&mut st.deadlines, DeadlineEntry {
                expires,
                token: token.clone(),
            });
            self.arm_deadline_timer(&mut st);
        }
        drop(st);

        let res = conn.publish_parts(subject, Some(&reply), headers.as_ref(), payload);
        if let Err(err) = res {
            let mut st = ctx.pub_state.lock().unwrap();
            st.pending.remove(&token);
            st.deadlines.retain(|d| d.token != token);
            self.arm_deadline_timer(&mut st);
            drop(st);
            return Err(err);
        }
        Ok(())
    }

    /// Number of async publishes awaiting acknowledgement.
    pub fn publish_async_pending(&self) -> usize {
        self.ctx.pub_state.lock().unwrap().pending.len()
    }

    /// Blocks until every in-flight async publish has been acknowledged
    /// or failed, up to `timeout`.
    pub fn publish_async_complete(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut st = self.ctx.pub_state.lock().unwrap();
        loop {
            if st.pending.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, _) = self
                .ctx
                .done_cv
                .wait_timeout(st, deadline - now)
                .unwrap();
            st = guard;
        }
    }

    fn ensure_reply_sub(
        &self,
        conn: &Connection,
        st: &mut AsyncPubState,
    ) -> Result<()> {
        if st.reply_sub.is_some() {
            return Ok(());
        }
        let wildcard = format!("{}*", st.reply_prefix);
        let ctx = Arc::downgrade(&self.ctx);
        let sub = conn.subscribe_handler(&wildcard, move |msg| {
            if let Some(ctx) = ctx.upgrade() {
                JetStream { ctx }.handle_ack_reply(msg);
            }
        })?;
        st.reply_sub = Some(sub);
        Ok(())
    }

    fn handle_ack_reply(&self, msg: Message) {
        let ctx = &self.ctx;
        let (entry, token) = {
            let mut st = ctx.pub_state.lock().unwrap();
            let token = match msg.subject.strip_prefix(&st.reply_prefix) {
                Some(token) => token.to_string(),
                None => return,
            };
            let entry = st.pending.remove(&token);
            if entry.is_some() {
                st.deadlines.retain(|d| d.token != token);
                self.arm_deadline_timer(&mut st);
            }
            (entry, token)
        };
        let Some(entry) = entry else {
            debug!("ack for unknown publish token {token}");
            return;
        };

        let outcome = if msg.status() == Some(STATUS_NO_RESPONDERS) {
            Err(Error::NoResponders)
        } else {
            decode_api_response::<PubAck>(&msg.payload)
        };
        self.finish_publish(entry, outcome);
    }

    /// Deadline timer fired: expire everything past due.
    fn expire_deadlines(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut st = self.ctx.pub_state.lock().unwrap();
            while let Some(front) = st.deadlines.front() {
                if front.expires > now {
                    break;
                }
                let entry = st.deadlines.pop_front().unwrap();
                if let Some(pending) = st.pending.remove(&entry.token) {
                    expired.push(pending);
                }
            }
            self.arm_deadline_timer(&mut st);
        }
        for pending in expired {
            self.finish_publish(pending, Err(Error::Timeout));
        }
    }

    fn finish_publish(&self, entry: PendingPub, outcome: Result<PubAck>) {
        let ctx = &self.ctx;
        {
            let st = ctx.pub_state.lock().unwrap();
            if st.pending.is_empty() {
                ctx.done_cv.notify_all();
            }
        }
        ctx.stall_cv.notify_all();

        match outcome {
            Ok(ack) => {
                if let Some(handler) = &ctx.opts.ack_handler {
                    handler(Ok(ack));
                }
            }
            Err(error) => {
                let failed = PublishAsyncError {
                    subject: entry.subject,
                    payload: entry.payload,
                    headers: entry.headers,
                    error,
                };
                if let Some(handler) = &ctx.opts.ack_handler {
                    handler(Err(failed));
                } else if let Some(handler) = &ctx.opts.error_handler {
                    handler(failed);
                } else {
                    debug!("async publish to {} failed: {}", failed.subject, failed.error);
                }
            }
        }
    }

    /// Re-arms the single deadline timer for the nearest expiry, or stops
    /// it when the list is empty.
    fn arm_deadline_timer(&self, st: &mut AsyncPubState) {
        match st.deadlines.front() {
            Some(front) => {
                let delay = front.expires.saturating_duration_since(Instant::now());
                match &st.timer {
                    Some(timer) => timer.reset(delay),
                    None => {
                        let ctx = Arc::downgrade(&self.ctx);
                        let timer = Timer::start(delay, None, move || {
                            if let Some(ctx) = ctx.upgrade() {
                                JetStream { ctx }.expire_deadlines();
                            }
                        });
                        st.timer = Some(timer);
                    }
                }
            }
            None => {
                if let Some(timer) = st.timer.take() {
                    timer.stop();
                }
            }
        }
    }
}

impl JsCtx {
    pub(crate) fn connection(&self) -> Result<Connection> {
        self.conn
            .upgrade()
            .map(Connection::from_core)
            .ok_or(Error::ConnectionClosed)
    }

    /// Request against the management API; decodes the response envelope.
    pub(crate) fn api_request<T: serde::de::DeserializeOwned>(
        &self,
        suffix: &str,
        payload: Vec<u8>,
    ) -> Result<T> {
        let conn = self.connection()?;
        let subject = format!("{}{}", self.prefix, suffix);
        let msg = conn.request(&subject, payload, self.opts.request_timeout)?;
        decode_api_response::<T>(&msg.payload)
    }
}

/// Ordered insert keeping the deadline list sorted by expiry; O(1) at
/// either end, linear otherwise.
fn insert_deadline(deadlines: &mut VecDeque<DeadlineEntry>, entry: DeadlineEntry) {
    if deadlines
        .back()
        .map(|b| b.expires <= entry.expires)
        .unwrap_or(true)
    {
        deadlines.push_back(entry);
        return;
    }
    if deadlines
        .front()
        .map(|f| f.expires > entry.expires)
        .unwrap_or(false)
    {
        deadlines.push_front(entry);
        return;
    }
    let pos = deadlines
        .iter()
        .position(|d| d.expires > entry.expires)
        .unwrap_or(deadlines.len());
    deadlines.insert(pos, entry);
}

fn publish_headers(opts: &PublishOptions) -> Option<HeaderMap> {
    if opts.msg_id.is_none()
        && opts.expected_stream.is_none()
        && opts.expected_last_seq.is_none()
        && opts.expected_last_msg_id.is_none()
    {
        return None;
    }
    let mut headers = HeaderMap::new();
    if let Some(id) = &opts.msg_id {
        headers.insert(HDR_MSG_ID, id.clone());
    }
    if let Some(stream) = &opts.expected_stream {
        headers.insert(HDR_EXPECTED_STREAM, stream.clone());
    }
    if let Some(seq) = opts.expected_last_seq {
        headers.insert(HDR_EXPECTED_LAST_SEQ, seq.to_string());
    }
    if let Some(id) = &opts.expected_last_msg_id {
        headers.insert(HDR_EXPECTED_LAST_MSG_ID, id.clone());
    }
    Some(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_list_stays_sorted() {
        let mut list = VecDeque::new();
        let base = Instant::now();
        for offset in [50u64, 10, 30, 70, 20] {
            insert_deadline(
                &mut list,
                DeadlineEntry {
                    expires: base + Duration::from_millis(offset),
                    token: offset.to_string(),
                },
            );
        }
        let order: Vec<&str> = list.iter().map(|d| d.token.as_str()).collect();
        assert_eq!(order, ["10", "20", "30", "50", "70"]);
    }

    #[test]
    fn publish_headers_only_when_needed() {
        assert!(publish_headers(&PublishOptions::default()).is_none());
        let opts = PublishOptions {
            msg_id: Some("m-1".to_string()),
            expected_last_seq: Some(9),
            ..Default::default()
        };
        let headers = publish_headers(&opts).unwrap();
        assert_eq!(headers.get(HDR_MSG_ID), Some("m-1"));
        assert_eq!(headers.get(HDR_EXPECTED_LAST_SEQ), Some("9"));
    }
}
