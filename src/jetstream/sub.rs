//! Persistent-stream subscriptions.
//!
//! Push consumers deliver to an inbox subject with optional flow control
//! and idle heartbeats. Pull consumers are fetched in bounded batches
//! against a per-subscription wildcard inbox, synchronously or with a
//! keep-ahead background request loop. Ordered consumers are push
//! consumers that detect delivery-sequence gaps and recreate themselves
//! server-side from the last observed stream sequence.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::headers::{
    STATUS_CONFLICT, STATUS_CTRL, STATUS_NO_MESSAGES, STATUS_NO_RESPONDERS,
    STATUS_REQUEST_TIMEOUT,
};
use crate::inbox::{self, INBOX_PREFIX};
use crate::message::Message;
use crate::options::SubscribeOptions;
use crate::subscription::{SubInner, SubState, Subscription};
use crate::timer::Timer;

use super::types::{AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, NextRequest};
use super::{JetStream, JsCtx};

const ACK_ACK: &[u8] = b"+ACK";
const ACK_NAK: &[u8] = b"-NAK";
const ACK_IN_PROGRESS: &[u8] = b"+WPI";
const ACK_TERM: &[u8] = b"+TERM";

const ACK_PREFIX: &str = "$JS.ACK.";
const HDR_CONSUMER_STALLED: &str = "Nats-Consumer-Stalled";

const ORDERED_HEARTBEAT: Duration = Duration::from_secs(5);
/// Consecutive heartbeat misses before the subscription is declared dead.
const MAX_HB_MISSES: u32 = 2;

// ---------------------------------------------------------------------------
// Ack protocol
// ---------------------------------------------------------------------------

/// Metadata parsed from a stream message's ack reply subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMetadata {
    pub domain: Option<String>,
    pub stream: String,
    pub consumer: String,
    pub num_delivered: u64,
    pub stream_seq: u64,
    pub consumer_seq: u64,
    pub timestamp_ns: i64,
    pub num_pending: u64,
}

/// Parses both ack-subject forms:
/// `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>`
/// and the v2 form with `<domain>.<account-hash>.` prefixed after `ACK`.
pub(crate) fn parse_ack_reply(reply: &str) -> Result<AckMetadata> {
    let bad = || Error::Protocol(format!("bad ack subject: {reply}"));
    if !reply.starts_with(ACK_PREFIX) {
        return Err(bad());
    }
    let toks: Vec<&str> = reply.split('.').collect();
    let (domain, base) = match toks.len() {
        9 => (None, 2),
        n if n >= 11 => {
            let domain = match toks[2] {
                "_" => None,
                d => Some(d.to_string()),
            };
            (domain, 4)
        }
        _ => return Err(bad()),
    };
    let num = |s: &str| s.parse::<u64>().map_err(|_| bad());
    Ok(AckMetadata {
        domain,
        stream: toks[base].to_string(),
        consumer: toks[base + 1].to_string(),
        num_delivered: num(toks[base + 2])?,
        stream_seq: num(toks[base + 3])?,
        consumer_seq: num(toks[base + 4])?,
        timestamp_ns: toks[base + 5].parse::<i64>().map_err(|_| bad())?,
        num_pending: num(toks[base + 6])?,
    })
}

impl Message {
    fn ack_reply(&self) -> Result<&str> {
        match self.reply.as_deref() {
            Some(reply) if reply.starts_with(ACK_PREFIX) => Ok(reply),
            _ => Err(Error::InvalidArg("not a stream message")),
        }
    }

    fn send_ack(&self, body: &[u8], latch: bool) -> Result<()> {
        let reply = self.ack_reply()?.to_string();
        if latch && self.acked.swap(true, Ordering::AcqRel) {
            // Already acknowledged; acking twice is a no-op.
            return Ok(());
        }
        let conn = self.connection()?;
        conn.publish(&reply, body)
    }

    /// Acknowledges processing. Idempotent on the client.
    pub fn ack(&self) -> Result<()> {
        self.send_ack(ACK_ACK, true)
    }

    /// Negative acknowledgement: asks for redelivery.
    pub fn nak(&self) -> Result<()> {
        self.send_ack(ACK_NAK, true)
    }

    /// Negative acknowledgement with a redelivery delay.
    pub fn nak_with_delay(&self, delay: Duration) -> Result<()> {
        let body = format!("-NAK {{\"delay\": {}}}", delay.as_nanos());
        self.send_ack(body.as_bytes(), true)
    }

    /// Resets the server's ack-wait timer without acknowledging.
    pub fn in_progress(&self) -> Result<()> {
        self.send_ack(ACK_IN_PROGRESS, false)
    }

    /// Terminates delivery: the server stops redelivering this message.
    pub fn term(&self) -> Result<()> {
        self.send_ack(ACK_TERM, true)
    }

    /// Stream delivery metadata from the ack reply subject.
    pub fn metadata(&self) -> Result<AckMetadata> {
        parse_ack_reply(self.ack_reply()?)
    }
}

// ---------------------------------------------------------------------------
// Subscription metadata
// ---------------------------------------------------------------------------

/// Fetch outcome reported to the completion callback of an async fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The requested number of messages was delivered.
    Complete,
    /// A server-side limit (max bytes) ended the fetch early.
    LimitReached,
    /// The fetch expired before completing.
    Timeout,
    /// Idle heartbeats stopped arriving.
    MissedHeartbeat,
    /// The connection closed mid-fetch.
    ConnectionClosed,
}

/// Counters handed to a custom next-request handler.
#[derive(Debug, Clone, Copy)]
pub struct FetchCounters {
    pub requested: u64,
    pub delivered: u64,
    pub received_bytes: u64,
}

/// Decides the next pull request (batch, max bytes) given the current
/// counters; `None` stops requesting.
pub type NextHandler =
    Arc<dyn Fn(&FetchCounters) -> Option<(usize, usize)> + Send + Sync>;

/// Options for a pull fetch.
#[derive(Clone)]
pub struct FetchOptions {
    pub(crate) batch: usize,
    pub(crate) max_bytes: usize,
    pub(crate) timeout: Duration,
    pub(crate) idle_heartbeat: Option<Duration>,
    pub(crate) no_wait: bool,
    /// Total messages an async fetch delivers; 0 means unlimited.
    pub(crate) max_messages: usize,
    /// Keep this many requested-but-undelivered messages outstanding.
    pub(crate) keep_ahead: usize,
    pub(crate) next_handler: Option<NextHandler>,
}

impl FetchOptions {
    pub fn new(batch: usize) -> Self {
        FetchOptions {
            batch,
            max_bytes: 0,
            timeout: Duration::from_secs(5),
            idle_heartbeat: None,
            no_wait: false,
            max_messages: 0,
            keep_ahead: 0,
            next_handler: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes;
        self
    }

    pub fn idle_heartbeat(mut self, interval: Duration) -> Self {
        self.idle_heartbeat = Some(interval);
        self
    }

    /// Ask only for immediately available messages.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub fn max_messages(mut self, total: usize) -> Self {
        self.max_messages = total;
        self
    }

    pub fn keep_ahead(mut self, ahead: usize) -> Self {
        self.keep_ahead = ahead;
        self
    }

    pub fn next_handler(
        mut self,
        handler: impl Fn(&FetchCounters) -> Option<(usize, usize)> + Send + Sync + 'static,
    ) -> Self {
        self.next_handler = Some(Arc::new(handler));
        self
    }
}

pub(crate) type FetchDoneCallback = Box<dyn FnOnce(FetchOutcome) + Send + 'static>;

/// State of an in-flight async fetch.
pub(crate) struct FetchState {
    opts: FetchOptions,
    requested: u64,
    delivered: u64,
    received_bytes: u64,
    reply: String,
    /// Terminal status stored by the dispatching thread.
    status: Option<FetchOutcome>,
    active: bool,
    hb_timer: Option<Timer>,
    expiry_timer: Option<Timer>,
    done: Option<FetchDoneCallback>,
}

/// Per-subscription persistent-stream metadata.
pub(crate) struct JsSubMeta {
    pub(crate) ctx: Arc<JsCtx>,
    pub(crate) stream: String,
    pub(crate) consumer: String,
    /// Next-message request subject for pull consumers.
    pub(crate) nms: String,
    pub(crate) pull: bool,
    pub(crate) ordered: bool,
    pub(crate) ack_none: bool,
    /// Base consumer config, kept for ordered recreation.
    pub(crate) ccfg: ConsumerConfig,
    pub(crate) fc_reply: Option<String>,
    /// Deliver-count threshold at which the flow-control reply goes out.
    pub(crate) fc_delivered: u64,
    /// Count of data messages that arrived on this subscription.
    pub(crate) inbound_seq: u64,
    /// Last observed stream / delivery sequences (ordered consumers).
    pub(crate) sseq: u64,
    pub(crate) dseq: u64,
    pub(crate) active: bool,
    pub(crate) hb_misses: u32,
    pub(crate) hb_timer: Option<Timer>,
    pub(crate) recreating: bool,
    /// Wildcard inbox base for pull fetches (without the `.*`).
    pub(crate) pull_inbox: String,
    pub(crate) fetch_id: u64,
    pub(crate) in_fetch: bool,
    pub(crate) fetch: Option<FetchState>,
}

impl JsSubMeta {
    fn new(ctx: Arc<JsCtx>, stream: String, consumer: String) -> Box<JsSubMeta> {
        Box::new(JsSubMeta {
            ctx,
            stream,
            consumer,
            nms: String::new(),
            pull: false,
            ordered: false,
            ack_none: false,
            ccfg: ConsumerConfig::default(),
            fc_reply: None,
            fc_delivered: 0,
            inbound_seq: 0,
            sseq: 0,
            dseq: 0,
            active: true,
            hb_misses: 0,
            hb_timer: None,
            recreating: false,
            pull_inbox: String::new(),
            fetch_id: 0,
            in_fetch: false,
            fetch: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Delivery hooks (called from the reader and dispatcher threads)
// ---------------------------------------------------------------------------

/// What the reader should do with an arriving message, decided under the
/// subscription lock before it is queued.
pub(crate) enum EnqueueAction {
    /// Enqueue normally.
    Deliver,
    /// Consumed by the stream layer; do not queue.
    Consumed,
    /// Consumed; publish an empty message to this subject once the lock
    /// is released.
    Reply(String),
    /// Consumed; an ordered consumer saw a sequence gap.
    Recreate,
}

pub(crate) fn pre_enqueue(inner: &mut SubInner, msg: &mut Message) -> EnqueueAction {
    let Some(js) = inner.js.as_deref_mut() else {
        return EnqueueAction::Deliver;
    };
    if let Some(code) = msg.status() {
        if js.pull {
            // Pull statuses travel through the queue to the fetch logic.
            return EnqueueAction::Deliver;
        }
        if code == STATUS_CTRL {
            js.active = true;
            js.hb_misses = 0;
            if let Some(reply) = &msg.reply {
                // Flow-control request: defer the reply until delivery
                // catches up with everything that arrived before it.
                js.fc_reply = Some(reply.clone());
                js.fc_delivered = js.inbound_seq;
                return EnqueueAction::Consumed;
            }
            // Idle heartbeat; it may carry a stalled flow-control hint.
            if let Some(headers) = &msg.headers {
                if let Some(stalled) = headers.get(HDR_CONSUMER_STALLED) {
                    return EnqueueAction::Reply(stalled.to_string());
                }
            }
            return EnqueueAction::Consumed;
        }
        return EnqueueAction::Deliver;
    }

    // Data message.
    js.active = true;
    js.hb_misses = 0;
    if msg
        .reply
        .as_deref()
        .map(|r| r.starts_with(ACK_PREFIX))
        .unwrap_or(false)
    {
        js.inbound_seq += 1;
        if js.ack_none {
            msg.acked.store(true, Ordering::Relaxed);
        }
        if js.ordered {
            match parse_ack_reply(msg.reply.as_deref().unwrap_or_default()) {
                Ok(meta) => {
                    if meta.consumer_seq == js.dseq + 1 {
                        js.dseq = meta.consumer_seq;
                        js.sseq = meta.stream_seq;
                    } else {
                        debug!(
                            "ordered consumer gap: expected dseq {}, got {}",
                            js.dseq + 1,
                            meta.consumer_seq
                        );
                        return EnqueueAction::Recreate;
                    }
                }
                Err(err) => {
                    warn!("unparseable ack subject on ordered consumer: {err}");
                    return EnqueueAction::Recreate;
                }
            }
        }
    }
    EnqueueAction::Deliver
}

/// Classification result for a dequeued item on a stream subscription.
pub(crate) enum PreAction {
    Skip,
    /// Store-and-unsubscribe path for terminal fetch statuses.
    Terminal,
    Deliver { last_in_fetch: bool, want_more: bool },
}

impl PreAction {
    pub(crate) fn deliver() -> PreAction {
        PreAction::Deliver {
            last_in_fetch: false,
            want_more: false,
        }
    }
}

pub(crate) fn pre_deliver(
    _sub: &Arc<SubState>,
    inner: &mut SubInner,
    msg: &Message,
) -> PreAction {
    let Some(js) = inner.js.as_deref_mut() else {
        return PreAction::deliver();
    };
    if let Some(code) = msg.status() {
        match code {
            STATUS_CTRL => {
                js.active = true;
                js.hb_misses = 0;
                if let Some(fetch) = &mut js.fetch {
                    fetch.active = true;
                }
                PreAction::Skip
            }
            STATUS_NO_MESSAGES | STATUS_REQUEST_TIMEOUT | STATUS_CONFLICT
            | STATUS_NO_RESPONDERS => {
                if let Some(fetch) = &mut js.fetch {
                    if fetch.reply == msg.subject && fetch.status.is_none() {
                        fetch.status = Some(match code {
                            STATUS_NO_MESSAGES => FetchOutcome::Complete,
                            STATUS_CONFLICT => FetchOutcome::LimitReached,
                            _ => FetchOutcome::Timeout,
                        });
                        return PreAction::Terminal;
                    }
                }
                PreAction::Skip
            }
            _ => PreAction::Skip,
        }
    } else {
        if let Some(fetch) = &mut js.fetch {
            fetch.delivered += 1;
            fetch.received_bytes += msg.payload.len() as u64;
            let hit_msgs = fetch.opts.max_messages > 0
                && fetch.delivered >= fetch.opts.max_messages as u64;
            let hit_bytes = fetch.opts.max_bytes > 0
                && fetch.received_bytes >= fetch.opts.max_bytes as u64;
            if hit_bytes && fetch.status.is_none() {
                fetch.status = Some(FetchOutcome::LimitReached);
            }
            let last = hit_msgs || hit_bytes;
            PreAction::Deliver {
                last_in_fetch: last,
                want_more: !last,
            }
        } else {
            PreAction::deliver()
        }
    }
}

/// Flow-control reply that became due after a delivery, if any.
pub(crate) fn take_due_fc(inner: &mut SubInner) -> Option<String> {
    let delivered = inner.delivered;
    let js = inner.js.as_deref_mut()?;
    if js.fc_reply.is_some() && delivered >= js.fc_delivered {
        return js.fc_reply.take();
    }
    None
}

/// Publishes a pending flow-control reply once delivery has caught up.
pub(crate) fn check_flow_control(sub: &Arc<SubState>) {
    let reply = {
        let mut inner = sub.mu.lock().unwrap();
        take_due_fc(&mut inner)
    };
    if let Some(reply) = reply {
        if let Some(conn) = sub.connection() {
            let _ = conn.publish(&reply, b"");
        }
    }
}

/// Issues the next pull request when the keep-ahead window has room.
pub(crate) fn maybe_fetch_more(sub: &Arc<SubState>) {
    let request = {
        let mut inner = sub.mu.lock().unwrap();
        let Some(js) = inner.js.as_deref_mut() else { return };
        let nms = js.nms.clone();
        let Some(fetch) = js.fetch.as_mut() else { return };
        if fetch.status.is_some() {
            return;
        }
        let counters = FetchCounters {
            requested: fetch.requested,
            delivered: fetch.delivered,
            received_bytes: fetch.received_bytes,
        };
        let decision = match &fetch.opts.next_handler {
            Some(handler) => handler(&counters),
            None => default_next_decision(&fetch.opts, &counters),
        };
        let Some((batch, max_bytes)) = decision else { return };
        if batch == 0 {
            return;
        }
        fetch.requested += batch as u64;
        let req = NextRequest {
            expires: Some(fetch.opts.timeout.as_nanos() as i64),
            batch,
            max_bytes: (max_bytes > 0).then_some(max_bytes),
            no_wait: None,
            idle_heartbeat: fetch
                .opts
                .idle_heartbeat
                .map(|d| d.as_nanos() as i64),
        };
        Some((nms, fetch.reply.clone(), req))
    };
    if let Some((nms, reply, req)) = request {
        if let Some(conn) = sub.connection() {
            let _ = send_next_request(&conn, &nms, &reply, &req);
        }
    }
}

/// Default keep-ahead policy: keep `keep_ahead` requested beyond
/// delivered, never exceeding `max_messages` in total.
fn default_next_decision(
    opts: &FetchOptions,
    counters: &FetchCounters,
) -> Option<(usize, usize)> {
    let outstanding = counters.requested.saturating_sub(counters.delivered);
    if outstanding > opts.keep_ahead as u64 {
        return None;
    }
    let mut batch = opts.batch;
    if opts.max_messages > 0 {
        let left = (opts.max_messages as u64).saturating_sub(counters.requested);
        if left == 0 {
            return None;
        }
        batch = batch.min(left as usize);
    }
    Some((batch, opts.max_bytes))
}

fn send_next_request(
    conn: &crate::connection::Connection,
    nms: &str,
    reply: &str,
    req: &NextRequest,
) -> Result<()> {
    let payload = serde_json::to_vec(req)
        .map_err(|e| Error::Protocol(format!("bad next request: {e}")))?;
    conn.publish_parts(nms, Some(reply), None, &payload)
}

/// Completes the fetch after its last message was delivered.
pub(crate) fn complete_fetch_ok(sub: &Arc<SubState>) {
    finish_fetch(sub, FetchOutcome::Complete);
    let _ = Subscription::new(Arc::clone(sub)).unsubscribe();
}

pub(crate) fn on_fetch_missed_heartbeat(sub: &Arc<SubState>) {
    sub.post_error(Error::MissedHeartbeat);
    finish_fetch(sub, FetchOutcome::MissedHeartbeat);
    let _ = Subscription::new(Arc::clone(sub)).unsubscribe();
}

pub(crate) fn on_fetch_expired(sub: &Arc<SubState>) {
    finish_fetch(sub, FetchOutcome::Timeout);
    let _ = Subscription::new(Arc::clone(sub)).unsubscribe();
}

/// Close synthetic processed for a subscription with an active fetch:
/// report the stored terminal status, overridden by connection-closed.
pub(crate) fn on_close_item(sub: &Arc<SubState>) {
    let (fetch, conn_closed) = {
        let mut inner = sub.mu.lock().unwrap();
        let conn_closed = inner.connection_closed;
        let fetch = inner
            .js
            .as_deref_mut()
            .and_then(|js| js.fetch.take());
        (fetch, conn_closed)
    };
    if let Some(fetch) = fetch {
        let outcome = if conn_closed {
            FetchOutcome::ConnectionClosed
        } else {
            fetch.status.unwrap_or(FetchOutcome::Complete)
        };
        run_fetch_done(fetch, outcome);
    }
}

/// Subscription teardown: stop timers, settle any remaining fetch.
pub(crate) fn on_sub_closed(mut js: Box<JsSubMeta>, conn_closed: bool) {
    if let Some(timer) = js.hb_timer.take() {
        timer.stop();
    }
    if let Some(fetch) = js.fetch.take() {
        let outcome = if conn_closed {
            FetchOutcome::ConnectionClosed
        } else {
            fetch.status.unwrap_or(FetchOutcome::Complete)
        };
        run_fetch_done(fetch, outcome);
    }
}

fn finish_fetch(sub: &Arc<SubState>, fallback: FetchOutcome) {
    let fetch = {
        let mut inner = sub.mu.lock().unwrap();
        inner.js.as_deref_mut().and_then(|js| js.fetch.take())
    };
    if let Some(fetch) = fetch {
        let outcome = fetch.status.unwrap_or(fallback);
        run_fetch_done(fetch, outcome);
    }
}

fn run_fetch_done(mut fetch: FetchState, outcome: FetchOutcome) {
    if let Some(timer) = fetch.hb_timer.take() {
        timer.stop();
    }
    if let Some(timer) = fetch.expiry_timer.take() {
        timer.stop();
    }
    if let Some(done) = fetch.done.take() {
        done(outcome);
    }
}

// ---------------------------------------------------------------------------
// Ordered-consumer recreation
// ---------------------------------------------------------------------------

/// Swap the subscription onto a fresh inbox and sid, then recreate the
/// server-side consumer from the last observed stream sequence. State
/// (flow control, delivery sequence, heartbeat misses) is reset. A
/// failed recreation is retried by the heartbeat timer.
pub(crate) fn trigger_ordered_recreate(sub: &Arc<SubState>) {
    let Some(core) = sub.conn.upgrade() else { return };
    let snapshot = {
        let mut inner = sub.mu.lock().unwrap();
        let Some(js) = inner.js.as_deref_mut() else { return };
        if js.recreating {
            return;
        }
        js.recreating = true;
        js.fc_reply = None;
        js.dseq = 0;
        js.inbound_seq = 0;
        js.active = true;
        js.hb_misses = 0;
        (Arc::clone(&js.ctx), js.stream.clone(), js.ccfg.clone(), js.sseq)
    };
    let (ctx, stream, base_cfg, sseq) = snapshot;

    let new_inbox = inbox::new_inbox(INBOX_PREFIX);
    if let Err(err) = core.swap_sid(sub, &new_inbox) {
        warn!("ordered consumer inbox swap failed: {err}");
        if let Some(js) = sub.mu.lock().unwrap().js.as_deref_mut() {
            js.recreating = false;
        }
        return;
    }

    let sub = Arc::clone(sub);
    std::thread::Builder::new()
        .name("weft-js-recreate".to_string())
        .spawn(move || {
            let mut cfg = base_cfg;
            cfg.deliver_subject = Some(new_inbox);
            if sseq > 0 {
                cfg.deliver_policy = DeliverPolicy::ByStartSequence;
                cfg.opt_start_seq = Some(sseq + 1);
            }
            let js_handle = JetStream { ctx };
            match js_handle.add_consumer(&stream, &cfg) {
                Ok(info) => {
                    let mut inner = sub.mu.lock().unwrap();
                    if let Some(js) = inner.js.as_deref_mut() {
                        js.consumer = info.name;
                        js.ccfg = cfg;
                        js.recreating = false;
                    }
                }
                Err(err) => {
                    warn!("ordered consumer recreate failed: {err}");
                    let mut inner = sub.mu.lock().unwrap();
                    if let Some(js) = inner.js.as_deref_mut() {
                        js.recreating = false;
                    }
                }
            }
        })
        .expect("spawn consumer recreate thread");
}

/// Heartbeat watchdog for push consumers.
fn arm_heartbeat_timer(sub: &Arc<SubState>, interval: Duration) {
    let weak: Weak<SubState> = Arc::downgrade(sub);
    let timer = Timer::start(interval, Some(interval), move || {
        let Some(sub) = weak.upgrade() else { return };
        let (missed, ordered) = {
            let mut inner = sub.mu.lock().unwrap();
            if inner.closed {
                return;
            }
            let Some(js) = inner.js.as_deref_mut() else { return };
            if js.active {
                js.active = false;
                js.hb_misses = 0;
                (false, false)
            } else {
                js.hb_misses += 1;
                (js.hb_misses >= MAX_HB_MISSES, js.ordered)
            }
        };
        if missed {
            sub.post_error(Error::MissedHeartbeat);
            // A recreate already in flight dedups on the recreating flag.
            if ordered {
                trigger_ordered_recreate(&sub);
            }
        }
    });
    let mut inner = sub.mu.lock().unwrap();
    if let Some(js) = inner.js.as_deref_mut() {
        if let Some(old) = js.hb_timer.take() {
            old.stop();
        }
        js.hb_timer = Some(timer);
    }
}

// ---------------------------------------------------------------------------
// Subscribe API
// ---------------------------------------------------------------------------

/// Options for creating or attaching to a stream consumer.
#[derive(Clone, Default)]
pub struct JsSubOptions {
    pub(crate) stream: Option<String>,
    pub(crate) consumer: Option<String>,
    pub(crate) durable: Option<String>,
    pub(crate) queue: Option<String>,
    pub(crate) config: ConsumerConfig,
    pub(crate) sub_opts: SubscribeOptions,
}

impl JsSubOptions {
    pub fn new() -> Self {
        JsSubOptions {
            stream: None,
            consumer: None,
            durable: None,
            queue: None,
            config: ConsumerConfig::default(),
            sub_opts: SubscribeOptions::new(),
        }
    }

    /// Names the stream explicitly instead of resolving it by subject.
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Binds to an existing consumer by name.
    pub fn bind(mut self, stream: impl Into<String>, consumer: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self.consumer = Some(consumer.into());
        self
    }

    pub fn durable(mut self, name: impl Into<String>) -> Self {
        self.durable = Some(name.into());
        self
    }

    pub fn queue(mut self, group: impl Into<String>) -> Self {
        self.queue = Some(group.into());
        self
    }

    /// Full consumer configuration for creation.
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn subscribe_options(mut self, opts: SubscribeOptions) -> Self {
        self.sub_opts = opts;
        self
    }
}

/// A push-consumer subscription.
pub struct PushSubscription {
    sub: Subscription,
}

impl std::ops::Deref for PushSubscription {
    type Target = Subscription;

    fn deref(&self) -> &Subscription {
        &self.sub
    }
}

impl PushSubscription {
    /// Stream and consumer this subscription is bound to.
    pub fn consumer_name(&self) -> (String, String) {
        let inner = self.sub.state.mu.lock().unwrap();
        match inner.js.as_deref() {
            Some(js) => (js.stream.clone(), js.consumer.clone()),
            None => (String::new(), String::new()),
        }
    }
}

/// A pull-consumer subscription.
pub struct PullSubscription {
    sub: Subscription,
}

impl std::ops::Deref for PullSubscription {
    type Target = Subscription;

    fn deref(&self) -> &Subscription {
        &self.sub
    }
}

impl JetStream {
    /// Push subscription consumed synchronously with `next_msg`.
    pub fn subscribe(&self, subject: &str, opts: JsSubOptions) -> Result<PushSubscription> {
        self.push_subscribe_inner(subject, opts, None, false)
    }

    /// Push subscription delivered to `handler` on a dispatcher thread.
    pub fn subscribe_handler<F>(
        &self,
        subject: &str,
        opts: JsSubOptions,
        handler: F,
    ) -> Result<PushSubscription>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.push_subscribe_inner(subject, opts, Some(Box::new(handler)), false)
    }

    /// Ordered consumer: single-replica, flow-controlled, gap-healing.
    pub fn subscribe_ordered(&self, subject: &str, opts: JsSubOptions) -> Result<PushSubscription> {
        self.push_subscribe_inner(subject, opts, None, true)
    }

    pub fn subscribe_ordered_handler<F>(
        &self,
        subject: &str,
        opts: JsSubOptions,
        handler: F,
    ) -> Result<PushSubscription>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.push_subscribe_inner(subject, opts, Some(Box::new(handler)), true)
    }

    fn push_subscribe_inner(
        &self,
        subject: &str,
        mut opts: JsSubOptions,
        cb: Option<crate::subscription::MessageCallback>,
        ordered: bool,
    ) -> Result<PushSubscription> {
        let conn = self.connection()?;
        if ordered {
            if opts.durable.is_some() || opts.config.durable_name.is_some() {
                return Err(Error::InvalidArg("ordered consumers cannot be durable"));
            }
            if opts.queue.is_some() {
                return Err(Error::InvalidArg(
                    "ordered consumers cannot join a queue group",
                ));
            }
            opts.config.ack_policy = AckPolicy::None;
            opts.config.flow_control = true;
            opts.config.max_deliver = Some(1);
            opts.config.mem_storage = true;
            opts.config.num_replicas = Some(1);
            if opts.config.idle_heartbeat.is_none() {
                opts.config.idle_heartbeat = Some(ORDERED_HEARTBEAT.as_nanos() as i64);
            }
        }

        let stream = match &opts.stream {
            Some(stream) => stream.clone(),
            None => self.stream_name_by_subject(subject)?,
        };
        let mut cfg = opts.config.clone();
        if let Some(durable) = &opts.durable {
            cfg.durable_name = Some(durable.clone());
        }
        if cfg.filter_subject.is_none() && cfg.filter_subjects.is_empty() {
            cfg.filter_subject = Some(subject.to_string());
        }
        if let Some(queue) = &opts.queue {
            cfg.deliver_group = Some(queue.clone());
        }

        // Attach to an existing consumer when one is named; otherwise
        // create one with a fresh delivery inbox.
        let named = opts.consumer.clone().or_else(|| cfg.durable_name.clone());
        let (info, deliver) = match named {
            Some(name) => match self.consumer_info(&stream, &name) {
                Ok(info) => {
                    check_consumer_config_match(&info.config, &cfg)?;
                    let deliver = info.config.deliver_subject.clone().ok_or_else(|| {
                        Error::Mismatch("consumer is pull-based, not push".to_string())
                    })?;
                    (info, deliver)
                }
                Err(Error::Api(api)) if api.code == 404 => {
                    self.create_push_consumer(&stream, cfg.clone())?
                }
                Err(err) => return Err(err),
            },
            None => self.create_push_consumer(&stream, cfg.clone())?,
        };

        let mut meta = JsSubMeta::new(Arc::clone(&self.ctx), stream, info.name.clone());
        meta.ordered = ordered;
        meta.ack_none = matches!(info.config.ack_policy, AckPolicy::None);
        meta.ccfg = cfg;
        meta.ccfg.deliver_subject = None;
        let heartbeat = info.config.idle_heartbeat.filter(|&ns| ns > 0);

        let mut sub_opts = opts.sub_opts.clone();
        if let Some(queue) = &opts.queue {
            sub_opts = sub_opts.queue(queue.clone());
        }
        let sub = conn.subscribe_js(&deliver, sub_opts, cb, Some(meta))?;
        if let Some(ns) = heartbeat {
            arm_heartbeat_timer(&sub.state, Duration::from_nanos(ns as u64));
        }
        Ok(PushSubscription { sub })
    }

    fn create_push_consumer(
        &self,
        stream: &str,
        mut cfg: ConsumerConfig,
    ) -> Result<(ConsumerInfo, String)> {
        let deliver = inbox::new_inbox(INBOX_PREFIX);
        cfg.deliver_subject = Some(deliver.clone());
        let info = self.add_consumer(stream, &cfg)?;
        Ok((info, deliver))
    }

    /// Pull subscription; consume with `fetch`.
    pub fn pull_subscribe(&self, subject: &str, durable: &str) -> Result<PullSubscription> {
        self.pull_subscribe_with(subject, JsSubOptions::new().durable(durable))
    }

    pub fn pull_subscribe_with(
        &self,
        subject: &str,
        opts: JsSubOptions,
    ) -> Result<PullSubscription> {
        self.pull_subscribe_inner(subject, opts, None, None)
    }

    /// Pull subscription driven by a background fetch: `handler` receives
    /// each message, `done` fires once with the terminal outcome.
    pub fn pull_subscribe_async<F, D>(
        &self,
        subject: &str,
        opts: JsSubOptions,
        fetch_opts: FetchOptions,
        handler: F,
        done: D,
    ) -> Result<PullSubscription>
    where
        F: FnMut(Message) + Send + 'static,
        D: FnOnce(FetchOutcome) + Send + 'static,
    {
        if fetch_opts.batch == 0 {
            return Err(Error::InvalidArg("fetch batch must be at least 1"));
        }
        self.pull_subscribe_inner(
            subject,
            opts,
            Some(Box::new(handler)),
            Some((fetch_opts, Box::new(done) as FetchDoneCallback)),
        )
    }

    fn pull_subscribe_inner(
        &self,
        subject: &str,
        mut opts: JsSubOptions,
        cb: Option<crate::subscription::MessageCallback>,
        fetch: Option<(FetchOptions, FetchDoneCallback)>,
    ) -> Result<PullSubscription> {
        let conn = self.connection()?;
        if opts.config.deliver_subject.is_some() {
            return Err(Error::InvalidArg(
                "pull consumers cannot have a delivery subject",
            ));
        }
        let stream = match &opts.stream {
            Some(stream) => stream.clone(),
            None => self.stream_name_by_subject(subject)?,
        };
        let mut cfg = opts.config.clone();
        if let Some(durable) = opts.durable.take() {
            cfg.durable_name = Some(durable);
        }
        if cfg.filter_subject.is_none() && cfg.filter_subjects.is_empty() {
            cfg.filter_subject = Some(subject.to_string());
        }
        if cfg.max_waiting.is_none() {
            cfg.max_waiting = Some(512);
        }

        let named = opts.consumer.clone().or_else(|| cfg.durable_name.clone());
        let info = match named {
            Some(name) => match self.consumer_info(&stream, &name) {
                Ok(info) => {
                    if info.config.deliver_subject.is_some() {
                        return Err(Error::Mismatch(
                            "consumer is push-based, not pull".to_string(),
                        ));
                    }
                    check_consumer_config_match(&info.config, &cfg)?;
                    info
                }
                Err(Error::Api(api)) if api.code == 404 => self.add_consumer(&stream, &cfg)?,
                Err(err) => return Err(err),
            },
            None => self.add_consumer(&stream, &cfg)?,
        };

        let pull_inbox = inbox::new_inbox(INBOX_PREFIX);
        let wildcard = format!("{pull_inbox}.*");

        let mut meta = JsSubMeta::new(Arc::clone(&self.ctx), stream.clone(), info.name.clone());
        meta.pull = true;
        meta.ack_none = matches!(info.config.ack_policy, AckPolicy::None);
        meta.nms = format!(
            "{}CONSUMER.MSG.NEXT.{}.{}",
            self.ctx.prefix, stream, info.name
        );
        meta.ccfg = cfg;
        meta.pull_inbox = pull_inbox;

        let async_fetch = fetch.is_some();
        if let Some((fetch_opts, done)) = fetch {
            meta.fetch_id += 1;
            let reply = format!("{}.{}", meta.pull_inbox, meta.fetch_id);
            meta.in_fetch = true;
            meta.fetch = Some(FetchState {
                requested: 0,
                delivered: 0,
                received_bytes: 0,
                reply,
                status: None,
                active: true,
                hb_timer: None,
                expiry_timer: None,
                done: Some(done),
                opts: fetch_opts,
            });
        }

        let sub = conn.subscribe_js(&wildcard, opts.sub_opts.clone(), cb, Some(meta))?;
        if async_fetch {
            start_async_fetch(&sub.state)?;
        }
        Ok(PullSubscription { sub })
    }
}

/// Sends the initial request of an async fetch and arms its timers.
fn start_async_fetch(sub: &Arc<SubState>) -> Result<()> {
    let (nms, reply, req, hb, overall) = {
        let mut inner = sub.mu.lock().unwrap();
        let js = inner
            .js
            .as_deref_mut()
            .ok_or(Error::IllegalState("async fetch without stream metadata"))?;
        let nms = js.nms.clone();
        let fetch = js
            .fetch
            .as_mut()
            .ok_or(Error::IllegalState("async fetch without fetch state"))?;
        let mut batch = fetch.opts.batch;
        if fetch.opts.max_messages > 0 {
            batch = batch.min(fetch.opts.max_messages);
        }
        fetch.requested = batch as u64;
        let req = NextRequest {
            expires: Some(fetch.opts.timeout.as_nanos() as i64),
            batch,
            max_bytes: (fetch.opts.max_bytes > 0).then_some(fetch.opts.max_bytes),
            no_wait: fetch.opts.no_wait.then_some(true),
            idle_heartbeat: fetch.opts.idle_heartbeat.map(|d| d.as_nanos() as i64),
        };
        (
            nms,
            fetch.reply.clone(),
            req,
            fetch.opts.idle_heartbeat,
            fetch.opts.timeout,
        )
    };

    // Missed-heartbeat watchdog and overall expiry, both delivered
    // through the queue so they order with in-flight messages.
    if let Some(interval) = hb {
        let weak = Arc::downgrade(sub);
        let timer = Timer::start(interval * 2, Some(interval * 2), move || {
            if let Some(sub) = weak.upgrade() {
                let stale = {
                    let mut inner = sub.mu.lock().unwrap();
                    match inner.js.as_deref_mut().and_then(|js| js.fetch.as_mut()) {
                        Some(fetch) => {
                            if fetch.active {
                                fetch.active = false;
                                false
                            } else {
                                true
                            }
                        }
                        None => return,
                    }
                };
                if stale {
                    sub.push_item_locked(crate::dispatch::ItemKind::FetchMissedHeartbeat);
                }
            }
        });
        let mut inner = sub.mu.lock().unwrap();
        if let Some(fetch) = inner.js.as_deref_mut().and_then(|js| js.fetch.as_mut()) {
            fetch.hb_timer = Some(timer);
        }
    }
    {
        let weak = Arc::downgrade(sub);
        let timer = Timer::start(overall, None, move || {
            if let Some(sub) = weak.upgrade() {
                sub.push_item_locked(crate::dispatch::ItemKind::FetchExpired);
            }
        });
        let mut inner = sub.mu.lock().unwrap();
        if let Some(fetch) = inner.js.as_deref_mut().and_then(|js| js.fetch.as_mut()) {
            fetch.expiry_timer = Some(timer);
        }
    }

    let conn = sub
        .connection()
        .ok_or(Error::ConnectionClosed)?;
    send_next_request(&conn, &nms, &reply, &req)
}

impl PullSubscription {
    /// Fetches up to `batch` messages, waiting at most `timeout`.
    pub fn fetch(&self, batch: usize, timeout: Duration) -> Result<Vec<Message>> {
        self.fetch_with(FetchOptions::new(batch).timeout(timeout))
    }

    /// Fetch with full options. Returns the collected messages whenever
    /// at least one arrived; otherwise the first error.
    pub fn fetch_with(&self, opts: FetchOptions) -> Result<Vec<Message>> {
        if opts.batch == 0 {
            return Err(Error::InvalidArg("fetch batch must be at least 1"));
        }
        let state = &self.sub.state;
        let deadline = Instant::now() + opts.timeout;

        let (nms, reply) = {
            let mut inner = state.mu.lock().unwrap();
            if inner.closed {
                return Err(Error::InvalidSubscription);
            }
            let js = inner
                .js
                .as_deref_mut()
                .ok_or(Error::IllegalState("fetch on a plain subscription"))?;
            if !js.pull {
                return Err(Error::IllegalState("fetch on a push subscription"));
            }
            if js.in_fetch {
                return Err(Error::IllegalState("a fetch is already in progress"));
            }
            js.in_fetch = true;
            js.fetch_id += 1;
            (js.nms.clone(), format!("{}.{}", js.pull_inbox, js.fetch_id))
        };

        let result = self.fetch_collect(&opts, &nms, &reply, deadline);

        if let Some(js) = state.mu.lock().unwrap().js.as_deref_mut() {
            js.in_fetch = false;
        }
        result
    }

    fn fetch_collect(
        &self,
        opts: &FetchOptions,
        nms: &str,
        reply: &str,
        deadline: Instant,
    ) -> Result<Vec<Message>> {
        let conn = self
            .sub
            .state
            .connection()
            .ok_or(Error::ConnectionClosed)?;
        let mut msgs: Vec<Message> = Vec::with_capacity(opts.batch);
        let mut bytes = 0usize;

        // Messages already queued from a previous overlapping request
        // count against this batch.
        while msgs.len() < opts.batch {
            match self.sub.try_next_queued() {
                Some(msg) if msg.status().is_none() => {
                    bytes += msg.payload.len();
                    msgs.push(msg);
                    if opts.max_bytes > 0 && bytes >= opts.max_bytes {
                        return Ok(msgs);
                    }
                }
                // Stale statuses from earlier fetches are dropped.
                Some(_) => continue,
                None => break,
            }
        }
        if msgs.len() == opts.batch {
            return Ok(msgs);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let expires = remaining
            .saturating_sub(Duration::from_millis(10))
            .as_nanos() as i64;
        let req = NextRequest {
            expires: (!opts.no_wait).then_some(expires),
            batch: opts.batch - msgs.len(),
            max_bytes: (opts.max_bytes > 0).then_some(opts.max_bytes),
            no_wait: opts.no_wait.then_some(true),
            idle_heartbeat: opts.idle_heartbeat.map(|d| d.as_nanos() as i64),
        };
        send_next_request(&conn, nms, reply, &req)?;

        let mut first_err: Option<Error> = None;
        let mut resent_waiting = false;
        while msgs.len() < opts.batch {
            let msg = match self.sub.next_msg_deadline(deadline) {
                Ok(msg) => msg,
                Err(Error::Timeout) => {
                    if first_err.is_none() {
                        first_err = Some(Error::Timeout);
                    }
                    break;
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                    break;
                }
            };
            match msg.status() {
                None => {
                    bytes += msg.payload.len();
                    msgs.push(msg);
                    if opts.max_bytes > 0 && bytes >= opts.max_bytes {
                        break;
                    }
                }
                Some(code) => {
                    if msg.subject != reply {
                        continue;
                    }
                    match code {
                        STATUS_CTRL => continue,
                        STATUS_NO_MESSAGES => {
                            if opts.no_wait && msgs.is_empty() && !resent_waiting {
                                // Nothing immediate; fall back to a
                                // waiting request for the rest of the
                                // deadline.
                                resent_waiting = true;
                                let remaining =
                                    deadline.saturating_duration_since(Instant::now());
                                if remaining.is_zero() {
                                    first_err = Some(Error::Timeout);
                                    break;
                                }
                                let req = NextRequest {
                                    expires: Some(remaining.as_nanos() as i64),
                                    batch: opts.batch - msgs.len(),
                                    max_bytes: (opts.max_bytes > 0)
                                        .then_some(opts.max_bytes),
                                    no_wait: None,
                                    idle_heartbeat: opts
                                        .idle_heartbeat
                                        .map(|d| d.as_nanos() as i64),
                                };
                                send_next_request(&conn, nms, reply, &req)?;
                                continue;
                            }
                            if first_err.is_none() {
                                first_err = Some(Error::NotFound);
                            }
                            break;
                        }
                        STATUS_REQUEST_TIMEOUT => {
                            if first_err.is_none() {
                                first_err = Some(Error::Timeout);
                            }
                            break;
                        }
                        STATUS_CONFLICT => {
                            if first_err.is_none() {
                                first_err = Some(Error::LimitReached);
                            }
                            break;
                        }
                        STATUS_NO_RESPONDERS => {
                            if first_err.is_none() {
                                first_err = Some(Error::NoResponders);
                            }
                            break;
                        }
                        _ => continue,
                    }
                }
            }
        }

        if !msgs.is_empty() {
            Ok(msgs)
        } else {
            Err(first_err.unwrap_or(Error::Timeout))
        }
    }

    /// Stream and consumer this subscription is bound to.
    pub fn consumer_name(&self) -> (String, String) {
        let inner = self.sub.state.mu.lock().unwrap();
        match inner.js.as_deref() {
            Some(js) => (js.stream.clone(), js.consumer.clone()),
            None => (String::new(), String::new()),
        }
    }
}

/// Field-by-field comparison of a requested consumer configuration
/// against the server's. Only fields the caller actually set (differ
/// from the default) are compared; any divergence is fatal.
pub(crate) fn check_consumer_config_match(
    server: &ConsumerConfig,
    requested: &ConsumerConfig,
) -> Result<()> {
    let defaults = ConsumerConfig::default();
    let mismatch = |field: &str| Err(Error::Mismatch(format!("consumer config field {field}")));

    macro_rules! check {
        ($field:ident) => {
            if requested.$field != defaults.$field && requested.$field != server.$field {
                return mismatch(stringify!($field));
            }
        };
    }

    check!(durable_name);
    check!(description);
    check!(deliver_group);
    check!(deliver_policy);
    check!(opt_start_seq);
    check!(opt_start_time);
    check!(ack_policy);
    check!(ack_wait);
    check!(max_deliver);
    check!(backoff);
    check!(filter_subject);
    check!(filter_subjects);
    check!(replay_policy);
    check!(rate_limit_bps);
    check!(sample_freq);
    check!(max_ack_pending);
    check!(flow_control);
    check!(idle_heartbeat);
    check!(headers_only);
    check!(max_batch);
    check!(max_expires);
    check!(inactive_threshold);
    check!(num_replicas);
    check!(mem_storage);
    Ok(())
}
