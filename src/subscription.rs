//! Subscriptions and the per-subscription delivery state.
//!
//! A subscription is a logical receive endpoint identified by a
//! per-connection sid. Messages are enqueued by the connection's reader
//! thread and consumed either synchronously (`next_msg`) or by a
//! dispatcher worker invoking the registered callback. Control flow
//! (drain, close, timeout) travels through the same FIFO as user
//! messages, as tagged items.
//!
//! Lock order is subscription, then dispatcher queue. Dispatcher workers
//! never hold either lock while running user code.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::connection::{ConnCore, Connection};
use crate::dispatch::{Dispatcher, ItemKind};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::options::SubscribeOptions;
use crate::timer::Timer;

pub(crate) type MessageCallback = Box<dyn FnMut(Message) + Send + 'static>;

/// How messages leave the subscription queue.
pub(crate) enum DeliverMode {
    /// User pulls with `next_msg`; the queue lives on the subscription.
    Sync,
    /// Dedicated worker thread bound to this subscription.
    Dedicated,
    /// Shared pool worker; items go to the dispatcher's own queue.
    Pool(Arc<Dispatcher>),
}

pub(crate) struct SubInner {
    /// Item queue for sync and dedicated modes. Pool mode enqueues into
    /// the dispatcher queue instead.
    pub queue: VecDeque<ItemKind>,
    pub pending_msgs: usize,
    pub pending_bytes: usize,
    pub max_pending_msgs: usize,
    pub max_pending_bytes: usize,
    pub msgs_limit: usize,
    pub bytes_limit: usize,
    pub delivered: u64,
    pub dropped: u64,
    /// Auto-unsubscribe ceiling.
    pub max_deliveries: Option<u64>,
    pub closed: bool,
    pub draining: bool,
    pub drained: bool,
    pub slow_consumer: bool,
    pub connection_closed: bool,
    pub timeout: Option<Duration>,
    pub timeout_timer: Option<Timer>,
    pub on_complete: Option<Arc<dyn Fn() + Send + Sync>>,
    pub cb: Option<MessageCallback>,
    pub mode: DeliverMode,
    /// Persistent-stream metadata, when this subscription belongs to a
    /// stream consumer.
    pub js: Option<Box<crate::jetstream::sub::JsSubMeta>>,
}

pub(crate) struct SubState {
    /// Atomic because an ordered-consumer recreate swaps the sid in the
    /// routing table without touching the rest of the subscription.
    pub sid: AtomicU64,
    pub subject: Mutex<String>,
    pub queue_group: Option<String>,
    pub conn: Weak<ConnCore>,
    pub mu: Mutex<SubInner>,
    pub cv: Condvar,
    /// Latched by close so racing paths converge once.
    pub closed_flag: AtomicBool,
}

impl SubState {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        conn: Weak<ConnCore>,
        opts: &SubscribeOptions,
        cb: Option<MessageCallback>,
        mode: DeliverMode,
    ) -> Arc<SubState> {
        Arc::new(SubState {
            sid: AtomicU64::new(sid),
            subject: Mutex::new(subject),
            queue_group: opts.queue.clone(),
            conn,
            mu: Mutex::new(SubInner {
                queue: VecDeque::new(),
                pending_msgs: 0,
                pending_bytes: 0,
                max_pending_msgs: 0,
                max_pending_bytes: 0,
                msgs_limit: opts.pending_msgs_limit,
                bytes_limit: opts.pending_bytes_limit,
                delivered: 0,
                dropped: 0,
                max_deliveries: opts.max_deliveries,
                closed: false,
                draining: false,
                drained: false,
                slow_consumer: false,
                connection_closed: false,
                timeout: opts.timeout,
                timeout_timer: None,
                on_complete: opts.on_complete.clone(),
                cb,
                mode,
                js: None,
            }),
            cv: Condvar::new(),
            closed_flag: AtomicBool::new(false),
        })
    }

    /// Current sid; changes only during an ordered-consumer recreate.
    pub(crate) fn id(&self) -> u64 {
        self.sid.load(Ordering::Relaxed)
    }

    pub(crate) fn connection(&self) -> Option<Connection> {
        self.conn.upgrade().map(Connection::from_core)
    }

    pub(crate) fn subject_str(&self) -> String {
        self.subject.lock().unwrap().clone()
    }

    /// Enqueues an inbound user message, enforcing pending limits.
    ///
    /// Called from the reader thread with no connection locks held.
    pub(crate) fn enqueue_msg(self: &Arc<Self>, mut msg: Message) {
        msg.sub = Some(Arc::clone(self));

        let mut inner = self.mu.lock().unwrap();
        if inner.closed || inner.draining {
            return;
        }

        // Persistent-stream inbound hooks: flow-control bookkeeping,
        // pre-ack, ordered-consumer sequence checks. Control traffic is
        // consumed here and never counted against pending limits.
        if inner.js.is_some() {
            use crate::jetstream::sub::EnqueueAction;
            match crate::jetstream::sub::pre_enqueue(&mut inner, &mut msg) {
                EnqueueAction::Deliver => {}
                EnqueueAction::Consumed => return,
                EnqueueAction::Reply(subject) => {
                    drop(inner);
                    if let Some(conn) = self.connection() {
                        let _ = conn.publish(&subject, b"");
                    }
                    return;
                }
                EnqueueAction::Recreate => {
                    drop(inner);
                    crate::jetstream::sub::trigger_ordered_recreate(self);
                    return;
                }
            }
        }

        let size = msg.wire_len();
        if inner.pending_msgs + 1 > inner.msgs_limit
            || inner.pending_bytes + size > inner.bytes_limit
        {
            inner.dropped += 1;
            if !inner.slow_consumer {
                inner.slow_consumer = true;
                drop(inner);
                self.post_error(Error::SlowConsumer);
            }
            return;
        }
        inner.pending_msgs += 1;
        inner.pending_bytes += size;
        inner.max_pending_msgs = inner.max_pending_msgs.max(inner.pending_msgs);
        inner.max_pending_bytes = inner.max_pending_bytes.max(inner.pending_bytes);

        self.push_item(inner, ItemKind::User(msg));
    }

    /// Appends a control or user item to the delivery FIFO, waking the
    /// responsible consumer. Takes the locked inner to preserve the
    /// subscription-then-dispatcher lock order.
    pub(crate) fn push_item(
        self: &Arc<Self>,
        mut inner: std::sync::MutexGuard<'_, SubInner>,
        item: ItemKind,
    ) {
        let pool = match &inner.mode {
            DeliverMode::Pool(dispatcher) => Some(Arc::clone(dispatcher)),
            DeliverMode::Sync | DeliverMode::Dedicated => None,
        };
        match pool {
            Some(dispatcher) => {
                // Lock order: subscription, then dispatcher queue.
                dispatcher.enqueue(Arc::clone(self), item);
                drop(inner);
            }
            None => {
                inner.queue.push_back(item);
                drop(inner);
                self.cv.notify_all();
            }
        }
    }

    pub(crate) fn push_item_locked(self: &Arc<Self>, item: ItemKind) {
        let inner = self.mu.lock().unwrap();
        self.push_item(inner, item);
    }

    pub(crate) fn post_error(self: &Arc<Self>, err: Error) {
        if let Some(core) = self.conn.upgrade() {
            core.post_sub_error(Arc::clone(self), err);
        }
    }

    /// Marks the slow-consumer episode over after a successful dequeue.
    pub(crate) fn clear_slow_consumer(&self, inner: &mut SubInner) {
        inner.slow_consumer = false;
    }
}

/// Public subscription handle. Clones share the same endpoint.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) state: Arc<SubState>,
}

impl Subscription {
    pub(crate) fn new(state: Arc<SubState>) -> Self {
        Subscription { state }
    }

    pub fn sid(&self) -> u64 {
        self.state.id()
    }

    pub fn subject(&self) -> String {
        self.state.subject_str()
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.state.queue_group.as_deref()
    }

    /// Blocks for the next message, up to `timeout`.
    ///
    /// Only valid on subscriptions created without a callback.
    pub fn next_msg(&self, timeout: Duration) -> Result<Message> {
        self.next_msg_deadline(Instant::now() + timeout)
    }

    pub(crate) fn next_msg_deadline(&self, deadline: Instant) -> Result<Message> {
        let state = &self.state;
        let mut inner = state.mu.lock().unwrap();
        if inner.cb.is_some() {
            return Err(Error::IllegalState(
                "next_msg on a callback subscription",
            ));
        }
        loop {
            while let Some(item) = inner.queue.pop_front() {
                match item {
                    ItemKind::User(msg) => {
                        inner.pending_msgs = inner.pending_msgs.saturating_sub(1);
                        inner.pending_bytes =
                            inner.pending_bytes.saturating_sub(msg.wire_len());
                        state.clear_slow_consumer(&mut inner);
                        inner.delivered += 1;
                        let last = inner
                            .max_deliveries
                            .map(|max| inner.delivered >= max)
                            .unwrap_or(false);
                        let fc_reply = if inner.js.is_some() {
                            crate::jetstream::sub::take_due_fc(&mut inner)
                        } else {
                            None
                        };
                        let drain_done =
                            inner.draining && inner.queue.is_empty();
                        drop(inner);
                        if let Some(reply) = fc_reply {
                            if let Some(conn) = state.connection() {
                                let _ = conn.publish(&reply, b"");
                            }
                        }
                        if last {
                            let _ = self.close_after_max();
                        }
                        if drain_done {
                            self.finish_drain();
                        }
                        return Ok(msg);
                    }
                    ItemKind::Drain => {
                        drop(inner);
                        self.release_from_connection();
                        inner = state.mu.lock().unwrap();
                        if inner.queue.is_empty() {
                            drop(inner);
                            self.finish_drain();
                            inner = state.mu.lock().unwrap();
                        }
                    }
                    ItemKind::Close => {
                        let conn_closed = inner.connection_closed;
                        drop(inner);
                        self.finish_close();
                        return Err(if conn_closed {
                            Error::ConnectionClosed
                        } else {
                            Error::InvalidSubscription
                        });
                    }
                    // Sync receivers surface timeouts through their own
                    // deadline; stream control items never reach a plain
                    // sync subscription.
                    ItemKind::Timeout
                    | ItemKind::FetchMissedHeartbeat
                    | ItemKind::FetchExpired => {}
                }
            }
            if inner.closed {
                return Err(if inner.connection_closed {
                    Error::ConnectionClosed
                } else {
                    Error::InvalidSubscription
                });
            }
            if inner.draining {
                drop(inner);
                self.finish_drain();
                return Err(Error::InvalidSubscription);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, _res) = state
                .cv
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }

    /// Pops an already-queued message without blocking; used by pull
    /// fetches to drain leftovers from a previous request.
    pub(crate) fn try_next_queued(&self) -> Option<Message> {
        let mut inner = self.state.mu.lock().unwrap();
        match inner.queue.pop_front()? {
            ItemKind::User(msg) => {
                inner.pending_msgs = inner.pending_msgs.saturating_sub(1);
                inner.pending_bytes =
                    inner.pending_bytes.saturating_sub(msg.wire_len());
                self.state.clear_slow_consumer(&mut inner);
                inner.delivered += 1;
                Some(msg)
            }
            other => {
                // Control items go back where they were.
                inner.queue.push_front(other);
                None
            }
        }
    }

    /// Removes interest immediately; queued messages are discarded.
    pub fn unsubscribe(&self) -> Result<()> {
        let core = self.state.conn.upgrade();
        if let Some(core) = &core {
            core.send_unsub(self.state.id(), None)?;
        }
        self.release_from_connection();
        self.finish_close();
        Ok(())
    }

    /// Asks the server to remove interest after `max` total deliveries.
    /// If that many messages were already delivered the subscription
    /// closes immediately.
    pub fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        let already_done = {
            let mut inner = self.state.mu.lock().unwrap();
            if inner.closed {
                return Err(Error::InvalidSubscription);
            }
            inner.max_deliveries = Some(max);
            inner.delivered >= max
        };
        if let Some(core) = self.state.conn.upgrade() {
            core.send_unsub(self.state.id(), Some(max))?;
        }
        if already_done {
            self.release_from_connection();
            self.finish_close();
        }
        Ok(())
    }

    /// Initiates a cooperative drain: all messages already queued are
    /// delivered, then the subscription closes.
    pub fn drain(&self) -> Result<()> {
        {
            let mut inner = self.state.mu.lock().unwrap();
            if inner.closed {
                return Err(Error::InvalidSubscription);
            }
            if inner.draining {
                return Ok(());
            }
            inner.draining = true;
        }
        // Stop new arrivals at the server before the drain marker.
        if let Some(core) = self.state.conn.upgrade() {
            let _ = core.send_unsub(self.state.id(), None);
        }
        self.state.push_item_locked(ItemKind::Drain);
        self.state.cv.notify_all();
        Ok(())
    }

    /// Blocks until a drain completes, up to `timeout`.
    pub fn wait_for_drain_completion(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.state.mu.lock().unwrap();
        loop {
            if inner.drained || inner.closed {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, _) = self
                .state
                .cv
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.state.mu.lock().unwrap().closed
    }

    pub fn is_draining(&self) -> bool {
        let inner = self.state.mu.lock().unwrap();
        inner.draining && !inner.drained
    }

    /// (pending messages, pending bytes) currently queued.
    pub fn pending(&self) -> (usize, usize) {
        let inner = self.state.mu.lock().unwrap();
        (inner.pending_msgs, inner.pending_bytes)
    }

    /// High-water marks of the pending counters.
    pub fn max_pending(&self) -> (usize, usize) {
        let inner = self.state.mu.lock().unwrap();
        (inner.max_pending_msgs, inner.max_pending_bytes)
    }

    pub fn delivered(&self) -> u64 {
        self.state.mu.lock().unwrap().delivered
    }

    pub fn dropped(&self) -> u64 {
        self.state.mu.lock().unwrap().dropped
    }

    pub(crate) fn release_from_connection(&self) {
        if let Some(core) = self.state.conn.upgrade() {
            core.remove_sub(self.state.id());
        }
    }

    fn close_after_max(&self) -> Result<()> {
        self.release_from_connection();
        self.finish_close();
        Ok(())
    }

    pub(crate) fn finish_drain(&self) {
        {
            let mut inner = self.state.mu.lock().unwrap();
            if inner.drained {
                return;
            }
            inner.drained = true;
        }
        self.finish_close();
    }

    /// Final close: marks the subscription dead, drops queued items,
    /// fires the completion callback once.
    pub(crate) fn finish_close(&self) {
        if self.state.closed_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        let (on_complete, js, conn_closed) = {
            let mut inner = self.state.mu.lock().unwrap();
            inner.closed = true;
            inner.queue.clear();
            inner.pending_msgs = 0;
            inner.pending_bytes = 0;
            if let Some(timer) = inner.timeout_timer.take() {
                timer.stop();
            }
            (
                inner.on_complete.take(),
                inner.js.take(),
                inner.connection_closed,
            )
        };
        if let Some(js) = js {
            crate::jetstream::sub::on_sub_closed(js, conn_closed);
        }
        self.state.cv.notify_all();
        if let Some(cb) = on_complete {
            crate::events::post(move || cb());
        }
    }

    /// Arms or re-arms the inactivity timer for callback subscriptions.
    pub(crate) fn arm_timeout(&self) {
        let mut inner = self.state.mu.lock().unwrap();
        let Some(timeout) = inner.timeout else { return };
        match &inner.timeout_timer {
            Some(timer) => timer.reset(timeout),
            None => {
                let weak = Arc::downgrade(&self.state);
                let timer = Timer::start(timeout, Some(timeout), move || {
                    if let Some(state) = weak.upgrade() {
                        state.push_item_locked(ItemKind::Timeout);
                    }
                });
                inner.timeout_timer = Some(timer);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.state.mu.lock().unwrap();
        f.debug_struct("Subscription")
            .field("sid", &self.state.id())
            .field("subject", &*self.state.subject.lock().unwrap())
            .field("queue_group", &self.state.queue_group)
            .field("pending_msgs", &inner.pending_msgs)
            .field("delivered", &inner.delivered)
            .field("closed", &inner.closed)
            .finish()
    }
}
