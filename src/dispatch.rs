//! Message dispatchers.
//!
//! Two worker variants share one delivery loop: a dedicated worker bound
//! to a single subscription (waiting on the subscription's own queue and
//! condition), and shared pool workers multiplexing many subscriptions
//! over one queue each. Control flow travels through the same FIFO as
//! user messages as tagged items, which keeps per-subscription ordering
//! strict in both variants.
//!
//! Pool workers are assigned round-robin at subscribe time. The pool size
//! comes from `NATS_THREAD_POOL_MAX` and defaults to 1.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use log::warn;

use crate::error::Error;
use crate::message::Message;
use crate::subscription::{SubState, Subscription};

/// One slot in a delivery FIFO.
pub(crate) enum ItemKind {
    User(Message),
    /// Cooperative drain marker: release the subscription from routing,
    /// then schedule `Close`.
    Drain,
    /// Terminal marker: run completion callbacks and close.
    Close,
    /// Inactivity timeout tick.
    Timeout,
    /// A pull fetch missed its idle heartbeats.
    FetchMissedHeartbeat,
    /// A pull fetch ran past its overall deadline.
    FetchExpired,
}

struct WorkItem {
    sub: Arc<SubState>,
    kind: ItemKind,
}

struct DQueue {
    items: VecDeque<WorkItem>,
    msgs: u64,
    bytes: u64,
    shutdown: bool,
}

/// A shared-pool dispatcher: one queue, one worker thread.
pub(crate) struct Dispatcher {
    mu: Mutex<DQueue>,
    cv: Condvar,
}

impl Dispatcher {
    fn spawn(index: usize) -> Arc<Dispatcher> {
        let dispatcher = Arc::new(Dispatcher {
            mu: Mutex::new(DQueue {
                items: VecDeque::new(),
                msgs: 0,
                bytes: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let worker = Arc::clone(&dispatcher);
        std::thread::Builder::new()
            .name(format!("weft-dispatch-{index}"))
            .spawn(move || worker.run())
            .expect("spawn dispatcher thread");
        dispatcher
    }

    /// Appends an item. Callers hold the subscription lock, never the
    /// queue lock; lock order is subscription then dispatcher.
    pub(crate) fn enqueue(&self, sub: Arc<SubState>, kind: ItemKind) {
        let mut q = self.mu.lock().unwrap();
        if q.shutdown {
            return;
        }
        if let ItemKind::User(msg) = &kind {
            q.msgs += 1;
            q.bytes += msg.wire_len() as u64;
        }
        let was_empty = q.items.is_empty();
        q.items.push_back(WorkItem { sub, kind });
        drop(q);
        if was_empty {
            self.cv.notify_one();
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            let item = {
                let mut q = self.mu.lock().unwrap();
                loop {
                    if let Some(item) = q.items.pop_front() {
                        if let ItemKind::User(msg) = &item.kind {
                            q.msgs -= 1;
                            q.bytes -= msg.wire_len() as u64;
                        }
                        break item;
                    }
                    if q.shutdown {
                        return;
                    }
                    q = self.cv.wait(q).unwrap();
                }
            };
            process_item(&item.sub, item.kind);
        }
    }
}

fn pool() -> &'static Pool {
    static POOL: OnceLock<Pool> = OnceLock::new();
    POOL.get_or_init(|| {
        let size = std::env::var("NATS_THREAD_POOL_MAX")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&n| n >= 1)
            .unwrap_or(1);
        Pool {
            dispatchers: (0..size).map(Dispatcher::spawn).collect(),
            next: AtomicUsize::new(0),
        }
    })
}

struct Pool {
    dispatchers: Vec<Arc<Dispatcher>>,
    next: AtomicUsize,
}

/// Round-robin assignment of a shared-pool dispatcher.
pub(crate) fn assign_pool_dispatcher() -> Arc<Dispatcher> {
    let pool = pool();
    let idx = pool.next.fetch_add(1, Ordering::Relaxed) % pool.dispatchers.len();
    Arc::clone(&pool.dispatchers[idx])
}

/// Spawns the worker for a dedicated-dispatcher subscription.
pub(crate) fn spawn_dedicated(sub: Arc<SubState>) {
    std::thread::Builder::new()
        .name(format!("weft-sub-{}", sub.id()))
        .spawn(move || loop {
            let item = {
                let mut inner = sub.mu.lock().unwrap();
                loop {
                    if let Some(item) = inner.queue.pop_front() {
                        break item;
                    }
                    if inner.closed {
                        return;
                    }
                    inner = sub.cv.wait(inner).unwrap();
                }
            };
            process_item(&sub, item);
        })
        .expect("spawn dedicated dispatcher thread");
}

/// The delivery loop body shared by both worker variants.
pub(crate) fn process_item(sub: &Arc<SubState>, kind: ItemKind) {
    match kind {
        ItemKind::Drain => {
            Subscription::new(Arc::clone(sub)).release_from_connection();
            sub.push_item_locked(ItemKind::Close);
        }
        ItemKind::Close => {
            crate::jetstream::sub::on_close_item(sub);
            let handle = Subscription::new(Arc::clone(sub));
            let draining = sub.mu.lock().unwrap().draining;
            if draining {
                handle.finish_drain();
            } else {
                handle.finish_close();
            }
        }
        ItemKind::Timeout => {
            let closed = sub.mu.lock().unwrap().closed;
            if !closed {
                sub.post_error(Error::Timeout);
            }
        }
        ItemKind::FetchMissedHeartbeat => {
            crate::jetstream::sub::on_fetch_missed_heartbeat(sub);
        }
        ItemKind::FetchExpired => {
            crate::jetstream::sub::on_fetch_expired(sub);
        }
        ItemKind::User(msg) => process_user_msg(sub, msg),
    }
}

fn process_user_msg(sub: &Arc<SubState>, msg: Message) {
    use crate::jetstream::sub::{self as js, PreAction};

    let mut inner = sub.mu.lock().unwrap();
    if inner.closed {
        return;
    }
    inner.pending_msgs = inner.pending_msgs.saturating_sub(1);
    inner.pending_bytes = inner.pending_bytes.saturating_sub(msg.wire_len());
    sub.clear_slow_consumer(&mut inner);

    // Persistent-stream classification: control statuses, fetch
    // bookkeeping, ordered-consumer sequence checks.
    let pre = if inner.js.is_some() {
        js::pre_deliver(sub, &mut inner, &msg)
    } else {
        PreAction::deliver()
    };

    match pre {
        PreAction::Skip => return,
        PreAction::Terminal => {
            drop(inner);
            let _ = Subscription::new(Arc::clone(sub)).unsubscribe();
        }
        PreAction::Deliver {
            last_in_fetch,
            want_more,
        } => {
            inner.delivered += 1;
            let delivered = inner.delivered;
            let over_limit = inner
                .max_deliveries
                .map(|max| delivered > max)
                .unwrap_or(false);
            let last_in_sub = inner
                .max_deliveries
                .map(|max| delivered == max)
                .unwrap_or(false);
            let draining = inner.draining;
            let has_timeout = inner.timeout.is_some();
            let mut cb = inner.cb.take();
            drop(inner);

            if want_more && !draining && !last_in_fetch {
                js::maybe_fetch_more(sub);
            }

            if !over_limit {
                if let Some(f) = cb.as_mut() {
                    let result = catch_unwind(AssertUnwindSafe(|| f(msg)));
                    if result.is_err() {
                        warn!(
                            "message callback panicked on subscription {}",
                            sub.id()
                        );
                    }
                }
            }

            js::check_flow_control(sub);

            {
                let mut inner = sub.mu.lock().unwrap();
                if inner.cb.is_none() {
                    inner.cb = cb;
                }
            }

            if has_timeout {
                Subscription::new(Arc::clone(sub)).arm_timeout();
            }

            if last_in_fetch {
                js::complete_fetch_ok(sub);
            }
            if last_in_sub {
                let handle = Subscription::new(Arc::clone(sub));
                handle.release_from_connection();
                handle.finish_close();
            }
        }
    }
}
