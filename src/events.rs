//! Asynchronous event delivery.
//!
//! User-visible connection and subscription event callbacks (disconnected,
//! reconnected, closed, discovered servers, async errors) are serialized
//! on one process-wide delivery thread, so no two user callbacks ever run
//! concurrently and none runs on a reader, flusher, or timer thread.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, OnceLock};

use log::warn;

/// Bounded queue limit; past it events are dropped with a warning rather
/// than blocking protocol threads.
const MAX_PENDING_EVENTS: usize = 8192;

type Event = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    items: VecDeque<Event>,
    dropped: u64,
}

struct EventBus {
    mu: Mutex<Queue>,
    cv: Condvar,
}

fn bus() -> &'static EventBus {
    static BUS: OnceLock<&'static EventBus> = OnceLock::new();
    BUS.get_or_init(|| {
        let bus: &'static EventBus = Box::leak(Box::new(EventBus {
            mu: Mutex::new(Queue {
                items: VecDeque::new(),
                dropped: 0,
            }),
            cv: Condvar::new(),
        }));
        std::thread::Builder::new()
            .name("weft-events".to_string())
            .spawn(move || bus.run())
            .expect("spawn event thread");
        bus
    })
}

impl EventBus {
    fn run(&self) {
        loop {
            let event = {
                let mut q = self.mu.lock().unwrap();
                loop {
                    if let Some(event) = q.items.pop_front() {
                        break event;
                    }
                    q = self.cv.wait(q).unwrap();
                }
            };
            event();
        }
    }
}

/// Enqueues a user callback for serialized delivery.
pub(crate) fn post(event: impl FnOnce() + Send + 'static) {
    let bus = bus();
    let mut q = bus.mu.lock().unwrap();
    if q.items.len() >= MAX_PENDING_EVENTS {
        q.dropped += 1;
        let dropped = q.dropped;
        drop(q);
        warn!("event queue full, dropped {dropped} callbacks");
        return;
    }
    q.items.push_back(Box::new(event));
    drop(q);
    bus.cv.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn events_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            let done = Arc::clone(&done);
            post(move || {
                seen.lock().unwrap().push(i);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while done.load(Ordering::SeqCst) < 100 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }
}
