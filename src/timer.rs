//! Process-wide timer wheel.
//!
//! A single timer thread owns the set of scheduled timers and fires their
//! callbacks sequentially. Callbacks must not block indefinitely. Timers
//! support reset while pending, reset from inside their own callback, and
//! stop with a one-shot stop handler. When a timer is stopped from inside
//! its callback the stop handler runs after the callback returns; a reset
//! from inside the callback keeps the timer alive and defers the stop
//! handler to the next external stop.

use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnMut() + Send + 'static>;
type StopCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerState {
    deadline: Instant,
    interval: Option<Duration>,
    active: bool,
    stopped: bool,
    in_callback: bool,
    reset_in_callback: bool,
    cb: Option<Callback>,
    stop_cb: Option<StopCallback>,
}

pub(crate) struct TimerInner {
    state: Mutex<TimerState>,
}

/// Handle to a scheduled timer. Dropping the handle stops the timer
/// without running its stop handler.
pub(crate) struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Schedules a timer that fires after `delay` and then, if `interval`
    /// is set, repeatedly at that interval until stopped.
    pub fn start<F>(delay: Duration, interval: Option<Duration>, cb: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        Self::start_with_stop(delay, interval, cb, None)
    }

    pub fn start_with_stop<F>(
        delay: Duration,
        interval: Option<Duration>,
        cb: F,
        stop_cb: Option<StopCallback>,
    ) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                deadline: Instant::now() + delay,
                interval,
                active: true,
                stopped: false,
                in_callback: false,
                reset_in_callback: false,
                cb: Some(Box::new(cb)),
                stop_cb,
            }),
        });
        wheel().register(Arc::downgrade(&inner));
        Timer { inner }
    }

    /// Re-arms the timer to fire `delay` from now. Legal while pending,
    /// while stopped, and from inside the timer's own callback.
    pub fn reset(&self, delay: Duration) {
        {
            let mut st = self.inner.state.lock().unwrap();
            st.deadline = Instant::now() + delay;
            st.active = true;
            st.stopped = false;
            if st.in_callback {
                st.reset_in_callback = true;
            }
        }
        wheel().kick();
    }

    /// Stops the timer. The stop handler, if any, runs exactly once: here
    /// when called outside the callback, or after the in-flight callback
    /// returns when called from inside it.
    pub fn stop(&self) {
        let fire = {
            let mut st = self.inner.state.lock().unwrap();
            st.stopped = true;
            st.active = false;
            if st.in_callback {
                None
            } else {
                st.stop_cb.take()
            }
        };
        if let Some(cb) = fire {
            cb();
        }
        wheel().kick();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let mut st = self.inner.state.lock().unwrap();
        st.stopped = true;
        st.active = false;
        st.stop_cb = None;
        st.cb = None;
    }
}

struct Wheel {
    timers: Mutex<Vec<Weak<TimerInner>>>,
    cv: Condvar,
}

fn wheel() -> &'static Wheel {
    static WHEEL: OnceLock<&'static Wheel> = OnceLock::new();
    WHEEL.get_or_init(|| {
        let wheel: &'static Wheel = Box::leak(Box::new(Wheel {
            timers: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        }));
        std::thread::Builder::new()
            .name("weft-timer".to_string())
            .spawn(move || wheel.run())
            .expect("spawn timer thread");
        wheel
    })
}

impl Wheel {
    fn register(&self, timer: Weak<TimerInner>) {
        self.timers.lock().unwrap().push(timer);
        self.cv.notify_one();
    }

    fn kick(&self) {
        self.cv.notify_one();
    }

    fn run(&self) {
        let mut list = self.timers.lock().unwrap();
        loop {
            list.retain(|w| w.upgrade().is_some());

            let now = Instant::now();
            let mut due: Option<Arc<TimerInner>> = None;
            let mut nearest: Option<Instant> = None;
            for weak in list.iter() {
                let Some(timer) = weak.upgrade() else { continue };
                let st = timer.state.lock().unwrap();
                if !st.active || st.in_callback {
                    continue;
                }
                if st.deadline <= now {
                    drop(st);
                    due = Some(timer);
                    break;
                }
                nearest = Some(match nearest {
                    Some(n) if n <= st.deadline => n,
                    _ => st.deadline,
                });
            }

            if let Some(timer) = due {
                drop(list);
                self.fire(&timer);
                list = self.timers.lock().unwrap();
                continue;
            }

            list = match nearest {
                Some(at) => {
                    let wait = at.saturating_duration_since(Instant::now());
                    self.cv.wait_timeout(list, wait).unwrap().0
                }
                None => self.cv.wait_timeout(list, Duration::from_secs(1)).unwrap().0,
            };
        }
    }

    fn fire(&self, timer: &Arc<TimerInner>) {
        let mut cb = {
            let mut st = timer.state.lock().unwrap();
            if !st.active || st.stopped {
                return;
            }
            st.in_callback = true;
            st.reset_in_callback = false;
            match st.cb.take() {
                Some(cb) => cb,
                None => {
                    st.in_callback = false;
                    return;
                }
            }
        };

        cb();

        let stop_fire = {
            let mut st = timer.state.lock().unwrap();
            st.cb = Some(cb);
            st.in_callback = false;
            if st.stopped {
                st.active = false;
                st.stop_cb.take()
            } else if st.reset_in_callback {
                // Callback re-armed the timer itself.
                None
            } else if let Some(interval) = st.interval {
                st.deadline = Instant::now() + interval;
                None
            } else {
                st.active = false;
                None
            }
        };
        if let Some(stop_cb) = stop_fire {
            stop_cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_periodically_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let timer = Timer::start(
            Duration::from_millis(5),
            Some(Duration::from_millis(5)),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        std::thread::sleep(Duration::from_millis(80));
        timer.stop();
        let n = count.load(Ordering::SeqCst);
        assert!(n >= 3, "expected several firings, got {n}");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), n, "no firings after stop");
    }

    #[test]
    fn one_shot_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _timer = Timer::start(Duration::from_millis(5), None, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_postpones_firing() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let timer = Timer::start(Duration::from_millis(30), None, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(15));
        timer.reset(Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(count.load(Ordering::SeqCst), 0, "reset must postpone");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_handler_runs_exactly_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&stops);
        let timer = Timer::start_with_stop(
            Duration::from_millis(500),
            None,
            || {},
            Some(Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })),
        );
        timer.stop();
        timer.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_from_inside_callback_defers_stop_handler() {
        let stops = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&stops);
        let slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let timer = Timer::start_with_stop(
            Duration::from_millis(5),
            Some(Duration::from_millis(5)),
            move || {
                if let Some(t) = slot2.lock().unwrap().as_ref() {
                    t.stop();
                }
            },
            Some(Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })),
        );
        // The callback stops the timer through this shared slot.
        let inner = Arc::clone(&timer.inner);
        *slot.lock().unwrap() = Some(Timer { inner });
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        // Keep the clone alive past the assertion.
        drop(slot.lock().unwrap().take());
    }

    #[test]
    fn reset_from_inside_callback_keeps_timer_alive() {
        let count = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let s = Arc::clone(&stops);
        let slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let timer = Timer::start_with_stop(
            Duration::from_millis(5),
            None,
            move || {
                // One-shot timer that re-arms itself from its callback.
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    if let Some(t) = slot2.lock().unwrap().as_ref() {
                        t.reset(Duration::from_millis(5));
                    }
                }
            },
            Some(Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let inner = Arc::clone(&timer.inner);
        *slot.lock().unwrap() = Some(Timer { inner });
        std::thread::sleep(Duration::from_millis(80));
        assert!(count.load(Ordering::SeqCst) >= 4);
        assert_eq!(stops.load(Ordering::SeqCst), 0, "stop handler deferred");
        timer.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        drop(slot.lock().unwrap().take());
    }
}
