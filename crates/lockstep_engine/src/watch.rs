//! Debouncing for file-change notifications.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct DebounceState {
    window: Duration,
    deadline: Mutex<Option<Instant>>,
    wakeup: Condvar,
    stopped: AtomicBool,
}

/// A cheap handle that feeds notifications into a [`Debouncer`].
///
/// Handed to storage watchers, which may call it from their own threads.
#[derive(Clone)]
pub struct DebounceHandle {
    state: Arc<DebounceState>,
}

impl DebounceHandle {
    /// Records a notification, restarting the quiet-period timer.
    pub fn notify(&self) {
        *self.state.deadline.lock() = Some(Instant::now() + self.state.window);
        self.state.wakeup.notify_one();
    }
}

/// Coalesces bursts of notifications into single handler invocations.
///
/// Every [`notify`](DebounceHandle::notify) restarts a quiet-period timer
/// of the configured window; the handler fires once when the timer
/// expires. N notifications inside one window therefore produce exactly
/// one invocation.
pub struct Debouncer {
    state: Arc<DebounceState>,
    thread: Option<JoinHandle<()>>,
}

impl Debouncer {
    /// Creates a debouncer with the given quiet window and handler.
    #[must_use]
    pub fn new(window: Duration, handler: Box<dyn Fn() + Send + Sync>) -> Self {
        let state = Arc::new(DebounceState {
            window,
            deadline: Mutex::new(None),
            wakeup: Condvar::new(),
            stopped: AtomicBool::new(false),
        });

        let worker_state = Arc::clone(&state);
        let thread = std::thread::spawn(move || {
            let mut deadline = worker_state.deadline.lock();
            loop {
                if worker_state.stopped.load(Ordering::SeqCst) {
                    break;
                }
                match *deadline {
                    None => {
                        worker_state.wakeup.wait(&mut deadline);
                    }
                    Some(at) => {
                        if Instant::now() >= at {
                            *deadline = None;
                            drop(deadline);
                            handler();
                            deadline = worker_state.deadline.lock();
                        } else {
                            let _ = worker_state.wakeup.wait_until(&mut deadline, at);
                        }
                    }
                }
            }
        });

        Self {
            state,
            thread: Some(thread),
        }
    }

    /// Returns a handle for feeding notifications in.
    #[must_use]
    pub fn handle(&self) -> DebounceHandle {
        DebounceHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Stops the worker. Further notifications are ignored.
    pub fn stop(&mut self) {
        self.state.stopped.store(true, Ordering::SeqCst);
        self.state.wakeup.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn burst_coalesces_to_one() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let debouncer = Debouncer::new(
            Duration::from_millis(50),
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let handle = debouncer.handle();
        for _ in 0..10 {
            handle.notify();
            std::thread::sleep(Duration::from_millis(2));
        }

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn separated_bursts_fire_separately() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let debouncer = Debouncer::new(
            Duration::from_millis(20),
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let handle = debouncer.handle();
        handle.notify();
        std::thread::sleep(Duration::from_millis(100));
        handle.notify();
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_notify_no_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let _debouncer = Debouncer::new(
            Duration::from_millis(10),
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut debouncer = Debouncer::new(Duration::from_millis(10), Box::new(|| {}));
        debouncer.stop();
        debouncer.stop();
    }
}
