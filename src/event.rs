use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A single-consumer handoff with a persistent signal.
///
/// Unlike a bare condition variable, a [`signal`](Event::signal) sent before
/// anyone waits is not lost: the flag stays set until a
/// [`block`](Event::block) or [`peek`](Event::peek) consumes it. Signals do not
/// accumulate; two signals before one block collapse into one.
///
/// Only one thread may wait on an `Event` at a time.
#[derive(Debug, Default)]
pub struct Event {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake the waiter, if any.
    pub fn signal(&self) {
        let mut ready = self.lock();
        *ready = true;
        self.cond.notify_one();
    }

    /// Wait until signaled, then clear the flag.
    pub fn block(&self) {
        let mut ready = self.lock();
        while !*ready {
            ready = self
                .cond
                .wait(ready)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *ready = false;
    }

    /// Like [`block`](Event::block) but gives up after `timeout`.
    /// Returns `true` if the signal was consumed.
    pub fn block_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.lock();
        while !*ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(ready, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            ready = guard;
        }
        *ready = false;
        true
    }

    /// Consume the signal if it is set, without waiting.
    pub fn peek(&self) -> bool {
        let mut ready = self.lock();
        std::mem::replace(&mut *ready, false)
    }

    /// Drop any pending signal.
    pub fn clear(&self) {
        *self.lock() = false;
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // The flag is a plain bool, so a panic elsewhere cannot leave it torn.
        self.ready.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Session-wide cooperative cancellation token.
///
/// Threads check it at the top of every loop iteration and exit when it is set.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in short slices, returning early on shutdown.
    /// Returns `true` if shutdown was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let slice = Duration::from_millis(10);
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(slice.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn signal_before_block_is_kept() {
        let event = Event::new();
        event.signal();
        event.block();
        assert!(!event.peek());
    }

    #[test]
    fn peek_consumes() {
        let event = Event::new();
        assert!(!event.peek());
        event.signal();
        assert!(event.peek());
        assert!(!event.peek());
    }

    #[test]
    fn double_signal_double_block_does_not_hang() {
        let event = Arc::new(Event::new());
        event.signal();
        event.signal();
        event.block();

        // The second block waits for a second signal and returns once it comes.
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                event.block();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        event.signal();
        rx.recv_timeout(Duration::from_secs(5)).expect("second block never returned");
        waiter.join().unwrap();
    }

    #[test]
    fn block_timeout_expires_without_signal() {
        let event = Event::new();
        assert!(!event.block_timeout(Duration::from_millis(20)));
        event.signal();
        assert!(event.block_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn ping_pong_between_threads() {
        let ready = Arc::new(Event::new());
        let done = Arc::new(Event::new());
        let worker = {
            let (ready, done) = (Arc::clone(&ready), Arc::clone(&done));
            thread::spawn(move || {
                for _ in 0..100 {
                    ready.signal();
                    done.block();
                }
            })
        };
        for _ in 0..100 {
            ready.block();
            done.signal();
        }
        worker.join().unwrap();
    }

    #[test]
    fn shutdown_interrupts_sleep() {
        let flag = ShutdownFlag::new();
        let other = flag.clone();
        other.request();
        let start = Instant::now();
        assert!(flag.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
