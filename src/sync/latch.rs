//! One-shot countdown latch with an optional watchdog.

use super::lock;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A latch released once `count_down` has been called `count` times.
///
/// The latch is one-shot: once the count reaches zero it stays released.
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    released: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            released: Condvar::new(),
        }
    }

    /// Decrement the count, waking waiters when it reaches zero.
    ///
    /// Returns false if the latch was already released.
    pub fn count_down(&self) -> bool {
        let mut count = lock(&self.count);
        if *count == 0 {
            tracing::warn!("count_down on a released latch");
            return false;
        }
        *count -= 1;
        if *count == 0 {
            self.released.notify_all();
        }
        true
    }

    pub fn count(&self) -> usize {
        *lock(&self.count)
    }

    pub fn is_released(&self) -> bool {
        self.count() == 0
    }

    /// Block until released.
    pub fn wait(&self) {
        let mut count = lock(&self.count);
        while *count > 0 {
            count = self
                .released
                .wait(count)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until released or `timeout` elapses. Returns true if released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = lock(&self.count);
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .released
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            count = guard;
        }
        true
    }

    /// Block until released, running `on_timeout` once if the latch is still
    /// held after `watchdog`.
    ///
    /// The watchdog never unblocks the caller; it only surfaces the stall.
    /// Returns true if the watchdog fired.
    pub fn wait_with_watchdog<F>(&self, watchdog: Option<Duration>, on_timeout: F) -> bool
    where
        F: FnOnce(),
    {
        let Some(watchdog) = watchdog else {
            self.wait();
            return false;
        };

        if self.wait_timeout(watchdog) {
            return false;
        }

        // Callback runs without the latch lock held so it may inspect state
        // that itself counts the latch down.
        on_timeout();
        self.wait();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_zero_count_is_released() {
        let latch = CountDownLatch::new(0);
        assert!(latch.is_released());
        latch.wait();
        assert!(!latch.count_down());
    }

    #[test]
    fn test_count_down_releases_waiter() {
        let latch = Arc::new(CountDownLatch::new(3));
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait())
        };
        for _ in 0..3 {
            assert!(latch.count_down());
        }
        waiter.join().unwrap();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let latch = CountDownLatch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_watchdog_not_fired_when_released_in_time() {
        let latch = CountDownLatch::new(1);
        latch.count_down();
        let fired = latch.wait_with_watchdog(Some(Duration::from_millis(10)), || {
            panic!("watchdog must not fire");
        });
        assert!(!fired);
    }

    #[test]
    fn test_watchdog_fires_once_and_keeps_waiting() {
        let latch = Arc::new(CountDownLatch::new(1));
        let fired = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let latch = latch.clone();
            let fired = fired.clone();
            thread::spawn(move || {
                latch.wait_with_watchdog(Some(Duration::from_millis(20)), || {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            })
        };

        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!waiter.is_finished());

        latch.count_down();
        assert!(waiter.join().unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
