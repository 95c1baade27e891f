//! Callback interfaces posted to worker threads.

use super::CountDownLatch;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An ad-hoc callback run on a worker thread.
///
/// Returning false is logged by the worker and otherwise ignored.
pub trait NotifyCallback: Send + Sync {
    fn on_notify(&self) -> bool;
}

impl<F> NotifyCallback for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn on_notify(&self) -> bool {
        self()
    }
}

/// Receives a worker's idle status after every loop iteration.
///
/// Returns true once the callback is satisfied and should be removed.
pub trait StatusCallback: Send + Sync {
    fn on_update(&self, idle: bool) -> bool;
}

/// Counts a shared latch down the first time its worker reports idle.
pub struct IdleLatchCallback {
    latch: Arc<CountDownLatch>,
    counted: AtomicBool,
}

impl IdleLatchCallback {
    pub fn new(latch: Arc<CountDownLatch>) -> Self {
        Self {
            latch,
            counted: AtomicBool::new(false),
        }
    }
}

impl StatusCallback for IdleLatchCallback {
    fn on_update(&self, idle: bool) -> bool {
        if !idle {
            return false;
        }
        if !self.counted.swap(true, Ordering::AcqRel) {
            self.latch.count_down();
        }
        true
    }
}
