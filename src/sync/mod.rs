//! Synchronization primitives shared by the thread and graph layers.

pub mod latch;
pub mod notify;

pub use latch::CountDownLatch;
pub use notify::{IdleLatchCallback, NotifyCallback, StatusCallback};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
