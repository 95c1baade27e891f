//! Wait/signal hub: the single suspension point of a worker thread.
//!
//! The hub multiplexes the thread's input queues and a set of control
//! signals behind one mutex and condition variable. Every state change
//! (signal set or reset, item enqueued, external dependency moved) notifies
//! all waiters, and every wait re-evaluates its predicate under the lock.

use super::queue::WaitQueue;
use super::signal::{interrupts_wait, Signal, SignalSet, Wake};
use crate::sync::lock;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

struct HubState {
    signals: SignalSet,
    queues: Vec<Arc<dyn WaitQueue>>,
    ext_dependencies: usize,
    busy: bool,
}

impl HubState {
    fn all_ready(&self) -> bool {
        !self.queues.is_empty() && self.queues.iter().all(|q| !q.is_empty())
    }

    fn any_ready(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }

    fn idle(&self) -> bool {
        !self.busy && self.ext_dependencies == 0 && !self.any_ready()
    }

    fn refresh_idle(&mut self) -> bool {
        let idle = self.idle();
        if idle {
            self.signals.insert(Signal::Idle);
        } else {
            self.signals.remove(Signal::Idle);
        }
        idle
    }

    /// Smallest sequence present in every queue.
    fn common_key(&self) -> Option<u32> {
        let (first, rest) = self.queues.split_first()?;
        first
            .keys()
            .into_iter()
            .find(|key| rest.iter().all(|q| q.contains_key(*key)))
    }
}

/// Per-thread multiplexer over input queues and control signals.
pub struct WaitHub {
    name: String,
    state: Mutex<HubState>,
    changed: Condvar,
}

impl WaitHub {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(HubState {
                signals: SignalSet::new(),
                queues: Vec::new(),
                ext_dependencies: 0,
                busy: false,
            }),
            changed: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        lock(&self.state)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, HubState>) -> MutexGuard<'a, HubState> {
        self.changed.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    /// Register an input source. Its pushes will wake this hub.
    pub fn add_wait_queue(self: &Arc<Self>, queue: Arc<dyn WaitQueue>) {
        queue.attach(Arc::downgrade(self));
        tracing::trace!(hub = %self.name, queue = queue.name(), "Wait queue registered");
        self.state().queues.push(queue);
        self.changed.notify_all();
    }

    pub fn trigger_signal(&self, signal: Signal) {
        self.state().signals.insert(signal);
        self.changed.notify_all();
    }

    pub fn reset_signal(&self, signal: Signal) {
        self.state().signals.remove(signal);
        self.changed.notify_all();
    }

    pub fn signals(&self) -> SignalSet {
        self.state().signals
    }

    /// Producer fast path after pushing into a registered queue.
    pub fn signal_enque(&self) {
        self.state().signals.remove(Signal::Idle);
        self.changed.notify_all();
    }

    /// Block until something needs the loop's attention.
    ///
    /// Control signals win over data; one-shot signals (callback, dry-run,
    /// sync-break) are consumed by the wake that reports them.
    pub fn wait_signal(&self) -> Wake {
        let mut st = self.state();
        loop {
            if st.signals.contains(Signal::Stop) {
                return Wake::Stop;
            }
            if st.signals.remove(Signal::Callback) {
                return Wake::Callback;
            }
            if st.signals.remove(Signal::DryRun) {
                return Wake::DryRun;
            }
            let idle = st.refresh_idle();
            if idle && st.signals.contains(Signal::IdleCallback) {
                return Wake::IdleCallback;
            }
            if st.signals.remove(Signal::SyncBreak) {
                return Wake::SyncCheck;
            }
            if st.any_ready() {
                return Wake::Data;
            }
            st = self.wait(st);
        }
    }

    /// Block until every registered queue holds data.
    ///
    /// Returns false if a control signal interrupted the wait.
    pub fn wait_all_queue(&self) -> bool {
        let mut st = self.state();
        loop {
            if interrupts_wait(st.signals, st.idle()) {
                return false;
            }
            if st.all_ready() {
                return true;
            }
            st = self.wait(st);
        }
    }

    /// Block until at least one registered queue holds data.
    pub fn wait_any_queue(&self) -> bool {
        let mut st = self.state();
        loop {
            if interrupts_wait(st.signals, st.idle()) {
                return false;
            }
            if st.any_ready() {
                return true;
            }
            st = self.wait(st);
        }
    }

    /// Block until every queue holds an item with the same sequence and
    /// return that sequence (the smallest such one).
    pub fn wait_all_queue_sync(&self) -> Option<u32> {
        let mut st = self.state();
        loop {
            if interrupts_wait(st.signals, st.idle()) {
                return None;
            }
            if st.all_ready() {
                if let Some(key) = st.common_key() {
                    return Some(key);
                }
            }
            st = self.wait(st);
        }
    }

    /// Not processing, no queued data and no outstanding hand-off.
    pub fn is_idle(&self) -> bool {
        self.state().idle()
    }

    /// Marked by the owning thread around each loop step.
    pub fn set_busy(&self, busy: bool) {
        self.state().busy = busy;
    }

    pub fn queued(&self) -> usize {
        self.state().queues.iter().map(|q| q.len()).sum()
    }

    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }

    /// Drop everything queued, returning the number of dropped items.
    pub fn flush_queues(&self) -> usize {
        let st = self.state();
        let dropped = st.queues.iter().map(|q| q.clear()).sum();
        drop(st);
        self.changed.notify_all();
        dropped
    }

    pub fn inc_ext_dependency(&self) -> usize {
        let mut st = self.state();
        st.ext_dependencies += 1;
        let count = st.ext_dependencies;
        if count == 1 {
            st.signals.insert(Signal::SyncBreak);
        }
        drop(st);
        self.changed.notify_all();
        count
    }

    /// Returns false (and changes nothing) if no dependency was outstanding.
    pub fn dec_ext_dependency(&self) -> bool {
        let mut st = self.state();
        if st.ext_dependencies == 0 {
            drop(st);
            tracing::error!(hub = %self.name, "External dependency count would go negative");
            return false;
        }
        st.ext_dependencies -= 1;
        if st.ext_dependencies == 0 {
            st.signals.insert(Signal::SyncBreak);
        }
        drop(st);
        self.changed.notify_all();
        true
    }

    pub fn ext_dependencies(&self) -> usize {
        self.state().ext_dependencies
    }
}
