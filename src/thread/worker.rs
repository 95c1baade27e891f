//! Worker thread wrapper.
//!
//! A `WorkerThread` owns one OS thread running a fixed loop around its
//! [`WaitHub`]:
//!
//! 1. `on_thread_start` once.
//! 2. Wait for a [`Wake`].
//! 3. `Stop` runs `on_thread_stop` and leaves the loop; callbacks, idle
//!    callbacks and dry-run drains are handled inline; `Data` runs the body's
//!    single processing step.
//! 4. Registered status callbacks are told whether the thread is idle.
//!
//! Ad-hoc callbacks travel over a crossbeam channel; the hub only carries
//! the bit that says the channel is non-empty.

use super::hub::WaitHub;
use super::signal::{Signal, Wake};
use crate::error::{PipeError, Result};
use crate::sync::{lock, NotifyCallback, StatusCallback};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// The part of a worker that differs per thread.
pub trait ThreadBody: Send + 'static {
    fn on_thread_start(&mut self) -> bool {
        true
    }

    fn on_thread_stop(&mut self) -> bool {
        true
    }

    /// One processing step, called when input data is queued.
    fn on_thread_loop(&mut self) -> bool;
}

struct WorkerShared {
    name: String,
    hub: Arc<WaitHub>,
    callback_tx: Sender<Arc<dyn NotifyCallback>>,
    callback_rx: Receiver<Arc<dyn NotifyCallback>>,
    idle_callbacks: Mutex<VecDeque<Arc<dyn NotifyCallback>>>,
    status_callbacks: Mutex<Vec<Arc<dyn StatusCallback>>>,
}

impl WorkerShared {
    fn process_callbacks(&self) {
        for cb in self.callback_rx.try_iter() {
            if !cb.on_notify() {
                tracing::debug!(thread = %self.name, "Callback reported failure");
            }
        }
    }

    fn process_idle_callback(&self) {
        let cb = {
            let mut idle = lock(&self.idle_callbacks);
            let cb = idle.pop_front();
            if idle.is_empty() {
                self.hub.reset_signal(Signal::IdleCallback);
            }
            cb
        };
        if let Some(cb) = cb {
            if !cb.on_notify() {
                tracing::debug!(thread = %self.name, "Idle callback reported failure");
            }
        }
    }

    fn process_status_callbacks(&self) {
        let pending: Vec<_> = lock(&self.status_callbacks).clone();
        if pending.is_empty() {
            return;
        }
        let idle = self.hub.is_idle();
        let done: Vec<_> = pending.iter().filter(|cb| cb.on_update(idle)).cloned().collect();
        if !done.is_empty() {
            lock(&self.status_callbacks).retain(|cb| !done.iter().any(|d| Arc::ptr_eq(d, cb)));
        }
    }
}

fn run_loop<B: ThreadBody>(shared: Arc<WorkerShared>, mut body: B) {
    tracing::debug!(thread = %shared.name, "Worker thread started");
    if !body.on_thread_start() {
        tracing::error!(thread = %shared.name, "on_thread_start failed, leaving loop");
        return;
    }

    loop {
        let wake = shared.hub.wait_signal();
        tracing::trace!(thread = %shared.name, wake = wake.name(), "Woke");
        if wake != Wake::Stop {
            shared.hub.set_busy(true);
        }
        match wake {
            Wake::Stop => {
                if !body.on_thread_stop() {
                    tracing::warn!(thread = %shared.name, "on_thread_stop failed");
                }
                break;
            }
            Wake::Callback => shared.process_callbacks(),
            Wake::IdleCallback => shared.process_idle_callback(),
            Wake::DryRun => {
                let dropped = shared.hub.flush_queues();
                if dropped > 0 {
                    tracing::debug!(thread = %shared.name, dropped, "Dry run drained queues");
                }
            }
            Wake::SyncCheck => {}
            Wake::Data => {
                if !body.on_thread_loop() {
                    tracing::trace!(thread = %shared.name, "on_thread_loop returned false");
                }
            }
        }
        shared.hub.set_busy(false);
        shared.process_status_callbacks();
    }

    tracing::debug!(thread = %shared.name, "Worker thread stopped");
}

/// One OS thread plus its hub, callbacks and external dependency counter.
pub struct WorkerThread {
    shared: Arc<WorkerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerThread {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (callback_tx, callback_rx) = unbounded();
        Self {
            shared: Arc::new(WorkerShared {
                hub: WaitHub::new(name.clone()),
                name,
                callback_tx,
                callback_rx,
                idle_callbacks: Mutex::new(VecDeque::new()),
                status_callbacks: Mutex::new(Vec::new()),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn hub(&self) -> &Arc<WaitHub> {
        &self.shared.hub
    }

    pub fn is_running(&self) -> bool {
        lock(&self.handle).is_some()
    }

    /// Spawn the thread. Fails if it is already running.
    pub fn start<B: ThreadBody>(&self, body: B) -> Result<()> {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            return Err(PipeError::NodeLifecycle {
                node: self.shared.name.clone(),
                phase: "start an already running thread",
            });
        }

        self.shared.hub.reset_signal(Signal::Stop);
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || run_loop(shared, body))?;
        *handle = Some(spawned);
        Ok(())
    }

    /// Signal stop and join. Fails if the thread is not running.
    pub fn stop(&self) -> Result<()> {
        let Some(handle) = lock(&self.handle).take() else {
            return Err(PipeError::NodeLifecycle {
                node: self.shared.name.clone(),
                phase: "stop a thread that is not running",
            });
        };

        self.shared.hub.trigger_signal(Signal::Stop);
        handle.join().map_err(|_| PipeError::NodeLifecycle {
            node: self.shared.name.clone(),
            phase: "join (thread panicked)",
        })
    }

    /// Run `cb` on the worker thread at its next wake.
    pub fn insert_cb(&self, cb: Arc<dyn NotifyCallback>) {
        if self.shared.callback_tx.send(cb).is_err() {
            tracing::error!(thread = %self.shared.name, "Callback channel closed");
            return;
        }
        self.shared.hub.trigger_signal(Signal::Callback);
    }

    /// Run `cb` on the worker thread the next time it is idle.
    pub fn insert_idle_cb(&self, cb: Arc<dyn NotifyCallback>) {
        let mut idle = lock(&self.shared.idle_callbacks);
        idle.push_back(cb);
        self.shared.hub.trigger_signal(Signal::IdleCallback);
    }

    /// Register a status callback and ask the thread for a fresh report.
    pub fn register_status_cb(&self, cb: Arc<dyn StatusCallback>) {
        lock(&self.shared.status_callbacks).push(cb);
        self.shared.hub.trigger_signal(Signal::SyncBreak);
    }

    pub fn pending_status_callbacks(&self) -> usize {
        lock(&self.shared.status_callbacks).len()
    }

    pub fn inc_ext_thread_dependency(&self) -> usize {
        self.shared.hub.inc_ext_dependency()
    }

    pub fn dec_ext_thread_dependency(&self) -> bool {
        self.shared.hub.dec_ext_dependency()
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::warn!(thread = %self.shared.name, "Worker dropped while running, stopping");
            let _ = self.stop();
        }
    }
}
