//! Control signals and the wake reasons derived from them.

use crate::id::IdSet;

crate::bounded_id! {
    /// Control bits held by a [`WaitHub`](super::WaitHub).
    pub enum Signal {
        Stop => "stop",
        Callback => "callback",
        Idle => "idle",
        IdleCallback => "idle-callback",
        SyncBreak => "sync-break",
        DryRun => "dry-run",
    }
}

pub type SignalSet = IdSet<Signal>;

/// Why a worker loop woke up. Resolved by the hub in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Leave the loop
    Stop,
    /// Ad-hoc callbacks are pending
    Callback,
    /// Queues must be drained without processing
    DryRun,
    /// The thread is idle and an idle callback is pending
    IdleCallback,
    /// A barrier asked for a fresh idle report
    SyncCheck,
    /// At least one input queue holds data
    Data,
}

impl Wake {
    pub fn name(self) -> &'static str {
        match self {
            Wake::Stop => "stop",
            Wake::Callback => "callback",
            Wake::DryRun => "dry-run",
            Wake::IdleCallback => "idle-callback",
            Wake::SyncCheck => "sync-check",
            Wake::Data => "data",
        }
    }
}

/// Signals that abort a blocking queue wait so the loop can react.
pub(crate) fn interrupts_wait(signals: SignalSet, idle: bool) -> bool {
    signals.contains(Signal::Stop)
        || signals.contains(Signal::Callback)
        || signals.contains(Signal::SyncBreak)
        || signals.contains(Signal::DryRun)
        || (idle && signals.contains(Signal::IdleCallback))
}
