//! Worker threads and their wait/signal machinery.

pub mod hub;
pub mod queue;
pub mod signal;
pub mod worker;

pub use hub::WaitHub;
pub use queue::{FifoQueue, InputQueue, PriorityQueue, Sequenced, WaitQueue};
pub use signal::{Signal, SignalSet, Wake};
pub use worker::{ThreadBody, WorkerThread};
