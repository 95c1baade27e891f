//! # feature-pipe: threaded capture feature pipeline
//!
//! A capture request enters a graph of processing nodes (raw, ISP, face
//! detection, multi-frame, YUV, MDP) rooted at a single dispatcher. For every
//! request the pipe infers which nodes must run, which paths carry data
//! between them and which buffers flow along each path. Requests then
//! traverse the graph on per-node worker threads, borrowing intermediate
//! buffers from bounded pools, and come back to the root to be reported.
//!
//! ## Architecture
//!
//! - **thread**: worker threads woken by a signal hub over named queues
//! - **graph**: node lifecycle, typed edges, ordered delivery and barriers
//! - **buffer**: blocking buffer pools with shared handles
//! - **capture**: inference, request bookkeeping and the pipe facade
//! - **config** / **logging**: TOML settings and `tracing` setup
//!
//! ## Example
//!
//! ```ignore
//! use feature_pipe::capture::{standard_stages, CaptureFeaturePipe};
//! use feature_pipe::config::PipeConfig;
//!
//! let pipe = CaptureFeaturePipe::new(PipeConfig::default(), callback)?;
//! for (id, stage) in standard_stages(Duration::from_millis(2)) {
//!     pipe.add_node(id, stage)?;
//! }
//! pipe.init()?;
//! pipe.start()?;
//! let seq = pipe.enque(request)?;
//! pipe.sync();
//! ```

pub mod buffer;
pub mod capture;
pub mod config;
pub mod error;
pub mod graph;
pub mod id;
pub mod logging;
pub mod sync;
pub mod thread;

pub use capture::{CaptureFeaturePipe, CaptureFeatureRequest, RequestCallback};
pub use config::PipeConfig;
pub use error::{PipeError, Result};
