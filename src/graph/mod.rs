//! Generic node graph: threaded nodes, typed edges and graph-wide barriers.

pub mod executor;
pub mod node;
pub mod sequence;

pub use executor::{DiagnosticHook, Graph, GraphStage};
pub use node::{ConnectionKind, DataId, GraphNode, NodeHandler, NodeLink, NodeStatus, Payload};
pub use sequence::SequenceRestorer;
