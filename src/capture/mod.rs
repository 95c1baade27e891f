//! Capture feature pipe built on the generic graph.
//!
//! - [`ids`]: node, type, path, feature and metadata identifiers
//! - [`inference`]: per-request dependency inference
//! - [`request`]: the request record that travels the graph
//! - [`node`] and [`root`]: graph handlers
//! - [`pipe`]: the owning facade
//! - [`stage`]: simulated processors

pub mod ids;
pub mod inference;
pub mod node;
pub mod pipe;
pub mod request;
pub mod root;
pub mod stage;

pub use ids::{
    find_path, BufferId, FeatureId, FeatureSet, MetadataId, MetadataSet, NodeId, NodeSet, ParamId,
    PathId, PathSet, SizeId, TypeId, TypeSet,
};
pub use inference::{CaptureFeatureInferenceData, DataItem, DstData, NodeIo, SrcData};
pub use node::{CaptureLink, CaptureNode, CaptureProcessor, Completion};
pub use pipe::{CaptureFeaturePipe, RequestCallback};
pub use request::{
    BufferItem, CaptureFeatureRequest, Direction, LeakReport, Metadata, MetadataHandle,
    NodeRequest, RequestPtr, RequestState,
};
pub use root::RootNode;
pub use stage::{standard_stages, SimulatedStage};
