//! The live capture request carried through the graph.
//!
//! A request is built by the caller (sources, targets, metadata, features,
//! parameters), bound by inference, then shared as [`RequestPtr`] between
//! every node it visits. All shrinking bookkeeping goes through
//! `traverse`, `dec_node_reference`, `dec_buffer_ref` and
//! `dec_metadata_ref`; a decrement below zero is refused and logged.
//!
//! Locks: buffers, metadata and traversal are guarded separately and never
//! held together.

use super::ids::{
    find_path, BufferId, FeatureId, FeatureSet, MetadataId, MetadataSet, NodeId, NodeSet, ParamId,
    PathId, PathSet, SizeId, TypeId,
};
use crate::buffer::{BufferProvider, ImageHandle, ImageSpec};
use crate::error::{PipeError, Result};
use crate::sync::lock;
use crate::thread::Sequenced;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub type RequestPtr = Arc<CaptureFeatureRequest>;

/// Key/value metadata attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
    entries: BTreeMap<String, i64>,
}

impl Metadata {
    pub fn set(&mut self, key: impl Into<String>, value: i64) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type MetadataHandle = Arc<Mutex<Metadata>>;

/// Which side of a node a buffer sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    Created,
    Bound,
    Traversing,
    Drained,
}

/// One node's view of the request: its buffer maps and metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    node: NodeId,
    inputs: [Option<BufferId>; TypeId::COUNT],
    outputs: [Option<BufferId>; TypeId::COUNT],
    metadata: MetadataSet,
}

impl NodeRequest {
    pub(crate) fn new(node: NodeId, metadata: MetadataSet) -> Self {
        Self {
            node,
            inputs: [None; TypeId::COUNT],
            outputs: [None; TypeId::COUNT],
            metadata,
        }
    }

    pub(crate) fn set_input(&mut self, type_id: TypeId, bid: BufferId) {
        self.inputs[type_id.index()] = Some(bid);
    }

    pub(crate) fn set_output(&mut self, type_id: TypeId, bid: BufferId) {
        self.outputs[type_id.index()] = Some(bid);
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn map_buffer_id(&self, type_id: TypeId, direction: Direction) -> Option<BufferId> {
        match direction {
            Direction::Input => self.inputs[type_id.index()],
            Direction::Output => self.outputs[type_id.index()],
        }
    }

    pub fn has_metadata(&self, id: MetadataId) -> bool {
        self.metadata.contains(id)
    }

    pub fn metadata(&self) -> MetadataSet {
        self.metadata
    }

    pub fn inputs(&self) -> impl Iterator<Item = (TypeId, BufferId)> + '_ {
        TypeId::ALL
            .iter()
            .filter_map(|&t| self.inputs[t.index()].map(|bid| (t, bid)))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (TypeId, BufferId)> + '_ {
        TypeId::ALL
            .iter()
            .filter_map(|&t| self.outputs[t.index()].map(|bid| (t, bid)))
    }

    pub fn touches(&self, bid: BufferId) -> bool {
        self.inputs.contains(&Some(bid)) || self.outputs.contains(&Some(bid))
    }

    /// Each buffer the node touches, once.
    pub fn buffers(&self) -> Vec<BufferId> {
        let mut bids: Vec<BufferId> = self.inputs.iter().chain(self.outputs.iter()).flatten().copied().collect();
        bids.sort();
        bids.dedup();
        bids
    }
}

/// Buffer table entry.
pub struct BufferItem {
    pub type_id: TypeId,
    pub size_id: SizeId,
    pub spec: ImageSpec,
    pub external: bool,
    pub references: usize,
    pub acquired: bool,
    pub created: bool,
    /// A provider call for this slot is in progress outside the table lock.
    creating: bool,
    handle: Option<ImageHandle>,
}

impl BufferItem {
    pub(crate) fn new(type_id: TypeId, size_id: SizeId, spec: ImageSpec, external: bool, references: usize) -> Self {
        Self {
            type_id,
            size_id,
            spec,
            external,
            references,
            acquired: false,
            created: false,
            creating: false,
            handle: None,
        }
    }
}

#[derive(Default)]
struct MetadataItem {
    references: usize,
    acquired: bool,
    handle: Option<MetadataHandle>,
}

struct Traversal {
    required: PathSet,
    done: PathSet,
    pending_nodes: NodeSet,
    scheduled: NodeSet,
    state: RequestState,
}

/// Outstanding counts found when a request finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub buffers: Vec<(u8, usize)>,
    pub metadata: Vec<(&'static str, usize)>,
    pub nodes: Vec<&'static str>,
    pub untraversed: Vec<&'static str>,
}

impl LeakReport {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.metadata.is_empty() && self.nodes.is_empty() && self.untraversed.is_empty()
    }
}

pub struct CaptureFeatureRequest {
    request_no: u32,
    frame_no: u32,
    sequence: u32,
    features: FeatureSet,
    params: [Option<i64>; ParamId::COUNT],
    sources: Vec<(TypeId, BufferId, ImageHandle)>,
    targets: Vec<(TypeId, BufferId, ImageHandle)>,
    node_requests: [Option<NodeRequest>; NodeId::COUNT],
    path_table: [[Option<PathId>; NodeId::COUNT]; NodeId::COUNT],
    buffers: Mutex<BTreeMap<BufferId, BufferItem>>,
    buffer_created: Condvar,
    metadata: Mutex<[MetadataItem; MetadataId::COUNT]>,
    traversal: Mutex<Traversal>,
    provider: Option<Arc<dyn BufferProvider>>,
    continue_sent: AtomicBool,
}

impl CaptureFeatureRequest {
    pub fn new(request_no: u32, frame_no: u32) -> Self {
        Self {
            request_no,
            frame_no,
            sequence: 0,
            features: FeatureSet::new(),
            params: [None; ParamId::COUNT],
            sources: Vec::new(),
            targets: Vec::new(),
            node_requests: Default::default(),
            path_table: [[None; NodeId::COUNT]; NodeId::COUNT],
            buffers: Mutex::new(BTreeMap::new()),
            buffer_created: Condvar::new(),
            metadata: Mutex::new(Default::default()),
            traversal: Mutex::new(Traversal {
                required: PathSet::new(),
                done: PathSet::new(),
                pending_nodes: NodeSet::new(),
                scheduled: NodeSet::new(),
                state: RequestState::Created,
            }),
            provider: None,
            continue_sent: AtomicBool::new(false),
        }
    }

    pub fn request_no(&self) -> u32 {
        self.request_no
    }

    pub fn frame_no(&self) -> u32 {
        self.frame_no
    }

    /// Pipe-assigned order of enqueue.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }

    pub(crate) fn set_provider(&mut self, provider: Arc<dyn BufferProvider>) {
        self.provider = Some(provider);
    }

    // ── Caller construction ──

    pub fn add_feature(&mut self, feature: FeatureId) {
        self.features.insert(feature);
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    pub fn has_feature(&self, feature: FeatureId) -> bool {
        self.features.contains(feature)
    }

    pub fn set_parameter(&mut self, id: ParamId, value: i64) {
        self.params[id.index()] = Some(value);
    }

    pub fn parameter(&self, id: ParamId) -> Option<i64> {
        self.params[id.index()]
    }

    fn next_external_id(&self) -> Result<BufferId> {
        let used = self.sources.len() + self.targets.len();
        u8::try_from(used)
            .ok()
            .and_then(BufferId::external)
            .ok_or_else(|| PipeError::Protocol(format!("request {} has too many caller buffers", self.request_no)))
    }

    /// Register a caller-owned input buffer.
    pub fn add_source_buffer(&mut self, type_id: TypeId, handle: ImageHandle) -> Result<BufferId> {
        let bid = self.next_external_id()?;
        self.sources.push((type_id, bid, handle));
        Ok(bid)
    }

    /// Register a caller-owned output buffer.
    pub fn add_target_buffer(&mut self, type_id: TypeId, handle: ImageHandle) -> Result<BufferId> {
        let bid = self.next_external_id()?;
        self.targets.push((type_id, bid, handle));
        Ok(bid)
    }

    pub fn add_metadata(&mut self, id: MetadataId, handle: MetadataHandle) {
        lock(&self.metadata)[id.index()].handle = Some(handle);
    }

    pub fn source_buffers(&self) -> impl Iterator<Item = (TypeId, BufferId, ImageSpec)> + '_ {
        self.sources.iter().map(|(t, bid, h)| (*t, *bid, h.spec()))
    }

    pub fn target_buffers(&self) -> impl Iterator<Item = (TypeId, BufferId)> + '_ {
        self.targets.iter().map(|(t, bid, _)| (*t, *bid))
    }

    /// Caller's handle to a target, for reading results after completion.
    pub fn target_handle(&self, type_id: TypeId) -> Option<&ImageHandle> {
        self.targets.iter().find(|(t, _, _)| *t == type_id).map(|(_, _, h)| h)
    }

    // ── Binding ──

    /// Install the result of inference.
    pub(crate) fn bind(
        &mut self,
        features: FeatureSet,
        nodes: NodeSet,
        paths: PathSet,
        node_requests: Vec<NodeRequest>,
        buffers: Vec<(BufferId, BufferItem)>,
    ) {
        self.features = features;

        self.path_table = [[None; NodeId::COUNT]; NodeId::COUNT];
        for path in paths {
            self.path_table[path.src().index()][path.dst().index()] = Some(path);
        }

        let metadata = self.metadata.get_mut().unwrap_or_else(|e| e.into_inner());
        for item in metadata.iter_mut() {
            item.references = 0;
        }
        self.node_requests = Default::default();
        for node_request in node_requests {
            for id in node_request.metadata() {
                metadata[id.index()].references += 1;
            }
            let node = node_request.node();
            self.node_requests[node.index()] = Some(node_request);
        }

        let mut table: BTreeMap<BufferId, BufferItem> = buffers.into_iter().collect();
        for (_, bid, handle) in self.sources.iter().chain(self.targets.iter()) {
            if let Some(item) = table.get_mut(bid) {
                item.handle = Some(handle.clone());
            }
        }
        *self.buffers.get_mut().unwrap_or_else(|e| e.into_inner()) = table;

        let traversal = self.traversal.get_mut().unwrap_or_else(|e| e.into_inner());
        traversal.required = paths;
        traversal.done = PathSet::new();
        traversal.pending_nodes = nodes.union(NodeSet::single(NodeId::Root));
        traversal.scheduled = NodeSet::single(NodeId::Root);
        traversal.state = RequestState::Bound;
    }

    // ── Traversal ──

    pub fn state(&self) -> RequestState {
        lock(&self.traversal).state
    }

    pub fn node_request(&self, node: NodeId) -> Option<&NodeRequest> {
        self.node_requests[node.index()].as_ref()
    }

    /// Nodes taking part in this request, root excluded.
    pub fn nodes(&self) -> NodeSet {
        NodeId::ALL
            .iter()
            .copied()
            .filter(|n| self.node_requests[n.index()].is_some())
            .collect()
    }

    pub fn find_path(&self, src: NodeId, dst: NodeId) -> Option<PathId> {
        self.path_table[src.index()][dst.index()]
    }

    pub fn required_paths(&self) -> PathSet {
        lock(&self.traversal).required
    }

    /// Require an extra path after binding.
    pub fn add_path(&self, path: PathId) -> bool {
        if path.is_virtual() || find_path(path.src(), path.dst()) != Some(path) {
            tracing::error!(request = self.request_no, %path, "Cannot require a virtual or unknown path");
            return false;
        }
        lock(&self.traversal).required.insert(path)
    }

    /// Mark `path` as fired. Fails for unrequired or repeated paths.
    pub fn traverse(&self, path: PathId) -> bool {
        let mut traversal = lock(&self.traversal);
        if !traversal.required.contains(path) {
            drop(traversal);
            tracing::error!(request = self.request_no, %path, "Traversed a path the request does not use");
            return false;
        }
        if !traversal.done.insert(path) {
            drop(traversal);
            tracing::error!(request = self.request_no, %path, "Path traversed twice");
            return false;
        }
        traversal.state = RequestState::Traversing;
        true
    }

    pub fn is_traversed(&self) -> bool {
        let traversal = lock(&self.traversal);
        traversal.required.is_subset(&traversal.done)
    }

    fn inbound(&self, required: PathSet, node: NodeId) -> PathSet {
        required.iter().filter(|p| p.dst() == node).collect()
    }

    /// Every required path into `node` has fired.
    pub fn is_satisfied(&self, node: NodeId) -> bool {
        let traversal = lock(&self.traversal);
        self.inbound(traversal.required, node).is_subset(&traversal.done)
    }

    /// Claim `node` for scheduling once it is satisfied.
    ///
    /// Exactly one caller gets `true` per node, so a node fed by several
    /// producers is enqueued once.
    pub fn acquire_node(&self, node: NodeId) -> bool {
        let mut traversal = lock(&self.traversal);
        if !traversal.pending_nodes.contains(node) || traversal.scheduled.contains(node) {
            return false;
        }
        if !self.inbound(traversal.required, node).is_subset(&traversal.done) {
            return false;
        }
        traversal.scheduled.insert(node)
    }

    /// Required paths leaving `node`.
    pub fn outgoing_paths(&self, node: NodeId) -> Vec<PathId> {
        lock(&self.traversal)
            .required
            .iter()
            .filter(|p| p.src() == node)
            .collect()
    }

    pub fn pending_nodes(&self) -> NodeSet {
        lock(&self.traversal).pending_nodes
    }

    pub fn dec_node_reference(&self, node: NodeId) -> bool {
        let removed = lock(&self.traversal).pending_nodes.remove(node);
        if !removed {
            tracing::error!(request = self.request_no, %node, "Node reference released twice");
        }
        removed
    }

    /// True exactly once: when every path fired and every node finished.
    pub fn try_complete(&self) -> bool {
        let mut traversal = lock(&self.traversal);
        if traversal.state == RequestState::Drained
            || !traversal.pending_nodes.is_empty()
            || !traversal.required.is_subset(&traversal.done)
        {
            return false;
        }
        traversal.state = RequestState::Drained;
        true
    }

    /// Whether this request lets the next capture start early.
    ///
    /// Requires a positive `EnableNextCapture`. Within a burst only the
    /// first frame (`FrameIndex` 0) announces it.
    pub fn wants_continue(&self) -> bool {
        let enabled = self.parameter(ParamId::EnableNextCapture).is_some_and(|v| v > 0);
        let frame_count = self.parameter(ParamId::FrameCount).unwrap_or(0);
        let frame_index = self.parameter(ParamId::FrameIndex).unwrap_or(0);
        enabled && (frame_count < 2 || frame_index == 0)
    }

    /// Returns true once, for the node that announces the next capture:
    /// P2A, or any node when P2A does not take part.
    pub(crate) fn take_continue(&self, node: NodeId) -> bool {
        if !self.wants_continue() {
            return false;
        }
        if node != NodeId::P2a && self.node_requests[NodeId::P2a.index()].is_some() {
            return false;
        }
        !self.continue_sent.swap(true, Ordering::AcqRel)
    }

    // ── Buffers ──

    pub fn buffer_spec(&self, bid: BufferId) -> Option<ImageSpec> {
        lock(&self.buffers).get(&bid).map(|item| item.spec)
    }

    pub fn buffer_references(&self, bid: BufferId) -> Option<usize> {
        lock(&self.buffers).get(&bid).map(|item| item.references)
    }

    pub fn buffer_ids(&self) -> Vec<BufferId> {
        lock(&self.buffers).keys().copied().collect()
    }

    /// Access a buffer, creating internal ones on first use.
    ///
    /// Creation may block in a pool. The table lock is not held meanwhile,
    /// so other nodes can keep releasing buffers of this request; callers
    /// racing for the same slot wait for the first one to finish.
    pub fn acquire_buffer(&self, bid: BufferId) -> Result<ImageHandle> {
        let mut buffers = lock(&self.buffers);
        let spec = loop {
            let Some(item) = buffers.get_mut(&bid) else {
                return Err(PipeError::Protocol(format!(
                    "request {} has no buffer {}",
                    self.request_no, bid
                )));
            };
            if item.references == 0 {
                return Err(PipeError::Protocol(format!(
                    "request {} buffer {} already released",
                    self.request_no, bid
                )));
            }
            if let Some(handle) = &item.handle {
                let handle = handle.clone();
                item.acquired = true;
                return Ok(handle);
            }
            if item.external {
                return Err(PipeError::Protocol(format!(
                    "request {} caller buffer {} missing",
                    self.request_no, bid
                )));
            }
            if !item.creating {
                item.creating = true;
                break item.spec;
            }
            buffers = self.buffer_created.wait(buffers).unwrap_or_else(|e| e.into_inner());
        };
        drop(buffers);

        let created = match &self.provider {
            Some(provider) => provider.acquire(spec),
            None => Err(PipeError::Allocation(format!("no buffer provider for {bid}"))),
        };

        // A handle that ends up unused is dropped after the table lock.
        let mut spare = None;
        let result = {
            let mut buffers = lock(&self.buffers);
            match buffers.get_mut(&bid) {
                Some(item) => {
                    item.creating = false;
                    match created {
                        Ok(handle) if item.references == 0 => {
                            spare = Some(handle);
                            Err(PipeError::Protocol(format!(
                                "request {} buffer {} released while being created",
                                self.request_no, bid
                            )))
                        }
                        Ok(handle) => {
                            if item.handle.is_some() {
                                spare = Some(handle);
                            } else {
                                item.handle = Some(handle);
                                item.created = true;
                                tracing::trace!(request = self.request_no, %bid, %spec, "Internal buffer created");
                            }
                            item.acquired = true;
                            item.handle.clone().ok_or_else(|| {
                                PipeError::Protocol(format!("request {} buffer {} unavailable", self.request_no, bid))
                            })
                        }
                        Err(e) => Err(e),
                    }
                }
                None => {
                    spare = created.ok();
                    Err(PipeError::Protocol(format!("request {} lost buffer {}", self.request_no, bid)))
                }
            }
        };
        self.buffer_created.notify_all();
        drop(spare);
        result
    }

    pub fn release_buffer(&self, bid: BufferId) {
        if let Some(item) = lock(&self.buffers).get_mut(&bid) {
            item.acquired = false;
        }
    }

    /// Drop one consumer of `bid`; the last drop returns the buffer.
    pub fn dec_buffer_ref(&self, bid: BufferId) -> bool {
        let released = {
            let mut buffers = lock(&self.buffers);
            let Some(item) = buffers.get_mut(&bid) else {
                drop(buffers);
                tracing::error!(request = self.request_no, %bid, "Released an unknown buffer");
                return false;
            };
            if item.references == 0 {
                drop(buffers);
                tracing::error!(request = self.request_no, %bid, "Buffer reference count would go negative");
                return false;
            }
            item.references -= 1;
            if item.references == 0 {
                item.acquired = false;
                item.handle.take()
            } else {
                None
            }
        };
        // Recycling may wake pool waiters; do it outside the table lock.
        drop(released);
        true
    }

    // ── Metadata ──

    pub fn metadata_references(&self, id: MetadataId) -> usize {
        lock(&self.metadata)[id.index()].references
    }

    /// Access metadata, creating an empty set if the caller supplied none.
    pub fn acquire_metadata(&self, id: MetadataId) -> Option<MetadataHandle> {
        let mut metadata = lock(&self.metadata);
        let item = &mut metadata[id.index()];
        if item.references == 0 {
            tracing::error!(request = self.request_no, metadata = %id, "Metadata acquired without a reference");
            return None;
        }
        item.acquired = true;
        Some(item.handle.get_or_insert_with(MetadataHandle::default).clone())
    }

    pub fn release_metadata(&self, id: MetadataId) {
        lock(&self.metadata)[id.index()].acquired = false;
    }

    pub fn dec_metadata_ref(&self, id: MetadataId) -> bool {
        let mut metadata = lock(&self.metadata);
        let item = &mut metadata[id.index()];
        if item.references == 0 {
            drop(metadata);
            tracing::error!(request = self.request_no, metadata = %id, "Metadata reference count would go negative");
            return false;
        }
        item.references -= 1;
        if item.references == 0 {
            item.acquired = false;
        }
        true
    }

    /// Caller's view of metadata after completion.
    pub fn metadata_handle(&self, id: MetadataId) -> Option<MetadataHandle> {
        lock(&self.metadata)[id.index()].handle.clone()
    }

    /// Release everything `node` holds: each buffer once, then metadata.
    pub fn release_node_resources(&self, node: NodeId) -> bool {
        let Some(node_request) = self.node_request(node) else {
            tracing::error!(request = self.request_no, %node, "Node is not part of this request");
            return false;
        };
        let mut ok = true;
        for bid in node_request.buffers() {
            ok &= self.dec_buffer_ref(bid);
        }
        for id in node_request.metadata() {
            ok &= self.dec_metadata_ref(id);
        }
        ok
    }

    /// Counts still outstanding. Empty for a correctly drained request.
    pub fn leaked_references(&self) -> LeakReport {
        let buffers = lock(&self.buffers)
            .iter()
            .filter(|(_, item)| item.references > 0)
            .map(|(bid, item)| (bid.raw(), item.references))
            .collect();
        let metadata = lock(&self.metadata)
            .iter()
            .enumerate()
            .filter(|(_, item)| item.references > 0)
            .filter_map(|(i, item)| MetadataId::ALL.get(i).map(|id| (id.name(), item.references)))
            .collect();
        let traversal = lock(&self.traversal);
        LeakReport {
            buffers,
            metadata,
            nodes: traversal.pending_nodes.iter().map(|n| n.name()).collect(),
            untraversed: traversal.required.difference(traversal.done).iter().map(|p| p.name()).collect(),
        }
    }
}

impl Sequenced for CaptureFeatureRequest {
    fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl fmt::Debug for CaptureFeatureRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureFeatureRequest")
            .field("request_no", &self.request_no)
            .field("frame_no", &self.frame_no)
            .field("sequence", &self.sequence)
            .field("features", &self.features)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for CaptureFeatureRequest {
    fn drop(&mut self) {
        let state = self.traversal.get_mut().map(|t| t.state).unwrap_or(RequestState::Drained);
        if state == RequestState::Created {
            return;
        }
        let leaks = self.leaked_references();
        if state == RequestState::Drained && !leaks.is_empty() {
            tracing::error!(request = self.request_no, ?leaks, "Request destroyed with outstanding references");
        } else {
            tracing::trace!(request = self.request_no, ?state, "Request destroyed");
        }
    }
}
