//! One-shot data-flow inference for a capture request.
//!
//! The pipe drives a strict protocol over [`CaptureFeatureInferenceData`]:
//!
//! 1. `add_source` for every caller-supplied input buffer,
//! 2. `add_node_io` once per participating node, in node order (called from
//!    each processor's `evaluate`),
//! 3. `add_target` for every caller-requested output,
//! 4. `determine`, which prunes unused items and writes the surviving
//!    buffers, paths and per-node IO maps into the request.
//!
//! Items live in a fixed table of [`MAX_DATA_ITEMS`] slots. An item's
//! reference set only shrinks once it has emptied: a retired item refuses
//! new references.

use super::ids::{
    find_path, BufferId, FeatureId, FeatureSet, MetadataSet, NodeId, NodeSet, PathSet, SizeId,
    TypeId, TypeSet,
};
use super::request::{BufferItem, CaptureFeatureRequest, NodeRequest};
use crate::buffer::{ImageFormat, ImageSize, ImageSpec};
use crate::error::{PipeError, Result};

/// Slots available for data items in one request.
pub const MAX_DATA_ITEMS: usize = 32;

/// A declared node input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcData {
    pub type_id: TypeId,
    pub size_id: SizeId,
}

impl SrcData {
    pub const fn new(type_id: TypeId, size_id: SizeId) -> Self {
        Self { type_id, size_id }
    }
}

/// A declared node output. Without an explicit size the output takes the
/// size of the node's first source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DstData {
    pub type_id: TypeId,
    pub size_id: SizeId,
    pub format: ImageFormat,
    pub size: Option<ImageSize>,
}

impl DstData {
    pub const fn new(type_id: TypeId, size_id: SizeId, format: ImageFormat) -> Self {
        Self {
            type_id,
            size_id,
            format,
            size: None,
        }
    }

    pub const fn with_size(mut self, size: ImageSize) -> Self {
        self.size = Some(size);
        self
    }
}

/// Everything one node declares from `evaluate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeIo {
    pub sources: Vec<SrcData>,
    pub destinations: Vec<DstData>,
    pub metadata: MetadataSet,
    pub features: FeatureSet,
}

/// Inference-time record of one produced (node, type) pair.
#[derive(Debug, Clone, Copy)]
pub struct DataItem {
    /// Producing node, `None` for a caller-supplied source
    pub owner: Option<NodeId>,
    pub type_id: TypeId,
    pub format: ImageFormat,
    pub size: ImageSize,
    pub size_id: SizeId,
    /// Item whose storage this one aliases
    pub redirect: Option<usize>,
    /// Nodes still consuming this item
    pub references: NodeSet,
    pub features: FeatureSet,
    /// Requested by the caller; survives pruning without consumers
    pub pinned: bool,
    /// Caller-supplied id for sources and targets
    pub buffer_id: Option<BufferId>,
    retired: bool,
}

impl DataItem {
    fn new(owner: Option<NodeId>, type_id: TypeId, spec: ImageSpec, size_id: SizeId) -> Self {
        Self {
            owner,
            type_id,
            format: spec.format,
            size: spec.size,
            size_id,
            redirect: None,
            references: NodeSet::new(),
            features: FeatureSet::new(),
            pinned: false,
            buffer_id: None,
            retired: false,
        }
    }

    pub fn spec(&self) -> ImageSpec {
        ImageSpec::new(self.size, self.format)
    }

    /// Consumers plus one for a caller target.
    pub fn reference_count(&self) -> usize {
        self.references.len() + usize::from(self.pinned)
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    fn add_reference(&mut self, node: NodeId) -> bool {
        if self.retired {
            tracing::error!(item = %self.type_id, %node, "Reference added to a retired data item");
            return false;
        }
        self.references.insert(node);
        true
    }

    fn is_unused(&self) -> bool {
        self.owner.is_some() && !self.retired && !self.pinned && self.references.is_empty()
    }
}

pub struct CaptureFeatureInferenceData {
    items: [Option<DataItem>; MAX_DATA_ITEMS],
    /// Most recent item resolving each type
    latest: [Option<usize>; TypeId::COUNT],
    node_inputs: [[Option<usize>; TypeId::COUNT]; NodeId::COUNT],
    node_outputs: [[Option<usize>; TypeId::COUNT]; NodeId::COUNT],
    node_metadata: [MetadataSet; NodeId::COUNT],
    node_features: [FeatureSet; NodeId::COUNT],
    used_paths: PathSet,
    used_nodes: NodeSet,
    inferred_types: TypeSet,
    features: FeatureSet,
}

impl CaptureFeatureInferenceData {
    /// Start inference for a request asking for `features`.
    pub fn new(features: FeatureSet) -> Self {
        Self {
            items: [None; MAX_DATA_ITEMS],
            latest: [None; TypeId::COUNT],
            node_inputs: [[None; TypeId::COUNT]; NodeId::COUNT],
            node_outputs: [[None; TypeId::COUNT]; NodeId::COUNT],
            node_metadata: [MetadataSet::new(); NodeId::COUNT],
            node_features: [FeatureSet::new(); NodeId::COUNT],
            used_paths: PathSet::new(),
            used_nodes: NodeSet::new(),
            inferred_types: TypeSet::new(),
            features,
        }
    }

    // ── Queries for evaluate ──

    pub fn has_type(&self, type_id: TypeId) -> bool {
        self.inferred_types.contains(type_id)
    }

    pub fn get_size(&self, type_id: TypeId) -> Option<ImageSize> {
        self.latest_item(type_id).map(|item| item.size)
    }

    pub fn has_feature(&self, feature: FeatureId) -> bool {
        self.features.contains(feature)
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    pub fn used_nodes(&self) -> NodeSet {
        self.used_nodes
    }

    pub fn used_paths(&self) -> PathSet {
        self.used_paths
    }

    pub fn inferred_types(&self) -> TypeSet {
        self.inferred_types
    }

    pub fn item(&self, index: usize) -> Option<&DataItem> {
        self.items.get(index).and_then(Option::as_ref)
    }

    /// Occupied slots, retired or not.
    pub fn items(&self) -> impl Iterator<Item = (usize, &DataItem)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.as_ref().map(|item| (i, item)))
    }

    pub fn latest_item(&self, type_id: TypeId) -> Option<&DataItem> {
        self.latest[type_id.index()].and_then(|i| self.item(i))
    }

    pub fn input_item(&self, node: NodeId, type_id: TypeId) -> Option<usize> {
        self.node_inputs[node.index()][type_id.index()]
    }

    pub fn output_item(&self, node: NodeId, type_id: TypeId) -> Option<usize> {
        self.node_outputs[node.index()][type_id.index()]
    }

    // ── Step 1: sources ──

    /// Register a caller-supplied input buffer.
    pub fn add_source(&mut self, type_id: TypeId, buffer_id: BufferId, spec: ImageSpec) -> Result<usize> {
        let index = self.free_slot()?;
        let mut item = DataItem::new(None, type_id, spec, SizeId::Full);
        item.buffer_id = Some(buffer_id);
        self.items[index] = Some(item);
        self.latest[type_id.index()] = Some(index);
        self.inferred_types.insert(type_id);
        tracing::trace!(%type_id, %buffer_id, %spec, index, "Source registered");
        Ok(index)
    }

    // ── Step 2: node IO ──

    fn producer_path(&self, node: NodeId, index: usize) -> Option<super::ids::PathId> {
        let owner = self.items[index]
            .as_ref()
            .and_then(|item| item.owner)
            .unwrap_or(NodeId::Root);
        find_path(owner, node)
    }

    fn validate(&self, node: NodeId, io: &NodeIo) -> Result<()> {
        if node == NodeId::Root {
            return Err(PipeError::topology(node.name(), "root node cannot declare IO"));
        }
        if self.used_nodes.contains(node) {
            return Err(PipeError::topology(node.name(), "IO already declared"));
        }

        let mut seen = TypeSet::new();
        for src in &io.sources {
            if !seen.insert(src.type_id) {
                return Err(PipeError::topology(
                    node.name(),
                    format!("duplicate source type {}", src.type_id),
                ));
            }
            let Some(index) = self.latest[src.type_id.index()] else {
                return Err(PipeError::topology(
                    node.name(),
                    format!("missing source {}", src.type_id),
                ));
            };
            if self.producer_path(node, index).is_none() {
                return Err(PipeError::topology(
                    node.name(),
                    format!("no path delivers {} to this node", src.type_id),
                ));
            }
        }

        let mut seen = TypeSet::new();
        for dst in &io.destinations {
            if !seen.insert(dst.type_id) {
                return Err(PipeError::topology(
                    node.name(),
                    format!("duplicate destination type {}", dst.type_id),
                ));
            }
            if dst.size.is_none() && io.sources.is_empty() {
                return Err(PipeError::topology(
                    node.name(),
                    format!("destination {} has no size and no source to inherit it", dst.type_id),
                ));
            }
        }

        if io.sources.is_empty() && find_path(NodeId::Root, node).is_none() {
            return Err(PipeError::topology(node.name(), "no sources and no path from root"));
        }
        Ok(())
    }

    /// Declare a node's inputs and outputs.
    ///
    /// On a topology error nothing is recorded for the node and the
    /// features it declared are dropped from the request.
    pub fn add_node_io(&mut self, node: NodeId, io: &NodeIo) -> Result<()> {
        if let Err(e) = self.validate(node, io) {
            let dropped = self.features.intersection(io.features);
            self.features = self.features.difference(io.features);
            tracing::warn!(%node, ?dropped, "Node IO rejected: {}", e);
            return Err(e);
        }

        let first_source_size = io
            .sources
            .first()
            .and_then(|src| self.latest_item(src.type_id))
            .map(|item| item.size);

        for src in &io.sources {
            let Some(index) = self.latest[src.type_id.index()] else {
                continue;
            };
            if let Some(path) = self.producer_path(node, index) {
                self.used_paths.insert(path);
            }
            if let Some(item) = self.items[index].as_mut() {
                item.add_reference(node);
            }
            self.node_inputs[node.index()][src.type_id.index()] = Some(index);
        }
        if io.sources.is_empty() {
            if let Some(path) = find_path(NodeId::Root, node) {
                self.used_paths.insert(path);
            }
        }

        let features = self.features.intersection(io.features);
        for dst in &io.destinations {
            let spec = ImageSpec::new(dst.size.or(first_source_size).unwrap_or_default(), dst.format);
            let index = self.claim_output_slot(node, dst.type_id)?;
            let mut item = DataItem::new(Some(node), dst.type_id, spec, dst.size_id);
            item.features = features;
            item.redirect = io
                .sources
                .iter()
                .find(|src| src.type_id == dst.type_id)
                .and_then(|src| self.node_inputs[node.index()][src.type_id.index()])
                .filter(|&src_index| self.item(src_index).is_some_and(|s| s.format == dst.format));
            self.items[index] = Some(item);
            self.latest[dst.type_id.index()] = Some(index);
            self.node_outputs[node.index()][dst.type_id.index()] = Some(index);
            self.inferred_types.insert(dst.type_id);
        }

        self.node_metadata[node.index()] = io.metadata;
        self.node_features[node.index()] = features;
        self.used_nodes.insert(node);
        tracing::trace!(
            %node,
            sources = io.sources.len(),
            destinations = io.destinations.len(),
            ?features,
            "Node IO declared"
        );
        Ok(())
    }

    /// Slot for `node`'s output of `type_id`.
    ///
    /// The latest item of the type is taken over when nothing consumed it
    /// yet; otherwise an existing (node, type) slot or a free one is used.
    fn claim_output_slot(&mut self, node: NodeId, type_id: TypeId) -> Result<usize> {
        if let Some(index) = self.latest[type_id.index()] {
            if let Some(prev) = self.items[index].filter(|item| item.is_unused()) {
                if let Some(owner) = prev.owner {
                    self.node_outputs[owner.index()][type_id.index()] = None;
                    tracing::debug!(%type_id, from = %owner, to = %node, index, "Unconsumed output reused");
                }
                return Ok(index);
            }
        }

        let existing = self.items.iter().position(|item| {
            item.is_some_and(|item| item.owner == Some(node) && item.type_id == type_id)
        });
        match existing {
            Some(index) => Ok(index),
            None => self.free_slot(),
        }
    }

    fn free_slot(&self) -> Result<usize> {
        self.items
            .iter()
            .position(Option::is_none)
            .ok_or(PipeError::DataItemsExhausted(MAX_DATA_ITEMS))
    }

    // ── Step 3: targets ──

    /// Pin the latest item of `type_id` as a caller-requested output.
    pub fn add_target(&mut self, type_id: TypeId, buffer_id: BufferId) -> Result<usize> {
        let Some(index) = self.latest[type_id.index()] else {
            return Err(PipeError::topology(
                NodeId::Root.name(),
                format!("target {type_id} is not produced by any node"),
            ));
        };
        let Some(item) = self.items[index].as_mut() else {
            return Err(PipeError::DataItemsExhausted(MAX_DATA_ITEMS));
        };
        if item.owner.is_none() {
            return Err(PipeError::topology(
                NodeId::Root.name(),
                format!("target {type_id} resolves to a source buffer"),
            ));
        }
        item.pinned = true;
        item.buffer_id = Some(buffer_id);
        item.redirect = None;
        tracing::trace!(%type_id, %buffer_id, index, "Target pinned");
        Ok(index)
    }

    // ── Step 4: determine ──

    /// Retire unused items and release nodes left without outputs, until
    /// nothing changes.
    fn prune(&mut self) {
        let mut declared_outputs = NodeSet::new();
        for node in self.used_nodes {
            if self.node_outputs[node.index()].iter().any(Option::is_some) {
                declared_outputs.insert(node);
            }
        }

        loop {
            let mut changed = false;

            for index in 0..MAX_DATA_ITEMS {
                let Some(item) = self.items[index].as_mut() else {
                    continue;
                };
                if !item.is_unused() {
                    continue;
                }
                item.retired = true;
                let (owner, type_id) = (item.owner, item.type_id);
                if let Some(owner) = owner {
                    if self.node_outputs[owner.index()][type_id.index()] == Some(index) {
                        self.node_outputs[owner.index()][type_id.index()] = None;
                    }
                }
                tracing::trace!(%type_id, index, "Unreferenced item pruned");
                changed = true;
            }

            for node in declared_outputs.intersection(self.used_nodes) {
                if self.node_outputs[node.index()].iter().any(Option::is_some) {
                    continue;
                }
                for slot in self.node_inputs[node.index()].iter_mut() {
                    if let Some(index) = slot.take() {
                        if let Some(item) = self.items[index].as_mut() {
                            item.references.remove(node);
                        }
                    }
                }
                self.node_metadata[node.index()] = MetadataSet::new();
                self.node_features[node.index()] = FeatureSet::new();
                self.used_nodes.remove(node);
                tracing::debug!(%node, "Node has no consumed output, dropped from request");
                changed = true;
            }

            if !changed {
                break;
            }
        }
    }

    fn recompute_paths(&mut self) {
        let mut paths = PathSet::new();
        for node in self.used_nodes {
            let mut fed = false;
            for index in self.node_inputs[node.index()].iter().flatten() {
                let owner = self.items[*index]
                    .as_ref()
                    .and_then(|item| item.owner)
                    .unwrap_or(NodeId::Root);
                if let Some(path) = find_path(owner, node) {
                    paths.insert(path);
                    fed = true;
                }
            }
            if !fed {
                if let Some(path) = find_path(NodeId::Root, node) {
                    paths.insert(path);
                }
            }
        }
        self.used_paths = paths;
    }

    /// Buffer id of every live item; redirects share their target's id.
    fn assign_buffer_ids(&self) -> Result<[Option<BufferId>; MAX_DATA_ITEMS]> {
        let mut ids = [None; MAX_DATA_ITEMS];
        let mut next_internal = 0u8;

        for (index, item) in self.items() {
            if item.retired || (item.redirect.is_some() && !item.pinned) {
                continue;
            }
            ids[index] = match item.buffer_id {
                Some(bid) => Some(bid),
                None => {
                    let bid = BufferId::internal(next_internal).ok_or(PipeError::BufferIdsExhausted)?;
                    next_internal += 1;
                    Some(bid)
                }
            };
        }

        for (index, item) in self.items() {
            if item.retired || item.pinned {
                continue;
            }
            if let Some(target) = item.redirect {
                ids[index] = ids[target];
            }
        }
        Ok(ids)
    }

    /// Prune, then write buffers, paths, node IO maps and metadata
    /// references into `request`.
    pub fn determine(&mut self, request: &mut CaptureFeatureRequest) -> Result<()> {
        self.prune();
        self.recompute_paths();
        let ids = self.assign_buffer_ids()?;

        let mut node_requests: Vec<NodeRequest> = Vec::new();
        for node in self.used_nodes {
            let mut node_request = NodeRequest::new(node, self.node_metadata[node.index()]);
            for type_id in TypeId::ALL.iter().copied() {
                if let Some(bid) = self.node_inputs[node.index()][type_id.index()].and_then(|i| ids[i]) {
                    node_request.set_input(type_id, bid);
                }
                if let Some(bid) = self.node_outputs[node.index()][type_id.index()].and_then(|i| ids[i]) {
                    node_request.set_output(type_id, bid);
                }
            }
            node_requests.push(node_request);
        }

        let mut buffers: Vec<(BufferId, BufferItem)> = Vec::new();
        for (index, item) in self.items() {
            let Some(bid) = ids[index] else {
                continue;
            };
            if buffers.iter().any(|(b, _)| *b == bid) {
                continue;
            }
            let references = node_requests.iter().filter(|nr| nr.touches(bid)).count();
            if references == 0 && !item.pinned {
                continue;
            }
            // Storage belongs to the root of a redirect chain.
            let root = item.redirect.filter(|_| !item.pinned).and_then(|r| self.item(r)).unwrap_or(item);
            buffers.push((
                bid,
                BufferItem::new(root.type_id, root.size_id, root.spec(), !bid.is_internal(), references),
            ));
        }

        let features = self.features;
        request.bind(features, self.used_nodes, self.used_paths, node_requests, buffers);
        tracing::debug!(
            request = request.request_no(),
            nodes = ?self.used_nodes,
            paths = ?self.used_paths,
            ?features,
            "Request dependencies determined"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ids::{MetadataId, PathId};
    use crate::capture::node::CaptureProcessor;
    use proptest::prelude::*;

    const SIZE: ImageSize = ImageSize::new(64, 48);

    fn raw_spec() -> ImageSpec {
        ImageSpec::new(SIZE, ImageFormat::Bayer10)
    }

    fn io(sources: &[TypeId], destinations: &[TypeId]) -> NodeIo {
        NodeIo {
            sources: sources.iter().map(|&t| SrcData::new(t, SizeId::Full)).collect(),
            destinations: destinations
                .iter()
                .map(|&t| DstData::new(t, SizeId::Full, ImageFormat::Yuy2))
                .collect(),
            ..NodeIo::default()
        }
    }

    fn ext(index: u8) -> BufferId {
        BufferId::external(index).unwrap()
    }

    #[test]
    fn test_single_node_source_to_target() {
        let mut infer = CaptureFeatureInferenceData::new(FeatureSet::new());
        infer.add_source(TypeId::MainFullRaw, ext(0), raw_spec()).unwrap();
        infer
            .add_node_io(NodeId::P2a, &io(&[TypeId::MainFullRaw], &[TypeId::MainFullYuv]))
            .unwrap();
        let target = infer.add_target(TypeId::MainFullYuv, ext(1)).unwrap();

        let item = infer.item(target).unwrap();
        assert_eq!(item.reference_count(), 1);
        assert_eq!(item.size, SIZE);
        assert_eq!(infer.output_item(NodeId::P2a, TypeId::MainFullYuv), Some(target));
        assert!(infer.input_item(NodeId::P2a, TypeId::MainFullRaw).is_some());
        assert_eq!(infer.used_paths(), PathSet::single(PathId::RootToP2a));
    }

    #[test]
    fn test_unconsumed_output_slot_is_reused() {
        let mut infer = CaptureFeatureInferenceData::new(FeatureSet::new());
        infer.add_source(TypeId::MainFullRaw, ext(0), raw_spec()).unwrap();
        infer
            .add_node_io(NodeId::Raw, &io(&[TypeId::MainFullRaw], &[TypeId::MainRszRaw]))
            .unwrap();
        let first = infer.output_item(NodeId::Raw, TypeId::MainRszRaw).unwrap();
        infer
            .add_node_io(NodeId::P2a, &io(&[TypeId::MainFullRaw], &[TypeId::MainRszRaw]))
            .unwrap();

        assert_eq!(infer.output_item(NodeId::P2a, TypeId::MainRszRaw), Some(first));
        assert_eq!(infer.output_item(NodeId::Raw, TypeId::MainRszRaw), None);
        assert_eq!(infer.items().count(), 2);
    }

    #[test]
    fn test_topology_error_drops_features() {
        let mut infer = CaptureFeatureInferenceData::new(FeatureSet::from_iter([FeatureId::Nr, FeatureId::Hdr]));
        let mut bad = io(&[TypeId::MainFullYuv], &[TypeId::MainRszYuv]);
        bad.features = FeatureSet::single(FeatureId::Nr);

        let err = infer.add_node_io(NodeId::Yuv, &bad).unwrap_err();
        assert!(matches!(err, PipeError::Topology { .. }));
        assert!(!infer.has_feature(FeatureId::Nr));
        assert!(infer.has_feature(FeatureId::Hdr));
        assert!(infer.used_nodes().is_empty());
    }

    #[test]
    fn test_duplicate_types_rejected() {
        let mut infer = CaptureFeatureInferenceData::new(FeatureSet::new());
        infer.add_source(TypeId::MainFullRaw, ext(0), raw_spec()).unwrap();
        let dup = io(&[TypeId::MainFullRaw, TypeId::MainFullRaw], &[TypeId::MainFullYuv]);
        assert!(infer.add_node_io(NodeId::P2a, &dup).is_err());
        let dup = io(&[TypeId::MainFullRaw], &[TypeId::MainFullYuv, TypeId::MainFullYuv]);
        assert!(infer.add_node_io(NodeId::P2a, &dup).is_err());
    }

    #[test]
    fn test_missing_path_rejected() {
        let mut infer = CaptureFeatureInferenceData::new(FeatureSet::new());
        infer.add_source(TypeId::MainFullRaw, ext(0), raw_spec()).unwrap();
        infer
            .add_node_io(NodeId::Mdp, &io(&[TypeId::MainFullRaw], &[TypeId::Jpeg]))
            .unwrap_err();
    }

    #[test]
    fn test_same_format_output_redirects_to_source() {
        let mut infer = CaptureFeatureInferenceData::new(FeatureSet::new());
        infer
            .add_source(TypeId::MainFullYuv, ext(0), ImageSpec::new(SIZE, ImageFormat::Yuy2))
            .unwrap();
        infer
            .add_node_io(NodeId::P2a, &io(&[TypeId::MainFullYuv], &[TypeId::MainFullYuv, TypeId::MainRszYuv]))
            .unwrap();
        infer
            .add_node_io(NodeId::Mdp, &io(&[TypeId::MainFullYuv, TypeId::MainRszYuv], &[TypeId::Jpeg]))
            .unwrap();
        let in_place = infer.output_item(NodeId::P2a, TypeId::MainFullYuv).unwrap();
        assert_eq!(infer.item(in_place).unwrap().redirect, Some(0));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let mut infer = CaptureFeatureInferenceData::new(FeatureSet::new());
        assert!(infer.add_target(TypeId::Jpeg, ext(0)).is_err());
        infer.add_source(TypeId::MainFullRaw, ext(0), raw_spec()).unwrap();
        assert!(infer.add_target(TypeId::MainFullRaw, ext(1)).is_err());
    }

    #[test]
    fn test_prune_cascades_to_unused_producers() {
        let mut infer = CaptureFeatureInferenceData::new(FeatureSet::new());
        infer.add_source(TypeId::MainFullRaw, ext(0), raw_spec()).unwrap();
        infer
            .add_node_io(NodeId::P2a, &io(&[TypeId::MainFullRaw], &[TypeId::MainFullYuv, TypeId::MainFdYuv]))
            .unwrap();
        infer
            .add_node_io(NodeId::Fd, &io(&[TypeId::MainFdYuv], &[TypeId::MainFd]))
            .unwrap();
        infer.add_target(TypeId::MainFullYuv, ext(1)).unwrap();

        infer.prune();
        assert!(!infer.used_nodes().contains(NodeId::Fd));
        assert!(infer.used_nodes().contains(NodeId::P2a));
        let fd_yuv = infer.latest_item(TypeId::MainFdYuv).unwrap();
        assert!(fd_yuv.is_retired());
        assert!(fd_yuv.references.is_empty());
    }

    /// Bind a raw-to-JPEG request against the standard stages.
    fn bound_standard_request(features: &[FeatureId], thumbnail: bool) -> CaptureFeatureRequest {
        use crate::buffer::standalone_image;
        use crate::capture::stage::{standard_stages, THUMBNAIL_SIZE};
        use std::time::Duration;

        let mut request = CaptureFeatureRequest::new(1, 1);
        for &feature in features {
            request.add_feature(feature);
        }
        request
            .add_source_buffer(TypeId::MainFullRaw, standalone_image(raw_spec()).unwrap())
            .unwrap();
        let jpeg = standalone_image(ImageSpec::new(SIZE, ImageFormat::Jpeg)).unwrap();
        request.add_target_buffer(TypeId::Jpeg, jpeg).unwrap();
        if thumbnail {
            let thumb = standalone_image(ImageSpec::new(THUMBNAIL_SIZE, ImageFormat::Jpeg)).unwrap();
            request.add_target_buffer(TypeId::Thumbnail, thumb).unwrap();
        }

        let mut infer = CaptureFeatureInferenceData::new(request.features());
        for (t, bid, spec) in request.source_buffers().collect::<Vec<_>>() {
            infer.add_source(t, bid, spec).unwrap();
        }
        for (id, stage) in standard_stages(Duration::ZERO) {
            let _ = stage.evaluate(id, &mut infer);
        }
        for (t, bid) in request.target_buffers().collect::<Vec<_>>() {
            infer.add_target(t, bid).unwrap();
        }
        infer.determine(&mut request).unwrap();
        request
    }

    proptest! {
        /// Every reference inference hands out is released exactly once by
        /// the nodes that hold it; one more release is refused.
        #[test]
        fn prop_node_releases_balance_references(
            features in proptest::sample::subsequence(
                vec![FeatureId::Remosaic, FeatureId::Nr, FeatureId::Hdr, FeatureId::Mfnr, FeatureId::Fb],
                0..=5,
            ),
            thumbnail in any::<bool>(),
        ) {
            let request = bound_standard_request(&features, thumbnail);
            for node in request.nodes() {
                prop_assert!(request.release_node_resources(node));
            }
            for bid in request.buffer_ids() {
                prop_assert_eq!(request.buffer_references(bid), Some(0));
                prop_assert!(!request.dec_buffer_ref(bid));
            }
            for &id in MetadataId::ALL {
                prop_assert_eq!(request.metadata_references(id), 0);
                prop_assert!(!request.dec_metadata_ref(id));
            }
        }

        /// Items never regain references once retired, whatever order
        /// nodes declare and prune in.
        #[test]
        fn prop_retired_items_stay_empty(target_fd in any::<bool>(), target_yuv in any::<bool>()) {
            let mut infer = CaptureFeatureInferenceData::new(FeatureSet::new());
            infer.add_source(TypeId::MainFullRaw, ext(0), raw_spec()).unwrap();
            infer.add_node_io(NodeId::P2a, &io(&[TypeId::MainFullRaw], &[TypeId::MainFullYuv, TypeId::MainFdYuv])).unwrap();
            infer.add_node_io(NodeId::Fd, &io(&[TypeId::MainFdYuv], &[TypeId::MainFd])).unwrap();
            if target_fd {
                infer.add_target(TypeId::MainFd, ext(1)).unwrap();
            }
            if target_yuv {
                infer.add_target(TypeId::MainFullYuv, ext(2)).unwrap();
            }
            infer.prune();
            let retired: Vec<usize> = infer.items().filter(|(_, i)| i.is_retired()).map(|(i, _)| i).collect();
            infer.prune();
            for index in retired {
                let item = infer.item(index).unwrap();
                prop_assert!(item.is_retired());
                prop_assert!(item.references.is_empty());
            }
            prop_assert_eq!(infer.used_nodes().contains(NodeId::Fd), target_fd);
            prop_assert_eq!(infer.used_nodes().contains(NodeId::P2a), target_fd || target_yuv);
        }
    }
}
