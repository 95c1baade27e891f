//! Simulated capture stages.
//!
//! A [`SimulatedStage`] declares a fixed IO set, copies its first input
//! into every output it writes and stamps its metadata. It is what the demo
//! binary, the integration tests and the benches run the pipe with.

use super::ids::{FeatureId, MetadataId, NodeId, SizeId, TypeId};
use super::inference::{CaptureFeatureInferenceData, DstData, NodeIo, SrcData};
use super::node::{CaptureProcessor, Completion};
use super::request::RequestPtr;
use crate::buffer::{ImageFormat, ImageSize};
use crate::error::{PipeError, Result};
use crate::sync::lock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Size of face detection buffers in the standard topology.
pub const FD_SIZE: ImageSize = ImageSize::new(320, 240);
pub const THUMBNAIL_SIZE: ImageSize = ImageSize::new(160, 120);

#[derive(Debug, Default)]
pub struct SimulatedStage {
    name: String,
    io: NodeIo,
    required: Option<FeatureId>,
    work: Duration,
    asynchronous: bool,
    processed: AtomicUsize,
}

impl SimulatedStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn source(mut self, src: SrcData) -> Self {
        self.io.sources.push(src);
        self
    }

    pub fn destination(mut self, dst: DstData) -> Self {
        self.io.destinations.push(dst);
        self
    }

    pub fn metadata(mut self, id: MetadataId) -> Self {
        self.io.metadata.insert(id);
        self
    }

    /// Feature this stage implements. It is recorded for the request when
    /// the stage participates.
    pub fn feature(mut self, feature: FeatureId) -> Self {
        self.io.features.insert(feature);
        self
    }

    /// Only participate when the request asks for `feature`.
    pub fn requires(mut self, feature: FeatureId) -> Self {
        self.required = Some(feature);
        self.feature(feature)
    }

    /// Time spent per request.
    pub fn work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    /// Finish requests on a helper thread instead of the node thread.
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn io(&self) -> &NodeIo {
        &self.io
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    fn run(&self, node: NodeId, request: &RequestPtr) -> Result<()> {
        let node_request = request
            .node_request(node)
            .ok_or_else(|| PipeError::Protocol(format!("{node} has no share of request {}", request.request_no())))?;

        let inputs: Vec<_> = node_request.inputs().collect();
        let payload = match inputs.first() {
            Some(&(_, bid)) => {
                let handle = request.acquire_buffer(bid)?;
                let bytes = handle.to_vec();
                request.release_buffer(bid);
                bytes
            }
            None => Vec::new(),
        };

        for (type_id, bid) in node_request.outputs() {
            if inputs.iter().any(|&(_, input)| input == bid) {
                tracing::trace!(stage = %self.name, %type_id, "Processed in place");
                continue;
            }
            let handle = request.acquire_buffer(bid)?;
            handle.write(&payload);
            request.release_buffer(bid);
        }

        for id in node_request.metadata().iter() {
            if let Some(handle) = request.acquire_metadata(id) {
                lock(&handle).set(format!("{}.seq", self.name), i64::from(request.sequence()));
                request.release_metadata(id);
            }
        }
        Ok(())
    }
}

impl CaptureProcessor for SimulatedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, node: NodeId, infer: &mut CaptureFeatureInferenceData) -> Result<()> {
        if let Some(feature) = self.required {
            if !infer.has_feature(feature) {
                return Ok(());
            }
        }
        if let Some(missing) = self.io.sources.iter().find(|src| !infer.has_type(src.type_id)) {
            tracing::trace!(stage = %self.name, type_id = %missing.type_id, "Input not available, skipping");
            return Ok(());
        }
        infer.add_node_io(node, &self.io)
    }

    fn process(&self, request: &RequestPtr, completion: Completion) -> bool {
        let result = self.run(completion.node(), request);
        if let Err(e) = &result {
            tracing::warn!(stage = %self.name, request = request.request_no(), "Stage failed: {}", e);
        }
        self.processed.fetch_add(1, Ordering::Relaxed);

        let work = self.work;
        if self.asynchronous {
            let spawned = std::thread::Builder::new()
                .name(format!("{}-done", self.name))
                .spawn(move || {
                    if !work.is_zero() {
                        std::thread::sleep(work);
                    }
                    completion.finish();
                });
            if let Err(e) = spawned {
                tracing::error!(stage = %self.name, "Failed to spawn completion thread: {}", e);
            }
        } else {
            if !work.is_zero() {
                std::thread::sleep(work);
            }
            completion.finish();
        }
        result.is_ok()
    }
}

/// The stock Raw → P2A → {FD, MultiFrame, YUV} → MDP topology.
///
/// Raw runs only for remosaic, MultiFrame for MFNR and YUV for face
/// beautification. MDP finishes asynchronously.
pub fn standard_stages(work: Duration) -> Vec<(NodeId, Arc<SimulatedStage>)> {
    let raw = SimulatedStage::new("remosaic")
        .source(SrcData::new(TypeId::MainFullRaw, SizeId::Full))
        .destination(DstData::new(TypeId::MainFullRaw, SizeId::Full, ImageFormat::Bayer10))
        .requires(FeatureId::Remosaic)
        .work(work);

    let p2a = SimulatedStage::new("isp")
        .source(SrcData::new(TypeId::MainFullRaw, SizeId::Full))
        .destination(DstData::new(TypeId::MainFullYuv, SizeId::Full, ImageFormat::Yuy2))
        .destination(DstData::new(TypeId::MainFdYuv, SizeId::Specific, ImageFormat::Yuy2).with_size(FD_SIZE))
        .metadata(MetadataId::MainInHal)
        .metadata(MetadataId::MainOutApp)
        .feature(FeatureId::Nr)
        .feature(FeatureId::Abf)
        .work(work);

    let fd = SimulatedStage::new("facedetect")
        .source(SrcData::new(TypeId::MainFdYuv, SizeId::Specific))
        .destination(DstData::new(TypeId::MainFd, SizeId::Specific, ImageFormat::Blob).with_size(FD_SIZE))
        .work(work);

    let multiframe = SimulatedStage::new("mfnr")
        .source(SrcData::new(TypeId::MainFullYuv, SizeId::Full))
        .destination(DstData::new(TypeId::MainFullYuv, SizeId::Full, ImageFormat::Yuy2))
        .metadata(MetadataId::MainOutHal)
        .requires(FeatureId::Mfnr)
        .work(work);

    let yuv = SimulatedStage::new("facebeauty")
        .source(SrcData::new(TypeId::MainFullYuv, SizeId::Full))
        .source(SrcData::new(TypeId::MainFd, SizeId::Specific))
        .destination(DstData::new(TypeId::MainFullYuv, SizeId::Full, ImageFormat::Yuy2))
        .requires(FeatureId::Fb)
        .work(work);

    let mdp = SimulatedStage::new("mdp")
        .source(SrcData::new(TypeId::MainFullYuv, SizeId::Full))
        .destination(DstData::new(TypeId::Jpeg, SizeId::Full, ImageFormat::Jpeg))
        .destination(DstData::new(TypeId::Postview, SizeId::Full, ImageFormat::Yuy2))
        .destination(DstData::new(TypeId::Thumbnail, SizeId::Specific, ImageFormat::Jpeg).with_size(THUMBNAIL_SIZE))
        .metadata(MetadataId::MainOutApp)
        .work(work)
        .asynchronous(true);

    vec![
        (NodeId::Raw, Arc::new(raw)),
        (NodeId::P2a, Arc::new(p2a)),
        (NodeId::Fd, Arc::new(fd)),
        (NodeId::MultiFrame, Arc::new(multiframe)),
        (NodeId::Yuv, Arc::new(yuv)),
        (NodeId::Mdp, Arc::new(mdp)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ImageSpec;
    use crate::capture::ids::{BufferId, FeatureSet, PathId};

    const FULL: ImageSize = ImageSize::new(64, 48);

    fn evaluate_all(features: FeatureSet) -> CaptureFeatureInferenceData {
        let mut infer = CaptureFeatureInferenceData::new(features);
        infer
            .add_source(
                TypeId::MainFullRaw,
                BufferId::external(0).unwrap(),
                ImageSpec::new(FULL, ImageFormat::Bayer10),
            )
            .unwrap();
        for (id, stage) in standard_stages(Duration::ZERO) {
            let _ = stage.evaluate(id, &mut infer);
        }
        infer
    }

    #[test]
    fn test_plain_capture_uses_isp_and_mdp() {
        let infer = evaluate_all(FeatureSet::default());
        let nodes = infer.used_nodes();
        assert!(nodes.contains(NodeId::P2a));
        assert!(nodes.contains(NodeId::Fd));
        assert!(nodes.contains(NodeId::Mdp));
        assert!(!nodes.contains(NodeId::Raw));
        assert!(!nodes.contains(NodeId::MultiFrame));
        assert!(!nodes.contains(NodeId::Yuv));
        assert_eq!(infer.get_size(TypeId::Jpeg), Some(FULL));
        assert_eq!(infer.get_size(TypeId::Thumbnail), Some(THUMBNAIL_SIZE));
    }

    #[test]
    fn test_feature_stages_chain() {
        let features: FeatureSet = [FeatureId::Remosaic, FeatureId::Mfnr, FeatureId::Fb].into_iter().collect();
        let infer = evaluate_all(features);
        let paths = infer.used_paths();
        assert!(paths.contains(PathId::RootToRaw));
        assert!(paths.contains(PathId::RawToP2a));
        assert!(paths.contains(PathId::P2aToMultiFrame));
        assert!(paths.contains(PathId::MultiFrameToYuv));
        assert!(paths.contains(PathId::FdToYuv));
        assert!(paths.contains(PathId::YuvToMdp));
        assert!(!paths.contains(PathId::P2aToMdp));
        assert!(infer.has_feature(FeatureId::Mfnr));
    }

    #[test]
    fn test_stage_skips_without_required_feature() {
        let stage = SimulatedStage::new("mfnr")
            .source(SrcData::new(TypeId::MainFullYuv, SizeId::Full))
            .requires(FeatureId::Mfnr);
        let mut infer = CaptureFeatureInferenceData::new(FeatureSet::default());
        stage.evaluate(NodeId::MultiFrame, &mut infer).unwrap();
        assert!(infer.used_nodes().is_empty());
    }
}
