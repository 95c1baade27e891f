//! Test data builders for requests and pipes

use super::mock_helpers::RecordingCallback;
use feature_pipe::buffer::{standalone_image, ImageFormat, ImageHandle, ImageSize, ImageSpec};
use feature_pipe::capture::stage::THUMBNAIL_SIZE;
use feature_pipe::capture::{
    standard_stages, CaptureFeaturePipe, CaptureFeatureRequest, FeatureId, ParamId, TypeId,
};
use feature_pipe::config::PipeConfig;
use std::sync::Arc;
use std::time::Duration;

pub const SENSOR: ImageSize = ImageSize::new(64, 48);

/// Image outside any pool, filled with `value`
pub fn image(size: ImageSize, format: ImageFormat, value: u8) -> ImageHandle {
    let handle = standalone_image(ImageSpec::new(size, format)).expect("image");
    handle.fill(value);
    handle
}

/// Builder for capture requests against the standard topology
pub struct RequestBuilder {
    no: u32,
    features: Vec<FeatureId>,
    params: Vec<(ParamId, i64)>,
    source: Option<ImageHandle>,
    targets: Vec<(TypeId, ImageHandle)>,
}

impl RequestBuilder {
    pub fn new(no: u32) -> Self {
        Self {
            no,
            features: Vec::new(),
            params: Vec::new(),
            source: None,
            targets: Vec::new(),
        }
    }

    pub fn feature(mut self, feature: FeatureId) -> Self {
        self.features.push(feature);
        self
    }

    pub fn param(mut self, id: ParamId, value: i64) -> Self {
        self.params.push((id, value));
        self
    }

    /// Full-size raw source filled with `value`
    pub fn raw(mut self, value: u8) -> Self {
        self.source = Some(image(SENSOR, ImageFormat::Bayer10, value));
        self
    }

    pub fn target(mut self, type_id: TypeId, handle: ImageHandle) -> Self {
        self.targets.push((type_id, handle));
        self
    }

    pub fn jpeg(self) -> Self {
        self.target(TypeId::Jpeg, image(SENSOR, ImageFormat::Jpeg, 0))
    }

    pub fn thumbnail(self) -> Self {
        self.target(TypeId::Thumbnail, image(THUMBNAIL_SIZE, ImageFormat::Jpeg, 0))
    }

    pub fn build(self) -> CaptureFeatureRequest {
        let mut request = CaptureFeatureRequest::new(self.no, self.no);
        for feature in self.features {
            request.add_feature(feature);
        }
        for (id, value) in self.params {
            request.set_parameter(id, value);
        }
        if let Some(raw) = self.source {
            request.add_source_buffer(TypeId::MainFullRaw, raw).expect("source");
        }
        for (type_id, handle) in self.targets {
            request.add_target_buffer(type_id, handle).expect("target");
        }
        request
    }
}

/// Running pipe with the standard simulated stages
pub fn running_pipe(config: PipeConfig, work: Duration) -> (CaptureFeaturePipe, Arc<RecordingCallback>) {
    let callback = Arc::new(RecordingCallback::default());
    let pipe = CaptureFeaturePipe::new(config, callback.clone()).expect("pipe");
    for (id, stage) in standard_stages(work) {
        pipe.add_node(id, stage).expect("add node");
    }
    pipe.init().expect("init");
    pipe.start().expect("start");
    (pipe, callback)
}
