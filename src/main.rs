//! Feature pipe demo
//!
//! Builds the standard simulated topology, pushes a burst of capture
//! requests with mixed features through it and prints how each one went.
//!
//! Usage: `feature-pipe [REQUESTS]`

use anyhow::Context;
use crossbeam_channel::{unbounded, Sender};
use feature_pipe::buffer::{ImageFormat, ImagePoolSet, ImageSize, ImageSpec};
use feature_pipe::capture::stage::THUMBNAIL_SIZE;
use feature_pipe::capture::{
    standard_stages, CaptureFeaturePipe, CaptureFeatureRequest, FeatureId, ParamId, RequestCallback,
    RequestPtr, TypeId,
};
use feature_pipe::config::{PipeConfig, PoolSettings, CONFIG_ENV};
use feature_pipe::logging;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SENSOR: ImageSize = ImageSize::new(640, 480);
const DEFAULT_REQUESTS: u32 = 12;

enum Event {
    Completed { request_no: u32, seq: u32, ok: bool },
    Aborted { request_no: u32 },
    Continue { request_no: u32 },
}

struct ChannelCallback {
    tx: Sender<Event>,
}

impl RequestCallback for ChannelCallback {
    fn on_completed(&self, request: &RequestPtr, ok: bool) {
        let _ = self.tx.send(Event::Completed {
            request_no: request.request_no(),
            seq: request.sequence(),
            ok,
        });
    }

    fn on_aborted(&self, request: &RequestPtr) {
        let _ = self.tx.send(Event::Aborted {
            request_no: request.request_no(),
        });
    }

    fn on_continue(&self, request: &RequestPtr) {
        let _ = self.tx.send(Event::Continue {
            request_no: request.request_no(),
        });
    }
}

fn build_request(no: u32, app_pools: &ImagePoolSet) -> anyhow::Result<CaptureFeatureRequest> {
    let mut request = CaptureFeatureRequest::new(no, no);
    match no % 4 {
        1 => request.add_feature(FeatureId::Mfnr),
        2 => request.add_feature(FeatureId::Fb),
        3 => {
            request.add_feature(FeatureId::Remosaic);
            request.add_feature(FeatureId::Mfnr);
            request.add_feature(FeatureId::Fb);
        }
        _ => {}
    }
    if no % 3 == 0 {
        request.set_parameter(ParamId::EnableNextCapture, 1);
    }

    let raw = app_pools.pool(ImageSpec::new(SENSOR, ImageFormat::Bayer10))?.request()?;
    raw.fill(no as u8);
    request.add_source_buffer(TypeId::MainFullRaw, raw)?;

    let jpeg = app_pools.pool(ImageSpec::new(SENSOR, ImageFormat::Jpeg))?.request()?;
    request.add_target_buffer(TypeId::Jpeg, jpeg)?;
    let thumbnail = app_pools
        .pool(ImageSpec::new(THUMBNAIL_SIZE, ImageFormat::Jpeg))?
        .request()?;
    request.add_target_buffer(TypeId::Thumbnail, thumbnail)?;
    Ok(request)
}

fn main() -> anyhow::Result<()> {
    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => PipeConfig::load(&path)
            .with_context(|| format!("loading {}", std::path::Path::new(&path).display()))?,
        None => PipeConfig::load_or_default(),
    };
    let _log_guard = logging::init(&config.log);

    let count = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<u32>().context("REQUESTS must be a number")?,
        None => DEFAULT_REQUESTS,
    };
    tracing::info!(requests = count, "Starting feature pipe demo");

    let (tx, rx) = unbounded();
    let pipe = CaptureFeaturePipe::new(config.clone(), Arc::new(ChannelCallback { tx }))?;
    for (id, stage) in standard_stages(Duration::from_millis(2)) {
        pipe.add_node(id, stage)?;
    }
    pipe.set_diagnostic_hook(Arc::new(|status| {
        for node in status.iter().filter(|node| !node.idle) {
            tracing::warn!(?node, "Node still busy at watchdog");
        }
    }));
    pipe.init()?;
    pipe.start()?;

    let app_pools = ImagePoolSet::new(PoolSettings {
        auto_allocate: config.pool.auto_allocate.max(count as usize),
        ..config.pool.clone()
    });
    let started = Instant::now();
    for no in 0..count {
        let request = build_request(no, &app_pools)?;
        let seq = pipe.enque(request).with_context(|| format!("enqueue request {no}"))?;
        tracing::debug!(request = no, seq, "Submitted");
    }

    let mut completed = 0u32;
    let mut failed = 0u32;
    let mut continued = 0u32;
    while completed + failed < count {
        match rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Event::Completed { request_no, seq, ok }) => {
                tracing::info!(request = request_no, seq, ok, "Request completed");
                if ok {
                    completed += 1;
                } else {
                    failed += 1;
                }
            }
            Ok(Event::Aborted { request_no }) => {
                tracing::warn!(request = request_no, "Request aborted");
                failed += 1;
            }
            Ok(Event::Continue { request_no }) => {
                tracing::debug!(request = request_no, "Next capture allowed");
                continued += 1;
            }
            Err(_) => {
                tracing::error!("Timed out waiting for completions");
                break;
            }
        }
    }

    pipe.sync();
    pipe.stop()?;
    pipe.uninit()?;

    println!(
        "{} requests: {} completed, {} failed, {} continue notices in {:.1?}",
        count,
        completed,
        failed,
        continued,
        started.elapsed()
    );
    for (spec, idle_buffers, total) in pipe.pools().usage() {
        println!("  pool {spec}: {idle_buffers}/{total} idle");
    }
    Ok(())
}
