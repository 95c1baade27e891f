//! Test to verify test infrastructure works correctly

mod common;

use common::builders::{RequestBuilder, SENSOR};
use feature_pipe::capture::{FeatureId, ParamId, TypeId};
use feature_pipe::config::{PipeConfig, CONFIG_ENV};
use serial_test::serial;

#[test]
fn test_request_builder() {
    let request = RequestBuilder::new(42)
        .feature(FeatureId::Mfnr)
        .param(ParamId::FrameCount, 3)
        .raw(7)
        .jpeg()
        .build();

    assert_eq!(request.request_no(), 42);
    assert!(request.has_feature(FeatureId::Mfnr));
    assert_eq!(request.parameter(ParamId::FrameCount), Some(3));
    let sources: Vec<_> = request.source_buffers().collect();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].0, TypeId::MainFullRaw);
    assert_eq!(sources[0].2.size, SENSOR);
    assert_eq!(request.target_buffers().count(), 1);
}

#[test]
fn test_wait_until_times_out() {
    let start = std::time::Instant::now();
    assert!(!common::wait_until(std::time::Duration::from_millis(20), || false));
    assert!(start.elapsed() >= std::time::Duration::from_millis(20));
}

#[test]
#[serial]
fn test_config_env_override() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipe.toml");
    let mut config = PipeConfig::default();
    config.pool.auto_allocate = 3;
    config.ordering.priority_queues = true;
    config.save(&path).unwrap();

    std::env::set_var(CONFIG_ENV, &path);
    let loaded = PipeConfig::load_or_default();
    std::env::remove_var(CONFIG_ENV);

    assert_eq!(loaded, config);
}

#[test]
#[serial]
fn test_broken_config_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipe.toml");
    std::fs::write(&path, "[pool]\nauto_allocate = \"many\"\n").unwrap();

    std::env::set_var(CONFIG_ENV, &path);
    let loaded = PipeConfig::load_or_default();
    std::env::remove_var(CONFIG_ENV);

    assert_eq!(loaded, PipeConfig::default());
    assert!(PipeConfig::load(&path).is_err());
}
