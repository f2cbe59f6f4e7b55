//! Configuration system tests.

use mmv_export::core::config::{LogLevel, SegmentFlags};
use mmv_export::core::{Config, ConfigBuilder, MmvError};
use mmv_export::identifier::IdStrategy;
use mmv_export::segment::{flags, SegmentLocation, SegmentOptions};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn test_default_config() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.segment.name, "mmv-export");
    assert_eq!(config.segment.cluster_id, 0);
    assert_eq!(config.segment.initial_size, 4096);
    assert_eq!(config.segment.max_size, None);
    assert_eq!(config.publisher.poll_interval, Duration::from_secs(1));
    assert!(!config.publisher.require_frozen_registry);
    assert_eq!(config.identifiers.strategy, IdStrategy::Hashing);
    assert_eq!(config.logging.level, LogLevel::Info);
}

#[test]
fn test_config_builder() {
    let config = ConfigBuilder::new()
        .segment_name("checkout")
        .segment_dir(PathBuf::from("/var/tmp/pcp/mmv"))
        .cluster_id(321)
        .poll_interval(Duration::from_millis(250))
        .require_frozen_registry(true)
        .debug(true)
        .build()
        .unwrap();

    assert_eq!(config.segment.path(), PathBuf::from("/var/tmp/pcp/mmv/checkout"));
    assert_eq!(config.segment.cluster_id, 321);
    assert_eq!(config.publisher.poll_interval, Duration::from_millis(250));
    assert!(config.publisher.require_frozen_registry);
    assert!(config.debug);
}

#[test]
fn test_yaml_config() {
    let yaml = r#"
segment:
  name: orders
  directory: /tmp/pcp/mmv
  cluster_id: 4095
  initial_size: 8192
  max_size: 1048576
  flags:
    no_prefix: true
    process: true
publisher:
  poll_interval: 500ms
  require_frozen_registry: true
identifiers:
  strategy: fixed
  fixed:
    orders.placed: 7
    orders.failed: 8
logging:
  level: debug
  with_target: true
"#;

    let config = ConfigBuilder::new().from_yaml(yaml).unwrap().build().unwrap();

    assert_eq!(config.segment.path(), PathBuf::from("/tmp/pcp/mmv/orders"));
    assert_eq!(config.segment.cluster_id, 4095);
    assert_eq!(config.segment.initial_size, 8192);
    assert_eq!(config.segment.max_size, Some(1_048_576));
    assert_eq!(
        config.segment.flags,
        SegmentFlags {
            no_prefix: true,
            process: true,
            sentinel: false,
        }
    );
    assert_eq!(config.publisher.poll_interval, Duration::from_millis(500));
    assert_eq!(config.identifiers.strategy, IdStrategy::Fixed);
    assert_eq!(config.identifiers.fixed.get("orders.failed"), Some(&8));
    assert_eq!(config.logging.level, LogLevel::Debug);
    assert!(config.logging.with_target);
}

#[test]
fn test_partial_yaml_keeps_defaults() {
    let config = ConfigBuilder::new()
        .from_yaml("segment:\n  name: partial\n")
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(config.segment.name, "partial");
    assert_eq!(config.segment.initial_size, 4096);
    assert_eq!(config.publisher.poll_interval, Duration::from_secs(1));
}

#[test]
fn test_cluster_id_bounds() {
    for id in [0, 1, 4095] {
        assert!(ConfigBuilder::new().cluster_id(id).build().is_ok(), "{} should be valid", id);
    }
    for id in [-1, 4096, i64::MAX] {
        match ConfigBuilder::new().cluster_id(id).build() {
            Err(MmvError::ClusterIdOutOfRange(got)) => assert_eq!(got, id),
            other => panic!("expected ClusterIdOutOfRange for {}, got {:?}", id, other),
        }
    }
}

#[test]
fn test_invalid_values_rejected() {
    assert!(ConfigBuilder::new().segment_name("").build().is_err());
    assert!(ConfigBuilder::new().segment_name("a/b").build().is_err());
    assert!(ConfigBuilder::new().poll_interval(Duration::ZERO).build().is_err());
    assert!(ConfigBuilder::new()
        .initial_size(1 << 20)
        .max_size(4096)
        .build()
        .is_err());
    assert!(ConfigBuilder::new()
        .id_strategy(IdStrategy::FixedStrict)
        .fixed_id("too.big", u32::MAX)
        .build()
        .is_err());
}

#[test]
fn test_malformed_yaml() {
    let result = ConfigBuilder::new().from_yaml("segment: [not, a, map]");
    assert!(matches!(result, Err(MmvError::Config(_))));
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "segment:\n  cluster_id: 17\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.segment.cluster_id, 17);

    assert!(Config::load(&dir.path().join("missing.yaml")).is_err());
}

#[test]
fn test_segment_options_from_config() {
    let config = ConfigBuilder::new()
        .segment_name("svc")
        .segment_dir(PathBuf::from("/tmp/mmv-options"))
        .cluster_id(99)
        .flags(SegmentFlags {
            no_prefix: false,
            process: true,
            sentinel: true,
        })
        .max_size(65536)
        .build()
        .unwrap();

    let options = SegmentOptions::from_config(&config).unwrap();
    match &options.location {
        SegmentLocation::File(path) => assert_eq!(path, &PathBuf::from("/tmp/mmv-options/svc")),
        SegmentLocation::Anonymous => panic!("expected a file-backed segment"),
    }
    assert_eq!(options.cluster.get(), 99);
    assert_eq!(options.flags, flags::PROCESS | flags::SENTINEL);
    assert_eq!(options.max_size, Some(65536));
    assert_eq!(options.process, std::process::id() as i32);
}
