//! Common test utilities and fixtures.

#![allow(dead_code)]

use mmv_export::codec::{MetricValue, TimeScale, Unit, ValueKind};
use mmv_export::core::Semantics;
use mmv_export::registry::{Metric, MetricRegistry, MetricSpec, ValueListener};
use mmv_export::segment::{SegmentOptions, SegmentReader, SegmentSnapshot, SegmentWriter};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A segment file inside a temporary directory that lives as long as the fixture.
pub struct TempSegment {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TempSegment {
    pub fn new(name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mmv").join(name);
        Self { dir, path }
    }

    pub fn options(&self) -> SegmentOptions {
        SegmentOptions::file(&self.path)
    }

    pub fn writer(&self) -> Arc<SegmentWriter> {
        Arc::new(SegmentWriter::new(self.options()))
    }

    pub fn reader(&self) -> SegmentReader {
        SegmentReader::new(&self.path)
    }

    pub fn read(&self) -> SegmentSnapshot {
        self.reader().read().unwrap()
    }
}

/// Builder for registries with a known set of metrics.
pub struct TestRegistryBuilder {
    registry: Arc<MetricRegistry>,
}

impl TestRegistryBuilder {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(MetricRegistry::new()),
        }
    }

    pub fn counter(self, name: &str) -> Self {
        self.registry.register(MetricSpec::counter(name)).unwrap();
        self
    }

    pub fn gauge(self, name: &str) -> Self {
        self.registry.register(MetricSpec::gauge(name)).unwrap();
        self
    }

    pub fn latency(self, name: &str) -> Self {
        self.registry
            .register(
                MetricSpec::new(name, ValueKind::F64)
                    .semantics(Semantics::Instant)
                    .unit(Unit::time(TimeScale::Millisecond))
                    .help("Request latency", "Latency of the most recent request"),
            )
            .unwrap();
        self
    }

    pub fn text(self, name: &str, initial: &str) -> Self {
        self.registry
            .register(MetricSpec::text(name).initial(MetricValue::Text(initial.to_string())))
            .unwrap();
        self
    }

    pub fn build(self) -> Arc<MetricRegistry> {
        self.registry
    }
}

impl Default for TestRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with one plain counter, one instanced gauge pair and a text metric.
pub fn mixed_registry() -> Arc<MetricRegistry> {
    TestRegistryBuilder::new()
        .counter("app.requests")
        .latency("db[primary].latency")
        .latency("db[replica].latency")
        .text("app.state", "starting")
        .build()
}

pub fn metric(registry: &MetricRegistry, name: &str) -> Arc<Metric> {
    registry.get(name).unwrap()
}

/// Routes value notifications from `registry` straight into `writer`.
pub fn attach(registry: &MetricRegistry, writer: &Arc<SegmentWriter>) {
    let listener: Arc<dyn ValueListener> = Arc::clone(writer) as Arc<dyn ValueListener>;
    registry.add_listener(listener);
}

/// Verify every value in the snapshot belongs to a decoded metric.
pub fn assert_values_resolve(snapshot: &SegmentSnapshot) {
    for value in &snapshot.values {
        assert!(
            snapshot.metric(&value.metric).is_some(),
            "Value at {} points at unknown metric {}",
            value.offset,
            value.metric
        );
    }
}

/// Macro for asserting a decoded value.
#[macro_export]
macro_rules! assert_value {
    ($snapshot:expr, $metric:expr, $expected:expr) => {
        assert_eq!($snapshot.value_of($metric, None), Some(&$expected), "Wrong value for {}", $metric);
    };
    ($snapshot:expr, $metric:expr, $instance:expr, $expected:expr) => {
        assert_eq!(
            $snapshot.value_of($metric, Some($instance)),
            Some(&$expected),
            "Wrong value for {}[{}]",
            $metric,
            $instance
        );
    };
}
