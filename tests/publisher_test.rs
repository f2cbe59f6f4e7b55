//! Publisher integration tests: background polling against file-backed segments.

mod common;

use common::*;
use mmv_export::codec::MetricValue;
use mmv_export::publisher::{PollOutcome, PublisherOptions, SnapshotPublisher};
use mmv_export::registry::MetricSpec;
use mmv_export::segment::{SegmentWriter, WriterPhase};
use mmv_export::MmvError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_options() -> PublisherOptions {
    PublisherOptions {
        poll_interval: Duration::from_millis(10),
        require_frozen_registry: false,
    }
}

/// Waits until `check` holds or the deadline passes.
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_registered_metric_appears_after_poll() {
    let segment = TempSegment::new("foo-eek");
    let registry = TestRegistryBuilder::new().counter("foo").build();
    let publisher = SnapshotPublisher::new(Arc::clone(&registry), segment.writer(), fast_options());

    publisher.start().await.unwrap();
    assert_eq!(publisher.rebuild_count(), 1);
    assert_eq!(segment.read().value_names(), vec!["foo".to_string()]);

    metric(&registry, "foo").inc(17).unwrap();
    let foo_item = segment.read().metric("foo").unwrap().item;

    registry.register(MetricSpec::counter("eek")).unwrap();
    assert!(eventually(|| publisher.rebuild_count() == 2).await);

    let snapshot = segment.read();
    let mut names = snapshot.value_names();
    names.sort();
    assert_eq!(names, vec!["eek".to_string(), "foo".to_string()]);
    assert_value!(snapshot, "foo", MetricValue::U64(17));
    assert_value!(snapshot, "eek", MetricValue::U64(0));
    assert_eq!(snapshot.metric("foo").unwrap().item, foo_item);

    // Nothing else changes, so nothing else is rebuilt
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(publisher.rebuild_count(), 2);

    publisher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_values_flow_without_rebuilds() {
    let segment = TempSegment::new("values");
    let registry = mixed_registry();
    let publisher = SnapshotPublisher::new(Arc::clone(&registry), segment.writer(), fast_options());
    publisher.start().await.unwrap();

    let generation = segment.read().header.generation;
    metric(&registry, "app.requests").inc(5).unwrap();
    metric(&registry, "db[replica].latency").set_f64(3.25).unwrap();

    let snapshot = segment.read();
    assert_value!(snapshot, "app.requests", MetricValue::U64(5));
    assert_value!(snapshot, "db.latency", "replica", MetricValue::F64(3.25));
    assert_eq!(snapshot.header.generation, generation);
    assert_eq!(publisher.rebuild_count(), 1);

    publisher.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_updates_racing_start_are_not_lost() {
    for round in 0..20 {
        let segment = TempSegment::new(&format!("race{}", round));
        let registry = TestRegistryBuilder::new().counter("hits").build();
        let writer = segment.writer();
        let publisher = SnapshotPublisher::new(Arc::clone(&registry), Arc::clone(&writer), fast_options());

        // Keep updating until the first document is out, so the last
        // update lands around the publish
        let updater = {
            let hits = metric(&registry, "hits");
            let writer = Arc::clone(&writer);
            std::thread::spawn(move || {
                let mut last = 0;
                while writer.stats().rebuilds == 0 {
                    last += 1;
                    hits.set_u64(last).unwrap();
                }
                last
            })
        };

        publisher.start().await.unwrap();
        let last = updater.join().unwrap();

        let settled = eventually(|| {
            segment.read().value_of("hits", None) == Some(&MetricValue::U64(last))
        })
        .await;
        assert!(settled, "round {}: last update {} never reached the segment", round, last);
        publisher.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_unregister_triggers_rebuild() {
    let segment = TempSegment::new("unregister");
    let registry = TestRegistryBuilder::new().counter("stay").counter("leave").build();
    let publisher = SnapshotPublisher::new(Arc::clone(&registry), segment.writer(), fast_options());
    publisher.start().await.unwrap();

    registry.unregister("leave").unwrap();
    assert!(eventually(|| publisher.rebuild_count() == 2).await);
    assert_eq!(segment.read().value_names(), vec!["stay".to_string()]);

    publisher.shutdown().await.unwrap();
}

#[test]
fn test_poll_once_is_idempotent() {
    let segment = TempSegment::new("idempotent");
    let registry = mixed_registry();
    let publisher = SnapshotPublisher::new(
        Arc::clone(&registry),
        segment.writer(),
        PublisherOptions::default(),
    );

    assert_eq!(publisher.poll_once().unwrap(), PollOutcome::Rebuilt);
    let first = segment.read();
    assert_eq!(publisher.poll_once().unwrap(), PollOutcome::Unchanged);
    assert_eq!(publisher.poll_once().unwrap(), PollOutcome::Unchanged);

    let second = segment.read();
    assert_eq!(second.header.generation, first.header.generation);
    assert_eq!(second.data_generation, first.data_generation);
    assert_eq!(publisher.poll_count(), 3);
}

#[tokio::test]
async fn test_frozen_registry_required() {
    let segment = TempSegment::new("frozen");
    let registry = mixed_registry();
    let options = PublisherOptions {
        require_frozen_registry: true,
        ..fast_options()
    };
    let publisher = SnapshotPublisher::new(Arc::clone(&registry), segment.writer(), options);

    assert!(matches!(publisher.start().await, Err(MmvError::RegistryNotFrozen)));
    assert!(!segment.path.exists());

    registry.freeze();
    publisher.start().await.unwrap();
    assert!(publisher.is_running());
    assert!(matches!(
        registry.register(MetricSpec::counter("late")),
        Err(MmvError::RegistryFrozen(_))
    ));

    publisher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_writer() {
    let segment = TempSegment::new("shutdown");
    let registry = mixed_registry();
    let writer = Arc::new(SegmentWriter::new(segment.options().remove_on_close(true)));
    let publisher = SnapshotPublisher::new(Arc::clone(&registry), Arc::clone(&writer), fast_options());

    publisher.start().await.unwrap();
    assert!(segment.path.exists());

    publisher.shutdown().await.unwrap();
    assert!(!publisher.is_running());
    assert_eq!(writer.state(), WriterPhase::Closed);
    assert!(!segment.path.exists());

    // Detached from the registry: updates no longer reach the closed writer
    metric(&registry, "app.requests").inc(1).unwrap();
    assert_eq!(writer.stats().value_writes, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_readers_never_see_torn_documents() {
    let segment = TempSegment::new("torn");
    let registry = mixed_registry();
    let writer = Arc::new(SegmentWriter::new(segment.options().with_initial_size(1 << 20)));
    let publisher = SnapshotPublisher::new(
        Arc::clone(&registry),
        Arc::clone(&writer),
        PublisherOptions {
            poll_interval: Duration::from_millis(1),
            require_frozen_registry: false,
        },
    );
    publisher.start().await.unwrap();

    let done = Arc::new(AtomicBool::new(false));

    let updater = {
        let registry = Arc::clone(&registry);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let requests = metric(&registry, "app.requests");
            let state = metric(&registry, "app.state");
            let mut i = 0u64;
            while !done.load(Ordering::Acquire) {
                requests.inc(1).unwrap();
                state.set_text(if i % 2 == 0 { "even" } else { "odd" }).unwrap();
                i += 1;
            }
        })
    };

    let churner = {
        let registry = Arc::clone(&registry);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let mut i = 0;
            while !done.load(Ordering::Acquire) {
                let name = format!("churn.metric{}", i % 4);
                if registry.unregister(&name).is_err() {
                    registry.register(MetricSpec::counter(name)).unwrap();
                }
                i += 1;
                std::thread::sleep(Duration::from_millis(2));
            }
        })
    };

    let reader = segment.reader().with_max_attempts(1000);
    let mut last_generation = 0;
    for _ in 0..300 {
        let snapshot = reader.read().unwrap();
        assert!(snapshot.header.generation >= last_generation);
        last_generation = snapshot.header.generation;
        assert_values_resolve(&snapshot);
        assert!(snapshot.value_of("app.requests", None).is_some());
        match snapshot.value_of("app.state", None) {
            Some(MetricValue::Text(text)) => assert!(text.len() < 256, "Oversized text {:?}", text),
            other => panic!("app.state missing or mistyped: {:?}", other),
        }
    }

    done.store(true, Ordering::Release);
    updater.join().unwrap();
    churner.join().unwrap();

    assert!(publisher.rebuild_count() > 1);
    publisher.shutdown().await.unwrap();
}
