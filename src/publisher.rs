//! Background task keeping the segment in step with the registry.
//!
//! On `start()` the publisher wires the writer in as the registry's value
//! listener, takes the first snapshot synchronously and then polls on a
//! fixed interval. Structural changes trigger a rebuild; dropped value updates
//! trigger a reconcile.

use crate::core::config::PublisherConfig;
use crate::core::error::{MmvError, Result};
use crate::registry::{MetricRegistry, ValueListener};
use crate::segment::{RebuildOutcome, SegmentWriter};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Publisher settings
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub poll_interval: Duration,
    /// Refuse to start unless the registry is frozen
    pub require_frozen_registry: bool,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            require_frozen_registry: false,
        }
    }
}

impl From<&PublisherConfig> for PublisherOptions {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            require_frozen_registry: config.require_frozen_registry,
        }
    }
}

/// What a single poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged,
    Reconciled,
    Rebuilt,
}

#[derive(Default)]
struct Published {
    names: Vec<String>,
    version: Option<u64>,
}

/// State shared with the polling task
struct Shared {
    registry: Arc<MetricRegistry>,
    writer: Arc<SegmentWriter>,
    published: Mutex<Published>,
    rebuilds: AtomicU64,
    polls: AtomicU64,
}

impl Shared {
    fn poll_once(&self) -> Result<PollOutcome> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.registry.snapshot();
        let names = snapshot.names();

        let mut published = self.published.lock();
        let unchanged = published.version == Some(snapshot.version) && published.names == names;

        if unchanged {
            if self.writer.needs_reconcile() {
                self.writer.reconcile()?;
                return Ok(PollOutcome::Reconciled);
            }
            return Ok(PollOutcome::Unchanged);
        }

        let outcome = self.writer.rebuild(&snapshot)?;
        let added = names.iter().filter(|n| !published.names.contains(n)).count();
        let removed = published.names.iter().filter(|n| !names.contains(n)).count();
        published.names = names;
        published.version = Some(snapshot.version);

        match outcome {
            RebuildOutcome::Rebuilt { generation, grew } => {
                self.rebuilds.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(added, removed, generation, grew, "Registry changed, segment rebuilt");
                Ok(PollOutcome::Rebuilt)
            },
            RebuildOutcome::Unchanged => Ok(PollOutcome::Unchanged),
        }
    }
}

/// Owns the polling task for one registry/writer pair
pub struct SnapshotPublisher {
    shared: Arc<Shared>,
    options: PublisherOptions,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<Arc<dyn ValueListener>>>,
}

impl SnapshotPublisher {
    pub fn new(registry: Arc<MetricRegistry>, writer: Arc<SegmentWriter>, options: PublisherOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                writer,
                published: Mutex::new(Published::default()),
                rebuilds: AtomicU64::new(0),
                polls: AtomicU64::new(0),
            }),
            options,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            task: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Publishes the first snapshot and starts polling in the background
    pub async fn start(&self) -> Result<()> {
        if self.options.require_frozen_registry && !self.shared.registry.is_frozen() {
            return Err(MmvError::RegistryNotFrozen);
        }
        if self.task.lock().is_some() {
            return Ok(());
        }

        // Listen before the first snapshot: updates racing it are dropped
        // with the reconcile flag raised instead of being missed
        let listener: Arc<dyn ValueListener> = Arc::clone(&self.shared.writer) as Arc<dyn ValueListener>;
        self.shared.registry.add_listener(Arc::clone(&listener));
        if let Err(e) = self.poll_once() {
            self.shared.registry.remove_listener(&listener);
            return Err(e);
        }
        *self.listener.lock() = Some(listener);
        self.shutdown.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let poll_interval = self.options.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            while !shutdown.load(Ordering::Acquire) {
                tokio::select! {
                    _ = ticker.tick() => {},
                    _ = wake.notified() => continue,
                }

                match shared.poll_once() {
                    Ok(PollOutcome::Unchanged) => {},
                    Ok(outcome) => tracing::debug!(?outcome, "Publisher tick"),
                    Err(MmvError::Closed) => {
                        tracing::debug!("Segment writer closed, publisher exiting");
                        break;
                    },
                    Err(e) if e.is_recoverable() => {
                        tracing::warn!(error = %e, category = e.category(), "Segment rebuild failed");
                    },
                    Err(e) => {
                        tracing::error!(error = %e, category = e.category(), "Segment rebuild failed");
                    },
                }
            }
        });
        *self.task.lock() = Some(handle);

        tracing::info!(
            interval = ?poll_interval,
            metrics = self.shared.registry.len(),
            "Snapshot publisher started"
        );
        Ok(())
    }

    /// Runs one poll on the caller's thread
    pub fn poll_once(&self) -> Result<PollOutcome> {
        self.shared.poll_once()
    }

    /// Stops the polling task and detaches the writer from the registry
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();

        if let Some(listener) = self.listener.lock().take() {
            self.shared.registry.remove_listener(&listener);
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.await?;
            tracing::info!("Snapshot publisher stopped");
        }
        Ok(())
    }

    /// Stops polling and closes the writer
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await?;
        self.shared.writer.close()
    }

    /// Rebuilds performed so far
    pub fn rebuild_count(&self) -> u64 {
        self.shared.rebuilds.load(Ordering::Relaxed)
    }

    /// Polls performed so far, including the initial one
    pub fn poll_count(&self) -> u64 {
        self.shared.polls.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub fn writer(&self) -> &Arc<SegmentWriter> {
        &self.shared.writer
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.shared.registry
    }
}

impl Drop for SnapshotPublisher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricSpec;
    use crate::segment::SegmentOptions;

    fn publisher(options: PublisherOptions) -> SnapshotPublisher {
        SnapshotPublisher::new(
            Arc::new(MetricRegistry::new()),
            Arc::new(SegmentWriter::new(SegmentOptions::anonymous())),
            options,
        )
    }

    #[test]
    fn test_poll_rebuilds_only_on_change() {
        let publisher = publisher(PublisherOptions::default());
        publisher.registry().register(MetricSpec::counter("foo")).unwrap();

        assert_eq!(publisher.poll_once().unwrap(), PollOutcome::Rebuilt);
        assert_eq!(publisher.poll_once().unwrap(), PollOutcome::Unchanged);

        publisher.registry().register(MetricSpec::counter("eek")).unwrap();
        assert_eq!(publisher.poll_once().unwrap(), PollOutcome::Rebuilt);
        assert_eq!(publisher.rebuild_count(), 2);
    }

    #[test]
    fn test_dropped_update_triggers_reconcile() {
        let publisher = publisher(PublisherOptions::default());
        publisher.registry().register(MetricSpec::counter("hits")).unwrap();
        publisher.poll_once().unwrap();

        // Forces a drop: a different object under the published name
        publisher.registry().unregister("hits").unwrap();
        let writer = Arc::clone(publisher.writer());
        let stray = MetricRegistry::new().register(MetricSpec::counter("hits")).unwrap();
        writer.update_value(&stray, &crate::codec::MetricValue::U64(1)).unwrap();
        assert!(writer.needs_reconcile());

        // The name set changed, so this is a rebuild, which covers the drop
        assert_eq!(publisher.poll_once().unwrap(), PollOutcome::Rebuilt);
        assert!(!writer.needs_reconcile());
    }

    #[tokio::test]
    async fn test_update_before_first_publish_is_reconciled() {
        let publisher = publisher(PublisherOptions {
            poll_interval: Duration::from_millis(5),
            ..PublisherOptions::default()
        });
        let hits = publisher.registry().register(MetricSpec::counter("hits")).unwrap();
        let writer = Arc::clone(publisher.writer());

        // Same state as an update landing between the listener attach and
        // the first publish: nothing is mapped yet, so it is dropped
        assert_eq!(
            writer.update_value(&hits, &crate::codec::MetricValue::U64(7)).unwrap(),
            crate::segment::UpdateOutcome::Dropped
        );
        assert!(writer.needs_reconcile());

        publisher.start().await.unwrap();
        assert!(!writer.needs_reconcile());

        hits.inc(1).unwrap();
        let snapshot = crate::segment::SegmentSnapshot::decode(&writer.snapshot_bytes().unwrap()).unwrap();
        assert_eq!(snapshot.value_of("hits", None), Some(&crate::codec::MetricValue::U64(1)));
        publisher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_first_poll_detaches_listener() {
        let publisher = publisher(PublisherOptions::default());
        publisher.registry().register(MetricSpec::counter("cache[a].hits")).unwrap();
        let other = publisher.registry().register(MetricSpec::gauge("cache[b].hits")).unwrap();

        assert!(matches!(
            publisher.start().await,
            Err(MmvError::InconsistentMetric { .. })
        ));
        assert!(!publisher.is_running());

        other.set_f64(1.0).unwrap();
        assert_eq!(publisher.writer().stats().dropped_updates, 0);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let publisher = publisher(PublisherOptions {
            poll_interval: Duration::from_millis(5),
            ..PublisherOptions::default()
        });
        publisher.registry().register(MetricSpec::counter("foo")).unwrap();

        publisher.start().await.unwrap();
        publisher.stop().await.unwrap();
        assert!(!publisher.is_running());

        publisher.start().await.unwrap();
        publisher.registry().register(MetricSpec::counter("eek")).unwrap();
        for _ in 0..200 {
            if publisher.rebuild_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(publisher.is_running());
        assert_eq!(publisher.rebuild_count(), 2);
        publisher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_frozen_registry() {
        let publisher = publisher(PublisherOptions {
            require_frozen_registry: true,
            ..PublisherOptions::default()
        });
        assert!(matches!(publisher.start().await, Err(MmvError::RegistryNotFrozen)));

        publisher.registry().freeze();
        publisher.start().await.unwrap();
        assert!(publisher.is_running());
        publisher.shutdown().await.unwrap();
        assert!(!publisher.is_running());
    }
}
