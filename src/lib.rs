//! mmv-export - publish in-process metrics through a PCP MMV segment.
//!
//! Metrics live in an explicitly constructed [`registry::MetricRegistry`].
//! A [`segment::SegmentWriter`] lays them out in a memory-mapped file using
//! the MMV version 2 format, which the Performance Co-Pilot `pmdammv` agent
//! polls directly. A [`publisher::SnapshotPublisher`] keeps the file in step
//! with the registry from a background task.
//!
//! # Architecture
//!
//! - `identifier`: stable numeric ids for names
//! - `codec`: value slots and packed unit words
//! - `registry`: typed metrics with change notification
//! - `segment`: layout planning, the writer and a reader
//! - `publisher`: background rebuild/reconcile loop
//! - `core`: errors, configuration, names
//! - `cli`: command-line interface
//!
//! # Example
//!
//! ```no_run
//! use mmv_export::publisher::{PublisherOptions, SnapshotPublisher};
//! use mmv_export::registry::{MetricRegistry, MetricSpec};
//! use mmv_export::segment::{SegmentOptions, SegmentWriter};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(MetricRegistry::new());
//!     let requests = registry.register(MetricSpec::counter("http.requests"))?;
//!
//!     let writer = Arc::new(SegmentWriter::new(SegmentOptions::file("/var/tmp/mmv/app")));
//!     let publisher = SnapshotPublisher::new(registry, writer, PublisherOptions::default());
//!     publisher.start().await?;
//!
//!     requests.inc(1)?;
//!     publisher.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cli;
pub mod codec;
pub mod core;
pub mod identifier;
pub mod publisher;
pub mod registry;
pub mod segment;

// Re-export core types for convenience
pub use crate::core::{Config, MmvError, Result};
