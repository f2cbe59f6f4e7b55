//! Segment writer: publishes registry snapshots and applies value updates.
//!
//! Every full rewrite follows the generation protocol: the first generation
//! word is stamped, the body is written, then the second word receives the
//! same stamp. Readers copy the document between reading the second and
//! the first word and retry when they differ.

use super::layout::{Allocators, HeaderFields, IdTables, Layout};
use super::mapping::{SegmentLocation, SegmentMapping};
use super::{flags, header};
use crate::codec::value::encode_string_block;
use crate::codec::{MetricValue, STRING_BLOCK_BYTES};
use crate::core::config::Config;
use crate::core::error::{MmvError, Result};
use crate::core::types::ClusterId;
use crate::identifier::{HashingAllocator, ID_LIMIT};
use crate::registry::{Metric, RegistrySnapshot, ValueListener};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Smallest segment ever mapped
const MIN_SEGMENT_BYTES: usize = 256;

/// Lifecycle of a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum WriterPhase {
    Uninitialized = 0,
    Building = 1,
    Published = 2,
    Rebuilding = 3,
    Closed = 4,
}

impl WriterPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WriterPhase::Building,
            2 => WriterPhase::Published,
            3 => WriterPhase::Rebuilding,
            4 => WriterPhase::Closed,
            _ => WriterPhase::Uninitialized,
        }
    }
}

/// Result of a rebuild request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// Same metrics as the published document; nothing was written
    Unchanged,
    /// A new document was published with this generation stamp
    Rebuilt { generation: u64, grew: bool },
}

/// Result of a steady-state value update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Written,
    /// Not applied; the next reconcile picks the value up
    Dropped,
}

/// Writer counters for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub phase: WriterPhase,
    pub rebuilds: u64,
    pub grows: u64,
    pub value_writes: u64,
    pub dropped_updates: u64,
    pub reconciles: u64,
    /// Mapped bytes
    pub capacity: usize,
    /// Bytes used by the published document
    pub used: usize,
    /// Generation stamp of the published document
    pub generation: u64,
}

/// Where and how the segment is written
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    pub location: SegmentLocation,
    pub cluster: ClusterId,
    pub flags: i32,
    pub process: i32,
    /// Lower bound for the first mapping
    pub initial_size: usize,
    /// Ceiling for growth
    pub max_size: Option<usize>,
    pub remove_on_close: bool,
    pub allocators: Allocators,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            location: SegmentLocation::Anonymous,
            cluster: ClusterId::default(),
            flags: 0,
            process: std::process::id() as i32,
            initial_size: 4096,
            max_size: None,
            remove_on_close: false,
            allocators: Allocators {
                metrics: Arc::new(HashingAllocator::new()),
                domains: Arc::new(HashingAllocator::new()),
                instances: HashingAllocator::new(),
            },
        }
    }
}

impl SegmentOptions {
    /// Process-private segment
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Segment in a file at `path`
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            location: SegmentLocation::File(path.into()),
            ..Self::default()
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterId) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_flags(mut self, flags: i32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_initial_size(mut self, bytes: usize) -> Self {
        self.initial_size = bytes;
        self
    }

    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = Some(bytes);
        self
    }

    pub fn with_allocators(mut self, allocators: Allocators) -> Self {
        self.allocators = allocators;
        self
    }

    pub fn remove_on_close(mut self, remove: bool) -> Self {
        self.remove_on_close = remove;
        self
    }

    /// Builds options from validated configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let segment = &config.segment;
        let ids = &config.identifiers;

        let mut flag_bits = 0;
        if segment.flags.no_prefix {
            flag_bits |= flags::NO_PREFIX;
        }
        if segment.flags.process {
            flag_bits |= flags::PROCESS;
        }
        if segment.flags.sentinel {
            flag_bits |= flags::SENTINEL;
        }

        let mut instances = HashingAllocator::with_limit(ids.limit);
        if let Some(probes) = ids.max_probes {
            instances = instances.with_max_probes(probes);
        }

        Ok(Self {
            location: SegmentLocation::File(segment.path()),
            cluster: ClusterId::new(segment.cluster_id)?,
            flags: flag_bits,
            process: std::process::id() as i32,
            initial_size: segment.initial_size,
            max_size: segment.max_size,
            remove_on_close: segment.remove_on_close,
            allocators: Allocators {
                metrics: ids.strategy.allocator(&ids.fixed, ids.constant_id, ids.limit.min(ID_LIMIT)),
                domains: ids.strategy.allocator(&ids.fixed, ids.constant_id, ids.limit.min(ID_LIMIT)),
                instances,
            },
        })
    }

    fn header_fields(&self) -> HeaderFields {
        HeaderFields {
            flags: self.flags,
            process: self.process,
            cluster: self.cluster,
        }
    }
}

#[derive(Default)]
struct WriterState {
    mapping: Option<SegmentMapping>,
    layout: Option<Layout>,
    ids: IdTables,
    generation: u64,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    rebuilds: AtomicU64,
    grows: AtomicU64,
    value_writes: AtomicU64,
    dropped_updates: AtomicU64,
    reconciles: AtomicU64,
}

/// Single owner of one shared segment
pub struct SegmentWriter {
    options: SegmentOptions,
    /// Rebuild lock: exclusive for rebuild and close, shared for updates
    state: RwLock<WriterState>,
    phase: AtomicU8,
    reconcile_needed: AtomicBool,
    counters: Counters,
}

impl SegmentWriter {
    /// Creates a writer; nothing is mapped until the first rebuild
    pub fn new(options: SegmentOptions) -> Self {
        Self {
            options,
            state: RwLock::new(WriterState::default()),
            phase: AtomicU8::new(WriterPhase::Uninitialized as u8),
            reconcile_needed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn options(&self) -> &SegmentOptions {
        &self.options
    }

    /// Current lifecycle phase
    pub fn state(&self) -> WriterPhase {
        WriterPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Segment file path, if file backed
    pub fn path(&self) -> Option<&Path> {
        self.options.location.path()
    }

    /// True when an update was dropped since the last rebuild or reconcile
    pub fn needs_reconcile(&self) -> bool {
        self.reconcile_needed.load(Ordering::Acquire)
    }

    /// Publishes `snapshot`, growing the segment when needed.
    ///
    /// On error the previously published document, phase and identifier
    /// reservations are left as they were.
    pub fn rebuild(&self, snapshot: &RegistrySnapshot) -> Result<RebuildOutcome> {
        let mut state = self.state.write();
        if state.closed {
            return Err(MmvError::Closed);
        }
        if state.layout.as_ref().is_some_and(|layout| layout.matches(snapshot)) {
            return Ok(RebuildOutcome::Unchanged);
        }

        // Values are read below, so earlier drops are covered
        self.reconcile_needed.store(false, Ordering::Release);

        let previous = self.state();
        let working = if state.layout.is_some() {
            WriterPhase::Rebuilding
        } else {
            WriterPhase::Building
        };
        self.set_phase(working);

        match self.publish(&mut state, snapshot) {
            Ok(outcome) => {
                self.set_phase(WriterPhase::Published);
                Ok(outcome)
            },
            Err(e) => {
                self.set_phase(previous);
                Err(e)
            },
        }
    }

    fn publish(&self, state: &mut WriterState, snapshot: &RegistrySnapshot) -> Result<RebuildOutcome> {
        let mut ids = state.ids.clone();
        let layout = Layout::plan(snapshot, &mut ids, &self.options.allocators)?;
        let required = layout.total_size();

        let current = state.mapping.as_ref().map_or(0, SegmentMapping::len);
        let grow_to = if state.mapping.is_none() {
            Some(self.capacity_for(required, self.options.initial_size)?)
        } else if required > current {
            Some(self.capacity_for(required, current.saturating_mul(2))?)
        } else {
            None
        };

        let data_generation = match (&state.mapping, &state.layout) {
            (Some(mapping), Some(old)) => mapping.load_u64(old.data_generation_offset(), Ordering::Acquire)? + 1,
            _ => 1,
        };

        let grown = match grow_to {
            Some(capacity) => Some(SegmentMapping::create(&self.options.location, capacity)?),
            None => None,
        };
        let grew = grown.is_some() && state.mapping.is_some();

        let generation = next_stamp(state.generation);
        let document = layout.encode(&self.options.header_fields(), data_generation);
        {
            let target = match (&grown, &state.mapping) {
                (Some(mapping), _) | (None, Some(mapping)) => mapping,
                (None, None) => return Err(MmvError::corrupt("no mapping to publish into")),
            };
            write_document(target, &document, generation)?;
        }

        if let Some(mapping) = grown {
            if grew {
                self.counters.grows.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    capacity = mapping.len(),
                    previous = current,
                    required,
                    "Grew segment"
                );
            } else {
                tracing::info!(location = ?self.options.location, capacity = mapping.len(), "Created segment");
            }
            state.mapping = Some(mapping);
        }

        tracing::debug!(
            metrics = layout.metric_count(),
            values = layout.slots().len(),
            domains = layout.domain_count(),
            bytes = required,
            generation,
            "Published segment"
        );

        state.layout = Some(layout);
        state.ids = ids;
        state.generation = generation;
        self.counters.rebuilds.fetch_add(1, Ordering::Relaxed);

        Ok(RebuildOutcome::Rebuilt { generation, grew })
    }

    fn capacity_for(&self, required: usize, at_least: usize) -> Result<usize> {
        let capacity = required
            .max(at_least)
            .max(MIN_SEGMENT_BYTES)
            .checked_next_power_of_two()
            .unwrap_or(usize::MAX);
        match self.options.max_size {
            Some(limit) if required > limit => Err(MmvError::CapacityExceeded { required, limit }),
            Some(limit) => Ok(capacity.min(limit)),
            None => Ok(capacity),
        }
    }

    /// Writes `value` into the published slot of `metric` without blocking
    pub fn update_value(&self, metric: &Metric, value: &MetricValue) -> Result<UpdateOutcome> {
        let Some(state) = self.state.try_read() else {
            return Ok(self.drop_update(metric, "rebuild in progress"));
        };
        if state.closed {
            return Err(MmvError::Closed);
        }
        let (Some(mapping), Some(layout)) = (&state.mapping, &state.layout) else {
            return Ok(self.drop_update(metric, "nothing published"));
        };
        let Some(slot) = layout.slot_for(metric) else {
            return Ok(self.drop_update(metric, "not in published layout"));
        };

        write_value(mapping, slot, value)?;
        mapping.increment_u64(layout.data_generation_offset())?;
        self.counters.value_writes.fetch_add(1, Ordering::Relaxed);
        Ok(UpdateOutcome::Written)
    }

    fn drop_update(&self, metric: &Metric, reason: &'static str) -> UpdateOutcome {
        self.reconcile_needed.store(true, Ordering::Release);
        self.counters.dropped_updates.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = %metric.name(), reason, "Dropped value update");
        UpdateOutcome::Dropped
    }

    /// Rewrites every published slot from its metric's current value
    pub fn reconcile(&self) -> Result<()> {
        let state = self.state.read();
        if state.closed {
            return Err(MmvError::Closed);
        }
        let (Some(mapping), Some(layout)) = (&state.mapping, &state.layout) else {
            return Ok(());
        };

        self.reconcile_needed.store(false, Ordering::Release);
        for slot in layout.slots() {
            slot.metric.with_value(|value| write_value(mapping, slot, value))?;
        }
        mapping.increment_u64(layout.data_generation_offset())?;
        self.counters.reconciles.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(values = layout.slots().len(), "Reconciled segment values");
        Ok(())
    }

    /// Copy of the published document
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        let state = self.state.read();
        if state.closed {
            return Err(MmvError::Closed);
        }
        match (&state.mapping, &state.layout) {
            (Some(mapping), Some(layout)) => {
                let mut bytes = mapping.copy_out();
                bytes.truncate(layout.total_size());
                Ok(bytes)
            },
            _ => Ok(Vec::new()),
        }
    }

    /// Metric item id reserved for a base name
    pub fn metric_id(&self, base_name: &str) -> Option<u32> {
        self.state.read().ids.metrics.get(base_name)
    }

    pub fn stats(&self) -> WriterStats {
        let state = self.state.read();
        WriterStats {
            phase: self.state(),
            rebuilds: self.counters.rebuilds.load(Ordering::Relaxed),
            grows: self.counters.grows.load(Ordering::Relaxed),
            value_writes: self.counters.value_writes.load(Ordering::Relaxed),
            dropped_updates: self.counters.dropped_updates.load(Ordering::Relaxed),
            reconciles: self.counters.reconciles.load(Ordering::Relaxed),
            capacity: state.mapping.as_ref().map_or(0, SegmentMapping::len),
            used: state.layout.as_ref().map_or(0, Layout::total_size),
            generation: state.generation,
        }
    }

    /// Unmaps the segment; later operations fail with [`MmvError::Closed`]
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.set_phase(WriterPhase::Closed);

        if let Some(mapping) = state.mapping.take() {
            mapping.flush()?;
            if self.options.remove_on_close {
                mapping.remove_file()?;
            }
        }
        state.layout = None;
        tracing::info!(location = ?self.options.location, "Closed segment writer");
        Ok(())
    }

    fn set_phase(&self, phase: WriterPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

impl ValueListener for SegmentWriter {
    fn value_changed(&self, metric: &Metric, value: &MetricValue) {
        match self.update_value(metric, value) {
            Ok(_) | Err(MmvError::Closed) => {},
            Err(e) => {
                self.reconcile_needed.store(true, Ordering::Release);
                tracing::warn!(metric = %metric.name(), error = %e, "Failed to write value");
            },
        }
    }
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("location", &self.options.location)
            .field("phase", &self.state())
            .finish()
    }
}

/// Strictly increasing wall-clock milliseconds
fn next_stamp(previous: u64) -> u64 {
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    now.max(previous + 1)
}

fn write_document(mapping: &SegmentMapping, document: &[u8], generation: u64) -> Result<()> {
    mapping.store_u64(header::GENERATION_1, generation, Ordering::Release)?;
    fence(Ordering::Release);

    mapping.write_bytes(0, &document[..header::GENERATION_1])?;
    mapping.write_bytes(header::TOC_COUNT, &document[header::TOC_COUNT..])?;
    let tail = mapping.len() - document.len();
    if tail > 0 {
        mapping.fill(document.len(), tail, 0)?;
    }

    fence(Ordering::Release);
    mapping.store_u64(header::GENERATION_2, generation, Ordering::Release)
}

fn write_value(mapping: &SegmentMapping, slot: &super::layout::Slot, value: &MetricValue) -> Result<()> {
    if value.kind() != slot.kind() {
        return Err(MmvError::TypeMismatch {
            name: slot.metric.name().to_string(),
            expected: slot.kind().name(),
            actual: value.kind().name(),
        });
    }

    match (value, slot.text_blocks) {
        (MetricValue::Text(text), Some(blocks)) => {
            // Fill the block readers are not pointed at, then swap
            let next = 1 - slot.active_block.load(Ordering::Acquire).min(1);
            let target = blocks[usize::from(next)];
            let mut block = [0u8; STRING_BLOCK_BYTES];
            encode_string_block(text, &mut block);
            mapping.write_bytes(target as usize, &block)?;
            fence(Ordering::Release);
            mapping.store_u64(slot.offset + 8, target, Ordering::Release)?;
            mapping.store_u64(slot.offset, text.len() as u64, Ordering::Release)?;
            slot.active_block.store(next, Ordering::Release);
        },
        _ => {
            let (word, _) = value.slot_words(0);
            mapping.store_u64(slot.offset, word, Ordering::Release)?;
        },
    }
    Ok(())
}
