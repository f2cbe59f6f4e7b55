//! Reader side of the segment format.
//!
//! [`SegmentReader`] maps a segment file read-only and copies it out
//! following the generation protocol; [`SegmentSnapshot`] decodes a
//! consistent copy into plain structs for inspection and dumping.

use super::{
    data_generation_offset, header, toc, HEADER_BYTES, INDOM_BYTES, INSTANCE_BYTES, MAGIC, METRIC_BYTES, NO_INDOM,
    TOC_BYTES, VALUE_BYTES, VERSION,
};
use crate::codec::value::decode_string_block;
use crate::codec::{MetricValue, Unit, ValueKind, SLOT_BYTES, STRING_BLOCK_BYTES};
use crate::core::error::{MmvError, Result};
use crate::core::types::Semantics;
use memmap2::Mmap;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::time::Duration;

/// Decoded header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderInfo {
    pub version: i32,
    pub generation: u64,
    pub tocs: usize,
    pub flags: i32,
    pub process: i32,
    pub cluster: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainEntry {
    pub serial: u32,
    pub instances: u32,
    /// Names of the instances the domain's entry points at, in order
    pub instance_names: Vec<String>,
    pub short_help: Option<String>,
    pub long_help: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceEntry {
    pub domain_serial: u32,
    pub internal: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEntry {
    pub name: String,
    pub item: u32,
    pub kind: ValueKind,
    pub semantics: Semantics,
    pub units: u32,
    pub unit: String,
    pub domain_serial: Option<u32>,
    pub short_help: Option<String>,
    pub long_help: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueEntry {
    /// Offset of the value entry in the document
    pub offset: u64,
    pub metric: String,
    pub instance: Option<String>,
    pub value: MetricValue,
}

/// Fully decoded document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentSnapshot {
    pub header: HeaderInfo,
    pub data_generation: u64,
    pub domains: Vec<DomainEntry>,
    pub instances: Vec<InstanceEntry>,
    pub metrics: Vec<MetricEntry>,
    pub values: Vec<ValueEntry>,
}

impl SegmentSnapshot {
    /// Decodes a consistent copy of a segment
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let doc = Document(bytes);
        if bytes.len() < HEADER_BYTES {
            return Err(MmvError::corrupt(format!("{} bytes is too short for a header", bytes.len())));
        }
        if bytes[header::MAGIC..header::MAGIC + 4] != MAGIC {
            return Err(MmvError::corrupt("bad magic"));
        }
        let version = doc.i32(header::VERSION)?;
        if version != VERSION {
            return Err(MmvError::corrupt(format!("unsupported version {}", version)));
        }

        let g1 = doc.u64(header::GENERATION_1)?;
        let g2 = doc.u64(header::GENERATION_2)?;
        if g1 != g2 || g1 == 0 {
            return Err(MmvError::corrupt(format!("generations differ ({} vs {})", g1, g2)));
        }

        let tocs = doc.count(header::TOC_COUNT)?;
        let header_info = HeaderInfo {
            version,
            generation: g1,
            tocs,
            flags: doc.i32(header::FLAGS)?,
            process: doc.i32(header::PROCESS)?,
            cluster: doc.i32(header::CLUSTER)?,
        };

        let mut sections = Sections::default();
        for i in 0..tocs {
            let at = HEADER_BYTES + i * TOC_BYTES;
            let entry = (doc.count(at + 4)?, doc.u64(at + 8)? as usize);
            match doc.i32(at)? {
                toc::INDOMS => sections.indoms = entry,
                toc::INSTANCES => sections.instances = entry,
                toc::METRICS => sections.metrics = entry,
                toc::VALUES => sections.values = entry,
                toc::STRINGS => {},
                other => return Err(MmvError::corrupt(format!("unknown section type {}", other))),
            }
        }
        let data_generation = doc.u64(data_generation_offset(tocs))?;

        let mut domains = Vec::with_capacity(sections.indoms.0);
        for i in 0..sections.indoms.0 {
            let at = sections.indoms.1 + i * INDOM_BYTES;
            let count = doc.u32(at + 4)?;
            let first = doc.u64(at + 8)? as usize;
            let mut instance_names = Vec::with_capacity(count as usize);
            for j in 0..count as usize {
                let instance_at = j
                    .checked_mul(INSTANCE_BYTES)
                    .and_then(|delta| first.checked_add(delta))
                    .ok_or_else(|| MmvError::corrupt(format!("instance run of indom {} overflows", i)))?;
                let owner = doc.u64(instance_at)? as usize;
                if owner != at {
                    return Err(MmvError::corrupt(format!(
                        "instance {} of indom {} belongs to the indom at offset {}",
                        j, i, owner
                    )));
                }
                instance_names.push(doc.string(doc.u64(instance_at + 16)?)?);
            }
            domains.push(DomainEntry {
                serial: doc.u32(at)?,
                instances: count,
                instance_names,
                short_help: doc.optional_string(doc.u64(at + 16)?)?,
                long_help: doc.optional_string(doc.u64(at + 24)?)?,
            });
        }

        let mut instances = Vec::with_capacity(sections.instances.0);
        for i in 0..sections.instances.0 {
            let at = sections.instances.1 + i * INSTANCE_BYTES;
            let domain_at = doc.u64(at)? as usize;
            instances.push(InstanceEntry {
                domain_serial: doc.u32(domain_at)?,
                internal: doc.i32(at + 12)?,
                name: doc.string(doc.u64(at + 16)?)?,
            });
        }

        let mut metrics = Vec::with_capacity(sections.metrics.0);
        let mut kinds = Vec::with_capacity(sections.metrics.0);
        for i in 0..sections.metrics.0 {
            let at = sections.metrics.1 + i * METRIC_BYTES;
            let type_tag = doc.i32(at + 12)?;
            let kind = ValueKind::from_protocol_type(type_tag)
                .ok_or_else(|| MmvError::corrupt(format!("unknown type tag {}", type_tag)))?;
            let semantics_code = doc.i32(at + 16)?;
            let semantics = Semantics::from_code(semantics_code)
                .ok_or_else(|| MmvError::corrupt(format!("unknown semantics {}", semantics_code)))?;
            let units = doc.u32(at + 20)?;
            let indom = doc.u32(at + 24)?;

            kinds.push((at, kind));
            metrics.push(MetricEntry {
                name: doc.string(doc.u64(at)?)?,
                item: doc.u32(at + 8)?,
                kind,
                semantics,
                units,
                unit: Unit::unpack(units)?.to_string(),
                domain_serial: (indom != NO_INDOM).then_some(indom),
                short_help: doc.optional_string(doc.u64(at + 32)?)?,
                long_help: doc.optional_string(doc.u64(at + 40)?)?,
            });
        }

        let mut values = Vec::with_capacity(sections.values.0);
        for i in 0..sections.values.0 {
            let at = sections.values.1 + i * VALUE_BYTES;
            let metric_at = doc.u64(at + 16)? as usize;
            let index = kinds
                .iter()
                .position(|(offset, _)| *offset == metric_at)
                .ok_or_else(|| MmvError::corrupt(format!("value {} points at no metric", i)))?;
            let kind = kinds[index].1;

            let instance_at = doc.u64(at + 24)?;
            let instance = if instance_at == 0 {
                None
            } else {
                Some(doc.string(doc.u64(instance_at as usize + 16)?)?)
            };

            let slot: &[u8; SLOT_BYTES] = doc
                .range(at, SLOT_BYTES)?
                .try_into()
                .map_err(|_| MmvError::corrupt("short value slot"))?;
            let value = kind.decode(slot, |offset| doc.range(offset as usize, STRING_BLOCK_BYTES).ok())?;

            values.push(ValueEntry {
                offset: at as u64,
                metric: metrics[index].name.clone(),
                instance,
                value,
            });
        }

        Ok(Self {
            header: header_info,
            data_generation,
            domains,
            instances,
            metrics,
            values,
        })
    }

    /// Value of `metric`, optionally for one instance
    pub fn value_of(&self, metric: &str, instance: Option<&str>) -> Option<&MetricValue> {
        self.values
            .iter()
            .find(|v| v.metric == metric && v.instance.as_deref() == instance)
            .map(|v| &v.value)
    }

    /// Descriptor of a base metric name
    pub fn metric(&self, name: &str) -> Option<&MetricEntry> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Full names (`domain[instance].field` for instanced values)
    pub fn value_names(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|v| match &v.instance {
                Some(instance) => instanced_name(&v.metric, instance),
                None => v.metric.clone(),
            })
            .collect()
    }
}

impl fmt::Display for SegmentSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "MMV v{} generation={} data-generation={} cluster={} process={} flags={:#x}",
            self.header.version,
            self.header.generation,
            self.data_generation,
            self.header.cluster,
            self.header.process,
            self.header.flags
        )?;
        for metric in &self.metrics {
            writeln!(
                f,
                "  {} item={} type={} semantics={:?} units={}{}",
                metric.name,
                metric.item,
                metric.kind,
                metric.semantics,
                metric.unit,
                metric.short_help.as_deref().map(|h| format!(" \"{}\"", h)).unwrap_or_default()
            )?;
        }
        for (name, value) in self.value_names().iter().zip(&self.values) {
            writeln!(f, "  {} = {}", name, value.value)?;
        }
        Ok(())
    }
}

/// `subsystem[instance].field` from the base name `subsystem.field`
fn instanced_name(base: &str, instance: &str) -> String {
    match base.split_once('.') {
        Some((domain, field)) => format!("{}[{}].{}", domain, instance, field),
        None => format!("{}[{}]", base, instance),
    }
}

#[derive(Debug, Default)]
struct Sections {
    indoms: (usize, usize),
    instances: (usize, usize),
    metrics: (usize, usize),
    values: (usize, usize),
}

struct Document<'a>(&'a [u8]);

impl<'a> Document<'a> {
    fn range(&self, at: usize, len: usize) -> Result<&'a [u8]> {
        at.checked_add(len)
            .and_then(|end| self.0.get(at..end))
            .ok_or_else(|| MmvError::corrupt(format!("offset {} beyond {} bytes", at, self.0.len())))
    }

    fn u32(&self, at: usize) -> Result<u32> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.range(at, 4)?);
        Ok(u32::from_le_bytes(word))
    }

    fn i32(&self, at: usize) -> Result<i32> {
        Ok(self.u32(at)? as i32)
    }

    fn count(&self, at: usize) -> Result<usize> {
        let value = self.i32(at)?;
        usize::try_from(value).map_err(|_| MmvError::corrupt(format!("negative count {}", value)))
    }

    fn u64(&self, at: usize) -> Result<u64> {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.range(at, 8)?);
        Ok(u64::from_le_bytes(word))
    }

    fn string(&self, offset: u64) -> Result<String> {
        decode_string_block(self.range(offset as usize, STRING_BLOCK_BYTES)?)
    }

    fn optional_string(&self, offset: u64) -> Result<Option<String>> {
        if offset == 0 {
            Ok(None)
        } else {
            self.string(offset).map(Some)
        }
    }
}

/// Copies `map` if its generation words agree before and after the copy
pub fn consistent_copy(map: &[u8]) -> Option<Vec<u8>> {
    if map.len() < HEADER_BYTES {
        return None;
    }
    let word = |at: usize| {
        // SAFETY: in bounds; mappings are page aligned and the offsets are multiples of 8
        let atomic = unsafe { &*(map.as_ptr().add(at) as *const AtomicU64) };
        u64::from_le(atomic.load(Ordering::Acquire))
    };

    let before = word(header::GENERATION_2);
    fence(Ordering::Acquire);
    let copy = map.to_vec();
    fence(Ordering::Acquire);
    let after = word(header::GENERATION_1);

    (before == after && before != 0).then_some(copy)
}

/// Reads segment files written by another process
#[derive(Debug, Clone)]
pub struct SegmentReader {
    path: PathBuf,
    max_attempts: u32,
    retry_delay: Duration,
}

impl SegmentReader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            max_attempts: 100,
            retry_delay: Duration::from_millis(1),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent raw copy of the segment
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        for attempt in 1..=self.max_attempts {
            // Remap every attempt; a grown segment is a new file
            let file = match File::open(&self.path) {
                Ok(file) => file,
                // Briefly absent while growth replaces it
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && attempt < self.max_attempts => {
                    std::thread::sleep(self.retry_delay);
                    continue;
                },
                Err(e) => return Err(e.into()),
            };
            // SAFETY: the map is only read through `consistent_copy`
            let map = unsafe { Mmap::map(&file)? };
            if let Some(bytes) = consistent_copy(&map) {
                return Ok(bytes);
            }
            tracing::trace!(attempt, path = %self.path.display(), "Torn segment read, retrying");
            std::thread::sleep(self.retry_delay);
        }
        Err(MmvError::TornRead {
            attempts: self.max_attempts,
        })
    }

    /// Consistent decoded snapshot
    pub fn read(&self) -> Result<SegmentSnapshot> {
        SegmentSnapshot::decode(&self.read_bytes()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{TimeScale, Unit};
    use crate::registry::{MetricRegistry, MetricSpec};
    use crate::segment::{SegmentOptions, SegmentWriter};
    use pretty_assertions::assert_eq;

    fn published(registry: &MetricRegistry) -> Vec<u8> {
        let writer = SegmentWriter::new(SegmentOptions::anonymous());
        writer.rebuild(&registry.snapshot()).unwrap();
        writer.snapshot_bytes().unwrap()
    }

    #[test]
    fn test_decode_instances_and_help() {
        let registry = MetricRegistry::new();
        registry
            .register(
                MetricSpec::gauge("disk[sda].latency")
                    .unit(Unit::time(TimeScale::Millisecond))
                    .help("Disk latency", "Mean service time"),
            )
            .unwrap();
        registry
            .register(MetricSpec::gauge("disk[sdb].latency").unit(Unit::time(TimeScale::Millisecond)))
            .unwrap();
        registry.describe_domain("disk", "Block devices", "").unwrap();

        let snapshot = SegmentSnapshot::decode(&published(&registry)).unwrap();
        assert_eq!(snapshot.metrics.len(), 1);
        assert_eq!(snapshot.domains.len(), 1);
        assert_eq!(snapshot.domains[0].instances, 2);
        assert_eq!(snapshot.domains[0].instance_names, vec!["sda".to_string(), "sdb".to_string()]);
        assert_eq!(snapshot.domains[0].short_help.as_deref(), Some("Block devices"));
        assert_eq!(snapshot.domains[0].long_help, None);

        let metric = snapshot.metric("disk.latency").unwrap();
        assert_eq!(metric.kind, ValueKind::F64);
        assert_eq!(metric.unit, "millisec");
        assert_eq!(metric.domain_serial, Some(snapshot.domains[0].serial));
        assert_eq!(metric.long_help.as_deref(), Some("Mean service time"));

        assert_eq!(
            snapshot.value_names(),
            vec!["disk[sda].latency".to_string(), "disk[sdb].latency".to_string()]
        );
        assert_eq!(snapshot.value_of("disk.latency", Some("sdb")), Some(&MetricValue::F64(0.0)));
    }

    #[test]
    fn test_torn_document_rejected() {
        let registry = MetricRegistry::new();
        registry.register(MetricSpec::counter("c")).unwrap();
        let mut bytes = published(&registry);
        bytes[header::GENERATION_1] ^= 1;
        assert!(SegmentSnapshot::decode(&bytes).is_err());
        assert!(consistent_copy(&bytes).is_none());
    }

    #[test]
    fn test_decode_interleaved_domains() {
        let registry = MetricRegistry::new();
        registry.register(MetricSpec::counter("a[x].v")).unwrap();
        registry.register(MetricSpec::counter("b[y].v")).unwrap();
        registry.register(MetricSpec::counter("a[z].v")).unwrap();

        let snapshot = SegmentSnapshot::decode(&published(&registry)).unwrap();
        assert_eq!(snapshot.domains.len(), 2);
        assert_eq!(snapshot.domains[0].instance_names, vec!["x".to_string(), "z".to_string()]);
        assert_eq!(snapshot.domains[1].instance_names, vec!["y".to_string()]);
        assert_eq!(snapshot.value_names(), vec!["a[x].v", "b[y].v", "a[z].v"]);
    }

    #[test]
    fn test_foreign_instance_in_domain_run_rejected() {
        let registry = MetricRegistry::new();
        registry.register(MetricSpec::counter("a[x].v")).unwrap();
        registry.register(MetricSpec::counter("b[y].v")).unwrap();
        let mut bytes = published(&registry);

        // Claim two instances for the first domain; the second belongs to `b`
        let indoms = (0..SegmentSnapshot::decode(&bytes).unwrap().header.tocs)
            .map(|i| HEADER_BYTES + i * TOC_BYTES)
            .find(|&at| i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) == toc::INDOMS)
            .map(|at| u64::from_le_bytes(bytes[at + 8..at + 16].try_into().unwrap()) as usize)
            .unwrap();
        bytes[indoms + 4..indoms + 8].copy_from_slice(&2u32.to_le_bytes());

        let err = SegmentSnapshot::decode(&bytes).unwrap_err();
        assert!(matches!(err, MmvError::CorruptSegment(_)));
    }

    #[test]
    fn test_corrupt_offsets_rejected() {
        let registry = MetricRegistry::new();
        registry.register(MetricSpec::counter("c")).unwrap();
        let bytes = published(&registry);
        assert!(SegmentSnapshot::decode(&bytes[..bytes.len() - 10]).is_err());
        assert!(SegmentSnapshot::decode(&bytes[..12]).is_err());
    }

    #[test]
    fn test_reader_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("app");
        let registry = MetricRegistry::new();
        registry.register(MetricSpec::text("app.state")).unwrap();

        let writer = SegmentWriter::new(SegmentOptions::file(&path));
        writer.rebuild(&registry.snapshot()).unwrap();

        let snapshot = SegmentReader::new(&path).read().unwrap();
        assert_eq!(snapshot.value_of("app.state", None), Some(&MetricValue::Text(String::new())));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["metrics"][0]["name"], "app.state");
    }

    #[test]
    fn test_reader_gives_up_on_empty_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("zeros");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let err = SegmentReader::new(&path)
            .with_max_attempts(3)
            .with_retry_delay(Duration::ZERO)
            .read()
            .unwrap_err();
        assert!(matches!(err, MmvError::TornRead { attempts: 3 }));
    }

    #[test]
    fn test_missing_file_reported_after_retries() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = SegmentReader::new(dir.path().join("absent"))
            .with_max_attempts(2)
            .with_retry_delay(Duration::ZERO)
            .read()
            .unwrap_err();
        assert!(matches!(err, MmvError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
    }
}
