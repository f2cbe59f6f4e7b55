//! Layout planning: from a registry snapshot to a complete document.
//!
//! Planning is pure apart from identifier reservation, which happens in
//! tables the caller owns and commits only when the rebuild succeeds.

use super::string_pool::{StringId, StringPool};
use super::{
    data_generation_offset, header, toc, DATA_GENERATION_BYTES, INDOM_BYTES, INSTANCE_BYTES,
    MAGIC, METRIC_BYTES, NO_INDOM, VALUE_BYTES, VERSION,
};
use crate::codec::{MetricValue, Unit, ValueKind, SLOT_BYTES, STRING_BLOCK_BYTES};
use crate::core::error::{IdSpace, MmvError, Result};
use crate::core::types::{ClusterId, Semantics};
use crate::identifier::{HashingAllocator, IdentifierAllocator, IdentifierTable};
use crate::registry::{DomainHelp, Metric, RegistrySnapshot};
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

/// Allocators used while planning
#[derive(Debug, Clone)]
pub struct Allocators {
    pub metrics: Arc<dyn IdentifierAllocator>,
    pub domains: Arc<dyn IdentifierAllocator>,
    pub instances: HashingAllocator,
}

/// Identifier reservations that survive rebuilds
#[derive(Debug, Clone)]
pub struct IdTables {
    pub metrics: IdentifierTable,
    pub domains: IdentifierTable,
    pub instances: AHashMap<String, IdentifierTable>,
}

impl IdTables {
    pub fn new() -> Self {
        Self {
            metrics: IdentifierTable::new(IdSpace::Metric),
            domains: IdentifierTable::new(IdSpace::InstanceDomain),
            instances: AHashMap::new(),
        }
    }
}

impl Default for IdTables {
    fn default() -> Self {
        Self::new()
    }
}

/// Header fields that do not come from the metric set
#[derive(Debug, Clone, Copy)]
pub struct HeaderFields {
    pub flags: i32,
    pub process: i32,
    pub cluster: ClusterId,
}

#[derive(Debug)]
struct Descriptor {
    item: u32,
    name: StringId,
    kind: ValueKind,
    semantics: Semantics,
    unit: Unit,
    domain: Option<usize>,
    short_help: Option<StringId>,
    long_help: Option<StringId>,
}

#[derive(Debug)]
struct Domain {
    name: String,
    serial: u32,
    instances: Vec<usize>,
    short_help: Option<StringId>,
    long_help: Option<StringId>,
}

#[derive(Debug)]
struct Instance {
    domain: usize,
    internal: u32,
    name: StringId,
}

/// Value slot bound to one registry metric
#[derive(Debug)]
pub struct Slot {
    pub(crate) metric: Arc<Metric>,
    descriptor: usize,
    instance: Option<usize>,
    initial: MetricValue,
    /// Value entry offset in the document
    pub(crate) offset: usize,
    /// Double-buffered string blocks for text metrics
    pub(crate) text_blocks: Option<[u64; 2]>,
    /// Which text block the slot currently points at
    pub(crate) active_block: AtomicU8,
}

impl Slot {
    pub fn kind(&self) -> ValueKind {
        self.metric.kind()
    }
}

/// Section offsets of a planned document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sections {
    pub tocs: usize,
    pub indoms: usize,
    pub instances: usize,
    pub metrics: usize,
    pub values: usize,
    pub strings: usize,
    pub total: usize,
}

/// Complete plan of one document
#[derive(Debug)]
pub struct Layout {
    descriptors: Vec<Descriptor>,
    domains: Vec<Domain>,
    instances: Vec<Instance>,
    slots: Vec<Slot>,
    slot_index: AHashMap<String, usize>,
    strings: StringPool,
    sections: Sections,
    domain_help: BTreeMap<String, DomainHelp>,
}

impl Layout {
    /// Plans the document for `snapshot`, reserving ids in `ids`
    pub fn plan(snapshot: &RegistrySnapshot, ids: &mut IdTables, allocators: &Allocators) -> Result<Self> {
        let mut strings = StringPool::new();
        let mut descriptors: Vec<Descriptor> = Vec::new();
        let mut descriptor_index: AHashMap<&str, usize> = AHashMap::new();
        let mut domains: Vec<Domain> = Vec::new();
        let mut domain_index: AHashMap<&str, usize> = AHashMap::new();
        let mut instances: Vec<Instance> = Vec::new();
        let mut instance_index: AHashMap<(usize, &str), usize> = AHashMap::new();

        let mut slot_refs = Vec::with_capacity(snapshot.metrics.len());

        for metric in &snapshot.metrics {
            let name = metric.name();

            let domain = match name.domain() {
                Some(domain_name) => Some(match domain_index.get(domain_name) {
                    Some(&index) => index,
                    None => {
                        let serial = ids.domains.id_for(domain_name, allocators.domains.as_ref())?;
                        let help = snapshot.domain_help.get(domain_name);
                        let index = domains.len();
                        domains.push(Domain {
                            name: domain_name.to_string(),
                            serial,
                            instances: Vec::new(),
                            short_help: help.and_then(|h| strings.intern_optional(&h.short)),
                            long_help: help.and_then(|h| strings.intern_optional(&h.long)),
                        });
                        domain_index.insert(domain_name, index);
                        index
                    },
                }),
                None => None,
            };

            let instance = match (domain, name.instance()) {
                (Some(domain), Some(instance_name)) => Some(match instance_index.get(&(domain, instance_name)) {
                    Some(&index) => index,
                    None => {
                        let table = ids
                            .instances
                            .entry(domains[domain].name.clone())
                            .or_insert_with(|| IdentifierTable::new(IdSpace::Instance));
                        let internal = table.id_for(instance_name, &allocators.instances)?;
                        let index = instances.len();
                        instances.push(Instance {
                            domain,
                            internal,
                            name: strings.intern(instance_name),
                        });
                        domains[domain].instances.push(index);
                        instance_index.insert((domain, instance_name), index);
                        index
                    },
                }),
                _ => None,
            };

            let descriptor = match descriptor_index.get(name.base()) {
                Some(&index) => {
                    check_consistent(&descriptors[index], metric, domain)?;
                    let existing = &mut descriptors[index];
                    if existing.short_help.is_none() {
                        existing.short_help = strings.intern_optional(metric.short_help());
                    }
                    if existing.long_help.is_none() {
                        existing.long_help = strings.intern_optional(metric.long_help());
                    }
                    index
                },
                None => {
                    let item = ids.metrics.id_for(name.base(), allocators.metrics.as_ref())?;
                    let index = descriptors.len();
                    descriptors.push(Descriptor {
                        item,
                        name: strings.intern(name.base()),
                        kind: metric.kind(),
                        semantics: metric.semantics(),
                        unit: metric.unit(),
                        domain,
                        short_help: strings.intern_optional(metric.short_help()),
                        long_help: strings.intern_optional(metric.long_help()),
                    });
                    descriptor_index.insert(name.base(), index);
                    index
                },
            };

            slot_refs.push((Arc::clone(metric), descriptor, instance));
        }

        // Readers walk a domain's instances as one contiguous run
        let (instances, position) = group_by_domain(&mut domains, instances);

        // Text slots own two private blocks each; block 0 starts active
        let mut slots = Vec::with_capacity(slot_refs.len());
        let mut text_ids = Vec::with_capacity(slot_refs.len());
        for (metric, descriptor, instance) in slot_refs {
            let instance = instance.map(|index| position[index]);
            let initial = metric.value();
            let blocks = match &initial {
                MetricValue::Text(text) => Some([strings.reserve(text), strings.reserve("")]),
                _ => None,
            };
            text_ids.push(blocks);
            slots.push(Slot {
                metric,
                descriptor,
                instance,
                initial,
                offset: 0,
                text_blocks: None,
                active_block: AtomicU8::new(0),
            });
        }

        let sections = compute_sections(domains.len(), instances.len(), descriptors.len(), slots.len(), strings.len());

        let mut slot_index = AHashMap::with_capacity(slots.len());
        for (i, (slot, blocks)) in slots.iter_mut().zip(text_ids).enumerate() {
            slot.offset = sections.values + i * VALUE_BYTES;
            slot.text_blocks = blocks.map(|[a, b]| [a.offset(sections.strings), b.offset(sections.strings)]);
            slot_index.insert(slot.metric.name().to_string(), i);
        }

        Ok(Self {
            descriptors,
            domains,
            instances,
            slots,
            slot_index,
            strings,
            sections,
            domain_help: snapshot.domain_help.clone(),
        })
    }

    /// Section offsets
    pub fn sections(&self) -> Sections {
        self.sections
    }

    /// Document size in bytes
    pub fn total_size(&self) -> usize {
        self.sections.total
    }

    /// Offset of the data generation word
    pub fn data_generation_offset(&self) -> usize {
        data_generation_offset(self.sections.tocs)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Slot currently bound to exactly this metric object
    pub fn slot_for(&self, metric: &Metric) -> Option<&Slot> {
        let slot = &self.slots[*self.slot_index.get(metric.name().as_str())?];
        std::ptr::eq(Arc::as_ptr(&slot.metric), metric).then_some(slot)
    }

    /// True when this layout was planned from exactly these metrics and help
    pub fn matches(&self, snapshot: &RegistrySnapshot) -> bool {
        self.slots.len() == snapshot.metrics.len()
            && self
                .slots
                .iter()
                .zip(&snapshot.metrics)
                .all(|(slot, metric)| Arc::ptr_eq(&slot.metric, metric))
            && self.domain_help == snapshot.domain_help
    }

    /// Metric item id assigned to a base name
    pub fn item_of(&self, base_name: &str) -> Option<u32> {
        self.descriptors
            .iter()
            .find(|d| self.strings.get(d.name).as_deref() == Some(base_name))
            .map(|d| d.item)
    }

    /// Serial assigned to an instance domain
    pub fn domain_serial(&self, domain: &str) -> Option<u32> {
        self.domains.iter().find(|d| d.name == domain).map(|d| d.serial)
    }

    pub fn metric_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Encodes the whole document; both generation words are left zero
    pub fn encode(&self, fields: &HeaderFields, data_generation: u64) -> Vec<u8> {
        let s = &self.sections;
        let mut doc = vec![0u8; s.total];

        doc[header::MAGIC..header::MAGIC + 4].copy_from_slice(&MAGIC);
        put_i32(&mut doc, header::VERSION, VERSION);
        put_i32(&mut doc, header::TOC_COUNT, s.tocs as i32);
        put_i32(&mut doc, header::FLAGS, fields.flags);
        put_i32(&mut doc, header::PROCESS, fields.process);
        put_i32(&mut doc, header::CLUSTER, i32::from(fields.cluster.get()));

        let mut tocs = Vec::with_capacity(s.tocs);
        if !self.domains.is_empty() {
            tocs.push((toc::INDOMS, self.domains.len(), s.indoms));
            tocs.push((toc::INSTANCES, self.instances.len(), s.instances));
        }
        tocs.push((toc::METRICS, self.descriptors.len(), s.metrics));
        tocs.push((toc::VALUES, self.slots.len(), s.values));
        if !self.strings.is_empty() {
            tocs.push((toc::STRINGS, self.strings.len(), s.strings));
        }
        for (i, (kind, count, offset)) in tocs.into_iter().enumerate() {
            let at = super::HEADER_BYTES + i * super::TOC_BYTES;
            put_i32(&mut doc, at, kind);
            put_i32(&mut doc, at + 4, count as i32);
            put_u64(&mut doc, at + 8, offset as u64);
        }
        put_u64(&mut doc, data_generation_offset(s.tocs), data_generation);

        let string_offset = |id: Option<StringId>| id.map_or(0, |id| id.offset(s.strings));

        for (i, domain) in self.domains.iter().enumerate() {
            let at = s.indoms + i * INDOM_BYTES;
            let first_instance = domain
                .instances
                .first()
                .map_or(0, |&index| s.instances + index * INSTANCE_BYTES);
            put_u32(&mut doc, at, domain.serial);
            put_u32(&mut doc, at + 4, domain.instances.len() as u32);
            put_u64(&mut doc, at + 8, first_instance as u64);
            put_u64(&mut doc, at + 16, string_offset(domain.short_help));
            put_u64(&mut doc, at + 24, string_offset(domain.long_help));
        }

        for (i, instance) in self.instances.iter().enumerate() {
            let at = s.instances + i * INSTANCE_BYTES;
            put_u64(&mut doc, at, (s.indoms + instance.domain * INDOM_BYTES) as u64);
            put_u32(&mut doc, at + 8, 0);
            put_u32(&mut doc, at + 12, instance.internal);
            put_u64(&mut doc, at + 16, instance.name.offset(s.strings));
        }

        for (i, descriptor) in self.descriptors.iter().enumerate() {
            let at = s.metrics + i * METRIC_BYTES;
            let indom = descriptor.domain.map_or(NO_INDOM, |d| self.domains[d].serial);
            put_u64(&mut doc, at, descriptor.name.offset(s.strings));
            put_u32(&mut doc, at + 8, descriptor.item);
            put_i32(&mut doc, at + 12, descriptor.kind.protocol_type());
            put_i32(&mut doc, at + 16, descriptor.semantics.code());
            put_u32(&mut doc, at + 20, descriptor.unit.pack());
            put_u32(&mut doc, at + 24, indom);
            put_u32(&mut doc, at + 28, 0);
            put_u64(&mut doc, at + 32, string_offset(descriptor.short_help));
            put_u64(&mut doc, at + 40, string_offset(descriptor.long_help));
        }

        for slot in &self.slots {
            let mut area = [0u8; SLOT_BYTES];
            let text_offset = slot.text_blocks.map_or(0, |blocks| blocks[0]);
            slot.initial.encode(&mut area, text_offset);
            doc[slot.offset..slot.offset + SLOT_BYTES].copy_from_slice(&area);

            let instance = slot
                .instance
                .map_or(0, |index| (s.instances + index * INSTANCE_BYTES) as u64);
            put_u64(&mut doc, slot.offset + 16, (s.metrics + slot.descriptor * METRIC_BYTES) as u64);
            put_u64(&mut doc, slot.offset + 24, instance);
        }

        self.strings.encode(&mut doc[s.strings..s.strings + self.strings.byte_len()]);
        doc
    }
}

fn check_consistent(existing: &Descriptor, metric: &Metric, domain: Option<usize>) -> Result<()> {
    let name = metric.name().base();
    let mismatch = |reason: String| MmvError::InconsistentMetric {
        name: name.to_string(),
        reason,
    };

    if existing.kind != metric.kind() {
        return Err(mismatch(format!("kind {} vs {}", existing.kind, metric.kind())));
    }
    if existing.semantics != metric.semantics() {
        return Err(mismatch(format!(
            "semantics {:?} vs {:?}",
            existing.semantics,
            metric.semantics()
        )));
    }
    if existing.unit != metric.unit() {
        return Err(mismatch(format!("unit {} vs {}", existing.unit, metric.unit())));
    }
    if existing.domain != domain {
        return Err(mismatch("mixes instanced and plain metrics".to_string()));
    }
    Ok(())
}

/// Reorders instances domain by domain. Returns the grouped instances and
/// each original index's new position; domain lists are rewritten in place.
fn group_by_domain(domains: &mut [Domain], instances: Vec<Instance>) -> (Vec<Instance>, Vec<usize>) {
    let mut position = vec![0; instances.len()];
    let mut pending: Vec<Option<Instance>> = instances.into_iter().map(Some).collect();
    let mut grouped = Vec::with_capacity(pending.len());

    for domain in domains.iter_mut() {
        for index in domain.instances.iter_mut() {
            if let Some(instance) = pending[*index].take() {
                position[*index] = grouped.len();
                grouped.push(instance);
            }
            *index = position[*index];
        }
    }
    (grouped, position)
}

fn compute_sections(domains: usize, instances: usize, metrics: usize, values: usize, strings: usize) -> Sections {
    let tocs = 2 + if domains > 0 { 2 } else { 0 } + usize::from(strings > 0);
    let indoms = data_generation_offset(tocs) + DATA_GENERATION_BYTES;
    let instances_at = indoms + domains * INDOM_BYTES;
    let metrics_at = instances_at + instances * INSTANCE_BYTES;
    let values_at = metrics_at + metrics * METRIC_BYTES;
    let strings_at = values_at + values * VALUE_BYTES;
    Sections {
        tocs,
        indoms,
        instances: instances_at,
        metrics: metrics_at,
        values: values_at,
        strings: strings_at,
        total: strings_at + strings * STRING_BLOCK_BYTES,
    }
}

fn put_i32(doc: &mut [u8], at: usize, value: i32) {
    doc[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(doc: &mut [u8], at: usize, value: u32) {
    doc[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(doc: &mut [u8], at: usize, value: u64) {
    doc[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
