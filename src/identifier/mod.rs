//! Stable numeric identifiers for metric, instance-domain and instance names.
//!
//! Allocators are stateless strategies over the contract
//! `calculate_id(name, ids_in_use)`. [`IdentifierTable`] layers the
//! name → id memory on top so a name keeps its id for the lifetime of a
//! writer, and ids are never handed out twice.

pub mod fixed;
pub mod hashing;

pub use fixed::{ConstantAllocator, ErrorThrowingAllocator, FixedMappingAllocator};
pub use hashing::{string_hash, HashingAllocator};

use crate::core::error::{IdSpace, MmvError, Result};
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Ids are non-negative 31-bit integers.
pub const ID_LIMIT: u32 = 1 << 31;

/// Set of identifiers already handed out in one id space
pub type IdSet = AHashSet<u32>;

/// Why an allocator could not produce an identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// Every candidate the allocator is willing to try is taken
    Exhausted,
    /// The allocator refuses to allocate dynamically
    Forbidden,
}

/// Strategy that maps a name to an identifier not present in `in_use`
pub trait IdentifierAllocator: Send + Sync + fmt::Debug {
    /// Calculates an id for `name`
    fn calculate_id(&self, name: &str, in_use: &IdSet) -> std::result::Result<u32, AllocationError>;
}

/// Allocation strategy selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdStrategy {
    /// Hash the name, probe linearly on collision
    #[default]
    Hashing,
    /// Predefined ids, hashing for everything else
    Fixed,
    /// Predefined ids only; any other name is an error
    FixedStrict,
    /// One constant id for every name
    Constant,
}

impl IdStrategy {
    /// Builds the allocator for this strategy
    pub fn allocator(
        self,
        fixed: &BTreeMap<String, u32>,
        constant_id: u32,
        limit: u32,
    ) -> Arc<dyn IdentifierAllocator> {
        match self {
            IdStrategy::Hashing => Arc::new(HashingAllocator::with_limit(limit)),
            IdStrategy::Fixed => Arc::new(FixedMappingAllocator::new(
                fixed.clone(),
                Arc::new(HashingAllocator::with_limit(limit)),
            )),
            IdStrategy::FixedStrict => Arc::new(FixedMappingAllocator::new(
                fixed.clone(),
                Arc::new(ErrorThrowingAllocator),
            )),
            IdStrategy::Constant => Arc::new(ConstantAllocator::new(constant_id)),
        }
    }
}

/// Name → id reservations for one id space
#[derive(Debug, Clone)]
pub struct IdentifierTable {
    space: IdSpace,
    assigned: AHashMap<String, u32>,
    in_use: IdSet,
}

impl IdentifierTable {
    /// Creates an empty table
    pub fn new(space: IdSpace) -> Self {
        Self {
            space,
            assigned: AHashMap::new(),
            in_use: IdSet::new(),
        }
    }

    /// Returns the id reserved for `name`, allocating one on first sight
    pub fn id_for(&mut self, name: &str, allocator: &dyn IdentifierAllocator) -> Result<u32> {
        if let Some(&id) = self.assigned.get(name) {
            return Ok(id);
        }

        let id = allocator.calculate_id(name, &self.in_use).map_err(|e| match e {
            AllocationError::Exhausted => MmvError::AllocationExhausted {
                name: name.to_string(),
                space: self.space,
            },
            AllocationError::Forbidden => MmvError::DynamicAllocationForbidden(name.to_string()),
        })?;

        // Allocators such as Constant ignore collisions
        if !self.in_use.insert(id) {
            return Err(MmvError::AllocationExhausted {
                name: name.to_string(),
                space: self.space,
            });
        }
        self.assigned.insert(name.to_string(), id);
        Ok(id)
    }

    /// Id previously reserved for `name`
    pub fn get(&self, name: &str) -> Option<u32> {
        self.assigned.get(name).copied()
    }

    /// Number of reservations
    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    /// True when nothing has been reserved
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}
