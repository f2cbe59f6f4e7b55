//! Predefined, constant and refusing allocators.

use super::{AllocationError, IdSet, IdentifierAllocator};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Preloaded name → id table with a fallback for everything else.
///
/// The fallback is consulted when the name is unknown or its predefined id
/// is already taken.
#[derive(Debug, Clone)]
pub struct FixedMappingAllocator {
    ids: BTreeMap<String, u32>,
    fallback: Arc<dyn IdentifierAllocator>,
}

impl FixedMappingAllocator {
    pub fn new(ids: BTreeMap<String, u32>, fallback: Arc<dyn IdentifierAllocator>) -> Self {
        Self { ids, fallback }
    }

    /// Predefined id for `name`
    pub fn predefined(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }
}

impl IdentifierAllocator for FixedMappingAllocator {
    fn calculate_id(&self, name: &str, in_use: &IdSet) -> Result<u32, AllocationError> {
        match self.ids.get(name) {
            Some(&id) if !in_use.contains(&id) => Ok(id),
            _ => self.fallback.calculate_id(name, in_use),
        }
    }
}

/// Returns one configured id regardless of name or collisions.
#[derive(Debug, Clone, Copy)]
pub struct ConstantAllocator {
    id: u32,
}

impl ConstantAllocator {
    pub fn new(id: u32) -> Self {
        Self { id }
    }
}

impl IdentifierAllocator for ConstantAllocator {
    fn calculate_id(&self, _name: &str, _in_use: &IdSet) -> Result<u32, AllocationError> {
        Ok(self.id)
    }
}

/// Refuses every request; for setups where all ids are predeclared.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorThrowingAllocator;

impl IdentifierAllocator for ErrorThrowingAllocator {
    fn calculate_id(&self, _name: &str, _in_use: &IdSet) -> Result<u32, AllocationError> {
        Err(AllocationError::Forbidden)
    }
}
