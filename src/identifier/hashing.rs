//! Hash-based identifier allocation with linear probing.

use super::{AllocationError, IdSet, IdentifierAllocator, ID_LIMIT};

/// 32-bit polynomial hash over UTF-16 code units (`h = h * 31 + c`).
pub fn string_hash(name: &str) -> i32 {
    name.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Derives ids from the string hash of the name.
///
/// A taken id is resolved by probing `(id + 1) mod limit` until a free one
/// turns up or the probe budget runs out.
#[derive(Debug, Clone)]
pub struct HashingAllocator {
    limit: u32,
    max_probes: u64,
}

impl HashingAllocator {
    /// Full 31-bit id space
    pub fn new() -> Self {
        Self::with_limit(ID_LIMIT)
    }

    /// Ids restricted to `[0, limit)`
    pub fn with_limit(limit: u32) -> Self {
        let limit = limit.clamp(1, ID_LIMIT);
        Self {
            limit,
            max_probes: u64::from(limit),
        }
    }

    /// Caps the number of candidates tried per allocation
    pub fn with_max_probes(mut self, max_probes: u64) -> Self {
        self.max_probes = max_probes.max(1);
        self
    }

    /// Upper bound (exclusive) of generated ids
    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn initial_id(&self, name: &str) -> u32 {
        // i32::MIN has no positive counterpart
        let hash = string_hash(name);
        let magnitude = if hash == i32::MIN { 0 } else { hash.unsigned_abs() };
        magnitude % self.limit
    }
}

impl Default for HashingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierAllocator for HashingAllocator {
    fn calculate_id(&self, name: &str, in_use: &IdSet) -> Result<u32, AllocationError> {
        let mut id = self.initial_id(name);
        for _ in 0..self.max_probes {
            if !in_use.contains(&id) {
                return Ok(id);
            }
            id = if id + 1 >= self.limit { 0 } else { id + 1 };
        }
        Err(AllocationError::Exhausted)
    }
}
