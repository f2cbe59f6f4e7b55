//! String section of a segment.
//!
//! Names and help texts are interned so identical strings share one block.
//! Text values reserve private blocks that are never shared.

use crate::codec::value::{encode_string_block, STRING_BLOCK_BYTES};
use ahash::AHashMap;
use std::sync::Arc;

/// Index of a block in the string section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringId(pub u32);

impl StringId {
    /// Absolute offset of this block given the section's start
    pub fn offset(self, section_offset: usize) -> u64 {
        (section_offset + self.0 as usize * STRING_BLOCK_BYTES) as u64
    }
}

/// Ordered string blocks for one layout
#[derive(Debug, Default, Clone)]
pub struct StringPool {
    interned: AHashMap<Arc<str>, StringId>,
    blocks: Vec<Arc<str>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block holding `s`, shared with earlier identical strings
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.interned.get(s) {
            return id;
        }

        let arc_str: Arc<str> = Arc::from(s);
        let id = self.push(Arc::clone(&arc_str));
        self.interned.insert(arc_str, id);
        id
    }

    /// Interns non-empty text; empty help means "no help"
    pub fn intern_optional(&mut self, s: &str) -> Option<StringId> {
        if s.is_empty() {
            None
        } else {
            Some(self.intern(s))
        }
    }

    /// Private block initialised with `s`
    pub fn reserve(&mut self, s: &str) -> StringId {
        self.push(Arc::from(s))
    }

    pub fn get(&self, id: StringId) -> Option<Arc<str>> {
        self.blocks.get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Section size in bytes
    pub fn byte_len(&self) -> usize {
        self.blocks.len() * STRING_BLOCK_BYTES
    }

    /// Writes every block into `section`, which must be `byte_len()` long
    pub fn encode(&self, section: &mut [u8]) {
        for (block, text) in section.chunks_exact_mut(STRING_BLOCK_BYTES).zip(&self.blocks) {
            encode_string_block(text, block);
        }
    }

    fn push(&mut self, s: Arc<str>) -> StringId {
        let id = StringId(self.blocks.len() as u32);
        self.blocks.push(s);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_returns_same_id() {
        let mut pool = StringPool::new();

        let id1 = pool.intern("http.request.duration");
        let id2 = pool.intern("http.request.duration");

        assert_eq!(id1, id2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_intern_different_strings() {
        let mut pool = StringPool::new();

        let id1 = pool.intern("metric.one");
        let id2 = pool.intern("metric.two");

        assert_ne!(id1, id2);
        assert_eq!(pool.get(id2), Some(Arc::from("metric.two")));
    }

    #[test]
    fn test_reserved_blocks_are_private() {
        let mut pool = StringPool::new();

        let shared = pool.intern("same");
        let private = pool.reserve("same");
        assert_ne!(shared, private);
        assert_eq!(pool.intern("same"), shared);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_empty_help_is_not_stored() {
        let mut pool = StringPool::new();
        assert_eq!(pool.intern_optional(""), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_offsets_and_encoding() {
        let mut pool = StringPool::new();
        let a = pool.intern("a");
        let b = pool.intern("bc");
        assert_eq!(a.offset(1000), 1000);
        assert_eq!(b.offset(1000), 1000 + STRING_BLOCK_BYTES as u64);

        let mut section = vec![0xFFu8; pool.byte_len()];
        pool.encode(&mut section);
        assert_eq!(&section[..2], b"a\0");
        assert_eq!(&section[STRING_BLOCK_BYTES..STRING_BLOCK_BYTES + 3], b"bc\0");
        assert!(section[STRING_BLOCK_BYTES + 2..].iter().all(|&b| b == 0));
    }
}
