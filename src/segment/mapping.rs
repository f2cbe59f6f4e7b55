//! Shared mapping backing a segment.
//!
//! The mapping is accessed through raw pointers because other processes
//! read it concurrently. Word-sized fields are read and written with
//! atomic operations; bulk writes only happen while readers are fenced
//! off by the generation protocol.

use crate::core::error::{MmvError, Result};
use memmap2::{MmapOptions, MmapRaw};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Where a segment lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentLocation {
    /// Memory-mapped file other processes can open
    File(PathBuf),
    /// Process-private memory, mainly for tests
    Anonymous,
}

impl SegmentLocation {
    pub fn path(&self) -> Option<&Path> {
        match self {
            SegmentLocation::File(path) => Some(path),
            SegmentLocation::Anonymous => None,
        }
    }
}

/// Fixed-size read-write mapping
pub struct SegmentMapping {
    map: MmapRaw,
    location: SegmentLocation,
}

impl SegmentMapping {
    /// Maps `len` zeroed bytes. An existing file is unlinked first so
    /// readers holding the old file keep a consistent view of it.
    pub fn create(location: &SegmentLocation, len: usize) -> Result<Self> {
        let map = match location {
            SegmentLocation::File(path) => {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                match fs::remove_file(path) {
                    Ok(()) => {},
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {},
                    Err(e) => return Err(e.into()),
                }

                let mut options = OpenOptions::new();
                options.read(true).write(true).create_new(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o644);
                }
                let file = options.open(path)?;
                file.set_len(len as u64)?;
                MmapOptions::new().len(len).map_raw(&file)?
            },
            SegmentLocation::Anonymous => MmapOptions::new().len(len).map_anon()?.into(),
        };

        tracing::debug!(location = ?location, bytes = len, "Mapped segment");
        Ok(Self {
            map,
            location: location.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn location(&self) -> &SegmentLocation {
        &self.location
    }

    pub fn path(&self) -> Option<&Path> {
        self.location.path()
    }

    /// Copies `bytes` to `offset`
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        // SAFETY: range checked above; the mapping outlives the call
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.map.as_mut_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Sets `len` bytes at `offset` to `byte`
    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: range checked above
        unsafe {
            std::ptr::write_bytes(self.map.as_mut_ptr().add(offset), byte, len);
        }
        Ok(())
    }

    /// Copies the whole mapping out
    pub fn copy_out(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.len()];
        // SAFETY: both buffers are `len` bytes long
        unsafe {
            std::ptr::copy_nonoverlapping(self.map.as_ptr(), bytes.as_mut_ptr(), bytes.len());
        }
        bytes
    }

    /// Atomic little-endian store of an aligned word
    pub fn store_u64(&self, offset: usize, value: u64, order: Ordering) -> Result<()> {
        self.word(offset)?.store(value.to_le(), order);
        Ok(())
    }

    /// Atomic little-endian load of an aligned word
    pub fn load_u64(&self, offset: usize, order: Ordering) -> Result<u64> {
        Ok(u64::from_le(self.word(offset)?.load(order)))
    }

    /// Atomically adds one to a little-endian word, returning the new value
    pub fn increment_u64(&self, offset: usize) -> Result<u64> {
        let word = self.word(offset)?;
        let mut current = word.load(Ordering::Acquire);
        loop {
            let next = u64::from_le(current).wrapping_add(1);
            match word.compare_exchange_weak(current, next.to_le(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Flushes file-backed mappings to disk
    pub fn flush(&self) -> Result<()> {
        if matches!(self.location, SegmentLocation::File(_)) {
            self.map.flush()?;
        }
        Ok(())
    }

    /// Deletes the backing file, if any
    pub fn remove_file(&self) -> Result<()> {
        if let SegmentLocation::File(path) = &self.location {
            match fs::remove_file(path) {
                Ok(()) => {},
                Err(e) if e.kind() == io::ErrorKind::NotFound => {},
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn word(&self, offset: usize) -> Result<&AtomicU64> {
        self.check_range(offset, 8)?;
        if offset % 8 != 0 {
            return Err(MmvError::corrupt(format!("unaligned word at offset {}", offset)));
        }
        // SAFETY: in range and 8-byte aligned (the mapping itself is page aligned)
        Ok(unsafe { &*(self.map.as_mut_ptr().add(offset) as *const AtomicU64) })
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(MmvError::corrupt(format!(
                "range {}+{} outside mapping of {} bytes",
                offset,
                len,
                self.len()
            ))),
        }
    }
}

impl std::fmt::Debug for SegmentMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentMapping")
            .field("location", &self.location)
            .field("len", &self.len())
            .finish()
    }
}
