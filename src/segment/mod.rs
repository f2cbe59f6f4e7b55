//! The shared memory segment: MMV version 2 layout, writer and reader.
//!
//! ```text
//! +--------+-----------+---------+--------+-----------+---------+--------+---------+
//! | header | toc x n   | data gen| indoms | instances | metrics | values | strings |
//! | 40 B   | 16 B each | 8 B     | 32 B   | 24 B      | 48 B    | 32 B   | 256 B   |
//! +--------+-----------+---------+--------+-----------+---------+--------+---------+
//! ```
//!
//! All integers are little-endian. Readers detect torn documents by
//! comparing the two generation words in the header.

pub mod layout;
pub mod mapping;
pub mod reader;
pub mod string_pool;
pub mod writer;

pub use layout::Layout;
pub use mapping::{SegmentLocation, SegmentMapping};
pub use reader::{SegmentReader, SegmentSnapshot};
pub use string_pool::{StringId, StringPool};
pub use writer::{RebuildOutcome, SegmentOptions, SegmentWriter, UpdateOutcome, WriterPhase, WriterStats};

/// `MMV\0`
pub const MAGIC: [u8; 4] = *b"MMV\0";
/// Format version written by this crate
pub const VERSION: i32 = 2;

pub const HEADER_BYTES: usize = 40;
pub const TOC_BYTES: usize = 16;
pub const DATA_GENERATION_BYTES: usize = 8;
pub const INDOM_BYTES: usize = 32;
pub const INSTANCE_BYTES: usize = 24;
pub const METRIC_BYTES: usize = 48;
pub const VALUE_BYTES: usize = 32;

/// Header field offsets
pub mod header {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const GENERATION_1: usize = 8;
    pub const GENERATION_2: usize = 16;
    pub const TOC_COUNT: usize = 24;
    pub const FLAGS: usize = 28;
    pub const PROCESS: usize = 32;
    pub const CLUSTER: usize = 36;
}

/// Table of contents section types
pub mod toc {
    pub const INDOMS: i32 = 1;
    pub const INSTANCES: i32 = 2;
    pub const METRICS: i32 = 3;
    pub const VALUES: i32 = 4;
    pub const STRINGS: i32 = 5;
}

/// Header flag bits
pub mod flags {
    /// Agent should not prefix metric names with the segment name
    pub const NO_PREFIX: i32 = 1;
    /// Agent should drop the segment once the process id is gone
    pub const PROCESS: i32 = 2;
    /// Agent should report sentinel values for missing data
    pub const SENTINEL: i32 = 4;
}

/// Indom serial written by metrics without an instance domain
pub const NO_INDOM: u32 = u32::MAX;

/// Offset of the data generation word for a document with `tocs` entries
pub const fn data_generation_offset(tocs: usize) -> usize {
    HEADER_BYTES + tocs * TOC_BYTES
}
