//! Binary encodings for values and units.

pub mod units;
pub mod value;

pub use units::{SpaceScale, TimeScale, Unit};
pub use value::{MetricValue, ValueKind, SLOT_BYTES, STRING_BLOCK_BYTES};
