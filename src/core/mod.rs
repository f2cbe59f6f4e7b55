//! Core types shared by every layer: errors, configuration and names.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigBuilder};
pub use error::{IdSpace, MmvError, Result};
pub use types::{ClusterId, MetricName, Semantics};
