//! Configuration management for mmv-export.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - CLI argument overrides
//! - Validation and defaults

use crate::core::error::{MmvError, Result};
use crate::core::types::MAX_CLUSTER_ID;
use crate::identifier::{IdStrategy, ID_LIMIT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the PCP temporary directory
pub const PCP_TMP_DIR_ENV: &str = "PCP_TMP_DIR";

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Segment file and header settings
    pub segment: SegmentConfig,
    /// Background publisher settings
    pub publisher: PublisherConfig,
    /// Identifier allocation
    pub identifiers: IdentifierConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// Segment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// File name of the segment inside `directory`
    pub name: String,
    /// Directory holding segment files; defaults to the PCP mmv directory
    pub directory: Option<PathBuf>,
    /// Cluster identifier written into the header (0..=4095)
    pub cluster_id: i64,
    /// Size hint for the first mapping, in bytes
    pub initial_size: usize,
    /// Growth ceiling, in bytes
    pub max_size: Option<usize>,
    /// Header flags
    pub flags: SegmentFlags,
    /// Delete the segment file when the writer closes
    pub remove_on_close: bool,
}

/// Header flags understood by the monitoring agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentFlags {
    /// Metric names are not prefixed with the segment name
    pub no_prefix: bool,
    /// Segment is dropped once the writing process exits
    pub process: bool,
    /// Missing values are reported as sentinels
    pub sentinel: bool,
}

/// Publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Interval between registry polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Refuse to start until the registry is frozen
    pub require_frozen_registry: bool,
}

/// Identifier allocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifierConfig {
    /// Allocation strategy for metric and instance-domain ids
    pub strategy: IdStrategy,
    /// Predefined ids for the `fixed` strategies
    pub fixed: BTreeMap<String, u32>,
    /// Id handed out by the `constant` strategy
    pub constant_id: u32,
    /// Exclusive upper bound of generated ids
    pub limit: u32,
    /// Probe budget for hashed instance ids
    pub max_probes: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Include the module path in log lines
    pub with_target: bool,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        SegmentConfig {
            name: "mmv-export".to_string(),
            directory: None,
            cluster_id: 0,
            initial_size: 4096,
            max_size: None,
            flags: SegmentFlags::default(),
            remove_on_close: false,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            poll_interval: Duration::from_secs(1),
            require_frozen_registry: false,
        }
    }
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        IdentifierConfig {
            strategy: IdStrategy::Hashing,
            fixed: BTreeMap::new(),
            constant_id: 0,
            limit: ID_LIMIT,
            max_probes: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            with_target: false,
        }
    }
}

impl SegmentConfig {
    /// Directory segments are written to
    pub fn directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(default_segment_dir)
    }

    /// Full path of the segment file
    pub fn path(&self) -> PathBuf {
        self.directory().join(&self.name)
    }
}

/// `$PCP_TMP_DIR/mmv`, else `mmv` under the system temp directory
pub fn default_segment_dir() -> PathBuf {
    match std::env::var_os(PCP_TMP_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("mmv"),
        _ => std::env::temp_dir().join("mmv"),
    }
}

/// Default location of the config file
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mmv-export").join("config.yaml"))
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MmvError::config(format!("Failed to read {}: {}", path.display(), e)))?;
        ConfigBuilder::new().from_yaml(&content)?.build()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(0..=MAX_CLUSTER_ID).contains(&self.segment.cluster_id) {
            return Err(MmvError::ClusterIdOutOfRange(self.segment.cluster_id));
        }

        if self.segment.name.is_empty() || self.segment.name.contains(['/', '\\']) {
            return Err(MmvError::config(format!(
                "Segment name must be a plain file name, got '{}'",
                self.segment.name
            )));
        }

        if let Some(max) = self.segment.max_size {
            if self.segment.initial_size > max {
                return Err(MmvError::config(format!(
                    "initial_size ({}) exceeds max_size ({})",
                    self.segment.initial_size, max
                )));
            }
        }

        if self.publisher.poll_interval.is_zero() {
            return Err(MmvError::config("poll_interval must be greater than 0"));
        }

        let ids = &self.identifiers;
        if ids.limit == 0 || ids.limit > ID_LIMIT {
            return Err(MmvError::config(format!(
                "Identifier limit must be between 1 and {}, got {}",
                ID_LIMIT, ids.limit
            )));
        }
        if let Some((name, id)) = ids.fixed.iter().find(|(_, id)| **id >= ids.limit) {
            return Err(MmvError::config(format!(
                "Fixed id {} for '{}' is outside the identifier limit {}",
                id, name, ids.limit
            )));
        }
        if ids.strategy == IdStrategy::Constant && ids.constant_id >= ids.limit {
            return Err(MmvError::config(format!(
                "constant_id {} is outside the identifier limit {}",
                ids.constant_id, ids.limit
            )));
        }

        Ok(())
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| MmvError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Set segment file name
    pub fn segment_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.segment.name = name.into();
        self
    }

    /// Set segment directory
    pub fn segment_dir(mut self, path: PathBuf) -> Self {
        self.config.segment.directory = Some(path);
        self
    }

    /// Set cluster identifier
    pub fn cluster_id(mut self, id: i64) -> Self {
        self.config.segment.cluster_id = id;
        self
    }

    /// Set initial size hint
    pub fn initial_size(mut self, bytes: usize) -> Self {
        self.config.segment.initial_size = bytes;
        self
    }

    /// Set growth ceiling
    pub fn max_size(mut self, bytes: usize) -> Self {
        self.config.segment.max_size = Some(bytes);
        self
    }

    /// Set header flags
    pub fn flags(mut self, flags: SegmentFlags) -> Self {
        self.config.segment.flags = flags;
        self
    }

    /// Set poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.publisher.poll_interval = interval;
        self
    }

    /// Require a frozen registry before publishing
    pub fn require_frozen_registry(mut self, require: bool) -> Self {
        self.config.publisher.require_frozen_registry = require;
        self
    }

    /// Set identifier strategy
    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.config.identifiers.strategy = strategy;
        self
    }

    /// Predefine the id of one metric
    pub fn fixed_id<S: Into<String>>(mut self, name: S, id: u32) -> Self {
        self.config.identifiers.fixed.insert(name.into(), id);
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
