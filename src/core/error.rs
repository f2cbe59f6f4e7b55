use thiserror::Error;

/// Identifier space an allocation failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpace {
    /// Metric item identifiers
    Metric,
    /// Instance domain serials
    InstanceDomain,
    /// Instance identifiers within one instance domain
    Instance,
}

impl std::fmt::Display for IdSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdSpace::Metric => f.write_str("metric"),
            IdSpace::InstanceDomain => f.write_str("instance domain"),
            IdSpace::Instance => f.write_str("instance"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MmvError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cluster identifier must be between 0 and 4095, got {0}")]
    ClusterIdOutOfRange(i64),

    #[error("Cannot map unit '{unit}': {reason}")]
    UnmappableUnit { unit: String, reason: String },

    #[error("Unsupported value type: {0}")]
    UnsupportedType(String),

    #[error("Invalid metric name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("No {space} identifier available for '{name}'")]
    AllocationExhausted { name: String, space: IdSpace },

    #[error("Dynamic identifier allocation is disabled, '{0}' has no predefined id")]
    DynamicAllocationForbidden(String),

    #[error("Segment capacity exceeded: {required} bytes required, limit {limit} bytes")]
    CapacityExceeded { required: usize, limit: usize },

    #[error("Segment writer is closed")]
    Closed,

    #[error("Value for '{name}' is {size} bytes, limit is {limit} bytes")]
    ValueTooLarge { name: String, size: usize, limit: usize },

    #[error("Type mismatch for '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Metrics sharing '{name}' disagree: {reason}")]
    InconsistentMetric { name: String, reason: String },

    #[error("Metric already registered: {0}")]
    DuplicateMetric(String),

    #[error("Metric not registered: {0}")]
    UnknownMetric(String),

    #[error("Registry is frozen, cannot register '{0}'")]
    RegistryFrozen(String),

    #[error("Registry must be frozen before the first snapshot")]
    RegistryNotFrozen,

    #[error("Corrupt segment: {0}")]
    CorruptSegment(String),

    #[error("Segment kept changing while being read ({attempts} attempts)")]
    TornRead { attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type alias for exporter operations
pub type Result<T> = std::result::Result<T, MmvError>;

impl MmvError {
    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new unmappable unit error
    pub fn unmappable<U: Into<String>, R: Into<String>>(unit: U, reason: R) -> Self {
        Self::UnmappableUnit {
            unit: unit.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new invalid name error
    pub fn invalid_name<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new corrupt segment error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        Self::CorruptSegment(msg.into())
    }

    /// Returns true if retrying the operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TornRead { .. } => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Returns the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_)
            | Self::ClusterIdOutOfRange(_)
            | Self::UnmappableUnit { .. }
            | Self::UnsupportedType(_)
            | Self::InvalidName { .. } => "config",
            Self::AllocationExhausted { .. } | Self::DynamicAllocationForbidden(_) => {
                "allocation"
            },
            Self::CapacityExceeded { .. } => "capacity",
            Self::Closed => "closed",
            Self::ValueTooLarge { .. } | Self::TypeMismatch { .. } | Self::InconsistentMetric { .. } => {
                "programming"
            },
            Self::DuplicateMetric(_)
            | Self::UnknownMetric(_)
            | Self::RegistryFrozen(_)
            | Self::RegistryNotFrozen => "registry",
            Self::CorruptSegment(_) | Self::TornRead { .. } => "reader",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Join(_) => "async",
        }
    }
}
