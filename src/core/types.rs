use crate::core::error::{MmvError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest name or text payload a 256-byte string block can hold.
pub const MAX_STRING_LEN: usize = 255;

/// Largest cluster identifier the 12-bit header field can carry.
pub const MAX_CLUSTER_ID: i64 = (1 << 12) - 1;

/// Hierarchical metric name such as `cache[users].hits`.
///
/// The bracketed part names an instance; the text before the bracket names
/// the instance domain. Removing the bracketed part yields the base name
/// shared by every instance of the metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricName {
    full: String,
    base: String,
    domain: Option<String>,
    instance: Option<String>,
}

impl MetricName {
    /// Parses and validates a metric name
    pub fn parse(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(MmvError::invalid_name(name, "name cannot be empty"));
        }
        if name.len() > MAX_STRING_LEN {
            return Err(MmvError::invalid_name(
                name,
                format!("name cannot exceed {} bytes, got {}", MAX_STRING_LEN, name.len()),
            ));
        }
        if name.contains('\0') {
            return Err(MmvError::invalid_name(name, "name cannot contain NUL"));
        }

        let Some(open) = name.find('[') else {
            if name.contains(']') {
                return Err(MmvError::invalid_name(name, "unbalanced ']'"));
            }
            return Ok(Self {
                full: name.to_string(),
                base: name.to_string(),
                domain: None,
                instance: None,
            });
        };

        let close = name[open..]
            .find(']')
            .map(|pos| open + pos)
            .ok_or_else(|| MmvError::invalid_name(name, "unbalanced '['"))?;

        let domain = &name[..open];
        let instance = &name[open + 1..close];
        let suffix = &name[close + 1..];

        if domain.is_empty() {
            return Err(MmvError::invalid_name(name, "instance domain name is empty"));
        }
        if instance.is_empty() {
            return Err(MmvError::invalid_name(name, "instance name is empty"));
        }
        if instance.contains('[') || suffix.contains('[') || suffix.contains(']') {
            return Err(MmvError::invalid_name(name, "only one instance bracket is allowed"));
        }

        Ok(Self {
            full: name.to_string(),
            base: format!("{}{}", domain, suffix),
            domain: Some(domain.to_string()),
            instance: Some(instance.to_string()),
        })
    }

    /// Full name as registered
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Name with the instance part removed
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Instance domain name, if the metric has an instance
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Instance name, if any
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// How a monitoring agent should interpret successive values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Semantics {
    /// Monotonically increasing count, rate converted by the agent
    Counter,
    /// Point-in-time gauge
    Instant,
    /// Value that rarely changes (configuration, enumerations, text)
    Discrete,
}

impl Semantics {
    /// Wire code in the metric descriptor
    pub fn code(self) -> i32 {
        match self {
            Semantics::Counter => 1,
            Semantics::Instant => 3,
            Semantics::Discrete => 4,
        }
    }

    /// Inverse of [`Semantics::code`]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Semantics::Counter),
            3 => Some(Semantics::Instant),
            4 => Some(Semantics::Discrete),
            _ => None,
        }
    }
}

/// 12-bit cluster identifier written into the segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClusterId(u16);

impl ClusterId {
    /// Validates a cluster identifier, rejecting anything outside `0..=4095`
    pub fn new(value: i64) -> Result<Self> {
        if !(0..=MAX_CLUSTER_ID).contains(&value) {
            return Err(MmvError::ClusterIdOutOfRange(value));
        }
        Ok(ClusterId(value as u16))
    }

    /// Raw value
    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
