//! Individual metrics and their change notification.

use crate::codec::{MetricValue, Unit, ValueKind};
use crate::core::error::{MmvError, Result};
use crate::core::types::{MetricName, Semantics};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// Receives every value change of every metric in a registry
pub trait ValueListener: Send + Sync {
    /// Called with the metric's value lock held, so calls for one metric
    /// never overlap. Must not block.
    fn value_changed(&self, metric: &Metric, value: &MetricValue);
}

pub(crate) type Listeners = Arc<RwLock<Vec<Arc<dyn ValueListener>>>>;

/// Everything needed to register a metric
#[derive(Debug, Clone)]
pub struct MetricSpec {
    pub name: String,
    pub kind: ValueKind,
    pub semantics: Semantics,
    pub unit: Unit,
    pub short_help: String,
    pub long_help: String,
    pub initial: Option<MetricValue>,
}

impl MetricSpec {
    /// Instant metric of `kind` without unit or help
    pub fn new<S: Into<String>>(name: S, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            semantics: Semantics::Instant,
            unit: Unit::none(),
            short_help: String::new(),
            long_help: String::new(),
            initial: None,
        }
    }

    /// Unsigned 64-bit counter
    pub fn counter<S: Into<String>>(name: S) -> Self {
        Self::new(name, ValueKind::U64)
            .semantics(Semantics::Counter)
            .unit(Unit::count())
    }

    /// Double-precision gauge
    pub fn gauge<S: Into<String>>(name: S) -> Self {
        Self::new(name, ValueKind::F64)
    }

    /// Discrete text value
    pub fn text<S: Into<String>>(name: S) -> Self {
        Self::new(name, ValueKind::Text).semantics(Semantics::Discrete)
    }

    pub fn semantics(mut self, semantics: Semantics) -> Self {
        self.semantics = semantics;
        self
    }

    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// One-line and long help text
    pub fn help<S: Into<String>, L: Into<String>>(mut self, short: S, long: L) -> Self {
        self.short_help = short.into();
        self.long_help = long.into();
        self
    }

    pub fn initial(mut self, value: MetricValue) -> Self {
        self.initial = Some(value);
        self
    }
}

/// A named, typed, mutable value
pub struct Metric {
    name: MetricName,
    kind: ValueKind,
    semantics: Semantics,
    unit: Unit,
    short_help: String,
    long_help: String,
    value: Mutex<MetricValue>,
    listeners: Listeners,
}

impl Metric {
    pub(crate) fn from_spec(spec: MetricSpec, listeners: Listeners) -> Result<Self> {
        let name = MetricName::parse(&spec.name)?;
        spec.kind.check_semantics(spec.semantics)?;
        for help in [&spec.short_help, &spec.long_help] {
            if help.len() > crate::core::types::MAX_STRING_LEN {
                return Err(MmvError::ValueTooLarge {
                    name: spec.name.clone(),
                    size: help.len(),
                    limit: crate::core::types::MAX_STRING_LEN,
                });
            }
        }

        let initial = spec.initial.unwrap_or_else(|| spec.kind.zero());
        check_kind(&name, spec.kind, &initial)?;
        initial.check_size(name.as_str())?;

        Ok(Self {
            name,
            kind: spec.kind,
            semantics: spec.semantics,
            unit: spec.unit,
            short_help: spec.short_help,
            long_help: spec.long_help,
            value: Mutex::new(initial),
            listeners,
        })
    }

    pub fn name(&self) -> &MetricName {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn semantics(&self) -> Semantics {
        self.semantics
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn short_help(&self) -> &str {
        &self.short_help
    }

    pub fn long_help(&self) -> &str {
        &self.long_help
    }

    /// Current value
    pub fn value(&self) -> MetricValue {
        self.value.lock().clone()
    }

    /// Runs `f` with the value lock held, excluding concurrent setters
    pub(crate) fn with_value<R>(&self, f: impl FnOnce(&MetricValue) -> R) -> R {
        f(&self.value.lock())
    }

    /// Replaces the value and notifies listeners
    pub fn set(&self, value: MetricValue) -> Result<()> {
        check_kind(&self.name, self.kind, &value)?;
        value.check_size(self.name.as_str())?;

        let mut current = self.value.lock();
        *current = value;
        self.notify(&current);
        Ok(())
    }

    /// Adds `delta` to an integer metric, wrapping on overflow
    pub fn inc(&self, delta: u64) -> Result<()> {
        let mut current = self.value.lock();
        let next = match &*current {
            MetricValue::I32(v) => MetricValue::I32(v.wrapping_add(delta as i32)),
            MetricValue::U32(v) => MetricValue::U32(v.wrapping_add(delta as u32)),
            MetricValue::I64(v) => MetricValue::I64(v.wrapping_add(delta as i64)),
            MetricValue::U64(v) => MetricValue::U64(v.wrapping_add(delta)),
            other => {
                return Err(MmvError::TypeMismatch {
                    name: self.name.to_string(),
                    expected: "integer",
                    actual: other.kind().name(),
                })
            },
        };
        *current = next;
        self.notify(&current);
        Ok(())
    }

    pub fn set_u64(&self, value: u64) -> Result<()> {
        self.set(MetricValue::U64(value))
    }

    pub fn set_i64(&self, value: i64) -> Result<()> {
        self.set(MetricValue::I64(value))
    }

    pub fn set_f64(&self, value: f64) -> Result<()> {
        self.set(MetricValue::F64(value))
    }

    pub fn set_bool(&self, value: bool) -> Result<()> {
        self.set(MetricValue::Bool(value))
    }

    pub fn set_text<S: Into<String>>(&self, value: S) -> Result<()> {
        self.set(MetricValue::Text(value.into()))
    }

    fn notify(&self, value: &MetricValue) {
        for listener in self.listeners.read().iter() {
            listener.value_changed(self, value);
        }
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("name", &self.name.as_str())
            .field("kind", &self.kind)
            .field("semantics", &self.semantics)
            .field("unit", &self.unit)
            .field("value", &*self.value.lock())
            .finish()
    }
}

fn check_kind(name: &MetricName, kind: ValueKind, value: &MetricValue) -> Result<()> {
    if value.kind() != kind {
        return Err(MmvError::TypeMismatch {
            name: name.to_string(),
            expected: kind.name(),
            actual: value.kind().name(),
        });
    }
    Ok(())
}
