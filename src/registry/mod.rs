//! Explicitly constructed registry of exported metrics.
//!
//! The registry is an ordered collection: metrics are laid out in the
//! segment in registration order. Value changes are pushed synchronously to
//! every registered [`ValueListener`].

pub mod metric;

pub use metric::{Metric, MetricSpec, ValueListener};

use crate::core::error::{MmvError, Result};
use crate::core::types::MAX_STRING_LEN;
use ahash::AHashSet;
use metric::Listeners;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Help text attached to an instance domain
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DomainHelp {
    pub short: String,
    pub long: String,
}

/// Point-in-time view of the registry handed to the segment writer
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub metrics: Vec<Arc<Metric>>,
    pub domain_help: BTreeMap<String, DomainHelp>,
    pub version: u64,
}

impl RegistrySnapshot {
    /// Snapshot of an explicit metric list, without domain help
    pub fn of(metrics: Vec<Arc<Metric>>) -> Self {
        Self {
            metrics,
            domain_help: BTreeMap::new(),
            version: 0,
        }
    }

    /// Full names in registration order
    pub fn names(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.name().to_string()).collect()
    }
}

#[derive(Default)]
struct Inner {
    metrics: Vec<Arc<Metric>>,
    names: AHashSet<String>,
    domain_help: BTreeMap<String, DomainHelp>,
}

/// Ordered set of metrics with change notification
#[derive(Default)]
pub struct MetricRegistry {
    inner: RwLock<Inner>,
    listeners: Listeners,
    frozen: AtomicBool,
    version: AtomicU64,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a metric; names must be unique
    pub fn register(&self, spec: MetricSpec) -> Result<Arc<Metric>> {
        if self.is_frozen() {
            return Err(MmvError::RegistryFrozen(spec.name));
        }

        let metric = Arc::new(Metric::from_spec(spec, Arc::clone(&self.listeners))?);

        let mut inner = self.inner.write();
        // Re-check under the lock, freeze may have raced us
        if self.is_frozen() {
            return Err(MmvError::RegistryFrozen(metric.name().to_string()));
        }
        if !inner.names.insert(metric.name().to_string()) {
            return Err(MmvError::DuplicateMetric(metric.name().to_string()));
        }
        inner.metrics.push(Arc::clone(&metric));
        self.version.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(metric = %metric.name(), kind = %metric.kind(), "Registered metric");
        Ok(metric)
    }

    /// Removes a metric; it disappears from the segment on the next rebuild
    pub fn unregister(&self, name: &str) -> Result<Arc<Metric>> {
        if self.is_frozen() {
            return Err(MmvError::RegistryFrozen(name.to_string()));
        }

        let mut inner = self.inner.write();
        if !inner.names.remove(name) {
            return Err(MmvError::UnknownMetric(name.to_string()));
        }
        let position = inner
            .metrics
            .iter()
            .position(|m| m.name().as_str() == name)
            .ok_or_else(|| MmvError::UnknownMetric(name.to_string()))?;
        let metric = inner.metrics.remove(position);
        self.version.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(metric = %name, "Unregistered metric");
        Ok(metric)
    }

    /// Looks up a metric by full name
    pub fn get(&self, name: &str) -> Option<Arc<Metric>> {
        self.inner
            .read()
            .metrics
            .iter()
            .find(|m| m.name().as_str() == name)
            .cloned()
    }

    /// Snapshot of all metrics in registration order
    pub fn metrics(&self) -> Vec<Arc<Metric>> {
        self.inner.read().metrics.clone()
    }

    /// Consistent view of metrics and domain help
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        RegistrySnapshot {
            metrics: inner.metrics.clone(),
            domain_help: inner.domain_help.clone(),
            version: self.version(),
        }
    }

    /// Attaches help text to an instance domain
    pub fn describe_domain<S: Into<String>, L: Into<String>>(
        &self,
        domain: &str,
        short: S,
        long: L,
    ) -> Result<()> {
        let help = DomainHelp {
            short: short.into(),
            long: long.into(),
        };
        for text in [&help.short, &help.long] {
            if text.len() > MAX_STRING_LEN {
                return Err(MmvError::ValueTooLarge {
                    name: domain.to_string(),
                    size: text.len(),
                    limit: MAX_STRING_LEN,
                });
            }
        }

        let mut inner = self.inner.write();
        if inner.domain_help.get(domain) != Some(&help) {
            inner.domain_help.insert(domain.to_string(), help);
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Full names in registration order
    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .metrics
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().metrics.is_empty()
    }

    /// Counter bumped on every registration or removal
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Rejects all further registrations and removals
    pub fn freeze(&self) {
        let _guard = self.inner.write();
        self.frozen.store(true, Ordering::Release);
        tracing::debug!("Metric registry frozen");
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Subscribes to value changes of every metric
    pub fn add_listener(&self, listener: Arc<dyn ValueListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes a listener previously added; returns whether it was found
    pub fn remove_listener(&self, listener: &Arc<dyn ValueListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        listeners.len() != before
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("metrics", &self.len())
            .field("frozen", &self.is_frozen())
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MetricValue;

    #[test]
    fn test_registration_order() {
        let registry = MetricRegistry::new();
        registry.register(MetricSpec::counter("b.second")).unwrap();
        registry.register(MetricSpec::counter("a.first")).unwrap();
        assert_eq!(registry.names(), vec!["b.second", "a.first"]);
        assert_eq!(registry.version(), 2);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = MetricRegistry::new();
        registry.register(MetricSpec::counter("dup")).unwrap();
        let err = registry.register(MetricSpec::gauge("dup")).unwrap_err();
        assert!(matches!(err, MmvError::DuplicateMetric(name) if name == "dup"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let registry = MetricRegistry::new();
        registry.register(MetricSpec::counter("gone")).unwrap();
        registry.register(MetricSpec::counter("kept")).unwrap();

        registry.unregister("gone").unwrap();
        assert_eq!(registry.names(), vec!["kept"]);
        assert!(registry.get("gone").is_none());
        assert!(matches!(registry.unregister("gone"), Err(MmvError::UnknownMetric(_))));
    }

    #[test]
    fn test_freeze() {
        let registry = MetricRegistry::new();
        registry.register(MetricSpec::counter("before")).unwrap();
        registry.freeze();

        assert!(registry.is_frozen());
        assert!(matches!(
            registry.register(MetricSpec::counter("after")),
            Err(MmvError::RegistryFrozen(_))
        ));
        assert!(matches!(registry.unregister("before"), Err(MmvError::RegistryFrozen(_))));
        // Values stay mutable after freezing
        registry.get("before").unwrap().inc(1).unwrap();
    }

    #[test]
    fn test_domain_help_in_snapshot() {
        let registry = MetricRegistry::new();
        registry.register(MetricSpec::counter("cache[users].hits")).unwrap();
        let before = registry.version();

        registry.describe_domain("cache", "Caches", "One instance per cache region").unwrap();
        registry.describe_domain("cache", "Caches", "One instance per cache region").unwrap();
        assert_eq!(registry.version(), before + 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.names(), vec!["cache[users].hits"]);
        assert_eq!(snapshot.domain_help["cache"].short, "Caches");
        assert!(registry.describe_domain("cache", "x".repeat(300), "").is_err());
    }

    #[test]
    fn test_listener_removal() {
        struct Noop;
        impl ValueListener for Noop {
            fn value_changed(&self, _: &Metric, _: &MetricValue) {}
        }

        let registry = MetricRegistry::new();
        let listener: Arc<dyn ValueListener> = Arc::new(Noop);
        registry.add_listener(Arc::clone(&listener));
        assert!(registry.remove_listener(&listener));
        assert!(!registry.remove_listener(&listener));
    }
}
