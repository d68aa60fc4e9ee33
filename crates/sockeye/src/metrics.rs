//! The metric-reporting hook.
//!
//! Objects expose named fields with a type tag; publishers receive periodic
//! snapshots collected from a process-wide registry of weak references.
//! Aggregation and transport of metrics are out of scope.

use std::sync::{Mutex, Weak};

use once_cell::sync::Lazy;
use tracing::debug;

/// One observed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Monotonically increasing count.
    Counter(u64),
    /// Instantaneous level.
    Gauge(i64),
    /// Free-form annotation.
    Text(String),
}

/// A named field of a monitorable object.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub value: MetricValue,
}

impl Metric {
    pub fn counter(name: &'static str, value: u64) -> Self {
        Self { name, value: MetricValue::Counter(value) }
    }

    pub fn gauge(name: &'static str, value: i64) -> Self {
        Self { name, value: MetricValue::Gauge(value) }
    }
}

/// A snapshot of one object's fields.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    pub object_name: String,
    pub metrics: Vec<Metric>,
}

/// Anything that can report its fields.
pub trait Monitorable: Send + Sync {
    fn object_name(&self) -> String;
    fn snapshot(&self) -> Vec<Metric>;
}

/// Receives collected snapshots.
pub trait MonitorablePublisher: Send + Sync {
    fn publish(&self, snapshots: &[ObjectSnapshot]);
}

impl Monitorable for crate::buffer::BufferPool {
    fn object_name(&self) -> String {
        format!("buffer-pool.{}", self.buffer_size())
    }

    fn snapshot(&self) -> Vec<Metric> {
        vec![
            Metric::counter("pooled", self.num_pooled()),
            Metric::gauge("available", self.num_available() as i64),
            Metric::gauge("allocated", self.num_allocated() as i64),
            Metric::gauge("bytes_in_use", self.num_bytes_in_use() as i64),
        ]
    }
}

#[derive(Default)]
struct RegistryState {
    objects: Vec<Weak<dyn Monitorable>>,
    publishers: Vec<Weak<dyn MonitorablePublisher>>,
    /// Set at process teardown; registrations after that are refused.
    torn_down: bool,
}

/// Process-wide registry of monitorable objects.
pub struct MonitorableRegistry {
    state: Mutex<RegistryState>,
}

static REGISTRY: Lazy<MonitorableRegistry> =
    Lazy::new(|| MonitorableRegistry { state: Mutex::new(RegistryState::default()) });

impl MonitorableRegistry {
    /// A standalone registry; most callers want [`Self::global`].
    pub fn new() -> Self {
        Self { state: Mutex::new(RegistryState::default()) }
    }

    pub fn global() -> &'static MonitorableRegistry {
        &REGISTRY
    }

    /// Registers an object; returns false after teardown.
    pub fn register(&self, object: Weak<dyn Monitorable>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.torn_down {
            debug!("monitorable registration refused after teardown");
            return false;
        }
        state.objects.push(object);
        true
    }

    pub fn register_publisher(&self, publisher: Weak<dyn MonitorablePublisher>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.torn_down {
            return false;
        }
        state.publishers.push(publisher);
        true
    }

    /// Snapshots every live object and hands the batch to every live
    /// publisher. Dead weak references are compacted as a side effect.
    pub fn collect(&self) {
        let (objects, publishers) = {
            let mut state =
                self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.objects.retain(|o| o.strong_count() > 0);
            state.publishers.retain(|p| p.strong_count() > 0);
            (state.objects.clone(), state.publishers.clone())
        };

        let snapshots: Vec<ObjectSnapshot> = objects
            .iter()
            .filter_map(Weak::upgrade)
            .map(|object| ObjectSnapshot {
                object_name: object.object_name(),
                metrics: object.snapshot(),
            })
            .collect();

        for publisher in publishers.iter().filter_map(Weak::upgrade) {
            publisher.publish(&snapshots);
        }
    }

    /// Flips the teardown sentinel and drops every registration.
    pub fn tear_down(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.torn_down = true;
        state.objects.clear();
        state.publishers.clear();
    }
}

impl Default for MonitorableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct Fixed;
    impl Monitorable for Fixed {
        fn object_name(&self) -> String {
            "fixed".into()
        }

        fn snapshot(&self) -> Vec<Metric> {
            vec![Metric::gauge("level", 3)]
        }
    }

    struct Capture(Mutex<Vec<ObjectSnapshot>>);
    impl MonitorablePublisher for Capture {
        fn publish(&self, snapshots: &[ObjectSnapshot]) {
            self.0.lock().unwrap().extend_from_slice(snapshots);
        }
    }

    #[test]
    fn collect_feeds_publishers_and_teardown_refuses() {
        let registry = MonitorableRegistry::new();

        let object: Arc<dyn Monitorable> = Arc::new(Fixed);
        let publisher = Arc::new(Capture(Mutex::new(Vec::new())));
        assert!(registry.register(Arc::downgrade(&object)));
        let weak_publisher =
            Arc::downgrade(&publisher) as Weak<dyn MonitorablePublisher>;
        assert!(registry.register_publisher(weak_publisher));

        registry.collect();
        {
            let seen = publisher.0.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].object_name, "fixed");
            assert_eq!(seen[0].metrics, vec![Metric::gauge("level", 3)]);
        }

        registry.tear_down();
        assert!(!registry.register(Arc::downgrade(&object)));
    }
}
