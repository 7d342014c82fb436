use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Counter tracking the number of bytes copied from host to device.
pub const OUTBOUND_DATA: &str = "OutboundData";

/// Counter tracking the number of bytes copied from device to host.
pub const INBOUND_DATA: &str = "InboundData";

/// Counter tracking the number of data handles created by transfers.
pub const CREATE_DATA_HANDLES: &str = "CreateDataHandles";

/// Counter tracking the number of compiled computations.
pub const CREATE_COMPILE_HANDLES: &str = "CreateCompileHandles";

/// Counter tracking the number of compile-and-execute replications of sharded data.
pub const REPLICATE_SHARDED_DATA: &str = "ReplicateShardedData";

/// Counter tracking the number of dispatched replicated executions.
pub const EXECUTE_REPLICATED: &str = "ExecuteReplicated";

/// Name-keyed monotonic counter registry. Each client owns one and bumps counters at its operation boundaries
/// (transfer byte counts, handle creation, compiles, replications, executions). Counters are created lazily on
/// first use and only ever increase.
pub struct Metrics {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl Metrics {
    /// Creates a new, empty [`Metrics`] registry.
    pub fn new() -> Self {
        Self { counters: RwLock::new(HashMap::new()) }
    }

    /// Adds the provided value to the counter with the provided name, creating it if necessary.
    pub fn add<S: AsRef<str>>(&self, name: S, value: u64) {
        self.counter(name).fetch_add(value, Ordering::Relaxed);
    }

    /// Increments the counter with the provided name by one, creating it if necessary.
    pub fn increment<S: AsRef<str>>(&self, name: S) {
        self.add(name, 1);
    }

    /// Returns the current value of the counter with the provided name, or `0` if it was never touched.
    pub fn value<S: AsRef<str>>(&self, name: S) -> u64 {
        let counters = self.counters.read().unwrap();
        counters.get(name.as_ref()).map_or(0, |counter| counter.load(Ordering::Relaxed))
    }

    /// Returns the names of all counters that were touched so far, in unspecified order.
    pub fn counter_names(&self) -> Vec<String> {
        self.counters.read().unwrap().keys().cloned().collect()
    }

    fn counter<S: AsRef<str>>(&self, name: S) -> Arc<AtomicU64> {
        let name = name.as_ref();
        {
            let counters = self.counters.read().unwrap();
            if let Some(counter) = counters.get(name) {
                return Arc::clone(counter);
            }
        }
        let mut counters = self.counters.write().unwrap();
        Arc::clone(counters.entry(name.to_string()).or_default())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        assert_eq!(metrics.value(OUTBOUND_DATA), 0);
        metrics.add(OUTBOUND_DATA, 128);
        metrics.add(OUTBOUND_DATA, 64);
        metrics.increment(CREATE_DATA_HANDLES);
        assert_eq!(metrics.value(OUTBOUND_DATA), 192);
        assert_eq!(metrics.value(CREATE_DATA_HANDLES), 1);
        assert_eq!(metrics.value(INBOUND_DATA), 0);
        let mut names = metrics.counter_names();
        names.sort();
        assert_eq!(names, vec![CREATE_DATA_HANDLES.to_string(), OUTBOUND_DATA.to_string()]);
    }
}
