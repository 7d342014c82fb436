use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// Tracks the number of in-flight asynchronous operations (transfers and executions) per device string, over the
/// barrier set of a client: its local devices plus the [`SPMD_DEVICE`](crate::SPMD_DEVICE) entry under which sharded
/// executions are tracked. Starting an operation returns an [`OperationGuard`] whose drop marks the operation
/// complete, so completion can be signaled from whichever thread finishes the underlying work and no code path can
/// complete an operation invisibly.
pub struct OperationTracker {
    counters: Mutex<HashMap<String, usize>>,
    condvar: Condvar,
}

impl OperationTracker {
    /// Creates a new [`OperationTracker`] over the provided barrier set of device strings.
    pub fn new<S: Into<String>, I: IntoIterator<Item = S>>(devices: I) -> Self {
        let counters = devices.into_iter().map(|device| (device.into(), 0)).collect();
        Self { counters: Mutex::new(counters), condvar: Condvar::new() }
    }

    /// Registers the start of an operation against the provided device string and returns the [`OperationGuard`]
    /// whose drop registers its completion. Panics if the device is not part of this tracker's barrier set.
    pub fn start<S: Into<String>>(self: &Arc<Self>, device: S) -> OperationGuard {
        let device = device.into();
        {
            let mut counters = self.counters.lock().unwrap();
            match counters.get_mut(&device) {
                Some(counter) => *counter += 1,
                None => panic!("device '{device}' is not tracked by this operation tracker"),
            }
        }
        OperationGuard { tracker: Arc::clone(self), device }
    }

    /// Blocks until every in-flight operation against the provided device strings has completed. If `devices` is
    /// empty, blocks until the operations of every tracked device have completed. Panics if any named device is not
    /// part of this tracker's barrier set.
    pub fn wait_for_devices(&self, devices: &[String]) {
        let mut counters = self.counters.lock().unwrap();
        for device in devices {
            if !counters.contains_key(device) {
                panic!("device '{device}' is not tracked by this operation tracker");
            }
        }
        loop {
            let drained = if devices.is_empty() {
                counters.values().all(|counter| *counter == 0)
            } else {
                devices.iter().all(|device| counters[device] == 0)
            };
            if drained {
                return;
            }
            counters = self.condvar.wait(counters).unwrap();
        }
    }

    /// Returns the number of in-flight operations against the provided device string.
    /// Panics if the device is not part of this tracker's barrier set.
    pub fn in_flight<S: AsRef<str>>(&self, device: S) -> usize {
        let device = device.as_ref();
        match self.counters.lock().unwrap().get(device) {
            Some(counter) => *counter,
            None => panic!("device '{device}' is not tracked by this operation tracker"),
        }
    }

    fn complete(&self, device: &str) {
        let mut counters = self.counters.lock().unwrap();
        // The guard can only have been created through `start`, so the entry exists and is positive.
        let counter = counters.get_mut(device).unwrap();
        *counter -= 1;
        drop(counters);
        self.condvar.notify_all();
    }
}

/// RAII guard representing one in-flight operation against a device. Dropping the guard marks the
/// operation complete.
pub struct OperationGuard {
    tracker: Arc<OperationTracker>,
    device: String,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.tracker.complete(&self.device);
    }
}
