use std::sync::{Arc, Mutex};

use crate::{
    CompileInstance, Computation, Coordinator, CoordinatorOptions, DataHandle, Device, DeviceRegistry, Error,
    HostDriver, HostDriverOptions, InProcessKeyValueStore, Metrics, OperationTracker, Shape, ShardingSpec,
    SPMD_DEVICE, data::Data, metrics, programs,
};

/// Environment variable selecting the platform served by the client (e.g., `"cpu"`).
pub const DEVICE_ENV_VARIABLE: &str = "SPINDLE_DEVICE";

/// Environment variable setting the number of simulated CPU devices.
pub const CPU_DEVICE_COUNT_ENV_VARIABLE: &str = "SPINDLE_CPU_DEVICE_COUNT";

/// Options for initializing a [`Client`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientOptions {
    /// Platform to initialize the driver for (lowercase).
    pub platform: String,

    /// Number of simulated devices.
    pub device_count: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { platform: "cpu".to_string(), device_count: 1 }
    }
}

impl ClientOptions {
    /// Derives options from the environment: `SPINDLE_DEVICE` selects the platform and
    /// `SPINDLE_CPU_DEVICE_COUNT` the simulated device count. Unset variables fall back to the defaults.
    /// Returns [`Error::InvalidArgument`] if the device count cannot be parsed.
    pub fn from_env() -> Result<Self, Error> {
        let mut options = Self::default();
        if let Ok(platform) = std::env::var(DEVICE_ENV_VARIABLE) {
            options.platform = platform.to_lowercase();
        }
        if let Ok(count) = std::env::var(CPU_DEVICE_COUNT_ENV_VARIABLE) {
            options.device_count = count.parse().map_err(|_| {
                Error::invalid_argument(format!("invalid {CPU_DEVICE_COUNT_ENV_VARIABLE} value '{count}'"))
            })?;
        }
        Ok(options)
    }
}

/// Client for dispatching tensor transfers, compilations, and replicated executions against a set of devices.
///
/// The client owns the device registry derived from driver enumeration, the per-device operation tracker, the
/// name-keyed metric counters, and the lazily initialized distributed [`Coordinator`]. Shared data handles and
/// computations keep it alive through [`Arc`]s; [`Client::shutdown`] tears the coordinator down before the driver
/// handle, and the field order below preserves that ordering for implicit drops.
pub struct Client {
    pub(crate) coordinator: Mutex<Option<Arc<Coordinator>>>,
    pub(crate) tracker: Arc<OperationTracker>,
    pub(crate) metrics: Metrics,
    pub(crate) replication_devices: Mutex<Option<Vec<String>>>,
    pub(crate) registry: DeviceRegistry,
    pub(crate) driver: Arc<HostDriver>,
}

impl Client {
    /// Creates a new [`Client`] with the provided options, initializing the driver and enumerating its devices.
    /// An empty device set is a configuration error, not a contract violation: the driver rejects it before the
    /// device registry is built, so the call returns [`Error::InvalidArgument`] rather than panicking.
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        let driver = Arc::new(HostDriver::new(HostDriverOptions {
            platform: options.platform,
            device_count: options.device_count,
            device_ids: None,
        })?);
        let registry = DeviceRegistry::new(driver.platform(), driver.devices().to_vec(), driver.process_index());
        let tracker_devices: Vec<String> =
            registry.local_devices().iter().cloned().chain(std::iter::once(SPMD_DEVICE.to_string())).collect();
        tracing::info!(
            platform = %registry.platform(),
            device_count = registry.all_devices().len(),
            "initialized client",
        );
        Ok(Self {
            coordinator: Mutex::new(None),
            tracker: Arc::new(OperationTracker::new(tracker_devices)),
            metrics: Metrics::new(),
            replication_devices: Mutex::new(None),
            registry,
            driver,
        })
    }

    /// Creates a new [`Client`] configured from the environment. See [`ClientOptions::from_env`].
    pub fn from_env() -> Result<Self, Error> {
        Self::new(ClientOptions::from_env()?)
    }

    /// Compiles the provided instances in order, aborting the whole call on the first failure.
    pub fn compile(&self, instances: Vec<CompileInstance>) -> Result<Vec<Computation>, Error> {
        let mut computations = Vec::with_capacity(instances.len());
        for instance in instances {
            let computation = programs::compile_instance(&self.driver, &self.registry, instance)?;
            self.metrics.increment(metrics::CREATE_COMPILE_HANDLES);
            computations.push(computation);
        }
        Ok(computations)
    }

    /// Creates an unrealized [`DataHandle`] for the provided device and shape, optionally carrying the sharding
    /// the eventual value will have.
    pub fn create_data_placeholder<S: Into<String>>(
        &self,
        device: S,
        shape: Shape,
        sharding: Option<ShardingSpec>,
    ) -> DataHandle {
        Data::placeholder(device, shape, sharding)
    }

    /// Blocks until every tracked operation on the provided devices completed. An empty slice waits on all
    /// local devices plus the replicated execution entry.
    pub fn wait_device_ops(&self, devices: &[String]) {
        tracing::debug!(devices = ?devices, "waiting for device operations");
        self.tracker.wait_for_devices(devices);
    }

    /// Initializes the distributed [`Coordinator`] with an in-process rendezvous store. Panics if the
    /// coordinator was already initialized.
    pub fn initialize_coordinator(&self, options: CoordinatorOptions) -> Result<(), Error> {
        let mut coordinator = self.coordinator.lock().unwrap();
        if coordinator.is_some() {
            panic!("coordinator already initialized");
        }
        *coordinator = Some(Arc::new(Coordinator::new(options, Arc::new(InProcessKeyValueStore::new()))?));
        Ok(())
    }

    /// Returns the distributed [`Coordinator`]. Panics if [`Client::initialize_coordinator`] was not called.
    pub fn coordinator(&self) -> Arc<Coordinator> {
        match self.coordinator.lock().unwrap().as_ref() {
            Some(coordinator) => Arc::clone(coordinator),
            None => panic!("coordinator has not been initialized"),
        }
    }

    /// Returns `true` if the distributed [`Coordinator`] was initialized.
    pub fn coordinator_initialized(&self) -> bool {
        self.coordinator.lock().unwrap().is_some()
    }

    /// Sets the devices that mirror replicated data, or clears them when `None`.
    pub fn set_replication_devices(&self, devices: Option<Vec<String>>) {
        *self.replication_devices.lock().unwrap() = devices;
    }

    /// Returns the devices that mirror replicated data, if set.
    pub fn replication_devices(&self) -> Option<Vec<String>> {
        self.replication_devices.lock().unwrap().clone()
    }

    /// Returns the platform served by this client (uppercase).
    pub fn platform(&self) -> &str {
        self.registry.platform()
    }

    /// Returns the device string of the default device.
    pub fn default_device(&self) -> &str {
        self.registry.default_device()
    }

    /// Returns the device strings of all enumerated devices, in ordinal order.
    pub fn all_devices(&self) -> &[String] {
        self.registry.all_devices()
    }

    /// Returns the device strings of the devices addressable by this process, in ordinal order.
    pub fn local_devices(&self) -> &[String] {
        self.registry.local_devices()
    }

    /// Returns the number of devices addressable by this process.
    pub fn num_devices(&self) -> usize {
        self.registry.local_devices().len()
    }

    /// Returns the number of participating processes.
    pub fn num_processes(&self) -> usize {
        self.registry.process_count()
    }

    /// Returns the [`Device`] behind the provided device string. Panics on an unknown string.
    pub fn device<S: AsRef<str>>(&self, device: S) -> &Device {
        self.registry.string_to_device(device)
    }

    /// Returns the metric counters of this client.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Shuts this client down, tearing the coordinator down before the driver handle is released.
    pub fn shutdown(&self) {
        if let Some(coordinator) = self.coordinator.lock().unwrap().take() {
            coordinator.shutdown();
        }
        tracing::info!("client shut down");
    }
}
