use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::Error;

/// Represents a key-value store that can be used for rendezvous among the processes participating in a distributed
/// device set (e.g., exchanging addresses and device topology during initialization). Note that the functions of
/// this trait are expected to be thread-safe as they may be invoked concurrently.
pub trait KeyValueStore: Send + Sync {
    /// Stores the provided value under the provided key. Overwrites any previously stored value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Returns the value stored under the provided key, blocking until some process stores one or until the
    /// provided timeout expires.
    fn get(&self, key: &[u8], timeout: Duration) -> Result<Vec<u8>, Error>;

    /// Returns the value stored under the provided key, without blocking.
    fn try_get(&self, key: &[u8]) -> Result<Vec<u8>, Error>;
}

/// [`KeyValueStore`] backed by an in-process map, for single-process device sets and for tests. Blocking reads are
/// woken by writes from other threads of the same process.
pub struct InProcessKeyValueStore {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    condvar: Condvar,
}

impl InProcessKeyValueStore {
    /// Creates a new, empty [`InProcessKeyValueStore`].
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()), condvar: Condvar::new() }
    }
}

impl Default for InProcessKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for InProcessKeyValueStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_vec(), value.to_vec());
        drop(entries);
        self.condvar.notify_all();
        Ok(())
    }

    fn get(&self, key: &[u8], timeout: Duration) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock().unwrap();
        loop {
            if let Some(value) = entries.get(key) {
                return Ok(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::not_found(format!(
                    "no value was stored under key '{}' within {timeout:?}",
                    String::from_utf8_lossy(key),
                )));
            }
            let (guard, _) = self.condvar.wait_timeout(entries, deadline - now).unwrap();
            entries = guard;
        }
    }

    fn try_get(&self, key: &[u8]) -> Result<Vec<u8>, Error> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).cloned().ok_or_else(|| {
            Error::not_found(format!("no value is stored under key '{}'", String::from_utf8_lossy(key)))
        })
    }
}

/// Options for initializing a [`Coordinator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Global rank of this process within the distributed job.
    pub global_rank: usize,

    /// Total number of processes participating in the distributed job.
    pub world_size: usize,

    /// Address of the process hosting the rendezvous endpoint.
    pub master_address: String,

    /// Port of the rendezvous endpoint.
    pub port: u16,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self { global_rank: 0, world_size: 1, master_address: "localhost".to_string(), port: 8547 }
    }
}

/// Coordinates the processes participating in a distributed device set: records the rendezvous configuration
/// (global rank, world size, master address, and port) and exposes the [`KeyValueStore`] that participating
/// processes rendezvous through.
///
/// A [`Coordinator`] is initialized at most once per client, lazily, via
/// [`Client::initialize_coordinator`](crate::Client::initialize_coordinator); accessing it before initialization
/// and initializing it twice are contract violations that panic there. At client shutdown the coordinator is torn
/// down strictly before the driver handle that its consumers hold device resources on.
pub struct Coordinator {
    global_rank: usize,
    world_size: usize,
    master_address: String,
    port: u16,
    store: Arc<dyn KeyValueStore>,
}

impl Coordinator {
    /// Creates a new [`Coordinator`] with the provided options, rendezvousing through the provided store.
    /// Returns [`Error::InvalidArgument`] if the world size is zero or the global rank is out of range.
    pub fn new(options: CoordinatorOptions, store: Arc<dyn KeyValueStore>) -> Result<Self, Error> {
        if options.world_size == 0 {
            return Err(Error::invalid_argument("world size must be > 0"));
        }
        if options.global_rank >= options.world_size {
            return Err(Error::invalid_argument(format!(
                "global rank {} is out of range for world size {}",
                options.global_rank, options.world_size,
            )));
        }
        tracing::info!(
            global_rank = options.global_rank,
            world_size = options.world_size,
            endpoint = %format!("{}:{}", options.master_address, options.port),
            "initializing distributed coordinator",
        );
        Ok(Self {
            global_rank: options.global_rank,
            world_size: options.world_size,
            master_address: options.master_address,
            port: options.port,
            store,
        })
    }

    /// Returns the global rank of this process within the distributed job.
    pub fn global_rank(&self) -> usize {
        self.global_rank
    }

    /// Returns the total number of processes participating in the distributed job.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Returns the rendezvous endpoint in `"address:port"` form.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.master_address, self.port)
    }

    /// Returns the [`KeyValueStore`] that participating processes rendezvous through.
    pub fn key_value_store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Tears down this [`Coordinator`]. Callers must invoke this before releasing the driver handle that device
    /// resources live on.
    pub fn shutdown(&self) {
        tracing::info!(global_rank = self.global_rank, "shutting down distributed coordinator");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_process_store_put_get() {
        let store = InProcessKeyValueStore::new();
        assert!(matches!(store.try_get(b"topology"), Err(Error::NotFound { .. })));
        store.put(b"topology", b"mesh").unwrap();
        assert_eq!(store.try_get(b"topology"), Ok(b"mesh".to_vec()));
        assert_eq!(store.get(b"topology", Duration::from_millis(10)), Ok(b"mesh".to_vec()));
        store.put(b"topology", b"ring").unwrap();
        assert_eq!(store.try_get(b"topology"), Ok(b"ring".to_vec()));
    }

    #[test]
    fn test_in_process_store_blocking_get() {
        let store = Arc::new(InProcessKeyValueStore::new());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                store.put(b"address", b"localhost:8547").unwrap();
            })
        };
        assert_eq!(store.get(b"address", Duration::from_secs(5)), Ok(b"localhost:8547".to_vec()));
        writer.join().unwrap();
    }

    #[test]
    fn test_in_process_store_get_timeout() {
        let store = InProcessKeyValueStore::new();
        assert!(matches!(store.get(b"missing", Duration::from_millis(10)), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_coordinator_options_validation() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InProcessKeyValueStore::new());
        let coordinator = Coordinator::new(
            CoordinatorOptions { global_rank: 1, world_size: 4, master_address: "master".to_string(), port: 9000 },
            Arc::clone(&store),
        )
        .unwrap();
        assert_eq!(coordinator.global_rank(), 1);
        assert_eq!(coordinator.world_size(), 4);
        assert_eq!(coordinator.endpoint(), "master:9000");

        let options = CoordinatorOptions { world_size: 0, ..CoordinatorOptions::default() };
        assert!(matches!(Coordinator::new(options, Arc::clone(&store)), Err(Error::InvalidArgument { .. })));
        let options = CoordinatorOptions { global_rank: 2, world_size: 2, ..CoordinatorOptions::default() };
        assert!(matches!(Coordinator::new(options, store), Err(Error::InvalidArgument { .. })));
    }
}
