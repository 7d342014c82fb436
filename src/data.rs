use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use crate::{DeviceArray, SPMD_DEVICE, Shape, ShardingSpec};

/// Shared handle to device-side tensor data. Handles are reference counted; device resources are released when the
/// last clone drops.
pub type DataHandle = Arc<Data>;

/// Device-side payload of a [`Data`] handle. The variants make the handle's realization state explicit, so
/// consumers match on them exhaustively instead of downcasting.
#[derive(Clone)]
pub enum Payload {
    /// No device-side data yet. Placeholders stand in for tensors whose transfer has not happened, optionally
    /// carrying the [`ShardingSpec`] the eventual data will have.
    Placeholder { sharding: Option<ShardingSpec> },

    /// Data realized on a single device.
    Single(Arc<DeviceArray>),

    /// Data realized as a sharded array spanning multiple devices, with its placement descriptor.
    Sharded { array: Arc<DeviceArray>, sharding: ShardingSpec },
}

/// Device-side tensor data as the public API sees it: a device string, a logical [`Shape`], and a [`Payload`] that
/// can be swapped in place via [`Data::assign`]. Sharded data is tagged with the
/// [`SPMD_DEVICE`] virtual device rather than a physical one.
///
/// The payload sits behind a lock so that `assign` can replace it through a shared handle, but callers must not
/// assign and read the same handle concurrently; the lock only keeps the replacement itself atomic.
pub struct Data {
    device: String,
    shape: Shape,
    payload: Mutex<Payload>,
}

impl Data {
    /// Creates a new unrealized [`Data`] handle, optionally carrying the [`ShardingSpec`] the eventual
    /// data will have.
    pub fn placeholder<S: Into<String>>(device: S, shape: Shape, sharding: Option<ShardingSpec>) -> DataHandle {
        Arc::new(Self { device: device.into(), shape, payload: Mutex::new(Payload::Placeholder { sharding }) })
    }

    /// Creates a new [`Data`] handle for data realized on a single device.
    pub fn single<S: Into<String>>(device: S, array: Arc<DeviceArray>) -> DataHandle {
        let shape = array.shape().clone();
        Arc::new(Self { device: device.into(), shape, payload: Mutex::new(Payload::Single(array)) })
    }

    /// Creates a new [`Data`] handle for data realized as a sharded array, tagged with the [`SPMD_DEVICE`] virtual
    /// device. Panics if the descriptor's device set does not match the physical array's shard count.
    pub fn sharded(array: Arc<DeviceArray>, sharding: ShardingSpec) -> DataHandle {
        if sharding.shard_count() != array.shard_count() {
            panic!(
                "sharding covers {} device(s) but the array holds {} shard(s)",
                sharding.shard_count(),
                array.shard_count(),
            );
        }
        let shape = array.shape().clone();
        Arc::new(Self { device: SPMD_DEVICE.to_string(), shape, payload: Mutex::new(Payload::Sharded { array, sharding }) })
    }

    /// Returns the device string this handle is tagged with ([`SPMD_DEVICE`] for sharded data).
    pub fn device(&self) -> &str {
        self.device.as_str()
    }

    /// Returns the logical [`Shape`] of this handle's data.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns a snapshot of this handle's current [`Payload`].
    pub fn payload(&self) -> Payload {
        self.payload.lock().unwrap().clone()
    }

    /// Returns `true` if this handle holds realized device-side data (i.e., is not a placeholder).
    pub fn has_value(&self) -> bool {
        !matches!(&*self.payload.lock().unwrap(), Payload::Placeholder { .. })
    }

    /// Returns `true` if this handle carries a [`ShardingSpec`], realized or not.
    pub fn has_sharding(&self) -> bool {
        match &*self.payload.lock().unwrap() {
            Payload::Placeholder { sharding } => sharding.is_some(),
            Payload::Single(_) => false,
            Payload::Sharded { .. } => true,
        }
    }

    /// Returns this handle's [`ShardingSpec`].
    ///
    /// # Panic
    ///
    /// Panics if the handle carries no sharding; check [`Data::has_sharding`] first.
    pub fn sharding(&self) -> ShardingSpec {
        match &*self.payload.lock().unwrap() {
            Payload::Placeholder { sharding: Some(sharding) } => sharding.clone(),
            Payload::Sharded { sharding, .. } => sharding.clone(),
            _ => panic!("data handle for device '{}' carries no sharding", self.device),
        }
    }

    /// Replaces this handle's payload with the payload of the provided handle, in place, so that every clone of
    /// this handle observes the new data. Assigning a handle to itself is a no-op.
    pub fn assign(self: &Arc<Self>, other: &DataHandle) {
        if Arc::ptr_eq(self, other) {
            return;
        }
        let payload = other.payload();
        *self.payload.lock().unwrap() = payload;
    }
}

impl Debug for Data {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.payload.lock().unwrap() {
            Payload::Placeholder { .. } => "placeholder",
            Payload::Single(_) => "single",
            Payload::Sharded { .. } => "sharded",
        };
        write!(formatter, "Data[device = {}, shape = {}, {state}]", self.device, self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DType, HostDriver, HostDriverOptions, Literal, ShardingKind};

    fn driver(device_count: usize) -> HostDriver {
        HostDriver::new(HostDriverOptions { device_count, ..HostDriverOptions::default() }).unwrap()
    }

    #[test]
    fn test_placeholder_sharding() {
        let shape = Shape::new(DType::F32, vec![4]);
        let unsharded = Data::placeholder("CPU:0", shape.clone(), None);
        assert!(!unsharded.has_value());
        assert!(!unsharded.has_sharding());

        let sharding = ShardingSpec::replicated(vec!["CPU:0", "CPU:1"]).unwrap();
        let sharded = Data::placeholder(SPMD_DEVICE, shape, Some(sharding.clone()));
        assert!(!sharded.has_value());
        assert!(sharded.has_sharding());
        assert_eq!(sharded.sharding(), sharding);
    }

    #[test]
    #[should_panic(expected = "carries no sharding")]
    fn test_sharding_access_without_sharding_panics() {
        let handle = Data::placeholder("CPU:0", Shape::new(DType::F32, vec![4]), None);
        handle.sharding();
    }

    #[test]
    fn test_single_device_data() {
        let driver = driver(1);
        let array = driver.create_array(0, Literal::from_elements(vec![2], &[1i64, 2]).unwrap(), || {}).unwrap();
        let handle = Data::single("CPU:0", array);
        assert!(handle.has_value());
        assert!(!handle.has_sharding());
        assert_eq!(handle.device(), "CPU:0");
        assert_eq!(handle.shape().to_string(), "i64[2]");
    }

    #[test]
    fn test_assign_replaces_payload_in_place() {
        let driver = driver(1);
        let shape = Shape::new(DType::I64, vec![2]);
        let handle = Data::placeholder("CPU:0", shape, None);
        let alias = Arc::clone(&handle);

        let array = driver.create_array(0, Literal::from_elements(vec![2], &[1i64, 2]).unwrap(), || {}).unwrap();
        let realized = Data::single("CPU:0", array);
        handle.assign(&realized);
        assert!(alias.has_value());

        // Self-assignment is a no-op and must not deadlock.
        handle.assign(&handle);
        assert!(handle.has_value());
    }

    #[test]
    #[should_panic(expected = "holds 1 shard(s)")]
    fn test_sharded_data_device_set_mismatch_panics() {
        let driver = driver(1);
        let array = driver.create_array(0, Literal::from_elements(vec![2], &[1i64, 2]).unwrap(), || {}).unwrap();
        let sharding = ShardingSpec::replicated(vec!["CPU:0", "CPU:1"]).unwrap();
        Data::sharded(array, sharding);
    }

    #[test]
    fn test_sharded_data_is_tagged_with_spmd_device() {
        let driver = driver(2);
        let first = driver.create_array(0, Literal::from_elements(vec![2], &[1i64, 2]).unwrap(), || {}).unwrap();
        let second = driver.create_array(1, Literal::from_elements(vec![2], &[3i64, 4]).unwrap(), || {}).unwrap();
        let array = driver
            .assemble(Shape::new(DType::I64, vec![4]), ShardingKind::Tiled { tile_counts: vec![2] }, vec![first, second])
            .unwrap();
        let sharding = ShardingSpec::tiled(vec!["CPU:0", "CPU:1"], vec![2]).unwrap();
        let handle = Data::sharded(array, sharding);
        assert_eq!(handle.device(), SPMD_DEVICE);
        assert!(handle.has_sharding());
    }
}
