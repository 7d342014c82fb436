use std::sync::Arc;

use crate::{
    Client, CompileInstance, DataHandle, DeviceArray, Error, ExecuteReplicatedOptions, GraphBuilder, Literal,
    Payload, SPMD_DEVICE, Shape, ShardingKind, ShardingSpec, TensorSource, data::Data, metrics,
};

impl Client {
    /// Copies the provided host tensors to their target devices. The returned handles are in input order and
    /// are usable immediately; each host buffer is released once its device's worker retires the copy, and every
    /// copy is tracked as an in-flight operation on its device until then.
    pub fn transfer_to_server(&self, tensors: Vec<TensorSource>) -> Result<Vec<DataHandle>, Error> {
        let mut handles = Vec::with_capacity(tensors.len());
        let count = tensors.len() as u64;
        for tensor in tensors {
            let id = self.registry.string_to_device(&tensor.device).id;
            let bytes = tensor.literal.shape().byte_size() as u64;
            let guard = self.tracker.start(&tensor.device);
            let array = self.driver.create_array(id, tensor.literal, move || drop(guard))?;
            self.metrics.add(metrics::OUTBOUND_DATA, bytes);
            handles.push(Data::single(tensor.device, array));
        }
        self.metrics.add(metrics::CREATE_DATA_HANDLES, count);
        Ok(handles)
    }

    /// Copies the provided per-device shards to their devices and assembles them into a single sharded handle
    /// tagged with the replicated virtual device. The shard count and per-shard target devices must agree with
    /// the provided [`ShardingSpec`]; a mismatch is a contract violation and panics.
    pub fn transfer_shards_to_server(
        &self,
        shards: Vec<TensorSource>,
        device: &str,
        shape: Shape,
        sharding: ShardingSpec,
    ) -> Result<DataHandle, Error> {
        if shards.len() != sharding.shard_count() {
            panic!(
                "received {} shard(s) for a sharding over {} device(s)",
                shards.len(),
                sharding.shard_count(),
            );
        }
        for (index, (shard, expected)) in shards.iter().zip(sharding.devices()).enumerate() {
            if shard.device != *expected {
                panic!(
                    "shard #{index} targets device '{}' but the sharding places it on '{expected}'",
                    shard.device,
                );
            }
        }
        tracing::debug!(device, shape = %shape, sharding = %sharding, "transferring sharded tensor");
        let arrays = self
            .transfer_to_server(shards)?
            .into_iter()
            .map(|handle| self.single_device_array(&handle))
            .collect();
        let array = self.driver.assemble(shape, sharding.kind().clone(), arrays)?;
        Ok(Data::sharded(array, sharding))
    }

    /// Splits the provided handle into one single-device handle per shard, in shard order. An unsharded handle
    /// yields itself. Panics if the handle has no value.
    pub fn get_data_shards(&self, handle: &DataHandle) -> Vec<DataHandle> {
        match handle.payload() {
            Payload::Single(_) => vec![Arc::clone(handle)],
            Payload::Sharded { array, .. } => self
                .driver
                .disassemble(&array)
                .into_iter()
                .map(|shard| {
                    let device = self.registry.device_to_string(shard.devices()[0]).to_string();
                    Data::single(device, shard)
                })
                .collect(),
            Payload::Placeholder { .. } => {
                panic!("data handle for device '{}' has no value", handle.device());
            }
        }
    }

    /// Returns the `index`-th shard of the provided handle. Panics if the index is out of range or the handle
    /// has no value.
    pub fn get_data_shard(&self, handle: &DataHandle, index: usize) -> DataHandle {
        let mut shards = self.get_data_shards(handle);
        if index >= shards.len() {
            panic!("shard index {index} is out of range for a handle with {} shard(s)", shards.len());
        }
        shards.swap_remove(index)
    }

    /// Assembles the provided single-device handles into one sharded handle tagged with the replicated virtual
    /// device. An empty shard list yields an unrealized placeholder that carries the sharding but no buffer.
    /// The target device must be the replicated virtual device, the shard count must match the sharding's
    /// device count, and each shard must live on the device the sharding places it on; violating any of these
    /// is a contract violation and panics.
    pub fn wrap_data_shards(
        &self,
        shards: Vec<DataHandle>,
        device: &str,
        shape: Shape,
        sharding: ShardingSpec,
    ) -> Result<DataHandle, Error> {
        if shards.is_empty() {
            return Ok(Data::placeholder(device, shape, Some(sharding)));
        }
        if device != SPMD_DEVICE {
            panic!("wrapping shards for device '{device}' but sharded handles live on '{SPMD_DEVICE}'");
        }
        if shards.len() != sharding.shard_count() {
            panic!(
                "wrapping {} shard(s) with a sharding over {} device(s)",
                shards.len(),
                sharding.shard_count(),
            );
        }
        for (index, (shard, expected)) in shards.iter().zip(sharding.devices()).enumerate() {
            if shard.device() != expected.as_str() {
                panic!(
                    "shard #{index} lives on device '{}' but the sharding places it on '{expected}'",
                    shard.device(),
                );
            }
        }
        let arrays = shards.iter().map(|shard| self.single_device_array(shard)).collect();
        let array = self.driver.assemble(shape, sharding.kind().clone(), arrays)?;
        Ok(Data::sharded(array, sharding))
    }

    /// Returns the [`ShardingSpec`] the provided handle carries, or `None` for unsharded handles.
    pub fn get_data_sharding(&self, handle: &DataHandle) -> Option<ShardingSpec> {
        handle.has_sharding().then(|| handle.sharding())
    }

    /// Copies the provided handles back to host memory, in input order. Sharded handles are replicated first;
    /// each copy blocks until the owning device's worker fulfills it, and copy failures abort the whole call.
    pub fn transfer_from_server(&self, handles: &[DataHandle]) -> Result<Vec<Literal>, Error> {
        let mut literals = Vec::with_capacity(handles.len());
        for handle in handles {
            let replicated = self.replicate_sharded_data(handle)?;
            let array = self.single_device_or_sharded_array(&replicated);
            let shard = self.driver.fully_replicated_shard(&array);
            let guard = self.tracker.start(handle.device());
            let literal = self.driver.copy_to_host(&shard).wait()?;
            drop(guard);
            self.metrics.add(metrics::INBOUND_DATA, literal.shape().byte_size() as u64);
            literals.push(literal);
        }
        Ok(literals)
    }

    /// Returns a handle holding the full logical value of `handle` on every device it spans. A handle that spans
    /// a single device is returned unchanged; otherwise the value is rebuilt with an identity computation whose
    /// output placement is replicated, compiled over the local device set and executed once. Panics if the handle
    /// has no value.
    pub fn replicate_sharded_data(&self, handle: &DataHandle) -> Result<DataHandle, Error> {
        let sharding = match handle.payload() {
            Payload::Single(_) => return Ok(Arc::clone(handle)),
            Payload::Sharded { array, sharding } => {
                if array.shard_count() == 1 {
                    return Ok(Arc::clone(handle));
                }
                sharding
            }
            Payload::Placeholder { .. } => {
                panic!("data handle for device '{}' has no value", handle.device());
            }
        };

        self.metrics.increment(metrics::REPLICATE_SHARDED_DATA);
        tracing::debug!(shape = %handle.shape(), sharding = %sharding, "replicating sharded data");

        let shape = handle.shape().clone();
        let dtype = shape.dtype();
        let mut builder = GraphBuilder::new("replicate_sharded_data");
        let input = builder.parameter(0, shape, Some(sharding.kind().clone()));
        let zero = builder.scalar_constant(dtype, 0.0);
        let identity = builder.add(input, zero);
        builder.output(identity, Some(ShardingKind::Replicated));

        let instance =
            CompileInstance::sharded(builder.build(), self.default_device(), self.local_devices().to_vec());
        let computation = self.compile(vec![instance])?.remove(0);
        let mut outputs =
            self.execute_replicated(&computation, std::slice::from_ref(handle), &ExecuteReplicatedOptions::default())?;
        Ok(outputs.remove(0))
    }

    fn single_device_array(&self, handle: &DataHandle) -> Arc<DeviceArray> {
        match handle.payload() {
            Payload::Single(array) => array,
            Payload::Sharded { .. } => {
                panic!("data handle for device '{}' already spans multiple devices", handle.device());
            }
            Payload::Placeholder { .. } => {
                panic!("data handle for device '{}' has no value", handle.device());
            }
        }
    }

    fn single_device_or_sharded_array(&self, handle: &DataHandle) -> Arc<DeviceArray> {
        match handle.payload() {
            Payload::Single(array) | Payload::Sharded { array, .. } => array,
            Payload::Placeholder { .. } => {
                panic!("data handle for device '{}' has no value", handle.device());
            }
        }
    }
}
