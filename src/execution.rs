use std::sync::Arc;

use crate::{
    Client, Computation, DataHandle, DeviceArray, Error, ExecuteOptions, Payload, ShardingKind, ShardingSpec,
    SPMD_DEVICE, data::Data, metrics,
};

/// Options controlling [`Client::execute_replicated`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteReplicatedOptions {
    /// When `true`, a multi-output computation yields one handle per output. Multi-output computations cannot
    /// be returned as a single handle, so `false` is only valid for single-output computations.
    pub explode_tuple: bool,

    /// When `true`, argument shapes must match the computation's parameter shapes exactly.
    pub strict_shape_checking: bool,
}

impl Default for ExecuteReplicatedOptions {
    fn default() -> Self {
        Self { explode_tuple: true, strict_shape_checking: true }
    }
}

impl Client {
    /// Runs the provided [`Computation`] once across its device set, binding `arguments` positionally to its
    /// parameters. The call returns as soon as the outputs are bound; device-side completion is tracked as an
    /// in-flight operation on the replicated execution entry and retired when the execution status resolves.
    ///
    /// Outputs are tagged with the replicated virtual device and carry the per-output placements the executable
    /// derived at compile time; an executable without output placements, or with a count that disagrees with its
    /// output count, is a contract violation and panics.
    pub fn execute_replicated(
        &self,
        computation: &Computation,
        arguments: &[DataHandle],
        options: &ExecuteReplicatedOptions,
    ) -> Result<Vec<DataHandle>, Error> {
        self.metrics.add(metrics::EXECUTE_REPLICATED, 1);
        let executable = computation.executable();

        let mut arrays: Vec<Arc<DeviceArray>> = Vec::with_capacity(arguments.len());
        for (index, argument) in arguments.iter().enumerate() {
            match argument.payload() {
                Payload::Single(array) | Payload::Sharded { array, .. } => arrays.push(array),
                Payload::Placeholder { .. } => {
                    panic!("argument #{index} for computation '{}' has no value", computation.name());
                }
            }
        }

        if !options.explode_tuple && executable.output_count() > 1 {
            return Err(Error::invalid_argument(format!(
                "computation '{}' has {} outputs and cannot be returned as a single handle",
                computation.name(),
                executable.output_count(),
            )));
        }

        let output_shardings = match executable.output_shardings() {
            Some(shardings) if shardings.len() == executable.output_count() => shardings.to_vec(),
            Some(shardings) => panic!(
                "executable for '{}' reports {} output placement(s) for {} output(s)",
                computation.name(),
                shardings.len(),
                executable.output_count(),
            ),
            None => panic!("executable for '{}' reports no output placements", computation.name()),
        };

        let guard = self.tracker.start(SPMD_DEVICE);
        let execute_options = ExecuteOptions { strict_shape_checking: options.strict_shape_checking };
        let (outputs, status) = self.driver.execute(executable, &arrays, &execute_options)?;
        status.on_ready(move |error| {
            if let Some(error) = error {
                tracing::error!(error = %error, "replicated execution failed");
            }
            drop(guard);
        });

        let devices = computation.devices();
        let mut handles = Vec::with_capacity(outputs.len());
        for (output, kind) in outputs.into_iter().zip(output_shardings) {
            let sharding = match kind {
                ShardingKind::Replicated => ShardingSpec::replicated(devices.iter().cloned()),
                ShardingKind::Tiled { tile_counts } => ShardingSpec::tiled(devices.iter().cloned(), tile_counts),
            }?;
            handles.push(Data::sharded(output, sharding));
        }
        tracing::debug!(
            computation = %computation.name(),
            outputs = handles.len(),
            "dispatched replicated execution",
        );
        Ok(handles)
    }

    /// Per-device execution is not part of this client's surface. Calling this is a contract violation.
    pub fn execute_computation(
        &self,
        _computation: &Computation,
        _arguments: &[DataHandle],
        _device: &str,
    ) -> Result<Vec<DataHandle>, Error> {
        panic!("execute_computation is not implemented");
    }

    /// Cross-device copies are not part of this client's surface. Calling this is a contract violation.
    pub fn copy_to_device(&self, _handle: &DataHandle, _device: &str) -> Result<DataHandle, Error> {
        panic!("copy_to_device is not implemented");
    }
}
