use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::{
    AsyncValue, AsyncValueHandle, DType, Device, DeviceId, Error, Literal, NamedAttribute, NativeType, Shape,
    ShardSlice, ShardingKind,
};

/// Options for initializing a [`HostDriver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostDriverOptions {
    /// Platform name that the driver reports (lowercase).
    pub platform: String,

    /// Number of simulated devices. Ignored when `device_ids` is provided.
    pub device_count: usize,

    /// Explicit driver ids for the simulated devices. Ids are unique but need not be dense; when absent,
    /// ids `0..device_count` are used.
    pub device_ids: Option<Vec<DeviceId>>,
}

impl Default for HostDriverOptions {
    fn default() -> Self {
        Self { platform: "cpu".to_string(), device_count: 1, device_ids: None }
    }
}

/// In-process multi-device runtime that the client drives: it enumerates a configurable set of simulated devices,
/// stores device-side tensor data as [`DeviceArray`]s, compiles [`ProgramModule`]s into [`LoadedExecutable`]s, and
/// evaluates executions by assembling sharded inputs into logical tensors, interpreting the program, and resharding
/// the outputs. Work submitted against a device (host-buffer releases, host copies, execution completions) runs on
/// that device's worker thread in submission order; there is no ordering across devices.
pub struct HostDriver {
    platform: String,
    devices: Vec<Device>,
    workers: HashMap<DeviceId, DeviceWorker>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct DeviceWorker {
    sender: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl HostDriver {
    /// Creates a new [`HostDriver`] with the provided options, spawning one worker thread per device.
    /// Returns [`Error::InvalidArgument`] if the device set is empty or contains duplicate ids.
    pub fn new(options: HostDriverOptions) -> Result<Self, Error> {
        let ids = match options.device_ids {
            Some(ids) => ids,
            None => (0..options.device_count as DeviceId).collect(),
        };
        if ids.is_empty() {
            return Err(Error::invalid_argument("driver requires at least one device"));
        }
        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(*id) {
                return Err(Error::invalid_argument(format!("duplicate device id {id}")));
            }
        }

        let mut devices = Vec::with_capacity(ids.len());
        let mut workers = HashMap::with_capacity(ids.len());
        for id in ids {
            let mut device = Device::new(id, 0);
            device.attributes.push(NamedAttribute::new("kind", "host"));
            devices.push(device);

            let (sender, receiver) = mpsc::channel::<Job>();
            let thread = std::thread::Builder::new()
                .name(format!("{}-device-{id}", options.platform))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .map_err(|error| Error::internal(format!("failed to spawn device worker thread: {error}")))?;
            workers.insert(id, DeviceWorker { sender: Some(sender), thread: Some(thread) });
        }

        tracing::debug!(platform = %options.platform, device_count = devices.len(), "initialized host driver");
        Ok(Self { platform: options.platform, devices, workers })
    }

    /// Returns the platform name that this driver reports (lowercase).
    pub fn platform(&self) -> &str {
        self.platform.as_str()
    }

    /// Returns the devices enumerated by this driver, in enumeration order.
    pub fn devices(&self) -> &[Device] {
        self.devices.as_slice()
    }

    /// Returns the index of the calling process within the driver's device set. The in-process driver always
    /// answers `0`.
    pub fn process_index(&self) -> usize {
        0
    }

    /// Copies the provided host [`Literal`] onto the named device and returns the resulting single-device
    /// [`DeviceArray`]. The provided callback is invoked on the device's worker thread once the host buffer is no
    /// longer needed, after all previously submitted work for that device.
    pub fn create_array<F: FnOnce() + Send + 'static>(
        &self,
        device: DeviceId,
        literal: Literal,
        on_host_buffer_released: F,
    ) -> Result<Arc<DeviceArray>, Error> {
        self.check_device(device)?;
        let array = Arc::new(DeviceArray {
            shape: literal.shape().clone(),
            kind: ShardingKind::Replicated,
            shards: vec![ArrayShard { device, literal }],
        });
        self.submit(device, Box::new(on_host_buffer_released));
        Ok(array)
    }

    /// Assembles the provided single-device arrays into one sharded [`DeviceArray`] with the provided logical shape
    /// and placement. The inputs are taken in shard order; each must hold the shard dimensions that the placement
    /// implies for its position.
    pub fn assemble(
        &self,
        shape: Shape,
        kind: ShardingKind,
        shards: Vec<Arc<DeviceArray>>,
    ) -> Result<Arc<DeviceArray>, Error> {
        if shards.is_empty() {
            return Err(Error::invalid_argument("cannot assemble an array from zero shards"));
        }
        let expected_dims = kind.shard_dims(shards.len(), shape.dimensions())?;
        let mut assembled = Vec::with_capacity(shards.len());
        for (index, shard) in shards.into_iter().enumerate() {
            if shard.shards.len() != 1 {
                return Err(Error::invalid_argument(format!(
                    "shard #{index} spans {} devices; only single-device arrays can be assembled",
                    shard.shards.len(),
                )));
            }
            let piece = &shard.shards[0];
            if piece.literal.shape().dtype() != shape.dtype() {
                return Err(Error::invalid_argument(format!(
                    "shard #{index} has element type '{}' but the assembled array requires '{}'",
                    piece.literal.shape().dtype(),
                    shape.dtype(),
                )));
            }
            if piece.literal.shape().dimensions() != expected_dims[index].as_slice() {
                return Err(Error::invalid_argument(format!(
                    "shard #{index} has shape {} but the placement implies dimensions {:?}",
                    piece.literal.shape(),
                    expected_dims[index],
                )));
            }
            assembled.push(piece.clone());
        }
        Ok(Arc::new(DeviceArray { shape, kind, shards: assembled }))
    }

    /// Splits the provided [`DeviceArray`] into one single-device array per shard, in shard order.
    pub fn disassemble(&self, array: &Arc<DeviceArray>) -> Vec<Arc<DeviceArray>> {
        array
            .shards
            .iter()
            .map(|shard| {
                Arc::new(DeviceArray {
                    shape: shard.literal.shape().clone(),
                    kind: ShardingKind::Replicated,
                    shards: vec![shard.clone()],
                })
            })
            .collect()
    }

    /// Returns the first shard of the provided [`DeviceArray`] as a single-device array. For a replicated array,
    /// this is a full copy of the logical value.
    pub fn fully_replicated_shard(&self, array: &Arc<DeviceArray>) -> Arc<DeviceArray> {
        let shard = &array.shards[0];
        Arc::new(DeviceArray {
            shape: shard.literal.shape().clone(),
            kind: ShardingKind::Replicated,
            shards: vec![shard.clone()],
        })
    }

    /// Copies the first shard of the provided [`DeviceArray`] back to host memory. The returned [`AsyncValue`] is
    /// fulfilled with the host [`Literal`] on the owning device's worker thread, after all previously submitted
    /// work for that device.
    pub fn copy_to_host(&self, array: &Arc<DeviceArray>) -> AsyncValue<Literal> {
        let (value, handle) = AsyncValue::new();
        let shard = &array.shards[0];
        let literal = shard.literal.clone();
        self.submit(shard.device, Box::new(move || handle.set(Ok(literal))));
        value
    }

    /// Compiles the provided [`ProgramModule`] into a [`LoadedExecutable`] bound to the devices named by the
    /// compile options' device assignment. Validates the module (operand references, shape and element-type
    /// agreement, parameter numbering) and the assignment layout, and derives the executable's per-output
    /// placements, honoring the options' propagation flag.
    pub fn compile(&self, module: ProgramModule, options: CompileOptions) -> Result<Arc<LoadedExecutable>, Error> {
        if options.device_assignment.len() != options.num_replicas {
            return Err(Error::invalid_argument(format!(
                "device assignment has {} replica row(s) but the options request {}",
                options.device_assignment.len(),
                options.num_replicas,
            )));
        }
        let mut assigned_devices = Vec::with_capacity(options.num_replicas * options.num_partitions);
        for (replica, row) in options.device_assignment.iter().enumerate() {
            if row.len() != options.num_partitions {
                return Err(Error::invalid_argument(format!(
                    "device assignment row #{replica} has {} partition column(s) but the options request {}",
                    row.len(),
                    options.num_partitions,
                )));
            }
            for id in row {
                self.check_device(*id)?;
                if assigned_devices.contains(id) {
                    return Err(Error::invalid_argument(format!(
                        "device id {id} appears more than once in the device assignment",
                    )));
                }
                assigned_devices.push(*id);
            }
        }

        let shapes = module.infer_shapes()?;
        let output_shardings = module
            .outputs
            .iter()
            .map(|output| derive_output_sharding(&module, output, options.allow_spmd_sharding_propagation_to_output))
            .collect();

        tracing::debug!(
            name = %module.name,
            num_replicas = options.num_replicas,
            num_partitions = options.num_partitions,
            "compiled program module",
        );
        Ok(Arc::new(LoadedExecutable {
            module,
            shapes,
            devices: assigned_devices,
            num_replicas: options.num_replicas,
            num_partitions: options.num_partitions,
            parameter_is_tupled_arguments: options.parameter_is_tupled_arguments,
            output_shardings: Some(output_shardings),
        }))
    }

    /// Executes the provided [`LoadedExecutable`] over the provided arguments, bound positionally to the module's
    /// parameters. Sharded arguments are assembled into their logical tensors, the module is interpreted, and each
    /// output is laid back out across the executable's device set according to its derived placement. The returned
    /// [`AsyncValue`] resolves once every participating device's worker has retired the execution.
    pub fn execute(
        &self,
        executable: &Arc<LoadedExecutable>,
        arguments: &[Arc<DeviceArray>],
        options: &ExecuteOptions,
    ) -> Result<(Vec<Arc<DeviceArray>>, AsyncValue<()>), Error> {
        let parameter_count = executable.parameter_count();
        if arguments.len() != parameter_count {
            return Err(Error::invalid_argument(format!(
                "execution received {} argument(s) but the executable takes {parameter_count}",
                arguments.len(),
            )));
        }

        let mut bound = vec![None; parameter_count];
        for (position, instruction) in executable.module.instructions.iter().enumerate() {
            if let Instruction::Parameter { index, shape, .. } = instruction {
                let argument = &arguments[*index];
                if options.strict_shape_checking && argument.shape() != shape {
                    return Err(Error::invalid_argument(format!(
                        "argument #{index} has shape {} but the executable expects {shape}",
                        argument.shape(),
                    )));
                }
                if argument.shape().dtype() != shape.dtype() {
                    return Err(Error::invalid_argument(format!(
                        "argument #{index} has element type '{}' but the executable expects '{}'",
                        argument.shape().dtype(),
                        shape.dtype(),
                    )));
                }
                bound[*index] = Some((position, assemble_logical(argument)?));
            }
        }

        let mut environment: HashMap<usize, Literal> = HashMap::new();
        for binding in bound.into_iter().flatten() {
            environment.insert(binding.0, binding.1);
        }

        let mut results: Vec<Literal> = Vec::with_capacity(executable.module.instructions.len());
        for (position, instruction) in executable.module.instructions.iter().enumerate() {
            let result = match instruction {
                Instruction::Parameter { .. } => match environment.remove(&position) {
                    Some(literal) => literal,
                    // Parameter bindings are exhaustive by construction.
                    None => panic!("parameter at instruction #{position} was not bound"),
                },
                Instruction::ScalarConstant { dtype, value } => materialize_scalar(*dtype, *value),
                Instruction::Add { lhs, rhs } => binary_elementwise(&results[*lhs], &results[*rhs], false)?,
                Instruction::Multiply { lhs, rhs } => binary_elementwise(&results[*lhs], &results[*rhs], true)?,
            };
            results.push(result);
        }

        let output_shardings = executable.output_shardings().map(<[ShardingKind]>::to_vec).unwrap_or_default();
        let mut outputs = Vec::with_capacity(executable.module.outputs.len());
        for (output, kind) in executable.module.outputs.iter().zip(output_shardings) {
            outputs.push(self.shard_literal(&results[output.instruction], kind, &executable.devices)?);
        }

        let (status, handle) = AsyncValue::new();
        let countdown =
            Arc::new(ExecutionCountdown { remaining: AtomicUsize::new(executable.devices.len()), handle: Mutex::new(Some(handle)) });
        for device in &executable.devices {
            let countdown = Arc::clone(&countdown);
            self.submit(
                *device,
                Box::new(move || {
                    if countdown.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        if let Some(handle) = countdown.handle.lock().unwrap().take() {
                            handle.set(Ok(()));
                        }
                    }
                }),
            );
        }
        Ok((outputs, status))
    }

    fn shard_literal(
        &self,
        literal: &Literal,
        kind: ShardingKind,
        devices: &[DeviceId],
    ) -> Result<Arc<DeviceArray>, Error> {
        let slices = kind.shard_slices(devices.len(), literal.shape().dimensions())?;
        let mut shards = Vec::with_capacity(devices.len());
        for (device, shard_slices) in devices.iter().zip(slices) {
            shards.push(ArrayShard { device: *device, literal: extract_slice(literal, &shard_slices)? });
        }
        Ok(Arc::new(DeviceArray { shape: literal.shape().clone(), kind, shards }))
    }

    fn check_device(&self, device: DeviceId) -> Result<(), Error> {
        if self.workers.contains_key(&device) {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!("device id {device} is not managed by this driver")))
        }
    }

    fn submit(&self, device: DeviceId, job: Job) {
        let worker = match self.workers.get(&device) {
            Some(worker) => worker,
            None => panic!("device id {device} is not managed by this driver"),
        };
        if let Some(sender) = worker.sender.as_ref() {
            // The worker can only be gone during driver teardown; run the job inline in that case.
            if let Err(mpsc::SendError(job)) = sender.send(job) {
                job();
            }
        }
    }
}

impl Drop for HostDriver {
    fn drop(&mut self) {
        for worker in self.workers.values_mut() {
            worker.sender.take();
        }
        for worker in self.workers.values_mut() {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

struct ExecutionCountdown {
    remaining: AtomicUsize,
    handle: Mutex<Option<AsyncValueHandle<()>>>,
}

/// Device-side tensor data managed by the [`HostDriver`]: a logical [`Shape`], a placement, and one
/// [`ArrayShard`] per participating device, in shard order. Arrays are immutable once created.
pub struct DeviceArray {
    shape: Shape,
    kind: ShardingKind,
    shards: Vec<ArrayShard>,
}

/// One shard of a [`DeviceArray`]: the owning device and the shard's data.
#[derive(Clone)]
pub struct ArrayShard {
    pub device: DeviceId,
    pub literal: Literal,
}

impl DeviceArray {
    /// Returns the logical [`Shape`] of this array.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the placement of this array over its devices.
    pub fn kind(&self) -> &ShardingKind {
        &self.kind
    }

    /// Returns the shards of this array, in shard order.
    pub fn shards(&self) -> &[ArrayShard] {
        self.shards.as_slice()
    }

    /// Returns the number of shards of this array.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns the driver ids of the devices this array spans, in shard order.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.shards.iter().map(|shard| shard.device).collect()
    }
}

/// One instruction of a [`ProgramModule`]. Operands are indices of earlier instructions in the module.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    /// Names the `index`-th input of the program, with its logical shape and an optional input placement
    /// annotation.
    Parameter { index: usize, shape: Shape, sharding: Option<ShardingKind> },

    /// Materializes a scalar constant of the provided element type.
    ScalarConstant { dtype: DType, value: f64 },

    /// Element-wise addition. A scalar operand broadcasts against the other operand.
    Add { lhs: usize, rhs: usize },

    /// Element-wise multiplication. A scalar operand broadcasts against the other operand.
    Multiply { lhs: usize, rhs: usize },
}

/// One output of a [`ProgramModule`]: the instruction producing the value and an optional output placement
/// annotation.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputSpec {
    pub instruction: usize,
    pub sharding: Option<ShardingKind>,
}

/// Program representation that the [`HostDriver`] compiles and interprets: a flat, topologically ordered
/// instruction list with explicit outputs. Front-end graphs are lowered into this form before compilation.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgramModule {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub outputs: Vec<OutputSpec>,
}

impl ProgramModule {
    /// Validates this module and infers the [`Shape`] of every instruction. Checks that operand references point
    /// at earlier instructions, that operand shapes and element types agree (modulo scalar broadcast), that
    /// parameter indices are dense from zero, and that the module has at least one output.
    pub fn infer_shapes(&self) -> Result<Vec<Shape>, Error> {
        if self.outputs.is_empty() {
            return Err(Error::invalid_argument(format!("module '{}' has no outputs", self.name)));
        }

        let mut parameter_indices = HashSet::new();
        let mut shapes: Vec<Shape> = Vec::with_capacity(self.instructions.len());
        for (position, instruction) in self.instructions.iter().enumerate() {
            let shape = match instruction {
                Instruction::Parameter { index, shape, .. } => {
                    if !parameter_indices.insert(*index) {
                        return Err(Error::invalid_argument(format!(
                            "module '{}' declares parameter #{index} more than once",
                            self.name,
                        )));
                    }
                    shape.clone()
                }
                Instruction::ScalarConstant { dtype, .. } => Shape::scalar(*dtype),
                Instruction::Add { lhs, rhs } | Instruction::Multiply { lhs, rhs } => {
                    let lhs_shape = operand_shape(&shapes, *lhs, position, &self.name)?;
                    let rhs_shape = operand_shape(&shapes, *rhs, position, &self.name)?;
                    if lhs_shape.dtype() != rhs_shape.dtype() {
                        return Err(Error::invalid_argument(format!(
                            "instruction #{position} of module '{}' mixes element types '{}' and '{}'",
                            self.name,
                            lhs_shape.dtype(),
                            rhs_shape.dtype(),
                        )));
                    }
                    if lhs_shape.dimensions() == rhs_shape.dimensions() {
                        lhs_shape.clone()
                    } else if lhs_shape.rank() == 0 {
                        rhs_shape.clone()
                    } else if rhs_shape.rank() == 0 {
                        lhs_shape.clone()
                    } else {
                        return Err(Error::invalid_argument(format!(
                            "instruction #{position} of module '{}' combines incompatible shapes {lhs_shape} and {rhs_shape}",
                            self.name,
                        )));
                    }
                }
            };
            shapes.push(shape);
        }

        for index in 0..parameter_indices.len() {
            if !parameter_indices.contains(&index) {
                return Err(Error::invalid_argument(format!(
                    "module '{}' has {} parameter(s) but does not declare parameter #{index}",
                    self.name,
                    parameter_indices.len(),
                )));
            }
        }
        for (output_index, output) in self.outputs.iter().enumerate() {
            if output.instruction >= self.instructions.len() {
                return Err(Error::invalid_argument(format!(
                    "output #{output_index} of module '{}' references instruction #{} which does not exist",
                    self.name, output.instruction,
                )));
            }
        }
        Ok(shapes)
    }
}

fn operand_shape<'s>(
    shapes: &'s [Shape],
    operand: usize,
    position: usize,
    module_name: &str,
) -> Result<&'s Shape, Error> {
    shapes.get(operand).ok_or_else(|| {
        Error::invalid_argument(format!(
            "instruction #{position} of module '{module_name}' references instruction #{operand} which does not precede it",
        ))
    })
}

/// Options controlling [`HostDriver::compile`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileOptions {
    /// Number of replicas of the computation to run.
    pub num_replicas: usize,

    /// Number of partitions each replica is split across.
    pub num_partitions: usize,

    /// Device assignment with one row per replica and one column per partition, holding driver ids.
    pub device_assignment: Vec<Vec<DeviceId>>,

    /// When `true`, the executable expects its parameters wrapped in a single tuple argument.
    pub parameter_is_tupled_arguments: bool,

    /// When `true`, unannotated output placements are propagated from the values flowing into them instead of
    /// defaulting to replicated.
    pub allow_spmd_sharding_propagation_to_output: bool,
}

/// Options controlling [`HostDriver::execute`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// When `true`, argument shapes must match the executable's parameter shapes exactly.
    pub strict_shape_checking: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self { strict_shape_checking: true }
    }
}

/// Result of compiling a [`ProgramModule`]: the module, its inferred per-instruction shapes, the devices it is
/// bound to, the replica/partition layout, and the derived per-output placements.
pub struct LoadedExecutable {
    module: ProgramModule,
    shapes: Vec<Shape>,
    devices: Vec<DeviceId>,
    num_replicas: usize,
    num_partitions: usize,
    parameter_is_tupled_arguments: bool,
    output_shardings: Option<Vec<ShardingKind>>,
}

impl LoadedExecutable {
    /// Returns the name of the compiled module.
    pub fn name(&self) -> &str {
        self.module.name.as_str()
    }

    /// Returns the driver ids of the devices this executable is bound to, in device-assignment order.
    pub fn devices(&self) -> &[DeviceId] {
        self.devices.as_slice()
    }

    /// Returns the number of replicas this executable runs.
    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Returns the number of partitions each replica is split across.
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Returns `true` if the executable expects its parameters wrapped in a single tuple argument.
    pub fn parameter_is_tupled_arguments(&self) -> bool {
        self.parameter_is_tupled_arguments
    }

    /// Returns the number of parameters the executable takes.
    pub fn parameter_count(&self) -> usize {
        self.module
            .instructions
            .iter()
            .filter(|instruction| matches!(instruction, Instruction::Parameter { .. }))
            .count()
    }

    /// Returns the number of outputs the executable produces.
    pub fn output_count(&self) -> usize {
        self.module.outputs.len()
    }

    /// Returns the inferred [`Shape`]s of the executable's outputs, in output order.
    pub fn output_shapes(&self) -> Vec<Shape> {
        self.module.outputs.iter().map(|output| self.shapes[output.instruction].clone()).collect()
    }

    /// Returns the derived per-output placements of this executable, if it reports them.
    pub fn output_shardings(&self) -> Option<&[ShardingKind]> {
        self.output_shardings.as_deref()
    }
}

fn derive_output_sharding(module: &ProgramModule, output: &OutputSpec, allow_propagation: bool) -> ShardingKind {
    if let Some(kind) = &output.sharding {
        return kind.clone();
    }
    if allow_propagation {
        return propagate_sharding(module, output.instruction);
    }
    ShardingKind::Replicated
}

fn propagate_sharding(module: &ProgramModule, instruction: usize) -> ShardingKind {
    match &module.instructions[instruction] {
        Instruction::Parameter { sharding, .. } => sharding.clone().unwrap_or(ShardingKind::Replicated),
        Instruction::ScalarConstant { .. } => ShardingKind::Replicated,
        Instruction::Add { lhs, rhs } | Instruction::Multiply { lhs, rhs } => {
            let lhs_kind = propagate_sharding(module, *lhs);
            if lhs_kind != ShardingKind::Replicated { lhs_kind } else { propagate_sharding(module, *rhs) }
        }
    }
}

/// Reassembles the logical [`Literal`] of the provided array from its shards.
fn assemble_logical(array: &Arc<DeviceArray>) -> Result<Literal, Error> {
    match array.kind() {
        ShardingKind::Replicated => Ok(array.shards[0].literal.clone()),
        kind @ ShardingKind::Tiled { .. } => {
            let slices = kind.shard_slices(array.shard_count(), array.shape().dimensions())?;
            let mut bytes = vec![0u8; array.shape().byte_size()];
            for (shard, shard_slices) in array.shards.iter().zip(&slices) {
                insert_slice(&mut bytes, array.shape(), &shard.literal, shard_slices);
            }
            Literal::from_bytes(array.shape().clone(), bytes)
        }
    }
}


/// Copies the region of `literal` described by `slices` into a new, densely packed [`Literal`],
/// one contiguous innermost run at a time.
fn extract_slice(literal: &Literal, slices: &[ShardSlice]) -> Result<Literal, Error> {
    let dtype = literal.shape().dtype();
    let shard_shape = Shape::new(dtype, slices.iter().map(ShardSlice::len).collect());
    let mut bytes = vec![0u8; shard_shape.byte_size()];
    if shard_shape.rank() == 0 || shard_shape.element_count() == 0 {
        let length = bytes.len();
        bytes.copy_from_slice(&literal.bytes()[..length]);
        return Literal::from_bytes(shard_shape, bytes);
    }

    let element_size = dtype.byte_size();
    let logical_strides = literal.shape().byte_strides();
    let shard_strides = shard_shape.byte_strides();
    let rank = slices.len();
    let run = shard_shape.dimensions()[rank - 1] * element_size;
    let outer_dims = shard_shape.dimensions()[..rank - 1].to_vec();
    let mut index = vec![0usize; rank - 1];
    'rows: loop {
        let mut logical_offset = slices[rank - 1].start() * logical_strides[rank - 1];
        let mut shard_offset = 0usize;
        for dim in 0..rank - 1 {
            logical_offset += (slices[dim].start() + index[dim]) * logical_strides[dim];
            shard_offset += index[dim] * shard_strides[dim];
        }
        bytes[shard_offset..shard_offset + run]
            .copy_from_slice(&literal.bytes()[logical_offset..logical_offset + run]);
        for dim in (0..rank - 1).rev() {
            index[dim] += 1;
            if index[dim] < outer_dims[dim] {
                continue 'rows;
            }
            index[dim] = 0;
        }
        break;
    }
    Literal::from_bytes(shard_shape, bytes)
}

/// Copies the provided densely packed shard into the region of the logical buffer described by `slices`,
/// one contiguous innermost run at a time.
fn insert_slice(logical_bytes: &mut [u8], logical_shape: &Shape, shard: &Literal, slices: &[ShardSlice]) {
    if shard.shape().rank() == 0 {
        logical_bytes[..shard.bytes().len()].copy_from_slice(shard.bytes());
        return;
    }
    if shard.shape().element_count() == 0 {
        return;
    }

    let element_size = logical_shape.dtype().byte_size();
    let logical_strides = logical_shape.byte_strides();
    let shard_strides = shard.shape().byte_strides();
    let rank = slices.len();
    let run = shard.shape().dimensions()[rank - 1] * element_size;
    let outer_dims = shard.shape().dimensions()[..rank - 1].to_vec();
    let mut index = vec![0usize; rank - 1];
    'rows: loop {
        let mut logical_offset = slices[rank - 1].start() * logical_strides[rank - 1];
        let mut shard_offset = 0usize;
        for dim in 0..rank - 1 {
            logical_offset += (slices[dim].start() + index[dim]) * logical_strides[dim];
            shard_offset += index[dim] * shard_strides[dim];
        }
        logical_bytes[logical_offset..logical_offset + run]
            .copy_from_slice(&shard.bytes()[shard_offset..shard_offset + run]);
        for dim in (0..rank - 1).rev() {
            index[dim] += 1;
            if index[dim] < outer_dims[dim] {
                continue 'rows;
            }
            index[dim] = 0;
        }
        break;
    }
}

/// Materializes a scalar [`Literal`] of the provided element type from an `f64`.
fn materialize_scalar(dtype: DType, value: f64) -> Literal {
    fn scalar<T: NativeType>(value: f64) -> Literal {
        Literal::scalar(T::from_f64(value))
    }
    match dtype {
        DType::Pred => scalar::<bool>(value),
        DType::I8 => scalar::<i8>(value),
        DType::I16 => scalar::<i16>(value),
        DType::I32 => scalar::<i32>(value),
        DType::I64 => scalar::<i64>(value),
        DType::U8 => scalar::<u8>(value),
        DType::U16 => scalar::<u16>(value),
        DType::U32 => scalar::<u32>(value),
        DType::U64 => scalar::<u64>(value),
        DType::BF16 => scalar::<half::bf16>(value),
        DType::F16 => scalar::<half::f16>(value),
        DType::F32 => scalar::<f32>(value),
        DType::F64 => scalar::<f64>(value),
    }
}

/// Evaluates an element-wise binary operation over two literals, broadcasting a scalar operand if present.
fn binary_elementwise(lhs: &Literal, rhs: &Literal, multiply: bool) -> Result<Literal, Error> {
    fn evaluate<T: NativeType>(lhs: &Literal, rhs: &Literal, multiply: bool) -> Result<Literal, Error> {
        let lhs_elements = lhs.to_elements::<T>()?;
        let rhs_elements = rhs.to_elements::<T>()?;
        let apply = |a: T, b: T| if multiply { a.mul(b) } else { a.add(b) };
        let (dimensions, elements): (Vec<usize>, Vec<T>) = if lhs.shape().rank() == 0 && rhs.shape().rank() != 0 {
            (rhs.shape().dimensions().to_vec(), rhs_elements.iter().map(|b| apply(lhs_elements[0], *b)).collect())
        } else if rhs.shape().rank() == 0 && lhs.shape().rank() != 0 {
            (lhs.shape().dimensions().to_vec(), lhs_elements.iter().map(|a| apply(*a, rhs_elements[0])).collect())
        } else if lhs.shape().dimensions() == rhs.shape().dimensions() {
            (
                lhs.shape().dimensions().to_vec(),
                lhs_elements.iter().zip(&rhs_elements).map(|(a, b)| apply(*a, *b)).collect(),
            )
        } else {
            return Err(Error::invalid_argument(format!(
                "cannot combine literals with shapes {} and {}",
                lhs.shape(),
                rhs.shape(),
            )));
        };
        Literal::from_elements(dimensions, &elements)
    }

    match lhs.shape().dtype() {
        DType::Pred => evaluate::<bool>(lhs, rhs, multiply),
        DType::I8 => evaluate::<i8>(lhs, rhs, multiply),
        DType::I16 => evaluate::<i16>(lhs, rhs, multiply),
        DType::I32 => evaluate::<i32>(lhs, rhs, multiply),
        DType::I64 => evaluate::<i64>(lhs, rhs, multiply),
        DType::U8 => evaluate::<u8>(lhs, rhs, multiply),
        DType::U16 => evaluate::<u16>(lhs, rhs, multiply),
        DType::U32 => evaluate::<u32>(lhs, rhs, multiply),
        DType::U64 => evaluate::<u64>(lhs, rhs, multiply),
        DType::BF16 => evaluate::<half::bf16>(lhs, rhs, multiply),
        DType::F16 => evaluate::<half::f16>(lhs, rhs, multiply),
        DType::F32 => evaluate::<f32>(lhs, rhs, multiply),
        DType::F64 => evaluate::<f64>(lhs, rhs, multiply),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;

    fn driver(device_count: usize) -> HostDriver {
        HostDriver::new(HostDriverOptions { device_count, ..HostDriverOptions::default() }).unwrap()
    }

    #[test]
    fn test_driver_device_enumeration() {
        let driver = HostDriver::new(HostDriverOptions {
            device_ids: Some(vec![4, 1, 7]),
            ..HostDriverOptions::default()
        })
        .unwrap();
        assert_eq!(driver.platform(), "cpu");
        assert_eq!(driver.devices().len(), 3);
        assert_eq!(driver.process_index(), 0);
        assert!(matches!(
            HostDriver::new(HostDriverOptions { device_count: 0, ..HostDriverOptions::default() }),
            Err(Error::InvalidArgument { .. }),
        ));
        assert!(matches!(
            HostDriver::new(HostDriverOptions { device_ids: Some(vec![1, 1]), ..HostDriverOptions::default() }),
            Err(Error::InvalidArgument { .. }),
        ));
    }

    #[test]
    fn test_create_array_releases_host_buffer() {
        let driver = driver(1);
        let released = Arc::new(AtomicBool::new(false));
        let released_clone = Arc::clone(&released);
        let literal = Literal::from_elements(vec![2], &[1.0f32, 2.0]).unwrap();
        let array = driver
            .create_array(0, literal.clone(), move || released_clone.store(true, Ordering::SeqCst))
            .unwrap();
        assert_eq!(array.shape(), literal.shape());
        assert_eq!(array.devices(), vec![0]);
        assert_eq!(driver.copy_to_host(&array).wait().unwrap(), literal);
        // The host copy runs after the release callback on the same worker.
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_assemble_and_disassemble_round_trip() {
        let driver = driver(2);
        let first = driver.create_array(0, Literal::from_elements(vec![1, 2], &[1i32, 2]).unwrap(), || {}).unwrap();
        let second = driver.create_array(1, Literal::from_elements(vec![1, 2], &[3i32, 4]).unwrap(), || {}).unwrap();

        let shape = Shape::new(DType::I32, vec![2, 2]);
        let kind = ShardingKind::Tiled { tile_counts: vec![2, 1] };
        let assembled = driver.assemble(shape.clone(), kind, vec![first, second]).unwrap();
        assert_eq!(assembled.shape(), &shape);
        assert_eq!(assembled.shard_count(), 2);
        assert_eq!(assemble_logical(&assembled).unwrap().to_elements::<i32>().unwrap(), vec![1, 2, 3, 4]);

        let shards = driver.disassemble(&assembled);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].devices(), vec![0]);
        assert_eq!(shards[1].devices(), vec![1]);
        assert_eq!(shards[1].shards()[0].literal.to_elements::<i32>().unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_assemble_rejects_mismatched_shards() {
        let driver = driver(2);
        let first = driver.create_array(0, Literal::from_elements(vec![3], &[1i32, 2, 3]).unwrap(), || {}).unwrap();
        let second = driver.create_array(1, Literal::from_elements(vec![2], &[4i32, 5]).unwrap(), || {}).unwrap();
        let result = driver.assemble(
            Shape::new(DType::I32, vec![4]),
            ShardingKind::Tiled { tile_counts: vec![2] },
            vec![first, second],
        );
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn test_slice_extraction_and_insertion() {
        let literal = Literal::from_elements(vec![2, 3], &[1i64, 2, 3, 4, 5, 6]).unwrap();
        let slices = [ShardSlice::new(0, 2).unwrap(), ShardSlice::new(1, 3).unwrap()];
        let extracted = extract_slice(&literal, &slices).unwrap();
        assert_eq!(extracted.shape().dimensions(), &[2, 2]);
        assert_eq!(extracted.to_elements::<i64>().unwrap(), vec![2, 3, 5, 6]);

        let mut bytes = vec![0u8; literal.shape().byte_size()];
        insert_slice(&mut bytes, literal.shape(), &extracted, &slices);
        let reinserted = Literal::from_bytes(literal.shape().clone(), bytes).unwrap();
        assert_eq!(reinserted.to_elements::<i64>().unwrap(), vec![0, 2, 3, 0, 5, 6]);
    }

    fn add_scalar_module(shape: Shape, value: f64) -> ProgramModule {
        let dtype = shape.dtype();
        ProgramModule {
            name: "add_scalar".to_string(),
            instructions: vec![
                Instruction::Parameter { index: 0, shape, sharding: None },
                Instruction::ScalarConstant { dtype, value },
                Instruction::Add { lhs: 0, rhs: 1 },
            ],
            outputs: vec![OutputSpec { instruction: 2, sharding: None }],
        }
    }

    #[test]
    fn test_compile_validates_assignment_and_module() {
        let driver = driver(2);
        let module = add_scalar_module(Shape::new(DType::F32, vec![4]), 1.0);

        let options = CompileOptions {
            num_replicas: 1,
            num_partitions: 2,
            device_assignment: vec![vec![0]],
            parameter_is_tupled_arguments: false,
            allow_spmd_sharding_propagation_to_output: false,
        };
        assert!(matches!(driver.compile(module.clone(), options), Err(Error::InvalidArgument { .. })));

        let mut invalid = module.clone();
        invalid.outputs[0].instruction = 9;
        let options = CompileOptions {
            num_replicas: 1,
            num_partitions: 2,
            device_assignment: vec![vec![0, 1]],
            parameter_is_tupled_arguments: false,
            allow_spmd_sharding_propagation_to_output: false,
        };
        assert!(matches!(driver.compile(invalid, options.clone()), Err(Error::InvalidArgument { .. })));

        let executable = driver.compile(module, options).unwrap();
        assert_eq!(executable.devices(), &[0, 1]);
        assert_eq!(executable.parameter_count(), 1);
        assert_eq!(executable.output_count(), 1);
        assert_eq!(executable.output_shardings(), Some([ShardingKind::Replicated].as_slice()));
    }

    #[test]
    fn test_execute_assembles_interprets_and_reshards() {
        let driver = driver(2);
        let first = driver.create_array(0, Literal::from_elements(vec![2], &[1.0f32, 2.0]).unwrap(), || {}).unwrap();
        let second = driver.create_array(1, Literal::from_elements(vec![2], &[3.0f32, 4.0]).unwrap(), || {}).unwrap();
        let argument = driver
            .assemble(
                Shape::new(DType::F32, vec![4]),
                ShardingKind::Tiled { tile_counts: vec![2] },
                vec![first, second],
            )
            .unwrap();

        let module = add_scalar_module(Shape::new(DType::F32, vec![4]), 10.0);
        let executable = driver
            .compile(
                module,
                CompileOptions {
                    num_replicas: 1,
                    num_partitions: 2,
                    device_assignment: vec![vec![0, 1]],
                    parameter_is_tupled_arguments: true,
                    allow_spmd_sharding_propagation_to_output: false,
                },
            )
            .unwrap();

        let (outputs, status) = driver.execute(&executable, &[argument], &ExecuteOptions::default()).unwrap();
        status.wait().unwrap();
        assert_eq!(outputs.len(), 1);
        let output = &outputs[0];
        assert_eq!(output.kind(), &ShardingKind::Replicated);
        assert_eq!(output.devices(), vec![0, 1]);
        for shard in output.shards() {
            assert_eq!(shard.literal.to_elements::<f32>().unwrap(), vec![11.0, 12.0, 13.0, 14.0]);
        }
    }

    #[test]
    fn test_execute_strict_shape_checking() {
        let driver = driver(1);
        let argument =
            driver.create_array(0, Literal::from_elements(vec![3], &[1.0f32, 2.0, 3.0]).unwrap(), || {}).unwrap();
        let module = add_scalar_module(Shape::new(DType::F32, vec![4]), 1.0);
        let executable = driver
            .compile(
                module,
                CompileOptions {
                    num_replicas: 1,
                    num_partitions: 1,
                    device_assignment: vec![vec![0]],
                    parameter_is_tupled_arguments: false,
                    allow_spmd_sharding_propagation_to_output: false,
                },
            )
            .unwrap();
        let result = driver.execute(&executable, &[argument], &ExecuteOptions::default());
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn test_submission_order_is_preserved_per_device() {
        let driver = driver(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for step in 0..8 {
            let order = Arc::clone(&order);
            let literal = Literal::scalar(step as i64);
            driver
                .create_array(0, literal, move || {
                    std::thread::sleep(Duration::from_millis(1));
                    order.lock().unwrap().push(step);
                })
                .unwrap();
        }
        // A host copy on the same device runs after all previously submitted callbacks.
        let array = driver.create_array(0, Literal::scalar(0i64), || {}).unwrap();
        driver.copy_to_host(&array).wait().unwrap();
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }
}
