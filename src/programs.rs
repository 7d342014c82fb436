use std::sync::Arc;

use crate::{
    DType, DeviceId, DeviceRegistry, Error, HostDriver, Instruction, LoadedExecutable, OutputSpec, ProgramModule,
    Shape, ShardingKind,
};

/// Identifier of a value inside a [`Graph`], minted by the [`GraphBuilder`] that owns the graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ValueId(usize);

/// Computation graph handed to compilation by the front end: parameters, scalar constants, element-wise additions
/// and multiplications, with optional per-value placement annotations. Graphs are built with a [`GraphBuilder`]
/// and lowered to the driver's [`ProgramModule`] during compilation.
#[derive(Clone, Debug, PartialEq)]
pub struct Graph {
    module: ProgramModule,
}

impl Graph {
    /// Returns the name of this graph.
    pub fn name(&self) -> &str {
        self.module.name.as_str()
    }

    /// Lowers this graph to the driver's [`ProgramModule`] representation.
    pub(crate) fn lower(&self) -> ProgramModule {
        self.module.clone()
    }
}

/// Builder for [`Graph`]s. Operations return [`ValueId`]s that later operations take as operands; feeding a builder
/// a [`ValueId`] minted by a different builder is a contract violation and panics.
pub struct GraphBuilder {
    name: String,
    instructions: Vec<Instruction>,
    outputs: Vec<OutputSpec>,
}

impl GraphBuilder {
    /// Creates a new [`GraphBuilder`] for a graph with the provided name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into(), instructions: Vec::new(), outputs: Vec::new() }
    }

    /// Declares the `index`-th input of the graph, with an optional input placement annotation.
    pub fn parameter(&mut self, index: usize, shape: Shape, sharding: Option<ShardingKind>) -> ValueId {
        self.push(Instruction::Parameter { index, shape, sharding })
    }

    /// Materializes a scalar constant of the provided element type.
    pub fn scalar_constant(&mut self, dtype: DType, value: f64) -> ValueId {
        self.push(Instruction::ScalarConstant { dtype, value })
    }

    /// Adds two values element-wise. A scalar operand broadcasts against the other operand.
    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let (lhs, rhs) = (self.check(lhs), self.check(rhs));
        self.push(Instruction::Add { lhs, rhs })
    }

    /// Multiplies two values element-wise. A scalar operand broadcasts against the other operand.
    pub fn multiply(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let (lhs, rhs) = (self.check(lhs), self.check(rhs));
        self.push(Instruction::Multiply { lhs, rhs })
    }

    /// Marks the provided value as an output of the graph, with an optional output placement annotation.
    /// Outputs appear in the order they are marked.
    pub fn output(&mut self, value: ValueId, sharding: Option<ShardingKind>) {
        let instruction = self.check(value);
        self.outputs.push(OutputSpec { instruction, sharding });
    }

    /// Finishes the graph.
    pub fn build(self) -> Graph {
        Graph { module: ProgramModule { name: self.name, instructions: self.instructions, outputs: self.outputs } }
    }

    fn push(&mut self, instruction: Instruction) -> ValueId {
        self.instructions.push(instruction);
        ValueId(self.instructions.len() - 1)
    }

    fn check(&self, value: ValueId) -> usize {
        if value.0 >= self.instructions.len() {
            panic!("value id #{} does not belong to graph '{}'", value.0, self.name);
        }
        value.0
    }
}

/// One unit of compilation: a [`Graph`] together with the devices it will run on and the layout flags that decide
/// how replicas and partitions are assigned. Instances are consumed synchronously by
/// [`Client::compile`](crate::Client::compile).
#[derive(Clone, Debug, PartialEq)]
pub struct CompileInstance {
    /// Graph to compile.
    pub graph: Graph,

    /// Device string the compilation itself is attributed to.
    pub compilation_device: String,

    /// Device strings the compiled computation will run on.
    pub devices: Vec<String>,

    /// When `true`, the computation is compiled as a single partitioned program spanning `devices` (one replica,
    /// one partition per device). When `false`, it is compiled for per-device replica execution (one partition,
    /// one replica per device).
    pub is_sharded: bool,

    /// When `true`, the compiled executable expects its parameters wrapped in a single tuple argument.
    pub parameter_is_tupled_arguments: bool,

    /// When `true`, unannotated output placements are propagated from the values flowing into them instead of
    /// defaulting to replicated.
    pub allow_spmd_sharding_propagation_to_output: bool,
}

impl CompileInstance {
    /// Creates a new sharded [`CompileInstance`] over the provided devices with tupled parameters and output
    /// placement propagation disabled, matching the layout used for replicated execution.
    pub fn sharded<S: Into<String>>(graph: Graph, compilation_device: S, devices: Vec<String>) -> Self {
        Self {
            graph,
            compilation_device: compilation_device.into(),
            devices,
            is_sharded: true,
            parameter_is_tupled_arguments: true,
            allow_spmd_sharding_propagation_to_output: false,
        }
    }
}

/// Result of compiling a [`CompileInstance`]: an immutable pairing of the driver executable with the device
/// strings it is bound to and the replica/partition assignment it was compiled with.
pub struct Computation {
    name: String,
    executable: Arc<LoadedExecutable>,
    devices: Vec<String>,
    device_assignment: Vec<Vec<DeviceId>>,
}

impl Computation {
    /// Returns the name of the compiled graph.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the driver executable behind this computation.
    pub fn executable(&self) -> &Arc<LoadedExecutable> {
        &self.executable
    }

    /// Returns the device strings this computation is bound to.
    pub fn devices(&self) -> &[String] {
        self.devices.as_slice()
    }

    /// Returns the device assignment this computation was compiled with, one row per replica and one column
    /// per partition, holding driver ids.
    pub fn device_assignment(&self) -> &[Vec<DeviceId>] {
        self.device_assignment.as_slice()
    }
}

/// Builds the replica/partition layout and device assignment for the provided instance and compiles it.
///
/// A sharded instance compiles to one replica split across one partition per device: the assignment has a single
/// row whose column for each device's global ordinal holds that device's driver id. An unsharded instance compiles
/// to one replica per device with a single partition each: a one-column assignment in ordinal order.
pub(crate) fn compile_instance(
    driver: &HostDriver,
    registry: &DeviceRegistry,
    instance: CompileInstance,
) -> Result<Computation, Error> {
    let device_count = instance.devices.len();
    if device_count == 0 {
        return Err(Error::invalid_argument(format!(
            "compile instance '{}' names no devices",
            instance.graph.name(),
        )));
    }

    let (num_replicas, num_partitions) = if instance.is_sharded { (1, device_count) } else { (device_count, 1) };
    let mut device_assignment = vec![vec![0 as DeviceId; num_partitions]; num_replicas];
    for device in &instance.devices {
        let ordinal = registry.ordinal(device);
        let id = registry.string_to_device(device).id;
        if instance.is_sharded {
            device_assignment[0][ordinal] = id;
        } else {
            device_assignment[ordinal][0] = id;
        }
    }

    tracing::debug!(
        name = %instance.graph.name(),
        device = %instance.compilation_device,
        num_replicas,
        num_partitions,
        "compiling computation",
    );

    let executable = driver.compile(
        instance.graph.lower(),
        crate::CompileOptions {
            num_replicas,
            num_partitions,
            device_assignment: device_assignment.clone(),
            parameter_is_tupled_arguments: instance.parameter_is_tupled_arguments,
            allow_spmd_sharding_propagation_to_output: instance.allow_spmd_sharding_propagation_to_output,
        },
    )?;

    Ok(Computation {
        name: instance.graph.name().to_string(),
        executable,
        devices: instance.devices,
        device_assignment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Device, HostDriverOptions};

    fn add_one_graph(shape: Shape) -> Graph {
        let dtype = shape.dtype();
        let mut builder = GraphBuilder::new("add_one");
        let input = builder.parameter(0, shape, None);
        let one = builder.scalar_constant(dtype, 1.0);
        let sum = builder.add(input, one);
        builder.output(sum, None);
        builder.build()
    }

    #[test]
    fn test_graph_builder_lowering() {
        let graph = add_one_graph(Shape::new(DType::F32, vec![4]));
        let module = graph.lower();
        assert_eq!(module.name, "add_one");
        assert_eq!(module.instructions.len(), 3);
        assert_eq!(module.outputs, vec![OutputSpec { instruction: 2, sharding: None }]);
        assert!(matches!(module.instructions[2], Instruction::Add { lhs: 0, rhs: 1 }));
    }

    #[test]
    #[should_panic(expected = "does not belong to graph")]
    fn test_graph_builder_foreign_value_panics() {
        let mut builder = GraphBuilder::new("empty");
        let mut other = GraphBuilder::new("other");
        let foreign = other.parameter(0, Shape::scalar(DType::F32), None);
        builder.output(foreign, None);
    }

    fn sparse_driver_and_registry() -> (HostDriver, DeviceRegistry) {
        let driver = HostDriver::new(HostDriverOptions {
            device_ids: Some(vec![6, 3]),
            ..HostDriverOptions::default()
        })
        .unwrap();
        let devices: Vec<Device> = driver.devices().to_vec();
        let registry = DeviceRegistry::new(driver.platform(), devices, driver.process_index());
        (driver, registry)
    }

    #[test]
    fn test_sharded_compile_layout() {
        let (driver, registry) = sparse_driver_and_registry();
        let graph = add_one_graph(Shape::new(DType::F32, vec![4]));
        let instance =
            CompileInstance::sharded(graph, registry.default_device(), registry.local_devices().to_vec());
        let computation = compile_instance(&driver, &registry, instance).unwrap();

        // One replica row with one partition column per device; each column holds the driver id of its ordinal.
        assert_eq!(computation.device_assignment(), &[vec![3, 6]]);
        assert_eq!(computation.executable().num_replicas(), 1);
        assert_eq!(computation.executable().num_partitions(), 2);
        assert_eq!(computation.devices(), &["CPU:0", "CPU:1"]);
    }

    #[test]
    fn test_unsharded_compile_layout() {
        let (driver, registry) = sparse_driver_and_registry();
        let graph = add_one_graph(Shape::new(DType::F32, vec![4]));
        let instance = CompileInstance {
            graph,
            compilation_device: registry.default_device().to_string(),
            devices: registry.local_devices().to_vec(),
            is_sharded: false,
            parameter_is_tupled_arguments: false,
            allow_spmd_sharding_propagation_to_output: false,
        };
        let computation = compile_instance(&driver, &registry, instance).unwrap();

        // One replica row per device, each with a single partition column.
        assert_eq!(computation.device_assignment(), &[vec![3], vec![6]]);
        assert_eq!(computation.executable().num_replicas(), 2);
        assert_eq!(computation.executable().num_partitions(), 1);
    }

    #[test]
    fn test_compile_aborts_on_invalid_graph() {
        let (driver, registry) = sparse_driver_and_registry();
        let mut builder = GraphBuilder::new("mixed_types");
        let lhs = builder.parameter(0, Shape::new(DType::F32, vec![2]), None);
        let rhs = builder.parameter(1, Shape::new(DType::I32, vec![2]), None);
        let sum = builder.add(lhs, rhs);
        builder.output(sum, None);
        let instance =
            CompileInstance::sharded(builder.build(), registry.default_device(), registry.local_devices().to_vec());
        assert!(matches!(compile_instance(&driver, &registry, instance), Err(Error::InvalidArgument { .. })));
    }
}
