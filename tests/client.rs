use spindle::{
    Client, ClientOptions, CompileInstance, CoordinatorOptions, DType, Device, DeviceRegistry, ExecuteReplicatedOptions,
    GraphBuilder, Literal, Shape, ShardingKind, ShardingSpec, TensorSource, SPMD_DEVICE,
};

fn client(device_count: usize) -> Client {
    Client::new(ClientOptions { device_count, ..ClientOptions::default() }).unwrap()
}

fn sum_computation(client: &Client, shape: Shape, sharding: Option<ShardingKind>) -> spindle::Computation {
    let dtype = shape.dtype();
    let mut builder = GraphBuilder::new("offset_sum");
    let input = builder.parameter(0, shape, sharding);
    let offset = builder.scalar_constant(dtype, 10.0);
    let sum = builder.add(input, offset);
    builder.output(sum, None);
    let instance =
        CompileInstance::sharded(builder.build(), client.default_device(), client.local_devices().to_vec());
    client.compile(vec![instance]).unwrap().remove(0)
}

#[test]
fn test_device_ordinals_are_stable_under_re_derivation() {
    let sparse_ids = [11, 2, 7];
    let forward: Vec<Device> = sparse_ids.iter().map(|id| Device::new(*id, 0)).collect();
    let reversed: Vec<Device> = sparse_ids.iter().rev().map(|id| Device::new(*id, 0)).collect();
    let first = DeviceRegistry::new("tpu", forward, 0);
    let second = DeviceRegistry::new("tpu", reversed, 0);

    assert_eq!(first.all_devices(), &["TPU:0", "TPU:1", "TPU:2"]);
    assert_eq!(first.all_devices(), second.all_devices());
    for id in sparse_ids {
        assert_eq!(first.device_to_string(id), second.device_to_string(id));
        let device = first.device_to_string(id);
        assert_eq!(first.string_to_device(device).id, id);
    }
    // Ordinals follow ascending driver id, not enumeration order.
    assert_eq!(first.device_to_string(2), "TPU:0");
    assert_eq!(first.device_to_string(7), "TPU:1");
    assert_eq!(first.device_to_string(11), "TPU:2");
}

#[test]
fn test_host_round_trip_preserves_shape_and_bits() {
    let client = client(1);
    let elements = vec![1.5f64, -0.0, f64::EPSILON, 6.02e23, -273.15, 0.1];
    let literal = Literal::from_elements::<f64>(vec![3, 2], &elements).unwrap();
    let handles = client.transfer_to_server(vec![TensorSource::new("CPU:0", literal.clone())]).unwrap();

    let results = client.transfer_from_server(&handles).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].shape(), &Shape::new(DType::F64, vec![3, 2]));
    assert_eq!(results[0].bytes(), literal.bytes());
    client.wait_device_ops(&[]);
}

#[test]
fn test_wrapped_shards_read_back_like_their_source() {
    let client = client(2);
    let elements = vec![4.0f32, 8.0, 15.0, 16.0, 23.0, 42.0];
    let sharding = ShardingSpec::tiled(client.local_devices().to_vec(), vec![2]).unwrap();
    let shards = vec![
        TensorSource::new("CPU:0", Literal::from_elements::<f32>(vec![3], &elements[..3]).unwrap()),
        TensorSource::new("CPU:1", Literal::from_elements::<f32>(vec![3], &elements[3..]).unwrap()),
    ];
    let handle = client
        .transfer_shards_to_server(shards, SPMD_DEVICE, Shape::new(DType::F32, vec![6]), sharding)
        .unwrap();

    let rewrapped = client
        .wrap_data_shards(
            client.get_data_shards(&handle),
            SPMD_DEVICE,
            handle.shape().clone(),
            handle.sharding(),
        )
        .unwrap();
    let original = client.transfer_from_server(std::slice::from_ref(&handle)).unwrap();
    let rebuilt = client.transfer_from_server(std::slice::from_ref(&rewrapped)).unwrap();
    assert_eq!(original[0].to_elements::<f32>().unwrap(), elements);
    assert_eq!(original, rebuilt);
    client.wait_device_ops(&[]);
}

#[test]
fn test_single_device_replication_compiles_nothing() {
    let client = client(2);
    let literal = Literal::from_elements::<i64>(vec![2], &[3, 4]).unwrap();
    let handle = client.transfer_to_server(vec![TensorSource::new("CPU:1", literal)]).unwrap().remove(0);
    let compiles_before = client.metrics().value("CreateCompileHandles");
    let results = client.transfer_from_server(std::slice::from_ref(&handle)).unwrap();
    assert_eq!(results[0].to_elements::<i64>().unwrap(), vec![3, 4]);
    assert_eq!(client.metrics().value("CreateCompileHandles"), compiles_before);
}

#[test]
fn test_empty_wrap_produces_unrealized_sharded_placeholder() {
    let client = client(2);
    let sharding = ShardingSpec::replicated(client.local_devices().to_vec()).unwrap();
    let handle = client
        .wrap_data_shards(Vec::new(), SPMD_DEVICE, Shape::new(DType::F32, vec![8]), sharding)
        .unwrap();
    assert!(!handle.has_value());
    assert!(handle.has_sharding());
    assert_eq!(handle.sharding().devices(), client.local_devices());
}

#[test]
fn test_sharded_compilation_assigns_one_partition_per_ordinal() {
    let client = client(3);
    let computation = sum_computation(&client, Shape::new(DType::F32, vec![6]), None);
    assert_eq!(computation.device_assignment(), &[vec![0, 1, 2]]);
    assert_eq!(computation.executable().num_replicas(), 1);
    assert_eq!(computation.executable().num_partitions(), 3);
}

#[test]
fn test_sharded_execution_tags_outputs_with_the_virtual_device() {
    let client = client(2);
    let shape = Shape::new(DType::F32, vec![4]);
    let sharding = ShardingSpec::tiled(client.local_devices().to_vec(), vec![2]).unwrap();
    let shards = vec![
        TensorSource::new("CPU:0", Literal::from_elements::<f32>(vec![2], &[1.0, 2.0]).unwrap()),
        TensorSource::new("CPU:1", Literal::from_elements::<f32>(vec![2], &[3.0, 4.0]).unwrap()),
    ];
    let argument = client.transfer_shards_to_server(shards, SPMD_DEVICE, shape.clone(), sharding).unwrap();

    let computation =
        sum_computation(&client, shape, Some(ShardingKind::Tiled { tile_counts: vec![2] }));
    let outputs = client
        .execute_replicated(&computation, &[argument], &ExecuteReplicatedOptions::default())
        .unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].device(), SPMD_DEVICE);
    let results = client.transfer_from_server(&outputs).unwrap();
    assert_eq!(results[0].to_elements::<f32>().unwrap(), vec![11.0, 12.0, 13.0, 14.0]);
    client.wait_device_ops(&[]);
}

#[test]
fn test_unannotated_outputs_inherit_input_placement_when_propagation_is_enabled() {
    let client = client(2);
    let shape = Shape::new(DType::F32, vec![4]);
    let tiled = ShardingKind::Tiled { tile_counts: vec![2] };
    let sharding = ShardingSpec::tiled(client.local_devices().to_vec(), vec![2]).unwrap();
    let shards = vec![
        TensorSource::new("CPU:0", Literal::from_elements::<f32>(vec![2], &[1.0, 2.0]).unwrap()),
        TensorSource::new("CPU:1", Literal::from_elements::<f32>(vec![2], &[3.0, 4.0]).unwrap()),
    ];
    let argument = client.transfer_shards_to_server(shards, SPMD_DEVICE, shape.clone(), sharding).unwrap();

    let mut builder = GraphBuilder::new("offset_sum");
    let input = builder.parameter(0, shape, Some(tiled.clone()));
    let offset = builder.scalar_constant(DType::F32, 1.0);
    let sum = builder.add(input, offset);
    builder.output(sum, None);
    let instance = CompileInstance {
        allow_spmd_sharding_propagation_to_output: true,
        ..CompileInstance::sharded(builder.build(), client.default_device(), client.local_devices().to_vec())
    };
    let computation = client.compile(vec![instance]).unwrap().remove(0);
    assert_eq!(computation.executable().output_shardings(), Some(std::slice::from_ref(&tiled)));

    let outputs = client
        .execute_replicated(&computation, &[argument], &ExecuteReplicatedOptions::default())
        .unwrap();
    assert_eq!(outputs[0].device(), SPMD_DEVICE);
    assert!(!outputs[0].sharding().is_replicated());
    let results = client.transfer_from_server(&outputs).unwrap();
    assert_eq!(results[0].to_elements::<f32>().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
    client.wait_device_ops(&[]);
}

#[test]
#[should_panic(expected = "not implemented")]
fn test_per_device_execution_is_fatal() {
    let client = client(1);
    let computation = sum_computation(&client, Shape::new(DType::F32, vec![2]), None);
    let _ = client.execute_computation(&computation, &[], "CPU:0");
}

#[test]
#[should_panic(expected = "not implemented")]
fn test_cross_device_copies_are_fatal() {
    let client = client(1);
    let handle = client.create_data_placeholder("CPU:0", Shape::scalar(DType::F32), None);
    let _ = client.copy_to_device(&handle, "CPU:0");
}

#[test]
#[should_panic(expected = "unknown device")]
fn test_unknown_device_string_is_fatal() {
    let client = client(1);
    let _ = client.device("CPU:7");
}

#[test]
#[should_panic(expected = "coordinator already initialized")]
fn test_double_coordinator_initialization_is_fatal() {
    let client = client(1);
    client.initialize_coordinator(CoordinatorOptions::default()).unwrap();
    let _ = client.initialize_coordinator(CoordinatorOptions::default());
}
