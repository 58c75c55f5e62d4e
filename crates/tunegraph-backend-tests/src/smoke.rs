use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tunegraph::graph::{Activation, MatMulOptions};
use tunegraph::kernel::KernelKey;
use tunegraph::{
    DType, Error, Executor, FusedExpr, Graph, KernelContext, OpId, OpKind, PerfRecord, Runtime,
    TuneConfig,
};

use crate::{
    assert_close, BackendHarness, BrokenSynthesizer, RuntimeEvent, INJECTED_COMPILER_FAULT,
};

fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Fixed kernels are optional per backend; a backend that leaves a triple
/// unregistered skips the test that needs it.
fn has_kernel(harness: &BackendHarness, op: OpKind) -> bool {
    let key = KernelKey::new(harness.runtime.device(), op, DType::Float32);
    let present = harness.registry().contains(&key);
    if !present {
        eprintln!("skipping: backend registers no {op} kernel for float32");
    }
    present
}

fn only_op(graph: &Graph) -> OpId {
    assert_eq!(graph.operators().len(), 1, "expected a single-operator graph");
    graph.operators()[0].id()
}

/// `out = relu(in0 + in1)` over two `dims` inputs, storage bound to `runtime`.
fn relu_add_graph(
    runtime: Arc<dyn Runtime>,
    dims: &[usize],
    rng: &mut StdRng,
) -> (Graph, Vec<f32>, Vec<f32>, tunegraph::TensorId) {
    let mut graph = Graph::new();
    let a = graph.add_tensor(dims, DType::Float32).unwrap();
    let b = graph.add_tensor(dims, DType::Float32).unwrap();
    let expr = FusedExpr::relu(FusedExpr::add(FusedExpr::input(0), FusedExpr::input(1)));
    let out = graph.mem_bound(&[a, b], None, expr).unwrap();
    graph.data_malloc(runtime).unwrap();

    let len: usize = dims.iter().product();
    let lhs = random_vec(rng, len);
    let rhs = random_vec(rng, len);
    graph.write_f32(a, &lhs).unwrap();
    graph.write_f32(b, &rhs).unwrap();
    (graph, lhs, rhs, out)
}

fn relu_add_reference(lhs: &[f32], rhs: &[f32]) -> Vec<f32> {
    lhs.iter().zip(rhs).map(|(a, b)| (a + b).max(0.0)).collect()
}

pub fn elementwise_add_broadcasts(harness: &BackendHarness) {
    if !has_kernel(harness, OpKind::Add) {
        return;
    }
    let registry = harness.registry();
    let mut rng = StdRng::seed_from_u64(7);
    let mut graph = Graph::new();
    let a = graph.add_tensor([2, 3], DType::Float32).unwrap();
    let b = graph.add_tensor([3], DType::Float32).unwrap();
    let out = graph.add(a, b, None).unwrap();
    graph.data_malloc(Arc::clone(&harness.runtime)).unwrap();

    let lhs = random_vec(&mut rng, 6);
    let rhs = random_vec(&mut rng, 3);
    graph.write_f32(a, &lhs).unwrap();
    graph.write_f32(b, &rhs).unwrap();

    let kernel = registry
        .lookup(harness.runtime.device(), OpKind::Add, DType::Float32)
        .unwrap();
    assert!(!kernel.requires_tuning());
    let op = graph.operator(only_op(&graph)).unwrap();
    kernel
        .compute(&KernelContext::new(&graph, op, harness.runtime.as_ref()))
        .unwrap();

    let expected: Vec<f32> = (0..6).map(|i| lhs[i] + rhs[i % 3]).collect();
    assert_close(&graph.read_f32(out).unwrap(), &expected, 1e-6);
}

pub fn matmul_matches_expected(harness: &BackendHarness) {
    if !has_kernel(harness, OpKind::MatMul) {
        return;
    }
    let registry = harness.registry();
    let mut graph = Graph::new();
    let a = graph.add_tensor([2, 3], DType::Float32).unwrap();
    let b = graph.add_tensor([3, 2], DType::Float32).unwrap();
    let bias = graph.add_tensor([2], DType::Float32).unwrap();
    let options = MatMulOptions {
        bias: Some(bias),
        act: Activation::Relu,
        ..MatMulOptions::default()
    };
    let out = graph.matmul(a, b, None, options).unwrap();
    graph.data_malloc(Arc::clone(&harness.runtime)).unwrap();
    graph.write_f32(a, &[1.0, 2.0, 3.0, -4.0, 5.0, -6.0]).unwrap();
    graph.write_f32(b, &[1.0, 0.5, -1.0, 2.0, 0.0, 1.0]).unwrap();
    graph.write_f32(bias, &[0.25, -10.0]).unwrap();

    Executor::new(Arc::clone(&harness.runtime), &registry)
        .run(&graph)
        .unwrap();
    // [1,2,3]x = [-1, 7.5]; [-4,5,-6]x = [-9, 2]; then bias and relu.
    assert_close(&graph.read_f32(out).unwrap(), &[0.0, 0.0, 0.0, 0.0], 1e-6);

    graph.write_f32(bias, &[2.0, -1.0]).unwrap();
    Executor::new(Arc::clone(&harness.runtime), &registry)
        .run(&graph)
        .unwrap();
    assert_close(&graph.read_f32(out).unwrap(), &[1.0, 6.5, 0.0, 1.0], 1e-6);
}

pub fn copy_kernels_preserve_bytes(harness: &BackendHarness) {
    if !has_kernel(harness, OpKind::Reshape) || !has_kernel(harness, OpKind::Flatten) {
        return;
    }
    let registry = harness.registry();
    let mut rng = StdRng::seed_from_u64(11);
    let mut graph = Graph::new();
    let x = graph.add_tensor([2, 3, 4], DType::Float32).unwrap();
    let reshaped = graph.reshape(x, None, &[4, 6]).unwrap();
    let flat = graph.flatten(reshaped, None).unwrap();
    graph.data_malloc(Arc::clone(&harness.runtime)).unwrap();
    let values = random_vec(&mut rng, 24);
    graph.write_f32(x, &values).unwrap();

    Executor::new(Arc::clone(&harness.runtime), &registry)
        .run(&graph)
        .unwrap();
    assert_eq!(graph.tensor(flat).unwrap().shape().dims(), &[4, 6]);
    let bytes_in = graph.read_bytes(x).unwrap();
    assert_eq!(graph.read_bytes(reshaped).unwrap(), bytes_in);
    assert_eq!(graph.read_bytes(flat).unwrap(), bytes_in);
}

pub fn membound_compute_without_record_fails(harness: &BackendHarness) {
    let registry = harness.registry();
    let mut rng = StdRng::seed_from_u64(3);
    let (graph, _, _, _) = relu_add_graph(Arc::clone(&harness.runtime), &[4, 4], &mut rng);
    let op_id = only_op(&graph);
    let op = graph.operator(op_id).unwrap();

    let kernel = registry
        .lookup(harness.runtime.device(), OpKind::MemBound, DType::Float32)
        .unwrap();
    assert!(kernel.requires_tuning());
    let ctx = KernelContext::new(&graph, op, harness.runtime.as_ref());
    match kernel.compute(&ctx) {
        Err(Error::MissingTuningRecord { op, kind }) => {
            assert_eq!(op, op_id);
            assert_eq!(kind, OpKind::MemBound);
        }
        other => panic!("expected MissingTuningRecord, got {other:?}"),
    }

    let timed = PerfRecord::Timed { time_ms: 1.0 };
    assert!(matches!(
        kernel.compute_with_record(&ctx, &timed),
        Err(Error::MissingTuningRecord { .. })
    ));
}

pub fn membound_end_to_end_4x4(harness: &BackendHarness) {
    let registry = harness.registry();
    let mut rng = StdRng::seed_from_u64(42);
    let (graph, lhs, rhs, out) = relu_add_graph(Arc::clone(&harness.runtime), &[4, 4], &mut rng);
    let op = graph.operator(only_op(&graph)).unwrap();
    let kernel = registry
        .lookup(harness.runtime.device(), OpKind::MemBound, DType::Float32)
        .unwrap();
    let ctx = KernelContext::new(&graph, op, harness.runtime.as_ref());

    let record = kernel.tune(&ctx, &TuneConfig::default()).unwrap();
    let jit = record.as_jit().expect("MemBound tuning yields a JIT record");
    assert!(!jit.entry_point().is_empty());
    assert!(jit.entry_point().ends_with("_kernel0"));
    assert_eq!(jit.launch().to_array().len(), 6);
    assert!(jit.launch().total_threads() >= 16);
    assert!(!jit.binary().is_empty());
    assert!(record.time_ms() >= 0.0);

    kernel.compute_with_record(&ctx, &record).unwrap();
    harness.runtime.synchronize().unwrap();
    assert_close(
        &graph.read_f32(out).unwrap(),
        &relu_add_reference(&lhs, &rhs),
        1e-5,
    );
}

pub fn membound_broadcast_matches_reference(harness: &BackendHarness) {
    let registry = harness.registry();
    let mut rng = StdRng::seed_from_u64(5);
    let mut graph = Graph::new();
    let a = graph.add_tensor([2, 3, 4], DType::Float32).unwrap();
    let b = graph.add_tensor([3, 1], DType::Float32).unwrap();
    let c = graph.add_tensor([4], DType::Float32).unwrap();
    let expr = FusedExpr::sub(
        FusedExpr::mul(FusedExpr::input(0), FusedExpr::input(1)),
        FusedExpr::div(FusedExpr::input(2), FusedExpr::constant(2.0)),
    );
    let out = graph.mem_bound(&[a, b, c], None, expr).unwrap();
    assert_eq!(graph.tensor(out).unwrap().shape().dims(), &[2, 3, 4]);
    graph.data_malloc(Arc::clone(&harness.runtime)).unwrap();

    let va = random_vec(&mut rng, 24);
    let vb = random_vec(&mut rng, 3);
    let vc = random_vec(&mut rng, 4);
    graph.write_f32(a, &va).unwrap();
    graph.write_f32(b, &vb).unwrap();
    graph.write_f32(c, &vc).unwrap();

    Executor::new(Arc::clone(&harness.runtime), &registry)
        .run(&graph)
        .unwrap();

    let mut expected = Vec::with_capacity(24);
    for n in 0..2 {
        for h in 0..3 {
            for w in 0..4 {
                expected.push(va[(n * 3 + h) * 4 + w] * vb[h] - vc[w] / 2.0);
            }
        }
    }
    assert_close(&graph.read_f32(out).unwrap(), &expected, 1e-5);
}

pub fn tuning_twice_is_bit_identical(harness: &BackendHarness) {
    let registry = harness.registry();
    let mut rng = StdRng::seed_from_u64(9);
    let (graph, _, _, out) = relu_add_graph(Arc::clone(&harness.runtime), &[8, 16], &mut rng);
    let op = graph.operator(only_op(&graph)).unwrap();
    let kernel = registry
        .lookup(harness.runtime.device(), OpKind::MemBound, DType::Float32)
        .unwrap();
    let ctx = KernelContext::new(&graph, op, harness.runtime.as_ref());

    let mut results = Vec::new();
    for _ in 0..2 {
        let record = kernel.tune(&ctx, &TuneConfig::default()).unwrap();
        kernel.compute_with_record(&ctx, &record).unwrap();
        let bits: Vec<u32> = graph
            .read_f32(out)
            .unwrap()
            .iter()
            .map(|v| v.to_bits())
            .collect();
        results.push((record.as_jit().unwrap().entry_point().to_string(), bits));
    }
    assert_eq!(results[0], results[1]);
}

pub fn record_is_reused_without_recompiling(harness: &BackendHarness) {
    let recording = harness.recording();
    let runtime: Arc<dyn Runtime> = recording.clone();
    let (registry, synth) = harness.counting_registry();
    let mut rng = StdRng::seed_from_u64(13);
    let (graph, lhs, rhs, out) = relu_add_graph(Arc::clone(&runtime), &[4, 4], &mut rng);
    let executor = Executor::new(Arc::clone(&runtime), &registry);

    recording.clear_events();
    executor.run(&graph).unwrap();
    assert_eq!(synth.calls(), 1);
    assert!(executor.record(only_op(&graph)).is_some());

    executor.run(&graph).unwrap();
    assert_close(
        &graph.read_f32(out).unwrap(),
        &relu_add_reference(&lhs, &rhs),
        1e-5,
    );

    assert_eq!(synth.calls(), 1, "second run must not synthesize");
    assert_eq!(
        recording.count(|e| matches!(e, RuntimeEvent::CreateProgram(_))),
        1
    );
    assert_eq!(recording.count(|e| matches!(e, RuntimeEvent::Compile(_))), 1);
    // tune + two tuned executions, each with its own module
    let loads = recording.count(|e| matches!(e, RuntimeEvent::LoadModule(_)));
    let unloads = recording.count(|e| matches!(e, RuntimeEvent::UnloadModule(_)));
    assert_eq!(loads, 3);
    assert_eq!(unloads, 3);

    let request = &synth.requests()[0];
    assert_eq!(request.input_shapes, vec![vec![4, 4], vec![4, 4]]);
    assert_eq!(request.input_dtypes, vec!["float32", "float32"]);
    assert_eq!(request.output_dtype, "float32");
    assert_eq!(request.input_names.len(), 2);
    for name in &request.input_names {
        assert!(request.expression.contains(name.as_str()));
    }
}

pub fn benchmark_synchronizes_before_end_clock(harness: &BackendHarness) {
    let recording = harness.recording();
    let runtime: Arc<dyn Runtime> = recording.clone();
    let registry = harness.registry();
    let mut rng = StdRng::seed_from_u64(17);
    let (graph, _, _, _) = relu_add_graph(Arc::clone(&runtime), &[4, 4], &mut rng);
    let op = graph.operator(only_op(&graph)).unwrap();
    let kernel = registry
        .lookup(runtime.device(), OpKind::MemBound, DType::Float32)
        .unwrap();
    let ctx = KernelContext::new(&graph, op, runtime.as_ref());

    recording.clear_events();
    kernel
        .tune(&ctx, &TuneConfig::default().with_rounds(2, 3))
        .unwrap();
    let events = recording.events();

    let launches = events
        .iter()
        .filter(|e| matches!(e, RuntimeEvent::Launch(_)))
        .count();
    assert_eq!(launches, 5);
    let last_launch = events
        .iter()
        .rposition(|e| matches!(e, RuntimeEvent::Launch(_)))
        .unwrap();
    let last_clock = events
        .iter()
        .rposition(|e| matches!(e, RuntimeEvent::Clock))
        .unwrap();
    assert!(last_launch < last_clock);
    assert!(
        events[last_launch..last_clock].contains(&RuntimeEvent::Synchronize),
        "no synchronize between the last launch and the end clock: {events:?}"
    );

    let compile = events
        .iter()
        .find_map(|e| match e {
            RuntimeEvent::Compile(flags) => Some(flags.clone()),
            _ => None,
        })
        .expect("tuning compiles the synthesized source");
    assert!(compile.contains("--fmad=false"), "{compile}");
    assert!(compile.contains(&runtime.target_arch()), "{compile}");

    let loaded = events
        .iter()
        .find_map(|e| match e {
            RuntimeEvent::LoadModule(id) => Some(*id),
            _ => None,
        })
        .expect("tuning loads the compiled module");
    assert_eq!(events.last(), Some(&RuntimeEvent::UnloadModule(loaded)));
}

pub fn module_released_after_failed_launch(harness: &BackendHarness) {
    let recording = harness.recording();
    let runtime: Arc<dyn Runtime> = recording.clone();
    let registry = harness.registry();
    let mut rng = StdRng::seed_from_u64(19);
    let (graph, _, _, _) = relu_add_graph(Arc::clone(&runtime), &[4, 4], &mut rng);
    let executor = Executor::new(Arc::clone(&runtime), &registry);

    recording.clear_events();
    recording.set_fail_launches(true);
    let err = executor.run(&graph).unwrap_err();
    assert!(matches!(err, Error::DeviceLaunch(_)), "{err:?}");
    assert_eq!(recording.count(|e| matches!(e, RuntimeEvent::LaunchRejected)), 1);
    assert_eq!(recording.count(|e| matches!(e, RuntimeEvent::LoadModule(_))), 1);
    assert_eq!(recording.count(|e| matches!(e, RuntimeEvent::UnloadModule(_))), 1);
    assert!(executor.record(only_op(&graph)).is_none());

    recording.set_fail_launches(false);
    executor.run(&graph).unwrap();
    assert!(executor.record(only_op(&graph)).is_some());
    assert_eq!(
        recording.count(|e| matches!(e, RuntimeEvent::LoadModule(_))),
        recording.count(|e| matches!(e, RuntimeEvent::UnloadModule(_)))
    );
}

pub fn compile_failure_reports_log(harness: &BackendHarness) {
    let recording = harness.recording();
    let runtime: Arc<dyn Runtime> = recording.clone();
    let registry = harness.registry_with_synthesizer(Arc::new(BrokenSynthesizer));
    let mut rng = StdRng::seed_from_u64(23);
    let (graph, _, _, _) = relu_add_graph(Arc::clone(&runtime), &[4, 4], &mut rng);
    let executor = Executor::new(Arc::clone(&runtime), &registry);

    recording.clear_events();
    match executor.run(&graph) {
        Err(Error::Compile { file, log, .. }) => {
            assert!(file.starts_with("mem_bound_"), "{file}");
            assert!(
                file.ends_with(&format!(".{}", harness.synth_target.file_extension())),
                "{file}"
            );
            assert!(!log.trim().is_empty(), "compile log is empty");
        }
        other => panic!("expected a compile error, got {other:?}"),
    }
    assert_eq!(recording.count(|e| matches!(e, RuntimeEvent::LoadModule(_))), 0);
    assert_eq!(recording.count(|e| matches!(e, RuntimeEvent::Launch(_))), 0);
    assert!(executor.records().is_empty());
}

pub fn compiler_error_keeps_log(harness: &BackendHarness) {
    let recording = harness.recording();
    let runtime: Arc<dyn Runtime> = recording.clone();
    let registry = harness.registry();
    let mut rng = StdRng::seed_from_u64(29);
    let (graph, _, _, _) = relu_add_graph(Arc::clone(&runtime), &[4, 4], &mut rng);
    let executor = Executor::new(Arc::clone(&runtime), &registry);

    recording.set_fail_compiles(true);
    match executor.run(&graph) {
        Err(Error::Compile { file, message, log }) => {
            assert!(file.starts_with("mem_bound_"), "{file}");
            assert!(message.contains(INJECTED_COMPILER_FAULT), "{message}");
            assert!(log.contains(INJECTED_COMPILER_FAULT), "{log}");
        }
        other => panic!("expected a compile error, got {other:?}"),
    }
    assert_eq!(recording.count(|e| matches!(e, RuntimeEvent::LoadModule(_))), 0);
    assert!(executor.records().is_empty());

    recording.set_fail_compiles(false);
    executor.run(&graph).expect("run after compiler recovers");
    assert_eq!(executor.records().len(), 1);
}

pub fn unsupported_lookup_touches_no_device(harness: &BackendHarness) {
    let recording = harness.recording();
    let runtime: Arc<dyn Runtime> = recording.clone();
    let registry = harness.registry();
    let device = runtime.device();
    assert!(!registry.contains(&KernelKey::new(device, OpKind::Add, DType::Int32)));

    let mut graph = Graph::new();
    let a = graph.add_tensor([4], DType::Int32).unwrap();
    let b = graph.add_tensor([4], DType::Int32).unwrap();
    graph.add(a, b, None).unwrap();
    graph.data_malloc(Arc::clone(&runtime)).unwrap();

    recording.clear_events();
    match Executor::new(Arc::clone(&runtime), &registry).run(&graph) {
        Err(Error::UnsupportedOperation { device: d, op, dtype }) => {
            assert_eq!(d, device);
            assert_eq!(op, OpKind::Add);
            assert_eq!(dtype, DType::Int32);
        }
        other => panic!("expected UnsupportedOperation, got {other:?}"),
    }
    assert!(recording.events().is_empty(), "{:?}", recording.events());
}

pub fn record_rejected_for_other_configuration(harness: &BackendHarness) {
    let registry = harness.registry();
    let kernel = registry
        .lookup(harness.runtime.device(), OpKind::MemBound, DType::Float32)
        .unwrap();
    let mut rng = StdRng::seed_from_u64(29);

    let (small, _, _, _) = relu_add_graph(Arc::clone(&harness.runtime), &[4, 4], &mut rng);
    let small_op = small.operator(only_op(&small)).unwrap();
    let record = kernel
        .tune(
            &KernelContext::new(&small, small_op, harness.runtime.as_ref()),
            &TuneConfig::default(),
        )
        .unwrap();

    let (wide, _, _, _) = relu_add_graph(Arc::clone(&harness.runtime), &[2, 8], &mut rng);
    let wide_op = wide.operator(only_op(&wide)).unwrap();
    let err = kernel
        .compute_with_record(
            &KernelContext::new(&wide, wide_op, harness.runtime.as_ref()),
            &record,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err:?}");

    // Same configuration in another graph: the record applies.
    let (twin, lhs, rhs, out) = relu_add_graph(Arc::clone(&harness.runtime), &[4, 4], &mut rng);
    let twin_op = twin.operator(only_op(&twin)).unwrap();
    kernel
        .compute_with_record(
            &KernelContext::new(&twin, twin_op, harness.runtime.as_ref()),
            &record,
        )
        .unwrap();
    assert_close(&twin.read_f32(out).unwrap(), &relu_add_reference(&lhs, &rhs), 1e-5);
}

pub fn executor_runs_mixed_graph(harness: &BackendHarness) {
    let registry = harness.registry();
    let with_matmul = has_kernel(harness, OpKind::MatMul);
    let mut rng = StdRng::seed_from_u64(31);

    let mut graph = Graph::new();
    let a = graph.add_tensor([3, 4], DType::Float32).unwrap();
    let b = graph.add_tensor([3, 4], DType::Float32).unwrap();
    let c = graph.add_tensor([4], DType::Float32).unwrap();
    let scaled = graph
        .mem_bound(
            &[a, b],
            None,
            FusedExpr::add(
                FusedExpr::mul(FusedExpr::input(0), FusedExpr::input(1)),
                FusedExpr::constant(1.0),
            ),
        )
        .unwrap();
    let rectified = graph
        .mem_bound(
            &[scaled, c],
            None,
            FusedExpr::relu(FusedExpr::sub(FusedExpr::input(0), FusedExpr::input(1))),
        )
        .unwrap();
    let projection = if with_matmul {
        let w = graph.add_tensor([4, 2], DType::Float32).unwrap();
        let out = graph
            .matmul(rectified, w, None, MatMulOptions::default())
            .unwrap();
        Some((w, out))
    } else {
        None
    };
    graph.data_malloc(Arc::clone(&harness.runtime)).unwrap();

    let va = random_vec(&mut rng, 12);
    let vb = random_vec(&mut rng, 12);
    let vc = random_vec(&mut rng, 4);
    graph.write_f32(a, &va).unwrap();
    graph.write_f32(b, &vb).unwrap();
    graph.write_f32(c, &vc).unwrap();
    let vw = random_vec(&mut rng, 8);
    if let Some((w, _)) = projection {
        graph.write_f32(w, &vw).unwrap();
    }

    let executor = Executor::new(Arc::clone(&harness.runtime), &registry);
    assert_eq!(executor.tune_graph(&graph).unwrap(), 2);
    assert_eq!(executor.tune_graph(&graph).unwrap(), 0);
    executor.run(&graph).unwrap();

    let hidden: Vec<f32> = (0..12)
        .map(|i| (va[i] * vb[i] + 1.0 - vc[i % 4]).max(0.0))
        .collect();
    assert_close(&graph.read_f32(rectified).unwrap(), &hidden, 1e-5);

    if let Some((_, out)) = projection {
        let mut expected = vec![0.0f32; 6];
        for row in 0..3 {
            for col in 0..2 {
                expected[row * 2 + col] = (0..4).map(|k| hidden[row * 4 + k] * vw[k * 2 + col]).sum();
            }
        }
        assert_close(&graph.read_f32(out).unwrap(), &expected, 1e-4);
    }
}
