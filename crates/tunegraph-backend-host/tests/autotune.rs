use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tunegraph::graph::{BatchNormOptions, MatMulOptions, PoolWindow};
use tunegraph::kernel::{registry, KernelKey};
use tunegraph::synth::SynthTarget;
use tunegraph::{
    DType, Device, Executor, FusedExpr, Graph, OpKind, Runtime, TensorId, TuneConfig,
};
use tunegraph_backend_host::{register_host_kernels, HostRuntime};
use tunegraph_backend_tests::{assert_close, BackendHarness};

fn harness() -> BackendHarness {
    BackendHarness::new(
        Arc::new(HostRuntime::new()),
        register_host_kernels,
        SynthTarget::HostIr,
    )
}

fn scratch_dir(tag: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("tunegraph_host_{tag}_{}_{stamp}", std::process::id()))
}

fn fused_graph(runtime: Arc<dyn Runtime>, rng: &mut StdRng) -> (Graph, TensorId, Vec<f32>) {
    let mut graph = Graph::new();
    let x = graph.add_tensor([2, 8], DType::Float32).unwrap();
    let y = graph.add_tensor([8], DType::Float32).unwrap();
    let expr = FusedExpr::mul(
        FusedExpr::relu(FusedExpr::input(0)),
        FusedExpr::add(FusedExpr::input(1), FusedExpr::constant(0.5)),
    );
    let out = graph.mem_bound(&[x, y], None, expr).unwrap();
    graph.data_malloc(runtime).unwrap();

    let vx: Vec<f32> = (0..16).map(|_| rng.gen_range(-2.0f32..2.0)).collect();
    let vy: Vec<f32> = (0..8).map(|_| rng.gen_range(-2.0f32..2.0)).collect();
    graph.write_f32(x, &vx).unwrap();
    graph.write_f32(y, &vy).unwrap();
    let expected = (0..16)
        .map(|i| vx[i].max(0.0) * (vy[i % 8] + 0.5))
        .collect();
    (graph, out, expected)
}

#[test]
fn global_registry_collects_host_kernels() {
    let global = registry::global();
    for op in [OpKind::Add, OpKind::MatMul, OpKind::Softmax, OpKind::MemBound] {
        assert!(
            global.contains(&KernelKey::new(Device::Host, op, DType::Float32)),
            "host {op} missing from the global registry"
        );
    }
    assert!(global.contains(&KernelKey::new(Device::Host, OpKind::Gather, DType::Int64)));
    assert_eq!(
        global
            .kernel_name(&KernelKey::new(Device::Host, OpKind::MemBound, DType::Float32))
            .as_deref(),
        Some("MemBound_Jit_Host")
    );
    let err = global
        .lookup(Device::Host, OpKind::MemBound, DType::Int32)
        .err()
        .expect("MemBound is float32 only");
    assert!(matches!(err, tunegraph::Error::UnsupportedOperation { .. }));
}

#[test]
fn persistent_cache_skips_synthesis_in_a_fresh_executor() {
    let harness = harness();
    let dir = scratch_dir("record_cache");
    let config = TuneConfig::default().with_record_cache_dir(&dir);
    let mut rng = StdRng::seed_from_u64(101);

    let (registry, synth) = harness.counting_registry();
    let (graph, out, expected) = fused_graph(Arc::clone(&harness.runtime), &mut rng);
    Executor::with_config(Arc::clone(&harness.runtime), &registry, config.clone())
        .run(&graph)
        .unwrap();
    assert_eq!(synth.calls(), 1);
    assert_close(&graph.read_f32(out).unwrap(), &expected, 1e-5);
    let stored: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
    assert_eq!(stored.len(), 1);

    // Same configuration, new graph and tensor identities.
    let (again, again_out, again_expected) = fused_graph(Arc::clone(&harness.runtime), &mut rng);
    let executor = Executor::with_config(Arc::clone(&harness.runtime), &registry, config);
    executor.run(&again).unwrap();
    assert_eq!(synth.calls(), 1, "disk record must be reused");
    assert_close(&again.read_f32(again_out).unwrap(), &again_expected, 1e-5);
    assert_eq!(executor.records().len(), 1);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn in_process_cache_is_per_executor() {
    let harness = harness();
    let (registry, synth) = harness.counting_registry();
    let mut rng = StdRng::seed_from_u64(103);
    let (graph, _, _) = fused_graph(Arc::clone(&harness.runtime), &mut rng);

    let first = Executor::new(Arc::clone(&harness.runtime), &registry);
    first.run(&graph).unwrap();
    first.run(&graph).unwrap();
    assert_eq!(synth.calls(), 1);

    first.clear_records();
    first.run(&graph).unwrap();
    assert_eq!(synth.calls(), 2);

    Executor::new(Arc::clone(&harness.runtime), &registry)
        .run(&graph)
        .unwrap();
    assert_eq!(synth.calls(), 3);
}

#[test]
fn vision_block_runs_end_to_end() {
    let runtime: Arc<dyn Runtime> = Arc::new(HostRuntime::new());
    let registry = tunegraph::KernelRegistry::new();
    register_host_kernels(&registry);

    let mut graph = Graph::new();
    let image = graph.add_tensor([1, 2, 4, 4], DType::Float32).unwrap();
    let mean = graph.add_tensor([2], DType::Float32).unwrap();
    let var = graph.add_tensor([2], DType::Float32).unwrap();
    let scale = graph.add_tensor([2], DType::Float32).unwrap();
    let shift = graph.add_tensor([2], DType::Float32).unwrap();
    let normed = graph
        .batch_norm(image, None, mean, var, scale, shift, BatchNormOptions::default())
        .unwrap();
    let fused = graph
        .mem_bound(&[normed], None, FusedExpr::relu(FusedExpr::input(0)))
        .unwrap();
    let pooled = graph
        .max_pool(fused, None, PoolWindow::new(2, 2).with_stride(2, 2))
        .unwrap();
    let flat = graph.flatten(pooled, None).unwrap();
    let weights = graph.add_tensor([8, 3], DType::Float32).unwrap();
    let logits = graph
        .matmul(flat, weights, None, MatMulOptions::default())
        .unwrap();
    let probs = graph.softmax(logits, None).unwrap();
    graph.data_malloc(Arc::clone(&runtime)).unwrap();

    let pixels: Vec<f32> = (0..32).map(|i| i as f32 - 16.0).collect();
    graph.write_f32(image, &pixels).unwrap();
    graph.write_f32(mean, &[0.0, 0.0]).unwrap();
    graph.write_f32(var, &[1.0, 1.0]).unwrap();
    graph.write_f32(scale, &[1.0, 1.0]).unwrap();
    graph.write_f32(shift, &[0.0, 0.0]).unwrap();
    let mut w = vec![0.0f32; 24];
    for row in 0..8 {
        w[row * 3 + row % 3] = 0.1;
    }
    graph.write_f32(weights, &w).unwrap();

    Executor::new(Arc::clone(&runtime), &registry)
        .run(&graph)
        .unwrap();

    assert_eq!(graph.tensor(flat).unwrap().shape().dims(), &[1, 8]);
    // Channel 0 is all negative and vanishes under relu; channel 1 holds 0..16.
    let eps = BatchNormOptions::default().eps;
    let norm = 1.0 / (1.0 + eps).sqrt();
    let pooled_expected: Vec<f32> = [0.0, 0.0, 0.0, 0.0, 5.0, 7.0, 13.0, 15.0]
        .iter()
        .map(|v| v * norm)
        .collect();
    assert_close(&graph.read_f32(pooled).unwrap(), &pooled_expected, 1e-5);

    let mut logit_expected = [0.0f32; 3];
    for (row, value) in pooled_expected.iter().enumerate() {
        logit_expected[row % 3] += value * 0.1;
    }
    let max = logit_expected.iter().cloned().fold(f32::MIN, f32::max);
    let exps: Vec<f32> = logit_expected.iter().map(|v| (v - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    let probs_expected: Vec<f32> = exps.iter().map(|v| v / total).collect();
    assert_close(&graph.read_f32(probs).unwrap(), &probs_expected, 1e-5);
}

#[test]
fn modules_and_buffers_are_released() {
    let host = Arc::new(HostRuntime::new());
    let runtime: Arc<dyn Runtime> = host.clone();
    let registry = tunegraph::KernelRegistry::new();
    register_host_kernels(&registry);
    let mut rng = StdRng::seed_from_u64(107);
    {
        let (graph, out, expected) = fused_graph(Arc::clone(&runtime), &mut rng);
        let executor = Executor::new(Arc::clone(&runtime), &registry);
        executor.run(&graph).unwrap();
        executor.run(&graph).unwrap();
        assert_eq!(host.loaded_modules(), 0);
        assert_eq!(host.launches(), 3);
        assert_close(&graph.read_f32(out).unwrap(), &expected, 1e-5);
        assert_eq!(host.pending_launches(), 0);
        assert_eq!(host.live_allocations(), 3);
    }
    assert_eq!(host.live_allocations(), 0);
}
