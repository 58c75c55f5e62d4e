use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use tunegraph::kernel::{KernelKey, MemBoundKernel};
use tunegraph::synth::{ProcessSynthesizer, SynthTarget, SynthesisRequest, Synthesizer};
use tunegraph::{DType, Device, Error, Executor, FusedExpr, Graph, KernelRegistry, OpKind};
use tunegraph_backend_host::{register_host_kernels, HostRuntime};

fn tool_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tunesynth"))
        .parent()
        .expect("binary has a parent directory")
        .to_path_buf()
}

fn request(target: SynthTarget) -> SynthesisRequest {
    SynthesisRequest {
        input_shapes: vec![vec![4, 4], vec![4]],
        input_dtypes: vec!["float32".into(), "float32".into()],
        output_shape: vec![4, 4],
        output_dtype: "float32".into(),
        expression: "relu(var_1 + var_2)".into(),
        func_name: "mem_bound_7".into(),
        input_names: vec!["var_1".into(), "var_2".into()],
        output_name: "var_3".into(),
        target,
    }
}

#[test]
fn version_command_reports_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_tunesynth"))
        .arg("version")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("tunesynth {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn unknown_command_fails() {
    let output = Command::new(env!("CARGO_BIN_EXE_tunesynth"))
        .arg("frobnicate")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown command"));
}

#[test]
fn cuda_source_names_the_entry_point() {
    let synth = ProcessSynthesizer::new("tunesynth", vec![tool_dir()]);
    let response = synth.synthesize(&request(SynthTarget::Cuda)).unwrap();
    assert!(response.source.contains("extern \"C\" __global__"));
    assert!(response.source.contains("mem_bound_7_kernel0"));
    assert!(response.launch.iter().all(|&v| v > 0));
    let threads: u32 = response.launch[0] * response.launch[3];
    assert!(threads >= 16);
}

#[test]
fn malformed_expression_is_a_synthesis_error() {
    let synth = ProcessSynthesizer::new("tunesynth", vec![tool_dir()]);
    let mut bad = request(SynthTarget::Cuda);
    bad.expression = "var_1 +".into();
    match synth.synthesize(&bad) {
        Err(Error::Synthesis(message)) => assert!(message.contains("mem_bound_7"), "{message}"),
        other => panic!("expected a synthesis error, got {other:?}"),
    }
}

#[test]
fn host_pipeline_runs_with_the_external_tool() {
    let runtime = Arc::new(HostRuntime::new());
    let registry = KernelRegistry::new();
    register_host_kernels(&registry);
    registry.register(
        KernelKey::new(Device::Host, OpKind::MemBound, DType::Float32),
        "MemBound_Jit_Host_External",
        Arc::new(MemBoundKernel::new(
            Arc::new(ProcessSynthesizer::new("tunesynth", vec![tool_dir()])),
            SynthTarget::HostIr,
        )),
    );

    let mut graph = Graph::new();
    let a = graph.add_tensor([4, 4], DType::Float32).unwrap();
    let b = graph.add_tensor([4], DType::Float32).unwrap();
    let expr = FusedExpr::relu(FusedExpr::add(FusedExpr::input(0), FusedExpr::input(1)));
    let out = graph.mem_bound(&[a, b], None, expr).unwrap();
    graph.data_malloc(runtime.clone()).unwrap();
    let lhs: Vec<f32> = (0..16).map(|i| i as f32 - 8.0).collect();
    let rhs = [0.5f32, -0.5, 1.0, -1.0];
    graph.write_f32(a, &lhs).unwrap();
    graph.write_f32(b, &rhs).unwrap();

    Executor::new(runtime, &registry).run(&graph).unwrap();
    let expected: Vec<f32> = (0..16).map(|i| (lhs[i] + rhs[i % 4]).max(0.0)).collect();
    assert_eq!(graph.read_f32(out).unwrap(), expected);
}
