use std::sync::Arc;

use tunegraph::kernel::KernelKey;
use tunegraph::synth::{BuiltinSynthesizer, SynthTarget};
use tunegraph::{DType, Device, KernelRegistry, OpKind};
use tunegraph_backend_cuda::{is_available, register_cuda_kernels_with, CudaRuntime};
use tunegraph_backend_tests::BackendHarness;

fn register_builtin(registry: &KernelRegistry) {
    register_cuda_kernels_with(registry, Arc::new(BuiltinSynthesizer::new()));
}

fn backend_or_skip() -> Option<BackendHarness> {
    if !is_available() {
        eprintln!("skipping cuda backend test: CUDA runtime unavailable");
        return None;
    }
    match CudaRuntime::new() {
        Ok(runtime) => Some(BackendHarness::new(
            Arc::new(runtime),
            register_builtin,
            SynthTarget::Cuda,
        )),
        Err(err) => {
            eprintln!("skipping cuda backend test: {err}");
            None
        }
    }
}

tunegraph_backend_tests::define_backend_tests!(cuda_backend, backend_or_skip);

#[test]
fn registration_does_not_touch_the_device() {
    let registry = KernelRegistry::new();
    register_builtin(&registry);
    assert_eq!(
        registry.keys(),
        vec![KernelKey::new(Device::Cuda, OpKind::MemBound, DType::Float32)]
    );
    assert_eq!(
        registry
            .kernel_name(&KernelKey::new(Device::Cuda, OpKind::MemBound, DType::Float32))
            .as_deref(),
        Some("MemBound_Jit_Cuda")
    );
}
