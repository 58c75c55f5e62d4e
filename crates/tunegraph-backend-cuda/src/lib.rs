//! CUDA device for tunegraph.
//!
//! The driver API and NVRTC are loaded dynamically on first use, so the crate
//! builds and links on machines without CUDA; [`is_available`] reports whether
//! a device context can be created. Only MemBound operators have a CUDA
//! kernel; they are synthesized as CUDA C, compiled to PTX by NVRTC and tuned
//! on the device.

mod driver;
mod nvrtc;
mod runtime;

use std::sync::Arc;

use tunegraph::env::{self, SynthMode};
use tunegraph::kernel::registry::KERNEL_REGISTRARS;
use tunegraph::kernel::{KernelKey, MemBoundKernel};
use tunegraph::synth::{BuiltinSynthesizer, ProcessSynthesizer, SynthTarget, Synthesizer};
use tunegraph::{DType, Device, KernelRegistry, OpKind};

pub use nvrtc::NvrtcCompiler;
pub use runtime::CudaRuntime;

/// True when both the driver and NVRTC load and a context can be created.
pub fn is_available() -> bool {
    driver::is_available() && nvrtc::is_available()
}

/// Registers the CUDA MemBound kernel with the synthesizer selected by
/// `TUNEGRAPH_CUDA_SYNTH` (the external tool unless set to `builtin`).
pub fn register_cuda_kernels(registry: &KernelRegistry) {
    let synthesizer: Arc<dyn Synthesizer> = match env::cuda_synth_mode() {
        SynthMode::External => Arc::new(ProcessSynthesizer::from_env()),
        SynthMode::Builtin => Arc::new(BuiltinSynthesizer::new()),
    };
    register_cuda_kernels_with(registry, synthesizer);
}

pub fn register_cuda_kernels_with(registry: &KernelRegistry, synthesizer: Arc<dyn Synthesizer>) {
    registry.register(
        KernelKey::new(Device::Cuda, OpKind::MemBound, DType::Float32),
        "MemBound_Jit_Cuda",
        Arc::new(MemBoundKernel::new(synthesizer, SynthTarget::Cuda)),
    );
}

#[linkme::distributed_slice(KERNEL_REGISTRARS)]
static REGISTER_CUDA_KERNELS: fn(&KernelRegistry) = register_cuda_kernels;
