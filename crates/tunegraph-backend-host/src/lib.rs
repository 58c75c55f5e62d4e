//! Reference host device for tunegraph.
//!
//! [`HostRuntime`] keeps tensors in host memory and executes launches on an
//! ordered, deferred stream. Its compiler accepts the host kernel assembly the
//! builtin synthesizer emits for [`SynthTarget::HostIr`](tunegraph::synth::SynthTarget),
//! so the full synthesize/compile/load/benchmark pipeline runs without a GPU.

mod compiler;
mod interp;
pub mod kernels;
mod memory;
mod runtime;

use tunegraph::kernel::registry::KERNEL_REGISTRARS;
use tunegraph::KernelRegistry;

pub use compiler::{HostCompiler, HostKernelProgram, HostModule, Instr, HOST_ARCH};
pub use kernels::register_host_kernels;
pub use runtime::HostRuntime;

#[linkme::distributed_slice(KERNEL_REGISTRARS)]
static REGISTER_HOST_KERNELS: fn(&KernelRegistry) = register_host_kernels;
