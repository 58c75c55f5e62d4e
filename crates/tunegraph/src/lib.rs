//! Tensor graph runtime with just-in-time kernel autotuning.
//!
//! A [`Graph`](graph::Graph) of tensors and operators is built through the
//! builder functions, bound to device storage, and executed by an
//! [`Executor`](exec::Executor). Every operator is dispatched to a
//! [`Kernel`](kernel::Kernel) looked up in a [`KernelRegistry`](kernel::KernelRegistry)
//! by `(device, op kind, dtype)`. Fused memory-bound operators are tuned once:
//! their source is synthesized, compiled for the device, benchmarked, and the
//! resulting [`PerfRecord`](kernel::PerfRecord) is reused on every later run.

pub mod env;
pub mod error;
pub mod exec;
pub mod graph;
pub mod hashing;
pub mod kernel;
pub mod runtime;
pub mod synth;

pub use env::TuneConfig;
pub use error::{Error, Result};
pub use exec::Executor;
pub use graph::{DType, FusedExpr, Graph, OpId, OpKind, Shape, TensorId};
pub use kernel::{Kernel, KernelContext, KernelRegistry, PerfRecord};
pub use runtime::{Device, DeviceAddr, LaunchConfig, Runtime};
