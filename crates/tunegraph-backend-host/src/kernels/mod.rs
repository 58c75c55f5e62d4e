//! Fixed host kernels.
//!
//! Every kernel reads its inputs back to host memory through the
//! [`KernelContext`], computes on plain slices, and writes the output. They
//! never require tuning.

mod elementwise;
mod linalg;
mod nn;
mod shape;

use std::sync::Arc;

use tunegraph::graph::{BinaryOp, OpKind, UnaryOp};
use tunegraph::kernel::{KernelContext, KernelKey, KernelRegistry, MemBoundKernel};
use tunegraph::runtime::Device;
use tunegraph::synth::{BuiltinSynthesizer, SynthTarget};
use tunegraph::{DType, Error, Result};

pub use elementwise::{BinaryKernel, SoftmaxKernel, UnaryKernel};
pub use linalg::MatMulKernel;
pub use nn::{BatchNormKernel, PoolKernel, PoolMode, ReduceMeanKernel};
pub use shape::{ConcatKernel, CopyKernel, GatherKernel};

pub(crate) fn attrs_mismatch(ctx: &KernelContext<'_>) -> Error {
    let op = ctx.op();
    Error::config(format!(
        "{} ({}) carries unexpected attributes {:?}",
        op.id(),
        op.kind(),
        op.attrs()
    ))
}

pub(crate) fn shape_dims(ctx: &KernelContext<'_>, index: usize) -> Result<Vec<usize>> {
    Ok(ctx.input(index)?.shape().dims().to_vec())
}

pub(crate) fn output_dims(ctx: &KernelContext<'_>) -> Result<Vec<usize>> {
    Ok(ctx.output()?.shape().dims().to_vec())
}

fn host(op: OpKind, dtype: DType) -> KernelKey {
    KernelKey::new(Device::Host, op, dtype)
}

/// Registers every host kernel, including the JIT MemBound kernel that
/// compiles builtin-synthesized host IR.
pub fn register_host_kernels(registry: &KernelRegistry) {
    let f32 = DType::Float32;
    for (kind, op) in [
        (OpKind::Add, BinaryOp::Add),
        (OpKind::Sub, BinaryOp::Sub),
        (OpKind::Mul, BinaryOp::Mul),
        (OpKind::Div, BinaryOp::Div),
        (OpKind::Pow, BinaryOp::Pow),
    ] {
        registry.register(
            host(kind, f32),
            format!("{kind}_Host"),
            Arc::new(BinaryKernel::new(op)),
        );
    }
    for (kind, op) in [
        (OpKind::Relu, UnaryOp::Relu),
        (OpKind::Sigmoid, UnaryOp::Sigmoid),
        (OpKind::Tanh, UnaryOp::Tanh),
        (OpKind::Abs, UnaryOp::Abs),
    ] {
        registry.register(
            host(kind, f32),
            format!("{kind}_Host"),
            Arc::new(UnaryKernel::new(op)),
        );
    }
    registry.register(host(OpKind::Softmax, f32), "Softmax_Host", Arc::new(SoftmaxKernel));
    registry.register(host(OpKind::MatMul, f32), "MatMul_Host", Arc::new(MatMulKernel));
    registry.register(
        host(OpKind::BatchNorm, f32),
        "BatchNorm_Host",
        Arc::new(BatchNormKernel),
    );
    registry.register(
        host(OpKind::MaxPool, f32),
        "MaxPool_Host",
        Arc::new(PoolKernel::new(PoolMode::Max)),
    );
    registry.register(
        host(OpKind::AvgPool, f32),
        "AvgPool_Host",
        Arc::new(PoolKernel::new(PoolMode::Avg)),
    );
    registry.register(
        host(OpKind::ReduceMean, f32),
        "ReduceMean_Host",
        Arc::new(ReduceMeanKernel),
    );

    for dtype in DType::ALL {
        for kind in [OpKind::Identity, OpKind::Flatten, OpKind::Reshape] {
            registry.register(host(kind, dtype), format!("{kind}_Host"), Arc::new(CopyKernel));
        }
        registry.register(host(OpKind::Concat, dtype), "Concat_Host", Arc::new(ConcatKernel));
        registry.register(host(OpKind::Gather, dtype), "Gather_Host", Arc::new(GatherKernel));
    }

    registry.register(
        host(OpKind::MemBound, f32),
        "MemBound_Jit_Host",
        Arc::new(MemBoundKernel::new(
            Arc::new(BuiltinSynthesizer::new()),
            SynthTarget::HostIr,
        )),
    );
}
