use tunegraph::graph::shape::broadcast_offset;
use tunegraph::graph::{BinaryOp, OpAttrs, UnaryOp};
use tunegraph::kernel::{Kernel, KernelContext};
use tunegraph::Result;

use super::{attrs_mismatch, output_dims};

/// Broadcasting binary arithmetic.
pub struct BinaryKernel {
    op: BinaryOp,
}

impl BinaryKernel {
    pub fn new(op: BinaryOp) -> Self {
        Self { op }
    }
}

impl Kernel for BinaryKernel {
    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()> {
        let out = ctx.output()?.shape().clone();
        let lhs_strides = ctx.input(0)?.shape().broadcast_strides(&out)?;
        let rhs_strides = ctx.input(1)?.shape().broadcast_strides(&out)?;
        let lhs = ctx.read_input_f32(0)?;
        let rhs = ctx.read_input_f32(1)?;

        let dims = out.dims();
        let result: Vec<f32> = (0..out.element_count_or_error()?)
            .map(|idx| {
                let a = lhs[broadcast_offset(idx, dims, &lhs_strides)];
                let b = rhs[broadcast_offset(idx, dims, &rhs_strides)];
                self.op.apply(a, b)
            })
            .collect();
        ctx.write_output_f32(&result)
    }
}

pub struct UnaryKernel {
    op: UnaryOp,
}

impl UnaryKernel {
    pub fn new(op: UnaryOp) -> Self {
        Self { op }
    }
}

impl Kernel for UnaryKernel {
    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()> {
        let values = ctx.read_input_f32(0)?;
        let result: Vec<f32> = values.into_iter().map(|x| self.op.apply(x)).collect();
        ctx.write_output_f32(&result)
    }
}

/// Numerically stable softmax over one axis.
pub struct SoftmaxKernel;

impl Kernel for SoftmaxKernel {
    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()> {
        let OpAttrs::Softmax { axis } = *ctx.op().attrs() else {
            return Err(attrs_mismatch(ctx));
        };
        let dims = output_dims(ctx)?;
        let values = ctx.read_input_f32(0)?;
        let len = dims[axis];
        let inner: usize = dims[axis + 1..].iter().product();
        let outer: usize = dims[..axis].iter().product();

        let mut result = vec![0.0f32; values.len()];
        for o in 0..outer {
            for i in 0..inner {
                let at = |k: usize| (o * len + k) * inner + i;
                let max = (0..len)
                    .map(|k| values[at(k)])
                    .fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0f32;
                for k in 0..len {
                    let e = (values[at(k)] - max).exp();
                    result[at(k)] = e;
                    sum += e;
                }
                for k in 0..len {
                    result[at(k)] /= sum;
                }
            }
        }
        ctx.write_output_f32(&result)
    }
}
