use tunegraph::graph::shape::broadcast_offset;
use tunegraph::graph::OpAttrs;
use tunegraph::kernel::{Kernel, KernelContext};
use tunegraph::{Result, Shape};

use super::{attrs_mismatch, output_dims, shape_dims};

/// Batched matmul with optional transposes, broadcast bias, and a fused
/// activation: `act(op(A) x op(B) + bias)`.
pub struct MatMulKernel;

struct Operand {
    values: Vec<f32>,
    rows: usize,
    cols: usize,
    transposed: bool,
    /// Element stride between consecutive batch matrices, per output batch axis.
    batch_strides: Vec<usize>,
}

impl Operand {
    fn load(
        ctx: &KernelContext<'_>,
        index: usize,
        transposed: bool,
        out_batch: &Shape,
    ) -> Result<Self> {
        let dims = shape_dims(ctx, index)?;
        let (batch, matrix) = dims.split_at(dims.len() - 2);
        let (rows, cols) = (matrix[0], matrix[1]);
        let batch_strides = Shape::new(batch)
            .broadcast_strides(out_batch)?
            .into_iter()
            .map(|stride| stride * rows * cols)
            .collect();
        Ok(Self {
            values: ctx.read_input_f32(index)?,
            rows,
            cols,
            transposed,
            batch_strides,
        })
    }

    /// Element `(r, c)` of `op(X)` in batch `base`.
    fn at(&self, base: usize, r: usize, c: usize) -> f32 {
        if self.transposed {
            self.values[base + c * self.cols + r]
        } else {
            self.values[base + r * self.cols + c]
        }
    }

    fn inner(&self) -> usize {
        if self.transposed {
            self.rows
        } else {
            self.cols
        }
    }
}

impl Kernel for MatMulKernel {
    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()> {
        let OpAttrs::MatMul {
            trans_a,
            trans_b,
            has_bias,
            act,
        } = *ctx.op().attrs()
        else {
            return Err(attrs_mismatch(ctx));
        };
        let out_dims = output_dims(ctx)?;
        let (batch_dims, mn) = out_dims.split_at(out_dims.len() - 2);
        let (m, n) = (mn[0], mn[1]);
        let out_batch = Shape::new(batch_dims);

        let a = Operand::load(ctx, 0, trans_a, &out_batch)?;
        let b = Operand::load(ctx, 1, trans_b, &out_batch)?;
        let k = a.inner();
        let bias = if has_bias {
            let strides = ctx.input(2)?.shape().broadcast_strides(ctx.output()?.shape())?;
            Some((ctx.read_input_f32(2)?, strides))
        } else {
            None
        };

        let batches = out_batch.element_count_or_error()?;
        let mut result = vec![0.0f32; batches * m * n];
        for batch in 0..batches {
            let a_base = broadcast_offset(batch, batch_dims, &a.batch_strides);
            let b_base = broadcast_offset(batch, batch_dims, &b.batch_strides);
            for i in 0..m {
                for j in 0..n {
                    let mut acc = 0.0f32;
                    for p in 0..k {
                        acc += a.at(a_base, i, p) * b.at(b_base, p, j);
                    }
                    let idx = (batch * m + i) * n + j;
                    if let Some((values, strides)) = &bias {
                        acc += values[broadcast_offset(idx, &out_dims, strides)];
                    }
                    result[idx] = act.apply(acc);
                }
            }
        }
        ctx.write_output_f32(&result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tunegraph::graph::{Activation, MatMulOptions};
    use tunegraph::{DType, Executor, Graph, KernelRegistry};

    use crate::{register_host_kernels, HostRuntime};

    #[test]
    fn transposed_batched_matmul_with_bias_and_relu() {
        let runtime = Arc::new(HostRuntime::new());
        let registry = KernelRegistry::new();
        register_host_kernels(&registry);

        let mut graph = Graph::new();
        // A is stored as [K, M] = [2, 2] and used transposed.
        let a = graph.add_tensor([2, 2], DType::Float32).unwrap();
        let b = graph.add_tensor([2, 2, 2], DType::Float32).unwrap();
        let bias = graph.add_tensor([2], DType::Float32).unwrap();
        let options = MatMulOptions {
            trans_a: true,
            trans_b: false,
            bias: Some(bias),
            act: Activation::Relu,
        };
        let out = graph.matmul(a, b, None, options).unwrap();
        graph.data_malloc(runtime.clone()).unwrap();
        graph.write_f32(a, &[1.0, 3.0, 2.0, 4.0]).unwrap();
        graph
            .write_f32(b, &[5.0, 6.0, 7.0, 8.0, -1.0, 0.0, 0.0, -1.0])
            .unwrap();
        graph.write_f32(bias, &[0.5, -100.0]).unwrap();

        Executor::new(runtime, &registry).run(&graph).unwrap();
        // op(A) = [[1, 2], [3, 4]].
        assert_eq!(
            graph.read_f32(out).unwrap(),
            vec![19.5, 0.0, 43.5, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
    }
}
