use tunegraph::graph::OpAttrs;
use tunegraph::kernel::{Kernel, KernelContext};
use tunegraph::Result;

use super::{attrs_mismatch, output_dims, shape_dims};

/// Inference-mode batch normalization over axis 1:
/// `scale * (x - mean) / sqrt(var + eps) + bias`.
pub struct BatchNormKernel;

impl Kernel for BatchNormKernel {
    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()> {
        let OpAttrs::BatchNorm { eps, .. } = *ctx.op().attrs() else {
            return Err(attrs_mismatch(ctx));
        };
        let dims = shape_dims(ctx, 0)?;
        let x = ctx.read_input_f32(0)?;
        let mean = ctx.read_input_f32(1)?;
        let var = ctx.read_input_f32(2)?;
        let scale = ctx.read_input_f32(3)?;
        let bias = ctx.read_input_f32(4)?;

        let channels = dims[1];
        let inner: usize = dims[2..].iter().product();
        let result: Vec<f32> = x
            .iter()
            .enumerate()
            .map(|(idx, &value)| {
                let c = (idx / inner.max(1)) % channels;
                scale[c] * (value - mean[c]) / (var[c] + eps).sqrt() + bias[c]
            })
            .collect();
        ctx.write_output_f32(&result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    /// Averages over the in-bounds taps only; padding does not count.
    Avg,
}

/// NCHW pooling with stride, padding and dilation.
pub struct PoolKernel {
    mode: PoolMode,
}

impl PoolKernel {
    pub fn new(mode: PoolMode) -> Self {
        Self { mode }
    }
}

impl Kernel for PoolKernel {
    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()> {
        let OpAttrs::Pool(window) = *ctx.op().attrs() else {
            return Err(attrs_mismatch(ctx));
        };
        let in_dims = shape_dims(ctx, 0)?;
        let out_dims = output_dims(ctx)?;
        let x = ctx.read_input_f32(0)?;
        let (h_in, w_in) = (in_dims[2] as isize, in_dims[3] as isize);
        let (h_out, w_out) = (out_dims[2], out_dims[3]);
        let planes = out_dims[0] * out_dims[1];

        let mut result = Vec::with_capacity(planes * h_out * w_out);
        for plane in 0..planes {
            let base = plane * in_dims[2] * in_dims[3];
            for oh in 0..h_out {
                let start_h = (oh * window.stride.0) as isize - window.padding.0 as isize;
                for ow in 0..w_out {
                    let start_w = (ow * window.stride.1) as isize - window.padding.1 as isize;
                    let mut max = f32::NEG_INFINITY;
                    let mut sum = 0.0f32;
                    let mut taps = 0usize;
                    for kh in 0..window.kernel.0 {
                        let h = start_h + (kh * window.dilation.0) as isize;
                        if h < 0 || h >= h_in {
                            continue;
                        }
                        for kw in 0..window.kernel.1 {
                            let w = start_w + (kw * window.dilation.1) as isize;
                            if w < 0 || w >= w_in {
                                continue;
                            }
                            let v = x[base + h as usize * in_dims[3] + w as usize];
                            max = max.max(v);
                            sum += v;
                            taps += 1;
                        }
                    }
                    result.push(match self.mode {
                        PoolMode::Max => max,
                        PoolMode::Avg if taps == 0 => 0.0,
                        PoolMode::Avg => sum / taps as f32,
                    });
                }
            }
        }
        ctx.write_output_f32(&result)
    }
}

pub struct ReduceMeanKernel;

impl Kernel for ReduceMeanKernel {
    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()> {
        let OpAttrs::ReduceMean { ref axes, .. } = *ctx.op().attrs() else {
            return Err(attrs_mismatch(ctx));
        };
        let dims = shape_dims(ctx, 0)?;
        let x = ctx.read_input_f32(0)?;

        // Output position of an input element: drop (or zero) reduced axes.
        let kept: Vec<usize> = (0..dims.len()).filter(|axis| !axes.contains(axis)).collect();
        let mut kept_strides = vec![0usize; dims.len()];
        let mut acc = 1usize;
        for &axis in kept.iter().rev() {
            kept_strides[axis] = acc;
            acc *= dims[axis];
        }
        let out_len = acc;
        let reduced: usize = axes.iter().map(|&axis| dims[axis]).product();

        let mut sums = vec![0.0f32; out_len];
        let mut coord = vec![0usize; dims.len()];
        for &value in &x {
            let out_idx: usize = coord.iter().zip(&kept_strides).map(|(c, s)| c * s).sum();
            sums[out_idx] += value;
            for axis in (0..dims.len()).rev() {
                coord[axis] += 1;
                if coord[axis] < dims[axis] {
                    break;
                }
                coord[axis] = 0;
            }
        }
        let count = reduced.max(1) as f32;
        let result: Vec<f32> = sums.into_iter().map(|sum| sum / count).collect();
        ctx.write_output_f32(&result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tunegraph::graph::{BatchNormOptions, PoolWindow};
    use tunegraph::{DType, Executor, Graph, KernelRegistry};

    use crate::{register_host_kernels, HostRuntime};

    fn setup() -> (Arc<HostRuntime>, KernelRegistry) {
        let registry = KernelRegistry::new();
        register_host_kernels(&registry);
        (Arc::new(HostRuntime::new()), registry)
    }

    #[test]
    fn avg_pool_ignores_padding_and_max_pool_takes_window_max() {
        let (runtime, registry) = setup();
        let mut graph = Graph::new();
        let x = graph.add_tensor([1, 1, 2, 2], DType::Float32).unwrap();
        let window = PoolWindow::new(2, 2).with_stride(1, 1).with_padding(1, 1);
        let avg = graph.avg_pool(x, None, window).unwrap();
        let max = graph.max_pool(x, None, window).unwrap();
        graph.data_malloc(runtime.clone()).unwrap();
        graph.write_f32(x, &[1.0, 2.0, 3.0, 4.0]).unwrap();

        Executor::new(runtime, &registry).run(&graph).unwrap();
        assert_eq!(
            graph.read_f32(avg).unwrap(),
            vec![1.0, 1.5, 2.0, 2.0, 2.5, 3.0, 3.0, 3.5, 4.0]
        );
        assert_eq!(
            graph.read_f32(max).unwrap(),
            vec![1.0, 2.0, 2.0, 3.0, 4.0, 4.0, 3.0, 4.0, 4.0]
        );
    }

    #[test]
    fn batch_norm_normalizes_per_channel() {
        let (runtime, registry) = setup();
        let mut graph = Graph::new();
        let x = graph.add_tensor([1, 2, 2], DType::Float32).unwrap();
        let params: Vec<_> = (0..4)
            .map(|_| graph.add_tensor([2], DType::Float32).unwrap())
            .collect();
        let options = BatchNormOptions {
            eps: 0.0,
            ..BatchNormOptions::default()
        };
        let y = graph
            .batch_norm(x, None, params[0], params[1], params[2], params[3], options)
            .unwrap();
        graph.data_malloc(runtime.clone()).unwrap();
        graph.write_f32(x, &[1.0, 3.0, 10.0, 20.0]).unwrap();
        graph.write_f32(params[0], &[2.0, 10.0]).unwrap();
        graph.write_f32(params[1], &[1.0, 4.0]).unwrap();
        graph.write_f32(params[2], &[1.0, 0.5]).unwrap();
        graph.write_f32(params[3], &[0.0, 1.0]).unwrap();

        Executor::new(runtime, &registry).run(&graph).unwrap();
        assert_eq!(graph.read_f32(y).unwrap(), vec![-1.0, 1.0, 1.0, 3.5]);
    }

    #[test]
    fn reduce_mean_over_selected_axes() {
        let (runtime, registry) = setup();
        let mut graph = Graph::new();
        let x = graph.add_tensor([2, 3], DType::Float32).unwrap();
        let rows = graph.reduce_mean(x, None, Some(&[1]), false).unwrap();
        let all = graph.reduce_mean(x, None, None, true).unwrap();
        graph.data_malloc(runtime.clone()).unwrap();
        graph.write_f32(x, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

        Executor::new(runtime, &registry).run(&graph).unwrap();
        assert_eq!(graph.read_f32(rows).unwrap(), vec![2.0, 5.0]);
        assert_eq!(graph.read_f32(all).unwrap(), vec![3.5]);
    }
}
