//! Layout kernels. They move raw elements and work for every dtype.

use tunegraph::graph::OpAttrs;
use tunegraph::kernel::{Kernel, KernelContext};
use tunegraph::runtime::bytes;
use tunegraph::{Error, Result};

use super::{attrs_mismatch, shape_dims};

/// Identity, Flatten and Reshape: the contiguous bytes are unchanged.
pub struct CopyKernel;

impl Kernel for CopyKernel {
    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()> {
        let data = ctx.read_input_bytes(0)?;
        ctx.write_output_bytes(&data)
    }
}

pub struct ConcatKernel;

impl Kernel for ConcatKernel {
    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()> {
        let OpAttrs::Concat { axis } = *ctx.op().attrs() else {
            return Err(attrs_mismatch(ctx));
        };
        let output = ctx.output()?;
        let elem = output.dtype().size_in_bytes();
        let out_dims = output.shape().dims();
        let outer: usize = out_dims[..axis].iter().product();
        let inner: usize = out_dims[axis + 1..].iter().product::<usize>() * elem;

        let mut parts = Vec::with_capacity(ctx.op().inputs().len());
        for index in 0..ctx.op().inputs().len() {
            let chunk = shape_dims(ctx, index)?[axis] * inner;
            parts.push((ctx.read_input_bytes(index)?, chunk));
        }
        let mut result = Vec::with_capacity(output.byte_len());
        for o in 0..outer {
            for (data, chunk) in &parts {
                result.extend_from_slice(&data[o * chunk..(o + 1) * chunk]);
            }
        }
        ctx.write_output_bytes(&result)
    }
}

/// Gather along one axis; negative indices count from the end.
pub struct GatherKernel;

impl Kernel for GatherKernel {
    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()> {
        let OpAttrs::Gather { axis } = *ctx.op().attrs() else {
            return Err(attrs_mismatch(ctx));
        };
        let data_tensor = ctx.input(0)?;
        let elem = data_tensor.dtype().size_in_bytes();
        let dims = data_tensor.shape().dims();
        let extent = dims[axis];
        let outer: usize = dims[..axis].iter().product();
        let inner: usize = dims[axis + 1..].iter().product::<usize>() * elem;

        let data = ctx.read_input_bytes(0)?;
        let index_size = ctx.input(1)?.dtype().size_in_bytes();
        let indices = bytes::bytes_to_indices(&ctx.read_input_bytes(1)?, index_size);
        let mut resolved = Vec::with_capacity(indices.len());
        for &raw in &indices {
            let index = if raw < 0 { raw + extent as i64 } else { raw };
            if index < 0 || index >= extent as i64 {
                return Err(Error::launch(format!(
                    "Gather index {raw} is out of range for axis {axis} of extent {extent}"
                )));
            }
            resolved.push(index as usize);
        }

        let mut result = Vec::with_capacity(outer * resolved.len() * inner);
        for o in 0..outer {
            for &index in &resolved {
                let start = (o * extent + index) * inner;
                result.extend_from_slice(&data[start..start + inner]);
            }
        }
        ctx.write_output_bytes(&result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tunegraph::{DType, Error, Executor, Graph, KernelRegistry};

    use crate::{register_host_kernels, HostRuntime};

    #[test]
    fn concat_and_gather_move_whole_rows() {
        let runtime = Arc::new(HostRuntime::new());
        let registry = KernelRegistry::new();
        register_host_kernels(&registry);

        let mut graph = Graph::new();
        let a = graph.add_tensor([2, 1], DType::Int32).unwrap();
        let b = graph.add_tensor([2, 2], DType::Int32).unwrap();
        let joined = graph.concat(&[a, b], None, 1).unwrap();
        let indices = graph.add_tensor([3], DType::Int64).unwrap();
        let picked = graph.gather(joined, indices, None, 0).unwrap();
        let flat = graph.flatten(picked, None).unwrap();
        graph.data_malloc(runtime.clone()).unwrap();
        graph.write_i32(a, &[1, 4]).unwrap();
        graph.write_i32(b, &[2, 3, 5, 6]).unwrap();
        graph.write_i64(indices, &[1, -2, 1]).unwrap();

        Executor::new(runtime, &registry).run(&graph).unwrap();
        let bytes = graph.read_bytes(flat).unwrap();
        let values: Vec<i32> = bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![4, 5, 6, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn out_of_range_gather_fails() {
        let runtime = Arc::new(HostRuntime::new());
        let registry = KernelRegistry::new();
        register_host_kernels(&registry);

        let mut graph = Graph::new();
        let data = graph.add_tensor([2], DType::Float32).unwrap();
        let indices = graph.add_tensor([1], DType::Int32).unwrap();
        graph.gather(data, indices, None, 0).unwrap();
        graph.data_malloc(runtime.clone()).unwrap();
        graph.write_i32(indices, &[2]).unwrap();

        let err = Executor::new(runtime, &registry).run(&graph).unwrap_err();
        assert!(matches!(err, Error::DeviceLaunch(_)));
    }
}
