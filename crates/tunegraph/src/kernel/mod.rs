//! Kernel interface, registry, and the just-in-time tuning pipeline.

mod args;
pub mod cache;
mod membound;
mod record;
pub mod registry;
mod signature;
pub mod timing;

pub use args::ArgumentBinding;
pub use cache::{DiskRecordCache, RecordCache};
pub use membound::MemBoundKernel;
pub use record::{JitRecord, PerfRecord};
pub use registry::{KernelKey, KernelRegistry};
pub use signature::operator_signature;

use crate::env::TuneConfig;
use crate::error::{Error, Result};
use crate::graph::{DType, Graph, Operator, Tensor};
use crate::runtime::{bytes, DeviceAddr, Runtime};

/// Everything a kernel sees while computing one operator.
#[derive(Clone, Copy)]
pub struct KernelContext<'a> {
    graph: &'a Graph,
    op: &'a Operator,
    runtime: &'a dyn Runtime,
}

impl<'a> KernelContext<'a> {
    pub fn new(graph: &'a Graph, op: &'a Operator, runtime: &'a dyn Runtime) -> Self {
        Self { graph, op, runtime }
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    pub fn op(&self) -> &'a Operator {
        self.op
    }

    pub fn runtime(&self) -> &'a dyn Runtime {
        self.runtime
    }

    pub fn input(&self, index: usize) -> Result<&'a Tensor> {
        let id = self.op.inputs().get(index).ok_or_else(|| {
            Error::config(format!(
                "{} ({}) has no input {index}",
                self.op.id(),
                self.op.kind()
            ))
        })?;
        self.graph.tensor(*id)
    }

    pub fn output(&self) -> Result<&'a Tensor> {
        self.graph.tensor(self.op.output())
    }

    pub fn input_addr(&self, index: usize) -> Result<DeviceAddr> {
        bound_addr(self.input(index)?)
    }

    pub fn output_addr(&self) -> Result<DeviceAddr> {
        bound_addr(self.output()?)
    }

    pub fn read_input_bytes(&self, index: usize) -> Result<Vec<u8>> {
        let tensor = self.input(index)?;
        let mut out = vec![0u8; tensor.byte_len()];
        self.runtime.copy_to_host(bound_addr(tensor)?, &mut out)?;
        Ok(out)
    }

    pub fn read_input_f32(&self, index: usize) -> Result<Vec<f32>> {
        expect_dtype(self.input(index)?, DType::Float32)?;
        Ok(bytes::bytes_to_f32(&self.read_input_bytes(index)?))
    }

    pub fn write_output_bytes(&self, data: &[u8]) -> Result<()> {
        let tensor = self.output()?;
        if data.len() != tensor.byte_len() {
            return Err(Error::device(format!(
                "{} output holds {} bytes, kernel produced {}",
                self.op.kind(),
                tensor.byte_len(),
                data.len()
            )));
        }
        self.runtime.copy_from_host(bound_addr(tensor)?, data)
    }

    pub fn write_output_f32(&self, data: &[f32]) -> Result<()> {
        expect_dtype(self.output()?, DType::Float32)?;
        self.write_output_bytes(&bytes::f32_to_bytes(data))
    }
}

fn bound_addr(tensor: &Tensor) -> Result<DeviceAddr> {
    tensor.addr().ok_or_else(|| {
        Error::config(format!(
            "tensor {} has no device storage; call data_malloc first",
            tensor.id()
        ))
    })
}

fn expect_dtype(tensor: &Tensor, dtype: DType) -> Result<()> {
    if tensor.dtype() != dtype {
        return Err(Error::config(format!(
            "tensor {} is {}, kernel expects {dtype}",
            tensor.id(),
            tensor.dtype()
        )));
    }
    Ok(())
}

/// Device implementation of one `(device, op kind, dtype)` triple.
///
/// Kernels are stateless and shared; everything they need arrives through the
/// [`KernelContext`] and, for tuned kernels, the [`PerfRecord`].
pub trait Kernel: Send + Sync {
    /// True for kernels that can only run from a tuning record.
    fn requires_tuning(&self) -> bool {
        false
    }

    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()>;

    /// Runs from a record produced by [`Kernel::tune`]. Fixed kernels ignore it.
    fn compute_with_record(&self, ctx: &KernelContext<'_>, record: &PerfRecord) -> Result<()> {
        let _ = record;
        self.compute(ctx)
    }

    /// Measures the kernel on the current inputs. Fixed kernels time one
    /// `compute` between two stream barriers.
    fn tune(&self, ctx: &KernelContext<'_>, config: &TuneConfig) -> Result<PerfRecord> {
        let time_ms = timing::timeit(
            ctx.runtime(),
            config.warmup_rounds,
            config.timing_rounds,
            || self.compute(ctx),
        )?;
        Ok(PerfRecord::Timed { time_ms })
    }
}

pub(crate) fn missing_record(op: &Operator) -> Error {
    Error::MissingTuningRecord {
        op: op.id(),
        kind: op.kind(),
    }
}

pub(crate) fn dispatch_dtype(graph: &Graph, op: &Operator) -> Result<DType> {
    Ok(graph.tensor(op.output())?.dtype())
}
