use std::sync::Arc;

use super::{
    missing_record, operator_signature, timing, ArgumentBinding, JitRecord, Kernel,
    KernelContext, PerfRecord,
};
use crate::env::TuneConfig;
use crate::error::{Error, Result};
use crate::graph::{DType, OpKind};
use crate::runtime::{CompileOptions, CompileStatus, DeviceAddr, LaunchConfig, ScopedModule};
use crate::synth::{entry_point_for, SynthTarget, SynthesisRequest, Synthesizer};

/// Just-in-time kernel for fused element-wise (MemBound) operators.
///
/// `compute` alone always fails: the kernel can only run from a record
/// produced by [`Kernel::tune`], which synthesizes source, compiles it for the
/// runtime's architecture, and benchmarks the loaded entry point.
pub struct MemBoundKernel {
    synthesizer: Arc<dyn Synthesizer>,
    target: SynthTarget,
}

impl MemBoundKernel {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, target: SynthTarget) -> Self {
        Self {
            synthesizer,
            target,
        }
    }

    pub fn synthesizer(&self) -> &Arc<dyn Synthesizer> {
        &self.synthesizer
    }

    fn request(
        &self,
        ctx: &KernelContext<'_>,
        binding: &ArgumentBinding,
        func_name: &str,
    ) -> Result<SynthesisRequest> {
        let op = ctx.op();
        let expr = op.fused_expr().ok_or_else(|| {
            Error::config(format!("{} ({}) carries no fused expression", op.id(), op.kind()))
        })?;
        let mut input_shapes = Vec::with_capacity(op.inputs().len());
        let mut input_dtypes = Vec::with_capacity(op.inputs().len());
        for index in 0..op.inputs().len() {
            let tensor = ctx.input(index)?;
            input_shapes.push(tensor.shape().dims().to_vec());
            input_dtypes.push(tensor.dtype().name().to_string());
        }
        let output = ctx.output()?;
        Ok(SynthesisRequest {
            input_shapes,
            input_dtypes,
            output_shape: output.shape().dims().to_vec(),
            output_dtype: output.dtype().name().to_string(),
            expression: expr.render(binding.input_names())?,
            func_name: func_name.to_string(),
            input_names: binding.input_names().to_vec(),
            output_name: binding.output_name().to_string(),
            target: self.target,
        })
    }
}

fn check_operator(ctx: &KernelContext<'_>) -> Result<()> {
    let op = ctx.op();
    if op.kind() != OpKind::MemBound {
        return Err(Error::config(format!(
            "MemBound kernel dispatched for {} ({})",
            op.id(),
            op.kind()
        )));
    }
    let dtype = ctx.output()?.dtype();
    if dtype != DType::Float32 {
        return Err(Error::unsupported(ctx.runtime().device(), op.kind(), dtype));
    }
    Ok(())
}

impl Kernel for MemBoundKernel {
    fn requires_tuning(&self) -> bool {
        true
    }

    fn compute(&self, ctx: &KernelContext<'_>) -> Result<()> {
        Err(missing_record(ctx.op()))
    }

    /// Reloads the stored binary into a fresh module, launches the stored entry
    /// point on the operator's current addresses, and unloads the module before
    /// returning. Does not wait for the launch to complete.
    fn compute_with_record(&self, ctx: &KernelContext<'_>, record: &PerfRecord) -> Result<()> {
        check_operator(ctx)?;
        let jit = record.as_jit().ok_or_else(|| missing_record(ctx.op()))?;
        let signature = operator_signature(ctx)?;
        if jit.signature() != signature {
            return Err(Error::config(format!(
                "tuning record for {} was produced for a different configuration \
                 (record {:016x}, operator {signature:016x})",
                ctx.op().id(),
                jit.signature()
            )));
        }

        let binding = ArgumentBinding::bind(ctx)?;
        let runtime = ctx.runtime();
        let module = ScopedModule::load(runtime, jit.binary())?;
        let function = module.function(jit.entry_point())?;
        let mut slots: Vec<DeviceAddr> = Vec::new();
        let mut params = binding.marshal(&mut slots);
        runtime.launch(function, jit.launch(), 0, &mut params)
    }

    fn tune(&self, ctx: &KernelContext<'_>, config: &TuneConfig) -> Result<PerfRecord> {
        check_operator(ctx)?;
        let op = ctx.op();
        let runtime = ctx.runtime();

        let func_name = format!("mem_bound_{}", op.id().guid());
        let entry_point = entry_point_for(&func_name);
        let file_name = format!("{func_name}.{}", self.target.file_extension());
        let signature = operator_signature(ctx)?;

        let binding = ArgumentBinding::bind(ctx)?;
        let request = self.request(ctx, &binding, &func_name)?;
        tracing::debug!(
            op = %op.id(),
            synthesizer = self.synthesizer.name(),
            expression = %request.expression,
            "synthesizing kernel"
        );
        let synthesized = self.synthesizer.synthesize(&request)?;
        let launch = LaunchConfig::from_array(synthesized.launch)?;

        let compiler = runtime.compiler()?;
        let mut program = compiler.create_program(&synthesized.source, &file_name)?;
        let options = CompileOptions::new(runtime.target_arch());
        let status = match program.compile(&options) {
            Ok(status) => status,
            Err(err) => {
                let log = program.log().unwrap_or_default();
                tracing::debug!(file = %file_name, %log, "device compiler errored");
                return Err(Error::Compile {
                    file: file_name,
                    message: err.to_string(),
                    log,
                });
            }
        };
        let log = program.log()?;
        if let CompileStatus::Failed(message) = status {
            tracing::debug!(file = %file_name, %log, "device compilation failed");
            return Err(Error::Compile {
                file: file_name,
                message,
                log,
            });
        }
        let binary = program.binary()?;
        tracing::debug!(
            file = %file_name,
            compiler = compiler.name(),
            arch = %options.arch,
            bytes = binary.len(),
            "compiled kernel"
        );

        let module = ScopedModule::load(runtime, &binary)?;
        let function = module.function(&entry_point)?;
        let mut slots: Vec<DeviceAddr> = Vec::new();
        let time_ms = timing::timeit(
            runtime,
            config.warmup_rounds,
            config.timing_rounds,
            || {
                let mut params = binding.marshal(&mut slots);
                runtime.launch(function, &launch, 0, &mut params)
            },
        )?;
        drop(module);
        drop(program);

        tracing::info!(
            op = %op.id(),
            entry = %entry_point,
            launch = ?launch.to_array(),
            time_ms,
            "tuned MemBound kernel"
        );
        Ok(PerfRecord::Jit(JitRecord::new(
            signature,
            entry_point,
            launch,
            binary,
            log,
            time_ms,
        )))
    }
}
