use crate::error::Result;

/// Options for a device compilation. Floating-point contraction is off by
/// default so tuned kernels produce the same bits as unfused arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub arch: String,
    pub fmad: bool,
}

impl CompileOptions {
    pub fn new(arch: impl Into<String>) -> Self {
        Self {
            arch: arch.into(),
            fmad: false,
        }
    }

    /// Command-line style flags, e.g. `--gpu-architecture=compute_80 --fmad=false`.
    pub fn flags(&self) -> Vec<String> {
        vec![
            format!("--gpu-architecture={}", self.arch),
            format!("--fmad={}", self.fmad),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileStatus {
    Success,
    /// Compilation rejected the source; the message is a short summary and the
    /// full diagnostics live in [`CompilerProgram::log`].
    Failed(String),
}

/// One compilation unit. Dropping the program destroys it.
pub trait CompilerProgram: Send {
    fn compile(&mut self, options: &CompileOptions) -> Result<CompileStatus>;

    /// Diagnostics of the last compilation; empty before `compile`.
    fn log(&self) -> Result<String>;

    /// Loadable image of the last successful compilation; empty otherwise.
    fn binary(&self) -> Result<Vec<u8>>;
}

pub trait DeviceCompiler: Send + Sync {
    fn name(&self) -> &str;

    fn create_program(&self, source: &str, file_name: &str) -> Result<Box<dyn CompilerProgram>>;
}
