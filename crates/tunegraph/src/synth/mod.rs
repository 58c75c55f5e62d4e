//! Kernel synthesizers: the code-generation oracle of the tuning pipeline.
//!
//! A synthesizer receives a [`SynthesisRequest`] describing a fused
//! element-wise computation and returns device source plus a launch
//! configuration. The request and response travel as JSON when the
//! synthesizer runs out of process.

mod builtin;
mod process;

use serde::{Deserialize, Serialize};

pub use builtin::BuiltinSynthesizer;
pub use process::ProcessSynthesizer;

use crate::error::Result;

/// Source dialect a synthesizer should emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthTarget {
    /// CUDA C with an `extern "C" __global__` entry point.
    #[default]
    Cuda,
    /// Host kernel assembly understood by the host device compiler.
    HostIr,
}

impl SynthTarget {
    /// Extension of the virtual file name handed to the device compiler.
    pub fn file_extension(self) -> &'static str {
        match self {
            SynthTarget::Cuda => "cu",
            SynthTarget::HostIr => "hir",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub input_shapes: Vec<Vec<usize>>,
    pub input_dtypes: Vec<String>,
    pub output_shape: Vec<usize>,
    pub output_dtype: String,
    /// Rendered fused expression over `input_names`.
    pub expression: String,
    /// Canonical function name; the entry point is `{func_name}_kernel0`.
    pub func_name: String,
    pub input_names: Vec<String>,
    pub output_name: String,
    #[serde(default)]
    pub target: SynthTarget,
}

impl SynthesisRequest {
    pub fn entry_point(&self) -> String {
        entry_point_for(&self.func_name)
    }
}

pub fn entry_point_for(func_name: &str) -> String {
    format!("{func_name}_kernel0")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResponse {
    pub source: String,
    /// `[grid_x, grid_y, grid_z, block_x, block_y, block_z]`.
    pub launch: [u32; 6],
    /// Synthesizer-specific metadata, carried along for diagnostics only.
    #[serde(default)]
    pub aux: serde_json::Value,
}

pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse>;
}
