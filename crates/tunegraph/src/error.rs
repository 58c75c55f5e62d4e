use thiserror::Error;

use crate::graph::{DType, OpId, OpKind};
use crate::runtime::Device;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy shared by graph construction, dispatch, tuning and execution.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid graph construction or operator attributes.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("no kernel registered for device={device} op={op} dtype={dtype}")]
    UnsupportedOperation {
        device: Device,
        op: OpKind,
        dtype: DType,
    },

    #[error("operator {op} ({kind}) has no tuning record; tune it before computing")]
    MissingTuningRecord { op: OpId, kind: OpKind },

    #[error("failed to import external tool `{tool}`: {reason} (hint: {hint})")]
    ExternalToolImport {
        tool: String,
        reason: String,
        hint: String,
    },

    /// Device compilation failed. `log` carries the compiler diagnostics verbatim.
    #[error("failed to compile {file}: {message}\n{log}")]
    Compile {
        file: String,
        message: String,
        log: String,
    },

    #[error("kernel launch failed: {0}")]
    DeviceLaunch(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("kernel synthesis failed: {0}")]
    Synthesis(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Error::Device(msg.into())
    }

    pub fn launch(msg: impl Into<String>) -> Self {
        Error::DeviceLaunch(msg.into())
    }

    pub fn synthesis(msg: impl Into<String>) -> Self {
        Error::Synthesis(msg.into())
    }

    pub fn unsupported(device: Device, op: OpKind, dtype: DType) -> Self {
        Error::UnsupportedOperation { device, op, dtype }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("json: {err}"))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(format!("bincode: {err}"))
    }
}
