use serde::{Deserialize, Serialize};

use crate::runtime::LaunchConfig;

/// Outcome of tuning one operator. Immutable once produced and valid only for
/// the configuration (shapes, dtypes, expression, device, arch) it was tuned on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PerfRecord {
    /// Measurement of a fixed kernel; carries no artifact.
    Timed { time_ms: f64 },
    Jit(JitRecord),
}

impl PerfRecord {
    pub fn time_ms(&self) -> f64 {
        match self {
            PerfRecord::Timed { time_ms } => *time_ms,
            PerfRecord::Jit(record) => record.time_ms,
        }
    }

    pub fn as_jit(&self) -> Option<&JitRecord> {
        match self {
            PerfRecord::Jit(record) => Some(record),
            PerfRecord::Timed { .. } => None,
        }
    }
}

/// Compiled artifact of a just-in-time kernel and its measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitRecord {
    signature: u64,
    entry_point: String,
    launch: LaunchConfig,
    binary: Vec<u8>,
    log: String,
    time_ms: f64,
}

impl JitRecord {
    pub fn new(
        signature: u64,
        entry_point: impl Into<String>,
        launch: LaunchConfig,
        binary: Vec<u8>,
        log: impl Into<String>,
        time_ms: f64,
    ) -> Self {
        Self {
            signature,
            entry_point: entry_point.into(),
            launch,
            binary,
            log: log.into(),
            time_ms,
        }
    }

    /// Fingerprint of the configuration the record was tuned against.
    pub fn signature(&self) -> u64 {
        self.signature
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn launch(&self) -> &LaunchConfig {
        &self.launch
    }

    pub fn binary(&self) -> &[u8] {
        &self.binary
    }

    /// Compiler diagnostics captured while building `binary`.
    pub fn log(&self) -> &str {
        &self.log
    }

    pub fn time_ms(&self) -> f64 {
        self.time_ms
    }
}
