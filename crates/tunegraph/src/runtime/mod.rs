//! Device abstraction: memory, code loading, launches and the stream barrier.
//!
//! A [`Runtime`] is the loader/executor half of the device contract; the
//! compiler half is reached through [`Runtime::compiler`].

pub mod bytes;
mod compiler;
mod module;

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub use compiler::{CompileOptions, CompileStatus, CompilerProgram, DeviceCompiler};
pub use module::ScopedModule;

use crate::error::{Error, Result};

/// Raw device address of a tensor buffer.
pub type DeviceAddr = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    Host,
    Cuda,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => f.write_str("host"),
            Device::Cuda => f.write_str("cuda"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub u64);

/// Grid and block extents of a launch; serialized as six integers
/// `[grid_x, grid_y, grid_z, block_x, block_y, block_z]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "[u32; 6]", try_from = "[u32; 6]")]
pub struct LaunchConfig {
    pub grid: [u32; 3],
    pub block: [u32; 3],
}

impl LaunchConfig {
    pub fn linear(grid: u32, block: u32) -> Self {
        Self {
            grid: [grid, 1, 1],
            block: [block, 1, 1],
        }
    }

    pub fn from_array(values: [u32; 6]) -> Result<Self> {
        if values.iter().any(|&v| v == 0) {
            return Err(Error::config(format!(
                "launch configuration must be positive in every dimension, got {values:?}"
            )));
        }
        Ok(Self {
            grid: [values[0], values[1], values[2]],
            block: [values[3], values[4], values[5]],
        })
    }

    pub fn to_array(&self) -> [u32; 6] {
        [
            self.grid[0],
            self.grid[1],
            self.grid[2],
            self.block[0],
            self.block[1],
            self.block[2],
        ]
    }

    pub fn threads_per_block(&self) -> u64 {
        self.block.iter().map(|&d| u64::from(d)).product()
    }

    pub fn total_threads(&self) -> u64 {
        self.grid.iter().map(|&d| u64::from(d)).product::<u64>() * self.threads_per_block()
    }
}

impl From<LaunchConfig> for [u32; 6] {
    fn from(config: LaunchConfig) -> Self {
        config.to_array()
    }
}

impl TryFrom<[u32; 6]> for LaunchConfig {
    type Error = Error;

    fn try_from(values: [u32; 6]) -> Result<Self> {
        LaunchConfig::from_array(values)
    }
}

/// Loader and executor for one device context.
///
/// Launches are ordered on the device stream and may complete asynchronously;
/// [`Runtime::synchronize`] is the barrier that waits for all of them.
pub trait Runtime: Send + Sync {
    fn device(&self) -> Device;

    fn name(&self) -> &str;

    /// Architecture string handed to the device compiler.
    fn target_arch(&self) -> String;

    fn alloc(&self, bytes: usize) -> Result<DeviceAddr>;

    fn free(&self, addr: DeviceAddr) -> Result<()>;

    fn copy_from_host(&self, dst: DeviceAddr, src: &[u8]) -> Result<()>;

    fn copy_to_host(&self, src: DeviceAddr, dst: &mut [u8]) -> Result<()>;

    fn compiler(&self) -> Result<Arc<dyn DeviceCompiler>>;

    fn load_module(&self, binary: &[u8]) -> Result<ModuleHandle>;

    fn get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle>;

    /// `args` holds one pointer per kernel parameter, each pointing at the
    /// parameter value (for buffers: at the device address).
    fn launch(
        &self,
        function: FunctionHandle,
        launch: &LaunchConfig,
        shared_mem_bytes: u32,
        args: &mut [*mut c_void],
    ) -> Result<()>;

    fn unload_module(&self, module: ModuleHandle) -> Result<()>;

    fn synchronize(&self) -> Result<()>;

    /// Clock used for benchmarking.
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_config_serializes_as_six_integers() {
        let config = LaunchConfig::linear(4, 64);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, "[4,1,1,64,1,1]");
        let parsed: LaunchConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(config.total_threads(), 256);
    }

    #[test]
    fn zero_extent_launch_is_rejected() {
        assert!(serde_json::from_str::<LaunchConfig>("[0,1,1,64,1,1]").is_err());
        assert!(LaunchConfig::from_array([1, 1, 1, 0, 1, 1]).is_err());
    }
}
