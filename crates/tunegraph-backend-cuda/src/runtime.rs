use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::{Arc, Mutex, MutexGuard};

use tunegraph::env;
use tunegraph::runtime::{
    Device, DeviceAddr, DeviceCompiler, FunctionHandle, LaunchConfig, ModuleHandle, Runtime,
};
use tunegraph::{Error, Result};

use crate::driver::{self, CudaDriver};
use crate::nvrtc::NvrtcCompiler;

/// [`Runtime`] on the first CUDA device.
///
/// Launches go to the legacy default stream, so they are ordered with each
/// other and with the blocking copies; [`Runtime::synchronize`] waits on the
/// whole context. The target architecture is `TUNEGRAPH_CUDA_ARCH` when set,
/// otherwise `compute_{major}{minor}` of the device.
pub struct CudaRuntime {
    driver: Arc<CudaDriver>,
    compiler: Arc<dyn DeviceCompiler>,
    arch: String,
    modules: Mutex<HashSet<u64>>,
}

impl CudaRuntime {
    pub fn new() -> Result<Self> {
        let driver = driver::driver()?;
        let arch = match env::cuda_arch_override() {
            Some(arch) => arch,
            None => {
                let (major, minor) = driver.compute_capability()?;
                format!("compute_{major}{minor}")
            }
        };
        let compiler: Arc<dyn DeviceCompiler> = Arc::new(NvrtcCompiler::new()?);
        tracing::debug!(%arch, "CUDA runtime ready");
        Ok(Self {
            driver,
            compiler,
            arch,
            modules: Mutex::new(HashSet::new()),
        })
    }

    /// Modules currently loaded through this runtime.
    pub fn loaded_modules(&self) -> usize {
        self.lock_modules().len()
    }

    fn lock_modules(&self) -> MutexGuard<'_, HashSet<u64>> {
        self.modules.lock().expect("cuda module table poisoned")
    }
}

impl Runtime for CudaRuntime {
    fn device(&self) -> Device {
        Device::Cuda
    }

    fn name(&self) -> &str {
        "cuda"
    }

    fn target_arch(&self) -> String {
        self.arch.clone()
    }

    fn alloc(&self, bytes: usize) -> Result<DeviceAddr> {
        self.driver.alloc(bytes.max(1))
    }

    fn free(&self, addr: DeviceAddr) -> Result<()> {
        self.driver.free(addr)
    }

    fn copy_from_host(&self, dst: DeviceAddr, src: &[u8]) -> Result<()> {
        self.driver.upload(dst, src)
    }

    fn copy_to_host(&self, src: DeviceAddr, dst: &mut [u8]) -> Result<()> {
        self.driver.download(src, dst)
    }

    fn compiler(&self) -> Result<Arc<dyn DeviceCompiler>> {
        Ok(Arc::clone(&self.compiler))
    }

    fn load_module(&self, binary: &[u8]) -> Result<ModuleHandle> {
        let module = self.driver.load_module(binary)?;
        self.lock_modules().insert(module);
        Ok(ModuleHandle(module))
    }

    fn get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle> {
        if !self.lock_modules().contains(&module.0) {
            return Err(Error::device(format!("module {:#x} is not loaded", module.0)));
        }
        Ok(FunctionHandle(self.driver.get_function(module.0, name)?))
    }

    fn launch(
        &self,
        function: FunctionHandle,
        launch: &LaunchConfig,
        shared_mem_bytes: u32,
        args: &mut [*mut c_void],
    ) -> Result<()> {
        if args.iter().any(|arg| arg.is_null()) {
            return Err(Error::launch("kernel argument pointer is null"));
        }
        self.driver
            .launch(function.0, launch.grid, launch.block, shared_mem_bytes, args)
    }

    fn unload_module(&self, module: ModuleHandle) -> Result<()> {
        if !self.lock_modules().remove(&module.0) {
            return Err(Error::device(format!("module {:#x} is not loaded", module.0)));
        }
        self.driver.unload_module(module.0)
    }

    fn synchronize(&self) -> Result<()> {
        self.driver.synchronize()
    }
}
