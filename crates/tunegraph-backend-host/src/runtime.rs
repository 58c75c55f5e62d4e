use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tunegraph::runtime::{
    Device, DeviceAddr, DeviceCompiler, FunctionHandle, LaunchConfig, ModuleHandle, Runtime,
};
use tunegraph::{Error, Result};

use crate::compiler::{HostCompiler, HostKernelProgram, HostModule, HOST_ARCH};
use crate::interp;
use crate::memory::HostMemory;

struct PendingLaunch {
    kernel: Arc<HostKernelProgram>,
    addrs: Vec<DeviceAddr>,
    threads: u64,
}

#[derive(Default)]
struct ModuleTable {
    modules: HashMap<u64, Arc<HostModule>>,
    functions: HashMap<u64, (u64, Arc<HostKernelProgram>)>,
}

/// Reference device backed by host memory.
///
/// Launches are queued on an in-order stream and only run when the stream is
/// drained by [`Runtime::synchronize`] or by a copy, which makes the
/// asynchronous launch contract observable in tests. A queued launch keeps its
/// program alive, so a module may be unloaded while launches from it are
/// still pending.
pub struct HostRuntime {
    memory: Mutex<HostMemory>,
    stream: Mutex<VecDeque<PendingLaunch>>,
    modules: Mutex<ModuleTable>,
    compiler: Arc<dyn DeviceCompiler>,
    next_handle: AtomicU64,
    launches: AtomicU64,
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRuntime {
    pub fn new() -> Self {
        Self {
            memory: Mutex::new(HostMemory::default()),
            stream: Mutex::new(VecDeque::new()),
            modules: Mutex::new(ModuleTable::default()),
            compiler: Arc::new(HostCompiler),
            next_handle: AtomicU64::new(1),
            launches: AtomicU64::new(0),
        }
    }

    /// Modules currently loaded.
    pub fn loaded_modules(&self) -> usize {
        self.lock_modules().modules.len()
    }

    /// Launches accepted since creation.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Launches queued but not yet executed.
    pub fn pending_launches(&self) -> usize {
        self.lock_stream().len()
    }

    pub fn live_allocations(&self) -> usize {
        self.lock_memory().live_allocations()
    }

    fn lock_memory(&self) -> MutexGuard<'_, HostMemory> {
        self.memory.lock().expect("host memory mutex poisoned")
    }

    fn lock_stream(&self) -> MutexGuard<'_, VecDeque<PendingLaunch>> {
        self.stream.lock().expect("host stream mutex poisoned")
    }

    fn lock_modules(&self) -> MutexGuard<'_, ModuleTable> {
        self.modules.lock().expect("host module table poisoned")
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl Runtime for HostRuntime {
    fn device(&self) -> Device {
        Device::Host
    }

    fn name(&self) -> &str {
        "host"
    }

    fn target_arch(&self) -> String {
        HOST_ARCH.to_string()
    }

    fn alloc(&self, bytes: usize) -> Result<DeviceAddr> {
        self.lock_memory().alloc(bytes)
    }

    /// The allocation is released even when draining the stream fails; the
    /// launch error is still reported.
    fn free(&self, addr: DeviceAddr) -> Result<()> {
        let drained = self.synchronize();
        self.lock_memory().free(addr)?;
        drained
    }

    fn copy_from_host(&self, dst: DeviceAddr, src: &[u8]) -> Result<()> {
        self.synchronize()?;
        self.lock_memory().write(dst, src)
    }

    fn copy_to_host(&self, src: DeviceAddr, dst: &mut [u8]) -> Result<()> {
        self.synchronize()?;
        let memory = self.lock_memory();
        dst.copy_from_slice(memory.read(src, dst.len())?);
        Ok(())
    }

    fn compiler(&self) -> Result<Arc<dyn DeviceCompiler>> {
        Ok(Arc::clone(&self.compiler))
    }

    fn load_module(&self, binary: &[u8]) -> Result<ModuleHandle> {
        let module = HostModule::decode(binary)?;
        let handle = self.next_handle();
        self.lock_modules().modules.insert(handle, Arc::new(module));
        tracing::trace!(module = handle, "host module loaded");
        Ok(ModuleHandle(handle))
    }

    fn get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle> {
        let mut table = self.lock_modules();
        let loaded = table
            .modules
            .get(&module.0)
            .ok_or_else(|| Error::device(format!("module {} is not loaded", module.0)))?;
        let kernel = loaded
            .kernel(name)
            .cloned()
            .ok_or_else(|| Error::device(format!("module {} has no function {name}", module.0)))?;
        let handle = self.next_handle();
        table.functions.insert(handle, (module.0, Arc::new(kernel)));
        Ok(FunctionHandle(handle))
    }

    fn launch(
        &self,
        function: FunctionHandle,
        launch: &LaunchConfig,
        _shared_mem_bytes: u32,
        args: &mut [*mut c_void],
    ) -> Result<()> {
        let kernel = self
            .lock_modules()
            .functions
            .get(&function.0)
            .map(|(_, kernel)| Arc::clone(kernel))
            .ok_or_else(|| Error::launch(format!("unknown function handle {}", function.0)))?;
        let expected = kernel.params.len();
        if args.len() != expected {
            return Err(Error::launch(format!(
                "{} expects {expected} arguments, got {}",
                kernel.name,
                args.len()
            )));
        }
        let mut addrs = Vec::with_capacity(args.len());
        for (index, &arg) in args.iter().enumerate() {
            if arg.is_null() {
                return Err(Error::launch(format!(
                    "{}: argument {index} is null",
                    kernel.name
                )));
            }
            // SAFETY: the launch contract requires every argument to point at a
            // live `DeviceAddr` for the duration of this call.
            addrs.push(unsafe { *(arg as *const DeviceAddr) });
        }
        self.lock_stream().push_back(PendingLaunch {
            kernel,
            addrs,
            threads: launch.total_threads(),
        });
        self.launches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unload_module(&self, module: ModuleHandle) -> Result<()> {
        let mut table = self.lock_modules();
        if table.modules.remove(&module.0).is_none() {
            return Err(Error::device(format!("module {} is not loaded", module.0)));
        }
        table.functions.retain(|_, (owner, _)| *owner != module.0);
        tracing::trace!(module = module.0, "host module unloaded");
        Ok(())
    }

    /// Drains the stream in order. The first failing launch is reported and
    /// everything queued behind it is discarded.
    fn synchronize(&self) -> Result<()> {
        let pending: Vec<PendingLaunch> = self.lock_stream().drain(..).collect();
        if pending.is_empty() {
            return Ok(());
        }
        let mut memory = self.lock_memory();
        for launch in pending {
            let result =
                interp::execute(&launch.kernel, &launch.addrs, launch.threads, &mut memory);
            if let Err(err) = result {
                tracing::debug!(kernel = %launch.kernel.name, error = %err, "host launch failed");
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tunegraph::runtime::{bytes, CompileOptions, CompileStatus};

    use super::*;

    const SCALE: &str = "\
.kernel scale_kernel0
.params x out
.dims 4
.strides 0 1
  load 0
  const 2.0
  mul
  store
.end
";

    fn load_scale(runtime: &HostRuntime) -> ModuleHandle {
        let compiler = runtime.compiler().unwrap();
        let mut program = compiler.create_program(SCALE, "scale.hir").unwrap();
        let status = program
            .compile(&CompileOptions::new(runtime.target_arch()))
            .unwrap();
        assert_eq!(status, CompileStatus::Success);
        runtime.load_module(&program.binary().unwrap()).unwrap()
    }

    #[test]
    fn launches_run_only_when_the_stream_drains() {
        let runtime = HostRuntime::new();
        let x = runtime.alloc(16).unwrap();
        let out = runtime.alloc(16).unwrap();
        runtime
            .copy_from_host(x, &bytes::f32_to_bytes(&[1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let module = load_scale(&runtime);
        let function = runtime.get_function(module, "scale_kernel0").unwrap();

        let mut slots = [x, out];
        let mut args: Vec<*mut c_void> = slots
            .iter_mut()
            .map(|slot| slot as *mut DeviceAddr as *mut c_void)
            .collect();
        runtime
            .launch(function, &LaunchConfig::linear(1, 64), 0, &mut args)
            .unwrap();
        assert_eq!(runtime.pending_launches(), 1);

        // Unloading does not cancel the queued launch.
        runtime.unload_module(module).unwrap();
        assert_eq!(runtime.loaded_modules(), 0);

        let mut host = vec![0u8; 16];
        runtime.copy_to_host(out, &mut host).unwrap();
        assert_eq!(bytes::bytes_to_f32(&host), vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(runtime.pending_launches(), 0);
        assert_eq!(runtime.launches(), 1);
    }

    #[test]
    fn unloaded_functions_cannot_launch() {
        let runtime = HostRuntime::new();
        let module = load_scale(&runtime);
        let function = runtime.get_function(module, "scale_kernel0").unwrap();
        runtime.unload_module(module).unwrap();
        let err = runtime
            .launch(function, &LaunchConfig::linear(1, 1), 0, &mut [])
            .unwrap_err();
        assert!(matches!(err, Error::DeviceLaunch(_)));
        assert!(runtime.unload_module(module).is_err());
    }

    #[test]
    fn failed_launch_surfaces_at_synchronize() {
        let runtime = HostRuntime::new();
        let small = runtime.alloc(4).unwrap();
        let out = runtime.alloc(16).unwrap();
        let module = load_scale(&runtime);
        let function = runtime.get_function(module, "scale_kernel0").unwrap();
        let mut slots = [small, out];
        let mut args: Vec<*mut c_void> = slots
            .iter_mut()
            .map(|slot| slot as *mut DeviceAddr as *mut c_void)
            .collect();
        runtime
            .launch(function, &LaunchConfig::linear(1, 4), 0, &mut args)
            .unwrap();
        assert!(runtime.synchronize().is_err());
        assert_eq!(runtime.pending_launches(), 0);
        runtime.synchronize().unwrap();
    }

    #[test]
    fn free_releases_storage_when_a_queued_launch_fails() {
        let runtime = HostRuntime::new();
        let small = runtime.alloc(4).unwrap();
        let out = runtime.alloc(16).unwrap();
        let module = load_scale(&runtime);
        let function = runtime.get_function(module, "scale_kernel0").unwrap();
        let mut slots = [small, out];
        let mut args: Vec<*mut c_void> = slots
            .iter_mut()
            .map(|slot| slot as *mut DeviceAddr as *mut c_void)
            .collect();
        runtime
            .launch(function, &LaunchConfig::linear(1, 4), 0, &mut args)
            .unwrap();
        assert_eq!(runtime.live_allocations(), 2);

        let err = runtime.free(out).unwrap_err();
        assert!(!matches!(err, Error::Configuration(_)), "{err}");
        assert_eq!(runtime.live_allocations(), 1);
        assert_eq!(runtime.pending_launches(), 0);
        runtime.free(small).unwrap();
        assert_eq!(runtime.live_allocations(), 0);
    }
}
