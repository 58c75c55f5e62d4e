use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tunegraph::runtime::{
    CompileOptions, CompileStatus, CompilerProgram, Device, DeviceAddr, DeviceCompiler,
    FunctionHandle, LaunchConfig, ModuleHandle, Runtime,
};
use tunegraph::{Error, Result};

/// One observable interaction with the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Alloc(usize),
    Free(DeviceAddr),
    CopyIn(DeviceAddr),
    CopyOut(DeviceAddr),
    CreateProgram(String),
    Compile(String),
    LoadModule(u64),
    GetFunction(String),
    Launch([u32; 6]),
    LaunchRejected,
    UnloadModule(u64),
    Synchronize,
    Clock,
}

type EventLog = Arc<Mutex<Vec<RuntimeEvent>>>;

fn push(log: &EventLog, event: RuntimeEvent) {
    log.lock().expect("event log poisoned").push(event);
}

/// Test-only runtime that forwards to a real one and records every call,
/// including compiler activity and clock reads. Launches and compiles can be
/// made to fail on demand.
pub struct RecordingRuntime {
    inner: Arc<dyn Runtime>,
    events: EventLog,
    fail_launches: AtomicBool,
    fail_compiles: Arc<AtomicBool>,
}

impl RecordingRuntime {
    pub fn new(inner: Arc<dyn Runtime>) -> Self {
        Self {
            inner,
            events: Arc::new(Mutex::new(Vec::new())),
            fail_launches: AtomicBool::new(false),
            fail_compiles: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().expect("event log poisoned").clear();
    }

    pub fn count(&self, matches: impl Fn(&RuntimeEvent) -> bool) -> usize {
        self.events().iter().filter(|event| matches(event)).count()
    }

    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Compiles still reach the wrapped compiler, then report an error with
    /// an extra log line.
    pub fn set_fail_compiles(&self, fail: bool) {
        self.fail_compiles.store(fail, Ordering::SeqCst);
    }

    fn record(&self, event: RuntimeEvent) {
        push(&self.events, event);
    }
}

impl Runtime for RecordingRuntime {
    fn device(&self) -> Device {
        self.inner.device()
    }

    fn name(&self) -> &str {
        "recording"
    }

    fn target_arch(&self) -> String {
        self.inner.target_arch()
    }

    fn alloc(&self, bytes: usize) -> Result<DeviceAddr> {
        self.record(RuntimeEvent::Alloc(bytes));
        self.inner.alloc(bytes)
    }

    fn free(&self, addr: DeviceAddr) -> Result<()> {
        self.record(RuntimeEvent::Free(addr));
        self.inner.free(addr)
    }

    fn copy_from_host(&self, dst: DeviceAddr, src: &[u8]) -> Result<()> {
        self.record(RuntimeEvent::CopyIn(dst));
        self.inner.copy_from_host(dst, src)
    }

    fn copy_to_host(&self, src: DeviceAddr, dst: &mut [u8]) -> Result<()> {
        self.record(RuntimeEvent::CopyOut(src));
        self.inner.copy_to_host(src, dst)
    }

    fn compiler(&self) -> Result<Arc<dyn DeviceCompiler>> {
        Ok(Arc::new(RecordingCompiler {
            inner: self.inner.compiler()?,
            events: Arc::clone(&self.events),
            fail_compiles: Arc::clone(&self.fail_compiles),
        }))
    }

    fn load_module(&self, binary: &[u8]) -> Result<ModuleHandle> {
        let handle = self.inner.load_module(binary)?;
        self.record(RuntimeEvent::LoadModule(handle.0));
        Ok(handle)
    }

    fn get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle> {
        self.record(RuntimeEvent::GetFunction(name.to_string()));
        self.inner.get_function(module, name)
    }

    fn launch(
        &self,
        function: FunctionHandle,
        launch: &LaunchConfig,
        shared_mem_bytes: u32,
        args: &mut [*mut c_void],
    ) -> Result<()> {
        if self.fail_launches.load(Ordering::SeqCst) {
            self.record(RuntimeEvent::LaunchRejected);
            return Err(Error::launch("injected launch failure"));
        }
        self.record(RuntimeEvent::Launch(launch.to_array()));
        self.inner.launch(function, launch, shared_mem_bytes, args)
    }

    fn unload_module(&self, module: ModuleHandle) -> Result<()> {
        self.record(RuntimeEvent::UnloadModule(module.0));
        self.inner.unload_module(module)
    }

    fn synchronize(&self) -> Result<()> {
        self.record(RuntimeEvent::Synchronize);
        self.inner.synchronize()
    }

    fn now(&self) -> Instant {
        self.record(RuntimeEvent::Clock);
        self.inner.now()
    }
}

struct RecordingCompiler {
    inner: Arc<dyn DeviceCompiler>,
    events: EventLog,
    fail_compiles: Arc<AtomicBool>,
}

impl DeviceCompiler for RecordingCompiler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn create_program(&self, source: &str, file_name: &str) -> Result<Box<dyn CompilerProgram>> {
        push(&self.events, RuntimeEvent::CreateProgram(file_name.to_string()));
        Ok(Box::new(RecordingProgram {
            inner: self.inner.create_program(source, file_name)?,
            events: Arc::clone(&self.events),
            fail_compiles: Arc::clone(&self.fail_compiles),
            faulted: false,
        }))
    }
}

struct RecordingProgram {
    inner: Box<dyn CompilerProgram>,
    events: EventLog,
    fail_compiles: Arc<AtomicBool>,
    faulted: bool,
}

pub const INJECTED_COMPILER_FAULT: &str = "injected compiler fault";

impl CompilerProgram for RecordingProgram {
    fn compile(&mut self, options: &CompileOptions) -> Result<CompileStatus> {
        push(&self.events, RuntimeEvent::Compile(options.flags().join(" ")));
        let status = self.inner.compile(options)?;
        self.faulted = self.fail_compiles.load(Ordering::SeqCst);
        if self.faulted {
            return Err(Error::device(INJECTED_COMPILER_FAULT));
        }
        Ok(status)
    }

    fn log(&self) -> Result<String> {
        let mut log = self.inner.log()?;
        if self.faulted {
            log.push_str(INJECTED_COMPILER_FAULT);
            log.push('\n');
        }
        Ok(log)
    }

    fn binary(&self) -> Result<Vec<u8>> {
        self.inner.binary()
    }
}
