//! NVRTC runtime compiler, bound at runtime like the driver.

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::{Arc, OnceLock};

use libloading::Library;
use tunegraph::runtime::{CompileOptions, CompileStatus, CompilerProgram, DeviceCompiler};
use tunegraph::{Error, Result};

use crate::driver::load_symbol;

type NvrtcResult = i32;
type NvrtcProgram = *mut c_void;

const NVRTC_SUCCESS: NvrtcResult = 0;

type NvrtcCreateProgramFn = unsafe extern "C" fn(
    prog: *mut NvrtcProgram,
    src: *const c_char,
    name: *const c_char,
    num_headers: i32,
    headers: *const *const c_char,
    include_names: *const *const c_char,
) -> NvrtcResult;
type NvrtcDestroyProgramFn = unsafe extern "C" fn(prog: *mut NvrtcProgram) -> NvrtcResult;
type NvrtcCompileProgramFn = unsafe extern "C" fn(
    prog: NvrtcProgram,
    num_options: i32,
    options: *const *const c_char,
) -> NvrtcResult;
type NvrtcGetSizeFn = unsafe extern "C" fn(prog: NvrtcProgram, size: *mut usize) -> NvrtcResult;
type NvrtcGetBytesFn = unsafe extern "C" fn(prog: NvrtcProgram, out: *mut c_char) -> NvrtcResult;
type NvrtcGetErrorStringFn = unsafe extern "C" fn(result: NvrtcResult) -> *const c_char;

struct NvrtcFns {
    create_program: NvrtcCreateProgramFn,
    destroy_program: NvrtcDestroyProgramFn,
    compile_program: NvrtcCompileProgramFn,
    get_log_size: NvrtcGetSizeFn,
    get_log: NvrtcGetBytesFn,
    get_ptx_size: NvrtcGetSizeFn,
    get_ptx: NvrtcGetBytesFn,
    get_error_string: NvrtcGetErrorStringFn,
}

struct NvrtcLibrary {
    _lib: Library,
    fns: NvrtcFns,
}

static NVRTC: OnceLock<std::result::Result<Arc<NvrtcLibrary>, String>> = OnceLock::new();

fn library() -> Result<Arc<NvrtcLibrary>> {
    let init = NVRTC.get_or_init(|| match NvrtcLibrary::load() {
        Ok(lib) => Ok(Arc::new(lib)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(lib) => Ok(Arc::clone(lib)),
        Err(msg) => Err(Error::device(format!("NVRTC unavailable: {msg}"))),
    }
}

impl NvrtcLibrary {
    fn load() -> Result<Self> {
        let candidates = [
            "libnvrtc.so",
            "libnvrtc.so.12",
            "libnvrtc.so.11.2",
            "nvrtc64_120_0.dll",
            "nvrtc64_112_0.dll",
            "libnvrtc.dylib",
        ];
        let lib = candidates
            .iter()
            // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
            .find_map(|candidate| unsafe { Library::new(candidate) }.ok())
            .ok_or_else(|| {
                Error::device(format!(
                    "failed to load NVRTC library (tried {})",
                    candidates.join(", ")
                ))
            })?;
        let fns = NvrtcFns {
            create_program: load_symbol(&lib, b"nvrtcCreateProgram\0")?,
            destroy_program: load_symbol(&lib, b"nvrtcDestroyProgram\0")?,
            compile_program: load_symbol(&lib, b"nvrtcCompileProgram\0")?,
            get_log_size: load_symbol(&lib, b"nvrtcGetProgramLogSize\0")?,
            get_log: load_symbol(&lib, b"nvrtcGetProgramLog\0")?,
            get_ptx_size: load_symbol(&lib, b"nvrtcGetPTXSize\0")?,
            get_ptx: load_symbol(&lib, b"nvrtcGetPTX\0")?,
            get_error_string: load_symbol(&lib, b"nvrtcGetErrorString\0")?,
        };
        Ok(Self { _lib: lib, fns })
    }

    fn error_string(&self, code: NvrtcResult) -> String {
        // SAFETY: nvrtcGetErrorString returns a static NUL-terminated string for any code.
        let ptr = unsafe { (self.fns.get_error_string)(code) };
        if ptr.is_null() {
            return format!("NVRTC error {code}");
        }
        // SAFETY: Non-null pointer to a static C string owned by NVRTC.
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    fn check(&self, code: NvrtcResult, op: &str) -> Result<()> {
        if code == NVRTC_SUCCESS {
            Ok(())
        } else {
            Err(Error::device(format!(
                "NVRTC call {op} failed: {}",
                self.error_string(code)
            )))
        }
    }
}

pub fn is_available() -> bool {
    library().is_ok()
}

/// [`DeviceCompiler`] over NVRTC, producing PTX.
pub struct NvrtcCompiler {
    lib: Arc<NvrtcLibrary>,
}

impl NvrtcCompiler {
    pub fn new() -> Result<Self> {
        Ok(Self { lib: library()? })
    }
}

impl DeviceCompiler for NvrtcCompiler {
    fn name(&self) -> &str {
        "nvrtc"
    }

    fn create_program(&self, source: &str, file_name: &str) -> Result<Box<dyn CompilerProgram>> {
        let c_source =
            CString::new(source).map_err(|_| Error::config("kernel source contains NUL byte"))?;
        let c_name =
            CString::new(file_name).map_err(|_| Error::config("file name contains NUL byte"))?;
        let mut program: NvrtcProgram = std::ptr::null_mut();
        // SAFETY: All pointers are valid for the duration of the call; no headers are passed.
        let code = unsafe {
            (self.lib.fns.create_program)(
                &mut program as *mut NvrtcProgram,
                c_source.as_ptr(),
                c_name.as_ptr(),
                0,
                std::ptr::null(),
                std::ptr::null(),
            )
        };
        self.lib.check(code, "nvrtcCreateProgram")?;
        Ok(Box::new(NvrtcProgramHandle {
            lib: Arc::clone(&self.lib),
            program: program as usize,
        }))
    }
}

struct NvrtcProgramHandle {
    lib: Arc<NvrtcLibrary>,
    // Stored as usize so the program is Send.
    program: usize,
}

impl NvrtcProgramHandle {
    fn ptr(&self) -> NvrtcProgram {
        self.program as NvrtcProgram
    }

    fn read(&self, size_fn: NvrtcGetSizeFn, bytes_fn: NvrtcGetBytesFn, op: &str) -> Result<Vec<u8>> {
        let mut size = 0usize;
        // SAFETY: Program handle is live; `size` is a valid out pointer.
        let code = unsafe { size_fn(self.ptr(), &mut size as *mut usize) };
        self.lib.check(code, op)?;
        let mut out = vec![0u8; size];
        if size == 0 {
            return Ok(out);
        }
        // SAFETY: `out` holds exactly the size NVRTC reported for this buffer.
        let code = unsafe { bytes_fn(self.ptr(), out.as_mut_ptr() as *mut c_char) };
        self.lib.check(code, op)?;
        Ok(out)
    }
}

impl CompilerProgram for NvrtcProgramHandle {
    fn compile(&mut self, options: &CompileOptions) -> Result<CompileStatus> {
        let flags = options
            .flags()
            .into_iter()
            .map(CString::new)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::config("compile option contains NUL byte"))?;
        let ptrs: Vec<*const c_char> = flags.iter().map(|flag| flag.as_ptr()).collect();
        // SAFETY: Program handle is live; option pointers outlive the call.
        let code = unsafe {
            (self.lib.fns.compile_program)(self.ptr(), ptrs.len() as i32, ptrs.as_ptr())
        };
        if code == NVRTC_SUCCESS {
            Ok(CompileStatus::Success)
        } else {
            Ok(CompileStatus::Failed(self.lib.error_string(code)))
        }
    }

    fn log(&self) -> Result<String> {
        let mut bytes = self.read(
            self.lib.fns.get_log_size,
            self.lib.fns.get_log,
            "nvrtcGetProgramLog",
        )?;
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// PTX including its trailing NUL, ready for `cuModuleLoadDataEx`.
    fn binary(&self) -> Result<Vec<u8>> {
        self.read(self.lib.fns.get_ptx_size, self.lib.fns.get_ptx, "nvrtcGetPTX")
    }
}

impl Drop for NvrtcProgramHandle {
    fn drop(&mut self) {
        let mut program = self.ptr();
        // SAFETY: Program was created by this library and is destroyed once on drop.
        let _ = unsafe { (self.lib.fns.destroy_program)(&mut program as *mut NvrtcProgram) };
        self.program = 0;
    }
}
