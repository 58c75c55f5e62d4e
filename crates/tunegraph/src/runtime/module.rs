use super::{FunctionHandle, ModuleHandle, Runtime};
use crate::error::Result;

/// A loaded module that is unloaded when the guard goes out of scope, on the
/// success path and on every error path alike.
pub struct ScopedModule<'a> {
    runtime: &'a dyn Runtime,
    handle: ModuleHandle,
}

impl<'a> ScopedModule<'a> {
    pub fn load(runtime: &'a dyn Runtime, binary: &[u8]) -> Result<Self> {
        let handle = runtime.load_module(binary)?;
        Ok(Self { runtime, handle })
    }

    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn function(&self, name: &str) -> Result<FunctionHandle> {
        self.runtime.get_function(self.handle, name)
    }
}

impl Drop for ScopedModule<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.runtime.unload_module(self.handle) {
            tracing::warn!(module = self.handle.0, error = %err, "failed to unload module");
        }
    }
}
