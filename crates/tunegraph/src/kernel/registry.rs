//! Kernel registry keyed by `(device, op kind, dtype)`.
//!
//! Backend crates contribute registrar functions to [`KERNEL_REGISTRARS`];
//! the process-wide registry returned by [`global`] runs all of them once on
//! first use. Local registries built with [`KernelRegistry::new`] start empty
//! and are filled explicitly, which is what tests use.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use super::Kernel;
use crate::error::{Error, Result};
use crate::graph::{DType, OpKind};
use crate::runtime::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelKey {
    pub device: Device,
    pub op: OpKind,
    pub dtype: DType,
}

impl KernelKey {
    pub fn new(device: Device, op: OpKind, dtype: DType) -> Self {
        Self { device, op, dtype }
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device, self.op, self.dtype)
    }
}

struct RegisteredKernel {
    name: String,
    kernel: Arc<dyn Kernel>,
}

pub struct KernelRegistry {
    kernels: RwLock<HashMap<KernelKey, RegisteredKernel>>,
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            kernels: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `kernel` under `key`, replacing any previous entry.
    pub fn register(&self, key: KernelKey, name: impl Into<String>, kernel: Arc<dyn Kernel>) {
        let name = name.into();
        let previous = self
            .kernels
            .write()
            .expect("kernel registry poisoned")
            .insert(key, RegisteredKernel { name: name.clone(), kernel });
        if let Some(previous) = previous {
            tracing::debug!(%key, old = %previous.name, new = %name, "kernel replaced");
        }
    }

    /// Resolves a kernel without touching any device.
    pub fn lookup(&self, device: Device, op: OpKind, dtype: DType) -> Result<Arc<dyn Kernel>> {
        self.kernels
            .read()
            .expect("kernel registry poisoned")
            .get(&KernelKey::new(device, op, dtype))
            .map(|entry| Arc::clone(&entry.kernel))
            .ok_or_else(|| Error::unsupported(device, op, dtype))
    }

    /// Diagnostic name the kernel was registered under.
    pub fn kernel_name(&self, key: &KernelKey) -> Option<String> {
        self.kernels
            .read()
            .expect("kernel registry poisoned")
            .get(key)
            .map(|entry| entry.name.clone())
    }

    pub fn contains(&self, key: &KernelKey) -> bool {
        self.kernels
            .read()
            .expect("kernel registry poisoned")
            .contains_key(key)
    }

    pub fn keys(&self) -> Vec<KernelKey> {
        let mut keys: Vec<KernelKey> = self
            .kernels
            .read()
            .expect("kernel registry poisoned")
            .keys()
            .copied()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.kernels.read().expect("kernel registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registrars run against the global registry on first access.
#[linkme::distributed_slice]
pub static KERNEL_REGISTRARS: [fn(&KernelRegistry)] = [..];

static GLOBAL_REGISTRY: OnceLock<KernelRegistry> = OnceLock::new();

pub fn global() -> &'static KernelRegistry {
    GLOBAL_REGISTRY.get_or_init(|| {
        let registry = KernelRegistry::new();
        for registrar in KERNEL_REGISTRARS.iter() {
            registrar(&registry);
        }
        tracing::debug!(kernels = registry.len(), "kernel registry initialized");
        registry
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelContext;

    struct NoopKernel;

    impl Kernel for NoopKernel {
        fn compute(&self, _ctx: &KernelContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_of_unregistered_triple_is_unsupported() {
        let registry = KernelRegistry::new();
        registry.register(
            KernelKey::new(Device::Host, OpKind::Add, DType::Float32),
            "noop",
            Arc::new(NoopKernel),
        );
        assert!(registry.lookup(Device::Host, OpKind::Add, DType::Float32).is_ok());
        let err = registry
            .lookup(Device::Cuda, OpKind::Add, DType::Float32)
            .err()
            .expect("cuda add is not registered");
        assert!(matches!(
            err,
            Error::UnsupportedOperation {
                device: Device::Cuda,
                op: OpKind::Add,
                dtype: DType::Float32
            }
        ));
        assert!(registry.lookup(Device::Host, OpKind::Add, DType::Int32).is_err());
    }

    #[test]
    fn register_replaces_and_keys_are_sorted() {
        let registry = KernelRegistry::new();
        let add = KernelKey::new(Device::Host, OpKind::Add, DType::Float32);
        let matmul = KernelKey::new(Device::Host, OpKind::MatMul, DType::Float32);
        registry.register(add, "first", Arc::new(NoopKernel));
        registry.register(matmul, "mm", Arc::new(NoopKernel));
        registry.register(add, "second", Arc::new(NoopKernel));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.kernel_name(&add).as_deref(), Some("second"));
        assert_eq!(registry.keys(), vec![matmul, add]);
    }
}
