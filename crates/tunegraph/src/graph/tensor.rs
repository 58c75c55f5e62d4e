use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::{DType, Shape};
use crate::runtime::DeviceAddr;

// Tensors and operators share one counter so identities never collide in a process.
static NEXT_GUID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_guid() -> u64 {
    NEXT_GUID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(u64);

impl TensorId {
    pub(crate) fn fresh() -> Self {
        TensorId(next_guid())
    }

    pub fn guid(self) -> u64 {
        self.0
    }

    /// Variable name the tensor carries in synthesized kernels.
    pub fn var_name(self) -> String {
        format!("var_{}", self.0)
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(u64);

impl OpId {
    pub(crate) fn fresh() -> Self {
        OpId(next_guid())
    }

    pub fn guid(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// A node of the dataflow graph: static shape and dtype, an optional device
/// binding, and at most one producing operator.
#[derive(Debug, Clone)]
pub struct Tensor {
    id: TensorId,
    shape: Shape,
    dtype: DType,
    addr: Option<DeviceAddr>,
    producer: Option<OpId>,
}

impl Tensor {
    pub(crate) fn new(shape: Shape, dtype: DType) -> Self {
        Tensor {
            id: TensorId::fresh(),
            shape,
            dtype,
            addr: None,
            producer: None,
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn addr(&self) -> Option<DeviceAddr> {
        self.addr
    }

    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    pub fn element_count(&self) -> usize {
        self.shape.element_count().unwrap_or(usize::MAX)
    }

    pub fn byte_len(&self) -> usize {
        self.element_count().saturating_mul(self.dtype.size_in_bytes())
    }

    pub(crate) fn set_producer(&mut self, op: OpId) {
        self.producer = Some(op);
    }

    pub(crate) fn bind(&mut self, addr: DeviceAddr) {
        self.addr = Some(addr);
    }
}
