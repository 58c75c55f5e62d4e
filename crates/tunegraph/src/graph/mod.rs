//! Dataflow graph of tensors and operators.
//!
//! Every builder function takes its inputs, kind-specific attributes, and an
//! optional pre-bound output tensor:
//!
//! * with `Some(output)` the new operator writes into exactly that tensor and
//!   its id is returned unchanged; the tensor must match the inferred shape and
//!   dtype and must not already have a producer;
//! * with `None` a fresh output tensor with the inferred shape and dtype is
//!   created and returned.
//!
//! Validation runs before anything is committed, so a rejected construction
//! leaves the graph untouched.

mod dtype;
pub mod expr;
mod infer;
mod operator;
pub mod shape;
mod tensor;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

pub use dtype::DType;
pub use expr::{BinaryOp, FusedExpr, UnaryOp};
pub use operator::{
    Activation, BatchNormOptions, MatMulOptions, OpAttrs, OpKind, Operator, PoolWindow,
};
pub use shape::Shape;
pub use tensor::{OpId, Tensor, TensorId};

use crate::error::{Error, Result};
use crate::runtime::{bytes, DeviceAddr, Runtime};
use infer::Inferred;

struct Storage {
    runtime: Arc<dyn Runtime>,
    allocations: Vec<DeviceAddr>,
}

#[derive(Default)]
pub struct Graph {
    tensors: BTreeMap<TensorId, Tensor>,
    ops: Vec<Operator>,
    op_index: HashMap<OpId, usize>,
    consumers: HashMap<TensorId, Vec<OpId>>,
    storage: Option<Storage>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a graph input (or a tensor to be used as a pre-bound output later).
    pub fn add_tensor<D: AsRef<[usize]>>(&mut self, dims: D, dtype: DType) -> Result<TensorId> {
        let tensor = Tensor::new(Shape::new(dims), dtype);
        tensor.shape().byte_len(dtype.size_in_bytes())?;
        let id = tensor.id();
        self.tensors.insert(id, tensor);
        Ok(id)
    }

    pub fn tensor(&self, id: TensorId) -> Result<&Tensor> {
        self.tensors
            .get(&id)
            .ok_or_else(|| Error::config(format!("unknown tensor {id}")))
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.values()
    }

    pub fn operator(&self, id: OpId) -> Result<&Operator> {
        self.op_index
            .get(&id)
            .map(|&idx| &self.ops[idx])
            .ok_or_else(|| Error::config(format!("unknown operator {id}")))
    }

    /// Operators in insertion order.
    pub fn operators(&self) -> &[Operator] {
        &self.ops
    }

    pub fn consumers(&self, id: TensorId) -> &[OpId] {
        self.consumers.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn producer(&self, id: TensorId) -> Result<Option<OpId>> {
        Ok(self.tensor(id)?.producer())
    }

    // ---- builders -------------------------------------------------------

    pub fn matmul(
        &mut self,
        a: TensorId,
        b: TensorId,
        output: Option<TensorId>,
        options: MatMulOptions,
    ) -> Result<TensorId> {
        let bias = match options.bias {
            Some(id) => Some(self.tensor(id)?),
            None => None,
        };
        let inferred = infer::matmul(
            self.tensor(a)?,
            self.tensor(b)?,
            bias,
            options.trans_a,
            options.trans_b,
        )?;
        let mut inputs = vec![a, b];
        inputs.extend(options.bias);
        let attrs = OpAttrs::MatMul {
            trans_a: options.trans_a,
            trans_b: options.trans_b,
            has_bias: options.bias.is_some(),
            act: options.act,
        };
        self.commit(OpKind::MatMul, inputs, attrs, inferred, output)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn batch_norm(
        &mut self,
        input: TensorId,
        output: Option<TensorId>,
        mean: TensorId,
        var: TensorId,
        scale: TensorId,
        bias: TensorId,
        options: BatchNormOptions,
    ) -> Result<TensorId> {
        let inferred = infer::batch_norm(
            self.tensor(input)?,
            self.tensor(mean)?,
            self.tensor(var)?,
            self.tensor(scale)?,
            self.tensor(bias)?,
            options.training,
        )?;
        if !(options.eps.is_finite() && options.eps >= 0.0) {
            return Err(Error::config(format!(
                "BatchNorm eps must be finite and non-negative, got {}",
                options.eps
            )));
        }
        let attrs = OpAttrs::BatchNorm {
            momentum: options.momentum,
            eps: options.eps,
        };
        self.commit(
            OpKind::BatchNorm,
            vec![input, mean, var, scale, bias],
            attrs,
            inferred,
            output,
        )
    }

    pub fn max_pool(
        &mut self,
        input: TensorId,
        output: Option<TensorId>,
        window: PoolWindow,
    ) -> Result<TensorId> {
        self.pool(OpKind::MaxPool, input, output, window)
    }

    pub fn avg_pool(
        &mut self,
        input: TensorId,
        output: Option<TensorId>,
        window: PoolWindow,
    ) -> Result<TensorId> {
        self.pool(OpKind::AvgPool, input, output, window)
    }

    fn pool(
        &mut self,
        kind: OpKind,
        input: TensorId,
        output: Option<TensorId>,
        window: PoolWindow,
    ) -> Result<TensorId> {
        let inferred = infer::pool(kind, self.tensor(input)?, &window)?;
        self.commit(kind, vec![input], OpAttrs::Pool(window), inferred, output)
    }

    pub fn add(&mut self, a: TensorId, b: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        self.binary(OpKind::Add, a, b, output)
    }

    pub fn sub(&mut self, a: TensorId, b: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        self.binary(OpKind::Sub, a, b, output)
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        self.binary(OpKind::Mul, a, b, output)
    }

    pub fn div(&mut self, a: TensorId, b: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        self.binary(OpKind::Div, a, b, output)
    }

    pub fn pow(&mut self, a: TensorId, b: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        self.binary(OpKind::Pow, a, b, output)
    }

    fn binary(
        &mut self,
        kind: OpKind,
        a: TensorId,
        b: TensorId,
        output: Option<TensorId>,
    ) -> Result<TensorId> {
        let inferred = infer::elementwise_binary(kind, self.tensor(a)?, self.tensor(b)?)?;
        self.commit(kind, vec![a, b], OpAttrs::None, inferred, output)
    }

    pub fn relu(&mut self, x: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        self.unary(OpKind::Relu, x, output)
    }

    pub fn sigmoid(&mut self, x: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        self.unary(OpKind::Sigmoid, x, output)
    }

    pub fn tanh(&mut self, x: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        self.unary(OpKind::Tanh, x, output)
    }

    pub fn abs(&mut self, x: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        self.unary(OpKind::Abs, x, output)
    }

    pub fn identity(&mut self, x: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        self.unary(OpKind::Identity, x, output)
    }

    fn unary(&mut self, kind: OpKind, x: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        let inferred = infer::elementwise_unary(self.tensor(x)?)?;
        self.commit(kind, vec![x], OpAttrs::None, inferred, output)
    }

    /// Softmax over the last axis.
    pub fn softmax(&mut self, x: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        let (shape, dtype, axis) = infer::softmax(self.tensor(x)?)?;
        self.commit(
            OpKind::Softmax,
            vec![x],
            OpAttrs::Softmax { axis },
            (shape, dtype),
            output,
        )
    }

    /// Collapses to `[d0, d1 * d2 * ...]`.
    pub fn flatten(&mut self, x: TensorId, output: Option<TensorId>) -> Result<TensorId> {
        let inferred = infer::flatten(self.tensor(x)?)?;
        self.commit(OpKind::Flatten, vec![x], OpAttrs::None, inferred, output)
    }

    pub fn reshape(
        &mut self,
        data: TensorId,
        output: Option<TensorId>,
        shape: &[usize],
    ) -> Result<TensorId> {
        let inferred = infer::reshape(self.tensor(data)?, shape)?;
        let attrs = OpAttrs::Reshape {
            shape: inferred.0.clone(),
        };
        self.commit(OpKind::Reshape, vec![data], attrs, inferred, output)
    }

    pub fn concat(
        &mut self,
        inputs: &[TensorId],
        output: Option<TensorId>,
        axis: isize,
    ) -> Result<TensorId> {
        let tensors = self.tensors_of(inputs)?;
        let (shape, dtype, axis) = infer::concat(&tensors, axis)?;
        self.commit(
            OpKind::Concat,
            inputs.to_vec(),
            OpAttrs::Concat { axis },
            (shape, dtype),
            output,
        )
    }

    pub fn gather(
        &mut self,
        data: TensorId,
        indices: TensorId,
        output: Option<TensorId>,
        axis: isize,
    ) -> Result<TensorId> {
        let (shape, dtype, axis) =
            infer::gather(self.tensor(data)?, self.tensor(indices)?, axis)?;
        self.commit(
            OpKind::Gather,
            vec![data, indices],
            OpAttrs::Gather { axis },
            (shape, dtype),
            output,
        )
    }

    /// `axes = None` reduces over every axis.
    pub fn reduce_mean(
        &mut self,
        data: TensorId,
        output: Option<TensorId>,
        axes: Option<&[isize]>,
        keep_dims: bool,
    ) -> Result<TensorId> {
        let (shape, dtype, axes) = infer::reduce_mean(self.tensor(data)?, axes, keep_dims)?;
        self.commit(
            OpKind::ReduceMean,
            vec![data],
            OpAttrs::ReduceMean { axes, keep_dims },
            (shape, dtype),
            output,
        )
    }

    /// Fused element-wise operator; `expr` refers to `inputs` by position.
    pub fn mem_bound(
        &mut self,
        inputs: &[TensorId],
        output: Option<TensorId>,
        expr: FusedExpr,
    ) -> Result<TensorId> {
        let tensors = self.tensors_of(inputs)?;
        let inferred = infer::mem_bound(&tensors, &expr)?;
        self.commit(
            OpKind::MemBound,
            inputs.to_vec(),
            OpAttrs::MemBound { expr },
            inferred,
            output,
        )
    }

    fn tensors_of(&self, ids: &[TensorId]) -> Result<Vec<&Tensor>> {
        ids.iter().map(|&id| self.tensor(id)).collect()
    }

    fn check_output(
        &self,
        kind: OpKind,
        output: TensorId,
        inputs: &[TensorId],
        inferred: &Inferred,
    ) -> Result<()> {
        let tensor = self.tensor(output)?;
        if let Some(producer) = tensor.producer() {
            return Err(Error::config(format!(
                "{kind} output {output} is already produced by {producer}"
            )));
        }
        if inputs.contains(&output) {
            return Err(Error::config(format!(
                "{kind} output {output} is also one of its inputs"
            )));
        }
        let (shape, dtype) = inferred;
        if tensor.shape() != shape || tensor.dtype() != *dtype {
            return Err(Error::config(format!(
                "{kind} output {output} is {} {} but the operator produces {dtype} {shape}",
                tensor.dtype(),
                tensor.shape()
            )));
        }
        Ok(())
    }

    fn commit(
        &mut self,
        kind: OpKind,
        inputs: Vec<TensorId>,
        attrs: OpAttrs,
        inferred: Inferred,
        output: Option<TensorId>,
    ) -> Result<TensorId> {
        let output = match output {
            Some(id) => {
                self.check_output(kind, id, &inputs, &inferred)?;
                id
            }
            None => {
                let (shape, dtype) = inferred;
                shape.byte_len(dtype.size_in_bytes())?;
                let tensor = Tensor::new(shape, dtype);
                let id = tensor.id();
                self.tensors.insert(id, tensor);
                id
            }
        };

        let op = Operator::new(kind, inputs, output, attrs);
        let op_id = op.id();
        if let Some(tensor) = self.tensors.get_mut(&output) {
            tensor.set_producer(op_id);
        }
        for input in op.inputs() {
            let consumers = self.consumers.entry(*input).or_default();
            if !consumers.contains(&op_id) {
                consumers.push(op_id);
            }
        }
        self.op_index.insert(op_id, self.ops.len());
        self.ops.push(op);
        Ok(output)
    }

    /// Operators ordered so every producer precedes its consumers. Ties keep
    /// insertion order. A cycle is a configuration error.
    pub fn topo_order(&self) -> Result<Vec<OpId>> {
        let mut pending: Vec<usize> = self
            .ops
            .iter()
            .map(|op| {
                op.inputs()
                    .iter()
                    .filter(|id| matches!(self.tensors.get(*id), Some(t) if t.producer().is_some()))
                    .count()
            })
            .collect();
        let mut ready: VecDeque<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| idx)
            .collect();

        let mut order = Vec::with_capacity(self.ops.len());
        while let Some(idx) = ready.pop_front() {
            let op = &self.ops[idx];
            order.push(op.id());
            for consumer in self.consumers(op.output()) {
                let Some(&cidx) = self.op_index.get(consumer) else {
                    continue;
                };
                let uses = self.ops[cidx]
                    .inputs()
                    .iter()
                    .filter(|&&id| id == op.output())
                    .count();
                pending[cidx] -= uses;
                if pending[cidx] == 0 {
                    ready.push_back(cidx);
                }
            }
        }

        if order.len() != self.ops.len() {
            return Err(Error::config(format!(
                "graph contains a cycle: {} of {} operators are unreachable",
                self.ops.len() - order.len(),
                self.ops.len()
            )));
        }
        Ok(order)
    }

    // ---- storage --------------------------------------------------------

    /// Binds every unbound tensor to a fresh allocation on `runtime`. The
    /// allocations are owned by the graph and released when it is dropped.
    pub fn data_malloc(&mut self, runtime: Arc<dyn Runtime>) -> Result<()> {
        if let Some(storage) = &self.storage {
            if !Arc::ptr_eq(&storage.runtime, &runtime) {
                return Err(Error::config(format!(
                    "graph storage is already bound to runtime '{}'",
                    storage.runtime.name()
                )));
            }
        }
        let storage = self.storage.get_or_insert_with(|| Storage {
            runtime,
            allocations: Vec::new(),
        });
        for tensor in self.tensors.values_mut() {
            if tensor.addr().is_some() {
                continue;
            }
            let addr = storage.runtime.alloc(tensor.byte_len().max(1))?;
            storage.allocations.push(addr);
            tensor.bind(addr);
        }
        tracing::debug!(
            runtime = storage.runtime.name(),
            tensors = self.tensors.len(),
            "bound graph storage"
        );
        Ok(())
    }

    pub fn runtime(&self) -> Option<&Arc<dyn Runtime>> {
        self.storage.as_ref().map(|storage| &storage.runtime)
    }

    fn bound(&self, id: TensorId) -> Result<(&dyn Runtime, &Tensor, DeviceAddr)> {
        let tensor = self.tensor(id)?;
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| Error::config("graph storage is not bound; call data_malloc first"))?;
        let addr = tensor
            .addr()
            .ok_or_else(|| Error::config(format!("tensor {id} has no device storage")))?;
        Ok((storage.runtime.as_ref(), tensor, addr))
    }

    pub fn write_bytes(&self, id: TensorId, data: &[u8]) -> Result<()> {
        let (runtime, tensor, addr) = self.bound(id)?;
        if data.len() != tensor.byte_len() {
            return Err(Error::config(format!(
                "tensor {id} holds {} bytes, got {}",
                tensor.byte_len(),
                data.len()
            )));
        }
        runtime.copy_from_host(addr, data)
    }

    pub fn read_bytes(&self, id: TensorId) -> Result<Vec<u8>> {
        let (runtime, tensor, addr) = self.bound(id)?;
        let mut out = vec![0u8; tensor.byte_len()];
        runtime.copy_to_host(addr, &mut out)?;
        Ok(out)
    }

    pub fn write_f32(&self, id: TensorId, data: &[f32]) -> Result<()> {
        self.expect_dtype(id, DType::Float32)?;
        self.write_bytes(id, &bytes::f32_to_bytes(data))
    }

    pub fn read_f32(&self, id: TensorId) -> Result<Vec<f32>> {
        self.expect_dtype(id, DType::Float32)?;
        Ok(bytes::bytes_to_f32(&self.read_bytes(id)?))
    }

    pub fn write_i64(&self, id: TensorId, data: &[i64]) -> Result<()> {
        self.expect_dtype(id, DType::Int64)?;
        self.write_bytes(id, &bytes::i64_to_bytes(data))
    }

    pub fn write_i32(&self, id: TensorId, data: &[i32]) -> Result<()> {
        self.expect_dtype(id, DType::Int32)?;
        self.write_bytes(id, &bytes::i32_to_bytes(data))
    }

    fn expect_dtype(&self, id: TensorId, dtype: DType) -> Result<()> {
        let actual = self.tensor(id)?.dtype();
        if actual != dtype {
            return Err(Error::config(format!(
                "tensor {id} is {actual}, expected {dtype}"
            )));
        }
        Ok(())
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        let Some(storage) = self.storage.take() else {
            return;
        };
        for addr in storage.allocations {
            if let Err(err) = storage.runtime.free(addr) {
                tracing::warn!(addr, error = %err, "failed to release tensor storage");
            }
        }
    }
}
