//! Shape and dtype inference for every operator kind.
//!
//! These functions are pure: they inspect input metadata and either return the
//! output `(shape, dtype)` or a configuration error. Nothing is committed to the
//! graph until inference has succeeded.

use super::shape::normalize_axis;
use super::{DType, FusedExpr, OpKind, PoolWindow, Shape, Tensor};
use crate::error::{Error, Result};

pub(crate) type Inferred = (Shape, DType);

fn same_dtype(kind: OpKind, tensors: &[&Tensor]) -> Result<DType> {
    let first = tensors
        .first()
        .ok_or_else(|| Error::config(format!("{kind} requires at least one input")))?
        .dtype();
    for tensor in tensors {
        if tensor.dtype() != first {
            return Err(Error::config(format!(
                "{kind} inputs disagree on dtype: {first} vs {}",
                tensor.dtype()
            )));
        }
    }
    Ok(first)
}

pub(crate) fn elementwise_binary(kind: OpKind, a: &Tensor, b: &Tensor) -> Result<Inferred> {
    let dtype = same_dtype(kind, &[a, b])?;
    let shape = a.shape().broadcast(b.shape()).ok_or_else(|| {
        Error::config(format!(
            "{kind} operands {} and {} are not broadcast-compatible",
            a.shape(),
            b.shape()
        ))
    })?;
    Ok((shape, dtype))
}

pub(crate) fn elementwise_unary(x: &Tensor) -> Result<Inferred> {
    Ok((x.shape().clone(), x.dtype()))
}

pub(crate) fn softmax(x: &Tensor) -> Result<(Shape, DType, usize)> {
    if x.shape().rank() == 0 {
        return Err(Error::config("Softmax requires rank >= 1"));
    }
    Ok((x.shape().clone(), x.dtype(), x.shape().rank() - 1))
}

pub(crate) fn matmul(
    a: &Tensor,
    b: &Tensor,
    bias: Option<&Tensor>,
    trans_a: bool,
    trans_b: bool,
) -> Result<Inferred> {
    let dtype = same_dtype(OpKind::MatMul, &[a, b])?;
    let (ad, bd) = (a.shape().dims(), b.shape().dims());
    if ad.len() < 2 || bd.len() < 2 {
        return Err(Error::config(format!(
            "MatMul requires rank >= 2 operands, got {} and {}",
            a.shape(),
            b.shape()
        )));
    }
    let (m, k_a) = matrix_dims(ad, trans_a);
    let (k_b, n) = matrix_dims(bd, trans_b);
    if k_a != k_b {
        return Err(Error::config(format!(
            "MatMul contraction mismatch: {} (trans={trans_a}) x {} (trans={trans_b})",
            a.shape(),
            b.shape()
        )));
    }
    let batch_a = Shape::new(&ad[..ad.len() - 2]);
    let batch_b = Shape::new(&bd[..bd.len() - 2]);
    let batch = batch_a.broadcast(&batch_b).ok_or_else(|| {
        Error::config(format!(
            "MatMul batch dims {batch_a} and {batch_b} are not broadcast-compatible"
        ))
    })?;
    let mut dims = batch.dims().to_vec();
    dims.push(m);
    dims.push(n);
    let shape = Shape::new(dims);
    if let Some(bias) = bias {
        if bias.dtype() != dtype {
            return Err(Error::config(format!(
                "MatMul bias dtype {} differs from operand dtype {dtype}",
                bias.dtype()
            )));
        }
        if !bias.shape().broadcasts_to(&shape) {
            return Err(Error::config(format!(
                "MatMul bias {} does not broadcast to output {shape}",
                bias.shape()
            )));
        }
    }
    Ok((shape, dtype))
}

fn matrix_dims(dims: &[usize], transposed: bool) -> (usize, usize) {
    let rows = dims[dims.len() - 2];
    let cols = dims[dims.len() - 1];
    if transposed {
        (cols, rows)
    } else {
        (rows, cols)
    }
}

pub(crate) fn batch_norm(
    x: &Tensor,
    mean: &Tensor,
    var: &Tensor,
    scale: &Tensor,
    bias: &Tensor,
    training: bool,
) -> Result<Inferred> {
    if training {
        return Err(Error::config(
            "BatchNorm in training mode is not supported; only inference is executable",
        ));
    }
    let dtype = same_dtype(OpKind::BatchNorm, &[x, mean, var, scale, bias])?;
    if !dtype.is_float() {
        return Err(Error::config(format!("BatchNorm requires float32, got {dtype}")));
    }
    if x.shape().rank() < 2 {
        return Err(Error::config(format!(
            "BatchNorm input must be at least rank 2 (N, C, ...), got {}",
            x.shape()
        )));
    }
    let channels = Shape::new([x.shape().dims()[1]]);
    for (name, tensor) in [("mean", mean), ("var", var), ("scale", scale), ("bias", bias)] {
        if tensor.shape() != &channels {
            return Err(Error::config(format!(
                "BatchNorm {name} must have shape {channels}, got {}",
                tensor.shape()
            )));
        }
    }
    Ok((x.shape().clone(), dtype))
}

pub(crate) fn pool(kind: OpKind, x: &Tensor, window: &PoolWindow) -> Result<Inferred> {
    let dims = x.shape().dims();
    if dims.len() != 4 {
        return Err(Error::config(format!(
            "{kind} expects an NCHW input, got {}",
            x.shape()
        )));
    }
    if !x.dtype().is_float() {
        return Err(Error::config(format!("{kind} requires float32, got {}", x.dtype())));
    }
    let (kh, kw) = window.kernel;
    let (dh, dw) = window.dilation;
    let (sh, sw) = window.stride;
    if kh == 0 || kw == 0 || dh == 0 || dw == 0 || sh == 0 || sw == 0 {
        return Err(Error::config(format!(
            "{kind} kernel, dilation and stride must be positive: {window:?}"
        )));
    }
    let oh = pooled_extent(kind, dims[2], kh, dh, window.padding.0, sh)?;
    let ow = pooled_extent(kind, dims[3], kw, dw, window.padding.1, sw)?;
    Ok((Shape::new([dims[0], dims[1], oh, ow]), x.dtype()))
}

fn pooled_extent(
    kind: OpKind,
    input: usize,
    kernel: usize,
    dilation: usize,
    padding: usize,
    stride: usize,
) -> Result<usize> {
    let overflow = || Error::config(format!("{kind} window geometry overflows"));
    let span = dilation
        .checked_mul(kernel - 1)
        .and_then(|reach| reach.checked_add(1))
        .ok_or_else(overflow)?;
    let padded = padding
        .checked_mul(2)
        .and_then(|pad| pad.checked_add(input))
        .ok_or_else(overflow)?;
    if padded < span {
        return Err(Error::config(format!(
            "{kind} window span {span} exceeds padded input extent {padded}"
        )));
    }
    Ok((padded - span) / stride + 1)
}

pub(crate) fn flatten(x: &Tensor) -> Result<Inferred> {
    let dims = x.shape().dims();
    let outer = dims.first().copied().unwrap_or(1);
    let inner = dims
        .iter()
        .skip(1)
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| Error::config(format!("Flatten overflow for {}", x.shape())))?;
    Ok((Shape::new([outer, inner]), x.dtype()))
}

pub(crate) fn reshape(x: &Tensor, target: &[usize]) -> Result<Inferred> {
    let shape = Shape::new(target);
    let from = x.shape().element_count_or_error()?;
    let to = shape.element_count_or_error()?;
    if from != to {
        return Err(Error::config(format!(
            "Reshape from {} ({from} elements) to {shape} ({to} elements)",
            x.shape()
        )));
    }
    Ok((shape, x.dtype()))
}

pub(crate) fn concat(inputs: &[&Tensor], axis: isize) -> Result<(Shape, DType, usize)> {
    let dtype = same_dtype(OpKind::Concat, inputs)?;
    let first = inputs[0].shape();
    let axis = first.normalize_axis(axis)?;
    let mut dims = first.dims().to_vec();
    dims[axis] = 0;
    for tensor in inputs {
        let shape = tensor.shape();
        if shape.rank() != first.rank() {
            return Err(Error::config(format!(
                "Concat inputs disagree on rank: {first} vs {shape}"
            )));
        }
        for (idx, (&lhs, &rhs)) in first.dims().iter().zip(shape.dims()).enumerate() {
            if idx != axis && lhs != rhs {
                return Err(Error::config(format!(
                    "Concat inputs {first} and {shape} differ outside axis {axis}"
                )));
            }
        }
        dims[axis] += shape.dims()[axis];
    }
    Ok((Shape::new(dims), dtype, axis))
}

pub(crate) fn gather(data: &Tensor, indices: &Tensor, axis: isize) -> Result<(Shape, DType, usize)> {
    if !indices.dtype().is_index() {
        return Err(Error::config(format!(
            "Gather indices must be int32 or int64, got {}",
            indices.dtype()
        )));
    }
    let axis = data.shape().normalize_axis(axis)?;
    let dims = data.shape().dims();
    let mut out = dims[..axis].to_vec();
    out.extend_from_slice(indices.shape().dims());
    out.extend_from_slice(&dims[axis + 1..]);
    Ok((Shape::new(out), data.dtype(), axis))
}

pub(crate) fn reduce_mean(
    data: &Tensor,
    axes: Option<&[isize]>,
    keep_dims: bool,
) -> Result<(Shape, DType, Vec<usize>)> {
    if !data.dtype().is_float() {
        return Err(Error::config(format!(
            "ReduceMean requires float32, got {}",
            data.dtype()
        )));
    }
    let rank = data.shape().rank();
    let mut normalized = match axes {
        Some(axes) => axes
            .iter()
            .map(|&axis| normalize_axis(axis, rank))
            .collect::<Result<Vec<_>>>()?,
        None => (0..rank).collect(),
    };
    normalized.sort_unstable();
    normalized.dedup();
    let mut out = Vec::with_capacity(rank);
    for (axis, &dim) in data.shape().dims().iter().enumerate() {
        if normalized.contains(&axis) {
            if keep_dims {
                out.push(1);
            }
        } else {
            out.push(dim);
        }
    }
    Ok((Shape::new(out), data.dtype(), normalized))
}

pub(crate) fn mem_bound(inputs: &[&Tensor], expr: &FusedExpr) -> Result<Inferred> {
    if inputs.is_empty() {
        return Err(Error::config("MemBound requires at least one input"));
    }
    for tensor in inputs {
        if tensor.dtype() != DType::Float32 {
            return Err(Error::config(format!(
                "MemBound inputs must be float32, got {} for {}",
                tensor.dtype(),
                tensor.id()
            )));
        }
    }
    expr.validate(inputs.len())?;
    let mut shape = inputs[0].shape().clone();
    for tensor in &inputs[1..] {
        shape = shape.broadcast(tensor.shape()).ok_or_else(|| {
            Error::config(format!(
                "MemBound inputs {shape} and {} are not broadcast-compatible",
                tensor.shape()
            ))
        })?;
    }
    Ok((shape, DType::Float32))
}
