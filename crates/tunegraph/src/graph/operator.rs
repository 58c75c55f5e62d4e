use std::fmt;

use serde::{Deserialize, Serialize};

use super::{FusedExpr, OpId, Shape, TensorId};

/// Operator kinds; one of the three components of a kernel registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    MatMul,
    BatchNorm,
    MaxPool,
    AvgPool,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
    Abs,
    Identity,
    Flatten,
    Reshape,
    Concat,
    Gather,
    ReduceMean,
    /// Fused element-wise expression compiled just in time.
    MemBound,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::MatMul => "MatMul",
            OpKind::BatchNorm => "BatchNorm",
            OpKind::MaxPool => "MaxPool",
            OpKind::AvgPool => "AvgPool",
            OpKind::Add => "Add",
            OpKind::Sub => "Sub",
            OpKind::Mul => "Mul",
            OpKind::Div => "Div",
            OpKind::Pow => "Pow",
            OpKind::Relu => "Relu",
            OpKind::Sigmoid => "Sigmoid",
            OpKind::Tanh => "Tanh",
            OpKind::Softmax => "Softmax",
            OpKind::Abs => "Abs",
            OpKind::Identity => "Identity",
            OpKind::Flatten => "Flatten",
            OpKind::Reshape => "Reshape",
            OpKind::Concat => "Concat",
            OpKind::Gather => "Gather",
            OpKind::ReduceMean => "ReduceMean",
            OpKind::MemBound => "MemBound",
        }
    }

    pub fn is_elementwise_binary(self) -> bool {
        matches!(
            self,
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::Pow
        )
    }

    pub fn is_elementwise_unary(self) -> bool {
        matches!(
            self,
            OpKind::Relu | OpKind::Sigmoid | OpKind::Tanh | OpKind::Abs
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Activation fused into the tail of a matmul.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    None,
    Relu,
    Sigmoid,
    Tanh,
}

impl Activation {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::None => x,
            Activation::Relu => x.max(0.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Tanh => x.tanh(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MatMulOptions {
    pub trans_a: bool,
    pub trans_b: bool,
    /// Broadcast-added to the product before the activation.
    pub bias: Option<TensorId>,
    pub act: Activation,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormOptions {
    pub momentum: f32,
    pub eps: f32,
    /// Must be `false`: only inference-mode normalization is executable.
    pub training: bool,
}

impl Default for BatchNormOptions {
    fn default() -> Self {
        Self {
            momentum: 0.9,
            eps: 1e-5,
            training: false,
        }
    }
}

/// Window geometry for NCHW pooling: `(h, w)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolWindow {
    pub kernel: (usize, usize),
    pub dilation: (usize, usize),
    pub padding: (usize, usize),
    pub stride: (usize, usize),
}

impl PoolWindow {
    pub fn new(kh: usize, kw: usize) -> Self {
        Self {
            kernel: (kh, kw),
            dilation: (1, 1),
            padding: (0, 0),
            stride: (kh, kw),
        }
    }

    pub fn with_stride(mut self, sh: usize, sw: usize) -> Self {
        self.stride = (sh, sw);
        self
    }

    pub fn with_padding(mut self, ph: usize, pw: usize) -> Self {
        self.padding = (ph, pw);
        self
    }

    pub fn with_dilation(mut self, dh: usize, dw: usize) -> Self {
        self.dilation = (dh, dw);
        self
    }
}

/// Kind-specific attributes, already normalized (axes non-negative, sorted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpAttrs {
    None,
    MatMul {
        trans_a: bool,
        trans_b: bool,
        has_bias: bool,
        act: Activation,
    },
    BatchNorm {
        momentum: f32,
        eps: f32,
    },
    Pool(PoolWindow),
    Reshape {
        shape: Shape,
    },
    Concat {
        axis: usize,
    },
    Gather {
        axis: usize,
    },
    ReduceMean {
        axes: Vec<usize>,
        keep_dims: bool,
    },
    Softmax {
        axis: usize,
    },
    MemBound {
        expr: FusedExpr,
    },
}

#[derive(Debug, Clone)]
pub struct Operator {
    id: OpId,
    kind: OpKind,
    inputs: Vec<TensorId>,
    output: TensorId,
    attrs: OpAttrs,
}

impl Operator {
    pub(crate) fn new(kind: OpKind, inputs: Vec<TensorId>, output: TensorId, attrs: OpAttrs) -> Self {
        Operator {
            id: OpId::fresh(),
            kind,
            inputs,
            output,
            attrs,
        }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn output(&self) -> TensorId {
        self.output
    }

    pub fn attrs(&self) -> &OpAttrs {
        &self.attrs
    }

    pub fn fused_expr(&self) -> Option<&FusedExpr> {
        match &self.attrs {
            OpAttrs::MemBound { expr } => Some(expr),
            _ => None,
        }
    }
}
