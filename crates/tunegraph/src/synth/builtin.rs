//! In-process synthesizer for fused element-wise expressions with broadcasting.

use std::fmt::Write as _;

use serde_json::json;

use super::{entry_point_for, SynthTarget, SynthesisRequest, SynthesisResponse, Synthesizer};
use crate::error::{Error, Result};
use crate::graph::{BinaryOp, DType, FusedExpr, Shape, UnaryOp};
use crate::runtime::LaunchConfig;

/// Block sizes the launch search considers, in order of preference on ties.
const BLOCK_CANDIDATES: [u32; 5] = [256, 128, 512, 64, 1024];

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinSynthesizer;

impl BuiltinSynthesizer {
    pub fn new() -> Self {
        Self
    }
}

/// Validated view of a request.
struct Plan {
    expr: FusedExpr,
    out: Shape,
    /// Per input, strides re-indexed against `out` (zero on broadcast axes).
    strides: Vec<Vec<usize>>,
    /// Inputs whose layout equals the output layout can be indexed linearly.
    linear: Vec<bool>,
    elements: u64,
}

impl Synthesizer for BuiltinSynthesizer {
    fn name(&self) -> &str {
        "builtin"
    }

    fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse> {
        let plan = plan(request)?;
        let (launch, waste) = choose_launch(plan.elements)?;
        let source = match request.target {
            SynthTarget::Cuda => emit_cuda(request, &plan),
            SynthTarget::HostIr => emit_host_ir(request, &plan),
        };
        Ok(SynthesisResponse {
            source,
            launch: launch.to_array(),
            aux: json!({
                "synthesizer": "builtin",
                "elements": plan.elements,
                "idle_threads": waste,
                "block_candidates": BLOCK_CANDIDATES,
            }),
        })
    }
}

fn plan(request: &SynthesisRequest) -> Result<Plan> {
    let inputs = request.input_names.len();
    if inputs == 0 {
        return Err(Error::synthesis("request has no inputs"));
    }
    if request.input_shapes.len() != inputs || request.input_dtypes.len() != inputs {
        return Err(Error::synthesis(format!(
            "request lists {inputs} input names, {} shapes and {} dtypes",
            request.input_shapes.len(),
            request.input_dtypes.len()
        )));
    }
    let float = DType::Float32.name();
    if let Some(dtype) = request
        .input_dtypes
        .iter()
        .chain(std::iter::once(&request.output_dtype))
        .find(|dtype| dtype.as_str() != float)
    {
        return Err(Error::synthesis(format!(
            "builtin synthesizer only handles {float}, got {dtype}"
        )));
    }

    let expr = FusedExpr::parse(&request.expression, &request.input_names)
        .map_err(|err| Error::synthesis(format!("cannot parse expression: {err}")))?;
    let out = Shape::new(&request.output_shape);
    let mut strides = Vec::with_capacity(inputs);
    let mut linear = Vec::with_capacity(inputs);
    for dims in &request.input_shapes {
        let shape = Shape::new(dims);
        let input_strides = shape
            .broadcast_strides(&out)
            .map_err(|err| Error::synthesis(err.to_string()))?;
        linear.push(shape == out);
        strides.push(input_strides);
    }
    let elements = out
        .element_count()
        .ok_or_else(|| Error::synthesis(format!("output {out} overflows")))?
        as u64;
    Ok(Plan {
        expr,
        out,
        strides,
        linear,
        elements,
    })
}

/// One-dimensional launch minimizing idle threads; returns the idle count too.
fn choose_launch(elements: u64) -> Result<(LaunchConfig, u64)> {
    let work = elements.max(1);
    let mut best: Option<(u64, u32, u64)> = None;
    for block in BLOCK_CANDIDATES {
        let grid = work.div_ceil(u64::from(block));
        let waste = grid * u64::from(block) - work;
        if best.map_or(true, |(best_waste, _, _)| waste < best_waste) {
            best = Some((waste, block, grid));
        }
    }
    let (waste, block, grid) =
        best.ok_or_else(|| Error::synthesis("no block size candidates"))?;
    let grid = u32::try_from(grid)
        .map_err(|_| Error::synthesis(format!("{elements} elements exceed the grid limit")))?;
    Ok((LaunchConfig::linear(grid, block), waste))
}

fn format_f32(value: f32) -> String {
    let base = value.to_string();
    let needs_decimal = !base.contains('.') && !base.contains('e') && !base.contains('E');
    let suffix = if needs_decimal { ".0f" } else { "f" };
    format!("{base}{suffix}")
}

fn cuda_expr(expr: &FusedExpr) -> String {
    match expr {
        FusedExpr::Input(index) => format!("v{index}"),
        FusedExpr::Const(value) if value.is_sign_negative() => format!("({})", format_f32(*value)),
        FusedExpr::Const(value) => format_f32(*value),
        FusedExpr::Unary(op, operand) => {
            let x = cuda_expr(operand);
            match op {
                UnaryOp::Neg => format!("(-{x})"),
                UnaryOp::Abs => format!("fabsf({x})"),
                UnaryOp::Relu => format!("fmaxf({x}, 0.0f)"),
                UnaryOp::Sigmoid => format!("(1.0f / (1.0f + expf(-{x})))"),
                UnaryOp::Tanh => format!("tanhf({x})"),
                UnaryOp::Exp => format!("expf({x})"),
                UnaryOp::Log => format!("logf({x})"),
                UnaryOp::Sqrt => format!("sqrtf({x})"),
            }
        }
        FusedExpr::Binary(op, lhs, rhs) => {
            let (a, b) = (cuda_expr(lhs), cuda_expr(rhs));
            match op {
                BinaryOp::Add => format!("({a} + {b})"),
                BinaryOp::Sub => format!("({a} - {b})"),
                BinaryOp::Mul => format!("({a} * {b})"),
                BinaryOp::Div => format!("({a} / {b})"),
                BinaryOp::Pow => format!("powf({a}, {b})"),
                BinaryOp::Max => format!("fmaxf({a}, {b})"),
                BinaryOp::Min => format!("fminf({a}, {b})"),
            }
        }
    }
}

fn cuda_offset(out: &[usize], strides: &[usize]) -> String {
    let out_strides = Shape::new(out).contiguous_strides();
    let terms: Vec<String> = (0..out.len())
        .filter(|&axis| strides[axis] != 0)
        .map(|axis| {
            format!(
                "((idx / {}LL) % {}LL) * {}LL",
                out_strides[axis], out[axis], strides[axis]
            )
        })
        .collect();
    if terms.is_empty() {
        "0".to_string()
    } else {
        terms.join(" + ")
    }
}

fn emit_cuda(request: &SynthesisRequest, plan: &Plan) -> String {
    let entry = entry_point_for(&request.func_name);
    let mut params: Vec<String> = request
        .input_names
        .iter()
        .map(|name| format!("const float* __restrict__ {name}"))
        .collect();
    params.push(format!("float* __restrict__ {}", request.output_name));

    let mut src = String::new();
    let _ = writeln!(src, "// {}", request.expression);
    let _ = writeln!(src, "extern \"C\" __global__ void {entry}({}) {{", params.join(", "));
    let _ = writeln!(
        src,
        "  const long long idx = (long long)blockIdx.x * blockDim.x + threadIdx.x;"
    );
    let _ = writeln!(src, "  if (idx >= {}LL) return;", plan.elements);
    for (index, name) in request.input_names.iter().enumerate() {
        let offset = if plan.linear[index] {
            "idx".to_string()
        } else {
            cuda_offset(plan.out.dims(), &plan.strides[index])
        };
        let _ = writeln!(src, "  const float v{index} = {name}[{offset}];");
    }
    let _ = writeln!(src, "  {}[idx] = {};", request.output_name, cuda_expr(&plan.expr));
    let _ = writeln!(src, "}}");
    src
}

fn postfix(expr: &FusedExpr, out: &mut Vec<String>) {
    match expr {
        FusedExpr::Input(index) => out.push(format!("load {index}")),
        FusedExpr::Const(value) => out.push(format!("const {value:?}")),
        FusedExpr::Unary(op, operand) => {
            postfix(operand, out);
            out.push(op.name().to_string());
        }
        FusedExpr::Binary(op, lhs, rhs) => {
            postfix(lhs, out);
            postfix(rhs, out);
            out.push(op.name().to_string());
        }
    }
}

fn join_usizes(values: &[usize]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn emit_host_ir(request: &SynthesisRequest, plan: &Plan) -> String {
    let mut src = String::new();
    let _ = writeln!(src, "# {}", request.expression);
    let _ = writeln!(src, ".kernel {}", entry_point_for(&request.func_name));
    let mut params = request.input_names.clone();
    params.push(request.output_name.clone());
    let _ = writeln!(src, ".params {}", params.join(" "));
    let _ = writeln!(src, ".dims {}", join_usizes(plan.out.dims()));
    for (index, strides) in plan.strides.iter().enumerate() {
        let _ = writeln!(src, ".strides {index} {}", join_usizes(strides));
    }
    let mut ops = Vec::new();
    postfix(&plan.expr, &mut ops);
    for op in ops {
        let _ = writeln!(src, "  {op}");
    }
    let _ = writeln!(src, "  store");
    let _ = writeln!(src, ".end");
    src
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: SynthTarget) -> SynthesisRequest {
        SynthesisRequest {
            input_shapes: vec![vec![4, 4], vec![4]],
            input_dtypes: vec!["float32".into(), "float32".into()],
            output_shape: vec![4, 4],
            output_dtype: "float32".into(),
            expression: "relu((var_1 + var_2))".into(),
            func_name: "mem_bound_7".into(),
            input_names: vec!["var_1".into(), "var_2".into()],
            output_name: "var_3".into(),
            target,
        }
    }

    #[test]
    fn launch_search_minimizes_idle_threads() {
        let (launch, waste) = choose_launch(16).unwrap();
        assert_eq!(launch.to_array(), [1, 1, 1, 64, 1, 1]);
        assert_eq!(waste, 48);

        let (launch, waste) = choose_launch(1024).unwrap();
        assert_eq!(launch.to_array(), [4, 1, 1, 256, 1, 1]);
        assert_eq!(waste, 0);
    }

    #[test]
    fn cuda_source_names_entry_point_and_broadcasts() {
        let response = BuiltinSynthesizer::new()
            .synthesize(&request(SynthTarget::Cuda))
            .unwrap();
        assert!(response
            .source
            .contains("extern \"C\" __global__ void mem_bound_7_kernel0("));
        assert!(response.source.contains("const float v0 = var_1[idx];"));
        assert!(response.source.contains("var_2[((idx / 1LL) % 4LL) * 1LL]"));
        assert!(response.source.contains("var_3[idx] = fmaxf((v0 + v1), 0.0f);"));
    }

    #[test]
    fn host_ir_is_postfix_with_strides() {
        let response = BuiltinSynthesizer::new()
            .synthesize(&request(SynthTarget::HostIr))
            .unwrap();
        let lines: Vec<&str> = response.source.lines().map(str::trim).collect();
        assert!(lines.contains(&".kernel mem_bound_7_kernel0"));
        assert!(lines.contains(&".params var_1 var_2 var_3"));
        assert!(lines.contains(&".strides 1 0 1"));
        let body: Vec<&str> = lines
            .iter()
            .copied()
            .skip_while(|line| !line.starts_with("load"))
            .collect();
        assert_eq!(body, vec!["load 0", "load 1", "add", "relu", "store", ".end"]);
    }

    #[test]
    fn non_float_requests_are_rejected() {
        let mut req = request(SynthTarget::Cuda);
        req.input_dtypes[1] = "int32".into();
        let err = BuiltinSynthesizer::new().synthesize(&req).unwrap_err();
        assert!(matches!(err, Error::Synthesis(_)));
    }
}
