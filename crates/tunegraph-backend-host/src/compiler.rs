//! Compiler for host kernel assembly.
//!
//! The source format is line oriented:
//!
//! ```text
//! # comment
//! .kernel mem_bound_7_kernel0
//! .params var_1 var_2 var_3
//! .dims 4 4
//! .strides 0 4 1
//! .strides 1 0 1
//!   load 0
//!   load 1
//!   add
//!   relu
//!   store
//! .end
//! ```
//!
//! The last parameter is the output; every other parameter is an input with
//! one `.strides` line re-indexing it against the output dims. The body is a
//! postfix program over an f32 stack terminated by `store`. A successful
//! compilation produces a bincode-encoded [`HostModule`].

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tunegraph::graph::{BinaryOp, UnaryOp};
use tunegraph::runtime::{CompileOptions, CompileStatus, CompilerProgram, DeviceCompiler};
use tunegraph::{Error, Result};

/// Architecture string the host compiler accepts.
pub const HOST_ARCH: &str = "host";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    Load(usize),
    Const(f32),
    Unary(UnaryOp),
    Binary(BinaryOp),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostKernelProgram {
    pub name: String,
    pub params: Vec<String>,
    pub dims: Vec<usize>,
    pub input_strides: Vec<Vec<usize>>,
    pub code: Vec<Instr>,
}

impl HostKernelProgram {
    pub fn input_count(&self) -> usize {
        self.params.len().saturating_sub(1)
    }

    pub fn extent(&self) -> usize {
        self.dims.iter().product()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostModule {
    pub kernels: Vec<HostKernelProgram>,
}

impl HostModule {
    pub fn decode(binary: &[u8]) -> Result<Self> {
        bincode::deserialize(binary)
            .map_err(|err| Error::device(format!("invalid host module image: {err}")))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn kernel(&self, name: &str) -> Option<&HostKernelProgram> {
        self.kernels.iter().find(|kernel| kernel.name == name)
    }
}

#[derive(Debug, Default)]
pub struct HostCompiler;

impl DeviceCompiler for HostCompiler {
    fn name(&self) -> &str {
        "host-ir"
    }

    fn create_program(&self, source: &str, file_name: &str) -> Result<Box<dyn CompilerProgram>> {
        Ok(Box::new(HostProgram {
            source: source.to_string(),
            file_name: file_name.to_string(),
            log: String::new(),
            binary: Vec::new(),
        }))
    }
}

struct HostProgram {
    source: String,
    file_name: String,
    log: String,
    binary: Vec<u8>,
}

impl CompilerProgram for HostProgram {
    fn compile(&mut self, options: &CompileOptions) -> Result<CompileStatus> {
        self.binary.clear();
        self.log.clear();
        let _ = writeln!(
            self.log,
            "{}: compiling for {} (fmad={})",
            self.file_name, options.arch, options.fmad
        );

        if options.arch != HOST_ARCH {
            let _ = writeln!(
                self.log,
                "{}: error: unsupported architecture '{}'",
                self.file_name, options.arch
            );
            return Ok(CompileStatus::Failed(format!(
                "unsupported architecture '{}'",
                options.arch
            )));
        }

        // The interpreter rounds every multiply and add separately.
        if options.fmad {
            let _ = writeln!(
                self.log,
                "{}: error: fused multiply-add is not supported",
                self.file_name
            );
            return Ok(CompileStatus::Failed(
                "fused multiply-add is not supported".to_string(),
            ));
        }

        match parse_module(&self.source) {
            Ok(module) => {
                for kernel in &module.kernels {
                    let _ = writeln!(
                        self.log,
                        "{}: kernel {} ({} params, {} instructions)",
                        self.file_name,
                        kernel.name,
                        kernel.params.len(),
                        kernel.code.len()
                    );
                }
                self.binary = module.encode()?;
                Ok(CompileStatus::Success)
            }
            Err(diag) => {
                let _ = writeln!(
                    self.log,
                    "{}:{}: error: {}",
                    self.file_name, diag.line, diag.message
                );
                Ok(CompileStatus::Failed(format!(
                    "line {}: {}",
                    diag.line, diag.message
                )))
            }
        }
    }

    fn log(&self) -> Result<String> {
        Ok(self.log.clone())
    }

    fn binary(&self) -> Result<Vec<u8>> {
        Ok(self.binary.clone())
    }
}

#[derive(Debug)]
struct Diagnostic {
    line: usize,
    message: String,
}

fn diag(line: usize, message: impl Into<String>) -> Diagnostic {
    Diagnostic {
        line,
        message: message.into(),
    }
}

#[derive(Default)]
struct KernelBuilder {
    name: String,
    params: Vec<String>,
    dims: Option<Vec<usize>>,
    strides: Vec<Option<Vec<usize>>>,
    code: Vec<Instr>,
    stored: bool,
    depth: usize,
}

fn parse_usizes(line: usize, fields: &[&str]) -> Result<Vec<usize>, Diagnostic> {
    fields
        .iter()
        .map(|field| {
            field
                .parse::<usize>()
                .map_err(|_| diag(line, format!("expected an unsigned integer, got '{field}'")))
        })
        .collect()
}

impl KernelBuilder {
    fn push(&mut self, line: usize, instr: Instr) -> Result<(), Diagnostic> {
        if self.stored {
            return Err(diag(line, "instruction after store"));
        }
        match instr {
            Instr::Load(index) => {
                if index >= self.params.len().saturating_sub(1) {
                    return Err(diag(line, format!("load of unknown input {index}")));
                }
                self.depth += 1;
            }
            Instr::Const(_) => self.depth += 1,
            Instr::Unary(_) => {
                if self.depth < 1 {
                    return Err(diag(line, "stack underflow"));
                }
            }
            Instr::Binary(_) => {
                if self.depth < 2 {
                    return Err(diag(line, "stack underflow"));
                }
                self.depth -= 1;
            }
        }
        self.code.push(instr);
        Ok(())
    }

    fn finish(self, line: usize) -> Result<HostKernelProgram, Diagnostic> {
        if self.params.len() < 2 {
            return Err(diag(line, format!("kernel {} needs inputs and an output", self.name)));
        }
        let dims = self
            .dims
            .ok_or_else(|| diag(line, format!("kernel {} has no .dims", self.name)))?;
        let mut input_strides = Vec::with_capacity(self.strides.len());
        for (index, strides) in self.strides.into_iter().enumerate() {
            input_strides.push(
                strides.ok_or_else(|| diag(line, format!("input {index} has no .strides")))?,
            );
        }
        if !self.stored {
            return Err(diag(line, format!("kernel {} never stores", self.name)));
        }
        Ok(HostKernelProgram {
            name: self.name,
            params: self.params,
            dims,
            input_strides,
            code: self.code,
        })
    }
}

fn parse_module(source: &str) -> Result<HostModule, Diagnostic> {
    let mut module = HostModule::default();
    let mut current: Option<KernelBuilder> = None;
    let mut last_line = 0;

    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        last_line = line;
        let text = raw.split('#').next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }
        let fields: Vec<&str> = text.split_whitespace().collect();
        let (head, rest) = (fields[0], &fields[1..]);

        if head == ".kernel" {
            if current.is_some() {
                return Err(diag(line, "nested .kernel"));
            }
            let [name] = rest else {
                return Err(diag(line, ".kernel takes exactly one name"));
            };
            if module.kernel(name).is_some() {
                return Err(diag(line, format!("duplicate kernel {name}")));
            }
            current = Some(KernelBuilder {
                name: name.to_string(),
                ..KernelBuilder::default()
            });
            continue;
        }

        let kernel = current
            .as_mut()
            .ok_or_else(|| diag(line, format!("'{head}' outside of a kernel")))?;
        match head {
            ".params" => {
                kernel.params = rest.iter().map(|name| name.to_string()).collect();
                kernel.strides = vec![None; kernel.params.len().saturating_sub(1)];
            }
            ".dims" => {
                kernel.dims = Some(parse_usizes(line, rest)?);
            }
            ".strides" => {
                let values = parse_usizes(line, rest)?;
                let (&input, strides) = values
                    .split_first()
                    .ok_or_else(|| diag(line, ".strides needs an input index"))?;
                let rank = kernel
                    .dims
                    .as_ref()
                    .ok_or_else(|| diag(line, ".strides before .dims"))?
                    .len();
                if strides.len() != rank {
                    return Err(diag(
                        line,
                        format!("input {input} has {} strides for rank {rank}", strides.len()),
                    ));
                }
                let slot = kernel
                    .strides
                    .get_mut(input)
                    .ok_or_else(|| diag(line, format!("strides for unknown input {input}")))?;
                *slot = Some(strides.to_vec());
            }
            ".end" => {
                let done = current.take().map(|kernel| kernel.finish(line));
                if let Some(done) = done {
                    module.kernels.push(done?);
                }
            }
            "load" => {
                let [index] = rest else {
                    return Err(diag(line, "load takes one input index"));
                };
                let index = parse_usizes(line, &[*index])?[0];
                kernel.push(line, Instr::Load(index))?;
            }
            "const" => {
                let [value] = rest else {
                    return Err(diag(line, "const takes one value"));
                };
                let value: f32 = value
                    .parse()
                    .map_err(|_| diag(line, format!("invalid constant '{value}'")))?;
                kernel.push(line, Instr::Const(value))?;
            }
            "store" => {
                if kernel.depth != 1 {
                    return Err(diag(
                        line,
                        format!("store with {} values on the stack", kernel.depth),
                    ));
                }
                kernel.stored = true;
            }
            other => {
                if !rest.is_empty() {
                    return Err(diag(line, format!("'{other}' takes no operands")));
                }
                let instr = if let Some(op) = UnaryOp::from_name(other) {
                    Instr::Unary(op)
                } else if let Some(op) = BinaryOp::from_name(other) {
                    Instr::Binary(op)
                } else {
                    return Err(diag(line, format!("unknown instruction '{other}'")));
                };
                kernel.push(line, instr)?;
            }
        }
    }

    if let Some(kernel) = current {
        return Err(diag(last_line, format!("kernel {} is missing .end", kernel.name)));
    }
    if module.kernels.is_empty() {
        return Err(diag(last_line, "no kernels defined"));
    }
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
# relu((var_1 + var_2))
.kernel mem_bound_7_kernel0
.params var_1 var_2 var_3
.dims 4 4
.strides 0 4 1
.strides 1 0 1
  load 0
  load 1
  add
  relu
  store
.end
";

    fn compile(source: &str, arch: &str) -> (CompileStatus, String, Vec<u8>) {
        let mut program = HostCompiler.create_program(source, "k.hir").unwrap();
        let status = program.compile(&CompileOptions::new(arch)).unwrap();
        (status, program.log().unwrap(), program.binary().unwrap())
    }

    #[test]
    fn compiles_postfix_kernel() {
        let (status, log, binary) = compile(SOURCE, HOST_ARCH);
        assert_eq!(status, CompileStatus::Success);
        assert!(log.contains("kernel mem_bound_7_kernel0"));
        let module = HostModule::decode(&binary).unwrap();
        let kernel = module.kernel("mem_bound_7_kernel0").unwrap();
        assert_eq!(kernel.input_count(), 2);
        assert_eq!(kernel.input_strides, vec![vec![4, 1], vec![0, 1]]);
        assert_eq!(
            kernel.code,
            vec![
                Instr::Load(0),
                Instr::Load(1),
                Instr::Binary(BinaryOp::Add),
                Instr::Unary(UnaryOp::Relu),
            ]
        );
    }

    #[test]
    fn syntax_errors_fail_with_located_log() {
        let broken = SOURCE.replace("  add\n", "  frobnicate\n");
        let (status, log, binary) = compile(&broken, HOST_ARCH);
        assert!(matches!(status, CompileStatus::Failed(_)));
        assert!(log.contains("k.hir:9: error: unknown instruction 'frobnicate'"));
        assert!(binary.is_empty());
    }

    #[test]
    fn fused_multiply_add_is_refused() {
        let mut program = HostCompiler.create_program(SOURCE, "k.hir").unwrap();
        let mut options = CompileOptions::new(HOST_ARCH);
        options.fmad = true;
        let status = program.compile(&options).unwrap();
        assert!(matches!(status, CompileStatus::Failed(_)));
        let log = program.log().unwrap();
        assert!(log.contains("fmad=true"));
        assert!(log.contains("k.hir: error: fused multiply-add is not supported"));
        assert!(program.binary().unwrap().is_empty());

        let (status, log, _) = compile(SOURCE, HOST_ARCH);
        assert_eq!(status, CompileStatus::Success);
        assert!(log.contains("fmad=false"));
    }

    #[test]
    fn unbalanced_stack_is_rejected() {
        let broken = SOURCE.replace("  add\n", "");
        let (status, log, _) = compile(&broken, HOST_ARCH);
        assert!(matches!(status, CompileStatus::Failed(_)));
        assert!(log.contains("store with 2 values on the stack"));
    }

    #[test]
    fn foreign_architecture_is_rejected() {
        let (status, log, binary) = compile(SOURCE, "compute_80");
        assert!(matches!(status, CompileStatus::Failed(_)));
        assert!(log.contains("unsupported architecture"));
        assert!(binary.is_empty());
    }
}
