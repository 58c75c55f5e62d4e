use tunegraph::runtime::bytes;
use tunegraph::{DeviceAddr, Error, Result, Shape};

use crate::compiler::{HostKernelProgram, Instr};
use crate::memory::HostMemory;

/// Runs `kernel` for thread indices `0..threads`, one output element per
/// thread; threads past the output extent do nothing. Arithmetic is plain f32
/// with no contraction, matching a device build with `--fmad=false`.
pub(crate) fn execute(
    kernel: &HostKernelProgram,
    addrs: &[DeviceAddr],
    threads: u64,
    memory: &mut HostMemory,
) -> Result<()> {
    let inputs = kernel.input_count();
    if addrs.len() != inputs + 1 {
        return Err(Error::launch(format!(
            "{} takes {} buffers, got {}",
            kernel.name,
            inputs + 1,
            addrs.len()
        )));
    }

    let extent = kernel.extent();
    let mut values = Vec::with_capacity(inputs);
    for (index, strides) in kernel.input_strides.iter().enumerate() {
        let len = span(&kernel.dims, strides);
        values.push(bytes::bytes_to_f32(memory.read(addrs[index], len * 4)?));
    }
    let out_addr = addrs[inputs];
    let mut out = bytes::bytes_to_f32(memory.read(out_addr, extent * 4)?);

    let out_strides = Shape::new(&kernel.dims).contiguous_strides();
    let active = usize::try_from(threads).unwrap_or(usize::MAX).min(extent);
    let mut stack: Vec<f32> = Vec::with_capacity(kernel.code.len());
    for (idx, slot) in out.iter_mut().enumerate().take(active) {
        stack.clear();
        for instr in &kernel.code {
            match *instr {
                Instr::Load(input) => {
                    let at = offset(idx, &kernel.dims, &out_strides, &kernel.input_strides[input]);
                    stack.push(values[input][at]);
                }
                Instr::Const(value) => stack.push(value),
                Instr::Unary(op) => {
                    let x = pop(&mut stack, kernel)?;
                    stack.push(op.apply(x));
                }
                Instr::Binary(op) => {
                    let rhs = pop(&mut stack, kernel)?;
                    let lhs = pop(&mut stack, kernel)?;
                    stack.push(op.apply(lhs, rhs));
                }
            }
        }
        *slot = pop(&mut stack, kernel)?;
    }

    memory.write(out_addr, &bytes::f32_to_bytes(&out))
}

fn pop(stack: &mut Vec<f32>, kernel: &HostKernelProgram) -> Result<f32> {
    stack
        .pop()
        .ok_or_else(|| Error::launch(format!("{}: stack underflow", kernel.name)))
}

/// Number of elements an input must hold to satisfy every offset.
fn span(dims: &[usize], strides: &[usize]) -> usize {
    if dims.iter().any(|&dim| dim == 0) {
        return 0;
    }
    dims.iter()
        .zip(strides)
        .map(|(&dim, &stride)| (dim - 1) * stride)
        .sum::<usize>()
        + 1
}

fn offset(linear: usize, dims: &[usize], out_strides: &[usize], strides: &[usize]) -> usize {
    dims.iter()
        .zip(out_strides)
        .zip(strides)
        .map(|((&dim, &out_stride), &stride)| (linear / out_stride) % dim * stride)
        .sum()
}

#[cfg(test)]
mod tests {
    use tunegraph::graph::{BinaryOp, UnaryOp};

    use super::*;

    fn program() -> HostKernelProgram {
        HostKernelProgram {
            name: "k".into(),
            params: vec!["a".into(), "b".into(), "out".into()],
            dims: vec![2, 3],
            input_strides: vec![vec![3, 1], vec![0, 1]],
            code: vec![
                Instr::Load(0),
                Instr::Load(1),
                Instr::Binary(BinaryOp::Sub),
                Instr::Unary(UnaryOp::Abs),
            ],
        }
    }

    #[test]
    fn broadcasts_rows_and_honours_thread_count() {
        let mut memory = HostMemory::default();
        let a = memory.alloc(24).unwrap();
        let b = memory.alloc(12).unwrap();
        let out = memory.alloc(24).unwrap();
        memory
            .write(a, &bytes::f32_to_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))
            .unwrap();
        memory.write(b, &bytes::f32_to_bytes(&[3.0, 3.0, 3.0])).unwrap();
        memory.write(out, &bytes::f32_to_bytes(&[-1.0; 6])).unwrap();

        execute(&program(), &[a, b, out], 4, &mut memory).unwrap();
        let result = bytes::bytes_to_f32(memory.read(out, 24).unwrap());
        assert_eq!(result, vec![2.0, 1.0, 0.0, 1.0, -1.0, -1.0]);

        execute(&program(), &[a, b, out], 64, &mut memory).unwrap();
        let result = bytes::bytes_to_f32(memory.read(out, 24).unwrap());
        assert_eq!(result, vec![2.0, 1.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn wrong_buffer_count_is_a_launch_error() {
        let mut memory = HostMemory::default();
        let a = memory.alloc(24).unwrap();
        let err = execute(&program(), &[a], 6, &mut memory).unwrap_err();
        assert!(matches!(err, Error::DeviceLaunch(_)));
    }
}
