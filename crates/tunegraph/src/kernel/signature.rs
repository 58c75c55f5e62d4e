use super::KernelContext;
use crate::error::Result;
use crate::graph::{DType, OpAttrs, OpKind};
use crate::hashing::FingerprintHasher;
use crate::runtime::Device;

const SIGNATURE_VERSION: u32 = 2;

/// Canonical fingerprint of everything a tuned artifact depends on: device,
/// target architecture, operator kind and attributes (including the fused
/// expression, whose inputs are positional), and the input/output shapes and
/// dtypes. Tensor identities do not participate.
pub fn operator_signature(ctx: &KernelContext<'_>) -> Result<u64> {
    let op = ctx.op();
    let runtime = ctx.runtime();
    let mut inputs = Vec::with_capacity(op.inputs().len());
    for index in 0..op.inputs().len() {
        let tensor = ctx.input(index)?;
        inputs.push((tensor.shape().dims(), tensor.dtype()));
    }
    let output = ctx.output()?;
    fingerprint(
        runtime.device(),
        &runtime.target_arch(),
        op.kind(),
        op.attrs(),
        &inputs,
        (output.shape().dims(), output.dtype()),
    )
}

fn fingerprint(
    device: Device,
    arch: &str,
    kind: OpKind,
    attrs: &OpAttrs,
    inputs: &[(&[usize], DType)],
    output: (&[usize], DType),
) -> Result<u64> {
    let mut hasher = FingerprintHasher::new();
    hasher.write_u32(SIGNATURE_VERSION);
    hasher.write_str(&device.to_string());
    hasher.write_str(arch);
    hasher.write_str(kind.name());
    hasher.write_bytes(&bincode::serialize(attrs)?);
    hasher.write_u64(inputs.len() as u64);
    for &(dims, dtype) in inputs.iter().chain(std::iter::once(&output)) {
        hasher.write_dims(dims);
        hasher.write_str(dtype.name());
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PINNED_ADD_4X4: u64 = 0x0bdf_926f_a127_9c48;

    fn add_4x4(arch: &str) -> u64 {
        let dims: &[usize] = &[4, 4];
        fingerprint(
            Device::Cuda,
            arch,
            OpKind::Add,
            &OpAttrs::None,
            &[(dims, DType::Float32), (dims, DType::Float32)],
            (dims, DType::Float32),
        )
        .unwrap()
    }

    #[test]
    fn signature_is_pinned_across_builds() {
        assert_eq!(add_4x4("compute_80"), PINNED_ADD_4X4);
    }

    #[test]
    fn architecture_changes_the_signature() {
        assert_ne!(add_4x4("compute_80"), add_4x4("compute_86"));
    }
}
