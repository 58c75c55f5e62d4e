use std::ffi::c_void;

use super::KernelContext;
use crate::error::Result;
use crate::runtime::DeviceAddr;

/// Ordered kernel arguments of an operator: every input in operator order,
/// then the output. The variable names handed to the synthesizer and the
/// addresses handed to the launch come from the same binding, so the two
/// orders cannot drift apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentBinding {
    input_names: Vec<String>,
    output_name: String,
    addrs: Vec<DeviceAddr>,
}

impl ArgumentBinding {
    /// Names only; used when addresses are not needed yet.
    pub fn names_for(ctx: &KernelContext<'_>) -> Self {
        let op = ctx.op();
        let input_names = op.inputs().iter().map(|id| id.var_name()).collect();
        Self {
            input_names,
            output_name: op.output().var_name(),
            addrs: Vec::new(),
        }
    }

    pub fn bind(ctx: &KernelContext<'_>) -> Result<Self> {
        let mut binding = Self::names_for(ctx);
        let count = ctx.op().inputs().len();
        let mut addrs = Vec::with_capacity(count + 1);
        for index in 0..count {
            addrs.push(ctx.input_addr(index)?);
        }
        addrs.push(ctx.output_addr()?);
        binding.addrs = addrs;
        Ok(binding)
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// `[in0, in1, ..., out]`.
    pub fn addrs(&self) -> &[DeviceAddr] {
        &self.addrs
    }

    /// Copies the addresses into `slots` and returns one pointer per slot,
    /// which is the parameter layout `Runtime::launch` expects.
    pub fn marshal(&self, slots: &mut Vec<DeviceAddr>) -> Vec<*mut c_void> {
        slots.clear();
        slots.extend_from_slice(&self.addrs);
        slots
            .iter_mut()
            .map(|slot| slot as *mut DeviceAddr as *mut c_void)
            .collect()
    }
}
