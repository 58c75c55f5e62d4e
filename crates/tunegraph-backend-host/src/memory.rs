use std::collections::BTreeMap;

use tunegraph::{DeviceAddr, Error, Result};

const BASE_ADDR: DeviceAddr = 0x1000_0000;
const ALIGNMENT: DeviceAddr = 256;

/// Host-backed device memory. Addresses are synthetic and never dereferenced;
/// every access goes through a bounds-checked lookup of the owning buffer.
#[derive(Debug)]
pub(crate) struct HostMemory {
    buffers: BTreeMap<DeviceAddr, Vec<u8>>,
    next: DeviceAddr,
}

impl Default for HostMemory {
    fn default() -> Self {
        Self {
            buffers: BTreeMap::new(),
            next: BASE_ADDR,
        }
    }
}

impl HostMemory {
    pub(crate) fn alloc(&mut self, bytes: usize) -> Result<DeviceAddr> {
        let addr = self.next;
        let span = (bytes as DeviceAddr).max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        // Leave a gap so out-of-range accesses never land in a neighbour.
        self.next = addr
            .checked_add(span + ALIGNMENT)
            .ok_or_else(|| Error::device("host address space exhausted"))?;
        self.buffers.insert(addr, vec![0u8; bytes]);
        Ok(addr)
    }

    pub(crate) fn free(&mut self, addr: DeviceAddr) -> Result<()> {
        self.buffers
            .remove(&addr)
            .map(|_| ())
            .ok_or_else(|| Error::device(format!("free of unknown allocation {addr:#x}")))
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.buffers.len()
    }

    fn locate(&self, addr: DeviceAddr, len: usize) -> Result<(DeviceAddr, usize)> {
        let (&base, buffer) = self
            .buffers
            .range(..=addr)
            .next_back()
            .ok_or_else(|| Error::device(format!("address {addr:#x} is not allocated")))?;
        let offset = (addr - base) as usize;
        if offset.checked_add(len).map_or(true, |end| end > buffer.len()) {
            return Err(Error::device(format!(
                "access of {len} bytes at {addr:#x} overruns allocation {base:#x} of {} bytes",
                buffer.len()
            )));
        }
        Ok((base, offset))
    }

    pub(crate) fn read(&self, addr: DeviceAddr, len: usize) -> Result<&[u8]> {
        let (base, offset) = self.locate(addr, len)?;
        Ok(&self.buffers[&base][offset..offset + len])
    }

    pub(crate) fn write(&mut self, addr: DeviceAddr, data: &[u8]) -> Result<()> {
        let (base, offset) = self.locate(addr, data.len())?;
        if let Some(buffer) = self.buffers.get_mut(&base) {
            buffer[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_bounds_checked() {
        let mut memory = HostMemory::default();
        let a = memory.alloc(16).unwrap();
        let b = memory.alloc(8).unwrap();
        assert!(b > a + 16);
        memory.write(a + 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(memory.read(a + 4, 4).unwrap(), &[1, 2, 3, 4]);
        assert!(memory.read(a + 8, 16).is_err());
        assert!(memory.write(b, &[0u8; 9]).is_err());
        assert!(memory.read(a - 1, 1).is_err());
    }

    #[test]
    fn double_free_is_an_error() {
        let mut memory = HostMemory::default();
        let a = memory.alloc(4).unwrap();
        memory.free(a).unwrap();
        assert!(memory.free(a).is_err());
        assert!(memory.read(a, 1).is_err());
        assert_eq!(memory.live_allocations(), 0);
    }
}
