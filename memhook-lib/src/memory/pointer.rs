use log::trace;

use crate::module::ModuleCatalog;
use crate::os::{PointerWidth, ProcessApi};
use crate::{MemoryError, Result};

use super::MemoryTransport;

/// Follows pointer chains: a start address plus offsets, where every offset except the last
/// leads to another pointer.
pub struct PointerChainResolver<'s, A: ProcessApi> {
    transport: MemoryTransport<'s, A>,
    catalog: ModuleCatalog<'s, A>,
    width: PointerWidth,
}

impl<'s, A: ProcessApi> PointerChainResolver<'s, A> {
    pub(crate) fn new(
        transport: MemoryTransport<'s, A>,
        catalog: ModuleCatalog<'s, A>,
        width: PointerWidth,
    ) -> Self {
        Self {
            transport,
            catalog,
            width,
        }
    }

    /// Reads one pointer of the target's width at `address`.
    pub fn read_pointer(&self, address: usize) -> Result<usize> {
        let bytes = self.transport.read_bytes(address, self.width.size())?;
        Ok(self.width.pointer_from_ne_bytes(&bytes))
    }

    /// Resolves a dynamic address. Additions wrap at the target's pointer width.
    ///
    /// The pointer stored at `start` plus `offsets[0]` gives the next address; each further
    /// offset is added to the pointer stored there. The final sum is returned without being
    /// read, so a chain of `k` offsets costs `k` pointer reads, `k - 1` of them at computed
    /// addresses.
    pub fn resolve(&self, offsets: &[isize], start: usize) -> Result<usize> {
        let (last, hops) = offsets.split_last().ok_or(MemoryError::InvalidChain)?;

        let mut address = start;
        for offset in hops {
            let pointer = self.read_pointer(address)?;
            address = self.width.offset(pointer, *offset);
            trace!("hop {:#x} + {:#x} -> {:#x}", pointer, offset, address);
        }

        let pointer = self.read_pointer(address)?;
        Ok(self.width.offset(pointer, *last))
    }

    /// Resolves a chain starting at the base module's load address plus `static_offset`.
    pub fn resolve_from_base(&self, static_offset: isize, offsets: &[isize]) -> Result<usize> {
        if offsets.is_empty() {
            return Err(MemoryError::InvalidChain);
        }

        let start = self
            .width
            .offset(self.catalog.base_address()?, static_offset);
        self.resolve(offsets, start)
    }
}
