use log::{debug, trace};

use crate::os::{ProcessApi, ProcessHandle, RegionInfo};
use crate::{MemoryError, Result};

use self::pattern::Pattern;

pub mod encoding;
pub mod pattern;
pub mod pointer;
pub mod typed;

/// Bytes copied out of the target, with the address they were read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    address: usize,
    bytes: Vec<u8>,
}

impl MemoryRegion {
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Raw, all-or-nothing transfers between the controller and the target.
pub struct MemoryTransport<'s, A: ProcessApi> {
    api: &'s A,
    handle: ProcessHandle,
}

impl<A: ProcessApi> Clone for MemoryTransport<'_, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: ProcessApi> Copy for MemoryTransport<'_, A> {}

impl<'s, A: ProcessApi> MemoryTransport<'s, A> {
    pub(crate) fn new(api: &'s A, handle: ProcessHandle) -> Self {
        Self { api, handle }
    }

    /// Reads `length` bytes at `address` in one OS call. Either the whole range is readable
    /// or nothing is returned.
    ///
    /// Fails with [`MemoryError::InvalidLength`] before calling the OS when the range wraps
    /// the address space or no buffer of `length` bytes can be allocated.
    pub fn read_bytes(&self, address: usize, length: usize) -> Result<Vec<u8>> {
        let invalid = MemoryError::InvalidLength { address, length };
        if address.checked_add(length).is_none() {
            return Err(invalid);
        }

        let mut data = Vec::new();
        data.try_reserve_exact(length).map_err(|_| invalid)?;
        data.resize(length, 0);

        self.api
            .read_memory(self.handle, address, &mut data)
            .map_err(|e| {
                debug!("read of {} bytes at {:#x} failed: {}", length, address, e);
                MemoryError::ReadFailed {
                    address,
                    length,
                    code: e.code,
                }
            })?;
        trace!("read {} bytes at {:#x}", length, address);

        Ok(data)
    }

    pub fn read_region(&self, address: usize, length: usize) -> Result<MemoryRegion> {
        let bytes = self.read_bytes(address, length)?;
        Ok(MemoryRegion { address, bytes })
    }

    /// Writes exactly `bytes` at `address` in one OS call.
    pub fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()> {
        let length = bytes.len();

        self.api
            .write_memory(self.handle, address, bytes)
            .map_err(|e| {
                debug!("write of {} bytes at {:#x} failed: {}", length, address, e);
                MemoryError::WriteFailed {
                    address,
                    length,
                    code: e.code,
                }
            })?;
        trace!("wrote {} bytes at {:#x}", length, address);

        Ok(())
    }

    /// Protection and commit state of the page region containing `address`.
    pub fn query_region(&self, address: usize) -> Result<RegionInfo> {
        self.api
            .query_region(self.handle, address)
            .map_err(|e| MemoryError::QueryFailed {
                address,
                code: e.code,
            })
    }

    /// Finds the first occurrence of `pattern` in `[start, start + length)`.
    ///
    /// Only committed, readable, non-guard regions are read. Matches that straddle two
    /// regions are not reported.
    pub fn scan(&self, start: usize, length: usize, pattern: &Pattern) -> Result<Option<usize>> {
        let end = start.saturating_add(length);
        let mut cursor = start;

        while cursor < end {
            let region = self.query_region(cursor)?;
            let region_end = region.end().min(end);
            if region_end <= cursor {
                break;
            }

            if region.is_readable() {
                let chunk = self.read_bytes(cursor, region_end - cursor)?;
                if let Some(index) = pattern.find_in(&chunk) {
                    return Ok(Some(cursor + index));
                }
            }

            cursor = region_end;
        }

        Ok(None)
    }
}
