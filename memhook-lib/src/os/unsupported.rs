use std::path::PathBuf;

use super::{
    ModuleHandle, ModuleInfo, OsError, Pid, PointerWidth, ProcessAccess, ProcessApi,
    ProcessHandle, RegionInfo,
};
use crate::MemoryError;

/// Placeholder backend for hosts without native support. It cannot be constructed.
#[derive(Debug)]
pub struct NativeApi {
    _private: (),
}

impl NativeApi {
    pub fn new() -> crate::Result<Self> {
        Err(MemoryError::UnsupportedPlatform(std::env::consts::OS))
    }
}

fn unsupported<T>() -> Result<T, OsError> {
    Err(OsError::new(-1))
}

impl ProcessApi for NativeApi {
    fn process_exists(&self, _pid: Pid) -> bool {
        false
    }

    fn open_process(&self, _pid: Pid, _access: ProcessAccess) -> Result<ProcessHandle, OsError> {
        unsupported()
    }

    fn close_handle(&self, _handle: ProcessHandle) -> Result<(), OsError> {
        unsupported()
    }

    fn is_native_64bit(&self, _handle: ProcessHandle) -> Result<bool, OsError> {
        unsupported()
    }

    fn read_memory(&self, _: ProcessHandle, _: usize, _: &mut [u8]) -> Result<(), OsError> {
        unsupported()
    }

    fn write_memory(&self, _: ProcessHandle, _: usize, _: &[u8]) -> Result<(), OsError> {
        unsupported()
    }

    fn query_region(&self, _: ProcessHandle, _: usize) -> Result<RegionInfo, OsError> {
        unsupported()
    }

    fn enum_modules(&self, _: ProcessHandle, _: PointerWidth) -> Result<Vec<ModuleHandle>, OsError> {
        unsupported()
    }

    fn module_info(&self, _: ProcessHandle, _: ModuleHandle) -> Result<ModuleInfo, OsError> {
        unsupported()
    }

    fn module_file_name(
        &self,
        _: ProcessHandle,
        _: Option<ModuleHandle>,
    ) -> Result<PathBuf, OsError> {
        unsupported()
    }
}
