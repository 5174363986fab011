use std::ops::BitOr;
use std::path::PathBuf;

use byteorder::{ByteOrder, NativeEndian};
use thiserror::Error;

#[cfg(test)]
pub(crate) mod fake;

#[cfg(windows)]
#[path = "windows.rs"]
mod platform;
#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod platform;
#[cfg(not(any(windows, target_os = "linux")))]
#[path = "unsupported.rs"]
mod platform;

pub use platform::NativeApi;

/// `true` when this build has a native backend for the host operating system.
pub const IS_SUPPORTED_PLATFORM: bool = cfg!(any(windows, target_os = "linux"));

pub type Pid = u32;

/// Error code reported by the operating system for a failed call.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("os error {code}")]
pub struct OsError {
    pub code: i32,
}

impl OsError {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    /// Captures the calling thread's last platform error.
    pub fn last() -> Self {
        Self::from(std::io::Error::last_os_error())
    }
}

impl From<std::io::Error> for OsError {
    fn from(err: std::io::Error) -> Self {
        // io errors synthesized by std (short reads, invalid data) carry no os code
        Self::new(err.raw_os_error().unwrap_or(-1))
    }
}

/// Opaque OS reference to an opened process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(usize);

impl ProcessHandle {
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }
}

/// Opaque OS reference to a module loaded in a target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(usize);

impl ModuleHandle {
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }
}

/// Access rights requested when opening a process. Values follow the Windows access mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessAccess(u32);

impl ProcessAccess {
    pub const VM_OPERATION: Self = Self(0x0008);
    pub const VM_READ: Self = Self(0x0010);
    pub const VM_WRITE: Self = Self(0x0020);
    pub const QUERY_INFORMATION: Self = Self(0x0400);
    pub const QUERY_LIMITED_INFORMATION: Self = Self(0x1000);
    pub const ALL_ACCESS: Self = Self(0x001F_0FFF);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for ProcessAccess {
    /// The smallest mask that supports every operation of a hooked session.
    fn default() -> Self {
        Self::QUERY_INFORMATION | Self::VM_READ | Self::VM_WRITE | Self::VM_OPERATION
    }
}

impl BitOr for ProcessAccess {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Pointer width of the target process, which may differ from the controller's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    pub fn from_native_64(is_64: bool) -> Self {
        if is_64 {
            Self::Bits64
        } else {
            Self::Bits32
        }
    }

    pub fn size(self) -> usize {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }

    /// Decodes a target pointer stored in native byte order.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`PointerWidth::size`].
    pub fn pointer_from_ne_bytes(self, bytes: &[u8]) -> usize {
        match self {
            Self::Bits32 => NativeEndian::read_u32(bytes) as usize,
            Self::Bits64 => NativeEndian::read_u64(bytes) as usize,
        }
    }

    /// `address + offset`, wrapping at the target's width.
    pub fn offset(self, address: usize, offset: isize) -> usize {
        match self {
            Self::Bits32 => (address as u32).wrapping_add_signed(offset as i32) as usize,
            Self::Bits64 => address.wrapping_add_signed(offset),
        }
    }
}

/// Load base, image size and entry point of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    pub base: usize,
    pub size: usize,
    pub entry_point: usize,
}

impl ModuleInfo {
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address - self.base <= self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Committed,
    Reserved,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protection {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub guarded: bool,
}

/// Metadata of the page region containing a queried address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub base: usize,
    pub size: usize,
    pub state: RegionState,
    pub protection: Protection,
}

impl RegionInfo {
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    pub fn is_readable(&self) -> bool {
        self.state == RegionState::Committed
            && self.protection.readable
            && !self.protection.guarded
    }
}

/// Native calls the memory layer is built on.
///
/// Implementations are stateless wrappers: every method is a single blocking OS call (or a
/// short fixed sequence of them) and reports failure with the platform error code.
pub trait ProcessApi {
    fn process_exists(&self, pid: Pid) -> bool;

    fn open_process(&self, pid: Pid, access: ProcessAccess) -> Result<ProcessHandle, OsError>;

    fn close_handle(&self, handle: ProcessHandle) -> Result<(), OsError>;

    /// `false` for 32-bit processes, including those running under WoW64.
    fn is_native_64bit(&self, handle: ProcessHandle) -> Result<bool, OsError>;

    /// Fills `buffer` from `address`. A partial transfer is an error.
    fn read_memory(
        &self,
        handle: ProcessHandle,
        address: usize,
        buffer: &mut [u8],
    ) -> Result<(), OsError>;

    /// Writes all of `data` at `address`. A partial transfer is an error.
    fn write_memory(
        &self,
        handle: ProcessHandle,
        address: usize,
        data: &[u8],
    ) -> Result<(), OsError>;

    fn query_region(&self, handle: ProcessHandle, address: usize) -> Result<RegionInfo, OsError>;

    /// Lists loaded modules, main executable first. `width` is the target's pointer width.
    fn enum_modules(
        &self,
        handle: ProcessHandle,
        width: PointerWidth,
    ) -> Result<Vec<ModuleHandle>, OsError>;

    fn module_info(&self, handle: ProcessHandle, module: ModuleHandle)
        -> Result<ModuleInfo, OsError>;

    /// Path of `module`, or of the process image when `module` is `None`.
    fn module_file_name(
        &self,
        handle: ProcessHandle,
        module: Option<ModuleHandle>,
    ) -> Result<PathBuf, OsError>;
}

impl<T: ProcessApi + ?Sized> ProcessApi for &T {
    fn process_exists(&self, pid: Pid) -> bool {
        (**self).process_exists(pid)
    }

    fn open_process(&self, pid: Pid, access: ProcessAccess) -> Result<ProcessHandle, OsError> {
        (**self).open_process(pid, access)
    }

    fn close_handle(&self, handle: ProcessHandle) -> Result<(), OsError> {
        (**self).close_handle(handle)
    }

    fn is_native_64bit(&self, handle: ProcessHandle) -> Result<bool, OsError> {
        (**self).is_native_64bit(handle)
    }

    fn read_memory(
        &self,
        handle: ProcessHandle,
        address: usize,
        buffer: &mut [u8],
    ) -> Result<(), OsError> {
        (**self).read_memory(handle, address, buffer)
    }

    fn write_memory(
        &self,
        handle: ProcessHandle,
        address: usize,
        data: &[u8],
    ) -> Result<(), OsError> {
        (**self).write_memory(handle, address, data)
    }

    fn query_region(&self, handle: ProcessHandle, address: usize) -> Result<RegionInfo, OsError> {
        (**self).query_region(handle, address)
    }

    fn enum_modules(
        &self,
        handle: ProcessHandle,
        width: PointerWidth,
    ) -> Result<Vec<ModuleHandle>, OsError> {
        (**self).enum_modules(handle, width)
    }

    fn module_info(
        &self,
        handle: ProcessHandle,
        module: ModuleHandle,
    ) -> Result<ModuleInfo, OsError> {
        (**self).module_info(handle, module)
    }

    fn module_file_name(
        &self,
        handle: ProcessHandle,
        module: Option<ModuleHandle>,
    ) -> Result<PathBuf, OsError> {
        (**self).module_file_name(handle, module)
    }
}
