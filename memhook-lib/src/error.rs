use thiserror::Error;

use crate::os::Pid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("process memory access is not supported on {0}")]
    UnsupportedPlatform(&'static str),
    #[error("process id must be greater than zero, got {0}")]
    InvalidProcessId(Pid),
    #[error("process {0} is not running")]
    ProcessNotFound(Pid),
    #[error("unable to open process {pid} (os error {code})")]
    ProcessUnavailable { pid: Pid, code: i32 },
    #[error("already hooked to process {0}, unhook first")]
    AlreadyHooked(Pid),
    #[error("not hooked to a process, hook first")]
    NotHooked,
    #[error("failed to release process handle (os error {code})")]
    CloseFailed { code: i32 },
    #[error("failed to enumerate modules (os error {code})")]
    ModuleEnumerationFailed { code: i32 },
    #[error("process has no loaded modules")]
    NoModules,
    #[error("module info unavailable for module {module:#x} (os error {code})")]
    ModuleInfoUnavailable { module: usize, code: i32 },
    #[error("failed to read {length} bytes at {address:#x} (os error {code})")]
    ReadFailed {
        address: usize,
        length: usize,
        code: i32,
    },
    #[error("failed to write {length} bytes at {address:#x} (os error {code})")]
    WriteFailed {
        address: usize,
        length: usize,
        code: i32,
    },
    #[error("cannot transfer {length} bytes at {address:#x}")]
    InvalidLength { address: usize, length: usize },
    #[error("string of {char_count} characters at {bytes_per_char} bytes each is too long")]
    StringLengthOverflow {
        char_count: usize,
        bytes_per_char: usize,
    },
    #[error("failed to query memory region at {address:#x} (os error {code})")]
    QueryFailed { address: usize, code: i32 },
    #[error("pointer chain needs at least one offset")]
    InvalidChain,
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
