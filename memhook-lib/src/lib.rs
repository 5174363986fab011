//! Reads and writes the memory of another process: hook it by pid, enumerate its modules,
//! follow pointer chains from a module base and transfer raw or typed values.

pub mod error;
pub mod memory;
pub mod module;
pub mod os;
pub mod session;

pub use error::{MemoryError, Result};
pub use memory::encoding::Encoding;
pub use memory::pattern::Pattern;
pub use memory::pointer::PointerChainResolver;
pub use memory::typed::TypedMemoryView;
pub use memory::{MemoryRegion, MemoryTransport};
pub use module::{Module, ModuleCatalog, StaticAddress};
pub use os::{
    ModuleHandle, ModuleInfo, NativeApi, OsError, Pid, PointerWidth, ProcessAccess, ProcessApi,
    ProcessHandle, RegionInfo, IS_SUPPORTED_PLATFORM,
};
pub use session::ProcessSession;
