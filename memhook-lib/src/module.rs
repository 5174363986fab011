use std::cell::OnceCell;
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;

use log::debug;

use crate::memory::{pattern::Pattern, MemoryTransport};
use crate::os::{ModuleHandle, ModuleInfo, OsError, ProcessApi, ProcessHandle};
use crate::session::Hook;
use crate::{MemoryError, Result};

/// A module loaded in the target process.
///
/// The process handle is borrowed from the session: `'s` ties the module to the hook it was
/// enumerated under, so a module cannot outlive `unhook()`. Base, size and entry point are
/// fetched once through [`ModuleCatalog::resolve`]; a failed fetch is cached as well.
pub struct Module<'s> {
    process: ProcessHandle,
    handle: ModuleHandle,
    info: OnceCell<Result<ModuleInfo, OsError>>,
    _session: PhantomData<&'s ()>,
}

impl<'s> Module<'s> {
    pub(crate) fn new(process: ProcessHandle, handle: ModuleHandle) -> Self {
        Self {
            process,
            handle,
            info: OnceCell::new(),
            _session: PhantomData,
        }
    }

    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn process_handle(&self) -> ProcessHandle {
        self.process
    }

    /// The lazily fetched triple, if a fetch already succeeded.
    pub fn cached_info(&self) -> Option<ModuleInfo> {
        self.info.get().and_then(|info| info.ok())
    }
}

impl fmt::Debug for Module<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("handle", &self.handle)
            .field("info", &self.info.get())
            .finish()
    }
}

/// An address expressed relative to the module image containing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAddress {
    pub module_name: String,
    pub module_base: usize,
    pub offset: usize,
}

impl fmt::Display for StaticAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:08X}", self.module_name, self.offset)
    }
}

/// Module enumeration and lookup for a hooked process.
pub struct ModuleCatalog<'s, A: ProcessApi> {
    api: &'s A,
    hook: &'s Hook,
}

impl<'s, A: ProcessApi> ModuleCatalog<'s, A> {
    pub(crate) fn new(api: &'s A, hook: &'s Hook) -> Self {
        Self { api, hook }
    }

    /// Enumerates the loaded modules using the target's pointer width. Index 0 is the main
    /// executable.
    pub fn list_modules(&self) -> Result<Vec<Module<'s>>> {
        let handles = self
            .api
            .enum_modules(self.hook.handle, self.hook.width)
            .map_err(|e| MemoryError::ModuleEnumerationFailed { code: e.code })?;

        debug!(
            "enumerated {} modules ({} byte pointers)",
            handles.len(),
            self.hook.width.size()
        );

        Ok(handles
            .into_iter()
            .map(|handle| Module::new(self.hook.handle, handle))
            .collect())
    }

    /// The main executable module, cached until the session is unhooked.
    pub fn base_module(&self) -> Result<&'s Module<'s>> {
        let hook: &'s Hook = self.hook;
        if let Some(module) = hook.base_module.get() {
            return Ok(module);
        }

        let module = self
            .list_modules()?
            .into_iter()
            .next()
            .ok_or(MemoryError::NoModules)?;

        Ok(hook
            .base_module
            .get_or_init(|| Module::new(module.process, module.handle)))
    }

    pub fn base_address(&self) -> Result<usize> {
        let base = self.base_module()?;
        Ok(self.resolve(base)?.base)
    }

    /// Fetches base, size and entry point of `module`, at most once per module.
    pub fn resolve(&self, module: &Module<'_>) -> Result<ModuleInfo> {
        let info = *module
            .info
            .get_or_init(|| self.api.module_info(module.process, module.handle));

        info.map_err(|e| MemoryError::ModuleInfoUnavailable {
            module: module.handle.as_raw(),
            code: e.code,
        })
    }

    pub fn file_name(&self, module: &Module<'_>) -> Result<PathBuf> {
        self.api
            .module_file_name(module.process, Some(module.handle))
            .map_err(|e| MemoryError::ModuleInfoUnavailable {
                module: module.handle.as_raw(),
                code: e.code,
            })
    }

    /// First module whose path contains `name`, ignoring case.
    pub fn find_by_file_name_suffix(&self, name: &str) -> Result<Option<Module<'s>>> {
        let needle = name.to_lowercase();

        for module in self.list_modules()? {
            let path = self.file_name(&module)?;
            if path.to_string_lossy().to_lowercase().contains(&needle) {
                return Ok(Some(module));
            }
        }

        Ok(None)
    }

    /// Describes `address` as `<module file name>+<offset>` when it lies in a module image.
    pub fn describe_address(&self, address: usize) -> Result<Option<StaticAddress>> {
        for module in self.list_modules()? {
            let info = self.resolve(&module)?;
            if !info.contains(address) {
                continue;
            }

            let path = self.file_name(&module)?;
            let module_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned());

            return Ok(Some(StaticAddress {
                module_name,
                module_base: info.base,
                offset: address - info.base,
            }));
        }

        Ok(None)
    }

    /// Scans the image of `module` for a byte pattern such as `"F8 01 ?? 04"`.
    pub fn scan_module(&self, module: &Module<'_>, pattern: &str) -> Result<Option<usize>> {
        let pattern: Pattern = pattern.parse()?;
        let info = self.resolve(module)?;

        MemoryTransport::new(self.api, self.hook.handle).scan(info.base, info.size, &pattern)
    }
}
