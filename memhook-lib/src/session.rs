use std::cell::OnceCell;
use std::path::PathBuf;

use log::{debug, warn};

use crate::memory::{pointer::PointerChainResolver, typed::TypedMemoryView, MemoryTransport};
use crate::module::{Module, ModuleCatalog};
use crate::os::{NativeApi, Pid, PointerWidth, ProcessAccess, ProcessApi, ProcessHandle};
use crate::{MemoryError, Result};

/// State that exists only while a session is hooked. Dropping it discards every cache.
pub(crate) struct Hook {
    pub(crate) handle: ProcessHandle,
    pub(crate) width: PointerWidth,
    pub(crate) base_module: OnceCell<Module<'static>>,
}

/// One controller-to-target binding.
///
/// A session owns the process handle between [`hook`](Self::hook) and
/// [`unhook`](Self::unhook). Everything derived from it (modules, transports, resolvers)
/// borrows the session, so none of it can be used after the handle is released.
///
/// Sessions are single-threaded; share one across threads only behind external
/// synchronization.
pub struct ProcessSession<A: ProcessApi = NativeApi> {
    pid: Pid,
    api: A,
    hook: Option<Hook>,
}

impl ProcessSession<NativeApi> {
    /// Creates a session for a running process using the host's native backend.
    ///
    /// Fails with [`MemoryError::UnsupportedPlatform`] on hosts without a backend.
    pub fn new(pid: Pid) -> Result<Self> {
        Self::with_api(pid, NativeApi::new()?)
    }
}

impl<A: ProcessApi> ProcessSession<A> {
    pub fn with_api(pid: Pid, api: A) -> Result<Self> {
        if pid == 0 {
            return Err(MemoryError::InvalidProcessId(pid));
        }
        if !api.process_exists(pid) {
            return Err(MemoryError::ProcessNotFound(pid));
        }

        Ok(Self {
            pid,
            api,
            hook: None,
        })
    }

    /// Hooks with [`ProcessAccess::default`]: query information, vm read, vm write and
    /// vm operation.
    pub fn hook(&mut self) -> Result<()> {
        self.hook_with(ProcessAccess::default())
    }

    pub fn hook_with(&mut self, access: ProcessAccess) -> Result<()> {
        if self.hook.is_some() {
            return Err(MemoryError::AlreadyHooked(self.pid));
        }

        let pid = self.pid;
        let handle = self
            .api
            .open_process(pid, access)
            .map_err(|e| MemoryError::ProcessUnavailable { pid, code: e.code })?;

        let is_64 = match self.api.is_native_64bit(handle) {
            Ok(is_64) => is_64,
            Err(e) => {
                if let Err(close_err) = self.api.close_handle(handle) {
                    warn!("failed to release handle of process {}: {}", pid, close_err);
                }
                return Err(MemoryError::ProcessUnavailable { pid, code: e.code });
            }
        };

        let width = PointerWidth::from_native_64(is_64);
        debug!(
            "hooked process {} with access {:#x} ({}-bit)",
            pid,
            access.bits(),
            width.size() * 8
        );

        self.hook = Some(Hook {
            handle,
            width,
            base_module: OnceCell::new(),
        });

        Ok(())
    }

    /// Releases the handle and drops all cached state. The session is unhooked afterwards
    /// even if the OS reports a failure closing the handle.
    pub fn unhook(&mut self) -> Result<()> {
        let hook = self.hook.take().ok_or(MemoryError::NotHooked)?;
        debug!("unhooking process {}", self.pid);

        self.api
            .close_handle(hook.handle)
            .map_err(|e| MemoryError::CloseFailed { code: e.code })
    }

    pub fn is_hooked(&self) -> bool {
        self.hook.is_some()
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn active(&self) -> Result<&Hook> {
        self.hook.as_ref().ok_or(MemoryError::NotHooked)
    }

    /// The open process handle, for collaborators that must reuse it instead of opening
    /// their own. It stays valid until [`unhook`](Self::unhook).
    pub fn handle(&self) -> Result<ProcessHandle> {
        Ok(self.active()?.handle)
    }

    /// Whether the target is a native 64-bit process. WoW64 processes are 32-bit.
    pub fn is_bitness_64(&self) -> Result<bool> {
        Ok(self.active()?.width == PointerWidth::Bits64)
    }

    pub fn pointer_width(&self) -> Result<PointerWidth> {
        Ok(self.active()?.width)
    }

    /// Path of the target's executable image.
    pub fn image_path(&self) -> Result<PathBuf> {
        let pid = self.pid;
        self.api
            .module_file_name(self.active()?.handle, None)
            .map_err(|e| MemoryError::ProcessUnavailable { pid, code: e.code })
    }

    pub fn modules(&self) -> Result<ModuleCatalog<'_, A>> {
        Ok(ModuleCatalog::new(&self.api, self.active()?))
    }

    pub fn memory(&self) -> Result<MemoryTransport<'_, A>> {
        Ok(MemoryTransport::new(&self.api, self.active()?.handle))
    }

    pub fn pointers(&self) -> Result<PointerChainResolver<'_, A>> {
        let hook = self.active()?;
        Ok(PointerChainResolver::new(
            MemoryTransport::new(&self.api, hook.handle),
            ModuleCatalog::new(&self.api, hook),
            hook.width,
        ))
    }

    pub fn typed(&self) -> Result<TypedMemoryView<'_, A>> {
        let hook = self.active()?;
        Ok(TypedMemoryView::new(
            MemoryTransport::new(&self.api, hook.handle),
            hook.width,
        ))
    }
}

impl<A: ProcessApi> Drop for ProcessSession<A> {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            if let Err(e) = self.api.close_handle(hook.handle) {
                warn!("failed to release handle of process {}: {}", self.pid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::fake::{FakeProcess, ACCESS_DENIED, HANDLE};

    #[test]
    fn rejects_zero_pid() {
        let fake = FakeProcess::new(42);

        assert_eq!(
            ProcessSession::with_api(0, &fake).err(),
            Some(MemoryError::InvalidProcessId(0))
        );
    }

    #[test]
    fn rejects_process_that_is_not_running() {
        let fake = FakeProcess::new(42).exited();

        assert_eq!(
            ProcessSession::with_api(42, &fake).err(),
            Some(MemoryError::ProcessNotFound(42))
        );
    }

    #[test]
    fn hook_twice_fails() {
        let fake = FakeProcess::new(42);
        let mut session = ProcessSession::with_api(42, &fake).unwrap();

        session.hook().unwrap();
        assert_eq!(session.hook(), Err(MemoryError::AlreadyHooked(42)));
        assert!(session.is_hooked());
        assert_eq!(fake.opened.get(), 1);
    }

    #[test]
    fn unhook_without_hook_fails() {
        let fake = FakeProcess::new(42);
        let mut session = ProcessSession::with_api(42, &fake).unwrap();

        assert_eq!(session.unhook(), Err(MemoryError::NotHooked));

        session.hook().unwrap();
        session.unhook().unwrap();
        assert_eq!(session.unhook(), Err(MemoryError::NotHooked));
        assert_eq!(fake.closed.get(), 1);
    }

    #[test]
    fn session_can_be_rehooked_after_unhook() {
        let fake = FakeProcess::new(42);
        let mut session = ProcessSession::with_api(42, &fake).unwrap();

        session.hook().unwrap();
        session.unhook().unwrap();
        session.hook().unwrap();

        assert!(session.is_hooked());
        assert_eq!(fake.opened.get(), 2);
    }

    #[test]
    fn refused_open_reports_os_code() {
        let fake = FakeProcess::new(42).refuse_open(ACCESS_DENIED);
        let mut session = ProcessSession::with_api(42, &fake).unwrap();

        assert_eq!(
            session.hook(),
            Err(MemoryError::ProcessUnavailable {
                pid: 42,
                code: ACCESS_DENIED
            })
        );
        assert!(!session.is_hooked());
    }

    #[test]
    fn failed_bitness_query_releases_handle() {
        let fake = FakeProcess::new(42).fail_bitness(6);
        let mut session = ProcessSession::with_api(42, &fake).unwrap();

        assert_eq!(
            session.hook(),
            Err(MemoryError::ProcessUnavailable { pid: 42, code: 6 })
        );
        assert!(!session.is_hooked());
        assert_eq!(fake.opened.get(), 1);
        assert_eq!(fake.closed.get(), 1);
    }

    #[test]
    fn bitness_requires_hook() {
        let fake = FakeProcess::new(42).bits32();
        let mut session = ProcessSession::with_api(42, &fake).unwrap();

        assert_eq!(session.is_bitness_64(), Err(MemoryError::NotHooked));
        assert_eq!(session.handle(), Err(MemoryError::NotHooked));
        assert!(session.memory().is_err());

        session.hook().unwrap();
        assert_eq!(session.is_bitness_64(), Ok(false));
        assert_eq!(session.pointer_width(), Ok(PointerWidth::Bits32));

        session.unhook().unwrap();
        assert_eq!(session.is_bitness_64(), Err(MemoryError::NotHooked));
    }

    #[test]
    fn exposes_open_handle() {
        let fake = FakeProcess::new(42);
        let mut session = ProcessSession::with_api(42, &fake).unwrap();
        session.hook().unwrap();

        assert_eq!(session.handle(), Ok(HANDLE));
        assert_eq!(session.pid(), 42);
        assert_eq!(session.is_bitness_64(), Ok(true));
    }

    #[test]
    fn drop_releases_handle() {
        let fake = FakeProcess::new(42);
        {
            let mut session = ProcessSession::with_api(42, &fake).unwrap();
            session.hook().unwrap();
        }
        assert_eq!(fake.closed.get(), 1);

        {
            let mut session = ProcessSession::with_api(42, &fake).unwrap();
            session.hook().unwrap();
            session.unhook().unwrap();
        }
        assert_eq!(fake.closed.get(), 2);
    }

    #[test]
    fn image_path_comes_from_process() {
        let fake = FakeProcess::new(42).module(
            "C:/Games/Space/Invaders.exe",
            crate::os::ModuleInfo {
                base: 0x40_0000,
                size: 0x1000,
                entry_point: 0x40_0010,
            },
        );
        let mut session = ProcessSession::with_api(42, &fake).unwrap();

        assert_eq!(session.image_path(), Err(MemoryError::NotHooked));
        session.hook().unwrap();
        assert_eq!(
            session.image_path().unwrap(),
            PathBuf::from("C:/Games/Space/Invaders.exe")
        );
    }
}
