use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{
    ModuleHandle, ModuleInfo, OsError, Pid, PointerWidth, ProcessAccess, ProcessApi,
    ProcessHandle, Protection, RegionInfo, RegionState,
};

pub(crate) const ACCESS_DENIED: i32 = 5;
pub(crate) const PARTIAL_COPY: i32 = 299;
pub(crate) const HANDLE: ProcessHandle = ProcessHandle(0x1234);

pub(crate) struct FakeModule {
    pub(crate) handle: ModuleHandle,
    pub(crate) path: PathBuf,
    pub(crate) info: Result<ModuleInfo, OsError>,
}

/// Scripted target process: byte-granular memory, a module list and injectable failures,
/// with a log of every call the memory layer makes.
pub(crate) struct FakeProcess {
    pid: Pid,
    running: bool,
    native_64: bool,
    open_error: Option<i32>,
    bitness_error: Option<i32>,
    memory: RefCell<BTreeMap<usize, u8>>,
    read_only: RefCell<Vec<(usize, usize)>>,
    modules: Vec<FakeModule>,
    pub(crate) opened: Cell<usize>,
    pub(crate) closed: Cell<usize>,
    pub(crate) reads: RefCell<Vec<(usize, usize)>>,
    pub(crate) writes: RefCell<Vec<(usize, Vec<u8>)>>,
    pub(crate) enum_widths: RefCell<Vec<PointerWidth>>,
    pub(crate) info_calls: Cell<usize>,
}

impl FakeProcess {
    pub(crate) fn new(pid: Pid) -> Self {
        Self {
            pid,
            running: true,
            native_64: true,
            open_error: None,
            bitness_error: None,
            memory: RefCell::new(BTreeMap::new()),
            read_only: RefCell::new(Vec::new()),
            modules: Vec::new(),
            opened: Cell::new(0),
            closed: Cell::new(0),
            reads: RefCell::new(Vec::new()),
            writes: RefCell::new(Vec::new()),
            enum_widths: RefCell::new(Vec::new()),
            info_calls: Cell::new(0),
        }
    }

    pub(crate) fn exited(mut self) -> Self {
        self.running = false;
        self
    }

    pub(crate) fn bits32(mut self) -> Self {
        self.native_64 = false;
        self
    }

    pub(crate) fn refuse_open(mut self, code: i32) -> Self {
        self.open_error = Some(code);
        self
    }

    pub(crate) fn fail_bitness(mut self, code: i32) -> Self {
        self.bitness_error = Some(code);
        self
    }

    pub(crate) fn map(self, address: usize, bytes: &[u8]) -> Self {
        self.memory
            .borrow_mut()
            .extend(bytes.iter().enumerate().map(|(i, b)| (address + i, *b)));
        self
    }

    pub(crate) fn map_zeroed(self, address: usize, len: usize) -> Self {
        self.map(address, &vec![0; len])
    }

    pub(crate) fn protect_read_only(self, address: usize, len: usize) -> Self {
        self.read_only.borrow_mut().push((address, address + len));
        self
    }

    pub(crate) fn module(mut self, path: &str, info: ModuleInfo) -> Self {
        self.modules.push(FakeModule {
            handle: ModuleHandle::from_raw(info.base),
            path: PathBuf::from(path),
            info: Ok(info),
        });
        self
    }

    pub(crate) fn broken_module(mut self, path: &str, handle: usize, code: i32) -> Self {
        self.modules.push(FakeModule {
            handle: ModuleHandle::from_raw(handle),
            path: PathBuf::from(path),
            info: Err(OsError::new(code)),
        });
        self
    }

    pub(crate) fn peek(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        let memory = self.memory.borrow();
        (address..address + len)
            .map(|a| memory.get(&a).copied())
            .collect()
    }

    fn is_mapped(&self, address: usize) -> bool {
        self.memory.borrow().contains_key(&address)
    }

    fn find_module(&self, module: ModuleHandle) -> Result<&FakeModule, OsError> {
        self.modules
            .iter()
            .find(|m| m.handle == module)
            .ok_or(OsError::new(126))
    }
}

impl ProcessApi for FakeProcess {
    fn process_exists(&self, pid: Pid) -> bool {
        self.running && pid == self.pid
    }

    fn open_process(&self, pid: Pid, _access: ProcessAccess) -> Result<ProcessHandle, OsError> {
        if let Some(code) = self.open_error {
            return Err(OsError::new(code));
        }
        if pid != self.pid {
            return Err(OsError::new(87));
        }

        self.opened.set(self.opened.get() + 1);
        Ok(HANDLE)
    }

    fn close_handle(&self, handle: ProcessHandle) -> Result<(), OsError> {
        assert_eq!(handle, HANDLE);
        self.closed.set(self.closed.get() + 1);
        Ok(())
    }

    fn is_native_64bit(&self, _handle: ProcessHandle) -> Result<bool, OsError> {
        match self.bitness_error {
            Some(code) => Err(OsError::new(code)),
            None => Ok(self.native_64),
        }
    }

    fn read_memory(
        &self,
        handle: ProcessHandle,
        address: usize,
        buffer: &mut [u8],
    ) -> Result<(), OsError> {
        assert_eq!(handle, HANDLE);
        self.reads.borrow_mut().push((address, buffer.len()));

        let bytes = self
            .peek(address, buffer.len())
            .ok_or(OsError::new(PARTIAL_COPY))?;
        buffer.copy_from_slice(&bytes);
        Ok(())
    }

    fn write_memory(
        &self,
        handle: ProcessHandle,
        address: usize,
        data: &[u8],
    ) -> Result<(), OsError> {
        assert_eq!(handle, HANDLE);

        let end = address + data.len();
        let mapped = (address..end).all(|a| self.is_mapped(a));
        let protected = self
            .read_only
            .borrow()
            .iter()
            .any(|&(start, stop)| address < stop && start < end);
        if !mapped || protected {
            return Err(OsError::new(PARTIAL_COPY));
        }

        let mut memory = self.memory.borrow_mut();
        for (i, b) in data.iter().enumerate() {
            memory.insert(address + i, *b);
        }
        self.writes.borrow_mut().push((address, data.to_vec()));
        Ok(())
    }

    fn query_region(&self, _handle: ProcessHandle, address: usize) -> Result<RegionInfo, OsError> {
        // runs of mapped bytes form committed regions
        let memory = self.memory.borrow();
        if memory.contains_key(&address) {
            let mut base = address;
            while base > 0 && memory.contains_key(&(base - 1)) {
                base -= 1;
            }
            let mut end = address;
            while memory.contains_key(&end) {
                end += 1;
            }

            return Ok(RegionInfo {
                base,
                size: end - base,
                state: RegionState::Committed,
                protection: Protection {
                    readable: true,
                    writable: true,
                    executable: false,
                    guarded: false,
                },
            });
        }

        let next = memory
            .range(address..)
            .next()
            .map_or(usize::MAX, |(a, _)| *a);
        Ok(RegionInfo {
            base: address,
            size: next - address,
            state: RegionState::Free,
            protection: Protection::default(),
        })
    }

    fn enum_modules(
        &self,
        _handle: ProcessHandle,
        width: PointerWidth,
    ) -> Result<Vec<ModuleHandle>, OsError> {
        self.enum_widths.borrow_mut().push(width);
        Ok(self.modules.iter().map(|m| m.handle).collect())
    }

    fn module_info(
        &self,
        _handle: ProcessHandle,
        module: ModuleHandle,
    ) -> Result<ModuleInfo, OsError> {
        self.info_calls.set(self.info_calls.get() + 1);
        self.find_module(module)?.info
    }

    fn module_file_name(
        &self,
        _handle: ProcessHandle,
        module: Option<ModuleHandle>,
    ) -> Result<PathBuf, OsError> {
        match module {
            Some(module) => Ok(self.find_module(module)?.path.clone()),
            None => self
                .modules
                .first()
                .map(|m| m.path.clone())
                .ok_or(OsError::new(ACCESS_DENIED)),
        }
    }
}
