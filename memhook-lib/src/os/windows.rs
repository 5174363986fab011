use std::ffi::OsString;
use std::os::windows::ffi::OsStringExt;
use std::path::PathBuf;

use sysinfo::{System, SystemExt};
use winapi::{
    shared::{
        basetsd::SIZE_T,
        minwindef::{BOOL, DWORD, FALSE, HMODULE, LPCVOID, LPVOID, MAX_PATH},
    },
    um::{
        handleapi::CloseHandle,
        memoryapi::{ReadProcessMemory, VirtualQueryEx, WriteProcessMemory},
        processthreadsapi::OpenProcess,
        psapi::{
            EnumProcessModulesEx, GetModuleFileNameExW, GetModuleInformation,
            LIST_MODULES_32BIT, LIST_MODULES_64BIT, MODULEINFO,
        },
        sysinfoapi::{GetNativeSystemInfo, SYSTEM_INFO},
        winnt::{
            HANDLE, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_FREE, PAGE_EXECUTE,
            PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD,
            PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY, PROCESSOR_ARCHITECTURE_INTEL,
        },
        wow64apiset::IsWow64Process,
    },
};

use super::{
    ModuleHandle, ModuleInfo, OsError, Pid, PointerWidth, ProcessAccess, ProcessApi,
    ProcessHandle, Protection, RegionInfo, RegionState,
};

const MODULE_BUFFER_AMOUNT: usize = 256;
const ERROR_PARTIAL_COPY: i32 = 299;
// long path aware buffer, GetModuleFileNameExW truncates silently
const PATH_BUFFER_LEN: usize = MAX_PATH * 128;

/// Native backend over kernel32 and psapi.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeApi;

impl NativeApi {
    pub fn new() -> crate::Result<Self> {
        Ok(Self)
    }
}

fn raw(handle: ProcessHandle) -> HANDLE {
    handle.as_raw() as HANDLE
}

fn is_64bit_os() -> bool {
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetNativeSystemInfo(&mut info) };

    unsafe { info.u.s().wProcessorArchitecture } != PROCESSOR_ARCHITECTURE_INTEL
}

fn protection_of(protect: DWORD) -> Protection {
    let access = protect & 0xFF;

    Protection {
        readable: matches!(
            access,
            PAGE_READONLY
                | PAGE_READWRITE
                | PAGE_WRITECOPY
                | PAGE_EXECUTE_READ
                | PAGE_EXECUTE_READWRITE
                | PAGE_EXECUTE_WRITECOPY
        ),
        writable: matches!(
            access,
            PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
        ),
        executable: matches!(
            access,
            PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
        ),
        guarded: protect & PAGE_GUARD != 0,
    }
}

impl ProcessApi for NativeApi {
    fn process_exists(&self, pid: Pid) -> bool {
        let mut sys = System::new();
        sys.refresh_process(sysinfo::Pid::from(pid as usize))
    }

    fn open_process(&self, pid: Pid, access: ProcessAccess) -> Result<ProcessHandle, OsError> {
        let process_handle = unsafe { OpenProcess(access.bits(), FALSE, pid as DWORD) };
        if process_handle.is_null() {
            return Err(OsError::last());
        }

        Ok(ProcessHandle::from_raw(process_handle as usize))
    }

    fn close_handle(&self, handle: ProcessHandle) -> Result<(), OsError> {
        if unsafe { CloseHandle(raw(handle)) } == 0 {
            return Err(OsError::last());
        }

        Ok(())
    }

    fn is_native_64bit(&self, handle: ProcessHandle) -> Result<bool, OsError> {
        if !is_64bit_os() {
            return Ok(false);
        }

        let mut is_wow64: BOOL = FALSE;
        if unsafe { IsWow64Process(raw(handle), &mut is_wow64) } == 0 {
            return Err(OsError::last());
        }

        Ok(is_wow64 == FALSE)
    }

    fn read_memory(
        &self,
        handle: ProcessHandle,
        address: usize,
        buffer: &mut [u8],
    ) -> Result<(), OsError> {
        let mut read: SIZE_T = 0;
        let result = unsafe {
            ReadProcessMemory(
                raw(handle),
                address as LPCVOID,
                buffer.as_mut_ptr() as LPVOID,
                buffer.len(),
                &mut read,
            )
        };

        if result == 0 {
            return Err(OsError::last());
        }
        if read != buffer.len() {
            return Err(OsError::new(ERROR_PARTIAL_COPY));
        }

        Ok(())
    }

    fn write_memory(
        &self,
        handle: ProcessHandle,
        address: usize,
        data: &[u8],
    ) -> Result<(), OsError> {
        let mut written: SIZE_T = 0;
        let result = unsafe {
            WriteProcessMemory(
                raw(handle),
                address as LPVOID,
                data.as_ptr() as LPCVOID,
                data.len(),
                &mut written,
            )
        };

        if result == 0 {
            return Err(OsError::last());
        }
        if written != data.len() {
            return Err(OsError::new(ERROR_PARTIAL_COPY));
        }

        Ok(())
    }

    fn query_region(&self, handle: ProcessHandle, address: usize) -> Result<RegionInfo, OsError> {
        let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let mbi_size = std::mem::size_of::<MEMORY_BASIC_INFORMATION>();

        let result =
            unsafe { VirtualQueryEx(raw(handle), address as LPCVOID, &mut mbi, mbi_size) };
        if result == 0 {
            return Err(OsError::last());
        }

        let state = match mbi.State {
            MEM_COMMIT => RegionState::Committed,
            MEM_FREE => RegionState::Free,
            _ => RegionState::Reserved,
        };

        Ok(RegionInfo {
            base: mbi.BaseAddress as usize,
            size: mbi.RegionSize,
            state,
            protection: protection_of(mbi.Protect),
        })
    }

    fn enum_modules(
        &self,
        handle: ProcessHandle,
        width: PointerWidth,
    ) -> Result<Vec<ModuleHandle>, OsError> {
        let filter = match width {
            PointerWidth::Bits32 => LIST_MODULES_32BIT,
            PointerWidth::Bits64 => LIST_MODULES_64BIT,
        };
        // the OS fills the array with handles sized for this process
        let stride = std::mem::size_of::<HMODULE>();

        let mut modules: Vec<HMODULE> = vec![std::ptr::null_mut(); MODULE_BUFFER_AMOUNT];
        loop {
            let mut cb_needed: DWORD = 0;
            let result = unsafe {
                EnumProcessModulesEx(
                    raw(handle),
                    modules.as_mut_ptr(),
                    (modules.len() * stride) as DWORD,
                    &mut cb_needed,
                    filter,
                )
            };
            if result == 0 {
                return Err(OsError::last());
            }

            let count = cb_needed as usize / stride;
            if count <= modules.len() {
                modules.truncate(count);
                break;
            }

            // more modules were loaded than fit, retry with room for all of them
            modules = vec![std::ptr::null_mut(); count];
        }

        Ok(modules
            .into_iter()
            .filter(|module| !module.is_null())
            .map(|module| ModuleHandle::from_raw(module as usize))
            .collect())
    }

    fn module_info(
        &self,
        handle: ProcessHandle,
        module: ModuleHandle,
    ) -> Result<ModuleInfo, OsError> {
        let mut info: MODULEINFO = unsafe { std::mem::zeroed() };
        let result = unsafe {
            GetModuleInformation(
                raw(handle),
                module.as_raw() as HMODULE,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as DWORD,
            )
        };
        if result == 0 {
            return Err(OsError::last());
        }

        Ok(ModuleInfo {
            base: info.lpBaseOfDll as usize,
            size: info.SizeOfImage as usize,
            entry_point: info.EntryPoint as usize,
        })
    }

    fn module_file_name(
        &self,
        handle: ProcessHandle,
        module: Option<ModuleHandle>,
    ) -> Result<PathBuf, OsError> {
        let module = module.map_or(std::ptr::null_mut(), |module| module.as_raw() as HMODULE);

        let mut file_name = vec![0u16; PATH_BUFFER_LEN];
        let length = unsafe {
            GetModuleFileNameExW(
                raw(handle),
                module,
                file_name.as_mut_ptr(),
                file_name.len() as DWORD,
            )
        };
        if length == 0 {
            return Err(OsError::last());
        }

        Ok(PathBuf::from(OsString::from_wide(
            &file_name[..length as usize],
        )))
    }
}
