use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use libc::{c_void, iovec, pid_t, process_vm_readv, process_vm_writev};
use sysinfo::{System, SystemExt};

use super::{
    ModuleHandle, ModuleInfo, OsError, Pid, PointerWidth, ProcessAccess, ProcessApi,
    ProcessHandle, Protection, RegionInfo, RegionState,
};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ET_DYN: u16 = 3;

/// Native backend over procfs and the `process_vm_*` syscalls.
///
/// Linux has no process handle object: the handle carries the pid, and opening only verifies
/// that the caller may access `/proc/<pid>/mem` in the requested mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeApi;

impl NativeApi {
    pub fn new() -> crate::Result<Self> {
        Ok(Self)
    }
}

fn pid_of(handle: ProcessHandle) -> pid_t {
    handle.as_raw() as pid_t
}

fn mem_path(handle: ProcessHandle) -> String {
    format!("/proc/{}/mem", pid_of(handle))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Mapping {
    start: usize,
    end: usize,
    protection: Protection,
    path: Option<PathBuf>,
}

/// Splits the next whitespace-delimited field off `line`.
fn next_field(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    if line.is_empty() {
        return None;
    }

    let end = line.find(char::is_whitespace).unwrap_or(line.len());
    Some(line.split_at(end))
}

fn parse_mapping(line: &str) -> Option<Mapping> {
    let (range, rest) = next_field(line)?;
    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;

    let (perms, rest) = next_field(rest)?;
    let perms = perms.as_bytes();
    if perms.len() < 3 {
        return None;
    }
    let protection = Protection {
        readable: perms[0] == b'r',
        writable: perms[1] == b'w',
        executable: perms[2] == b'x',
        guarded: false,
    };

    // offset, device, inode
    let (_, rest) = next_field(rest)?;
    let (_, rest) = next_field(rest)?;
    let (_, rest) = next_field(rest)?;

    // the pathname is the rest of the line, spaces included
    let pathname = rest.trim_start();
    let pathname = pathname.strip_suffix(" (deleted)").unwrap_or(pathname);
    let path = pathname
        .starts_with('/')
        .then(|| PathBuf::from(pathname));

    Some(Mapping {
        start,
        end,
        protection,
        path,
    })
}

fn parse_maps(content: &str) -> Vec<Mapping> {
    content.lines().filter_map(parse_mapping).collect()
}

fn read_maps(handle: ProcessHandle) -> Result<Vec<Mapping>, OsError> {
    let content = fs::read_to_string(format!("/proc/{}/maps", pid_of(handle)))?;
    Ok(parse_maps(&content))
}

fn exe_path(handle: ProcessHandle) -> Result<PathBuf, OsError> {
    Ok(fs::read_link(format!("/proc/{}/exe", pid_of(handle)))?)
}

struct ImageMapping {
    path: PathBuf,
    start: usize,
    end: usize,
    executable: bool,
}

/// Groups file-backed mappings into loaded images. Images with no executable mapping (data
/// files, locale archives) are not modules. The process executable comes first, the rest in
/// address order.
fn group_images(mappings: &[Mapping], exe: Option<&Path>) -> Vec<ImageMapping> {
    let mut images: Vec<ImageMapping> = Vec::new();

    for mapping in mappings {
        let Some(path) = &mapping.path else {
            continue;
        };

        match images.iter_mut().find(|image| &image.path == path) {
            Some(image) => {
                image.start = image.start.min(mapping.start);
                image.end = image.end.max(mapping.end);
                image.executable |= mapping.protection.executable;
            }
            None => images.push(ImageMapping {
                path: path.clone(),
                start: mapping.start,
                end: mapping.end,
                executable: mapping.protection.executable,
            }),
        }
    }

    images.retain(|image| image.executable);
    images.sort_by_key(|image| (Some(image.path.as_path()) != exe, image.start));
    images
}

fn find_image(handle: ProcessHandle, module: ModuleHandle) -> Result<ImageMapping, OsError> {
    let mappings = read_maps(handle)?;

    group_images(&mappings, None)
        .into_iter()
        .find(|image| image.start == module.as_raw())
        .ok_or(OsError::new(libc::ENOENT))
}

/// Entry point as recorded in the ELF header mapped at `base`.
fn elf_entry_point(api: &NativeApi, handle: ProcessHandle, base: usize) -> Result<usize, OsError> {
    let mut header = [0u8; 32];
    api.read_memory(handle, base, &mut header)?;

    if header[..4] != ELF_MAGIC {
        return Err(OsError::new(libc::ENOEXEC));
    }

    let entry = match header[4] {
        ELFCLASS32 => LittleEndian::read_u32(&header[24..28]) as usize,
        ELFCLASS64 => LittleEndian::read_u64(&header[24..32]) as usize,
        _ => return Err(OsError::new(libc::ENOEXEC)),
    };

    // position independent images record the entry relative to their load base
    if LittleEndian::read_u16(&header[16..18]) == ET_DYN {
        Ok(base.wrapping_add(entry))
    } else {
        Ok(entry)
    }
}

/// Fails unless `[address, address + length)` is covered by contiguous writable mappings.
/// `process_vm_writev` stops at the first faulting page after copying everything before it,
/// so the range is checked up front.
fn ensure_writable(mappings: &[Mapping], address: usize, length: usize) -> Result<(), OsError> {
    let end = address
        .checked_add(length)
        .ok_or(OsError::new(libc::EFAULT))?;
    let mut covered = address;

    for mapping in mappings.iter().skip_while(|mapping| mapping.end <= address) {
        if covered >= end {
            break;
        }
        if mapping.start > covered || !mapping.protection.writable {
            return Err(OsError::new(libc::EFAULT));
        }
        covered = mapping.end;
    }

    if covered < end {
        return Err(OsError::new(libc::EFAULT));
    }

    Ok(())
}

fn is_fallback_error(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENOSYS) | Some(libc::EPERM))
}

impl ProcessApi for NativeApi {
    fn process_exists(&self, pid: Pid) -> bool {
        let mut sys = System::new();
        sys.refresh_process(sysinfo::Pid::from(pid as usize))
    }

    fn open_process(&self, pid: Pid, access: ProcessAccess) -> Result<ProcessHandle, OsError> {
        let handle = ProcessHandle::from_raw(pid as usize);
        let read = access.contains(ProcessAccess::VM_READ);
        let write = access.contains(ProcessAccess::VM_WRITE);

        if read || write {
            OpenOptions::new()
                .read(read)
                .write(write)
                .open(mem_path(handle))?;
        } else {
            fs::metadata(format!("/proc/{pid}"))?;
        }

        Ok(handle)
    }

    fn close_handle(&self, _handle: ProcessHandle) -> Result<(), OsError> {
        Ok(())
    }

    fn is_native_64bit(&self, handle: ProcessHandle) -> Result<bool, OsError> {
        let mut ident = [0u8; 5];
        File::open(format!("/proc/{}/exe", pid_of(handle)))?.read_exact(&mut ident)?;

        if ident[..4] != ELF_MAGIC {
            return Err(OsError::new(libc::ENOEXEC));
        }

        match ident[4] {
            ELFCLASS64 => Ok(true),
            ELFCLASS32 => Ok(false),
            _ => Err(OsError::new(libc::ENOEXEC)),
        }
    }

    fn read_memory(
        &self,
        handle: ProcessHandle,
        address: usize,
        buffer: &mut [u8],
    ) -> Result<(), OsError> {
        let size = buffer.len();
        let local_iov = iovec {
            iov_base: buffer.as_mut_ptr() as *mut c_void,
            iov_len: size,
        };
        let remote_iov = iovec {
            iov_base: address as *mut c_void,
            iov_len: size,
        };

        let result = unsafe { process_vm_readv(pid_of(handle), &local_iov, 1, &remote_iov, 1, 0) };
        if result == -1 {
            let err = std::io::Error::last_os_error();
            if !is_fallback_error(&err) {
                return Err(err.into());
            }

            let procmem = File::open(mem_path(handle))?;
            return procmem
                .read_exact_at(buffer, address as u64)
                .map_err(|e| OsError::new(e.raw_os_error().unwrap_or(libc::EFAULT)));
        }

        if result as usize != size {
            return Err(OsError::new(libc::EFAULT));
        }

        Ok(())
    }

    fn write_memory(
        &self,
        handle: ProcessHandle,
        address: usize,
        data: &[u8],
    ) -> Result<(), OsError> {
        let size = data.len();
        ensure_writable(&read_maps(handle)?, address, size)?;

        let local_iov = iovec {
            iov_base: data.as_ptr() as *mut c_void,
            iov_len: size,
        };
        let remote_iov = iovec {
            iov_base: address as *mut c_void,
            iov_len: size,
        };

        let result =
            unsafe { process_vm_writev(pid_of(handle), &local_iov, 1, &remote_iov, 1, 0) };
        if result == -1 {
            let err = std::io::Error::last_os_error();
            if !is_fallback_error(&err) {
                return Err(err.into());
            }

            let procmem = OpenOptions::new().write(true).open(mem_path(handle))?;
            return procmem
                .write_all_at(data, address as u64)
                .map_err(|e| OsError::new(e.raw_os_error().unwrap_or(libc::EFAULT)));
        }

        if result as usize != size {
            return Err(OsError::new(libc::EFAULT));
        }

        Ok(())
    }

    fn query_region(&self, handle: ProcessHandle, address: usize) -> Result<RegionInfo, OsError> {
        let mappings = read_maps(handle)?;

        match mappings.iter().find(|mapping| mapping.end > address) {
            Some(mapping) if mapping.start <= address => Ok(RegionInfo {
                base: mapping.start,
                size: mapping.end - mapping.start,
                state: RegionState::Committed,
                protection: mapping.protection,
            }),
            // unmapped gap up to the next mapping
            Some(mapping) => Ok(RegionInfo {
                base: address,
                size: mapping.start - address,
                state: RegionState::Free,
                protection: Protection::default(),
            }),
            None => Ok(RegionInfo {
                base: address,
                size: usize::MAX - address,
                state: RegionState::Free,
                protection: Protection::default(),
            }),
        }
    }

    fn enum_modules(
        &self,
        handle: ProcessHandle,
        _width: PointerWidth,
    ) -> Result<Vec<ModuleHandle>, OsError> {
        // procfs reports mappings independently of the reader's pointer width
        let mappings = read_maps(handle)?;
        let exe = exe_path(handle).ok();

        Ok(group_images(&mappings, exe.as_deref())
            .into_iter()
            .map(|image| ModuleHandle::from_raw(image.start))
            .collect())
    }

    fn module_info(
        &self,
        handle: ProcessHandle,
        module: ModuleHandle,
    ) -> Result<ModuleInfo, OsError> {
        let image = find_image(handle, module)?;
        let entry_point = elf_entry_point(self, handle, image.start)?;

        Ok(ModuleInfo {
            base: image.start,
            size: image.end - image.start,
            entry_point,
        })
    }

    fn module_file_name(
        &self,
        handle: ProcessHandle,
        module: Option<ModuleHandle>,
    ) -> Result<PathBuf, OsError> {
        match module {
            Some(module) => Ok(find_image(handle, module)?.path),
            None => exe_path(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 08:02 1311 /usr/bin/game
55d0c0a02000-55d0c0a08000 r-xp 00002000 08:02 1311 /usr/bin/game
55d0c0a08000-55d0c0a0a000 rw-p 00008000 08:02 1311 /usr/bin/game
55d0c1000000-55d0c1021000 rw-p 00000000 00:00 0    [heap]
7f1e2c000000-7f1e2c200000 r--p 00000000 08:02 2201 /usr/lib/locale/locale-archive
7f1e2d000000-7f1e2d028000 r--p 00000000 08:02 3301 /usr/lib/libc.so.6
7f1e2d028000-7f1e2d1bd000 r-xp 00028000 08:02 3301 /usr/lib/libc.so.6
7f1e2d400000-7f1e2d401000 r-xp 00000000 08:02 4401 /opt/my lib/libspace.so
7ffd4a300000-7ffd4a321000 rw-p 00000000 00:00 0    [stack]
";

    #[test]
    fn parses_permissions_and_paths() {
        let mappings = parse_maps(MAPS);

        assert_eq!(mappings.len(), 9);
        assert_eq!(mappings[1].start, 0x55d0c0a02000);
        assert!(mappings[1].protection.executable);
        assert!(!mappings[1].protection.writable);
        assert_eq!(mappings[3].path, None);
        assert_eq!(
            mappings[7].path.as_deref(),
            Some(Path::new("/opt/my lib/libspace.so"))
        );
    }

    #[test]
    fn groups_executable_images_with_exe_first() {
        let mappings = parse_maps(MAPS);
        let images = group_images(&mappings, Some(Path::new("/usr/bin/game")));

        let paths: Vec<&Path> = images.iter().map(|image| image.path.as_path()).collect();
        assert_eq!(
            paths,
            vec![
                Path::new("/usr/bin/game"),
                Path::new("/usr/lib/libc.so.6"),
                Path::new("/opt/my lib/libspace.so"),
            ]
        );
        assert_eq!(images[0].start, 0x55d0c0a00000);
        assert_eq!(images[0].end, 0x55d0c0a0a000);
    }

    #[test]
    fn keeps_path_spacing_and_drops_deleted_marker() {
        let maps = "\
00400000-00401000 r-xp 00000000 08:02 7          /opt/two  spaces/game
7f0000000000-7f0000001000 r-xp 00000000 08:02 8 /usr/lib/libold.so (deleted)
";
        let mappings = parse_maps(maps);

        assert_eq!(
            mappings[0].path.as_deref(),
            Some(Path::new("/opt/two  spaces/game"))
        );
        assert_eq!(
            mappings[1].path.as_deref(),
            Some(Path::new("/usr/lib/libold.so"))
        );
    }

    #[test]
    fn deleted_image_groups_under_its_own_path() {
        let maps = "\
00400000-00401000 r--p 00000000 08:02 7 /usr/bin/game (deleted)
00401000-00402000 r-xp 00001000 08:02 7 /usr/bin/game (deleted)
";
        let mappings = parse_maps(maps);
        let images = group_images(&mappings, Some(Path::new("/usr/bin/game")));

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].start, 0x400000);
        assert_eq!(images[0].end, 0x402000);
    }

    #[test]
    fn write_range_must_be_writable_throughout() {
        let maps = "\
10000-12000 rw-p 00000000 00:00 0
12000-13000 rw-p 00000000 00:00 0
13000-14000 r--p 00000000 00:00 0
15000-16000 rw-p 00000000 00:00 0
";
        let mappings = parse_maps(maps);

        assert_eq!(ensure_writable(&mappings, 0x11000, 0x1800), Ok(()));
        assert_eq!(ensure_writable(&mappings, 0x10000, 0x3000), Ok(()));
        assert_eq!(ensure_writable(&mappings, 0x14000, 0), Ok(()));

        let fault = Err(OsError::new(libc::EFAULT));
        // straddles into the read-only mapping
        assert_eq!(ensure_writable(&mappings, 0x12ffc, 8), fault);
        // runs into the unmapped gap
        assert_eq!(ensure_writable(&mappings, 0x15ffc, 8), fault);
        assert_eq!(ensure_writable(&mappings, 0x14800, 0x1000), fault);
        assert_eq!(ensure_writable(&mappings, 0x20000, 4), fault);
        assert_eq!(ensure_writable(&mappings, usize::MAX - 2, 8), fault);
    }

    #[test]
    fn executable_is_listed_first_even_above_lower_images() {
        let maps = "\
00400000-00401000 r-xp 00000000 08:02 1 /lib/low.so
7f0000000000-7f0000001000 r-xp 00000000 08:02 2 /usr/bin/high
";
        let mappings = parse_maps(maps);
        let images = group_images(&mappings, Some(Path::new("/usr/bin/high")));

        assert_eq!(images[0].path, Path::new("/usr/bin/high"));
        assert_eq!(images[1].path, Path::new("/lib/low.so"));
    }
}
