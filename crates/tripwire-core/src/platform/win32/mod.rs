//! # Windows Backend
//!
//! [`ProcessAccess`] and [`ThreadControl`] for a live Windows process, plus
//! named mappings for the shared channel.
//!
//! ## Key APIs Used
//!
//! - `OpenProcess` / `IsWow64Process`: open the target and detect a 32-bit target
//! - `ReadProcessMemory` / `WriteProcessMemory`: memory access
//! - `VirtualAllocEx` / `VirtualFreeEx` / `VirtualProtectEx` / `VirtualQueryEx`: pages
//! - `CreateRemoteThread` / `WaitForSingleObject` / `GetExitCodeThread`: remote calls
//! - `CreateToolhelp32Snapshot` / `Module32FirstW`: module list
//!
//! Loading a library uses the target's own `LoadLibraryW`, found through its
//! `kernel32.dll` export directory in target memory. That address is right
//! for 32-bit targets too, where the controller's own `kernel32` is not.
//!
//! ## References
//!
//! - [Memory Management Functions](https://learn.microsoft.com/en-us/windows/win32/memory/memory-management-functions)
//! - [CreateRemoteThread](https://learn.microsoft.com/en-us/windows/win32/api/processthreadsapi/nf-processthreadsapi-createremotethread)

pub mod mapping;
pub mod threads;

use std::ffi::c_void;
use std::mem;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub use mapping::{NamedMapping, WindowsRegionFactory};
pub use threads::WindowsThreads;
use tracing::{debug, warn};
use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
};
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT,
    MEM_RELEASE, MEM_RESERVE, PAGE_PROTECTION_FLAGS,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows::Win32::System::Threading::{
    CreateRemoteThread, GetCurrentProcess, GetExitCodeThread, IsWow64Process, OpenProcess, WaitForSingleObject,
    PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ, PROCESS_VM_WRITE,
};

use crate::agent::wide_string;
use crate::debug_registers::DebugContext;
use crate::error::{Result, TripwireError};
use crate::remote::RemoteExports;
use crate::target::{ProcessAccess, RemoteThread, ThreadControl, ThreadExit, ThreadHandle};
use crate::types::{Address, Bitness, ModuleInfo, ProcessId, Protection, RegionInfo, ThreadId};

const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle closed on drop
#[derive(Debug)]
pub struct OwnedHandle(pub HANDLE);

// SAFETY: kernel handles may be used from any thread.
unsafe impl Send for OwnedHandle {}
// SAFETY: as above.
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle
{
    fn drop(&mut self)
    {
        // SAFETY: the handle is owned by this value and closed once.
        let _ = unsafe { CloseHandle(self.0) };
    }
}

fn is_wow64(process: HANDLE) -> Result<bool>
{
    let mut wow64 = BOOL::default();
    // SAFETY: `process` is a valid process handle, `wow64` a valid out pointer.
    unsafe { IsWow64Process(process, &mut wow64) }?;
    Ok(wow64.as_bool())
}

fn utf16_until_nul(text: &[u16]) -> String
{
    let end = text.iter().position(|&c| c == 0).unwrap_or(text.len());
    String::from_utf16_lossy(&text[..end])
}

/// Remote thread started by [`WindowsProcess::start_remote_thread`]
pub struct WindowsRemoteThread
{
    id: ThreadId,
    handle: OwnedHandle,
}

impl RemoteThread for WindowsRemoteThread
{
    fn id(&self) -> ThreadId
    {
        self.id
    }

    fn join(&mut self, timeout: Duration) -> Result<ThreadExit>
    {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1);
        // SAFETY: the handle is open for the life of `self`.
        let wait = unsafe { WaitForSingleObject(self.handle.0, millis) };
        if wait == WAIT_TIMEOUT {
            return Ok(ThreadExit::TimedOut);
        }
        if wait != WAIT_OBJECT_0 {
            return Err(TripwireError::RemoteCallFailed(format!(
                "waiting for thread {}: {}",
                self.id,
                windows::core::Error::from_win32()
            )));
        }

        let mut code = 0u32;
        // SAFETY: as above; `code` is a valid out pointer.
        unsafe { GetExitCodeThread(self.handle.0, &mut code) }?;
        Ok(ThreadExit::Exited(code))
    }
}

/// An opened Windows process
pub struct WindowsProcess
{
    pid: ProcessId,
    handle: OwnedHandle,
    bitness: Bitness,
    page_size: u64,
    threads: WindowsThreads,
    modules: Mutex<Option<Vec<ModuleInfo>>>,
    load_timeout: Duration,
}

impl WindowsProcess
{
    /// Open `pid` with the rights needed for watching
    ///
    /// ## Errors
    ///
    /// - `Windows`: the process does not exist or access was denied
    /// - `UnsupportedPlatform`: a 64-bit target from a 32-bit controller
    pub fn open(pid: ProcessId) -> Result<Self>
    {
        let access =
            PROCESS_VM_READ | PROCESS_VM_WRITE | PROCESS_VM_OPERATION | PROCESS_CREATE_THREAD | PROCESS_QUERY_INFORMATION;
        // SAFETY: opening a process by ID has no memory-safety preconditions.
        let handle = OwnedHandle(unsafe { OpenProcess(access, false, pid.0) }?);

        let target_wow64 = is_wow64(handle.0)?;
        // SAFETY: pseudo handle, never closed.
        let host_wow64 = is_wow64(unsafe { GetCurrentProcess() })?;
        let bitness = if cfg!(target_arch = "x86_64") {
            if target_wow64 { Bitness::X86 } else { Bitness::X64 }
        } else if host_wow64 && !target_wow64 {
            return Err(TripwireError::UnsupportedPlatform);
        } else {
            Bitness::X86
        };

        let mut info = SYSTEM_INFO::default();
        // SAFETY: `info` is a valid out pointer.
        unsafe { GetSystemInfo(&mut info) };

        debug!("Opened process {pid} ({bitness})");
        Ok(Self {
            pid,
            handle,
            bitness,
            page_size: u64::from(info.dwPageSize),
            threads: WindowsThreads::new(pid, bitness == Bitness::X86 && cfg!(target_arch = "x86_64")),
            modules: Mutex::new(None),
            load_timeout: DEFAULT_LOAD_TIMEOUT,
        })
    }

    /// Bound the `LoadLibraryW` call in [`ProcessAccess::load_module_into_target`].
    #[must_use]
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self
    {
        self.load_timeout = timeout;
        self
    }

    fn snapshot_modules(&self) -> Result<Vec<ModuleInfo>>
    {
        // SAFETY: the snapshot handle is owned and closed by `OwnedHandle`.
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, self.pid.0) }
            .map(OwnedHandle)
            .map_err(|e| TripwireError::ModuleEnumerationFailed(e.to_string()))?;

        let mut entry = MODULEENTRY32W {
            dwSize: mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };
        let mut modules = Vec::new();
        // SAFETY: `entry.dwSize` is initialised as the API requires.
        let mut more = unsafe { Module32FirstW(snapshot.0, &mut entry) }.is_ok();
        while more {
            modules.push(ModuleInfo::new(
                utf16_until_nul(&entry.szModule),
                Address::new(entry.modBaseAddr as u64),
                u64::from(entry.modBaseSize),
            ));
            // SAFETY: as above.
            more = unsafe { Module32NextW(snapshot.0, &mut entry) }.is_ok();
        }

        if modules.is_empty() {
            return Err(TripwireError::ModuleEnumerationFailed(format!("process {} lists no modules", self.pid)));
        }
        Ok(modules)
    }

    fn find_module(&self, name: &str, force_refresh: bool) -> Result<Option<ModuleInfo>>
    {
        Ok(self
            .enumerate_modules(force_refresh)?
            .into_iter()
            .find(|module| module.name.eq_ignore_ascii_case(name)))
    }
}

impl ProcessAccess for WindowsProcess
{
    fn pid(&self) -> ProcessId
    {
        self.pid
    }

    fn bitness(&self) -> Bitness
    {
        self.bitness
    }

    fn read(&self, address: Address, size: usize) -> Result<Vec<u8>>
    {
        let mut buffer = vec![0u8; size];
        let mut read = 0usize;
        // SAFETY: `buffer` is valid for `size` bytes of writes.
        unsafe {
            ReadProcessMemory(
                self.handle.0,
                address.value() as *const c_void,
                buffer.as_mut_ptr().cast(),
                size,
                Some(&mut read),
            )
        }
        .map_err(|e| TripwireError::ReadFailed {
            address,
            size,
            reason: e.to_string(),
        })?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn write(&self, address: Address, bytes: &[u8]) -> Result<()>
    {
        // SAFETY: `bytes` is valid for `bytes.len()` bytes of reads.
        unsafe {
            WriteProcessMemory(
                self.handle.0,
                address.value() as *const c_void,
                bytes.as_ptr().cast(),
                bytes.len(),
                None,
            )
        }
        .map_err(|e| TripwireError::WriteFailed {
            address,
            size: bytes.len(),
            reason: e.to_string(),
        })
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<Address>
    {
        // SAFETY: letting the system choose the address.
        let base = unsafe {
            VirtualAllocEx(
                self.handle.0,
                None,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_PROTECTION_FLAGS(protection.bits()),
            )
        };
        if base.is_null() {
            return Err(TripwireError::AllocationFailed(format!(
                "{size} bytes in process {}: {}",
                self.pid,
                windows::core::Error::from_win32()
            )));
        }
        Ok(Address::new(base as u64))
    }

    fn free(&self, address: Address) -> Result<()>
    {
        // SAFETY: releasing a whole allocation made by `allocate`.
        unsafe { VirtualFreeEx(self.handle.0, address.value() as *mut c_void, 0, MEM_RELEASE) }?;
        Ok(())
    }

    fn protect(&self, address: Address, size: usize, protection: Protection) -> Result<Protection>
    {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: changes protection in the target only; `old` is a valid out pointer.
        unsafe {
            VirtualProtectEx(
                self.handle.0,
                address.value() as *const c_void,
                size,
                PAGE_PROTECTION_FLAGS(protection.bits()),
                &mut old,
            )
        }
        .map_err(|e| TripwireError::ProtectionChangeFailed {
            address,
            reason: e.to_string(),
        })?;
        Ok(Protection(old.0))
    }

    fn query_region(&self, address: Address) -> Result<RegionInfo>
    {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        // SAFETY: `info` is valid for `size_of::<MEMORY_BASIC_INFORMATION>()` bytes.
        let written = unsafe {
            VirtualQueryEx(
                self.handle.0,
                Some(address.value() as *const c_void),
                &mut info,
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return Err(TripwireError::PageNotAccessible {
                address,
                reason: windows::core::Error::from_win32().to_string(),
            });
        }
        Ok(RegionInfo {
            base: Address::new(info.BaseAddress as u64),
            size: info.RegionSize as u64,
            protection: Protection(info.Protect.0),
            committed: info.State == MEM_COMMIT,
        })
    }

    fn start_remote_thread(&self, entry: Address, argument: u64) -> Result<Box<dyn RemoteThread>>
    {
        // SAFETY: `entry` is code in the target; it is never called in this process.
        let routine: unsafe extern "system" fn(*mut c_void) -> u32 = unsafe { mem::transmute(entry.value() as usize) };
        let mut id = 0u32;
        // SAFETY: all pointers refer to the target's address space or valid locals.
        let handle = unsafe {
            CreateRemoteThread(
                self.handle.0,
                None,
                0,
                Some(routine),
                Some(argument as usize as *const c_void),
                0,
                Some(&mut id),
            )
        }?;
        Ok(Box::new(WindowsRemoteThread {
            id: ThreadId(id),
            handle: OwnedHandle(handle),
        }))
    }

    fn enumerate_modules(&self, force_refresh: bool) -> Result<Vec<ModuleInfo>>
    {
        let mut cache = self.modules.lock().unwrap();
        if force_refresh || cache.is_none() {
            *cache = Some(self.snapshot_modules()?);
        }
        Ok(cache.clone().unwrap_or_default())
    }

    fn load_module_into_target(&self, path: &Path) -> Result<Address>
    {
        let kernel32 = self
            .find_module("kernel32.dll", false)?
            .ok_or_else(|| TripwireError::ModuleEnumerationFailed("kernel32.dll is not loaded".to_string()))?;
        let load_library = RemoteExports::read(self, kernel32.base)?.require("LoadLibraryW")?;

        let path_text = path.to_string_lossy();
        let bytes = wide_string(&path_text);
        let buffer = self.allocate(bytes.len(), Protection::READ_WRITE)?;
        self.write(buffer, &bytes)?;

        let mut thread = self.start_remote_thread(load_library, buffer.value())?;
        match thread.join(self.load_timeout)? {
            ThreadExit::TimedOut => {
                warn!("LoadLibraryW({path_text}) timed out; leaving path buffer at {buffer} allocated");
                return Err(TripwireError::RemoteCallTimedOut {
                    function: load_library,
                    timeout: self.load_timeout,
                });
            }
            ThreadExit::Exited(code) => {
                if let Err(e) = self.free(buffer) {
                    warn!("Failed to free path buffer at {buffer}: {e}");
                }
                if code == 0 {
                    return Err(TripwireError::AgentLoadFailed(format!("LoadLibraryW({path_text}) returned NULL")));
                }
            }
        }

        let file_name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
        self.find_module(&file_name, true)?
            .map(|module| module.base)
            .ok_or_else(|| TripwireError::AgentLoadFailed(format!("{file_name} missing from module list after load")))
    }

    fn page_size(&self) -> u64
    {
        self.page_size
    }
}

impl ThreadControl for WindowsProcess
{
    fn thread_ids(&self) -> Result<Vec<ThreadId>>
    {
        self.threads.thread_ids()
    }

    fn suspend_thread(&self, thread: ThreadId) -> Result<ThreadHandle>
    {
        self.threads.suspend_thread(thread)
    }

    fn resume_thread(&self, handle: ThreadHandle) -> Result<()>
    {
        self.threads.resume_thread(handle)
    }

    fn read_debug_context(&self, handle: &ThreadHandle) -> Result<DebugContext>
    {
        self.threads.read_debug_context(handle)
    }

    fn write_debug_context(&self, handle: &ThreadHandle, context: &DebugContext) -> Result<()>
    {
        self.threads.write_debug_context(handle, context)
    }
}
