//! # Windows Thread Control
//!
//! Thread enumeration, suspension and debug register access.
//!
//! ## APIs Used
//!
//! - `CreateToolhelp32Snapshot` / `Thread32First` / `Thread32Next`: list threads
//! - `OpenThread` / `SuspendThread` / `ResumeThread`: suspension
//! - `GetThreadContext` / `SetThreadContext`: native threads
//! - `Wow64GetThreadContext` / `Wow64SetThreadContext`: 32-bit threads seen
//!   from a 64-bit controller
//!
//! Only the debug registers and `EFlags` are requested
//! (`CONTEXT_DEBUG_REGISTERS | CONTEXT_CONTROL`).
//!
//! ## References
//!
//! - [GetThreadContext](https://learn.microsoft.com/en-us/windows/win32/api/processthreadsapi/nf-processthreadsapi-getthreadcontext)
//! - [Wow64GetThreadContext](https://learn.microsoft.com/en-us/windows/win32/api/winbase/nf-winbase-wow64getthreadcontext)

use std::mem;

use tracing::trace;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
#[cfg(target_arch = "x86")]
use windows::Win32::System::Diagnostics::Debug::{CONTEXT_CONTROL_X86, CONTEXT_DEBUG_REGISTERS_X86};
#[cfg(target_arch = "x86_64")]
use windows::Win32::System::Diagnostics::Debug::{
    Wow64GetThreadContext, Wow64SetThreadContext, CONTEXT_CONTROL_AMD64, CONTEXT_DEBUG_REGISTERS_AMD64, WOW64_CONTEXT,
    WOW64_CONTEXT_CONTROL, WOW64_CONTEXT_DEBUG_REGISTERS,
};
use windows::Win32::System::Diagnostics::Debug::{GetThreadContext, SetThreadContext, CONTEXT};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::Threading::{
    GetCurrentProcessId, GetCurrentThreadId, OpenThread, ResumeThread, SuspendThread, THREAD_GET_CONTEXT,
    THREAD_QUERY_INFORMATION, THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
};

use super::OwnedHandle;
use crate::debug_registers::DebugContext;
use crate::error::{Result, TripwireError};
use crate::target::{ThreadControl, ThreadHandle};
use crate::types::{ProcessId, ThreadId};

fn thread_error(thread: ThreadId, operation: &'static str, error: impl ToString) -> TripwireError
{
    TripwireError::ThreadFailed {
        thread,
        operation,
        reason: error.to_string(),
    }
}

fn raw_handle(handle: &ThreadHandle) -> HANDLE
{
    HANDLE(handle.raw as isize)
}

/// Threads of one process
#[derive(Debug, Clone, Copy)]
pub struct WindowsThreads
{
    pid: ProcessId,
    wow64: bool,
    exclude: Option<ThreadId>,
}

impl WindowsThreads
{
    /// Threads of `pid`; `wow64` selects the 32-bit context API.
    #[must_use]
    pub const fn new(pid: ProcessId, wow64: bool) -> Self
    {
        Self {
            pid,
            wow64,
            exclude: None,
        }
    }

    /// Threads of the calling process, minus the calling thread
    ///
    /// A thread cannot suspend itself and read a consistent context, so it
    /// is skipped.
    #[must_use]
    pub fn for_current_process() -> Self
    {
        // SAFETY: both calls only read per-thread/process identifiers.
        let (pid, tid) = unsafe { (GetCurrentProcessId(), GetCurrentThreadId()) };
        Self {
            pid: ProcessId(pid),
            wow64: false,
            exclude: Some(ThreadId(tid)),
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn get_context(&self, handle: &ThreadHandle) -> Result<DebugContext>
    {
        let thread = raw_handle(handle);
        if self.wow64 {
            let mut context = WOW64_CONTEXT {
                ContextFlags: WOW64_CONTEXT_DEBUG_REGISTERS | WOW64_CONTEXT_CONTROL,
                ..Default::default()
            };
            // SAFETY: `thread` is an open handle with THREAD_GET_CONTEXT.
            unsafe { Wow64GetThreadContext(thread, &mut context) }
                .map_err(|e| thread_error(handle.id, "get context", e))?;
            return Ok(DebugContext {
                dr: [context.Dr0, context.Dr1, context.Dr2, context.Dr3].map(u64::from),
                dr6: u64::from(context.Dr6),
                dr7: u64::from(context.Dr7),
                flags: u64::from(context.EFlags),
            });
        }

        let mut context = CONTEXT {
            ContextFlags: CONTEXT_DEBUG_REGISTERS_AMD64 | CONTEXT_CONTROL_AMD64,
            ..Default::default()
        };
        // SAFETY: as above; CONTEXT carries the alignment the API needs.
        unsafe { GetThreadContext(thread, &mut context) }.map_err(|e| thread_error(handle.id, "get context", e))?;
        Ok(DebugContext {
            dr: [context.Dr0, context.Dr1, context.Dr2, context.Dr3],
            dr6: context.Dr6,
            dr7: context.Dr7,
            flags: u64::from(context.EFlags),
        })
    }

    #[cfg(target_arch = "x86_64")]
    #[allow(clippy::cast_possible_truncation)]
    fn set_context(&self, handle: &ThreadHandle, debug: &DebugContext) -> Result<()>
    {
        let thread = raw_handle(handle);
        if self.wow64 {
            let mut context = WOW64_CONTEXT {
                ContextFlags: WOW64_CONTEXT_DEBUG_REGISTERS | WOW64_CONTEXT_CONTROL,
                ..Default::default()
            };
            // SAFETY: open handle with THREAD_GET_CONTEXT | THREAD_SET_CONTEXT.
            unsafe { Wow64GetThreadContext(thread, &mut context) }
                .map_err(|e| thread_error(handle.id, "get context", e))?;
            context.Dr0 = debug.dr[0] as u32;
            context.Dr1 = debug.dr[1] as u32;
            context.Dr2 = debug.dr[2] as u32;
            context.Dr3 = debug.dr[3] as u32;
            context.Dr6 = debug.dr6 as u32;
            context.Dr7 = debug.dr7 as u32;
            context.EFlags = debug.flags as u32;
            // SAFETY: as above.
            return unsafe { Wow64SetThreadContext(thread, &context) }
                .map_err(|e| thread_error(handle.id, "set context", e));
        }

        let mut context = CONTEXT {
            ContextFlags: CONTEXT_DEBUG_REGISTERS_AMD64 | CONTEXT_CONTROL_AMD64,
            ..Default::default()
        };
        // SAFETY: as above.
        unsafe { GetThreadContext(thread, &mut context) }.map_err(|e| thread_error(handle.id, "get context", e))?;
        [context.Dr0, context.Dr1, context.Dr2, context.Dr3] = debug.dr;
        context.Dr6 = debug.dr6;
        context.Dr7 = debug.dr7;
        context.EFlags = debug.flags as u32;
        // SAFETY: as above.
        unsafe { SetThreadContext(thread, &context) }.map_err(|e| thread_error(handle.id, "set context", e))
    }

    #[cfg(target_arch = "x86")]
    fn get_context(&self, handle: &ThreadHandle) -> Result<DebugContext>
    {
        let mut context = CONTEXT {
            ContextFlags: CONTEXT_DEBUG_REGISTERS_X86 | CONTEXT_CONTROL_X86,
            ..Default::default()
        };
        // SAFETY: open handle with THREAD_GET_CONTEXT.
        unsafe { GetThreadContext(raw_handle(handle), &mut context) }
            .map_err(|e| thread_error(handle.id, "get context", e))?;
        Ok(DebugContext {
            dr: [context.Dr0, context.Dr1, context.Dr2, context.Dr3].map(u64::from),
            dr6: u64::from(context.Dr6),
            dr7: u64::from(context.Dr7),
            flags: u64::from(context.EFlags),
        })
    }

    #[cfg(target_arch = "x86")]
    #[allow(clippy::cast_possible_truncation)]
    fn set_context(&self, handle: &ThreadHandle, debug: &DebugContext) -> Result<()>
    {
        let thread = raw_handle(handle);
        let mut context = CONTEXT {
            ContextFlags: CONTEXT_DEBUG_REGISTERS_X86 | CONTEXT_CONTROL_X86,
            ..Default::default()
        };
        // SAFETY: open handle with THREAD_GET_CONTEXT | THREAD_SET_CONTEXT.
        unsafe { GetThreadContext(thread, &mut context) }.map_err(|e| thread_error(handle.id, "get context", e))?;
        context.Dr0 = debug.dr[0] as u32;
        context.Dr1 = debug.dr[1] as u32;
        context.Dr2 = debug.dr[2] as u32;
        context.Dr3 = debug.dr[3] as u32;
        context.Dr6 = debug.dr6 as u32;
        context.Dr7 = debug.dr7 as u32;
        context.EFlags = debug.flags as u32;
        // SAFETY: as above.
        unsafe { SetThreadContext(thread, &context) }.map_err(|e| thread_error(handle.id, "set context", e))
    }
}

impl ThreadControl for WindowsThreads
{
    fn thread_ids(&self) -> Result<Vec<ThreadId>>
    {
        // SAFETY: the snapshot handle is owned and closed by `OwnedHandle`.
        let snapshot = OwnedHandle(unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }?);
        let mut entry = THREADENTRY32 {
            dwSize: mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };

        let mut threads = Vec::new();
        // SAFETY: `entry.dwSize` is initialised as the API requires.
        let mut more = unsafe { Thread32First(snapshot.0, &mut entry) }.is_ok();
        while more {
            let id = ThreadId(entry.th32ThreadID);
            if entry.th32OwnerProcessID == self.pid.0 && Some(id) != self.exclude {
                threads.push(id);
            }
            // SAFETY: as above.
            more = unsafe { Thread32Next(snapshot.0, &mut entry) }.is_ok();
        }
        trace!("Process {} has {} thread(s)", self.pid, threads.len());
        Ok(threads)
    }

    fn suspend_thread(&self, thread: ThreadId) -> Result<ThreadHandle>
    {
        let access = THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT | THREAD_SET_CONTEXT | THREAD_QUERY_INFORMATION;
        // SAFETY: opening a thread by ID has no memory-safety preconditions.
        let handle = unsafe { OpenThread(access, false, thread.0) }.map_err(|e| thread_error(thread, "open", e))?;

        // SAFETY: `handle` was just opened with THREAD_SUSPEND_RESUME.
        if unsafe { SuspendThread(handle) } == u32::MAX {
            let error = windows::core::Error::from_win32();
            // SAFETY: closing the handle opened above.
            let _ = unsafe { CloseHandle(handle) };
            return Err(thread_error(thread, "suspend", error));
        }

        Ok(ThreadHandle {
            id: thread,
            raw: handle.0 as usize,
        })
    }

    fn resume_thread(&self, handle: ThreadHandle) -> Result<()>
    {
        let raw = raw_handle(&handle);
        // SAFETY: `raw` came from `suspend_thread` and is closed exactly once here.
        let resumed = unsafe { ResumeThread(raw) };
        let error = (resumed == u32::MAX).then(windows::core::Error::from_win32);
        // SAFETY: as above.
        let _ = unsafe { CloseHandle(raw) };
        match error {
            Some(e) => Err(thread_error(handle.id, "resume", e)),
            None => Ok(()),
        }
    }

    fn read_debug_context(&self, handle: &ThreadHandle) -> Result<DebugContext>
    {
        self.get_context(handle)
    }

    fn write_debug_context(&self, handle: &ThreadHandle, context: &DebugContext) -> Result<()>
    {
        self.set_context(handle, context)
    }
}
