//! # Vectored Exception Handler
//!
//! One handler per process, registered first in the chain. The installed
//! [`Watcher`] is published through an atomic pointer so the handler never
//! takes a lock; `init` and `uninit` are serialised by [`LIFECYCLE`].
//!
//! ## APIs Used
//!
//! - `AddVectoredExceptionHandler` / `RemoveVectoredExceptionHandler`
//! - `VirtualProtect`: re-apply `PAGE_GUARD` after the single-step and on `refresh`
//!
//! ## References
//!
//! - [Vectored Exception Handling](https://learn.microsoft.com/en-us/windows/win32/debug/vectored-exception-handling)
//! - [Creating Guard Pages](https://learn.microsoft.com/en-us/windows/win32/memory/creating-guard-pages)

use std::cell::Cell;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tracing::{debug, warn};
use tripwire_core::debug_registers::TRAP_FLAG;
use tripwire_core::types::{Address, ThreadId};
use windows::Win32::Foundation::{STATUS_GUARD_PAGE_VIOLATION, STATUS_SINGLE_STEP};
use windows::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, RemoveVectoredExceptionHandler, EXCEPTION_POINTERS,
};
use windows::Win32::System::Memory::{VirtualProtect, PAGE_PROTECTION_FLAGS};
use windows::Win32::System::Threading::GetCurrentThreadId;

use crate::watcher::{Action, Fault, Rearm, Watcher};

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// How long `uninit` waits for handlers still inside the watcher
const RETIRE_TIMEOUT: Duration = Duration::from_secs(2);

static WATCHER: AtomicPtr<Watcher> = AtomicPtr::new(ptr::null_mut());
static IN_FLIGHT: AtomicU32 = AtomicU32::new(0);

/// Handler registration, owned by whoever holds the lock
pub struct Lifecycle
{
    registration: usize,
}

pub static LIFECYCLE: Lazy<Mutex<Lifecycle>> = Lazy::new(|| Mutex::new(Lifecycle { registration: 0 }));

thread_local! {
    static REARM_PENDING: Cell<bool> = const { Cell::new(false) };
}

impl Lifecycle
{
    /// Publish `watcher` and make sure the handler is registered.
    pub fn install(&mut self, watcher: Watcher) -> bool
    {
        self.retire();

        if self.registration == 0 {
            // SAFETY: `on_exception` matches PVECTORED_EXCEPTION_HANDLER and
            // stays valid while the module is loaded.
            let handle = unsafe { AddVectoredExceptionHandler(1, Some(on_exception)) };
            if handle.is_null() {
                warn!("AddVectoredExceptionHandler failed");
                return false;
            }
            self.registration = handle as usize;
        }

        WATCHER.store(Box::into_raw(Box::new(watcher)), Ordering::Release);
        debug!("Exception handler armed");
        true
    }

    /// Remove the handler and release the watcher.
    pub fn uninstall(&mut self)
    {
        if self.registration != 0 {
            // SAFETY: `registration` came from AddVectoredExceptionHandler.
            if unsafe { RemoveVectoredExceptionHandler(self.registration as *const c_void) } == 0 {
                warn!("RemoveVectoredExceptionHandler failed");
            }
            self.registration = 0;
        }
        self.retire();
    }

    /// The published watcher, if any.
    pub fn current(&self) -> Option<&Watcher>
    {
        // SAFETY: the pointer is only freed by `retire`, which needs `&mut self`.
        unsafe { WATCHER.load(Ordering::Acquire).as_ref() }
    }

    // Unpublish, then wait for handlers that loaded the old pointer. If they
    // do not leave in time the watcher (and its mapping) is leaked.
    fn retire(&mut self)
    {
        let old = WATCHER.swap(ptr::null_mut(), Ordering::AcqRel);
        if old.is_null() {
            return;
        }

        let started = Instant::now();
        while IN_FLIGHT.load(Ordering::Acquire) != 0 {
            if started.elapsed() >= RETIRE_TIMEOUT {
                warn!("Exception handlers did not drain; leaking the channel mapping");
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        // SAFETY: `old` came from Box::into_raw and no handler can reach it now.
        drop(unsafe { Box::from_raw(old) });
    }
}

unsafe extern "system" fn on_exception(info: *mut EXCEPTION_POINTERS) -> i32
{
    IN_FLIGHT.fetch_add(1, Ordering::AcqRel);
    // SAFETY: the OS passes valid exception pointers for the duration of the call.
    let verdict = panic::catch_unwind(AssertUnwindSafe(|| unsafe { dispatch(info) })).unwrap_or(EXCEPTION_CONTINUE_SEARCH);
    IN_FLIGHT.fetch_sub(1, Ordering::AcqRel);
    verdict
}

unsafe fn dispatch(info: *mut EXCEPTION_POINTERS) -> i32
{
    // SAFETY: published watchers stay alive while IN_FLIGHT is non-zero.
    let Some(watcher) = (unsafe { WATCHER.load(Ordering::Acquire).as_ref() }) else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    // SAFETY: both records are valid for the duration of the handler.
    let (record, context) = unsafe { (&*(*info).ExceptionRecord, &mut *(*info).ContextRecord) };

    let fault = if record.ExceptionCode == STATUS_GUARD_PAGE_VIOLATION {
        // ExceptionInformation[1] holds the inaccessible data address
        Fault::GuardPage {
            address: Address::new(record.ExceptionInformation[1] as u64),
        }
    } else if record.ExceptionCode == STATUS_SINGLE_STEP {
        Fault::SingleStep {
            dr6: u64::from(context.Dr6),
        }
    } else {
        Fault::Other
    };

    // SAFETY: no preconditions.
    let thread = ThreadId(unsafe { GetCurrentThreadId() });
    let action = REARM_PENDING.with(|pending| watcher.handle(fault, thread, pending));

    match action {
        Action::ContinueSearch => EXCEPTION_CONTINUE_SEARCH,
        Action::Continue {
            set_trap_flag,
            clear_dr6,
            rearm,
        } => {
            if set_trap_flag {
                context.EFlags |= TRAP_FLAG as u32;
            }
            if clear_dr6 {
                context.Dr6 = 0;
            }
            if let Some(rearm) = rearm {
                apply(&rearm);
            }
            EXCEPTION_CONTINUE_EXECUTION
        }
    }
}

/// Set the page protection described by `rearm`; false if it could not be applied.
pub fn apply(rearm: &Rearm) -> bool
{
    let mut old = PAGE_PROTECTION_FLAGS(0);
    // SAFETY: the page belongs to this process and was committed when the
    // watch started.
    let result = unsafe {
        VirtualProtect(
            rearm.page.value() as *const c_void,
            rearm.size,
            PAGE_PROTECTION_FLAGS(rearm.protection.bits()),
            &mut old,
        )
    };
    if let Err(e) = result {
        warn!("Re-arming guard on {} failed: {e}", rearm.page);
        return false;
    }
    true
}
