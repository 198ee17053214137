//! Functions the controller calls through remote threads.
//!
//! Each runs on a short-lived thread created by the controller and returns
//! the value that becomes the thread's exit code.

use std::slice;

use tracing::{debug, warn};
use tripwire_core::channel::{AgentChannel, CHANNEL_SIZE, NO_SLOT};
use tripwire_core::debug_registers::{BreakCondition, BreakSize, SlotIndex};
use tripwire_core::hardware::HardwareBreakpointManager;
use tripwire_core::platform::win32::{NamedMapping, WindowsThreads};
use tripwire_core::types::Address;

use crate::veh::{self, LIFECYCLE};
use crate::watcher::Watcher;

const MAX_NAME_UNITS: usize = 512;

// SAFETY (caller): `name` points at a NUL-terminated UTF-16 string.
unsafe fn read_wide(name: *const u16) -> Option<String>
{
    if name.is_null() {
        return None;
    }
    let mut len = 0;
    // SAFETY: reads stop at the terminator or the length cap.
    while len < MAX_NAME_UNITS && unsafe { *name.add(len) } != 0 {
        len += 1;
    }
    if len == MAX_NAME_UNITS {
        return None;
    }
    // SAFETY: `len` units were just read.
    String::from_utf16(unsafe { slice::from_raw_parts(name, len) }).ok()
}

fn slot_index(raw: u32) -> Option<SlotIndex>
{
    u8::try_from(raw).ok().and_then(|slot| SlotIndex::new(slot).ok())
}

fn program(slot: u32, address: u64, kind: u32, size: u32) -> bool
{
    let Some(slot) = slot_index(slot) else {
        return false;
    };
    let Ok(size) = BreakSize::from_len(size) else {
        return false;
    };
    let threads = WindowsThreads::for_current_process();
    match HardwareBreakpointManager::new(&threads).program(
        slot,
        Address::new(address),
        BreakCondition::from_bits(u64::from(kind)),
        size,
    ) {
        Ok(report) => {
            debug!("{slot} programmed on {} thread(s)", report.programmed);
            true
        }
        Err(e) => {
            warn!("Programming {slot} failed: {e}");
            false
        }
    }
}

/// Open the shared channel named by `channel_name` and arm the handler
///
/// # Safety
///
/// `channel_name` must point at a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "system" fn init(channel_name: *const u16) -> u32
{
    // SAFETY: forwarded from the caller.
    let Some(name) = (unsafe { read_wide(channel_name) }) else {
        return 0;
    };
    let channel = match NamedMapping::open(&name, CHANNEL_SIZE).and_then(|mapping| AgentChannel::open(Box::new(mapping))) {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Agent could not open {name}: {e}");
            return 0;
        }
    };
    u32::from(LIFECYCLE.lock().unwrap().install(Watcher::new(channel)))
}

/// Remove the handler and unmap the channel.
#[no_mangle]
pub extern "system" fn uninit() -> u32
{
    LIFECYCLE.lock().unwrap().uninstall();
    1
}

/// Program a debug register slot on every other thread of this process.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn installBreakpoint(slot: u32, address: u64, kind: u32, size: u32) -> u32
{
    u32::from(program(slot, address, kind, size))
}

/// Disable a debug register slot on every other thread of this process.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn clearBreakpoint(slot: u32) -> u32
{
    let Some(slot) = slot_index(slot) else {
        return 0;
    };
    let threads = WindowsThreads::for_current_process();
    u32::from(HardwareBreakpointManager::new(&threads).clear(slot).is_ok())
}

/// Re-apply the watch: the guard bit in page-guard mode, otherwise the
/// breakpoint on every thread, including those started since `init`.
#[no_mangle]
pub extern "system" fn refresh() -> u32
{
    let lifecycle = LIFECYCLE.lock().unwrap();
    let Some(watcher) = lifecycle.current() else {
        return 0;
    };
    let channel = watcher.channel();
    if !channel.is_active() {
        return 0;
    }
    if let Some(guard) = watcher.guard() {
        return u32::from(veh::apply(&guard));
    }
    let header = channel.header();
    if header.breakpoint_slot == NO_SLOT {
        return 0;
    }
    u32::from(program(
        header.breakpoint_slot,
        header.watch_address,
        header.breakpoint_type,
        header.breakpoint_size,
    ))
}
