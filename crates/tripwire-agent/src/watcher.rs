//! # Fault Decisions
//!
//! What the agent's exception handler does with a fault, separated from the
//! Windows plumbing so it can run against a heap-backed channel in tests.
//!
//! ## Guard page cycle
//!
//! 1. An access to the guarded page raises `STATUS_GUARD_PAGE_VIOLATION`; the
//!    OS has already removed the guard bit.
//! 2. If the address lies inside the watched range and the channel is active,
//!    the hit is recorded.
//! 3. The handler sets the trap flag and continues: the access now succeeds.
//! 4. The following `STATUS_SINGLE_STEP` re-applies the guard, unless the
//!    controller has deactivated the channel in the meantime.
//!
//! ## Hardware breakpoints
//!
//! Data breakpoints also arrive as `STATUS_SINGLE_STEP`. DR6 says which slot
//! fired; the watched address is recorded because the CPU does not report
//! the exact byte that was touched.
//!
//! ## After invalidation
//!
//! A thread can take its guard fault before shutdown restores the page and
//! only reach the handler after the channel was invalidated. The page and
//! slot are captured when the watcher is created, so such late faults are
//! still swallowed instead of reaching the default handler.

use std::cell::Cell;

use tripwire_core::channel::{AgentChannel, ChannelHeader, NO_SLOT};
use tripwire_core::debug_registers::{DebugContext, SlotIndex};
use tripwire_core::types::{Address, Protection, ThreadId};

/// A fault as seen by the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault
{
    /// Guard page violation at this data address
    GuardPage
    {
        address: Address,
    },
    /// Single-step or data breakpoint; DR6 of the faulting thread
    SingleStep
    {
        dr6: u64,
    },
    /// Anything else
    Other,
}

/// Page protection to re-apply before continuing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rearm
{
    pub page: Address,
    pub size: usize,
    pub protection: Protection,
}

/// What the handler should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action
{
    /// Not ours; let the next handler look at it
    ContinueSearch,
    /// Resume the faulting thread after applying these changes
    Continue
    {
        set_trap_flag: bool,
        clear_dr6: bool,
        rearm: Option<Rearm>,
    },
}

impl Action
{
    const fn resume() -> Self
    {
        Self::Continue {
            set_trap_flag: false,
            clear_dr6: false,
            rearm: None,
        }
    }
}

/// The agent's channel plus the decision logic
pub struct Watcher
{
    channel: AgentChannel,
    /// Guarded page as configured at creation, if page-guard mode
    page: Option<(u64, u64)>,
    slot: Option<SlotIndex>,
}

fn in_range(address: Address, start: u64, len: u64) -> bool
{
    address.value() >= start && address.value() - start < len
}

fn slot_of(header: &ChannelHeader) -> Option<SlotIndex>
{
    if header.breakpoint_slot == NO_SLOT {
        return None;
    }
    u8::try_from(header.breakpoint_slot).ok().and_then(|slot| SlotIndex::new(slot).ok())
}

fn slot_fired(dr6: u64, slot: SlotIndex) -> bool
{
    DebugContext { dr6, ..DebugContext::default() }.slot_hit(slot)
}

fn rearm_of(header: &ChannelHeader) -> Rearm
{
    Rearm {
        page: Address::new(header.page_base),
        size: header.page_size as usize,
        protection: Protection(header.original_protection).with_guard(),
    }
}

impl Watcher
{
    #[must_use]
    pub fn new(channel: AgentChannel) -> Self
    {
        let header = channel.header();
        let page = (header.use_page_guard != 0).then_some((header.page_base, u64::from(header.page_size)));
        Self {
            channel,
            page,
            slot: slot_of(&header),
        }
    }

    /// Page-guard rearm for the current configuration, if any
    #[must_use]
    pub fn guard(&self) -> Option<Rearm>
    {
        let header = self.channel.header();
        (header.use_page_guard != 0).then(|| rearm_of(&header))
    }

    #[must_use]
    pub const fn channel(&self) -> &AgentChannel
    {
        &self.channel
    }

    /// Decide what to do with `fault` on `thread`
    ///
    /// `rearm_pending` is the faulting thread's own flag linking a guard fault
    /// to the single-step that follows it.
    pub fn handle(&self, fault: Fault, thread: ThreadId, rearm_pending: &Cell<bool>) -> Action
    {
        if matches!(fault, Fault::Other) {
            return Action::ContinueSearch;
        }
        if !self.channel.is_valid() {
            return self.after_invalidation(fault, rearm_pending);
        }

        let _scope = self.channel.enter_handler();
        let header = self.channel.header();
        match fault {
            Fault::GuardPage { address } => self.on_guard_page(&header, address, thread, rearm_pending),
            Fault::SingleStep { dr6 } => self.on_single_step(&header, dr6, thread, rearm_pending),
            Fault::Other => Action::ContinueSearch,
        }
    }

    // Channel gone: only absorb faults that this watcher caused
    fn after_invalidation(&self, fault: Fault, rearm_pending: &Cell<bool>) -> Action
    {
        match fault {
            Fault::GuardPage { address } => match self.page {
                Some((base, size)) if in_range(address, base, size) => {
                    rearm_pending.set(false);
                    Action::resume()
                }
                _ => Action::ContinueSearch,
            },
            Fault::SingleStep { dr6 } => {
                let fired = self.slot.is_some_and(|slot| slot_fired(dr6, slot));
                if rearm_pending.replace(false) || fired {
                    Action::Continue {
                        set_trap_flag: false,
                        clear_dr6: fired,
                        rearm: None,
                    }
                } else {
                    Action::ContinueSearch
                }
            }
            Fault::Other => Action::ContinueSearch,
        }
    }

    fn on_guard_page(&self, header: &ChannelHeader, address: Address, thread: ThreadId, rearm_pending: &Cell<bool>) -> Action
    {
        if header.use_page_guard == 0 || !in_range(address, header.page_base, u64::from(header.page_size)) {
            return Action::ContinueSearch;
        }

        // Inactive: the guard is already gone, so just let the access through
        if !self.channel.is_active() {
            return Action::resume();
        }

        if in_range(address, header.watch_address, u64::from(header.breakpoint_size)) {
            self.channel.record_hit(address, thread);
        }
        rearm_pending.set(true);
        Action::Continue {
            set_trap_flag: true,
            clear_dr6: false,
            rearm: None,
        }
    }

    fn on_single_step(&self, header: &ChannelHeader, dr6: u64, thread: ThreadId, rearm_pending: &Cell<bool>) -> Action
    {
        let mut ours = false;
        let mut rearm = None;
        let active = self.channel.is_active();

        if rearm_pending.replace(false) {
            ours = true;
            if active {
                rearm = Some(rearm_of(header));
            }
        }

        let mut clear_dr6 = false;
        if let Some(slot) = slot_of(header) {
            if slot_fired(dr6, slot) {
                ours = true;
                clear_dr6 = true;
                if active {
                    self.channel.record_hit(Address::new(header.watch_address), thread);
                }
            }
        }

        if !ours {
            return Action::ContinueSearch;
        }
        Action::Continue {
            set_trap_flag: false,
            clear_dr6,
            rearm,
        }
    }
}

#[cfg(test)]
mod tests
{
    use tripwire_core::channel::{HeapRegion, SharedChannel};

    use super::*;

    const PAGE: u64 = 0x0040_0000;

    fn watcher(header: ChannelHeader) -> (SharedChannel, Watcher)
    {
        let region = HeapRegion::new(tripwire_core::channel::CHANNEL_SIZE);
        let shared = SharedChannel::from_region(Box::new(region.clone()), "test").unwrap();
        shared.initialize(&header);
        shared.set_active(true);
        let agent = AgentChannel::open(Box::new(region)).unwrap();
        (shared, Watcher::new(agent))
    }

    fn page_guard_header() -> ChannelHeader
    {
        ChannelHeader {
            watch_address: PAGE + 0x10,
            breakpoint_size: 4,
            breakpoint_slot: NO_SLOT,
            use_page_guard: 1,
            page_base: PAGE,
            page_size: 0x1000,
            original_protection: Protection::READ_WRITE.bits(),
            ..ChannelHeader::default()
        }
    }

    fn hardware_header(slot: u32) -> ChannelHeader
    {
        ChannelHeader {
            watch_address: 0x0200_0040,
            breakpoint_size: 4,
            breakpoint_type: 1,
            breakpoint_slot: slot,
            ..ChannelHeader::default()
        }
    }

    #[test]
    fn test_guard_hit_then_single_step_rearms()
    {
        let (shared, watcher) = watcher(page_guard_header());
        let pending = Cell::new(false);

        let action = watcher.handle(Fault::GuardPage { address: Address::new(PAGE + 0x12) }, ThreadId(7), &pending);
        assert_eq!(
            action,
            Action::Continue {
                set_trap_flag: true,
                clear_dr6: false,
                rearm: None
            }
        );
        assert!(pending.get());
        assert_eq!(shared.hit_count(), 1);
        assert_eq!(shared.entry(0), (Address::new(PAGE + 0x12), ThreadId(7)));

        let action = watcher.handle(Fault::SingleStep { dr6: 0 }, ThreadId(7), &pending);
        assert_eq!(
            action,
            Action::Continue {
                set_trap_flag: false,
                clear_dr6: false,
                rearm: Some(Rearm {
                    page: Address::new(PAGE),
                    size: 0x1000,
                    protection: Protection::READ_WRITE.with_guard(),
                })
            }
        );
        assert!(!pending.get());
        assert_eq!(watcher.channel().active_handlers(), 0);
    }

    #[test]
    fn test_guard_outside_watch_rearms_without_hit()
    {
        let (shared, watcher) = watcher(page_guard_header());
        let pending = Cell::new(false);

        let action = watcher.handle(Fault::GuardPage { address: Address::new(PAGE + 0x800) }, ThreadId(7), &pending);
        assert!(matches!(action, Action::Continue { set_trap_flag: true, .. }));
        assert_eq!(shared.hit_count(), 0);
    }

    #[test]
    fn test_guard_on_other_page_is_not_ours()
    {
        let (_shared, watcher) = watcher(page_guard_header());
        let pending = Cell::new(false);

        let action = watcher.handle(Fault::GuardPage { address: Address::new(PAGE + 0x1000) }, ThreadId(7), &pending);
        assert_eq!(action, Action::ContinueSearch);
        assert!(!pending.get());
    }

    #[test]
    fn test_inactive_channel_stops_rearming()
    {
        let (shared, watcher) = watcher(page_guard_header());
        let pending = Cell::new(false);

        // Fault taken while active, single-step arrives after deactivation
        watcher.handle(Fault::GuardPage { address: Address::new(PAGE + 0x10) }, ThreadId(7), &pending);
        shared.set_active(false);
        let action = watcher.handle(Fault::SingleStep { dr6: 0 }, ThreadId(7), &pending);
        assert!(matches!(action, Action::Continue { rearm: None, .. }));

        // A later guard fault on the page is still swallowed
        let action = watcher.handle(Fault::GuardPage { address: Address::new(PAGE + 0x10) }, ThreadId(8), &pending);
        assert!(matches!(action, Action::Continue { set_trap_flag: false, .. }));
        assert_eq!(shared.hit_count(), 1);
    }

    #[test]
    fn test_invalid_channel_passes_everything_on()
    {
        let (shared, watcher) = watcher(page_guard_header());
        shared.invalidate();
        let pending = Cell::new(false);

        let action = watcher.handle(Fault::SingleStep { dr6: 0 }, ThreadId(7), &pending);
        assert_eq!(action, Action::ContinueSearch);
        let action = watcher.handle(Fault::GuardPage { address: Address::new(PAGE + 0x1000) }, ThreadId(7), &pending);
        assert_eq!(action, Action::ContinueSearch);
    }

    #[test]
    fn test_guard_fault_after_invalidation_is_swallowed()
    {
        let (shared, watcher) = watcher(page_guard_header());
        let pending = Cell::new(false);
        shared.set_active(false);
        shared.invalidate();

        let action = watcher.handle(Fault::GuardPage { address: Address::new(PAGE + 0x10) }, ThreadId(7), &pending);
        assert_eq!(action, Action::resume());
        assert!(!pending.get());
        assert_eq!(shared.hit_count(), 0);
        assert_eq!(watcher.channel().active_handlers(), 0);
    }

    #[test]
    fn test_pending_single_step_after_invalidation_is_swallowed()
    {
        let (shared, watcher) = watcher(page_guard_header());
        let pending = Cell::new(false);

        watcher.handle(Fault::GuardPage { address: Address::new(PAGE + 0x10) }, ThreadId(7), &pending);
        shared.set_active(false);
        shared.invalidate();
        let action = watcher.handle(Fault::SingleStep { dr6: 0 }, ThreadId(7), &pending);
        assert_eq!(action, Action::resume());
        assert!(!pending.get());
    }

    #[test]
    fn test_slot_hit_after_invalidation_clears_dr6()
    {
        let (shared, watcher) = watcher(hardware_header(1));
        shared.invalidate();
        let pending = Cell::new(false);

        let action = watcher.handle(Fault::SingleStep { dr6: 1 << 1 }, ThreadId(9), &pending);
        assert_eq!(
            action,
            Action::Continue {
                set_trap_flag: false,
                clear_dr6: true,
                rearm: None
            }
        );
        assert_eq!(shared.hit_count(), 0);
    }

    #[test]
    fn test_guard_reflects_configuration()
    {
        let (_shared, guarded) = watcher(page_guard_header());
        assert_eq!(
            guarded.guard(),
            Some(Rearm {
                page: Address::new(PAGE),
                size: 0x1000,
                protection: Protection::READ_WRITE.with_guard(),
            })
        );
        let (_shared, hardware) = watcher(hardware_header(0));
        assert_eq!(hardware.guard(), None);
    }

    #[test]
    fn test_hardware_slot_hit_recorded()
    {
        let (shared, watcher) = watcher(hardware_header(2));
        let pending = Cell::new(false);

        let action = watcher.handle(Fault::SingleStep { dr6: 1 << 2 }, ThreadId(9), &pending);
        assert_eq!(
            action,
            Action::Continue {
                set_trap_flag: false,
                clear_dr6: true,
                rearm: None
            }
        );
        assert_eq!(shared.entry(0), (Address::new(0x0200_0040), ThreadId(9)));
    }

    #[test]
    fn test_other_slot_is_not_ours()
    {
        let (shared, watcher) = watcher(hardware_header(2));
        let pending = Cell::new(false);

        assert_eq!(
            watcher.handle(Fault::SingleStep { dr6: 1 << 0 }, ThreadId(9), &pending),
            Action::ContinueSearch
        );
        assert_eq!(watcher.handle(Fault::Other, ThreadId(9), &pending), Action::ContinueSearch);
        assert_eq!(shared.hit_count(), 0);
    }
}
