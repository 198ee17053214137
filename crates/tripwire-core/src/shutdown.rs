//! # Shutdown coordination
//!
//! Tears a session down without crashing the target. An exception handler
//! inside the target may be running at any moment, and a thread may be
//! parked between a guard-page fault and the single-step that re-arms the
//! guard. The order below makes every such state harmless before the agent
//! and the channel go away.
//!
//! ## Order
//!
//! 1. Clear the active flag, set shutdown-requested (agent stops re-arming)
//! 2. Clear the session's debug register slot on every thread (agent first,
//!    then from outside)
//! 3. Restore the watched page's original protection
//! 4. Wait (bounded) for in-flight handlers to drain
//! 5. Freeze every thread and clear any pending trap flag
//! 6. Invalidate the channel while frozen
//! 7. Resume every thread
//! 8. Call the agent's `uninit`
//! 9. Stop the poller, release the channel and the slot
//!
//! Every step tolerates missing resources, so the same routine rolls back a
//! half-started session. Failures are collected into the report and never
//! stop later steps.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::agent::AgentHandle;
use crate::channel::SharedChannel;
use crate::debug_registers::SlotIndex;
use crate::error::TripwireError;
use crate::guards::FrozenThreadSet;
use crate::hardware::HardwareBreakpointManager;
use crate::poller::PollerHandle;
use crate::slots::SharedSlots;
use crate::target::TargetProcess;
use crate::types::{Address, Protection};

const DRAIN_POLL: Duration = Duration::from_millis(1);

/// Guard page applied by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGuardState
{
    pub page_base: Address,
    pub page_size: u64,
    /// Protection before the guard bit was added
    pub original_protection: Protection,
}

/// A debug register slot reserved in a [`SlotRegistry`](crate::slots::SlotRegistry)
#[derive(Debug, Clone)]
pub struct SlotLease
{
    pub slots: SharedSlots,
    pub index: SlotIndex,
}

impl SlotLease
{
    /// Return the slot to its registry.
    pub fn release(self)
    {
        if !self.slots.lock().unwrap().release(self.index) {
            warn!("{} was already free", self.index);
        }
    }
}

/// Everything a session may hold in the target, acquired in any subset
#[derive(Default)]
pub struct SessionResources
{
    pub channel: Option<Arc<SharedChannel>>,
    pub agent: Option<AgentHandle>,
    pub slot: Option<SlotLease>,
    /// Whether the slot was written into thread contexts
    pub hardware_armed: bool,
    pub page_guard: Option<PageGuardState>,
    pub poller: Option<PollerHandle>,
}

impl SessionResources
{
    /// Whether nothing was acquired
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.channel.is_none()
            && self.agent.is_none()
            && self.slot.is_none()
            && self.page_guard.is_none()
            && self.poller.is_none()
    }
}

/// What happened during a shutdown
#[derive(Debug, Default)]
pub struct ShutdownReport
{
    /// In-flight handlers were still running when the drain timed out
    pub drain_timed_out: bool,
    /// Threads suspended in the freeze step
    pub threads_frozen: usize,
    /// Threads whose pending single-step was cancelled
    pub trap_flags_cleared: usize,
    /// Non-fatal errors, in the order they happened
    pub errors: Vec<TripwireError>,
}

impl ShutdownReport
{
    /// Whether the shutdown completed without any error.
    #[must_use]
    pub fn is_clean(&self) -> bool
    {
        self.errors.is_empty()
    }

    fn record(&mut self, step: &str, error: TripwireError)
    {
        warn!("Shutdown {step}: {error}");
        self.errors.push(error);
    }
}

/// Runs the shutdown order over a session's resources
pub struct ShutdownCoordinator<'a, T: TargetProcess + ?Sized>
{
    target: &'a T,
    drain_timeout: Duration,
}

impl<'a, T: TargetProcess + ?Sized> ShutdownCoordinator<'a, T>
{
    #[must_use]
    pub fn new(target: &'a T, drain_timeout: Duration) -> Self
    {
        Self { target, drain_timeout }
    }

    /// Tear down `resources`; never fails, see the report.
    pub fn run(&self, mut resources: SessionResources) -> ShutdownReport
    {
        let mut report = ShutdownReport::default();
        debug!("Shutting down session in process {}", self.target.pid());

        if let Some(channel) = &resources.channel {
            channel.set_active(false);
            channel.set_shutdown_requested(true);
        }

        if resources.hardware_armed {
            if let Some(lease) = &resources.slot {
                self.clear_slot(resources.agent.as_ref(), lease.index, &mut report);
            }
        }

        if let Some(guard) = resources.page_guard {
            self.restore_page(guard, &mut report);
        }

        if let Some(channel) = &resources.channel {
            self.drain_handlers(channel, &mut report);
            // A handler that passed its activity check before step 1 may
            // have re-armed the guard after step 3
            if let Some(guard) = resources.page_guard {
                if matches!(self.target.query_region(guard.page_base), Ok(region) if region.protection.is_guarded()) {
                    debug!("Guard re-armed during drain; restoring again");
                    self.restore_page(guard, &mut report);
                }
            }
        }

        if resources.agent.is_some() || resources.page_guard.is_some() {
            self.freeze_and_invalidate(resources.channel.as_deref(), &mut report);
        } else if let Some(channel) = &resources.channel {
            channel.invalidate();
        }

        if let Some(agent) = resources.agent.take() {
            if let Err(e) = agent.uninit(self.target) {
                report.record("uninit", e);
            }
        }

        if let Some(poller) = resources.poller.take() {
            poller.stop();
        }
        drop(resources.channel.take());
        if let Some(lease) = resources.slot.take() {
            lease.release();
        }

        info!(
            "Session in process {} shut down ({} frozen, {} trap flag(s) cleared, {} error(s))",
            self.target.pid(),
            report.threads_frozen,
            report.trap_flags_cleared,
            report.errors.len()
        );
        report
    }

    fn clear_slot(&self, agent: Option<&AgentHandle>, slot: SlotIndex, report: &mut ShutdownReport)
    {
        if let Some(agent) = agent {
            match agent.clear_breakpoint(self.target, slot) {
                Ok(true) => {
                    debug!("Agent cleared {slot}");
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!("Agent could not clear {slot}, clearing from outside: {e}"),
            }
        }
        match HardwareBreakpointManager::new(self.target).clear(slot) {
            Ok(cleared) => {
                for (_, e) in cleared.failed {
                    report.record("clear slot", e);
                }
            }
            Err(e) => report.record("clear slot", e),
        }
    }

    fn restore_page(&self, guard: PageGuardState, report: &mut ShutdownReport)
    {
        let size = usize::try_from(guard.page_size).unwrap_or(usize::MAX);
        if let Err(e) = self.target.protect(guard.page_base, size, guard.original_protection) {
            report.record(
                "restore protection",
                TripwireError::ProtectionChangeFailed {
                    address: guard.page_base,
                    reason: e.to_string(),
                },
            );
        }
    }

    fn drain_handlers(&self, channel: &SharedChannel, report: &mut ShutdownReport)
    {
        let started = Instant::now();
        loop {
            let active = channel.active_handlers();
            if active == 0 {
                return;
            }
            let waited = started.elapsed();
            if waited >= self.drain_timeout {
                report.drain_timed_out = true;
                report.record("drain", TripwireError::ShutdownTimeout { active, waited });
                return;
            }
            thread::sleep(DRAIN_POLL);
        }
    }

    fn freeze_and_invalidate(&self, channel: Option<&SharedChannel>, report: &mut ShutdownReport)
    {
        let frozen = match FrozenThreadSet::freeze(self.target) {
            Ok(frozen) => frozen,
            Err(e) => {
                report.record("freeze", e);
                if let Some(channel) = channel {
                    channel.invalidate();
                }
                return;
            }
        };
        report.threads_frozen = frozen.len();

        for handle in frozen.handles() {
            let mut context = match self.target.read_debug_context(handle) {
                Ok(context) => context,
                Err(e) => {
                    report.record("read context", e);
                    continue;
                }
            };
            if context.has_trap_flag() {
                context.clear_trap_flag();
                match self.target.write_debug_context(handle, &context) {
                    Ok(()) => report.trap_flags_cleared += 1,
                    Err(e) => report.record("clear trap flag", e),
                }
            }
        }

        if let Some(channel) = channel {
            channel.invalidate();
        }

        for e in frozen.release() {
            report.record("resume", e);
        }
    }
}
