//! # Watchpoint session
//!
//! Top-level state machine tying the pieces together for one watch in one
//! target.
//!
//! ## States
//!
//! ```text
//! Idle --start--> Configuring --ok--> Active --stop--> ShuttingDown --> Idle
//!                      |                                    ^
//!                      +--------------error (rollback)------+
//! ```
//!
//! ## Starting
//!
//! 1. Classify the address and select the detection mode
//! 2. Page guard: query the page, reject inaccessible or already guarded pages
//! 3. Hardware: require natural alignment, reserve a debug register slot
//! 4. Create and initialise the shared channel
//! 5. Load and initialise the agent
//! 6. Hardware: ask the agent to install the breakpoint, program the
//!    registers from outside if it cannot
//! 7. Mark the channel active; page guard: add the guard bit to the page
//! 8. Start the hit poller
//!
//! Any failure hands everything acquired so far to the
//! [`ShutdownCoordinator`] and the session returns to Idle.
//!
//! The guard bit is applied by the controller after the agent's handler is
//! installed, so the first fault always finds a handler.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::agent::AgentHandle;
use crate::channel::{channel_name, ChannelHeader, RegionFactory, SharedChannel, NO_SLOT};
use crate::classify::{classify_in, select_mode};
use crate::config::SessionConfig;
use crate::debug_registers::{BreakCondition, BreakSize};
use crate::error::{Result, TripwireError};
use crate::events::{EventHub, WatchEvent, WatchEventReceiver};
use crate::hardware::HardwareBreakpointManager;
use crate::poller::PollerHandle;
use crate::shutdown::{PageGuardState, SessionResources, ShutdownCoordinator, ShutdownReport, SlotLease};
use crate::slots::SharedSlots;
use crate::target::TargetProcess;
use crate::types::{AddressClass, DetectionMode, ProcessId, WatchpointConfig};

/// Lifecycle state of a [`WatchpointSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState
{
    #[default]
    Idle,
    Configuring,
    Active,
    ShuttingDown,
}

impl fmt::Display for SessionState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Self::Idle => "idle",
            Self::Configuring => "configuring",
            Self::Active => "active",
            Self::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// The watch currently armed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWatch
{
    pub config: WatchpointConfig,
    pub class: AddressClass,
    pub mode: DetectionMode,
    pub channel_name: String,
}

/// One watchpoint in one target process
///
/// ## Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use tripwire_core::platform;
/// use tripwire_core::slots::SlotRegistry;
/// use tripwire_core::types::{AccessMode, Address, ProcessId, WatchpointConfig};
/// use tripwire_core::{SessionConfig, WatchEvent, WatchpointSession};
///
/// # fn main() -> tripwire_core::Result<()> {
/// let target = platform::open_process(ProcessId(4242))?;
/// let regions = platform::region_factory()?;
/// let mut session = WatchpointSession::new(target, regions, SlotRegistry::shared(), SessionConfig::from_env());
///
/// let events = session.subscribe();
/// let watch = WatchpointConfig::new(Address::new(0x0040_0010), 4, AccessMode::ReadWrite)?;
/// session.start_monitoring(watch)?;
///
/// while let Ok(WatchEvent::Hit(hit)) = events.recv() {
///     println!("{} touched by thread {}", hit.address, hit.thread_id);
/// }
/// # Ok(())
/// # }
/// ```
pub struct WatchpointSession
{
    target: Arc<dyn TargetProcess>,
    regions: Arc<dyn RegionFactory>,
    slots: SharedSlots,
    config: SessionConfig,
    events: EventHub,
    state: SessionState,
    watch: Option<ActiveWatch>,
    resources: SessionResources,
}

impl WatchpointSession
{
    /// Create an idle session
    ///
    /// `slots` is shared by every session of this controller so that no two
    /// sessions use the same debug register.
    #[must_use]
    pub fn new(target: Arc<dyn TargetProcess>, regions: Arc<dyn RegionFactory>, slots: SharedSlots, config: SessionConfig) -> Self
    {
        Self {
            target,
            regions,
            slots,
            config,
            events: EventHub::new(),
            state: SessionState::Idle,
            watch: None,
            resources: SessionResources::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState
    {
        self.state
    }

    /// The armed watch, if Active
    #[must_use]
    pub const fn watch(&self) -> Option<&ActiveWatch>
    {
        self.watch.as_ref()
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig
    {
        &self.config
    }

    /// Target process ID
    #[must_use]
    pub fn pid(&self) -> ProcessId
    {
        self.target.pid()
    }

    /// Receive hit and stop events from now on
    pub fn subscribe(&self) -> WatchEventReceiver
    {
        self.events.subscribe()
    }

    /// Hits recorded by the agent so far, if Active
    #[must_use]
    pub fn hit_count(&self) -> Option<u32>
    {
        self.resources.channel.as_ref().map(|channel| channel.hit_count())
    }

    /// Start watching `watch`
    ///
    /// ## Errors
    ///
    /// - `AlreadyActive`: the session is not Idle (nothing is changed)
    /// - `Misaligned` / `NoFreeSlot`: hardware mode cannot be configured
    /// - `PageNotAccessible` / `ProtectionChangeFailed`: page guard cannot be applied
    /// - Injection errors from loading or initialising the agent
    ///
    /// On error everything acquired has been released again.
    pub fn start_monitoring(&mut self, watch: WatchpointConfig) -> Result<DetectionMode>
    {
        if self.state != SessionState::Idle {
            return Err(TripwireError::AlreadyActive {
                state: self.state.to_string(),
            });
        }
        self.state = SessionState::Configuring;

        let mut resources = SessionResources::default();
        match self.arm(&watch, &mut resources) {
            Ok(active) => {
                let mode = active.mode;
                info!(
                    "Watching {} ({} bytes, {}) in process {} via {mode}",
                    watch.address(),
                    watch.size(),
                    watch.access(),
                    self.target.pid()
                );
                self.resources = resources;
                self.watch = Some(active);
                self.state = SessionState::Active;
                Ok(mode)
            }
            Err(e) => {
                warn!("Starting watch at {} failed: {e}; rolling back", watch.address());
                self.state = SessionState::ShuttingDown;
                ShutdownCoordinator::new(&*self.target, self.config.handler_drain_timeout).run(resources);
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    fn arm(&self, watch: &WatchpointConfig, resources: &mut SessionResources) -> Result<ActiveWatch>
    {
        let target = &*self.target;
        let address = watch.address();
        let class = classify_in(target, address);
        let mode = select_mode(class, watch.access());
        debug!("{address} is {class}; using {mode}");

        let condition = BreakCondition::from(watch.access());
        let size = BreakSize::from_len(watch.size())?;
        let page_size = target.page_size();
        let page_base = address.page_base(page_size);

        let mut original_protection = None;
        match mode {
            DetectionMode::PageGuard => {
                let region = target.query_region(address)?;
                if !region.committed || !region.protection.is_accessible() {
                    return Err(TripwireError::PageNotAccessible {
                        address,
                        reason: format!("protection {:#x} does not allow access", region.protection.bits()),
                    });
                }
                if region.protection.is_guarded() {
                    return Err(TripwireError::PageNotAccessible {
                        address,
                        reason: "page is already guarded".to_string(),
                    });
                }
                original_protection = Some(region.protection);
            }
            DetectionMode::HardwareBreakpoint => {
                if !address.is_aligned(u64::from(watch.size())) {
                    return Err(TripwireError::Misaligned {
                        address,
                        size: watch.size(),
                    });
                }
                let index = self.slots.lock().unwrap().allocate(address, condition, size)?;
                resources.slot = Some(SlotLease {
                    slots: Arc::clone(&self.slots),
                    index,
                });
            }
        }

        let name = channel_name(self.config.channel_namespace, &self.config.channel_prefix, target.pid());
        let channel = Arc::new(SharedChannel::create(&*self.regions, &name)?);
        channel.initialize(&ChannelHeader {
            watch_address: address.value(),
            breakpoint_size: watch.size(),
            breakpoint_type: condition.bits() as u32,
            breakpoint_slot: resources.slot.as_ref().map_or(NO_SLOT, |lease| u32::from(lease.index.raw())),
            use_page_guard: u32::from(mode == DetectionMode::PageGuard),
            page_base: page_base.value(),
            page_size: u32::try_from(page_size).unwrap_or(u32::MAX),
            original_protection: original_protection.map_or(0, |protection| protection.bits()),
            ..ChannelHeader::default()
        });
        resources.channel = Some(Arc::clone(&channel));

        let agent = AgentHandle::bootstrap(target, &self.config, &name)?;
        let agent = resources.agent.insert(agent);

        if let Some(lease) = &resources.slot {
            resources.hardware_armed = true;
            let installed = agent.install_breakpoint(target, lease.index, address, condition, size)?;
            if installed {
                debug!("Agent installed {} at {address}", lease.index);
            } else {
                HardwareBreakpointManager::new(target).program(lease.index, address, condition, size)?;
            }
        }

        channel.set_active(true);

        if let Some(original) = original_protection {
            let length = usize::try_from(page_size).unwrap_or(usize::MAX);
            target
                .protect(page_base, length, original.with_guard())
                .map_err(|e| TripwireError::ProtectionChangeFailed {
                    address: page_base,
                    reason: e.to_string(),
                })?;
            resources.page_guard = Some(PageGuardState {
                page_base,
                page_size,
                original_protection: original,
            });
        }

        resources.poller = Some(PollerHandle::spawn(
            Arc::clone(&channel),
            self.events.clone(),
            self.config.poll_interval,
        )?);

        Ok(ActiveWatch {
            config: *watch,
            class,
            mode,
            channel_name: name,
        })
    }

    /// Stop watching and restore the target
    ///
    /// Returns `Ok(None)` when there is nothing to stop.
    ///
    /// ## Errors
    ///
    /// None at present; shutdown problems are reported in the
    /// [`ShutdownReport`].
    pub fn stop_monitoring(&mut self) -> Result<Option<ShutdownReport>>
    {
        if !matches!(self.state, SessionState::Configuring | SessionState::Active) {
            return Ok(None);
        }
        self.state = SessionState::ShuttingDown;

        let resources = std::mem::take(&mut self.resources);
        let report = ShutdownCoordinator::new(&*self.target, self.config.handler_drain_timeout).run(resources);

        self.watch = None;
        self.state = SessionState::Idle;
        self.events.publish(&WatchEvent::Stopped);
        Ok(Some(report))
    }

    /// Ask the agent to re-apply the watch: the guard bit in page-guard mode,
    /// the slot on threads created since starting in hardware mode.
    /// Returns `Ok(false)` if not Active or the agent cannot.
    ///
    /// ## Errors
    ///
    /// Remote call failures.
    pub fn refresh(&self) -> Result<bool>
    {
        if self.state != SessionState::Active {
            return Ok(false);
        }
        match &self.resources.agent {
            Some(agent) => agent.refresh(&*self.target),
            None => Ok(false),
        }
    }
}

impl Drop for WatchpointSession
{
    fn drop(&mut self)
    {
        if let Ok(Some(report)) = self.stop_monitoring() {
            if !report.is_clean() {
                warn!("Session dropped with {} shutdown error(s)", report.errors.len());
            }
        }
    }
}
