//! # Agent bootstrap
//!
//! Loads the agent library into the target, resolves its exports from the
//! target's own memory and initialises it with the shared channel's name.
//!
//! ## Agent Contract
//!
//! | Export | Signature | Required |
//! |---|---|---|
//! | `init` | `int init(const wchar_t* channel_name)` | yes |
//! | `uninit` | `void uninit(void)` | yes |
//! | `installBreakpoint` | `int installBreakpoint(int slot, uint64 address, int type, int size)` | no |
//! | `clearBreakpoint` | `int clearBreakpoint(int slot)` | no |
//! | `refresh` | `int refresh(void)` | no |
//!
//! Everything except `uninit` returns non-zero on success. A missing
//! optional export disables the matching agent-side path; the controller
//! falls back to doing the work from outside.

use std::thread;

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::debug_registers::{BreakCondition, BreakSize, SlotIndex};
use crate::error::{Result, TripwireError};
use crate::remote::{CallArg, CallEncoder, RemoteExports, RemoteInvoker};
use crate::target::ProcessAccess;
use crate::types::{Address, Protection};

/// `init` export name
pub const INIT_EXPORT: &str = "init";
/// `uninit` export name
pub const UNINIT_EXPORT: &str = "uninit";
/// `installBreakpoint` export name
pub const INSTALL_BREAKPOINT_EXPORT: &str = "installBreakpoint";
/// `clearBreakpoint` export name
pub const CLEAR_BREAKPOINT_EXPORT: &str = "clearBreakpoint";
/// `refresh` export name
pub const REFRESH_EXPORT: &str = "refresh";

/// Addresses of the agent's exports in the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExports
{
    pub init: Address,
    pub uninit: Address,
    pub install_breakpoint: Option<Address>,
    pub clear_breakpoint: Option<Address>,
    pub refresh: Option<Address>,
}

impl AgentExports
{
    /// Pick the agent's exports out of a parsed export directory
    ///
    /// ## Errors
    ///
    /// - `ExportNotFound`: `init` or `uninit` is missing
    /// - `InvalidImage`: an export is forwarded or out of range
    pub fn resolve(exports: &RemoteExports) -> Result<Self>
    {
        let resolved = Self {
            init: exports.require(INIT_EXPORT)?,
            uninit: exports.require(UNINIT_EXPORT)?,
            install_breakpoint: exports.find(INSTALL_BREAKPOINT_EXPORT)?,
            clear_breakpoint: exports.find(CLEAR_BREAKPOINT_EXPORT)?,
            refresh: exports.find(REFRESH_EXPORT)?,
        };
        if resolved.install_breakpoint.is_none() {
            debug!("Agent has no {INSTALL_BREAKPOINT_EXPORT}; breakpoints will be programmed externally");
        }
        Ok(resolved)
    }
}

/// Encode `text` as a NUL-terminated little-endian UTF-16 string
#[must_use]
pub fn wide_string(text: &str) -> Vec<u8>
{
    text.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// A loaded and initialised agent
#[derive(Debug, Clone)]
pub struct AgentHandle
{
    base: Address,
    exports: AgentExports,
    channel_name_buffer: Address,
    invoker: RemoteInvoker,
}

impl AgentHandle
{
    /// Load the agent into `target` and call `init(channel_name)`
    ///
    /// The buffer holding the channel name stays allocated in the target
    /// for the life of the process: the agent may keep a pointer to it.
    ///
    /// ## Errors
    ///
    /// - `AgentMissing`: the agent file does not exist
    /// - `AgentLoadFailed`: the target could not load it
    /// - `ExportNotFound` / `InvalidImage`: its export directory is unusable
    /// - `AgentInitFailed`: `init` returned 0
    /// - `RemoteCallTimedOut` / `RemoteCallFailed`: `init` did not complete
    pub fn bootstrap<T: ProcessAccess + ?Sized>(target: &T, config: &SessionConfig, channel_name: &str) -> Result<Self>
    {
        let path = &config.agent_path;
        if !path.is_file() {
            return Err(TripwireError::AgentMissing(path.clone()));
        }

        let base = target
            .load_module_into_target(path)
            .map_err(|e| TripwireError::AgentLoadFailed(format!("{}: {e}", path.display())))?;
        debug!("Agent {} loaded at {base} in process {}", path.display(), target.pid());

        if !config.agent_settle_delay.is_zero() {
            thread::sleep(config.agent_settle_delay);
        }

        let exports = AgentExports::resolve(&RemoteExports::read(target, base)?)?;
        let invoker = RemoteInvoker::new(CallEncoder::new(target.bitness()), config.remote_call_timeout);

        let name = wide_string(channel_name);
        let channel_name_buffer = target.allocate(name.len(), Protection::READ_WRITE)?;
        target.write(channel_name_buffer, &name)?;

        let status = invoker.call(target, exports.init, &[CallArg::Pointer(channel_name_buffer)])?;
        if status == 0 {
            return Err(TripwireError::AgentInitFailed {
                channel: channel_name.to_string(),
            });
        }
        info!("Agent initialised on channel {channel_name}");

        Ok(Self {
            base,
            exports,
            channel_name_buffer,
            invoker,
        })
    }

    /// Base address of the agent image in the target
    #[must_use]
    pub const fn base(&self) -> Address
    {
        self.base
    }

    #[must_use]
    pub const fn exports(&self) -> &AgentExports
    {
        &self.exports
    }

    /// Target allocation holding the channel name passed to `init`
    #[must_use]
    pub const fn channel_name_buffer(&self) -> Address
    {
        self.channel_name_buffer
    }

    /// Ask the agent to program `slot` on all of its threads.
    ///
    /// Returns `Ok(false)` when the agent lacks the export or reports failure.
    pub fn install_breakpoint<T: ProcessAccess + ?Sized>(
        &self,
        target: &T,
        slot: SlotIndex,
        address: Address,
        condition: BreakCondition,
        size: BreakSize,
    ) -> Result<bool>
    {
        let Some(function) = self.exports.install_breakpoint else {
            return Ok(false);
        };
        let args = [
            CallArg::U32(u32::from(slot.raw())),
            CallArg::U64(address.value()),
            CallArg::U32(condition.bits() as u32),
            CallArg::U32(size.len()),
        ];
        let status = self.invoker.call(target, function, &args)?;
        if status == 0 {
            warn!("Agent {INSTALL_BREAKPOINT_EXPORT} for {slot} at {address} returned 0");
        }
        Ok(status != 0)
    }

    /// Ask the agent to clear `slot` on all of its threads.
    ///
    /// Returns `Ok(false)` when the agent lacks the export or reports failure.
    pub fn clear_breakpoint<T: ProcessAccess + ?Sized>(&self, target: &T, slot: SlotIndex) -> Result<bool>
    {
        let Some(function) = self.exports.clear_breakpoint else {
            return Ok(false);
        };
        let status = self.invoker.call(target, function, &[CallArg::U32(u32::from(slot.raw()))])?;
        if status == 0 {
            warn!("Agent {CLEAR_BREAKPOINT_EXPORT} for {slot} returned 0");
        }
        Ok(status != 0)
    }

    /// Ask the agent to re-apply its configuration: re-arm the guard page, or
    /// program the slot on threads started since `init`.
    pub fn refresh<T: ProcessAccess + ?Sized>(&self, target: &T) -> Result<bool>
    {
        let Some(function) = self.exports.refresh else {
            return Ok(false);
        };
        let status = self.invoker.call(target, function, &[])?;
        if status == 0 {
            warn!("Agent {REFRESH_EXPORT} returned 0");
        }
        Ok(status != 0)
    }

    /// Call `uninit`: the agent removes its handler and unmaps the channel.
    pub fn uninit<T: ProcessAccess + ?Sized>(&self, target: &T) -> Result<()>
    {
        self.invoker.call(target, self.exports.uninit, &[])?;
        debug!("Agent at {} uninitialised", self.base);
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_wide_string_is_nul_terminated_le()
    {
        assert_eq!(wide_string("Ab"), vec![b'A', 0, b'b', 0, 0, 0]);
        assert_eq!(wide_string(""), vec![0, 0]);
    }

    #[test]
    fn test_wide_string_keeps_backslash()
    {
        let bytes = wide_string("Local\\x");
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[10], b'\\');
    }
}
