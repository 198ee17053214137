//! # Session configuration
//!
//! Everything a [`WatchpointSession`](crate::session::WatchpointSession) needs
//! besides the target itself. Configuration is an explicit value passed to
//! the session; nothing is read from process-wide state after construction.
//!
//! ## Environment Variables
//!
//! [`SessionConfig::from_env`] starts from the defaults and applies:
//!
//! - `TRIPWIRE_AGENT_PATH`: path of the agent DLL
//! - `TRIPWIRE_POLL_INTERVAL_MS`: hit poller interval
//! - `TRIPWIRE_CALL_TIMEOUT_MS`: remote call timeout
//! - `TRIPWIRE_DRAIN_TIMEOUT_MS`: handler drain timeout during shutdown
//! - `TRIPWIRE_CHANNEL_NAMESPACE`: `local` or `global`
//!
//! Unparseable values are ignored with a warning.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::channel::ChannelNamespace;

/// Default agent file name, looked up next to the controller executable.
pub const DEFAULT_AGENT_NAME: &str = "tripwire_agent.dll";

/// Settings for one watchpoint session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig
{
    /// Agent DLL loaded into the target
    pub agent_path: PathBuf,
    /// Interval between hit ring drains
    pub poll_interval: Duration,
    /// Upper bound for each remote call (init, uninit, installBreakpoint, ...)
    pub remote_call_timeout: Duration,
    /// Pause between loading the agent and reading its exports
    pub agent_settle_delay: Duration,
    /// Upper bound for in-flight handlers to finish during shutdown
    pub handler_drain_timeout: Duration,
    /// Namespace of the shared channel's mapping name
    pub channel_namespace: ChannelNamespace,
    /// Prefix of the shared channel's mapping name
    pub channel_prefix: String,
}

impl Default for SessionConfig
{
    fn default() -> Self
    {
        Self {
            agent_path: default_agent_path(),
            poll_interval: Duration::from_millis(25),
            remote_call_timeout: Duration::from_secs(5),
            agent_settle_delay: Duration::from_millis(100),
            handler_drain_timeout: Duration::from_secs(2),
            channel_namespace: ChannelNamespace::Local,
            channel_prefix: "TripwireChannel".to_string(),
        }
    }
}

fn default_agent_path() -> PathBuf
{
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_AGENT_NAME)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_AGENT_NAME))
}

fn env_millis(name: &str) -> Option<Duration>
{
    let value = env::var(name).ok()?;
    match value.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            warn!("Ignoring {name}={value}: {e}");
            None
        }
    }
}

impl SessionConfig
{
    /// Defaults overridden by `TRIPWIRE_*` environment variables
    #[must_use]
    pub fn from_env() -> Self
    {
        let mut config = Self::default();
        if let Ok(path) = env::var("TRIPWIRE_AGENT_PATH") {
            config.agent_path = PathBuf::from(path);
        }
        if let Some(interval) = env_millis("TRIPWIRE_POLL_INTERVAL_MS") {
            config.poll_interval = interval;
        }
        if let Some(timeout) = env_millis("TRIPWIRE_CALL_TIMEOUT_MS") {
            config.remote_call_timeout = timeout;
        }
        if let Some(timeout) = env_millis("TRIPWIRE_DRAIN_TIMEOUT_MS") {
            config.handler_drain_timeout = timeout;
        }
        if let Ok(namespace) = env::var("TRIPWIRE_CHANNEL_NAMESPACE") {
            match namespace.to_lowercase().as_str() {
                "local" => config.channel_namespace = ChannelNamespace::Local,
                "global" => config.channel_namespace = ChannelNamespace::Global,
                other => warn!("Ignoring TRIPWIRE_CHANNEL_NAMESPACE={other}: use 'local' or 'global'"),
            }
        }
        config
    }

    /// Use the agent at `path`.
    #[must_use]
    pub fn with_agent_path(mut self, path: impl AsRef<Path>) -> Self
    {
        self.agent_path = path.as_ref().to_path_buf();
        self
    }

    /// Drain the hit ring every `interval`.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self
    {
        self.poll_interval = interval;
        self
    }

    /// Bound each remote call by `timeout`.
    #[must_use]
    pub fn with_remote_call_timeout(mut self, timeout: Duration) -> Self
    {
        self.remote_call_timeout = timeout;
        self
    }

    /// Wait `delay` after loading the agent.
    #[must_use]
    pub fn with_agent_settle_delay(mut self, delay: Duration) -> Self
    {
        self.agent_settle_delay = delay;
        self
    }

    /// Bound the shutdown handler drain by `timeout`.
    #[must_use]
    pub fn with_handler_drain_timeout(mut self, timeout: Duration) -> Self
    {
        self.handler_drain_timeout = timeout;
        self
    }

    /// Create channels in `namespace`.
    #[must_use]
    pub fn with_channel_namespace(mut self, namespace: ChannelNamespace) -> Self
    {
        self.channel_namespace = namespace;
        self
    }
}
