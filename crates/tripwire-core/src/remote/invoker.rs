//! Synchronous remote function calls.

use std::time::Duration;

use tracing::{debug, warn};

use super::callconv::{CallArg, CallEncoder};
use crate::error::{Result, TripwireError};
use crate::target::{ProcessAccess, ThreadExit};
use crate::types::{Address, Protection};

/// Calls functions inside the target on a fresh remote thread
///
/// Each call writes a stub into a new executable allocation, runs it on a
/// single-shot remote thread and waits for the thread's exit code, which is
/// the callee's return value truncated to 32 bits.
///
/// If the wait times out the stub is not freed: the thread may still be
/// executing it, and freeing the page under it would crash the target.
#[derive(Debug, Clone, Copy)]
pub struct RemoteInvoker
{
    encoder: CallEncoder,
    timeout: Duration,
}

impl RemoteInvoker
{
    /// Create an invoker for a target of the given encoder's bitness
    #[must_use]
    pub const fn new(encoder: CallEncoder, timeout: Duration) -> Self
    {
        Self { encoder, timeout }
    }

    /// Timeout applied to every call
    #[must_use]
    pub const fn timeout(&self) -> Duration
    {
        self.timeout
    }

    /// Call `function(args...)` and return its result
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: arguments cannot be encoded for the target
    /// - `RemoteCallTimedOut`: the thread did not exit in time (stub leaked)
    /// - `RemoteCallFailed`: the thread could not be started or awaited
    /// - Allocation or write errors from the target
    pub fn call<T: ProcessAccess + ?Sized>(&self, target: &T, function: Address, args: &[CallArg]) -> Result<u32>
    {
        let code = self.encoder.encode(function, args)?;
        let stub = target.allocate(code.len(), Protection::EXECUTE_READ_WRITE)?;

        if let Err(e) = target.write(stub, &code) {
            release_stub(target, stub);
            return Err(e);
        }

        let mut thread = match target.start_remote_thread(stub, 0) {
            Ok(thread) => thread,
            Err(e) => {
                release_stub(target, stub);
                return Err(TripwireError::RemoteCallFailed(format!(
                    "could not start thread for {function}: {e}"
                )));
            }
        };
        debug!("Remote call {function} on thread {} via stub {stub}", thread.id());

        match thread.join(self.timeout) {
            Ok(ThreadExit::Exited(code)) => {
                release_stub(target, stub);
                Ok(code)
            }
            Ok(ThreadExit::TimedOut) => {
                warn!("Remote call {function} timed out; leaving stub at {stub} allocated");
                Err(TripwireError::RemoteCallTimedOut {
                    function,
                    timeout: self.timeout,
                })
            }
            Err(e) => {
                warn!("Waiting for remote call {function} failed ({e}); leaving stub at {stub} allocated");
                Err(TripwireError::RemoteCallFailed(e.to_string()))
            }
        }
    }
}

fn release_stub<T: ProcessAccess + ?Sized>(target: &T, stub: Address)
{
    if let Err(e) = target.free(stub) {
        warn!("Failed to free call stub at {stub}: {e}");
    }
}
