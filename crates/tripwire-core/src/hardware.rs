//! # Hardware breakpoint programming
//!
//! Programs one debug register slot on every thread of the target from
//! outside the process. This is the fallback used when the agent does not
//! install the breakpoint itself.
//!
//! ## Per-thread protocol
//!
//! 1. Suspend the thread ([`SuspendedThread`])
//! 2. Read DR0-DR7
//! 3. Set `DR[slot]` and the slot's DR7 fields
//! 4. Write the context back
//! 5. Read it again and compare (a mismatch is logged, never fatal)
//! 6. Resume
//!
//! A thread that fails any step is skipped; the others are still programmed.
//! Threads created after programming do not inherit the registers.

use tracing::{debug, warn};

use crate::debug_registers::{BreakCondition, BreakSize, DebugContext, Dr7, SlotIndex};
use crate::error::{Result, TripwireError};
use crate::guards::SuspendedThread;
use crate::target::ThreadControl;
use crate::types::{Address, ThreadId};

/// Outcome of applying a slot change to all threads
#[derive(Debug, Default)]
pub struct ProgramReport
{
    /// Threads whose context was written
    pub programmed: usize,
    /// Threads that could not be suspended, read or written
    pub failed: Vec<(ThreadId, TripwireError)>,
    /// Threads that read back something other than what was written
    pub mismatches: Vec<TripwireError>,
}

/// Applies debug register changes across a target's threads
pub struct HardwareBreakpointManager<'a, T: ThreadControl + ?Sized>
{
    threads: &'a T,
}

impl<'a, T: ThreadControl + ?Sized> HardwareBreakpointManager<'a, T>
{
    /// Create a manager over `threads`.
    pub fn new(threads: &'a T) -> Self
    {
        Self { threads }
    }

    /// Program `slot` to watch `address` on every thread
    ///
    /// ## Errors
    ///
    /// - Thread enumeration failed
    /// - `HardwareBreakpointFailed`: no thread accepted the new context
    pub fn program(&self, slot: SlotIndex, address: Address, condition: BreakCondition, size: BreakSize) -> Result<ProgramReport>
    {
        let report = self.apply(|thread, context| {
            context.program(slot, address, condition, size);
            let expected = context.dr7;
            move |readback: &DebugContext| {
                (!readback.holds(slot, address, condition, size)).then(|| TripwireError::VerificationMismatch {
                    thread,
                    expected,
                    actual: readback.dr7,
                })
            }
        })?;

        if report.programmed == 0 {
            let reason = report
                .failed
                .first()
                .map_or_else(|| "target has no threads".to_string(), |(id, e)| format!("thread {id}: {e}"));
            return Err(TripwireError::HardwareBreakpointFailed(reason));
        }

        debug!(
            "{slot} set to {address} ({condition:?}, {} bytes) on {} thread(s), {} failed",
            size.len(),
            report.programmed,
            report.failed.len()
        );
        Ok(report)
    }

    /// Clear `slot` on every thread
    ///
    /// Only the address register and the enable bit are reset.
    ///
    /// ## Errors
    ///
    /// Thread enumeration failed. Per-thread failures are in the report.
    pub fn clear(&self, slot: SlotIndex) -> Result<ProgramReport>
    {
        let report = self.apply(|thread, context| {
            context.clear(slot);
            let expected = context.dr7;
            move |readback: &DebugContext| {
                let cleared = readback.dr[slot.index()] == 0 && !Dr7(readback.dr7).is_enabled(slot);
                (!cleared).then(|| TripwireError::VerificationMismatch {
                    thread,
                    expected,
                    actual: readback.dr7,
                })
            }
        })?;
        debug!("{slot} cleared on {} thread(s)", report.programmed);
        Ok(report)
    }

    fn apply<F, V>(&self, mut mutate: F) -> Result<ProgramReport>
    where
        F: FnMut(ThreadId, &mut DebugContext) -> V,
        V: FnOnce(&DebugContext) -> Option<TripwireError>,
    {
        let mut report = ProgramReport::default();

        for thread in self.threads.thread_ids()? {
            match self.apply_to_thread(thread, &mut mutate) {
                Ok(None) => report.programmed += 1,
                Ok(Some(mismatch)) => {
                    warn!("{mismatch}");
                    report.programmed += 1;
                    report.mismatches.push(mismatch);
                }
                Err(e) => {
                    warn!("Skipping thread {thread}: {e}");
                    report.failed.push((thread, e));
                }
            }
        }

        Ok(report)
    }

    fn apply_to_thread<F, V>(&self, thread: ThreadId, mutate: &mut F) -> Result<Option<TripwireError>>
    where
        F: FnMut(ThreadId, &mut DebugContext) -> V,
        V: FnOnce(&DebugContext) -> Option<TripwireError>,
    {
        let suspended = SuspendedThread::new(self.threads, thread)?;
        let mut context = self.threads.read_debug_context(suspended.handle())?;
        let verify = mutate(thread, &mut context);
        self.threads.write_debug_context(suspended.handle(), &context)?;
        let readback = self.threads.read_debug_context(suspended.handle())?;
        suspended.resume()?;
        Ok(verify(&readback))
    }
}
