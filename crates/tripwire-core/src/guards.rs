//! # RAII Guards for Thread Suspension
//!
//! Guards that resume suspended threads when dropped, so a failing register
//! write or an early return can never leave the target frozen.
//!
//! ## Guards
//!
//! - **SuspendedThread**: one thread, suspended for a single read-modify-write
//! - **FrozenThreadSet**: every thread of the target, suspended together
//!
//! ## Example
//!
//! ```rust,no_run
//! use tripwire_core::guards::FrozenThreadSet;
//! use tripwire_core::target::ThreadControl;
//!
//! fn clear_single_step<T: ThreadControl + ?Sized>(threads: &T) -> tripwire_core::Result<()>
//! {
//!     let frozen = FrozenThreadSet::freeze(threads)?;
//!     for handle in frozen.handles() {
//!         let mut context = threads.read_debug_context(handle)?;
//!         context.clear_trap_flag();
//!         threads.write_debug_context(handle, &context)?;
//!     }
//!     // Every thread resumes here, even if a write above failed
//!     Ok(())
//! }
//! ```

use smallvec::SmallVec;
use tracing::warn;

use crate::error::{Result, TripwireError};
use crate::target::{ThreadControl, ThreadHandle};
use crate::types::ThreadId;

/// RAII guard that suspends one thread and resumes it when dropped
pub struct SuspendedThread<'a, T: ThreadControl + ?Sized>
{
    threads: &'a T,
    handle: ThreadHandle,
    active: bool,
}

impl<'a, T: ThreadControl + ?Sized> SuspendedThread<'a, T>
{
    /// Suspend `thread`
    ///
    /// ## Errors
    ///
    /// Whatever the backend reports when the thread cannot be opened or
    /// suspended (commonly because it already exited).
    pub fn new(threads: &'a T, thread: ThreadId) -> Result<Self>
    {
        let handle = threads.suspend_thread(thread)?;
        Ok(Self {
            threads,
            handle,
            active: true,
        })
    }

    /// Handle of the suspended thread
    #[must_use]
    pub fn handle(&self) -> &ThreadHandle
    {
        &self.handle
    }

    /// Resume now and report the result instead of ignoring it in `drop`.
    pub fn resume(mut self) -> Result<()>
    {
        self.resume_inner()
    }

    fn resume_inner(&mut self) -> Result<()>
    {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.threads.resume_thread(ThreadHandle {
            id: self.handle.id,
            raw: self.handle.raw,
        })
    }
}

impl<T: ThreadControl + ?Sized> Drop for SuspendedThread<'_, T>
{
    fn drop(&mut self)
    {
        // Best effort resume
        if let Err(e) = self.resume_inner() {
            warn!("Failed to resume thread {}: {e}", self.handle.id);
        }
    }
}

/// Every thread of the target, suspended at once
///
/// Threads that exit between enumeration and suspension are skipped. If no
/// thread at all could be suspended the freeze fails, since nothing done
/// under it would be race-free.
pub struct FrozenThreadSet<'a, T: ThreadControl + ?Sized>
{
    threads: &'a T,
    handles: SmallVec<[ThreadHandle; 16]>,
    active: bool,
}

impl<'a, T: ThreadControl + ?Sized> FrozenThreadSet<'a, T>
{
    /// Suspend every thread currently in the target
    ///
    /// ## Errors
    ///
    /// - Thread enumeration failed
    /// - `ThreadFailed`: threads exist but none could be suspended
    pub fn freeze(threads: &'a T) -> Result<Self>
    {
        let ids = threads.thread_ids()?;
        let mut handles = SmallVec::new();
        let mut last_error = None;

        for id in ids {
            match threads.suspend_thread(id) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!("Could not suspend thread {id} while freezing: {e}");
                    last_error = Some((id, e));
                }
            }
        }

        if handles.is_empty() {
            if let Some((thread, e)) = last_error {
                return Err(TripwireError::ThreadFailed {
                    thread,
                    operation: "freeze",
                    reason: e.to_string(),
                });
            }
        }

        Ok(Self {
            threads,
            handles,
            active: true,
        })
    }

    /// Handles of the frozen threads
    #[must_use]
    pub fn handles(&self) -> &[ThreadHandle]
    {
        &self.handles
    }

    /// Number of frozen threads
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.handles.len()
    }

    /// Whether no thread is frozen.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.handles.is_empty()
    }

    /// Resume every thread now, returning the errors encountered
    ///
    /// Every thread is attempted even if some fail.
    pub fn release(mut self) -> Vec<TripwireError>
    {
        self.resume_all()
    }

    fn resume_all(&mut self) -> Vec<TripwireError>
    {
        let mut errors = Vec::new();
        if self.active {
            for handle in self.handles.drain(..) {
                if let Err(e) = self.threads.resume_thread(handle) {
                    errors.push(e);
                }
            }
            self.active = false;
        }
        errors
    }
}

impl<T: ThreadControl + ?Sized> Drop for FrozenThreadSet<'_, T>
{
    fn drop(&mut self)
    {
        for e in self.resume_all() {
            warn!("Failed to resume frozen thread: {e}");
        }
    }
}
