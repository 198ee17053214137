//! Backing memory for the shared channel.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::error::Result;

/// A block of memory visible to both the controller and the agent
///
/// # Safety
///
/// Implementors guarantee that `base()` is 8-byte aligned, valid for reads and
/// writes of `len()` bytes, and stays mapped for the lifetime of the value.
/// All access to the memory goes through atomics.
pub unsafe trait MappedRegion: Send + Sync
{
    /// First byte of the region
    fn base(&self) -> *mut u8;

    /// Length in bytes
    fn len(&self) -> usize;

    /// Whether the region is empty.
    fn is_empty(&self) -> bool
    {
        self.len() == 0
    }
}

/// Creates named regions for the controller
pub trait RegionFactory: Send + Sync
{
    /// Create a zero-filled region of `size` bytes under `name`.
    fn create(&self, name: &str, size: usize) -> Result<Box<dyn MappedRegion>>;
}

/// In-process region backed by heap memory
///
/// Clones share the same storage, which lets tests hand one clone to the
/// controller and another to a simulated agent.
#[derive(Debug, Clone)]
pub struct HeapRegion
{
    words: Arc<[AtomicU64]>,
    len: usize,
}

impl HeapRegion
{
    /// Allocate a zeroed region of at least `len` bytes
    #[must_use]
    pub fn new(len: usize) -> Self
    {
        let words = (0..len.div_ceil(8)).map(|_| AtomicU64::new(0)).collect();
        Self { words, len }
    }
}

// SAFETY: storage is a live `Arc<[AtomicU64]>`, so it is 8-aligned, at least
// `len` bytes long and interior-mutable.
unsafe impl MappedRegion for HeapRegion
{
    fn base(&self) -> *mut u8
    {
        self.words.as_ptr().cast_mut().cast()
    }

    fn len(&self) -> usize
    {
        self.len
    }
}
