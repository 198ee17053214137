//! Named file mappings backing the shared channel.

use windows::core::PCWSTR;
use windows::Win32::Foundation::INVALID_HANDLE_VALUE;
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};
use tracing::{debug, warn};

use super::OwnedHandle;
use crate::channel::{MappedRegion, RegionFactory};
use crate::error::{Result, TripwireError};

fn wide(name: &str) -> Vec<u16>
{
    name.encode_utf16().chain(std::iter::once(0)).collect()
}

/// A mapped view of a pagefile-backed section
pub struct NamedMapping
{
    _section: OwnedHandle,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    len: usize,
}

// SAFETY: the view is plain shared memory; all access goes through atomics.
unsafe impl Send for NamedMapping {}
// SAFETY: as above.
unsafe impl Sync for NamedMapping {}

impl NamedMapping
{
    /// Create (or open, if it already exists) the section `name`
    ///
    /// ## Errors
    ///
    /// - `ChannelUnavailable`: the section or its view could not be created
    pub fn create(name: &str, len: usize) -> Result<Self>
    {
        let wide_name = wide(name);
        let size = len as u64;
        // SAFETY: `wide_name` is NUL-terminated and outlives the call.
        let section = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                (size >> 32) as u32,
                size as u32,
                PCWSTR(wide_name.as_ptr()),
            )
        }
        .map_err(|e| TripwireError::ChannelUnavailable(format!("create {name}: {e}")))?;
        Self::map(OwnedHandle(section), name, len)
    }

    /// Open an existing section `name` (the agent side)
    ///
    /// ## Errors
    ///
    /// - `ChannelUnavailable`: no such section, or mapping it failed
    pub fn open(name: &str, len: usize) -> Result<Self>
    {
        let wide_name = wide(name);
        // SAFETY: as in `create`.
        let section = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, PCWSTR(wide_name.as_ptr())) }
            .map_err(|e| TripwireError::ChannelUnavailable(format!("open {name}: {e}")))?;
        Self::map(OwnedHandle(section), name, len)
    }

    fn map(section: OwnedHandle, name: &str, len: usize) -> Result<Self>
    {
        // SAFETY: `section` is a valid section handle of at least `len` bytes.
        let view = unsafe { MapViewOfFile(section.0, FILE_MAP_ALL_ACCESS, 0, 0, len) };
        if view.Value.is_null() {
            return Err(TripwireError::ChannelUnavailable(format!(
                "map {name}: {}",
                windows::core::Error::from_win32()
            )));
        }
        debug!("Mapped {name} ({len} bytes) at {:p}", view.Value);
        Ok(Self {
            _section: section,
            view,
            len,
        })
    }
}

// SAFETY: views are page aligned, `len` bytes long and stay mapped until drop.
unsafe impl MappedRegion for NamedMapping
{
    fn base(&self) -> *mut u8
    {
        self.view.Value.cast()
    }

    fn len(&self) -> usize
    {
        self.len
    }
}

impl Drop for NamedMapping
{
    fn drop(&mut self)
    {
        // SAFETY: the view was mapped in `map` and is unmapped once.
        if let Err(e) = unsafe { UnmapViewOfFile(self.view) } {
            warn!("Failed to unmap shared channel view: {e}");
        }
    }
}

/// Creates channel sections for the controller
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsRegionFactory;

impl RegionFactory for WindowsRegionFactory
{
    fn create(&self, name: &str, size: usize) -> Result<Box<dyn MappedRegion>>
    {
        Ok(Box::new(NamedMapping::create(name, size)?))
    }
}
