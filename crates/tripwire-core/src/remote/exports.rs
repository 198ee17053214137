//! Export resolution from an image mapped in the target.
//!
//! The agent's exports are found by walking its PE export directory through
//! remote reads, so the controller never has to load the agent (or a
//! target-bitness copy of a system DLL) into its own address space.
//!
//! Header parsing uses the `object` crate's PE structures over a copy of the
//! first page of the image; the name, ordinal and function tables are read
//! separately because they can live anywhere in the image.

use object::pe::{
    ImageDosHeader, ImageExportDirectory, ImageNtHeaders32, ImageNtHeaders64, IMAGE_DIRECTORY_ENTRY_EXPORT,
    IMAGE_NT_OPTIONAL_HDR32_MAGIC, IMAGE_NT_OPTIONAL_HDR64_MAGIC,
};
use object::read::pe::{optional_header_magic, ImageNtHeaders};
use object::LittleEndian as LE;
use tracing::debug;

use crate::error::{Result, TripwireError};
use crate::target::ProcessAccess;
use crate::types::Address;

const HEADER_READ_SIZE: usize = 0x1000;
const MAX_EXPORT_NAME: usize = 256;

/// Export table of one module, read from the target
#[derive(Debug, Clone)]
pub struct RemoteExports
{
    module: Address,
    directory: (u32, u32),
    ordinal_base: u32,
    functions: Vec<u32>,
    names: Vec<(String, u16)>,
}

fn invalid(module: Address, reason: impl Into<String>) -> TripwireError
{
    TripwireError::InvalidImage {
        module,
        reason: reason.into(),
    }
}

fn read_u32_table<T: ProcessAccess + ?Sized>(target: &T, address: Address, count: u32) -> Result<Vec<u32>>
{
    if count == 0 {
        return Ok(Vec::new());
    }
    let bytes = target.read(address, count as usize * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn read_u16_table<T: ProcessAccess + ?Sized>(target: &T, address: Address, count: u32) -> Result<Vec<u16>>
{
    if count == 0 {
        return Ok(Vec::new());
    }
    let bytes = target.read(address, count as usize * 2)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

// Names sit near the end of a section more often than not, so a long read can
// cross into an unmapped page. Fall back to shorter reads before giving up.
fn read_c_string<T: ProcessAccess + ?Sized>(target: &T, address: Address) -> Result<String>
{
    let mut last_error = None;
    for length in [MAX_EXPORT_NAME, 64, 16] {
        match target.read(address, length) {
            Ok(bytes) => {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                return Ok(String::from_utf8_lossy(&bytes[..end]).into_owned());
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| invalid(address, "unreadable export name")))
}

fn export_directory(module: Address, headers: &[u8]) -> Result<(u32, u32)>
{
    let dos = ImageDosHeader::parse(headers).map_err(|e| invalid(module, e.to_string()))?;
    let mut offset = u64::from(dos.nt_headers_offset());
    let magic = optional_header_magic(headers).map_err(|e| invalid(module, e.to_string()))?;

    let directories = match magic {
        IMAGE_NT_OPTIONAL_HDR64_MAGIC => ImageNtHeaders64::parse(headers, &mut offset).map(|(_, dirs)| dirs),
        IMAGE_NT_OPTIONAL_HDR32_MAGIC => ImageNtHeaders32::parse(headers, &mut offset).map(|(_, dirs)| dirs),
        other => return Err(invalid(module, format!("unknown optional header magic 0x{other:x}"))),
    }
    .map_err(|e| invalid(module, e.to_string()))?;

    let directory = directories
        .get(IMAGE_DIRECTORY_ENTRY_EXPORT)
        .ok_or_else(|| invalid(module, "no export directory entry"))?;
    let (rva, size) = directory.address_range();
    if rva == 0 || size == 0 {
        return Err(invalid(module, "image has no exports"));
    }
    Ok((rva, size))
}

impl RemoteExports
{
    /// Read the export table of the module at `module`
    ///
    /// ## Errors
    ///
    /// - `InvalidImage`: headers or export directory malformed, or no exports
    /// - Any read error from the target
    pub fn read<T: ProcessAccess + ?Sized>(target: &T, module: Address) -> Result<Self>
    {
        let headers = target.read(module, HEADER_READ_SIZE)?;
        let directory = export_directory(module, &headers)?;

        let raw = target.read(module + u64::from(directory.0), std::mem::size_of::<ImageExportDirectory>())?;
        let (export, _) = object::pod::from_bytes::<ImageExportDirectory>(&raw)
            .map_err(|()| invalid(module, "truncated export directory"))?;

        let ordinal_base = export.base.get(LE);
        let function_count = export.number_of_functions.get(LE);
        let name_count = export.number_of_names.get(LE);

        let functions = read_u32_table(target, module + u64::from(export.address_of_functions.get(LE)), function_count)?;
        let name_rvas = read_u32_table(target, module + u64::from(export.address_of_names.get(LE)), name_count)?;
        let ordinals = read_u16_table(
            target,
            module + u64::from(export.address_of_name_ordinals.get(LE)),
            name_count,
        )?;

        let mut names = Vec::with_capacity(name_rvas.len());
        for (name_rva, ordinal) in name_rvas.into_iter().zip(ordinals) {
            names.push((read_c_string(target, module + u64::from(name_rva))?, ordinal));
        }

        debug!(
            "Read {} exports ({} named) from module at {module}",
            functions.len(),
            names.len()
        );
        Ok(Self {
            module,
            directory,
            ordinal_base,
            functions,
            names,
        })
    }

    /// Base address of the module
    #[must_use]
    pub fn module(&self) -> Address
    {
        self.module
    }

    /// Names of all named exports
    pub fn names(&self) -> impl Iterator<Item = &str>
    {
        self.names.iter().map(|(name, _)| name.as_str())
    }

    /// Absolute address of the export called `name`, if present
    ///
    /// ## Errors
    ///
    /// - `InvalidImage`: the name maps to a missing function slot, or the
    ///   export is forwarded to another module
    pub fn find(&self, name: &str) -> Result<Option<Address>>
    {
        let Some((_, ordinal)) = self.names.iter().find(|(candidate, _)| candidate == name) else {
            return Ok(None);
        };
        let rva = *self
            .functions
            .get(usize::from(*ordinal))
            .ok_or_else(|| invalid(self.module, format!("export '{name}' has out-of-range ordinal {ordinal}")))?;

        let (dir_start, dir_size) = self.directory;
        if rva >= dir_start && rva - dir_start < dir_size {
            return Err(invalid(self.module, format!("export '{name}' is forwarded")));
        }
        Ok(Some(self.module + u64::from(rva)))
    }

    /// Absolute address of the export called `name`
    ///
    /// ## Errors
    ///
    /// - `ExportNotFound`: no export with that name
    pub fn require(&self, name: &str) -> Result<Address>
    {
        self.find(name)?.ok_or_else(|| TripwireError::ExportNotFound {
            name: name.to_string(),
            module: self.module,
        })
    }

    /// First ordinal of the table (as declared by the image)
    #[must_use]
    pub fn ordinal_base(&self) -> u32
    {
        self.ordinal_base
    }
}
