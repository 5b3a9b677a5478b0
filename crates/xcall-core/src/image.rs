//! Export-table lookup over PE headers read from the target process.

use object::{
    endian::LittleEndian as LE,
    pe::{
        IMAGE_DIRECTORY_ENTRY_EXPORT, IMAGE_DOS_SIGNATURE, IMAGE_NT_SIGNATURE, ImageDataDirectory,
        ImageDosHeader, ImageNtHeaders32, ImageNtHeaders64,
    },
    read::{
        ReadRef as _,
        pe::{ExportTable, ExportTarget, ImageNtHeaders, ImageOptionalHeader as _},
    },
};

use crate::{Bitness, XcallError};

/// Export directories larger than this are treated as corrupt.
pub(crate) const MAX_EXPORT_DIRECTORY_SIZE: u32 = 16 * 1024 * 1024;

/// How an export is looked up.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ExportKey<'a> {
    Name(&'a str),
    Ordinal(u32),
}

impl<'a> ExportKey<'a> {
    /// Parses `#123` as an ordinal and anything else as a name.
    pub fn parse(procedure: &'a str) -> Self {
        match procedure
            .strip_prefix('#')
            .and_then(|ordinal| ordinal.parse().ok())
        {
            Some(ordinal) => Self::Ordinal(ordinal),
            None => Self::Name(procedure),
        }
    }
}

/// Result of an export lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Export {
    /// RVA of the exported symbol.
    Rva(u32),

    /// The export forwards to another module.
    Forward { module: String, procedure: String },
}

/// Returns the RVA and size of the export directory.
///
/// `header` must hold the first page of the image.
pub(crate) fn export_directory(
    header: &[u8],
    bitness: Bitness,
) -> Result<Option<(u32, u32)>, XcallError> {
    let entry = match bitness {
        Bitness::X86 => data_directory::<ImageNtHeaders32>(header, IMAGE_DIRECTORY_ENTRY_EXPORT)?,
        Bitness::X64 => data_directory::<ImageNtHeaders64>(header, IMAGE_DIRECTORY_ENTRY_EXPORT)?,
    };

    let entry = match entry {
        Some(entry) => entry,
        None => return Ok(None),
    };

    let rva = entry.virtual_address.get(LE);
    let size = entry.size.get(LE);

    if rva == 0 || size == 0 || size > MAX_EXPORT_DIRECTORY_SIZE {
        return Ok(None);
    }

    Ok(Some((rva, size)))
}

fn data_directory<Pe>(data: &[u8], index: usize) -> Result<Option<ImageDataDirectory>, XcallError>
where
    Pe: ImageNtHeaders,
{
    let dos_header = data
        .read_at::<ImageDosHeader>(0)
        .map_err(|_| XcallError::InvalidImage("truncated DOS header"))?;

    if dos_header.e_magic.get(LE) != IMAGE_DOS_SIGNATURE {
        return Err(XcallError::InvalidImage("invalid DOS signature"));
    }

    let mut offset = dos_header.nt_headers_offset() as u64;

    let nt_headers = data
        .read::<Pe>(&mut offset)
        .map_err(|_| XcallError::InvalidImage("truncated NT headers"))?;

    if nt_headers.signature() != IMAGE_NT_SIGNATURE {
        return Err(XcallError::InvalidImage("invalid NT signature"));
    }

    if !nt_headers.is_valid_optional_magic() {
        return Err(XcallError::InvalidImage("optional header does not match bitness"));
    }

    let optional_data_size = u64::from(nt_headers.file_header().size_of_optional_header.get(LE))
        .checked_sub(size_of::<Pe::ImageOptionalHeader>() as u64)
        .ok_or(XcallError::InvalidImage("optional header too small"))?;

    let optional_data = data
        .read_bytes(&mut offset, optional_data_size)
        .map_err(|_| XcallError::InvalidImage("truncated optional header"))?;

    let data_directories: &[ImageDataDirectory] = optional_data
        .read_slice_at(
            0,
            nt_headers.optional_header().number_of_rva_and_sizes() as usize,
        )
        .map_err(|_| XcallError::InvalidImage("invalid number of data directories"))?;

    Ok(data_directories.get(index).copied())
}

/// Looks up an export in the export directory contents.
///
/// `directory` holds the bytes of the export directory starting at `rva`.
/// An export whose address falls inside the directory is a forwarder.
pub(crate) fn find_export(
    directory: &[u8],
    rva: u32,
    key: ExportKey,
) -> Result<Option<Export>, XcallError> {
    let table = ExportTable::parse(directory, rva)
        .map_err(|_| XcallError::InvalidImage("invalid export table"))?;

    let exports = table
        .exports()
        .map_err(|_| XcallError::InvalidImage("invalid export table"))?;

    let export = exports.into_iter().find(|export| match key {
        ExportKey::Name(name) => export.name == Some(name.as_bytes()),
        ExportKey::Ordinal(ordinal) => export.ordinal == ordinal,
    });

    let export = match export {
        Some(export) => export,
        None => return Ok(None),
    };

    Ok(Some(match export.target {
        ExportTarget::Address(address) => Export::Rva(address),
        ExportTarget::ForwardByName(module, procedure) => Export::Forward {
            module: String::from_utf8_lossy(module).into_owned(),
            procedure: String::from_utf8_lossy(procedure).into_owned(),
        },
        ExportTarget::ForwardByOrdinal(module, ordinal) => Export::Forward {
            module: String::from_utf8_lossy(module).into_owned(),
            procedure: format!("#{ordinal}"),
        },
    }))
}
