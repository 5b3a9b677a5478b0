//! Core functionality for calling into another process.
//!
//! [`XcallCore`] wraps an [`XcallDriver`] bound to a single target process
//! and layers typed memory access, allocation bookkeeping and export
//! resolution on top of the raw driver primitives.

mod core;
mod driver;
mod error;
mod image;
pub mod registers;
pub mod toolchain;


use std::{cell::RefCell, collections::HashMap, num::NonZeroUsize};

use lru::LruCache;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub use self::{
    core::{Bitness, Hex, MemoryProtection, ModuleInfo, ProcessId, ProcessInfo, Va},
    driver::XcallDriver,
    error::XcallError,
    registers::{Register, Registers},
    toolchain::{Assembler, DecodedInstruction, Disassembler},
};
use self::{
    core::module_stem,
    image::{Export, ExportKey},
};

/// Size of the pages used for chunked string reads.
const PAGE_SIZE: u64 = 0x1000;

/// Maximum number of forwarders followed while resolving an export.
const MAX_FORWARDER_DEPTH: usize = 8;

/// The core functionality for working with a target process.
pub struct XcallCore<Driver>
where
    Driver: XcallDriver,
{
    driver: Driver,
    info: ProcessInfo,

    procedures: RefCell<LruCache<(String, String), Va>>,
    allocations: RefCell<HashMap<String, Va>>,

    read_string_length_limit: RefCell<Option<usize>>,
}

impl<Driver> XcallCore<Driver>
where
    Driver: XcallDriver,
{
    const DEFAULT_PROCEDURE_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(256).unwrap();

    /// Creates a new `XcallCore` instance with the given driver.
    ///
    /// The process information is queried once and cached. The procedure
    /// cache is enabled with a capacity of 256 entries.
    pub fn new(driver: Driver) -> Result<Self, XcallError> {
        let info = driver.info()?;

        tracing::debug!(
            pid = %info.pid,
            bitness = ?info.bitness,
            main_module = %info.main_module.name,
            base = %info.main_module.base,
            "attached to process"
        );

        Ok(Self {
            driver,
            info,
            procedures: RefCell::new(LruCache::new(Self::DEFAULT_PROCEDURE_CACHE_SIZE)),
            allocations: RefCell::new(HashMap::new()),
            read_string_length_limit: RefCell::new(None),
        })
    }

    /// Sets the capacity of the procedure cache.
    ///
    /// The cache maps `(module, procedure)` pairs to resolved addresses,
    /// so repeated calls to [`procedure_address`] skip the export table
    /// walk.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    ///
    /// [`procedure_address`]: Self::procedure_address
    pub fn with_procedure_cache(self, size: usize) -> Self {
        self.procedures
            .borrow_mut()
            .resize(NonZeroUsize::new(size).expect("procedure cache size must be non-zero"));
        self
    }

    /// Clears the procedure cache.
    ///
    /// Needed after a module was unloaded and loaded again at a different
    /// base.
    pub fn flush_procedure_cache(&self) {
        self.procedures.borrow_mut().clear();
    }

    /// Sets a limit on the length of strings read by the `read_string` methods.
    /// If the limit is reached, the string will be truncated.
    pub fn with_read_string_length_limit(self, limit_in_bytes: usize) -> Self {
        Self {
            read_string_length_limit: RefCell::new(Some(limit_in_bytes)),
            ..self
        }
    }

    /// Returns the current limit on the length of strings read by the
    /// `read_string` methods.
    pub fn read_string_length_limit(&self) -> Option<usize> {
        *self.read_string_length_limit.borrow()
    }

    /// Sets a limit on the length of strings read by the `read_string` methods.
    pub fn set_read_string_length_limit(&self, limit: usize) {
        *self.read_string_length_limit.borrow_mut() = Some(limit);
    }

    /// Returns the driver used by this `XcallCore` instance.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Returns the cached information about the target process.
    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    /// Returns the bitness of the target process.
    pub fn bitness(&self) -> Bitness {
        self.info.bitness
    }

    /// Returns the pointer width of the target process in bytes.
    pub fn address_width(&self) -> usize {
        self.info.bitness.address_width()
    }

    /// Returns the main module of the target process.
    pub fn main_module(&self) -> &ModuleInfo {
        &self.info.main_module
    }

    /// Checks whether the target process has exited.
    pub fn has_exited(&self) -> Result<bool, XcallError> {
        self.driver.has_exited()
    }

    /// Enumerates the modules loaded in the target process.
    pub fn modules(&self) -> Result<Vec<ModuleInfo>, XcallError> {
        self.driver.modules()
    }

    /// Finds a loaded module by name.
    ///
    /// The comparison is case-insensitive and the extension is optional,
    /// so `"KERNEL32"` matches `kernel32.dll`.
    pub fn find_module(&self, name: &str) -> Result<Option<ModuleInfo>, XcallError> {
        let stem = module_stem(name);

        Ok(self
            .driver
            .modules()?
            .into_iter()
            .find(|module| module.stem() == stem))
    }

    ///////////////////////////////////////////////////////////////////////////
    // Allocation
    ///////////////////////////////////////////////////////////////////////////

    /// Allocates memory in the target process.
    pub fn allocate(&self, size: u64, protection: MemoryProtection) -> Result<Va, XcallError> {
        let address = self.driver.allocate(size, protection)?;
        tracing::trace!(%address, size, %protection, "allocated");
        Ok(address)
    }

    /// Allocates memory bound to a name.
    ///
    /// If an allocation with the same name exists, it is returned instead
    /// and `size` is ignored.
    pub fn allocate_named(
        &self,
        name: &str,
        size: u64,
        protection: MemoryProtection,
    ) -> Result<Va, XcallError> {
        if let Some(address) = self.allocations.borrow().get(name).copied() {
            return Ok(address);
        }

        let address = self.allocate(size, protection)?;
        self.allocations.borrow_mut().insert(name.to_owned(), address);
        Ok(address)
    }

    /// Returns the address of a named allocation.
    pub fn named_allocation(&self, name: &str) -> Option<Va> {
        self.allocations.borrow().get(name).copied()
    }

    /// Frees memory allocated in the target process.
    ///
    /// Any name bound to the allocation is forgotten. Memory inside the
    /// main module is never freed.
    pub fn free(&self, address: Va) -> Result<(), XcallError> {
        if self.info.main_module.contains(address) {
            return Err(XcallError::MainModuleMemory);
        }

        self.driver.free(address)?;
        self.allocations
            .borrow_mut()
            .retain(|_, allocation| *allocation != address);

        tracing::trace!(%address, "freed");
        Ok(())
    }

    /// Frees a named allocation.
    ///
    /// Returns `false` if no allocation has this name.
    pub fn free_named(&self, name: &str) -> Result<bool, XcallError> {
        let address = match self.named_allocation(name) {
            Some(address) => address,
            None => return Ok(false),
        };

        self.free(address)?;
        Ok(true)
    }

    /// Allocates memory and copies `data` into it.
    pub fn allocate_bytes(
        &self,
        data: &[u8],
        protection: MemoryProtection,
    ) -> Result<Va, XcallError> {
        let address = self.allocate(data.len().max(1) as u64, protection)?;

        if let Err(err) = self.write(address, data) {
            let _ = self.driver.free(address);
            return Err(err);
        }

        Ok(address)
    }

    /// Allocates a null-terminated UTF-8 string.
    pub fn allocate_string(&self, value: &str) -> Result<Va, XcallError> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.allocate_bytes(&bytes, MemoryProtection::RW)
    }

    /// Allocates a null-terminated UTF-16 string.
    pub fn allocate_wstring(&self, value: &str) -> Result<Va, XcallError> {
        let bytes = value
            .encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(u16::to_le_bytes)
            .collect::<Vec<_>>();

        self.allocate_bytes(&bytes, MemoryProtection::RW)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Memory
    ///////////////////////////////////////////////////////////////////////////

    /// Reads memory from the target process.
    pub fn read(&self, address: Va, buffer: &mut [u8]) -> Result<(), XcallError> {
        self.driver.read(address, buffer)
    }

    /// Reads `length` bytes from the target process.
    pub fn read_bytes(&self, address: Va, length: usize) -> Result<Vec<u8>, XcallError> {
        let mut buffer = vec![0u8; length];
        self.read(address, &mut buffer)?;
        Ok(buffer)
    }

    /// Writes memory to the target process.
    pub fn write(&self, address: Va, buffer: &[u8]) -> Result<(), XcallError> {
        self.driver.write(address, buffer)
    }

    /// Writes memory regardless of its current protection.
    ///
    /// The range is made writable for the duration of the write and the
    /// previous protection is restored afterwards.
    pub fn write_protected(&self, address: Va, buffer: &[u8]) -> Result<(), XcallError> {
        let size = buffer.len() as u64;
        let previous = self.driver.protect(address, size, MemoryProtection::RWX)?;
        let result = self.driver.write(address, buffer);
        self.driver.protect(address, size, previous)?;
        result
    }

    /// Changes the protection of a memory range and returns the previous one.
    pub fn protect(
        &self,
        address: Va,
        size: u64,
        protection: MemoryProtection,
    ) -> Result<MemoryProtection, XcallError> {
        self.driver.protect(address, size, protection)
    }

    /// Checks whether the whole range is readable.
    pub fn is_accessible(&self, address: Va, size: u64) -> Result<bool, XcallError> {
        self.driver.is_accessible(address, size)
    }

    /// Reads a single byte from the target process.
    pub fn read_u8(&self, address: Va) -> Result<u8, XcallError> {
        let mut buffer = [0u8; 1];
        self.read(address, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a 16-bit unsigned integer from the target process.
    pub fn read_u16(&self, address: Va) -> Result<u16, XcallError> {
        let mut buffer = [0u8; 2];
        self.read(address, &mut buffer)?;
        Ok(u16::from_le_bytes(buffer))
    }

    /// Reads a 32-bit unsigned integer from the target process.
    pub fn read_u32(&self, address: Va) -> Result<u32, XcallError> {
        let mut buffer = [0u8; 4];
        self.read(address, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Reads a 64-bit unsigned integer from the target process.
    pub fn read_u64(&self, address: Va) -> Result<u64, XcallError> {
        let mut buffer = [0u8; 8];
        self.read(address, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads an unsigned integer of the specified size from the target
    /// process.
    ///
    /// The size must be 1, 2, 4, or 8.
    pub fn read_uint(&self, address: Va, size: usize) -> Result<u64, XcallError> {
        match size {
            1 => self.read_u8(address).map(u64::from),
            2 => self.read_u16(address).map(u64::from),
            4 => self.read_u32(address).map(u64::from),
            8 => self.read_u64(address),
            _ => Err(XcallError::InvalidAddressWidth),
        }
    }

    /// Reads a pointer-sized unsigned integer.
    ///
    /// The width follows the bitness of the target process.
    pub fn read_address(&self, address: Va) -> Result<u64, XcallError> {
        self.read_uint(address, self.address_width())
    }

    /// Reads a pointer from the target process.
    pub fn read_va(&self, address: Va) -> Result<Va, XcallError> {
        Ok(Va(self.read_address(address)?))
    }

    /// Reads a struct from the target process.
    pub fn read_struct<T>(&self, address: Va) -> Result<T, XcallError>
    where
        T: FromBytes + IntoBytes,
    {
        let mut result = T::new_zeroed();
        self.read(address, result.as_mut_bytes())?;
        Ok(result)
    }

    /// Writes a single byte to the target process.
    pub fn write_u8(&self, address: Va, value: u8) -> Result<(), XcallError> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a 16-bit unsigned integer to the target process.
    pub fn write_u16(&self, address: Va, value: u16) -> Result<(), XcallError> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a 32-bit unsigned integer to the target process.
    pub fn write_u32(&self, address: Va, value: u32) -> Result<(), XcallError> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a 64-bit unsigned integer to the target process.
    pub fn write_u64(&self, address: Va, value: u64) -> Result<(), XcallError> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a pointer-sized unsigned integer.
    ///
    /// On 32-bit targets the value is truncated.
    pub fn write_address(&self, address: Va, value: u64) -> Result<(), XcallError> {
        let bytes = value.to_le_bytes();
        self.write(address, &bytes[..self.address_width()])
    }

    /// Writes a struct to the target process.
    pub fn write_struct<T>(&self, address: Va, value: T) -> Result<(), XcallError>
    where
        T: IntoBytes + Immutable,
    {
        self.write(address, value.as_bytes())
    }

    ///////////////////////////////////////////////////////////////////////////
    // Strings
    ///////////////////////////////////////////////////////////////////////////

    /// Reads a null-terminated string of bytes from the target process with
    /// a specified limit.
    pub fn read_string_bytes_limited(
        &self,
        address: Va,
        limit: usize,
    ) -> Result<Vec<u8>, XcallError> {
        let mut buffer = Vec::new();
        let mut address = address;

        loop {
            // read until the end of page
            let mut page = vec![0u8; (PAGE_SIZE - (address.0 & (PAGE_SIZE - 1))) as usize];
            self.read(address, &mut page)?;

            if let Some(position) = page.iter().position(|&b| b == 0) {
                buffer.extend_from_slice(&page[..position]);
                break;
            }

            buffer.extend_from_slice(&page);
            address += page.len() as u64;

            if buffer.len() >= limit {
                break;
            }
        }

        buffer.truncate(limit);
        Ok(buffer)
    }

    /// Reads a null-terminated string of bytes from the target process.
    pub fn read_string_bytes(&self, address: Va) -> Result<Vec<u8>, XcallError> {
        self.read_string_bytes_limited(
            address,
            self.read_string_length_limit.borrow().unwrap_or(usize::MAX),
        )
    }

    /// Reads a null-terminated wide string (UTF-16) from the target process
    /// with a specified limit in bytes.
    pub fn read_wstring_bytes_limited(
        &self,
        address: Va,
        limit: usize,
    ) -> Result<Vec<u16>, XcallError> {
        let mut buffer = Vec::new();
        let mut address = address;

        loop {
            // read until the end of page, keeping whole code units
            let mut page = vec![0u8; (PAGE_SIZE - (address.0 & (PAGE_SIZE - 1))) as usize & !1];
            if page.is_empty() {
                page.resize(2, 0);
            }
            self.read(address, &mut page)?;

            let position = page
                .chunks_exact(2)
                .position(|chunk| chunk[0] == 0 && chunk[1] == 0);

            if let Some(position) = position {
                buffer.extend_from_slice(&page[..position * 2]);
                break;
            }

            buffer.extend_from_slice(&page);
            address += page.len() as u64;

            if buffer.len() >= limit {
                break;
            }
        }

        buffer.truncate(limit & !1);
        Ok(buffer
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Reads a null-terminated wide string (UTF-16) from the target process.
    pub fn read_wstring_bytes(&self, address: Va) -> Result<Vec<u16>, XcallError> {
        self.read_wstring_bytes_limited(
            address,
            self.read_string_length_limit.borrow().unwrap_or(usize::MAX),
        )
    }

    /// Reads a null-terminated string from the target process.
    pub fn read_string(&self, address: Va) -> Result<String, XcallError> {
        Ok(String::from_utf8_lossy(&self.read_string_bytes(address)?).into())
    }

    /// Reads a null-terminated wide string (UTF-16) from the target process.
    pub fn read_wstring(&self, address: Va) -> Result<String, XcallError> {
        Ok(String::from_utf16_lossy(&self.read_wstring_bytes(address)?))
    }

    ///////////////////////////////////////////////////////////////////////////
    // Addresses
    ///////////////////////////////////////////////////////////////////////////

    /// Translates an address relative to the preferred image base into the
    /// main module as it is currently loaded.
    pub fn to_aslr(&self, address: Va) -> Va {
        let preferred = self.info.bitness.preferred_image_base();
        Va(address
            .0
            .wrapping_sub(preferred.0)
            .wrapping_add(self.info.main_module.base.0))
    }

    /// Translates an address of the loaded main module back to the
    /// preferred image base.
    pub fn from_aslr(&self, address: Va) -> Va {
        let preferred = self.info.bitness.preferred_image_base();
        Va(address
            .0
            .wrapping_sub(self.info.main_module.base.0)
            .wrapping_add(preferred.0))
    }

    /// Resolves an exported procedure of a loaded module.
    ///
    /// The module name is matched case-insensitively and the extension is
    /// optional. `procedure` is either a name or `#ordinal`. Forwarded
    /// exports are followed into their target module.
    ///
    /// Returns `None` if the module is not loaded or does not export the
    /// procedure.
    pub fn procedure_address(
        &self,
        module: &str,
        procedure: &str,
    ) -> Result<Option<Va>, XcallError> {
        let key = (module_stem(module), procedure.to_owned());

        if let Some(address) = self.procedures.borrow_mut().get(&key).copied() {
            tracing::trace!(cache_hit = true, module, procedure, %address, "procedure found");
            return Ok(Some(address));
        }

        let address = match self.resolve_export(module, procedure, 0)? {
            Some(address) => address,
            None => {
                tracing::debug!(module, procedure, "procedure not found");
                return Ok(None);
            }
        };

        tracing::trace!(cache_hit = false, module, procedure, %address, "procedure found");
        self.procedures.borrow_mut().put(key, address);
        Ok(Some(address))
    }

    fn resolve_export(
        &self,
        module: &str,
        procedure: &str,
        depth: usize,
    ) -> Result<Option<Va>, XcallError> {
        if depth > MAX_FORWARDER_DEPTH {
            return Err(XcallError::InvalidImage("forwarder chain too long"));
        }

        let module = match self.find_module(module)? {
            Some(module) => module,
            None => return Ok(None),
        };

        let header = self.read_bytes(module.base, PAGE_SIZE as usize)?;
        let (rva, size) = match image::export_directory(&header, self.bitness())? {
            Some(directory) => directory,
            None => return Ok(None),
        };

        let directory = self.read_bytes(module.base + rva as u64, size as usize)?;

        match image::find_export(&directory, rva, ExportKey::parse(procedure))? {
            Some(Export::Rva(rva)) => Ok(Some(module.base + rva as u64)),
            Some(Export::Forward {
                module: target,
                procedure: target_procedure,
            }) => {
                tracing::trace!(
                    module = %module.name,
                    procedure,
                    target,
                    target_procedure,
                    "following forwarder"
                );

                self.resolve_export(&target, &target_procedure, depth + 1)
            }
            None => Ok(None),
        }
    }
}
