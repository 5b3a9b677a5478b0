use std::{marker::PhantomData, mem::ManuallyDrop};

use xcall_core::{MemoryProtection, Va, XcallCore, XcallDriver, XcallError};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::Argument;

/// A value stored in memory of the target process.
///
/// The memory is freed when the pointer is dropped.
pub struct RemotePointer<'a, Driver, T>
where
    Driver: XcallDriver,
{
    core: &'a XcallCore<Driver>,
    address: Va,
    _marker: PhantomData<T>,
}

impl<'a, Driver, T> RemotePointer<'a, Driver, T>
where
    Driver: XcallDriver,
    T: FromBytes + IntoBytes + Immutable,
{
    /// Allocates memory for `value` and writes it.
    pub fn new(core: &'a XcallCore<Driver>, value: &T) -> Result<Self, XcallError> {
        let address = core.allocate_bytes(value.as_bytes(), MemoryProtection::RW)?;

        Ok(Self {
            core,
            address,
            _marker: PhantomData,
        })
    }

    /// Reads the current value.
    pub fn get(&self) -> Result<T, XcallError> {
        self.core.read_struct(self.address)
    }

    /// Overwrites the value.
    pub fn set(&self, value: &T) -> Result<(), XcallError> {
        self.core.write(self.address, value.as_bytes())
    }
}

impl<Driver, T> RemotePointer<'_, Driver, T>
where
    Driver: XcallDriver,
{
    /// Returns the address of the value.
    pub fn address(&self) -> Va {
        self.address
    }

    /// Frees the memory, reporting any failure.
    pub fn free(self) -> Result<(), XcallError> {
        let this = ManuallyDrop::new(self);
        this.core.free(this.address)
    }
}

impl<Driver, T> Drop for RemotePointer<'_, Driver, T>
where
    Driver: XcallDriver,
{
    fn drop(&mut self) {
        if let Err(err) = self.core.free(self.address) {
            tracing::warn!(address = %self.address, %err, "failed to free remote pointer");
        }
    }
}

impl<Driver, T> From<&RemotePointer<'_, Driver, T>> for Argument
where
    Driver: XcallDriver,
{
    fn from(value: &RemotePointer<'_, Driver, T>) -> Self {
        Self::Pointer(value.address)
    }
}

/// Encoding of a [`RemoteString`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringEncoding {
    /// NUL-terminated UTF-8.
    Utf8,

    /// NUL-terminated UTF-16.
    Utf16,
}

/// A NUL-terminated string stored in memory of the target process.
///
/// The memory is freed when the string is dropped.
pub struct RemoteString<'a, Driver>
where
    Driver: XcallDriver,
{
    core: &'a XcallCore<Driver>,
    address: Va,
    capacity: usize,
    encoding: StringEncoding,
}

impl<'a, Driver> RemoteString<'a, Driver>
where
    Driver: XcallDriver,
{
    /// Allocates a UTF-8 string.
    pub fn new(core: &'a XcallCore<Driver>, value: &str) -> Result<Self, XcallError> {
        Self::with_encoding(core, value, StringEncoding::Utf8)
    }

    /// Allocates a UTF-16 string.
    pub fn new_utf16(core: &'a XcallCore<Driver>, value: &str) -> Result<Self, XcallError> {
        Self::with_encoding(core, value, StringEncoding::Utf16)
    }

    fn with_encoding(
        core: &'a XcallCore<Driver>,
        value: &str,
        encoding: StringEncoding,
    ) -> Result<Self, XcallError> {
        let bytes = encode(value, encoding);
        let address = core.allocate_bytes(&bytes, MemoryProtection::RW)?;

        Ok(Self {
            core,
            address,
            capacity: bytes.len(),
            encoding,
        })
    }

    /// Returns the address of the string.
    pub fn address(&self) -> Va {
        self.address
    }

    /// Returns the encoding of the string.
    pub fn encoding(&self) -> StringEncoding {
        self.encoding
    }

    /// Reads the string back from the target.
    pub fn get(&self) -> Result<String, XcallError> {
        match self.encoding {
            StringEncoding::Utf8 => self.core.read_string(self.address),
            StringEncoding::Utf16 => self.core.read_wstring(self.address),
        }
    }

    /// Replaces the string.
    ///
    /// The string is moved to a new allocation if it no longer fits, so the
    /// address may change.
    pub fn set(&mut self, value: &str) -> Result<(), XcallError> {
        let bytes = encode(value, self.encoding);

        if bytes.len() <= self.capacity {
            return self.core.write(self.address, &bytes);
        }

        let address = self.core.allocate_bytes(&bytes, MemoryProtection::RW)?;
        let previous = std::mem::replace(&mut self.address, address);
        self.capacity = bytes.len();
        self.core.free(previous)
    }

    /// Frees the memory, reporting any failure.
    pub fn free(self) -> Result<(), XcallError> {
        let this = ManuallyDrop::new(self);
        this.core.free(this.address)
    }
}

impl<Driver> Drop for RemoteString<'_, Driver>
where
    Driver: XcallDriver,
{
    fn drop(&mut self) {
        if let Err(err) = self.core.free(self.address) {
            tracing::warn!(address = %self.address, %err, "failed to free remote string");
        }
    }
}

impl<Driver> From<&RemoteString<'_, Driver>> for Argument
where
    Driver: XcallDriver,
{
    fn from(value: &RemoteString<'_, Driver>) -> Self {
        Self::Pointer(value.address)
    }
}

fn encode(value: &str, encoding: StringEncoding) -> Vec<u8> {
    match encoding {
        StringEncoding::Utf8 => value.bytes().chain(std::iter::once(0)).collect(),
        StringEncoding::Utf16 => value
            .encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(u16::to_le_bytes)
            .collect(),
    }
}
