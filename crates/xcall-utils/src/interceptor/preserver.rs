use indexmap::IndexMap;
use xcall_core::{Va, XcallCore, XcallDriver, XcallError};

/// How a patch records the bytes it overwrites.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preserve {
    /// Nothing is recorded.
    No,

    /// The bytes are recorded unless the address is already preserved.
    #[default]
    Once,

    /// The bytes replace any snapshot recorded for the address.
    Forced,
}

/// Snapshots of original bytes, keyed by address.
///
/// The first snapshot for an address wins; later calls to
/// [`preserve`](Self::preserve) for the same address are ignored until the
/// bytes are restored or forgotten. [`preserve_forced`](Self::preserve_forced)
/// replaces the snapshot instead.
#[derive(Debug, Default)]
pub struct MemoryPreserver {
    regions: IndexMap<Va, Vec<u8>>,
}

impl MemoryPreserver {
    /// Creates an empty preserver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots `length` bytes at `address`.
    ///
    /// Returns `false` if the address is already preserved.
    pub fn preserve<Driver>(
        &mut self,
        core: &XcallCore<Driver>,
        address: Va,
        length: usize,
    ) -> Result<bool, XcallError>
    where
        Driver: XcallDriver,
    {
        if self.regions.contains_key(&address) {
            return Ok(false);
        }

        let bytes = core.read_bytes(address, length)?;
        self.regions.insert(address, bytes);

        tracing::trace!(%address, length, "memory preserved");
        Ok(true)
    }

    /// Snapshots `length` bytes at `address`, replacing an existing
    /// snapshot.
    ///
    /// A replaced snapshot becomes the most recent one.
    pub fn preserve_forced<Driver>(
        &mut self,
        core: &XcallCore<Driver>,
        address: Va,
        length: usize,
    ) -> Result<(), XcallError>
    where
        Driver: XcallDriver,
    {
        let bytes = core.read_bytes(address, length)?;

        if self.regions.shift_remove(&address).is_some() {
            tracing::trace!(%address, "snapshot replaced");
        }

        self.regions.insert(address, bytes);

        tracing::trace!(%address, length, "memory preserved");
        Ok(())
    }

    /// Records `length` bytes at `address` as `mode` says.
    pub fn preserve_with<Driver>(
        &mut self,
        core: &XcallCore<Driver>,
        address: Va,
        length: usize,
        mode: Preserve,
    ) -> Result<(), XcallError>
    where
        Driver: XcallDriver,
    {
        match mode {
            Preserve::No => Ok(()),
            Preserve::Once => self.preserve(core, address, length).map(drop),
            Preserve::Forced => self.preserve_forced(core, address, length),
        }
    }

    /// Writes the snapshot back and drops it.
    ///
    /// Returns `false` if the address is not preserved.
    pub fn restore<Driver>(
        &mut self,
        core: &XcallCore<Driver>,
        address: Va,
    ) -> Result<bool, XcallError>
    where
        Driver: XcallDriver,
    {
        let bytes = match self.regions.get(&address) {
            Some(bytes) => bytes,
            None => return Ok(false),
        };

        core.write_protected(address, bytes)?;
        self.regions.shift_remove(&address);

        tracing::trace!(%address, "memory restored");
        Ok(true)
    }

    /// Restores every snapshot, most recent first.
    pub fn restore_all<Driver>(&mut self, core: &XcallCore<Driver>) -> Result<(), XcallError>
    where
        Driver: XcallDriver,
    {
        while let Some((address, bytes)) = self.regions.last() {
            core.write_protected(*address, bytes)?;
            self.regions.pop();
        }

        Ok(())
    }

    /// Checks whether the address is preserved.
    pub fn contains(&self, address: Va) -> bool {
        self.regions.contains_key(&address)
    }

    /// Returns the snapshot of an address.
    pub fn get(&self, address: Va) -> Option<&[u8]> {
        self.regions.get(&address).map(Vec::as_slice)
    }

    /// Drops the snapshot without writing it back.
    pub fn forget(&mut self, address: Va) -> Option<Vec<u8>> {
        self.regions.shift_remove(&address)
    }

    /// Returns the number of preserved regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Checks whether nothing is preserved.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
