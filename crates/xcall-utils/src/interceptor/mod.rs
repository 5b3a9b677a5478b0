//! Mid-function hooks and code patching.
//!
//! Installing a hook at an address:
//! - Decodes the instructions at the address until they cover the entry
//!   branch (5 bytes on 32-bit, 14 bytes on 64-bit)
//! - Preserves the covered bytes and fills them with `NOP`s
//! - Assembles the hook body into a fresh executable block, followed by a
//!   trailer that resumes after the covered instructions
//! - Writes the entry branch over the covered bytes
//!
//! The covered instructions are *not* relocated into the block. The hook
//! body replaces them, so it must redo whatever work they did.
//!
//! The `Interceptor` also provides smaller patch helpers, all of which go
//! through the same [`MemoryPreserver`] so that any patch can be undone with
//! [`Interceptor::restore_memory`].

mod preserver;
pub mod reader;

use std::{collections::HashMap, marker::PhantomData};

use xcall_arch_x86::{HookKind, branch, covering_length, trampoline};
use xcall_core::{
    Assembler, Disassembler, MemoryProtection, Va, XcallCore, XcallDriver, XcallError,
};

pub use self::preserver::{MemoryPreserver, Preserve};


/// Number of bytes decoded when looking for the overwrite length.
const DECODE_WINDOW: usize = 64;

/// Size of the executable block allocated for each hook.
const HOOK_BLOCK_SIZE: u64 = 0x1000;

/// An installed hook.
#[derive(Debug, Clone, Copy)]
struct Hook {
    block: Va,
    consumed: usize,
    kind: HookKind,
}

/// Hook and patch management for a single target process.
pub struct Interceptor<Driver, Toolchain>
where
    Driver: XcallDriver,
    Toolchain: Assembler + Disassembler,
{
    toolchain: Toolchain,
    hooks: HashMap<Va, Hook>,
    preserver: MemoryPreserver,
    _marker: PhantomData<Driver>,
}

impl<Driver, Toolchain> Interceptor<Driver, Toolchain>
where
    Driver: XcallDriver,
    Toolchain: Assembler + Disassembler,
{
    /// Creates a new `Interceptor` using the given assembler and
    /// disassembler.
    pub fn new(toolchain: Toolchain) -> Self {
        Self {
            toolchain,
            hooks: HashMap::new(),
            preserver: MemoryPreserver::new(),
            _marker: PhantomData,
        }
    }

    /// Returns the preserver holding the original bytes of every patch.
    pub fn preserver(&self) -> &MemoryPreserver {
        &self.preserver
    }

    /// Checks whether a hook is installed at the given address.
    pub fn is_hooked(&self, address: Va) -> bool {
        self.hooks.contains_key(&address)
    }

    /// Returns the block holding the hook body for the given address.
    pub fn hook_block(&self, address: Va) -> Option<Va> {
        self.hooks.get(&address).map(|hook| hook.block)
    }

    /// Installs a hook at the given address and returns the address of the
    /// block holding the hook body.
    ///
    /// `source` is assembled at the block address. An existing hook at the
    /// same address is removed first. With `preserve`, the overwritten bytes
    /// are kept so the hook can be removed later.
    pub fn install_hook(
        &mut self,
        core: &XcallCore<Driver>,
        address: Va,
        source: &str,
        kind: HookKind,
        preserve: bool,
    ) -> Result<Va, XcallError> {
        // Start from the original code.
        if self.hooks.contains_key(&address) {
            self.remove_hook(core, address)?;
        }
        else {
            self.preserver.restore(core, address)?;
        }

        let bitness = core.bitness();
        let entry_length = trampoline::entry_length(bitness);

        // Find the smallest run of whole instructions covering the entry.
        let code = core.read_bytes(address, DECODE_WINDOW)?;
        let instructions = self.toolchain.disassemble(bitness, &code, address)?;
        let consumed = covering_length(&instructions, entry_length).ok_or_else(|| {
            XcallError::Disassembler(format!("cannot decode {entry_length} bytes at {address}"))
        })?;

        let block = core.allocate(HOOK_BLOCK_SIZE, MemoryProtection::RWX)?;

        if let Err(err) = self.place(core, address, source, kind, block, consumed, preserve) {
            // Put back whatever reached the hooked code.
            if let Err(err) = self.preserver.restore(core, address) {
                tracing::warn!(%address, %err, "failed to restore hooked code");
            }

            if let Err(err) = core.free(block) {
                tracing::warn!(%block, %err, "failed to free hook block");
            }

            return Err(err);
        }

        self.hooks.insert(
            address,
            Hook {
                block,
                consumed,
                kind,
            },
        );

        tracing::debug!(%address, %block, consumed, ?kind, "hook installed");
        Ok(block)
    }

    /// Writes the hook body and redirects `address` into it.
    #[expect(clippy::too_many_arguments)]
    fn place(
        &mut self,
        core: &XcallCore<Driver>,
        address: Va,
        source: &str,
        kind: HookKind,
        block: Va,
        consumed: usize,
        preserve: bool,
    ) -> Result<(), XcallError> {
        let bitness = core.bitness();

        let body = self.build_body(core, address, source, kind, block, consumed)?;
        core.write(block, &body)?;

        if preserve {
            self.preserver.preserve(core, address, consumed)?;
        }

        // Whatever the entry does not cover up to the resume point is NOP.
        core.write_protected(address, &vec![0x90; consumed])?;

        let entry = trampoline::entry(bitness, kind, address, block)?;
        core.write_protected(address, &entry)
    }

    fn build_body(
        &self,
        core: &XcallCore<Driver>,
        address: Va,
        source: &str,
        kind: HookKind,
        block: Va,
        consumed: usize,
    ) -> Result<Vec<u8>, XcallError> {
        let bitness = core.bitness();

        let mut body = self.toolchain.assemble(bitness, source, block)?;
        let trailer = trampoline::trailer(
            bitness,
            kind,
            block + body.len() as u64,
            address + consumed as u64,
        )?;
        body.extend_from_slice(&trailer);

        if body.len() as u64 > HOOK_BLOCK_SIZE {
            return Err(XcallError::OutOfBounds);
        }

        Ok(body)
    }

    /// Removes the hook at the given address.
    ///
    /// The original bytes are restored and the hook block is freed. Returns
    /// `false` if no hook is installed at the address. A hook installed
    /// without preserving the original bytes cannot be removed.
    pub fn remove_hook(
        &mut self,
        core: &XcallCore<Driver>,
        address: Va,
    ) -> Result<bool, XcallError> {
        let hook = match self.hooks.get(&address) {
            Some(hook) => *hook,
            None => return Ok(false),
        };

        if !self.preserver.restore(core, address)? {
            return Err(XcallError::Other("original bytes of the hook were not preserved"));
        }

        self.hooks.remove(&address);
        core.free(hook.block)?;

        tracing::debug!(
            %address,
            block = %hook.block,
            consumed = hook.consumed,
            kind = ?hook.kind,
            "hook removed"
        );

        Ok(true)
    }

    /// Removes every hook and restores every preserved region.
    pub fn clear(&mut self, core: &XcallCore<Driver>) -> Result<(), XcallError> {
        let addresses = self.hooks.keys().copied().collect::<Vec<_>>();

        for address in addresses {
            self.remove_hook(core, address)?;
        }

        self.preserver.restore_all(core)
    }

    /// Overwrites `count` bytes at the given address with `NOP`s.
    pub fn write_nop(
        &mut self,
        core: &XcallCore<Driver>,
        address: Va,
        count: usize,
        preserve: Preserve,
    ) -> Result<(), XcallError> {
        self.preserver.preserve_with(core, address, count, preserve)?;

        core.write_protected(address, &vec![0x90; count])?;

        tracing::debug!(%address, count, "nop written");
        Ok(())
    }

    /// Turns the conditional jump at the given address into an unconditional
    /// one with the same target.
    ///
    /// Returns `false` if there is no conditional jump at the address.
    pub fn write_force_jump(
        &mut self,
        core: &XcallCore<Driver>,
        address: Va,
        preserve: Preserve,
    ) -> Result<bool, XcallError> {
        let code = core.read_bytes(address, branch::MAX_BRANCH_LENGTH)?;

        let patch = match branch::force_jump(&code) {
            Some(patch) => patch,
            None => return Ok(false),
        };

        self.preserver.preserve_with(core, address, patch.len(), preserve)?;

        core.write_protected(address, &patch)?;

        tracing::debug!(%address, length = patch.len(), "jump forced");
        Ok(true)
    }

    /// Restores the bytes preserved at the given address, removing the hook
    /// installed there, if any.
    ///
    /// Returns `false` if nothing is preserved there.
    pub fn restore_memory(
        &mut self,
        core: &XcallCore<Driver>,
        address: Va,
    ) -> Result<bool, XcallError> {
        if self.hooks.contains_key(&address) {
            return self.remove_hook(core, address);
        }

        self.preserver.restore(core, address)
    }
}
