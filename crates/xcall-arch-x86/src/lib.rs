//! x86 and x86-64 code generation.
//!
//! This crate provides everything that needs to know about instruction
//! encodings:
//!
//! - the [`wrapper`] stub a remote thread starts in
//! - [`trampoline`] branches written over hooked code
//! - [`branch`] decoding of jumps and calls
//! - a text [`assembler`] and a [`decoder`] backed by `iced-x86`
//!
//! [`X86Toolchain`] bundles the assembler and the decoder behind the
//! [`Assembler`] and [`Disassembler`] traits from `xcall-core`.

pub mod assembler;
pub mod branch;
pub mod decoder;
pub mod trampoline;
pub mod wrapper;

use xcall_core::{Assembler, Bitness, DecodedInstruction, Disassembler, Va, XcallError};

pub use self::{
    branch::{BranchTarget, JumpKind, MAX_BRANCH_LENGTH},
    decoder::covering_length,
    trampoline::{Branch, HookKind},
    wrapper::{CompletionSignal, ReturnKind, WrapperLayout},
};

/// The `iced-x86` based assembler and disassembler.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Toolchain;

impl Assembler for X86Toolchain {
    fn assemble(&self, bitness: Bitness, source: &str, origin: Va) -> Result<Vec<u8>, XcallError> {
        assembler::assemble(bitness, source, origin)
    }
}

impl Disassembler for X86Toolchain {
    fn disassemble(
        &self,
        bitness: Bitness,
        code: &[u8],
        origin: Va,
    ) -> Result<Vec<DecodedInstruction>, XcallError> {
        decoder::disassemble(bitness, code, origin)
    }
}
