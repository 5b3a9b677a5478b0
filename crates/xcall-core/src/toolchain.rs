//! Assembler and disassembler collaborators.

use crate::{Bitness, Va, XcallError};

/// Translates assembly source into machine code.
pub trait Assembler {
    /// Assembles `source` as if it were placed at `origin`.
    ///
    /// Instructions are separated by newlines or `;`.
    fn assemble(&self, bitness: Bitness, source: &str, origin: Va) -> Result<Vec<u8>, XcallError>;
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// Address of the instruction.
    pub address: Va,

    /// Encoded length in bytes.
    pub length: usize,

    /// Textual form of the instruction.
    pub text: String,
}

/// Translates machine code into instructions.
pub trait Disassembler {
    /// Decodes `code` located at `origin`.
    ///
    /// Decoding stops at the first invalid or truncated instruction, so the
    /// result may cover only a prefix of `code`.
    fn disassemble(
        &self,
        bitness: Bitness,
        code: &[u8],
        origin: Va,
    ) -> Result<Vec<DecodedInstruction>, XcallError>;
}
