//! Branch encodings used to divert code into a hook.
//!
//! 32-bit targets use relative branches (`E9`/`E8 rel32`), which reach the
//! whole address space. 64-bit targets use RIP-relative indirect branches
//! through an inline literal (`FF 25`/`FF 15 00000000` followed by the
//! absolute target), which is position independent and needs no scratch
//! register.

use smallvec::SmallVec;
use xcall_core::{Bitness, Va, XcallError};

/// Encoded branch bytes.
pub type Branch = SmallVec<[u8; 16]>;

/// How control enters a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// The hooked code jumps to the hook; the hook jumps back.
    Jump,

    /// The hooked code calls the hook; the hook returns.
    Call,
}

/// Returns the number of bytes the entry branch occupies.
pub const fn entry_length(bitness: Bitness) -> usize {
    match bitness {
        Bitness::X86 => 5,
        Bitness::X64 => 14,
    }
}

/// Encodes the branch written over the hooked code at `from`, diverting to
/// `to`.
pub fn entry(bitness: Bitness, kind: HookKind, from: Va, to: Va) -> Result<Branch, XcallError> {
    match (bitness, kind) {
        (Bitness::X86, HookKind::Jump) => relative(0xe9, from, to),
        (Bitness::X86, HookKind::Call) => relative(0xe8, from, to),
        (Bitness::X64, HookKind::Jump) => Ok(absolute(0x25, to)),
        (Bitness::X64, HookKind::Call) => Ok(absolute(0x15, to)),
    }
}

/// Encodes the code appended to the hook body at `at`.
///
/// A jump hook branches back to `resume`, the first instruction after the
/// overwritten region. A call hook returns instead. On 64-bit targets the
/// return address pushed by `call [rip]` points at the inline literal, so
/// it is advanced past the 8 literal bytes before returning.
pub fn trailer(
    bitness: Bitness,
    kind: HookKind,
    at: Va,
    resume: Va,
) -> Result<Branch, XcallError> {
    match (bitness, kind) {
        (Bitness::X86, HookKind::Jump) => relative(0xe9, at, resume),
        (Bitness::X64, HookKind::Jump) => Ok(absolute(0x25, resume)),
        (Bitness::X86, HookKind::Call) => Ok(SmallVec::from_slice(&[0xc3])),
        (Bitness::X64, HookKind::Call) => {
            // add qword ptr [rsp], 8
            // ret
            Ok(SmallVec::from_slice(&[0x48, 0x83, 0x04, 0x24, 0x08, 0xc3]))
        }
    }
}

/// `opcode rel32`, where `rel32` is measured from the end of the
/// instruction.
fn relative(opcode: u8, from: Va, to: Va) -> Result<Branch, XcallError> {
    let from = u32::try_from(from.0).map_err(|_| XcallError::InvalidAddressWidth)?;
    let to = u32::try_from(to.0).map_err(|_| XcallError::InvalidAddressWidth)?;
    let displacement = to.wrapping_sub(from.wrapping_add(5));

    let mut result = Branch::new();
    result.push(opcode);
    result.extend_from_slice(&displacement.to_le_bytes());
    Ok(result)
}

/// `FF /modrm [rip+0]` followed by the absolute target.
fn absolute(modrm: u8, to: Va) -> Branch {
    let mut result = Branch::new();
    result.extend_from_slice(&[0xff, modrm, 0x00, 0x00, 0x00, 0x00]);
    result.extend_from_slice(&to.0.to_le_bytes());
    result
}
