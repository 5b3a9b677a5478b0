//! Decoding of branch instructions from raw bytes.

use xcall_core::Va;

/// Number of bytes needed to classify any supported branch.
pub const MAX_BRANCH_LENGTH: usize = 14;

/// The form of a jump instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpKind {
    /// Not a recognized jump.
    Unknown,

    /// `Jcc rel8`, `JECXZ rel8` or `JMP rel8`.
    Short,

    /// `JMP rel32`.
    Near,

    /// `0F 8x Jcc rel32`.
    NearConditional,

    /// `JMP [mem]` (`FF 25 disp32`).
    Long,
}

/// Where a branch transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchTarget {
    /// The branch target is known.
    Direct(Va),

    /// The target is stored at this address.
    Indirect(Va),
}

/// Classifies the jump at the start of `code`.
pub fn jump_kind(code: &[u8]) -> JumpKind {
    match code {
        [0x70..=0x7f | 0xe3 | 0xeb, _, ..] => JumpKind::Short,
        [0xe9, _, _, _, _, ..] => JumpKind::Near,
        [0x0f, 0x80..=0x8f, _, _, _, _, ..] => JumpKind::NearConditional,
        [0xff, 0x25, _, _, _, _, ..] => JumpKind::Long,
        _ => JumpKind::Unknown,
    }
}

/// Computes the target of the jump at `address`.
///
/// For 64-bit code, `FF 25` is RIP-relative and the pointer lives at
/// `address + 6 + disp32`. For 32-bit code the displacement is the absolute
/// address of the pointer.
pub fn jump_target(address: Va, code: &[u8], is_64bit: bool) -> Option<BranchTarget> {
    match jump_kind(code) {
        JumpKind::Unknown => None,
        JumpKind::Short => Some(BranchTarget::Direct(
            (address + 2).wrapping_offset(code[1] as i8 as i64),
        )),
        JumpKind::Near => Some(BranchTarget::Direct(
            (address + 5).wrapping_offset(rel32(&code[1..])? as i64),
        )),
        JumpKind::NearConditional => Some(BranchTarget::Direct(
            (address + 6).wrapping_offset(rel32(&code[2..])? as i64),
        )),
        JumpKind::Long => {
            let displacement = rel32(&code[2..])?;

            if is_64bit {
                Some(BranchTarget::Indirect(
                    (address + 6).wrapping_offset(displacement as i64),
                ))
            }
            else {
                Some(BranchTarget::Indirect(Va(displacement as u32 as u64)))
            }
        }
    }
}

/// Computes the target of a `CALL rel32` at `address`.
pub fn call_target(address: Va, code: &[u8]) -> Option<Va> {
    match code {
        [0xe8, rest @ ..] => Some((address + 5).wrapping_offset(rel32(rest)? as i64)),
        _ => None,
    }
}

/// Computes the effective address of a 7-byte RIP-relative instruction,
/// such as `lea rax, [rip+disp32]` or `mov rax, [rip+disp32]`.
pub fn rip_relative_target(address: Va, code: &[u8]) -> Option<Va> {
    if code.len() < 7 {
        return None;
    }

    Some((address + 7).wrapping_offset(rel32(&code[3..])? as i64))
}

/// Rewrites a conditional jump into an unconditional one with the same
/// target.
///
/// `Jcc rel8` becomes `JMP rel8`. `Jcc rel32` (6 bytes) becomes
/// `JMP rel32` (5 bytes) followed by a `NOP`; the displacement grows by one
/// to compensate for the shorter instruction.
pub fn force_jump(code: &[u8]) -> Option<Vec<u8>> {
    match jump_kind(code) {
        JumpKind::Short => Some(vec![0xeb, code[1]]),
        JumpKind::NearConditional => {
            let displacement = rel32(&code[2..])?.wrapping_add(1);

            let mut result = Vec::with_capacity(6);
            result.push(0xe9);
            result.extend_from_slice(&displacement.to_le_bytes());
            result.push(0x90);
            Some(result)
        }
        _ => None,
    }
}

fn rel32(code: &[u8]) -> Option<i32> {
    Some(i32::from_le_bytes(code.get(..4)?.try_into().ok()?))
}
