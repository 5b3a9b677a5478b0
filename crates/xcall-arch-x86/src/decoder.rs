//! Instruction decoding for hook placement and code reading.

use iced_x86::{Decoder, DecoderOptions, Formatter as _, NasmFormatter};
use xcall_core::{Bitness, DecodedInstruction, Va, XcallError};

/// Decodes `code` located at `origin` into instructions.
///
/// Decoding stops at the first invalid or truncated instruction.
pub fn disassemble(
    bitness: Bitness,
    code: &[u8],
    origin: Va,
) -> Result<Vec<DecodedInstruction>, XcallError> {
    let mut decoder = Decoder::try_with_ip(bitness.bits(), code, origin.0, DecoderOptions::NONE)
        .map_err(|err| XcallError::Disassembler(err.to_string()))?;

    let mut formatter = NasmFormatter::new();
    let mut result = Vec::new();

    while decoder.can_decode() {
        let instruction = decoder.decode();

        if instruction.is_invalid() {
            break;
        }

        let mut text = String::new();
        formatter.format(&instruction, &mut text);

        result.push(DecodedInstruction {
            address: Va(instruction.ip()),
            length: instruction.len(),
            text,
        });
    }

    Ok(result)
}

/// Returns the smallest prefix of whole instructions that covers at least
/// `minimum` bytes.
///
/// Returns `None` if the decoded instructions do not reach `minimum`.
pub fn covering_length(instructions: &[DecodedInstruction], minimum: usize) -> Option<usize> {
    let mut length = 0;

    for instruction in instructions {
        if length >= minimum {
            break;
        }

        length += instruction.length;
    }

    (length >= minimum).then_some(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_until_invalid() {
        // mov eax,[rsp+10h]; mov ecx,[rsp+8]; add ecx,eax; (truncated)
        let code = [0x8b, 0x44, 0x24, 0x10, 0x8b, 0x4c, 0x24, 0x08, 0x03, 0xc8, 0x8b];
        let instructions = disassemble(Bitness::X64, &code, Va(0x1000)).unwrap();

        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[0].length, 4);
        assert_eq!(instructions[1].address, Va(0x1004));
        assert_eq!(instructions[2].length, 2);
        assert!(instructions[0].text.starts_with("mov"));
    }

    #[test]
    fn covering() {
        let code = [
            0x8b, 0x44, 0x24, 0x10, 0x8b, 0x4c, 0x24, 0x08, 0x03, 0xc8, 0x8b, 0xc1, 0x03, 0x44,
            0x24, 0x18, 0xc3,
        ];
        let instructions = disassemble(Bitness::X64, &code, Va(0)).unwrap();

        assert_eq!(covering_length(&instructions, 14), Some(16));
        assert_eq!(covering_length(&instructions, 5), Some(8));
        assert_eq!(covering_length(&instructions, 18), None);
    }
}
