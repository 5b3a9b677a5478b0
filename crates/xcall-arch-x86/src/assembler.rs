//! A small text assembler for hook bodies.
//!
//! The accepted syntax is Intel-flavored and deliberately narrow:
//!
//! - one instruction per line or per `;`-separated statement
//! - 32-bit and 64-bit general-purpose registers
//! - decimal or `0x`-prefixed immediates, optionally negative
//! - memory operands of the form `[base]`, `[base+disp]` or `[base-disp]`,
//!   optionally preceded by `byte`, `word`, `dword` or `qword` (with or
//!   without `ptr`)
//!
//! Supported mnemonics: `mov`, `add`, `sub`, `and`, `or`, `xor`, `cmp`,
//! `test`, `lea`, `push`, `pop`, `call`, `jmp`, `ret`, `nop` and `int3`.

use iced_x86::code_asm::*;
use xcall_core::{Bitness, Va, XcallError};

#[derive(Debug, Clone, Copy)]
enum Operand {
    Register32(AsmRegister32),
    Register64(AsmRegister64),
    Immediate(i64),
    Memory(AsmMemoryOperand),
}

#[derive(Debug, Clone, Copy)]
enum Base {
    Register32(AsmRegister32),
    Register64(AsmRegister64),
}

/// Assembles `source` for code placed at `origin`.
pub fn assemble(bitness: Bitness, source: &str, origin: Va) -> Result<Vec<u8>, XcallError> {
    let mut a = CodeAssembler::new(bitness.bits()).map_err(assembler_error)?;

    for statement in source
        .split(['\n', ';'])
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
    {
        emit(&mut a, statement)
            .map_err(|err| XcallError::Assembler(format!("`{statement}`: {err}")))?;
    }

    let code = a.assemble(origin.0).map_err(assembler_error)?;
    tracing::trace!(%origin, length = code.len(), "assembled");
    Ok(code)
}

fn assembler_error(err: iced_x86::IcedError) -> XcallError {
    XcallError::Assembler(err.to_string())
}

macro_rules! binary {
    ($a:expr, $method:ident, $dst:expr, $src:expr, $wide:ty) => {
        match ($dst, $src) {
            (Operand::Register32(d), Operand::Register32(s)) => $a.$method(d, s),
            (Operand::Register64(d), Operand::Register64(s)) => $a.$method(d, s),
            (Operand::Register32(d), Operand::Memory(s)) => $a.$method(d, s),
            (Operand::Register64(d), Operand::Memory(s)) => $a.$method(d, s),
            (Operand::Memory(d), Operand::Register32(s)) => $a.$method(d, s),
            (Operand::Memory(d), Operand::Register64(s)) => $a.$method(d, s),
            (Operand::Register32(d), Operand::Immediate(s)) => $a.$method(d, s as i32),
            (Operand::Register64(d), Operand::Immediate(s)) => $a.$method(d, s as $wide),
            (Operand::Memory(d), Operand::Immediate(s)) => $a.$method(d, s as i32),
            _ => return Err(format!("invalid operands for `{}`", stringify!($method))),
        }
    };
}

fn emit(a: &mut CodeAssembler, statement: &str) -> Result<(), String> {
    let statement = statement.to_lowercase();
    let (mnemonic, rest) = match statement.split_once(char::is_whitespace) {
        Some((mnemonic, rest)) => (mnemonic, rest.trim()),
        None => (statement.as_str(), ""),
    };

    let operands = if rest.is_empty() {
        Vec::new()
    }
    else {
        rest.split(',')
            .map(|operand| parse_operand(operand.trim()))
            .collect::<Result<Vec<_>, _>>()?
    };

    let result = match (mnemonic, operands.as_slice()) {
        ("mov", &[dst, src]) => binary!(a, mov, dst, src, i64),
        ("add", &[dst, src]) => binary!(a, add, dst, src, i32),
        ("sub", &[dst, src]) => binary!(a, sub, dst, src, i32),
        ("and", &[dst, src]) => binary!(a, and, dst, src, i32),
        ("or", &[dst, src]) => binary!(a, or, dst, src, i32),
        ("xor", &[dst, src]) => binary!(a, xor, dst, src, i32),
        ("cmp", &[dst, src]) => binary!(a, cmp, dst, src, i32),
        ("test", &[dst, src]) => match (dst, src) {
            (Operand::Register32(d), Operand::Register32(s)) => a.test(d, s),
            (Operand::Register64(d), Operand::Register64(s)) => a.test(d, s),
            (Operand::Register32(d), Operand::Immediate(s)) => a.test(d, s as i32),
            (Operand::Register64(d), Operand::Immediate(s)) => a.test(d, s as i32),
            _ => return Err("invalid operands for `test`".into()),
        },
        ("lea", &[dst, Operand::Memory(src)]) => match dst {
            Operand::Register32(d) => a.lea(d, src),
            Operand::Register64(d) => a.lea(d, src),
            _ => return Err("invalid operands for `lea`".into()),
        },
        ("push", &[operand]) => match operand {
            Operand::Register32(r) => a.push(r),
            Operand::Register64(r) => a.push(r),
            Operand::Immediate(i) => a.push(i as i32),
            Operand::Memory(m) => a.push(m),
        },
        ("pop", &[operand]) => match operand {
            Operand::Register32(r) => a.pop(r),
            Operand::Register64(r) => a.pop(r),
            Operand::Memory(m) => a.pop(m),
            Operand::Immediate(_) => return Err("cannot pop into an immediate".into()),
        },
        ("call", &[operand]) => match operand {
            Operand::Register32(r) => a.call(r),
            Operand::Register64(r) => a.call(r),
            Operand::Immediate(i) => a.call(i as u64),
            Operand::Memory(m) => a.call(m),
        },
        ("jmp", &[operand]) => match operand {
            Operand::Register32(r) => a.jmp(r),
            Operand::Register64(r) => a.jmp(r),
            Operand::Immediate(i) => a.jmp(i as u64),
            Operand::Memory(m) => a.jmp(m),
        },
        ("ret", &[]) => a.ret(),
        ("nop", &[]) => a.nop(),
        ("int3", &[]) => a.int3(),
        _ => return Err(format!("unsupported instruction `{mnemonic}`")),
    };

    result.map_err(|err| err.to_string())
}

fn parse_operand(text: &str) -> Result<Operand, String> {
    if let Some(register) = parse_register(text) {
        return Ok(match register {
            Base::Register32(r) => Operand::Register32(r),
            Base::Register64(r) => Operand::Register64(r),
        });
    }

    if text.contains('[') {
        return parse_memory(text).map(Operand::Memory);
    }

    parse_immediate(text).map(Operand::Immediate)
}

fn parse_memory(text: &str) -> Result<AsmMemoryOperand, String> {
    let open = text.find('[').ok_or("missing `[`")?;
    let close = text.rfind(']').ok_or("missing `]`")?;

    let size = text[..open].trim();
    let size = size.strip_suffix("ptr").unwrap_or(size).trim();
    let inner = text[open + 1..close].replace(' ', "");

    let (base, displacement) = match inner.find(['+', '-']) {
        Some(position) => {
            let displacement = parse_immediate(&inner[position + 1..])?;
            let displacement = i32::try_from(displacement)
                .map_err(|_| format!("displacement out of range: `{inner}`"))?;

            match &inner[position..position + 1] {
                "-" => (&inner[..position], -displacement),
                _ => (&inner[..position], displacement),
            }
        }
        None => (inner.as_str(), 0),
    };

    let address = match parse_register(base) {
        Some(Base::Register32(r)) => r + displacement,
        Some(Base::Register64(r)) => r + displacement,
        None => return Err(format!("invalid base register `{base}`")),
    };

    match size {
        "" => Ok(ptr(address)),
        "byte" => Ok(byte_ptr(address)),
        "word" => Ok(word_ptr(address)),
        "dword" => Ok(dword_ptr(address)),
        "qword" => Ok(qword_ptr(address)),
        _ => Err(format!("invalid operand size `{size}`")),
    }
}

fn parse_immediate(text: &str) -> Result<i64, String> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, text),
    };

    let value = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|_| format!("invalid operand `{text}`"))? as i64;

    Ok(if negative { value.wrapping_neg() } else { value })
}

fn parse_register(name: &str) -> Option<Base> {
    Some(match name {
        "eax" => Base::Register32(eax),
        "ebx" => Base::Register32(ebx),
        "ecx" => Base::Register32(ecx),
        "edx" => Base::Register32(edx),
        "esi" => Base::Register32(esi),
        "edi" => Base::Register32(edi),
        "ebp" => Base::Register32(ebp),
        "esp" => Base::Register32(esp),
        "r8d" => Base::Register32(r8d),
        "r9d" => Base::Register32(r9d),
        "r10d" => Base::Register32(r10d),
        "r11d" => Base::Register32(r11d),
        "r12d" => Base::Register32(r12d),
        "r13d" => Base::Register32(r13d),
        "r14d" => Base::Register32(r14d),
        "r15d" => Base::Register32(r15d),
        "rax" => Base::Register64(rax),
        "rbx" => Base::Register64(rbx),
        "rcx" => Base::Register64(rcx),
        "rdx" => Base::Register64(rdx),
        "rsi" => Base::Register64(rsi),
        "rdi" => Base::Register64(rdi),
        "rbp" => Base::Register64(rbp),
        "rsp" => Base::Register64(rsp),
        "r8" => Base::Register64(r8),
        "r9" => Base::Register64(r9),
        "r10" => Base::Register64(r10),
        "r11" => Base::Register64(r11),
        "r12" => Base::Register64(r12),
        "r13" => Base::Register64(r13),
        "r14" => Base::Register64(r14),
        "r15" => Base::Register64(r15),
        _ => return None,
    })
}
