use windows::Win32::System::{
    Diagnostics::Debug::{CONTEXT, M128A, WOW64_CONTEXT},
    Memory::{
        PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
        PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
    },
};
use xcall_core::{MemoryProtection, Registers};

/// Offset of `xmm0` inside the `FXSAVE` area of a WOW64 context.
const WOW64_XMM_OFFSET: usize = 160;

/// Number of vector registers visible to 32-bit code.
const WOW64_XMM_COUNT: usize = 8;

pub(crate) trait IntoExt<T> {
    fn into_ext(self) -> T;
}

impl IntoExt<PAGE_PROTECTION_FLAGS> for MemoryProtection {
    fn into_ext(self) -> PAGE_PROTECTION_FLAGS {
        let read = self.contains(MemoryProtection::R);
        let write = self.contains(MemoryProtection::W);

        if self.contains(MemoryProtection::X) {
            match (read, write) {
                (_, true) => PAGE_EXECUTE_READWRITE,
                (true, false) => PAGE_EXECUTE_READ,
                (false, false) => PAGE_EXECUTE,
            }
        }
        else {
            match (read, write) {
                (_, true) => PAGE_READWRITE,
                (true, false) => PAGE_READONLY,
                (false, false) => PAGE_NOACCESS,
            }
        }
    }
}

impl IntoExt<MemoryProtection> for PAGE_PROTECTION_FLAGS {
    fn into_ext(self) -> MemoryProtection {
        // Modifiers such as PAGE_GUARD live above the low byte.
        match PAGE_PROTECTION_FLAGS(self.0 & 0xff) {
            PAGE_READONLY => MemoryProtection::R,
            PAGE_READWRITE | PAGE_WRITECOPY => MemoryProtection::RW,
            PAGE_EXECUTE => MemoryProtection::X,
            PAGE_EXECUTE_READ => MemoryProtection::RX,
            PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => MemoryProtection::RWX,
            _ => MemoryProtection::empty(),
        }
    }
}

fn from_m128(value: M128A) -> u128 {
    ((value.High as u64 as u128) << 64) | value.Low as u128
}

fn to_m128(value: u128) -> M128A {
    M128A {
        Low: value as u64,
        High: (value >> 64) as u64 as i64,
    }
}

impl IntoExt<Registers> for &CONTEXT {
    fn into_ext(self) -> Registers {
        let save = unsafe { self.Anonymous.FltSave };

        Registers {
            rax: self.Rax,
            rbx: self.Rbx,
            rcx: self.Rcx,
            rdx: self.Rdx,
            rsi: self.Rsi,
            rdi: self.Rdi,
            rbp: self.Rbp,
            rsp: self.Rsp,
            r8: self.R8,
            r9: self.R9,
            r10: self.R10,
            r11: self.R11,
            r12: self.R12,
            r13: self.R13,
            r14: self.R14,
            r15: self.R15,
            rip: self.Rip,
            rflags: self.EFlags as u64,
            xmm: save.XmmRegisters.map(from_m128),
        }
    }
}

/// Copies `registers` into a captured 64-bit context.
pub(crate) fn apply_context(context: &mut CONTEXT, registers: &Registers) {
    context.Rax = registers.rax;
    context.Rbx = registers.rbx;
    context.Rcx = registers.rcx;
    context.Rdx = registers.rdx;
    context.Rsi = registers.rsi;
    context.Rdi = registers.rdi;
    context.Rbp = registers.rbp;
    context.Rsp = registers.rsp;
    context.R8 = registers.r8;
    context.R9 = registers.r9;
    context.R10 = registers.r10;
    context.R11 = registers.r11;
    context.R12 = registers.r12;
    context.R13 = registers.r13;
    context.R14 = registers.r14;
    context.R15 = registers.r15;
    context.Rip = registers.rip;
    context.EFlags = registers.rflags as u32;

    let mut save = unsafe { context.Anonymous.FltSave };
    save.XmmRegisters = registers.xmm.map(to_m128);
    context.Anonymous.FltSave = save;
}

impl IntoExt<Registers> for &WOW64_CONTEXT {
    fn into_ext(self) -> Registers {
        let mut xmm = [0u128; 16];

        for (index, slot) in xmm.iter_mut().take(WOW64_XMM_COUNT).enumerate() {
            let offset = WOW64_XMM_OFFSET + index * 16;
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&self.ExtendedRegisters[offset..offset + 16]);
            *slot = u128::from_le_bytes(bytes);
        }

        Registers {
            rax: self.Eax as u64,
            rbx: self.Ebx as u64,
            rcx: self.Ecx as u64,
            rdx: self.Edx as u64,
            rsi: self.Esi as u64,
            rdi: self.Edi as u64,
            rbp: self.Ebp as u64,
            rsp: self.Esp as u64,
            rip: self.Eip as u64,
            rflags: self.EFlags as u64,
            xmm,
            ..Default::default()
        }
    }
}

/// Copies `registers` into a captured WOW64 context.
///
/// The upper halves of the general-purpose registers and `xmm8`-`xmm15`
/// are dropped.
pub(crate) fn apply_wow64_context(context: &mut WOW64_CONTEXT, registers: &Registers) {
    context.Eax = registers.rax as u32;
    context.Ebx = registers.rbx as u32;
    context.Ecx = registers.rcx as u32;
    context.Edx = registers.rdx as u32;
    context.Esi = registers.rsi as u32;
    context.Edi = registers.rdi as u32;
    context.Ebp = registers.rbp as u32;
    context.Esp = registers.rsp as u32;
    context.Eip = registers.rip as u32;
    context.EFlags = registers.rflags as u32;

    for (index, value) in registers.xmm.iter().take(WOW64_XMM_COUNT).enumerate() {
        let offset = WOW64_XMM_OFFSET + index * 16;
        context.ExtendedRegisters[offset..offset + 16].copy_from_slice(&value.to_le_bytes());
    }
}
