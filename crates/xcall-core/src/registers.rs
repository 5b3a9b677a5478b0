//! General-purpose and vector register snapshot.

use serde::{Deserialize, Serialize};

/// A general-purpose register.
///
/// On 32-bit targets the names refer to the 32-bit registers
/// (`Rax` is `eax`, `Rip` is `eip`) and `R8`-`R15` do not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[expect(missing_docs)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
}

impl Register {
    /// Integer argument registers of the 64-bit Windows calling convention.
    pub const FASTCALL64: [Register; 4] = [Self::Rcx, Self::Rdx, Self::R8, Self::R9];

    /// Register arguments of the 32-bit fastcall convention.
    pub const FASTCALL32: [Register; 2] = [Self::Rcx, Self::Rdx];

    /// Returns `true` for registers that exist only in 64-bit mode.
    pub const fn is_extended(self) -> bool {
        matches!(
            self,
            Self::R8
                | Self::R9
                | Self::R10
                | Self::R11
                | Self::R12
                | Self::R13
                | Self::R14
                | Self::R15
        )
    }
}

/// A snapshot of the thread state relevant to calls.
///
/// The same layout serves 32-bit and 64-bit threads. For 32-bit threads the
/// upper halves of the general-purpose registers are zero, and only the first
/// eight vector registers are meaningful.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[expect(missing_docs)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub xmm: [u128; 16],
}

impl Registers {
    /// Returns the value of a general-purpose register.
    pub fn gpr(&self, register: Register) -> u64 {
        match register {
            Register::Rax => self.rax,
            Register::Rbx => self.rbx,
            Register::Rcx => self.rcx,
            Register::Rdx => self.rdx,
            Register::Rsi => self.rsi,
            Register::Rdi => self.rdi,
            Register::Rbp => self.rbp,
            Register::Rsp => self.rsp,
            Register::R8 => self.r8,
            Register::R9 => self.r9,
            Register::R10 => self.r10,
            Register::R11 => self.r11,
            Register::R12 => self.r12,
            Register::R13 => self.r13,
            Register::R14 => self.r14,
            Register::R15 => self.r15,
            Register::Rip => self.rip,
        }
    }

    /// Sets the value of a general-purpose register.
    pub fn set_gpr(&mut self, register: Register, value: u64) {
        let slot = match register {
            Register::Rax => &mut self.rax,
            Register::Rbx => &mut self.rbx,
            Register::Rcx => &mut self.rcx,
            Register::Rdx => &mut self.rdx,
            Register::Rsi => &mut self.rsi,
            Register::Rdi => &mut self.rdi,
            Register::Rbp => &mut self.rbp,
            Register::Rsp => &mut self.rsp,
            Register::R8 => &mut self.r8,
            Register::R9 => &mut self.r9,
            Register::R10 => &mut self.r10,
            Register::R11 => &mut self.r11,
            Register::R12 => &mut self.r12,
            Register::R13 => &mut self.r13,
            Register::R14 => &mut self.r14,
            Register::R15 => &mut self.r15,
            Register::Rip => &mut self.rip,
        };

        *slot = value;
    }
}
