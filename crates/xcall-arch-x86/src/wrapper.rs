//! The stub a remote thread starts in.
//!
//! The wrapper calls the target function, stores its return value into a
//! staging buffer and then tells the controller that the call completed.
//!
//! 64-bit layout:
//!
//! ```text
//! mov rax, target
//! call rax
//! mov rcx, staging
//! mov [rcx], al/ax/eax/rax | movss/movsd [rcx], xmm0
//! mov rcx, event
//! mov rax, SetEvent
//! call rax
//! mov rcx, mailbox
//! mov rcx, [rcx]
//! mov rax, SuspendThread
//! call rax
//! int3
//! ```
//!
//! 32-bit layout:
//!
//! ```text
//! mov eax, target
//! call eax
//! mov ecx, staging
//! mov [ecx], eax (+ mov [ecx+4], edx) | fstp dword/qword [ecx]
//! mov ecx, flag
//! mov byte [ecx], 1
//! spin: nop
//! jmp spin
//! ```

use iced_x86::code_asm::{
    CodeAssembler, al, ax, byte_ptr, dword_ptr, eax, ecx, edx, qword_ptr, rax, rcx, word_ptr, xmm0,
};
use xcall_core::{Bitness, Va, XcallError};

/// How the target function returns its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    /// Nothing is stored.
    Void,

    /// An integer or pointer of the given size in bytes (1, 2, 4 or 8).
    Integer(u8),

    /// A 32-bit float.
    Float,

    /// A 64-bit float.
    Double,
}

impl ReturnKind {
    /// Returns the number of bytes stored into the staging buffer.
    pub const fn size(self) -> usize {
        match self {
            Self::Void => 0,
            Self::Integer(size) => size as usize,
            Self::Float => 4,
            Self::Double => 8,
        }
    }
}

/// How the wrapper reports completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionSignal {
    /// Signal an event and suspend the running thread (64-bit).
    Event {
        /// Event handle valid inside the target process.
        handle: u64,

        /// Address of `SetEvent`.
        set_event: Va,

        /// Address of `SuspendThread`.
        suspend_thread: Va,

        /// Slot holding the target-side handle of the running thread.
        thread_mailbox: Va,
    },

    /// Set a byte flag to one and spin (32-bit).
    Flag(Va),
}

/// Describes a wrapper to emit.
#[derive(Debug, Clone, Copy)]
pub struct WrapperLayout {
    /// Function to call.
    pub target: Va,

    /// How the return value is stored.
    pub return_kind: ReturnKind,

    /// Staging buffer for the return value. Ignored for [`ReturnKind::Void`].
    pub staging: Va,

    /// Completion notification.
    pub completion: CompletionSignal,
}

/// Assembles the wrapper for code placed at `origin`.
///
/// 64-bit wrappers require [`CompletionSignal::Event`], 32-bit wrappers
/// require [`CompletionSignal::Flag`].
pub fn emit(bitness: Bitness, layout: &WrapperLayout, origin: Va) -> Result<Vec<u8>, XcallError> {
    let code = match (bitness, layout.completion) {
        (
            Bitness::X64,
            CompletionSignal::Event {
                handle,
                set_event,
                suspend_thread,
                thread_mailbox,
            },
        ) => emit64(layout, handle, set_event, suspend_thread, thread_mailbox, origin),
        (Bitness::X86, CompletionSignal::Flag(flag)) => emit32(layout, flag, origin),
        _ => {
            return Err(XcallError::Assembler(format!(
                "completion signal {:?} does not match {bitness:?}",
                layout.completion
            )));
        }
    }
    .map_err(|err| XcallError::Assembler(err.to_string()))?;

    tracing::trace!(%origin, length = code.len(), ?bitness, "wrapper emitted");
    Ok(code)
}

fn emit64(
    layout: &WrapperLayout,
    handle: u64,
    set_event: Va,
    suspend_thread: Va,
    thread_mailbox: Va,
    origin: Va,
) -> Result<Vec<u8>, iced_x86::IcedError> {
    let mut a = CodeAssembler::new(64)?;

    a.mov(rax, layout.target.0)?;
    a.call(rax)?;

    if layout.return_kind != ReturnKind::Void {
        a.mov(rcx, layout.staging.0)?;

        match layout.return_kind {
            ReturnKind::Void => {}
            ReturnKind::Integer(1) => a.mov(byte_ptr(rcx), al)?,
            ReturnKind::Integer(2) => a.mov(word_ptr(rcx), ax)?,
            ReturnKind::Integer(4) => a.mov(dword_ptr(rcx), eax)?,
            ReturnKind::Integer(_) => a.mov(qword_ptr(rcx), rax)?,
            ReturnKind::Float => a.movss(dword_ptr(rcx), xmm0)?,
            ReturnKind::Double => a.movsd_2(qword_ptr(rcx), xmm0)?,
        }
    }

    a.mov(rcx, handle)?;
    a.mov(rax, set_event.0)?;
    a.call(rax)?;

    a.mov(rcx, thread_mailbox.0)?;
    a.mov(rcx, qword_ptr(rcx))?;
    a.mov(rax, suspend_thread.0)?;
    a.call(rax)?;

    a.int3()?;

    a.assemble(origin.0)
}

fn emit32(layout: &WrapperLayout, flag: Va, origin: Va) -> Result<Vec<u8>, iced_x86::IcedError> {
    let mut a = CodeAssembler::new(32)?;

    a.mov(eax, layout.target.0 as u32)?;
    a.call(eax)?;

    if layout.return_kind != ReturnKind::Void {
        a.mov(ecx, layout.staging.0 as u32)?;

        // Floating-point values come back in st(0).
        match layout.return_kind {
            ReturnKind::Void => {}
            ReturnKind::Integer(1) => a.mov(byte_ptr(ecx), al)?,
            ReturnKind::Integer(2) => a.mov(word_ptr(ecx), ax)?,
            ReturnKind::Integer(4) => a.mov(dword_ptr(ecx), eax)?,
            ReturnKind::Integer(_) => {
                a.mov(dword_ptr(ecx), eax)?;
                a.mov(dword_ptr(ecx + 4), edx)?;
            }
            ReturnKind::Float => a.fstp(dword_ptr(ecx))?,
            ReturnKind::Double => a.fstp(qword_ptr(ecx))?,
        }
    }

    a.mov(ecx, flag.0 as u32)?;
    a.mov(byte_ptr(ecx), 1u32)?;

    let mut spin = a.create_label();
    a.set_label(&mut spin)?;
    a.nop()?;
    a.jmp(spin)?;

    a.assemble(origin.0)
}
