//! Calling-convention translators.
//!
//! A translator prepares a suspended thread so that resuming it performs a
//! call under a particular ABI: it sets the instruction pointer, copies the
//! arguments onto the stack and into registers, and keeps track of any
//! scratch memory it had to allocate in the target.

mod cdecl;
mod fastcall;
mod thiscall;

use smallvec::SmallVec;
use xcall_core::{Bitness, Va, XcallCore, XcallDriver, XcallError};

use super::{Argument, ThreadContext};

/// A calling convention.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// The platform default: [`StdCall`] on 32-bit targets and
    /// [`FastCall`] on 64-bit targets.
    ///
    /// [`StdCall`]: Self::StdCall
    /// [`FastCall`]: Self::FastCall
    #[default]
    Windows,

    /// Arguments pushed right to left, caller cleans the stack.
    Cdecl,

    /// Arguments pushed right to left, callee cleans the stack.
    StdCall,

    /// `this` in `ecx`, remaining arguments pushed right to left.
    ThisCall,

    /// Register arguments (`ecx`/`edx` on 32-bit, `rcx`/`rdx`/`r8`/`r9` on
    /// 64-bit), the rest on the stack.
    FastCall,

    /// No automatic translation. The caller sets up the thread with a
    /// prefix mutator.
    UserCall,
}

impl CallingConvention {
    /// Resolves the convention that is actually used for `bitness`.
    ///
    /// 64-bit targets have a single convention, so everything except
    /// [`UserCall`](Self::UserCall) becomes [`FastCall`](Self::FastCall).
    pub fn resolve(self, bitness: Bitness) -> Self {
        match (self, bitness) {
            (Self::UserCall, _) => Self::UserCall,
            (_, Bitness::X64) => Self::FastCall,
            (Self::Windows, Bitness::X86) => Self::StdCall,
            (convention, Bitness::X86) => convention,
        }
    }
}

/// Stack and register representation of a marshaled argument.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot {
    /// A scalar occupying one or two pointer-width slots.
    Scalar {
        /// Little-endian bytes, padded to the pointer width.
        bytes: SmallVec<[u8; 8]>,

        /// The value belongs in a vector register.
        float: bool,
    },

    /// A structure copied by value.
    Struct(Vec<u8>),
}

impl Slot {
    /// Returns the scalar value as an integer.
    pub fn value(&self) -> u64 {
        match self {
            Self::Scalar { bytes, .. } => {
                let mut buffer = [0u8; 8];
                buffer[..bytes.len()].copy_from_slice(bytes);
                u64::from_le_bytes(buffer)
            }
            Self::Struct(_) => 0,
        }
    }

    /// Returns the bytes pushed onto the stack for this slot.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Scalar { bytes, .. } => bytes,
            Self::Struct(bytes) => bytes,
        }
    }
}

/// Converts arguments into slots, allocating string arguments in the
/// target.
#[derive(Debug, Default)]
pub(crate) struct Marshaler {
    allocations: SmallVec<[Va; 4]>,
}

impl Marshaler {
    /// Marshals a single argument.
    pub fn marshal<Driver>(
        &mut self,
        core: &XcallCore<Driver>,
        argument: &Argument,
    ) -> Result<Slot, XcallError>
    where
        Driver: XcallDriver,
    {
        let width = core.address_width();

        // Narrow values still take a whole pointer-width slot.
        let scalar = |bytes: &[u8], size: usize, float: bool| Slot::Scalar {
            bytes: SmallVec::from_slice(&bytes[..size.max(width)]),
            float,
        };

        Ok(match argument {
            Argument::Integer { value, size } => {
                scalar(&value.to_le_bytes(), *size as usize, false)
            }
            Argument::Float(value) => scalar(&(value.to_bits() as u64).to_le_bytes(), 4, true),
            Argument::Double(value) => scalar(&value.to_bits().to_le_bytes(), 8, true),
            Argument::Pointer(address) => scalar(&address.0.to_le_bytes(), width, false),
            Argument::Struct(bytes) => Slot::Struct(bytes.clone()),
            Argument::Utf8(value) => {
                let address = core.allocate_string(value)?;
                self.allocations.push(address);
                scalar(&address.0.to_le_bytes(), width, false)
            }
            Argument::Utf16(value) => {
                let address = core.allocate_wstring(value)?;
                self.allocations.push(address);
                scalar(&address.0.to_le_bytes(), width, false)
            }
        })
    }

    /// Marshals a list of arguments.
    pub fn marshal_all<Driver>(
        &mut self,
        core: &XcallCore<Driver>,
        arguments: &[Argument],
    ) -> Result<Vec<Slot>, XcallError>
    where
        Driver: XcallDriver,
    {
        arguments
            .iter()
            .map(|argument| self.marshal(core, argument))
            .collect()
    }

    /// Frees every allocation made while marshaling.
    ///
    /// All allocations are attempted; the first failure is returned.
    pub fn clean<Driver>(&mut self, core: &XcallCore<Driver>) -> Result<(), XcallError>
    where
        Driver: XcallDriver,
    {
        let mut result = Ok(());

        for address in self.allocations.drain(..) {
            if let Err(err) = core.free(address) {
                tracing::warn!(%address, %err, "failed to free argument");

                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    /// Drops the record of allocations without freeing them.
    pub fn forget(&mut self) {
        self.allocations.clear();
    }
}

/// Sets up a thread for a call under a resolved calling convention.
#[derive(Debug)]
pub struct Translator {
    convention: CallingConvention,
    marshaler: Marshaler,
}

impl Translator {
    /// Creates a translator for a convention resolved with
    /// [`CallingConvention::resolve`].
    pub fn new(convention: CallingConvention) -> Self {
        Self {
            convention,
            marshaler: Marshaler::default(),
        }
    }

    /// Returns the convention of this translator.
    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    /// Prepares the thread so that resuming it at `instruction_pointer`
    /// performs the call.
    ///
    /// [`CallingConvention::UserCall`] only sets the instruction pointer.
    pub fn set<Driver>(
        &mut self,
        context: &ThreadContext<Driver>,
        instruction_pointer: Va,
        variadic: bool,
        arguments: &[Argument],
    ) -> Result<(), XcallError>
    where
        Driver: XcallDriver,
    {
        let marshaler = &mut self.marshaler;

        match (self.convention, context.core().bitness()) {
            (CallingConvention::UserCall, _) => {
                context.set_instruction_pointer(instruction_pointer)
            }
            (_, Bitness::X64) => {
                fastcall::set64(context, marshaler, instruction_pointer, variadic, arguments)
            }
            (CallingConvention::FastCall, Bitness::X86) => {
                fastcall::set32(context, marshaler, instruction_pointer, variadic, arguments)
            }
            (CallingConvention::ThisCall, Bitness::X86) => {
                thiscall::set32(context, marshaler, instruction_pointer, arguments)
            }
            (_, Bitness::X86) => cdecl::set(context, marshaler, instruction_pointer, arguments),
        }
    }

    /// Frees the scratch memory allocated by the last [`set`](Self::set).
    pub fn clean<Driver>(&mut self, core: &XcallCore<Driver>) -> Result<(), XcallError>
    where
        Driver: XcallDriver,
    {
        self.marshaler.clean(core)
    }

    /// Forgets the scratch memory without freeing it, for when the target
    /// process is gone.
    pub fn forget(&mut self) {
        self.marshaler.forget();
    }
}
