use xcall_core::{Register, Va, XcallDriver, XcallError};

use super::{Marshaler, Slot, cdecl};
use crate::injector::{Argument, ThreadContext};

/// Sets up a 32-bit `thiscall` call.
///
/// The receiver (argument 0) is passed in `ecx`. A receiver given by value
/// is copied to the stack first and its address is used instead. The
/// remaining arguments follow `cdecl`.
pub(super) fn set32<Driver>(
    context: &ThreadContext<Driver>,
    marshaler: &mut Marshaler,
    instruction_pointer: Va,
    arguments: &[Argument],
) -> Result<(), XcallError>
where
    Driver: XcallDriver,
{
    let (receiver, rest) = match arguments.split_first() {
        Some(split) => split,
        None => {
            return Err(XcallError::ArgumentCount {
                expected: 1,
                actual: 0,
            });
        }
    };

    let receiver = match marshaler.marshal(context.core(), receiver)? {
        Slot::Struct(bytes) => context.stack_write_bytes(&bytes, 0)?,
        slot => Va(slot.value()),
    };

    cdecl::set(context, marshaler, instruction_pointer, rest)?;
    context.set_gpr(Register::Rcx, receiver.0)
}
