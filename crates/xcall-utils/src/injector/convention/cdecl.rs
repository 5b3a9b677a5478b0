use xcall_core::{Va, XcallDriver, XcallError};

use super::{Marshaler, Slot};
use crate::injector::{Argument, ThreadContext};

/// Sets up a 32-bit `cdecl` or `stdcall` call.
///
/// Every argument is pushed right to left; structures are copied onto the
/// stack in place.
pub(super) fn set<Driver>(
    context: &ThreadContext<Driver>,
    marshaler: &mut Marshaler,
    instruction_pointer: Va,
    arguments: &[Argument],
) -> Result<(), XcallError>
where
    Driver: XcallDriver,
{
    let slots = marshaler.marshal_all(context.core(), arguments)?;

    context.set_instruction_pointer(instruction_pointer)?;
    context.align_stack_pointer()?;
    push(context, slots.iter())
}

/// Pushes slots right to left.
pub(super) fn push<'s, Driver>(
    context: &ThreadContext<Driver>,
    slots: impl DoubleEndedIterator<Item = &'s Slot>,
) -> Result<(), XcallError>
where
    Driver: XcallDriver,
{
    for slot in slots.rev() {
        context.stack_write_bytes(slot.bytes(), 0)?;
    }

    Ok(())
}
