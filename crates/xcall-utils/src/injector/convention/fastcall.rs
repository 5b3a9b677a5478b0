use xcall_core::{Register, Va, XcallDriver, XcallError};

use super::{Marshaler, Slot, cdecl};
use crate::injector::{Argument, ThreadContext};

/// Size of the register home area the caller reserves on 64-bit targets.
const SHADOW_SPACE: i64 = 0x20;

/// Sets up a 64-bit call.
///
/// The first four arguments go to `rcx`, `rdx`, `r8` and `r9`, or to
/// `xmm0`-`xmm3` for floating-point values. A structure in one of those
/// positions is copied to the stack and passed by reference. The remaining
/// arguments are pushed right to left, above the shadow space, and the stack
/// is 16-byte aligned at the call.
pub(super) fn set64<Driver>(
    context: &ThreadContext<Driver>,
    marshaler: &mut Marshaler,
    instruction_pointer: Va,
    variadic: bool,
    arguments: &[Argument],
) -> Result<(), XcallError>
where
    Driver: XcallDriver,
{
    let slots = marshaler.marshal_all(context.core(), arguments)?;
    let size = |slot: &Slot| (slot.bytes().len() as u64).next_multiple_of(8);

    context.set_instruction_pointer(instruction_pointer)?;
    context.align_stack_pointer()?;

    let total = slots.iter().map(size).sum::<u64>();
    let reserve = total.saturating_sub(8).next_multiple_of(8);
    context.set_stack_pointer(-(reserve as i64), true)?;

    // Structures in register positions are passed by reference.
    let mut references = [None; 4];
    for (index, slot) in slots.iter().enumerate().take(4) {
        if let Slot::Struct(bytes) = slot {
            references[index] = Some(context.stack_write_bytes(bytes, 0)?);
        }
    }

    // The stack must be 16-byte aligned once the overflow arguments and the
    // shadow space are in place.
    let overflow = slots.iter().skip(4).map(size).sum::<u64>();
    let padding = context.stack_pointer()?.0.wrapping_sub(overflow) % 16;
    context.set_stack_pointer(-(padding as i64), true)?;

    cdecl::push(context, slots.iter().skip(4))?;

    for (index, (argument, slot)) in arguments.iter().zip(&slots).enumerate().take(4) {
        let register = Register::FASTCALL64[index];

        match argument {
            Argument::Float(value) => context.set_vector::<f32>(index, 0, *value)?,
            Argument::Double(value) => context.set_vector::<f64>(index, 0, *value)?,
            _ => {}
        }

        match references[index] {
            Some(reference) => context.set_gpr(register, reference.0)?,
            None if !argument.is_float() || variadic => context.set_gpr(register, slot.value())?,
            None => {}
        }
    }

    context.set_stack_pointer(-SHADOW_SPACE, true)?;

    tracing::trace!(
        arguments = arguments.len(),
        reserve,
        padding,
        "fastcall64 frame prepared"
    );

    Ok(())
}

/// Sets up a 32-bit `fastcall` call.
///
/// Arguments 0 and 1 go to `ecx` and `edx` unless they are floating-point,
/// structures or 64 bits wide, or the call is variadic. Everything else is
/// pushed right to left.
pub(super) fn set32<Driver>(
    context: &ThreadContext<Driver>,
    marshaler: &mut Marshaler,
    instruction_pointer: Va,
    variadic: bool,
    arguments: &[Argument],
) -> Result<(), XcallError>
where
    Driver: XcallDriver,
{
    let slots = marshaler.marshal_all(context.core(), arguments)?;

    context.set_instruction_pointer(instruction_pointer)?;
    context.align_stack_pointer()?;

    let mut stacked = Vec::with_capacity(slots.len());

    for (index, (argument, slot)) in arguments.iter().zip(&slots).enumerate() {
        let in_register = index < Register::FASTCALL32.len()
            && !variadic
            && !argument.is_float()
            && !argument.is_struct()
            && !argument.is_wide();

        if in_register {
            context.set_gpr(Register::FASTCALL32[index], slot.value())?;
        }
        else {
            stacked.push(slot);
        }
    }

    cdecl::push(context, stacked.into_iter())
}
