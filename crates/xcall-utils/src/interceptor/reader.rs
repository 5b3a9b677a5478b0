//! Readers for branch instructions in the target process.

use xcall_arch_x86::{BranchTarget, JumpKind, MAX_BRANCH_LENGTH, branch};
use xcall_core::{Va, XcallCore, XcallDriver, XcallError};

/// Maximum number of jumps followed by [`read_thunk`].
const MAX_THUNK_DEPTH: usize = 8;

fn read_code<Driver>(core: &XcallCore<Driver>, address: Va) -> Result<Vec<u8>, XcallError>
where
    Driver: XcallDriver,
{
    core.read_bytes(address, MAX_BRANCH_LENGTH)
}

/// Returns the target of a `CALL rel32` at `address`.
pub fn read_call<Driver>(core: &XcallCore<Driver>, address: Va) -> Result<Option<Va>, XcallError>
where
    Driver: XcallDriver,
{
    Ok(branch::call_target(address, &core.read_bytes(address, 5)?))
}

/// Classifies the jump at `address`.
pub fn read_jump_kind<Driver>(core: &XcallCore<Driver>, address: Va) -> Result<JumpKind, XcallError>
where
    Driver: XcallDriver,
{
    Ok(branch::jump_kind(&read_code(core, address)?))
}

/// Returns the target of the jump at `address`.
///
/// Indirect jumps are resolved by reading the pointer they go through.
pub fn read_jump<Driver>(core: &XcallCore<Driver>, address: Va) -> Result<Option<Va>, XcallError>
where
    Driver: XcallDriver,
{
    let code = read_code(core, address)?;

    match branch::jump_target(address, &code, core.bitness().is_64bit()) {
        Some(BranchTarget::Direct(target)) => Ok(Some(target)),
        Some(BranchTarget::Indirect(pointer)) => Ok(Some(core.read_va(pointer)?)),
        None => Ok(None),
    }
}

/// Follows a call into a chain of jump thunks and returns the final target.
///
/// If `address` holds a call, its target is the start of the chain;
/// otherwise the chain starts at `address` itself.
pub fn read_thunk<Driver>(core: &XcallCore<Driver>, address: Va) -> Result<Va, XcallError>
where
    Driver: XcallDriver,
{
    let mut current = read_call(core, address)?.unwrap_or(address);

    for _ in 0..MAX_THUNK_DEPTH {
        match read_jump(core, current)? {
            Some(target) => current = target,
            None => break,
        }
    }

    Ok(current)
}

/// Returns the effective address of a RIP-relative instruction such as
/// `lea rax, [rip+disp32]`.
pub fn read_effective_address<Driver>(
    core: &XcallCore<Driver>,
    address: Va,
) -> Result<Option<Va>, XcallError>
where
    Driver: XcallDriver,
{
    Ok(branch::rip_relative_target(
        address,
        &core.read_bytes(address, 7)?,
    ))
}
