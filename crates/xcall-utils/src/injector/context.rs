use xcall_core::{Bitness, Register, Registers, Va, XcallCore, XcallDriver, XcallError};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// A value that can be stored in a lane of a 128-bit vector register.
pub trait VectorElement: Copy {
    /// Number of lanes of this type in a 128-bit register.
    const LANES: usize;

    /// Extracts the value from `lane` of `register`.
    fn extract(register: u128, lane: usize) -> Self;

    /// Replaces `lane` of `register` with the value.
    fn insert(self, register: u128, lane: usize) -> u128;
}

impl VectorElement for f32 {
    const LANES: usize = 4;

    fn extract(register: u128, lane: usize) -> Self {
        f32::from_bits((register >> (lane * 32)) as u32)
    }

    fn insert(self, register: u128, lane: usize) -> u128 {
        let shift = lane * 32;
        (register & !(0xffff_ffffu128 << shift)) | ((self.to_bits() as u128) << shift)
    }
}

impl VectorElement for f64 {
    const LANES: usize = 2;

    fn extract(register: u128, lane: usize) -> Self {
        f64::from_bits((register >> (lane * 64)) as u64)
    }

    fn insert(self, register: u128, lane: usize) -> u128 {
        let shift = lane * 64;
        (register & !((u64::MAX as u128) << shift)) | ((self.to_bits() as u128) << shift)
    }
}

impl VectorElement for u128 {
    const LANES: usize = 1;

    fn extract(register: u128, _lane: usize) -> Self {
        register
    }

    fn insert(self, _register: u128, _lane: usize) -> u128 {
        self
    }
}

/// Register and stack access for a suspended thread of the target process.
///
/// Every accessor verifies that the thread is suspended and fetches a fresh
/// copy of the thread context; writes are a read-modify-write round trip.
/// On 32-bit targets `R8`-`R15` and `xmm8`-`xmm15` are rejected and
/// general-purpose values are truncated to 32 bits.
pub struct ThreadContext<'a, Driver>
where
    Driver: XcallDriver,
{
    core: &'a XcallCore<Driver>,
    thread: &'a Driver::Thread,
}

impl<'a, Driver> ThreadContext<'a, Driver>
where
    Driver: XcallDriver,
{
    /// Creates a context for the given thread.
    pub fn new(core: &'a XcallCore<Driver>, thread: &'a Driver::Thread) -> Self {
        Self { core, thread }
    }

    /// Returns the core this context operates on.
    pub fn core(&self) -> &'a XcallCore<Driver> {
        self.core
    }

    /// Returns the thread this context operates on.
    pub fn thread(&self) -> &'a Driver::Thread {
        self.thread
    }

    fn bitness(&self) -> Bitness {
        self.core.bitness()
    }

    fn registers(&self) -> Result<Registers, XcallError> {
        if !self.core.driver().is_thread_suspended(self.thread)? {
            return Err(XcallError::ThreadNotSuspended);
        }

        self.core.driver().thread_registers(self.thread)
    }

    fn set_registers(&self, registers: &Registers) -> Result<(), XcallError> {
        if !self.core.driver().is_thread_suspended(self.thread)? {
            return Err(XcallError::ThreadNotSuspended);
        }

        self.core.driver().set_thread_registers(self.thread, registers)
    }

    fn check_register(&self, register: Register) -> Result<(), XcallError> {
        if !self.bitness().is_64bit() && register.is_extended() {
            return Err(XcallError::InvalidRegister(register));
        }

        Ok(())
    }

    fn check_vector(&self, index: usize) -> Result<(), XcallError> {
        let count = match self.bitness() {
            Bitness::X86 => 8,
            Bitness::X64 => 16,
        };

        if index >= count {
            return Err(XcallError::InvalidVectorRegister(index));
        }

        Ok(())
    }

    fn mask(&self, value: u64) -> u64 {
        match self.bitness() {
            Bitness::X86 => value & 0xffff_ffff,
            Bitness::X64 => value,
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // General-purpose registers
    ///////////////////////////////////////////////////////////////////////////

    /// Returns the value of a general-purpose register.
    pub fn gpr(&self, register: Register) -> Result<u64, XcallError> {
        self.check_register(register)?;
        Ok(self.mask(self.registers()?.gpr(register)))
    }

    /// Returns the low `width` bytes of a register, or, with `dereference`,
    /// `width` bytes read from the address the register holds.
    pub fn gpr_value(
        &self,
        register: Register,
        width: usize,
        dereference: bool,
    ) -> Result<u64, XcallError> {
        let value = self.gpr(register)?;

        if dereference {
            return self.core.read_uint(Va(value), width);
        }

        match width {
            1 => Ok(value & 0xff),
            2 => Ok(value & 0xffff),
            4 => Ok(value & 0xffff_ffff),
            8 => Ok(value),
            _ => Err(XcallError::InvalidAddressWidth),
        }
    }

    /// Sets the value of a general-purpose register.
    pub fn set_gpr(&self, register: Register, value: u64) -> Result<(), XcallError> {
        self.check_register(register)?;

        let value = self.mask(value);
        let mut registers = self.registers()?;
        registers.set_gpr(register, value);
        self.set_registers(&registers)?;

        tracing::trace!(?register, value = %Va(value), "register set");
        Ok(())
    }

    /// Sets the instruction pointer.
    pub fn set_instruction_pointer(&self, address: Va) -> Result<(), XcallError> {
        self.set_gpr(Register::Rip, address.0)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Vector registers
    ///////////////////////////////////////////////////////////////////////////

    /// Reads a lane of a vector register.
    pub fn vector<T>(&self, index: usize, lane: usize) -> Result<T, XcallError>
    where
        T: VectorElement,
    {
        self.check_vector(index)?;

        if lane >= T::LANES {
            return Err(XcallError::InvalidLane {
                lane,
                lanes: T::LANES,
            });
        }

        Ok(T::extract(self.registers()?.xmm[index], lane))
    }

    /// Writes a lane of a vector register, leaving the other lanes intact.
    pub fn set_vector<T>(&self, index: usize, lane: usize, value: T) -> Result<(), XcallError>
    where
        T: VectorElement,
    {
        self.check_vector(index)?;

        if lane >= T::LANES {
            return Err(XcallError::InvalidLane {
                lane,
                lanes: T::LANES,
            });
        }

        let mut registers = self.registers()?;
        registers.xmm[index] = value.insert(registers.xmm[index], lane);
        self.set_registers(&registers)?;

        tracing::trace!(index, lane, "vector register set");
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////
    // Stack
    ///////////////////////////////////////////////////////////////////////////

    /// Returns the stack pointer.
    pub fn stack_pointer(&self) -> Result<Va, XcallError> {
        Ok(Va(self.gpr(Register::Rsp)?))
    }

    /// Sets the stack pointer to `offset`, or moves it by `offset` when
    /// `additive` is set.
    pub fn set_stack_pointer(&self, offset: i64, additive: bool) -> Result<Va, XcallError> {
        let stack_pointer = if additive {
            self.stack_pointer()?.wrapping_offset(offset)
        }
        else {
            Va(offset as u64)
        };

        self.set_gpr(Register::Rsp, stack_pointer.0)?;
        Ok(stack_pointer)
    }

    /// Aligns the stack pointer down to the call-site alignment of the
    /// target (16 bytes on 64-bit, 4 bytes on 32-bit).
    pub fn align_stack_pointer(&self) -> Result<Va, XcallError> {
        let stack_pointer = self
            .stack_pointer()?
            .align_down(self.bitness().stack_alignment());

        self.set_gpr(Register::Rsp, stack_pointer.0)?;
        Ok(stack_pointer)
    }

    /// Reads `length` bytes at `stack pointer + offset`.
    pub fn stack_read_bytes(&self, length: usize, offset: i64) -> Result<Vec<u8>, XcallError> {
        let address = self.stack_pointer()?.wrapping_offset(offset);
        self.core.read_bytes(address, length)
    }

    /// Reads a value at `stack pointer + offset`.
    pub fn stack_read<T>(&self, offset: i64) -> Result<T, XcallError>
    where
        T: FromBytes + IntoBytes,
    {
        let address = self.stack_pointer()?.wrapping_offset(offset);
        self.core.read_struct(address)
    }

    /// Pushes bytes onto the stack.
    ///
    /// The stack pointer moves down by the length of `data` rounded up to
    /// the pointer width, plus `offset`. The data is written at the new top
    /// of the stack, which is returned.
    pub fn stack_write_bytes(&self, data: &[u8], offset: u64) -> Result<Va, XcallError> {
        let width = self.core.address_width() as u64;
        let size = (data.len() as u64).next_multiple_of(width) + offset;

        let stack_pointer = self.stack_pointer()? - size;
        self.core.write(stack_pointer, data)?;
        self.set_gpr(Register::Rsp, stack_pointer.0)?;

        tracing::trace!(%stack_pointer, length = data.len(), "stack write");
        Ok(stack_pointer)
    }

    /// Pushes a value onto the stack.
    ///
    /// See [`stack_write_bytes`](Self::stack_write_bytes).
    pub fn stack_write<T>(&self, value: T, offset: u64) -> Result<Va, XcallError>
    where
        T: IntoBytes + Immutable,
    {
        self.stack_write_bytes(value.as_bytes(), offset)
    }
}
