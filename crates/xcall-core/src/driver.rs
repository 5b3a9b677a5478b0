use std::time::Duration;

use crate::{MemoryProtection, ModuleInfo, ProcessInfo, Registers, Va, XcallError};

/// A trait for implementing access to a target process.
///
/// A driver is bound to exactly one process. Every method maps to a single
/// operating-system primitive; any failure is reported as an error carrying
/// the OS error code and is never retried by the caller.
pub trait XcallDriver {
    /// Handle of a thread created in the target process.
    ///
    /// Dropping the handle releases it.
    type Thread: std::fmt::Debug;

    /// Handle of a manual-reset synchronization event owned by the
    /// controller.
    ///
    /// Dropping the handle releases it.
    type Event: std::fmt::Debug;

    /// Retrieves information about the target process.
    fn info(&self) -> Result<ProcessInfo, XcallError>;

    /// Checks whether the target process has exited.
    fn has_exited(&self) -> Result<bool, XcallError>;

    /// Enumerates the modules loaded in the target process.
    fn modules(&self) -> Result<Vec<ModuleInfo>, XcallError>;

    /// Allocates `size` bytes of memory in the target process.
    fn allocate(&self, size: u64, protection: MemoryProtection) -> Result<Va, XcallError>;

    /// Frees memory previously returned by [`allocate`].
    ///
    /// [`allocate`]: Self::allocate
    fn free(&self, address: Va) -> Result<(), XcallError>;

    /// Reads memory of the target process.
    fn read(&self, address: Va, buffer: &mut [u8]) -> Result<(), XcallError>;

    /// Writes memory of the target process.
    fn write(&self, address: Va, buffer: &[u8]) -> Result<(), XcallError>;

    /// Changes the protection of a memory range and returns the previous
    /// protection.
    fn protect(
        &self,
        address: Va,
        size: u64,
        protection: MemoryProtection,
    ) -> Result<MemoryProtection, XcallError>;

    /// Checks whether the whole range is committed and readable.
    fn is_accessible(&self, address: Va, size: u64) -> Result<bool, XcallError>;

    /// Creates a thread starting at `start`.
    fn create_thread(&self, start: Va, suspended: bool) -> Result<Self::Thread, XcallError>;

    /// Duplicates the thread handle into the target process and returns the
    /// handle value as seen by the target.
    fn duplicate_thread_handle(&self, thread: &Self::Thread) -> Result<u64, XcallError>;

    /// Closes a handle that lives in the target process.
    fn close_remote_handle(&self, handle: u64) -> Result<(), XcallError>;

    /// Checks whether the thread is suspended.
    fn is_thread_suspended(&self, thread: &Self::Thread) -> Result<bool, XcallError>;

    /// Increments the suspend count of the thread.
    fn suspend_thread(&self, thread: &Self::Thread) -> Result<(), XcallError>;

    /// Decrements the suspend count of the thread.
    fn resume_thread(&self, thread: &Self::Thread) -> Result<(), XcallError>;

    /// Terminates the thread.
    fn terminate_thread(&self, thread: &Self::Thread, exit_code: u32) -> Result<(), XcallError>;

    /// Retrieves the registers of a suspended thread.
    fn thread_registers(&self, thread: &Self::Thread) -> Result<Registers, XcallError>;

    /// Sets the registers of a suspended thread.
    fn set_thread_registers(
        &self,
        thread: &Self::Thread,
        registers: &Registers,
    ) -> Result<(), XcallError>;

    /// Creates a manual-reset event in the non-signaled state.
    fn create_event(&self) -> Result<Self::Event, XcallError>;

    /// Duplicates the event handle into the target process and returns the
    /// handle value as seen by the target.
    fn duplicate_event_handle(&self, event: &Self::Event) -> Result<u64, XcallError>;

    /// Sets the event to the signaled state.
    fn signal_event(&self, event: &Self::Event) -> Result<(), XcallError>;

    /// Resets the event to the non-signaled state.
    fn reset_event(&self, event: &Self::Event) -> Result<(), XcallError>;

    /// Waits until the event is signaled.
    ///
    /// Returns `false` if the timeout elapsed first. `None` waits forever.
    fn wait_event(&self, event: &Self::Event, timeout: Option<Duration>)
        -> Result<bool, XcallError>;
}
