//! xcall driver for processes on the local Windows machine.
//!
//! The driver opens the target with `OpenProcess` and maps every
//! [`XcallDriver`] primitive to a single Win32 call. 32-bit (WOW64) targets
//! are detected with `IsWow64Process`; their thread contexts go through
//! `Wow64GetThreadContext` / `Wow64SetThreadContext`.
//!
//! The crate is empty unless compiled for 64-bit Windows.

#![cfg(all(windows, target_arch = "x86_64"))]

mod convert;
mod driver;
mod error;
mod handle;

use std::time::Duration;

use xcall_core::{
    MemoryProtection, ModuleInfo, ProcessId, ProcessInfo, Registers, Va, XcallDriver, XcallError,
};

pub use self::{
    error::Error,
    handle::{WindowsEvent, WindowsThread},
};
use self::driver::WindowsDriver;

/// xcall driver for a process on the local Windows machine.
pub struct XcallWindowsDriver {
    inner: WindowsDriver,
}

impl XcallWindowsDriver {
    /// Opens the process with the given identifier.
    pub fn new(pid: ProcessId) -> Result<Self, XcallError> {
        Ok(Self {
            inner: WindowsDriver::new(pid)?,
        })
    }
}

impl XcallDriver for XcallWindowsDriver {
    type Thread = WindowsThread;
    type Event = WindowsEvent;

    fn info(&self) -> Result<ProcessInfo, XcallError> {
        Ok(self.inner.info()?)
    }

    fn has_exited(&self) -> Result<bool, XcallError> {
        Ok(self.inner.has_exited()?)
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, XcallError> {
        Ok(self.inner.modules()?)
    }

    fn allocate(&self, size: u64, protection: MemoryProtection) -> Result<Va, XcallError> {
        Ok(self.inner.allocate(size, protection)?)
    }

    fn free(&self, address: Va) -> Result<(), XcallError> {
        Ok(self.inner.free(address)?)
    }

    fn read(&self, address: Va, buffer: &mut [u8]) -> Result<(), XcallError> {
        Ok(self.inner.read(address, buffer)?)
    }

    fn write(&self, address: Va, buffer: &[u8]) -> Result<(), XcallError> {
        Ok(self.inner.write(address, buffer)?)
    }

    fn protect(
        &self,
        address: Va,
        size: u64,
        protection: MemoryProtection,
    ) -> Result<MemoryProtection, XcallError> {
        Ok(self.inner.protect(address, size, protection)?)
    }

    fn is_accessible(&self, address: Va, size: u64) -> Result<bool, XcallError> {
        Ok(self.inner.is_accessible(address, size)?)
    }

    fn create_thread(&self, start: Va, suspended: bool) -> Result<WindowsThread, XcallError> {
        Ok(self.inner.create_thread(start, suspended)?)
    }

    fn duplicate_thread_handle(&self, thread: &WindowsThread) -> Result<u64, XcallError> {
        Ok(self.inner.duplicate_thread_handle(thread)?)
    }

    fn close_remote_handle(&self, handle: u64) -> Result<(), XcallError> {
        Ok(self.inner.close_remote_handle(handle)?)
    }

    fn is_thread_suspended(&self, thread: &WindowsThread) -> Result<bool, XcallError> {
        Ok(self.inner.is_thread_suspended(thread)?)
    }

    fn suspend_thread(&self, thread: &WindowsThread) -> Result<(), XcallError> {
        Ok(self.inner.suspend_thread(thread)?)
    }

    fn resume_thread(&self, thread: &WindowsThread) -> Result<(), XcallError> {
        Ok(self.inner.resume_thread(thread)?)
    }

    fn terminate_thread(&self, thread: &WindowsThread, exit_code: u32) -> Result<(), XcallError> {
        Ok(self.inner.terminate_thread(thread, exit_code)?)
    }

    fn thread_registers(&self, thread: &WindowsThread) -> Result<Registers, XcallError> {
        Ok(self.inner.thread_registers(thread)?)
    }

    fn set_thread_registers(
        &self,
        thread: &WindowsThread,
        registers: &Registers,
    ) -> Result<(), XcallError> {
        Ok(self.inner.set_thread_registers(thread, registers)?)
    }

    fn create_event(&self) -> Result<WindowsEvent, XcallError> {
        Ok(self.inner.create_event()?)
    }

    fn duplicate_event_handle(&self, event: &WindowsEvent) -> Result<u64, XcallError> {
        Ok(self.inner.duplicate_event_handle(event)?)
    }

    fn signal_event(&self, event: &WindowsEvent) -> Result<(), XcallError> {
        Ok(self.inner.signal_event(event)?)
    }

    fn reset_event(&self, event: &WindowsEvent) -> Result<(), XcallError> {
        Ok(self.inner.reset_event(event)?)
    }

    fn wait_event(
        &self,
        event: &WindowsEvent,
        timeout: Option<Duration>,
    ) -> Result<bool, XcallError> {
        Ok(self.inner.wait_event(event, timeout)?)
    }
}
