use std::{ffi::c_void, ptr, time::Duration};

use windows::{
    Win32::{
        Foundation::{
            BOOL, DUPLICATE_CLOSE_SOURCE, DUPLICATE_SAME_ACCESS, DuplicateHandle, HANDLE, HMODULE,
            WAIT_OBJECT_0, WAIT_TIMEOUT,
        },
        System::{
            Diagnostics::Debug::{
                CONTEXT, CONTEXT_FULL_AMD64, GetThreadContext, ReadProcessMemory,
                SetThreadContext, WOW64_CONTEXT, WOW64_CONTEXT_EXTENDED_REGISTERS,
                WOW64_CONTEXT_FULL, Wow64GetThreadContext, Wow64SetThreadContext,
                WriteProcessMemory,
            },
            Memory::{
                MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_GUARD,
                PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, VirtualAllocEx, VirtualFreeEx,
                VirtualProtectEx, VirtualQueryEx,
            },
            ProcessStatus::{
                EnumProcessModulesEx, GetModuleBaseNameW, GetModuleInformation, LIST_MODULES_32BIT,
                LIST_MODULES_64BIT, MODULEINFO,
            },
            Threading::{
                CREATE_SUSPENDED, CreateEventW, CreateRemoteThread, GetCurrentProcess, INFINITE,
                IsWow64Process, OpenProcess, PROCESS_ACCESS_RIGHTS, PROCESS_CREATE_THREAD,
                PROCESS_DUP_HANDLE, PROCESS_QUERY_INFORMATION, PROCESS_SYNCHRONIZE,
                PROCESS_VM_OPERATION, PROCESS_VM_READ, PROCESS_VM_WRITE, ResetEvent, ResumeThread,
                SetEvent, SuspendThread, TerminateThread, WaitForSingleObject,
            },
        },
    },
    core::PCWSTR,
};
use xcall_core::{Bitness, MemoryProtection, ModuleInfo, ProcessId, ProcessInfo, Registers, Va};

use crate::{
    Error,
    convert::{IntoExt as _, apply_context, apply_wow64_context},
    error::Win32ResultExt as _,
    handle::{OwnedHandle, WindowsEvent, WindowsThread},
};

/// Initial capacity of the module handle buffer.
const INITIAL_MODULE_CAPACITY: usize = 256;

/// Access the driver needs on the target process.
const PROCESS_ACCESS: PROCESS_ACCESS_RIGHTS = PROCESS_ACCESS_RIGHTS(
    PROCESS_CREATE_THREAD.0
        | PROCESS_DUP_HANDLE.0
        | PROCESS_QUERY_INFORMATION.0
        | PROCESS_SYNCHRONIZE.0
        | PROCESS_VM_OPERATION.0
        | PROCESS_VM_READ.0
        | PROCESS_VM_WRITE.0,
);

/// Driver for a process on the local machine.
pub struct WindowsDriver {
    process: OwnedHandle,
    pid: ProcessId,
    bitness: Bitness,
}

impl WindowsDriver {
    pub fn new(pid: ProcessId) -> Result<Self, Error> {
        let process = unsafe { OpenProcess(PROCESS_ACCESS, false, pid.0) }.win32("OpenProcess")?;
        let process = OwnedHandle::new(process);

        let mut wow64 = BOOL::default();
        unsafe { IsWow64Process(process.raw(), &mut wow64) }.win32("IsWow64Process")?;

        let bitness = if wow64.as_bool() {
            Bitness::X86
        }
        else {
            Bitness::X64
        };

        tracing::debug!(%pid, ?bitness, "process opened");

        Ok(Self {
            process,
            pid,
            bitness,
        })
    }

    fn handle(&self) -> HANDLE {
        self.process.raw()
    }

    pub fn info(&self) -> Result<ProcessInfo, Error> {
        let main_module = self
            .modules()?
            .into_iter()
            .next()
            .ok_or(Error::NoModules)?;

        Ok(ProcessInfo {
            pid: self.pid,
            bitness: self.bitness,
            main_module,
        })
    }

    pub fn has_exited(&self) -> Result<bool, Error> {
        Ok(unsafe { WaitForSingleObject(self.handle(), 0) } == WAIT_OBJECT_0)
    }

    pub fn modules(&self) -> Result<Vec<ModuleInfo>, Error> {
        let filter = match self.bitness {
            Bitness::X86 => LIST_MODULES_32BIT,
            Bitness::X64 => LIST_MODULES_64BIT,
        };

        let mut handles = vec![HMODULE::default(); INITIAL_MODULE_CAPACITY];

        loop {
            let mut needed = 0u32;

            unsafe {
                EnumProcessModulesEx(
                    self.handle(),
                    handles.as_mut_ptr(),
                    (handles.len() * size_of::<HMODULE>()) as u32,
                    &mut needed,
                    filter,
                )
            }
            .win32("EnumProcessModulesEx")?;

            let count = needed as usize / size_of::<HMODULE>();
            if count <= handles.len() {
                handles.truncate(count);
                break;
            }

            handles.resize(count, HMODULE::default());
        }

        handles
            .into_iter()
            .map(|module| self.module_info(module))
            .collect()
    }

    fn module_info(&self, module: HMODULE) -> Result<ModuleInfo, Error> {
        let mut name = [0u16; 260];
        let length = unsafe { GetModuleBaseNameW(self.handle(), module, &mut name) } as usize;
        if length == 0 {
            return Err(Error::last("GetModuleBaseNameW"));
        }

        let mut info = MODULEINFO::default();
        unsafe {
            GetModuleInformation(
                self.handle(),
                module,
                &mut info,
                size_of::<MODULEINFO>() as u32,
            )
        }
        .win32("GetModuleInformation")?;

        Ok(ModuleInfo {
            name: String::from_utf16_lossy(&name[..length]),
            base: Va(info.lpBaseOfDll as u64),
            size: info.SizeOfImage as u64,
        })
    }

    ///////////////////////////////////////////////////////////////////////////
    // Memory
    ///////////////////////////////////////////////////////////////////////////

    pub fn allocate(&self, size: u64, protection: MemoryProtection) -> Result<Va, Error> {
        let address = unsafe {
            VirtualAllocEx(
                self.handle(),
                None,
                size as usize,
                MEM_COMMIT | MEM_RESERVE,
                protection.into_ext(),
            )
        };

        if address.is_null() {
            return Err(Error::last("VirtualAllocEx"));
        }

        Ok(Va(address as u64))
    }

    pub fn free(&self, address: Va) -> Result<(), Error> {
        unsafe { VirtualFreeEx(self.handle(), address.0 as *mut c_void, 0, MEM_RELEASE) }
            .win32("VirtualFreeEx")
    }

    pub fn read(&self, address: Va, buffer: &mut [u8]) -> Result<(), Error> {
        unsafe {
            ReadProcessMemory(
                self.handle(),
                address.0 as *const c_void,
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                None,
            )
        }
        .win32("ReadProcessMemory")
    }

    pub fn write(&self, address: Va, buffer: &[u8]) -> Result<(), Error> {
        unsafe {
            WriteProcessMemory(
                self.handle(),
                address.0 as *const c_void,
                buffer.as_ptr().cast(),
                buffer.len(),
                None,
            )
        }
        .win32("WriteProcessMemory")
    }

    pub fn protect(
        &self,
        address: Va,
        size: u64,
        protection: MemoryProtection,
    ) -> Result<MemoryProtection, Error> {
        let mut previous = PAGE_PROTECTION_FLAGS::default();

        unsafe {
            VirtualProtectEx(
                self.handle(),
                address.0 as *const c_void,
                size as usize,
                protection.into_ext(),
                &mut previous,
            )
        }
        .win32("VirtualProtectEx")?;

        Ok(previous.into_ext())
    }

    pub fn is_accessible(&self, address: Va, size: u64) -> Result<bool, Error> {
        let end = address.0.saturating_add(size.max(1));
        let mut current = address.0;

        while current < end {
            let mut region = MEMORY_BASIC_INFORMATION::default();
            let written = unsafe {
                VirtualQueryEx(
                    self.handle(),
                    Some(current as *const c_void),
                    &mut region,
                    size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };

            if written == 0 {
                return Ok(false);
            }

            let unreadable = region.Protect.0 & (PAGE_GUARD.0 | PAGE_NOACCESS.0) != 0;
            if region.State != MEM_COMMIT || unreadable {
                return Ok(false);
            }

            current = region.BaseAddress as u64 + region.RegionSize as u64;
        }

        Ok(true)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Threads
    ///////////////////////////////////////////////////////////////////////////

    pub fn create_thread(&self, start: Va, suspended: bool) -> Result<WindowsThread, Error> {
        let flags = if suspended { CREATE_SUSPENDED.0 } else { 0 };

        let start = unsafe {
            std::mem::transmute::<usize, unsafe extern "system" fn(*mut c_void) -> u32>(
                start.0 as usize,
            )
        };

        let mut id = 0u32;
        let handle = unsafe {
            CreateRemoteThread(
                self.handle(),
                None,
                0,
                Some(start),
                None,
                flags,
                Some(ptr::addr_of_mut!(id)),
            )
        }
        .win32("CreateRemoteThread")?;

        Ok(WindowsThread {
            handle: OwnedHandle::new(handle),
            id,
        })
    }

    /// Duplicates a local handle into the target process.
    fn duplicate_into_target(&self, handle: HANDLE) -> Result<u64, Error> {
        let mut target = HANDLE::default();

        unsafe {
            DuplicateHandle(
                GetCurrentProcess(),
                handle,
                self.handle(),
                &mut target,
                0,
                false,
                DUPLICATE_SAME_ACCESS,
            )
        }
        .win32("DuplicateHandle")?;

        Ok(target.0 as u64)
    }

    pub fn duplicate_thread_handle(&self, thread: &WindowsThread) -> Result<u64, Error> {
        self.duplicate_into_target(thread.handle.raw())
    }

    pub fn close_remote_handle(&self, handle: u64) -> Result<(), Error> {
        unsafe {
            DuplicateHandle(
                self.handle(),
                HANDLE(handle as *mut c_void),
                HANDLE::default(),
                ptr::null_mut(),
                0,
                false,
                DUPLICATE_CLOSE_SOURCE,
            )
        }
        .win32("DuplicateHandle")
    }

    pub fn is_thread_suspended(&self, thread: &WindowsThread) -> Result<bool, Error> {
        // There is no query for the suspend count; read it from a suspend and resume pair.
        let previous = unsafe { SuspendThread(thread.handle.raw()) };
        if previous == u32::MAX {
            return Err(Error::last("SuspendThread"));
        }

        self.resume_thread(thread)?;
        Ok(previous > 0)
    }

    pub fn suspend_thread(&self, thread: &WindowsThread) -> Result<(), Error> {
        match unsafe { SuspendThread(thread.handle.raw()) } {
            u32::MAX => Err(Error::last("SuspendThread")),
            _ => Ok(()),
        }
    }

    pub fn resume_thread(&self, thread: &WindowsThread) -> Result<(), Error> {
        match unsafe { ResumeThread(thread.handle.raw()) } {
            u32::MAX => Err(Error::last("ResumeThread")),
            _ => Ok(()),
        }
    }

    pub fn terminate_thread(&self, thread: &WindowsThread, exit_code: u32) -> Result<(), Error> {
        unsafe { TerminateThread(thread.handle.raw(), exit_code) }.win32("TerminateThread")
    }

    pub fn thread_registers(&self, thread: &WindowsThread) -> Result<Registers, Error> {
        match self.bitness {
            Bitness::X64 => {
                let context = self.context(thread)?;
                Ok((&context).into_ext())
            }
            Bitness::X86 => {
                let context = self.wow64_context(thread)?;
                Ok((&context).into_ext())
            }
        }
    }

    pub fn set_thread_registers(
        &self,
        thread: &WindowsThread,
        registers: &Registers,
    ) -> Result<(), Error> {
        // Start from the current context so that segment and debug
        // registers are preserved.
        match self.bitness {
            Bitness::X64 => {
                let mut context = self.context(thread)?;
                apply_context(&mut context, registers);

                unsafe { SetThreadContext(thread.handle.raw(), &context) }
                    .win32("SetThreadContext")
            }
            Bitness::X86 => {
                let mut context = self.wow64_context(thread)?;
                apply_wow64_context(&mut context, registers);

                unsafe { Wow64SetThreadContext(thread.handle.raw(), &context) }
                    .win32("Wow64SetThreadContext")
            }
        }
    }

    fn context(&self, thread: &WindowsThread) -> Result<CONTEXT, Error> {
        let mut context = CONTEXT {
            ContextFlags: CONTEXT_FULL_AMD64,
            ..Default::default()
        };

        unsafe { GetThreadContext(thread.handle.raw(), &mut context) }
            .win32("GetThreadContext")?;

        Ok(context)
    }

    fn wow64_context(&self, thread: &WindowsThread) -> Result<WOW64_CONTEXT, Error> {
        let mut context = WOW64_CONTEXT {
            ContextFlags: WOW64_CONTEXT_FULL | WOW64_CONTEXT_EXTENDED_REGISTERS,
            ..Default::default()
        };

        unsafe { Wow64GetThreadContext(thread.handle.raw(), &mut context) }
            .win32("Wow64GetThreadContext")?;

        Ok(context)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Events
    ///////////////////////////////////////////////////////////////////////////

    pub fn create_event(&self) -> Result<WindowsEvent, Error> {
        let handle =
            unsafe { CreateEventW(None, true, false, PCWSTR::null()) }.win32("CreateEventW")?;

        Ok(WindowsEvent {
            handle: OwnedHandle::new(handle),
        })
    }

    pub fn duplicate_event_handle(&self, event: &WindowsEvent) -> Result<u64, Error> {
        self.duplicate_into_target(event.handle.raw())
    }

    pub fn signal_event(&self, event: &WindowsEvent) -> Result<(), Error> {
        unsafe { SetEvent(event.handle.raw()) }.win32("SetEvent")
    }

    pub fn reset_event(&self, event: &WindowsEvent) -> Result<(), Error> {
        unsafe { ResetEvent(event.handle.raw()) }.win32("ResetEvent")
    }

    pub fn wait_event(
        &self,
        event: &WindowsEvent,
        timeout: Option<Duration>,
    ) -> Result<bool, Error> {
        let milliseconds = match timeout {
            Some(timeout) => timeout.as_millis().min(u128::from(INFINITE - 1)) as u32,
            None => INFINITE,
        };

        match unsafe { WaitForSingleObject(event.handle.raw(), milliseconds) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(Error::last("WaitForSingleObject")),
        }
    }
}
