//! An in-memory target process for tests.
//!
//! The mock keeps a memory map, a module list with real PE export tables and
//! a tiny interpreter for the code the engines emit. Functions of the target
//! are Rust closures registered at addresses inside the main module; hooks
//! are recognized by the `[0xcc, id]` marker [`MockToolchain`] assembles.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Duration,
};

use iced_x86::{
    Decoder, DecoderOptions, Instruction, MemorySize, Mnemonic, OpKind, Register as IcedRegister,
};
use xcall_arch_x86::{HookKind, covering_length, decoder, trampoline};
use xcall_core::{
    Assembler, Bitness, DecodedInstruction, Disassembler, MemoryProtection, ModuleInfo, ProcessId,
    ProcessInfo, Register, Registers, Va, XcallDriver, XcallError,
};

const PAGE_SIZE: u64 = 0x1000;
const MAIN_MODULE_SIZE: u64 = 0x10000;
const SYSTEM_MODULE_SIZE: u64 = 0x3000;
const STACK_SIZE: u64 = 0x10000;
const MAX_STEPS: usize = 256;

/// Offset of `SetEvent` inside the mocked `kernel32.dll`.
const SET_EVENT_RVA: u32 = 0x2000;

/// Offset of `SuspendThread` inside the mocked `kernel32.dll`.
const SUSPEND_THREAD_RVA: u32 = 0x2010;

/// What a mocked function returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockValue {
    /// Returned in `rax`, or `edx:eax` on 32-bit targets.
    Int(u64),

    /// Returned in `xmm0`, or `st(0)` on 32-bit targets.
    Float(f32),

    /// Returned in `xmm0`, or `st(0)` on 32-bit targets.
    Double(f64),

    /// Nothing is returned.
    Void,

    /// The process exits inside the call.
    Exit,
}

type Behaviour = Arc<dyn Fn(&mut MockFrame) -> MockValue + Send + Sync>;
type HookBehaviour = Arc<dyn Fn(&mut MockFrame, MockValue) -> MockValue + Send + Sync>;

struct Region {
    data: Vec<u8>,
    protection: MemoryProtection,
    allocated: bool,
}

struct Function {
    original: Vec<u8>,
    behaviour: Behaviour,
}

struct ThreadState {
    registers: Registers,
    st0: f64,
    suspend_count: u32,
    terminated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteHandle {
    Thread(u32),
    Event(u32),
}

enum Step {
    Continue,
    Stop,
}

/// State of the mocked process.
pub struct MockState {
    bitness: Bitness,
    regions: BTreeMap<u64, Region>,
    next_allocation: u64,
    modules: Vec<ModuleInfo>,

    set_event: u64,
    suspend_thread: u64,

    functions: BTreeMap<u64, Function>,
    hooks: HashMap<u8, HookBehaviour>,

    threads: HashMap<u32, ThreadState>,
    next_thread: u32,
    events: HashMap<u32, bool>,
    next_event: u32,
    remote_handles: HashMap<u64, RemoteHandle>,
    next_handle: u64,

    exited: bool,
    protect_denied: bool,
}

///////////////////////////////////////////////////////////////////////////////
// Driver
///////////////////////////////////////////////////////////////////////////////

/// Handle of a mocked thread.
#[derive(Debug)]
pub struct MockThread {
    id: u32,
}

/// Handle of a mocked event.
#[derive(Debug)]
pub struct MockEvent {
    id: u32,
}

/// A mocked target process.
pub struct MockDriver {
    state: Mutex<MockState>,
    condvar: Condvar,
}

impl MockDriver {
    /// Creates a process with a main module and `kernel32.dll` exporting
    /// `SetEvent` and `SuspendThread`.
    pub fn new(bitness: Bitness) -> Self {
        let (main_base, kernel32_base, kernelbase_base, heap) = match bitness {
            Bitness::X64 => (
                0x1_4000_0000,
                0x7ff8_0000_0000,
                0x7ff9_0000_0000,
                0x10_0000_0000,
            ),
            Bitness::X86 => (0x40_0000, 0x7700_0000, 0x7600_0000, 0x1000_0000),
        };

        let mut state = MockState {
            bitness,
            regions: BTreeMap::new(),
            next_allocation: heap,
            modules: Vec::new(),
            set_event: kernel32_base + SET_EVENT_RVA as u64,
            suspend_thread: kernel32_base + SUSPEND_THREAD_RVA as u64,
            functions: BTreeMap::new(),
            hooks: HashMap::new(),
            threads: HashMap::new(),
            next_thread: 1,
            events: HashMap::new(),
            next_event: 1,
            remote_handles: HashMap::new(),
            next_handle: 0x100,
            exited: false,
            protect_denied: false,
        };

        state.map_module(
            "target.exe",
            main_base,
            vec![0; MAIN_MODULE_SIZE as usize],
        );

        state.map_module(
            "kernel32.dll",
            kernel32_base,
            build_image(
                bitness,
                "kernel32.dll",
                &[
                    ("SetEvent", MockExport::Code(SET_EVENT_RVA)),
                    ("SuspendThread", MockExport::Code(SUSPEND_THREAD_RVA)),
                    ("Forwarded", MockExport::Forward("KERNELBASE.RealProc")),
                ],
            ),
        );

        state.map_module(
            "KERNELBASE.dll",
            kernelbase_base,
            build_image(
                bitness,
                "KERNELBASE.dll",
                &[("RealProc", MockExport::Code(0x2000))],
            ),
        );

        Self {
            state: Mutex::new(state),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Places `code` in the main module and binds a behaviour to it.
    ///
    /// Returns the address of the function.
    pub fn add_function(
        &self,
        code: &[u8],
        behaviour: impl Fn(&mut MockFrame) -> MockValue + Send + Sync + 'static,
    ) -> Va {
        let mut state = self.lock();

        let address = state.modules[0].base.0 + 0x1000 + state.functions.len() as u64 * 0x100;
        state.poke(address, code);
        state.functions.insert(
            address,
            Function {
                original: code.to_vec(),
                behaviour: Arc::new(behaviour),
            },
        );

        Va(address)
    }

    /// Binds a behaviour to the hook body assembled with the given id.
    ///
    /// The behaviour receives the value the hooked function produced.
    pub fn on_hook(
        &self,
        id: u8,
        behaviour: impl Fn(&mut MockFrame, MockValue) -> MockValue + Send + Sync + 'static,
    ) {
        self.lock().hooks.insert(id, Arc::new(behaviour));
    }

    /// Writes memory regardless of protection.
    pub fn poke(&self, address: Va, data: &[u8]) {
        self.lock().poke(address.0, data);
    }

    /// Reads memory regardless of protection.
    pub fn peek(&self, address: Va, length: usize) -> Vec<u8> {
        let mut buffer = vec![0; length];
        self.lock()
            .load(address.0, &mut buffer, MemoryProtection::empty())
            .unwrap();
        buffer
    }

    /// Returns the protection of the region containing `address`.
    pub fn protection(&self, address: Va) -> MemoryProtection {
        let state = self.lock();
        let (_, region) = state.region(address.0, 1).unwrap();
        region.protection
    }

    /// Returns the number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.lock()
            .regions
            .values()
            .filter(|region| region.allocated)
            .count()
    }

    /// Returns the number of open handles inside the target.
    pub fn remote_handle_count(&self) -> usize {
        self.lock().remote_handles.len()
    }

    /// Returns the number of threads that were created and not terminated.
    pub fn live_thread_count(&self) -> usize {
        self.lock()
            .threads
            .values()
            .filter(|thread| !thread.terminated)
            .count()
    }

    /// Makes every later protection change fail.
    pub fn deny_protect(&self, denied: bool) {
        self.lock().protect_denied = denied;
    }

    /// Marks the process as exited.
    pub fn exit(&self) {
        self.lock().exited = true;
        self.condvar.notify_all();
    }
}

impl XcallDriver for MockDriver {
    type Thread = MockThread;
    type Event = MockEvent;

    fn info(&self) -> Result<ProcessInfo, XcallError> {
        let state = self.lock();

        Ok(ProcessInfo {
            pid: ProcessId(1234),
            bitness: state.bitness,
            main_module: state.modules[0].clone(),
        })
    }

    fn has_exited(&self) -> Result<bool, XcallError> {
        Ok(self.lock().exited)
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, XcallError> {
        Ok(self.lock().modules.clone())
    }

    fn allocate(&self, size: u64, protection: MemoryProtection) -> Result<Va, XcallError> {
        Ok(Va(self.lock().allocate(size, protection, true)))
    }

    fn free(&self, address: Va) -> Result<(), XcallError> {
        let mut state = self.lock();

        let allocated = state
            .regions
            .get(&address.0)
            .is_some_and(|region| region.allocated);

        if !allocated {
            return Err(XcallError::os("VirtualFreeEx", 87));
        }

        state.regions.remove(&address.0);
        Ok(())
    }

    fn read(&self, address: Va, buffer: &mut [u8]) -> Result<(), XcallError> {
        self.lock().load(address.0, buffer, MemoryProtection::R)
    }

    fn write(&self, address: Va, buffer: &[u8]) -> Result<(), XcallError> {
        self.lock().store(address.0, buffer)
    }

    fn protect(
        &self,
        address: Va,
        size: u64,
        protection: MemoryProtection,
    ) -> Result<MemoryProtection, XcallError> {
        let mut state = self.lock();

        if state.protect_denied {
            return Err(XcallError::os("VirtualProtectEx", 5));
        }

        let base = match state.region(address.0, size) {
            Some((base, _)) => base,
            None => return Err(XcallError::os("VirtualProtectEx", 487)),
        };

        let region = state
            .regions
            .get_mut(&base)
            .ok_or(XcallError::os("VirtualProtectEx", 487))?;

        Ok(std::mem::replace(&mut region.protection, protection))
    }

    fn is_accessible(&self, address: Va, size: u64) -> Result<bool, XcallError> {
        Ok(self
            .lock()
            .region(address.0, size)
            .is_some_and(|(_, region)| region.protection.contains(MemoryProtection::R)))
    }

    fn create_thread(&self, start: Va, suspended: bool) -> Result<Self::Thread, XcallError> {
        let mut state = self.lock();

        let stack = state.allocate(STACK_SIZE, MemoryProtection::RW, false);

        let id = state.next_thread;
        state.next_thread += 1;

        let registers = Registers {
            rip: start.0,
            rsp: stack + STACK_SIZE - 0x28,
            ..Default::default()
        };

        state.threads.insert(
            id,
            ThreadState {
                registers,
                st0: 0.0,
                suspend_count: 1,
                terminated: false,
            },
        );

        if !suspended {
            state.resume(id);
            drop(state);
            self.condvar.notify_all();
        }

        Ok(MockThread { id })
    }

    fn duplicate_thread_handle(&self, thread: &Self::Thread) -> Result<u64, XcallError> {
        Ok(self.lock().open_handle(RemoteHandle::Thread(thread.id)))
    }

    fn close_remote_handle(&self, handle: u64) -> Result<(), XcallError> {
        self.lock()
            .remote_handles
            .remove(&handle)
            .map(|_| ())
            .ok_or(XcallError::os("DuplicateHandle", 6))
    }

    fn is_thread_suspended(&self, thread: &Self::Thread) -> Result<bool, XcallError> {
        Ok(self.lock().thread(thread.id).suspend_count > 0)
    }

    fn suspend_thread(&self, thread: &Self::Thread) -> Result<(), XcallError> {
        self.lock().thread_mut(thread.id).suspend_count += 1;
        Ok(())
    }

    fn resume_thread(&self, thread: &Self::Thread) -> Result<(), XcallError> {
        self.lock().resume(thread.id);
        self.condvar.notify_all();
        Ok(())
    }

    fn terminate_thread(&self, thread: &Self::Thread, _exit_code: u32) -> Result<(), XcallError> {
        self.lock().thread_mut(thread.id).terminated = true;
        Ok(())
    }

    fn thread_registers(&self, thread: &Self::Thread) -> Result<Registers, XcallError> {
        Ok(self.lock().thread(thread.id).registers)
    }

    fn set_thread_registers(
        &self,
        thread: &Self::Thread,
        registers: &Registers,
    ) -> Result<(), XcallError> {
        self.lock().thread_mut(thread.id).registers = *registers;
        Ok(())
    }

    fn create_event(&self) -> Result<Self::Event, XcallError> {
        let mut state = self.lock();

        let id = state.next_event;
        state.next_event += 1;
        state.events.insert(id, false);

        Ok(MockEvent { id })
    }

    fn duplicate_event_handle(&self, event: &Self::Event) -> Result<u64, XcallError> {
        Ok(self.lock().open_handle(RemoteHandle::Event(event.id)))
    }

    fn signal_event(&self, event: &Self::Event) -> Result<(), XcallError> {
        self.lock().events.insert(event.id, true);
        self.condvar.notify_all();
        Ok(())
    }

    fn reset_event(&self, event: &Self::Event) -> Result<(), XcallError> {
        self.lock().events.insert(event.id, false);
        Ok(())
    }

    fn wait_event(
        &self,
        event: &Self::Event,
        timeout: Option<Duration>,
    ) -> Result<bool, XcallError> {
        let mut state = self.lock();

        loop {
            if state.events.get(&event.id).copied().unwrap_or(false) {
                return Ok(true);
            }

            match timeout {
                Some(timeout) => {
                    let (next, result) = self.condvar.wait_timeout(state, timeout).unwrap();
                    state = next;

                    if result.timed_out() {
                        return Ok(state.events.get(&event.id).copied().unwrap_or(false));
                    }
                }
                None => state = self.condvar.wait(state).unwrap(),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Memory
///////////////////////////////////////////////////////////////////////////////

impl MockState {
    fn width(&self) -> u64 {
        self.bitness.address_width() as u64
    }

    fn map_module(&mut self, name: &str, base: u64, image: Vec<u8>) {
        self.modules.push(ModuleInfo {
            name: name.into(),
            base: Va(base),
            size: image.len() as u64,
        });

        self.regions.insert(
            base,
            Region {
                data: image,
                protection: MemoryProtection::RX,
                allocated: false,
            },
        );
    }

    fn allocate(&mut self, size: u64, protection: MemoryProtection, allocated: bool) -> u64 {
        let size = size.max(1).next_multiple_of(PAGE_SIZE);
        let address = self.next_allocation;
        self.next_allocation += size + PAGE_SIZE;

        self.regions.insert(
            address,
            Region {
                data: vec![0; size as usize],
                protection,
                allocated,
            },
        );

        address
    }

    fn region(&self, address: u64, size: u64) -> Option<(u64, &Region)> {
        let (&base, region) = self.regions.range(..=address).next_back()?;
        let end = base + region.data.len() as u64;
        (address.checked_add(size)? <= end).then_some((base, region))
    }

    fn load(
        &self,
        address: u64,
        buffer: &mut [u8],
        required: MemoryProtection,
    ) -> Result<(), XcallError> {
        match self.region(address, buffer.len() as u64) {
            Some((base, region)) if region.protection.contains(required) => {
                let offset = (address - base) as usize;
                buffer.copy_from_slice(&region.data[offset..offset + buffer.len()]);
                Ok(())
            }
            _ => Err(XcallError::os("ReadProcessMemory", 299)),
        }
    }

    fn store(&mut self, address: u64, data: &[u8]) -> Result<(), XcallError> {
        let base = match self.region(address, data.len() as u64) {
            Some((base, region)) if region.protection.contains(MemoryProtection::W) => base,
            _ => return Err(XcallError::os("WriteProcessMemory", 998)),
        };

        let region = self
            .regions
            .get_mut(&base)
            .ok_or(XcallError::os("WriteProcessMemory", 998))?;

        let offset = (address - base) as usize;
        region.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn poke(&mut self, address: u64, data: &[u8]) {
        let (base, _) = self
            .region(address, data.len() as u64)
            .unwrap_or_else(|| panic!("no region at {address:#x}"));

        let region = self.regions.get_mut(&base).unwrap();
        let offset = (address - base) as usize;
        region.data[offset..offset + data.len()].copy_from_slice(data);
    }

    fn peek(&self, address: u64, length: usize) -> Vec<u8> {
        let mut buffer = vec![0; length];
        self.load(address, &mut buffer, MemoryProtection::empty())
            .unwrap_or_else(|_| panic!("cannot read {length} bytes at {address:#x}"));
        buffer
    }

    fn peek_uint(&self, address: u64, size: usize) -> u64 {
        let mut buffer = [0u8; 8];
        buffer[..size].copy_from_slice(&self.peek(address, size));
        u64::from_le_bytes(buffer)
    }
}

///////////////////////////////////////////////////////////////////////////////
// Threads
///////////////////////////////////////////////////////////////////////////////

impl MockState {
    fn open_handle(&mut self, target: RemoteHandle) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 4;
        self.remote_handles.insert(handle, target);
        handle
    }

    fn thread(&self, id: u32) -> &ThreadState {
        self.threads.get(&id).expect("unknown thread")
    }

    fn thread_mut(&mut self, id: u32) -> &mut ThreadState {
        self.threads.get_mut(&id).expect("unknown thread")
    }

    fn resume(&mut self, id: u32) {
        let thread = self.thread_mut(id);
        thread.suspend_count = thread.suspend_count.saturating_sub(1);

        if thread.suspend_count == 0 && !thread.terminated && !self.exited {
            self.run(id);
        }
    }

    /// Runs the thread until it suspends itself, spins, traps or the
    /// process exits.
    fn run(&mut self, id: u32) {
        for _ in 0..MAX_STEPS {
            let ip = self.thread(id).registers.rip;
            let code = self.fetch(ip);

            let instruction =
                Decoder::with_ip(self.bitness.bits(), &code, ip, DecoderOptions::NONE).decode();
            assert!(!instruction.is_invalid(), "invalid instruction at {ip:#x}");

            self.thread_mut(id).registers.rip = instruction.next_ip();

            if let Step::Stop = self.step(id, &instruction) {
                return;
            }
        }

        panic!("thread {id} did not stop");
    }

    fn fetch(&self, address: u64) -> Vec<u8> {
        let (base, region) = self
            .region(address, 1)
            .unwrap_or_else(|| panic!("execution of unmapped memory at {address:#x}"));

        let offset = (address - base) as usize;
        let end = (offset + 16).min(region.data.len());
        region.data[offset..end].to_vec()
    }

    fn step(&mut self, id: u32, instruction: &Instruction) -> Step {
        match instruction.mnemonic() {
            Mnemonic::Mov => self.mov(id, instruction),
            Mnemonic::Movss | Mnemonic::Movsd => {
                let size = match instruction.mnemonic() {
                    Mnemonic::Movss => 4,
                    _ => 8,
                };

                let address = self.effective_address(id, instruction);
                let value = self.thread(id).registers.xmm[0];
                self.store(address, &value.to_le_bytes()[..size]).unwrap();
            }
            Mnemonic::Fstp => {
                let address = self.effective_address(id, instruction);
                let st0 = self.thread(id).st0;

                let bytes = match instruction.memory_size() {
                    MemorySize::Float32 => (st0 as f32).to_le_bytes().to_vec(),
                    MemorySize::Float64 => st0.to_le_bytes().to_vec(),
                    size => panic!("unsupported fstp size {size:?}"),
                };

                self.store(address, &bytes).unwrap();
            }
            Mnemonic::Call => {
                let (register, _) = gpr(instruction.op0_register());
                let target = self.thread(id).registers.gpr(register);
                return self.call(id, target);
            }
            Mnemonic::Nop => {}
            Mnemonic::Jmp | Mnemonic::Int3 => return Step::Stop,
            mnemonic => panic!("unsupported instruction {mnemonic:?} at {:#x}", instruction.ip()),
        }

        Step::Continue
    }

    fn effective_address(&self, id: u32, instruction: &Instruction) -> u64 {
        let (base, _) = gpr(instruction.memory_base());
        let address = self
            .thread(id)
            .registers
            .gpr(base)
            .wrapping_add(instruction.memory_displacement64());

        match self.bitness {
            Bitness::X86 => address & 0xffff_ffff,
            Bitness::X64 => address,
        }
    }

    fn mov(&mut self, id: u32, instruction: &Instruction) {
        match (instruction.op0_kind(), instruction.op1_kind()) {
            (OpKind::Register, OpKind::Memory) => {
                let (register, size) = gpr(instruction.op0_register());
                let address = self.effective_address(id, instruction);
                let value = self.peek_uint(address, size);
                self.set_register(id, register, size, value);
            }
            (OpKind::Register, OpKind::Register) => {
                let (target, size) = gpr(instruction.op0_register());
                let (source, _) = gpr(instruction.op1_register());
                let value = self.thread(id).registers.gpr(source);
                self.set_register(id, target, size, value);
            }
            (OpKind::Register, _) => {
                let (register, size) = gpr(instruction.op0_register());
                self.set_register(id, register, size, instruction.immediate(1));
            }
            (OpKind::Memory, OpKind::Register) => {
                let (register, size) = gpr(instruction.op1_register());
                let address = self.effective_address(id, instruction);
                let value = self.thread(id).registers.gpr(register);
                self.store(address, &value.to_le_bytes()[..size]).unwrap();
            }
            (OpKind::Memory, _) => {
                let size = match instruction.memory_size() {
                    MemorySize::UInt8 => 1,
                    MemorySize::UInt16 => 2,
                    MemorySize::UInt32 => 4,
                    _ => 8,
                };

                let address = self.effective_address(id, instruction);
                self.store(address, &instruction.immediate(1).to_le_bytes()[..size])
                    .unwrap();
            }
            kinds => panic!("unsupported mov {kinds:?}"),
        }
    }

    fn set_register(&mut self, id: u32, register: Register, size: usize, value: u64) {
        let registers = &mut self.thread_mut(id).registers;

        let value = match size {
            8 => value,
            4 => value & 0xffff_ffff,
            _ => {
                let mask = (1u64 << (size * 8)) - 1;
                (registers.gpr(register) & !mask) | (value & mask)
            }
        };

        registers.set_gpr(register, value);
    }

    fn call(&mut self, id: u32, target: u64) -> Step {
        if target == self.set_event {
            let handle = self.thread(id).registers.rcx;

            match self.remote_handles.get(&handle) {
                Some(RemoteHandle::Event(event)) => {
                    let event = *event;
                    self.events.insert(event, true);
                }
                other => panic!("SetEvent on {other:?}"),
            }

            self.thread_mut(id).registers.rax = 1;
            return Step::Continue;
        }

        if target == self.suspend_thread {
            let handle = self.thread(id).registers.rcx;
            assert_eq!(
                self.remote_handles.get(&handle),
                Some(&RemoteHandle::Thread(id)),
                "SuspendThread on a foreign handle"
            );

            let thread = self.thread_mut(id);
            thread.suspend_count += 1;
            thread.registers.rax = 0;
            return Step::Stop;
        }

        let behaviour = match self.functions.get(&target) {
            Some(function) => Arc::clone(&function.behaviour),
            None => panic!("call to unknown address {target:#x}"),
        };

        let width = self.width();
        let return_address = self.thread(id).registers.rip;
        let stack_pointer = self.thread(id).registers.rsp - width;
        self.store(stack_pointer, &return_address.to_le_bytes()[..width as usize])
            .unwrap();
        self.thread_mut(id).registers.rsp = stack_pointer;

        if self.bitness.is_64bit() {
            assert_eq!(
                (stack_pointer + 8) % 16,
                0,
                "misaligned stack on entry to {target:#x}"
            );
        }

        let hook = self.installed_hook(target);

        let mut frame = MockFrame { state: self, id };
        let mut value = behaviour(&mut frame);

        if let Some(hook) = hook {
            let behaviour = match frame.state.hooks.get(&hook) {
                Some(behaviour) => Arc::clone(behaviour),
                None => panic!("no behaviour for hook {hook}"),
            };

            value = behaviour(&mut frame, value);
        }

        self.thread_mut(id).registers.rsp += width;

        let bitness = self.bitness;
        let thread = self.thread_mut(id);

        match (value, bitness) {
            (MockValue::Int(value), Bitness::X64) => thread.registers.rax = value,
            (MockValue::Int(value), Bitness::X86) => {
                thread.registers.rax = value & 0xffff_ffff;
                thread.registers.rdx = value >> 32;
            }
            (MockValue::Float(value), Bitness::X64) => {
                thread.registers.xmm[0] = value.to_bits() as u128
            }
            (MockValue::Float(value), Bitness::X86) => thread.st0 = value as f64,
            (MockValue::Double(value), Bitness::X64) => {
                thread.registers.xmm[0] = value.to_bits() as u128
            }
            (MockValue::Double(value), Bitness::X86) => thread.st0 = value,
            (MockValue::Void, _) => {}
            (MockValue::Exit, _) => {
                self.exited = true;
                return Step::Stop;
            }
        }

        Step::Continue
    }

    /// Looks for a hook entry inside the function at `entry` and checks that
    /// it was installed consistently.
    ///
    /// Returns the id of the hook body.
    fn installed_hook(&self, entry: u64) -> Option<u8> {
        let original = &self.functions.get(&entry)?.original;
        let current = self.peek(entry, original.len());

        let offset = original
            .iter()
            .zip(&current)
            .position(|(original, current)| original != current)?;

        let at = entry + offset as u64;
        let patched = &current[offset..];

        let (kind, block) = match self.bitness {
            Bitness::X64 => {
                assert_eq!(patched[0], 0xff, "unexpected hook entry at {at:#x}");
                let kind = match patched[1] {
                    0x25 => HookKind::Jump,
                    0x15 => HookKind::Call,
                    other => panic!("unexpected hook entry modrm {other:#x}"),
                };

                let target = u64::from_le_bytes(patched[6..14].try_into().unwrap());
                (kind, target)
            }
            Bitness::X86 => {
                let kind = match patched[0] {
                    0xe9 => HookKind::Jump,
                    0xe8 => HookKind::Call,
                    other => panic!("unexpected hook entry opcode {other:#x}"),
                };

                let displacement = u32::from_le_bytes(patched[1..5].try_into().unwrap());
                let target = (at as u32).wrapping_add(5).wrapping_add(displacement);
                (kind, target as u64)
            }
        };

        let marker = self.peek(block, 2);
        assert_eq!(marker[0], 0xcc, "hook block at {block:#x} has no marker");

        let instructions = decoder::disassemble(self.bitness, &original[offset..], Va(at)).unwrap();
        let entry_length = trampoline::entry_length(self.bitness);
        let consumed = covering_length(&instructions, entry_length).unwrap();

        assert!(
            patched[entry_length..consumed].iter().all(|&byte| byte == 0x90),
            "gap after the hook entry is not filled with nop"
        );
        assert_eq!(
            &patched[consumed..],
            &original[offset + consumed..],
            "code after the hook was modified"
        );

        let trailer = trampoline::trailer(self.bitness, kind, Va(block + 2), Va(at + consumed as u64))
            .unwrap();
        assert_eq!(
            self.peek(block + 2, trailer.len()),
            trailer.as_slice(),
            "hook trailer does not resume after the overwritten code"
        );

        Some(marker[1])
    }
}

fn gpr(register: IcedRegister) -> (Register, usize) {
    match register {
        IcedRegister::RAX => (Register::Rax, 8),
        IcedRegister::EAX => (Register::Rax, 4),
        IcedRegister::AX => (Register::Rax, 2),
        IcedRegister::AL => (Register::Rax, 1),
        IcedRegister::RBX => (Register::Rbx, 8),
        IcedRegister::EBX => (Register::Rbx, 4),
        IcedRegister::RCX => (Register::Rcx, 8),
        IcedRegister::ECX => (Register::Rcx, 4),
        IcedRegister::RDX => (Register::Rdx, 8),
        IcedRegister::EDX => (Register::Rdx, 4),
        IcedRegister::RSI => (Register::Rsi, 8),
        IcedRegister::ESI => (Register::Rsi, 4),
        IcedRegister::RDI => (Register::Rdi, 8),
        IcedRegister::EDI => (Register::Rdi, 4),
        IcedRegister::RSP => (Register::Rsp, 8),
        IcedRegister::ESP => (Register::Rsp, 4),
        IcedRegister::RBP => (Register::Rbp, 8),
        IcedRegister::EBP => (Register::Rbp, 4),
        IcedRegister::R8 => (Register::R8, 8),
        IcedRegister::R9 => (Register::R9, 8),
        register => panic!("unsupported register {register:?}"),
    }
}

///////////////////////////////////////////////////////////////////////////////
// Frame
///////////////////////////////////////////////////////////////////////////////

/// The view a mocked function has of its caller.
///
/// The stack pointer points at the return address.
pub struct MockFrame<'a> {
    state: &'a mut MockState,
    id: u32,
}

impl MockFrame<'_> {
    /// Returns the bitness of the process.
    pub fn bitness(&self) -> Bitness {
        self.state.bitness
    }

    /// Returns a general-purpose register.
    pub fn gpr(&self, register: Register) -> u64 {
        self.state.thread(self.id).registers.gpr(register)
    }

    /// Returns lane 0 of a vector register as `f32`.
    pub fn xmm_f32(&self, index: usize) -> f32 {
        f32::from_bits(self.state.thread(self.id).registers.xmm[index] as u32)
    }

    /// Returns lane 0 of a vector register as `f64`.
    pub fn xmm_f64(&self, index: usize) -> f64 {
        f64::from_bits(self.state.thread(self.id).registers.xmm[index] as u64)
    }

    /// Returns the pointer-sized stack slot of argument `index`.
    pub fn stack(&self, index: u64) -> u64 {
        let width = self.state.width();
        let address = self.gpr(Register::Rsp) + width * (index + 1);
        self.state.peek_uint(address, width as usize)
    }

    /// Reads `length` bytes at `stack pointer + offset`.
    pub fn stack_bytes(&self, offset: u64, length: usize) -> Vec<u8> {
        self.state.peek(self.gpr(Register::Rsp) + offset, length)
    }

    /// Reads memory.
    pub fn read(&self, address: u64, length: usize) -> Vec<u8> {
        self.state.peek(address, length)
    }

    /// Reads a `u32`.
    pub fn read_u32(&self, address: u64) -> u32 {
        self.state.peek_uint(address, 4) as u32
    }

    /// Writes memory regardless of protection.
    pub fn write(&mut self, address: u64, data: &[u8]) {
        self.state.poke(address, data);
    }
}

///////////////////////////////////////////////////////////////////////////////
// Toolchain
///////////////////////////////////////////////////////////////////////////////

/// Assembles each known hook body into `[0xcc, id]`, where `id` is the
/// 1-based position of the source in the list. Disassembly is real.
#[derive(Debug, Clone, Default)]
pub struct MockToolchain {
    bodies: Vec<&'static str>,
}

impl MockToolchain {
    /// Creates a toolchain knowing the given hook bodies.
    pub fn new(bodies: &[&'static str]) -> Self {
        Self {
            bodies: bodies.to_vec(),
        }
    }
}

impl Assembler for MockToolchain {
    fn assemble(&self, _bitness: Bitness, source: &str, _origin: Va) -> Result<Vec<u8>, XcallError> {
        match self.bodies.iter().position(|body| *body == source) {
            Some(index) => Ok(vec![0xcc, index as u8 + 1]),
            None => Err(XcallError::Assembler(format!("unknown body `{source}`"))),
        }
    }
}

impl Disassembler for MockToolchain {
    fn disassemble(
        &self,
        bitness: Bitness,
        code: &[u8],
        origin: Va,
    ) -> Result<Vec<DecodedInstruction>, XcallError> {
        decoder::disassemble(bitness, code, origin)
    }
}

///////////////////////////////////////////////////////////////////////////////
// Images
///////////////////////////////////////////////////////////////////////////////

enum MockExport {
    Code(u32),
    Forward(&'static str),
}

const EXPORT_DIRECTORY_RVA: usize = 0x1000;

fn put(image: &mut [u8], offset: usize, bytes: &[u8]) {
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Builds a header-only PE image with an export directory.
fn build_image(bitness: Bitness, name: &str, exports: &[(&str, MockExport)]) -> Vec<u8> {
    let mut image = vec![0u8; SYSTEM_MODULE_SIZE as usize];

    // DOS header
    put(&mut image, 0, b"MZ");
    put(&mut image, 0x3c, &0x80u32.to_le_bytes());

    // NT headers
    let (machine, magic, optional_size, count_offset) = match bitness {
        Bitness::X64 => (0x8664u16, 0x20bu16, 112usize, 108usize),
        Bitness::X86 => (0x14c, 0x10b, 96, 92),
    };

    put(&mut image, 0x80, b"PE\0\0");

    let file_header = 0x84;
    put(&mut image, file_header, &machine.to_le_bytes());
    put(
        &mut image,
        file_header + 16,
        &((optional_size + 16 * 8) as u16).to_le_bytes(),
    );
    put(&mut image, file_header + 18, &0x2022u16.to_le_bytes());

    let optional_header = file_header + 20;
    put(&mut image, optional_header, &magic.to_le_bytes());
    put(&mut image, optional_header + count_offset, &16u32.to_le_bytes());

    // Export directory
    let count = exports.len();
    let functions = EXPORT_DIRECTORY_RVA + 40;
    let names = functions + 4 * count;
    let ordinals = names + 4 * count;
    let mut cursor = ordinals + 2 * count;

    let mut string = |image: &mut Vec<u8>, value: &str| {
        let rva = cursor;
        put(image, rva, value.as_bytes());
        cursor += value.len() + 1;
        rva as u32
    };

    let module_name = string(&mut image, name);

    for (index, (export, target)) in exports.iter().enumerate() {
        let name = string(&mut image, export);

        let rva = match target {
            MockExport::Code(rva) => *rva,
            MockExport::Forward(target) => string(&mut image, target),
        };

        put(&mut image, functions + 4 * index, &rva.to_le_bytes());
        put(&mut image, names + 4 * index, &name.to_le_bytes());
        put(&mut image, ordinals + 2 * index, &(index as u16).to_le_bytes());
    }

    let directory = EXPORT_DIRECTORY_RVA;
    put(&mut image, directory + 12, &module_name.to_le_bytes());
    put(&mut image, directory + 16, &1u32.to_le_bytes());
    put(&mut image, directory + 20, &(count as u32).to_le_bytes());
    put(&mut image, directory + 24, &(count as u32).to_le_bytes());
    put(&mut image, directory + 28, &(functions as u32).to_le_bytes());
    put(&mut image, directory + 32, &(names as u32).to_le_bytes());
    put(&mut image, directory + 36, &(ordinals as u32).to_le_bytes());

    let size = (cursor - EXPORT_DIRECTORY_RVA) as u32;
    let data_directories = optional_header + optional_size;
    put(
        &mut image,
        data_directories,
        &(EXPORT_DIRECTORY_RVA as u32).to_le_bytes(),
    );
    put(&mut image, data_directories + 4, &size.to_le_bytes());

    image
}
