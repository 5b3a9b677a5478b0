use smallvec::SmallVec;
use xcall_arch_x86::{CompletionSignal, ReturnKind, WrapperLayout, wrapper};
use xcall_core::{Bitness, MemoryProtection, Va, XcallCore, XcallDriver, XcallError};

/// Size of the executable block holding the wrapper.
pub(super) const WRAPPER_SIZE: u64 = 0x1000;

/// Size of the return value staging buffer.
pub(super) const STAGING_SIZE: usize = 16;

/// How the wrapper reports completion.
pub(super) enum Completion<Event> {
    /// 64-bit: the wrapper signals `event` through its duplicate `remote`
    /// and suspends the thread whose handle is stored in `mailbox`.
    Event {
        event: Event,
        remote: u64,
        mailbox: Va,
    },

    /// 32-bit: the wrapper sets the byte at this address and spins.
    Flag(Va),
}

/// Per-function resources in the target process, reused across calls.
pub(super) struct Session<Driver>
where
    Driver: XcallDriver,
{
    pub wrapper: Va,
    pub staging: Option<Va>,
    pub completion: Completion<Driver::Event>,
}

/// Resources acquired while a session is being built.
#[derive(Default)]
struct Acquired {
    allocations: SmallVec<[Va; 4]>,
    remote_handles: SmallVec<[u64; 1]>,
}

impl<Driver> Session<Driver>
where
    Driver: XcallDriver,
{
    /// Allocates the session resources and writes the wrapper calling
    /// `target`.
    ///
    /// Everything acquired so far is released if any step fails.
    pub fn new(
        core: &XcallCore<Driver>,
        target: Va,
        return_kind: ReturnKind,
    ) -> Result<Self, XcallError> {
        let mut acquired = Acquired::default();

        match Self::build(core, target, return_kind, &mut acquired) {
            Ok(session) => Ok(session),
            Err(err) => {
                for address in acquired.allocations {
                    if let Err(err) = core.free(address) {
                        tracing::warn!(%address, %err, "failed to release session memory");
                    }
                }

                for handle in acquired.remote_handles {
                    if let Err(err) = core.driver().close_remote_handle(handle) {
                        tracing::warn!(handle, %err, "failed to close remote handle");
                    }
                }

                Err(err)
            }
        }
    }

    fn build(
        core: &XcallCore<Driver>,
        target: Va,
        return_kind: ReturnKind,
        acquired: &mut Acquired,
    ) -> Result<Self, XcallError> {
        let bitness = core.bitness();

        let wrapper = core.allocate(WRAPPER_SIZE, MemoryProtection::RWX)?;
        acquired.allocations.push(wrapper);

        let staging = match return_kind {
            ReturnKind::Void => None,
            _ => {
                let staging = core.allocate(STAGING_SIZE as u64, MemoryProtection::RW)?;
                acquired.allocations.push(staging);
                Some(staging)
            }
        };

        let (completion, signal) = match bitness {
            Bitness::X64 => {
                let set_event = kernel32(core, "SetEvent")?;
                let suspend_thread = kernel32(core, "SuspendThread")?;

                let event = core.driver().create_event()?;
                let remote = core.driver().duplicate_event_handle(&event)?;
                acquired.remote_handles.push(remote);

                let mailbox = core.allocate(8, MemoryProtection::RW)?;
                acquired.allocations.push(mailbox);

                (
                    Completion::Event {
                        event,
                        remote,
                        mailbox,
                    },
                    CompletionSignal::Event {
                        handle: remote,
                        set_event,
                        suspend_thread,
                        thread_mailbox: mailbox,
                    },
                )
            }
            Bitness::X86 => {
                let flag = core.allocate(1, MemoryProtection::RW)?;
                acquired.allocations.push(flag);

                (Completion::Flag(flag), CompletionSignal::Flag(flag))
            }
        };

        let layout = WrapperLayout {
            target,
            return_kind,
            staging: staging.unwrap_or_default(),
            completion: signal,
        };

        let code = wrapper::emit(bitness, &layout, wrapper)?;
        core.write(wrapper, &code)?;

        tracing::debug!(%wrapper, %target, ?return_kind, "session created");

        Ok(Self {
            wrapper,
            staging,
            completion,
        })
    }

    /// Frees every resource of the session.
    ///
    /// All resources are attempted; the first failure is returned.
    pub fn release(self, core: &XcallCore<Driver>) -> Result<(), XcallError> {
        let mut result = Ok(());
        let mut record = |outcome: Result<(), XcallError>| {
            if let Err(err) = outcome {
                tracing::warn!(%err, "failed to release session resource");

                if result.is_ok() {
                    result = Err(err);
                }
            }
        };

        record(core.free(self.wrapper));

        if let Some(staging) = self.staging {
            record(core.free(staging));
        }

        match self.completion {
            Completion::Event {
                event,
                remote,
                mailbox,
            } => {
                record(core.driver().close_remote_handle(remote));
                record(core.free(mailbox));
                drop(event);
            }
            Completion::Flag(flag) => record(core.free(flag)),
        }

        tracing::debug!(wrapper = %self.wrapper, "session released");
        result
    }
}

fn kernel32<Driver>(core: &XcallCore<Driver>, procedure: &'static str) -> Result<Va, XcallError>
where
    Driver: XcallDriver,
{
    core.procedure_address("kernel32", procedure)?
        .ok_or(XcallError::MissingProcedure {
            module: "kernel32",
            procedure,
        })
}
