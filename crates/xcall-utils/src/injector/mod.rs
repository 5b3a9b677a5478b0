//! Remote function invocation.
//!
//! A [`RemoteFunction`] calls a function inside the target process as if it
//! were a local one. Each call:
//!
//! 1. creates a suspended thread at a small wrapper that calls the target,
//!    stores the return value and reports completion
//! 2. lets a [`Translator`] set up registers and stack for the chosen
//!    [`CallingConvention`]
//! 3. resumes the thread and waits for completion or process exit
//! 4. suspends and terminates the thread, frees scratch memory and reads the
//!    return value
//!
//! The wrapper, the staging buffer and the synchronization objects are
//! created on the first call and reused until the function is disposed.
//!
//! # Examples
//!
//! Call `GetTickCount` in the target process:
//!
//! ```no_run
//! use xcall_core::{XcallCore, XcallDriver, XcallError};
//! use xcall_utils::injector::{CallBuilder, CallingConvention, RemoteFunction};
//!
//! fn get_tick_count<Driver>(core: &XcallCore<Driver>) -> Result<u32, XcallError>
//! where
//!     Driver: XcallDriver + Sync,
//!     Driver::Event: Sync,
//! {
//!     let address = core
//!         .procedure_address("kernel32", "GetTickCount")?
//!         .ok_or(XcallError::Other("GetTickCount not found"))?;
//!
//!     let mut function =
//!         RemoteFunction::<_, u32>::new(core, address, CallingConvention::Windows);
//!
//!     function.invoke(CallBuilder::new())
//! }
//! ```

mod argument;
mod call;
mod context;
mod convention;
mod mutator;
mod remote;
mod session;
mod value;


use std::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use xcall_core::{Bitness, Va, XcallCore, XcallDriver, XcallError};

pub use self::{
    argument::{Argument, ArgumentType},
    call::CallBuilder,
    context::{ThreadContext, VectorElement},
    convention::{CallingConvention, Translator},
    mutator::{ContextMutator, Mutators},
    remote::{RemotePointer, RemoteString, StringEncoding},
    value::ReturnValue,
};
use self::session::{Completion, STAGING_SIZE, Session};

/// Default interval between liveness checks while waiting for a call.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How a call ended.
enum Outcome<R> {
    Completed(R),
    Terminated,
}

/// A function in the target process that can be called.
///
/// `R` is the declared return type.
pub struct RemoteFunction<'a, Driver, R = ()>
where
    Driver: XcallDriver,
    R: ReturnValue,
{
    core: &'a XcallCore<Driver>,
    address: Va,
    convention: CallingConvention,
    variadic: bool,
    argument_types: Option<Vec<ArgumentType>>,
    throw_on_process_exit: bool,
    poll_interval: Duration,
    session: Option<Session<Driver>>,
    _marker: PhantomData<fn() -> R>,
}

impl<'a, Driver, R> RemoteFunction<'a, Driver, R>
where
    Driver: XcallDriver,
    R: ReturnValue,
{
    /// Creates a function at `address` called with `convention`.
    ///
    /// The convention is resolved against the bitness of the target; see
    /// [`CallingConvention::resolve`].
    pub fn new(core: &'a XcallCore<Driver>, address: Va, convention: CallingConvention) -> Self {
        Self {
            core,
            address,
            convention: convention.resolve(core.bitness()),
            variadic: false,
            argument_types: None,
            throw_on_process_exit: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            session: None,
            _marker: PhantomData,
        }
    }

    /// Marks the function as variadic.
    pub fn with_variadic(mut self, variadic: bool) -> Self {
        self.variadic = variadic;
        self
    }

    /// Declares the argument types; every call is checked against them.
    pub fn with_argument_types(mut self, types: impl IntoIterator<Item = ArgumentType>) -> Self {
        self.argument_types = Some(types.into_iter().collect());
        self
    }

    /// Sets whether an exit of the target during a call is an error.
    ///
    /// When disabled, such a call returns `R::default()`.
    pub fn with_throw_on_process_exit(mut self, throw_on_process_exit: bool) -> Self {
        self.throw_on_process_exit = throw_on_process_exit;
        self
    }

    /// Sets the interval between liveness checks while waiting for a call.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Returns the address of the function.
    pub fn address(&self) -> Va {
        self.address
    }

    /// Returns the resolved calling convention.
    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    /// Releases the wrapper, the staging buffer and the synchronization
    /// objects.
    ///
    /// The next call creates them again.
    pub fn dispose(&mut self) -> Result<(), XcallError> {
        match self.session.take() {
            Some(session) => session.release(self.core),
            None => Ok(()),
        }
    }

    fn validate(
        &self,
        arguments: &[Argument],
        mutators: &Mutators<Driver>,
    ) -> Result<(), XcallError> {
        if self.convention == CallingConvention::UserCall && !mutators.has_prefix() {
            return Err(XcallError::MissingPrefix);
        }

        for (index, argument) in arguments.iter().enumerate() {
            if let Argument::Integer { size, .. } = argument
                && !matches!(size, 1 | 2 | 4 | 8)
            {
                return Err(XcallError::ArgumentType { index });
            }
        }

        if let Some(types) = &self.argument_types {
            if types.len() != arguments.len() {
                return Err(XcallError::ArgumentCount {
                    expected: types.len(),
                    actual: arguments.len(),
                });
            }

            for (index, (expected, argument)) in types.iter().zip(arguments).enumerate() {
                if argument.kind() != *expected {
                    return Err(XcallError::ArgumentType { index });
                }
            }
        }

        if self.convention == CallingConvention::ThisCall
            && self.core.bitness() == Bitness::X86
            && arguments.is_empty()
        {
            return Err(XcallError::ArgumentCount {
                expected: 1,
                actual: 0,
            });
        }

        Ok(())
    }
}

impl<Driver, R> RemoteFunction<'_, Driver, R>
where
    Driver: XcallDriver + Sync,
    Driver::Event: Sync,
    R: ReturnValue,
{
    /// Calls the function.
    pub fn invoke(&mut self, call: CallBuilder) -> Result<R, XcallError> {
        self.invoke_with(call, Mutators::new())
    }

    /// Calls the function with prefix and postfix mutators.
    pub fn invoke_with(
        &mut self,
        call: CallBuilder,
        mut mutators: Mutators<Driver>,
    ) -> Result<R, XcallError> {
        let arguments = call.arguments;
        self.validate(&arguments, &mutators)?;

        let session = match self.session.take() {
            Some(session) => session,
            None => Session::new(self.core, self.address, R::kind(self.core.bitness()))?,
        };

        match self.execute(&session, &arguments, &mut mutators) {
            Ok(Outcome::Completed(value)) => {
                self.session = Some(session);
                Ok(value)
            }
            Ok(Outcome::Terminated) => {
                // Nothing in the target can be released anymore.
                drop(session);

                tracing::debug!(function = %self.address, "target exited during call");

                if self.throw_on_process_exit {
                    return Err(XcallError::PeerTerminated);
                }

                Ok(R::default())
            }
            Err(err) => {
                self.session = Some(session);
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        session: &Session<Driver>,
        arguments: &[Argument],
        mutators: &mut Mutators<Driver>,
    ) -> Result<Outcome<R>, XcallError> {
        let driver = self.core.driver();

        let thread = driver.create_thread(session.wrapper, true)?;
        tracing::debug!(function = %self.address, ?thread, "thread created");

        let mut translator = Translator::new(self.convention);
        let mut remote_thread = None;

        match self.run(
            session,
            &thread,
            &mut translator,
            &mut remote_thread,
            arguments,
            mutators,
        ) {
            Ok(Outcome::Terminated) => {
                translator.forget();
                Ok(Outcome::Terminated)
            }
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(err) = driver.terminate_thread(&thread, 0) {
                    tracing::warn!(%err, "failed to terminate thread");
                }

                if let Some(handle) = remote_thread
                    && let Err(err) = driver.close_remote_handle(handle)
                {
                    tracing::warn!(%err, "failed to close remote thread handle");
                }

                if let Err(err) = translator.clean(self.core) {
                    tracing::warn!(%err, "failed to clean arguments");
                }

                Err(err)
            }
        }
    }

    fn run(
        &self,
        session: &Session<Driver>,
        thread: &Driver::Thread,
        translator: &mut Translator,
        remote_thread: &mut Option<u64>,
        arguments: &[Argument],
        mutators: &mut Mutators<Driver>,
    ) -> Result<Outcome<R>, XcallError> {
        let core = self.core;
        let driver = core.driver();
        let context = ThreadContext::new(core, thread);

        if let Completion::Event { mailbox, .. } = &session.completion {
            let handle = driver.duplicate_thread_handle(thread)?;
            *remote_thread = Some(handle);
            core.write_address(*mailbox, handle)?;
        }

        translator.set(&context, session.wrapper, self.variadic, arguments)?;

        if let Some(prefix) = &mut mutators.prefix {
            prefix.mutate(&context)?;
        }

        if let Completion::Flag(flag) = session.completion {
            core.write_u8(flag, 0)?;
        }

        driver.resume_thread(thread)?;

        if self.wait(session)? {
            return Ok(Outcome::Terminated);
        }

        driver.suspend_thread(thread)?;

        if let Some(postfix) = &mut mutators.postfix {
            postfix.mutate(&context)?;
        }

        driver.terminate_thread(thread, 0)?;

        if let Some(handle) = remote_thread.take() {
            driver.close_remote_handle(handle)?;
        }

        translator.clean(core)?;

        let value = match session.staging {
            Some(staging) => R::from_le_bytes(&core.read_bytes(staging, STAGING_SIZE)?),
            None => R::from_le_bytes(&[]),
        };

        tracing::debug!(function = %self.address, "call completed");
        Ok(Outcome::Completed(value))
    }

    /// Waits until the wrapper reports completion or the target exits.
    ///
    /// Returns `true` if the target exited.
    fn wait(&self, session: &Session<Driver>) -> Result<bool, XcallError> {
        let core = self.core;
        let driver = core.driver();
        let poll_interval = self.poll_interval;

        match &session.completion {
            Completion::Event { event, .. } => {
                let done = AtomicBool::new(false);

                std::thread::scope(|scope| {
                    // Wakes the waiter if the target exits before the
                    // wrapper signals.
                    let watchdog = scope.spawn(|| -> Result<(), XcallError> {
                        while !done.load(Ordering::Acquire) {
                            if driver.has_exited()? {
                                driver.signal_event(event)?;
                                break;
                            }

                            std::thread::sleep(poll_interval);
                        }

                        Ok(())
                    });

                    let result = driver.wait_event(event, None);
                    done.store(true, Ordering::Release);

                    match watchdog.join() {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => tracing::warn!(%err, "watchdog failed"),
                        Err(_) => tracing::warn!("watchdog panicked"),
                    }

                    result
                })?;

                driver.reset_event(event)?;
                core.has_exited()
            }
            Completion::Flag(flag) => loop {
                if core.has_exited()? {
                    return Ok(true);
                }

                if core.read_u8(*flag)? != 0 {
                    return Ok(false);
                }

                std::thread::sleep(poll_interval);
            },
        }
    }
}

impl<Driver, R> Drop for RemoteFunction<'_, Driver, R>
where
    Driver: XcallDriver,
    R: ReturnValue,
{
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            tracing::warn!(function = %self.address, %err, "failed to dispose remote function");
        }
    }
}
