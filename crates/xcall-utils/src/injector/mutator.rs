use xcall_core::{XcallDriver, XcallError};

use super::ThreadContext;

/// A hook that adjusts the thread context around a remote call.
///
/// A prefix runs after the instruction pointer was set and before the
/// thread is resumed; it is the only setup a
/// [`UserCall`](super::CallingConvention::UserCall) gets. A postfix runs
/// after the call completed, while the thread is suspended again.
///
/// Any closure taking a [`ThreadContext`] is a mutator.
pub trait ContextMutator<Driver>
where
    Driver: XcallDriver,
{
    /// Mutates the context.
    fn mutate(&mut self, context: &ThreadContext<Driver>) -> Result<(), XcallError>;
}

impl<Driver, F> ContextMutator<Driver> for F
where
    Driver: XcallDriver,
    F: FnMut(&ThreadContext<Driver>) -> Result<(), XcallError>,
{
    fn mutate(&mut self, context: &ThreadContext<Driver>) -> Result<(), XcallError> {
        self(context)
    }
}

/// The prefix and postfix mutators of a single call.
pub struct Mutators<'m, Driver>
where
    Driver: XcallDriver,
{
    pub(super) prefix: Option<Box<dyn ContextMutator<Driver> + 'm>>,
    pub(super) postfix: Option<Box<dyn ContextMutator<Driver> + 'm>>,
}

impl<'m, Driver> Mutators<'m, Driver>
where
    Driver: XcallDriver,
{
    /// Creates an empty set of mutators.
    pub fn new() -> Self {
        Self {
            prefix: None,
            postfix: None,
        }
    }

    /// Sets the mutator that runs before the thread is resumed.
    pub fn with_prefix(mut self, prefix: impl ContextMutator<Driver> + 'm) -> Self {
        self.prefix = Some(Box::new(prefix));
        self
    }

    /// Sets the mutator that runs after the call completed.
    pub fn with_postfix(mut self, postfix: impl ContextMutator<Driver> + 'm) -> Self {
        self.postfix = Some(Box::new(postfix));
        self
    }

    /// Returns `true` if a prefix is set.
    pub fn has_prefix(&self) -> bool {
        self.prefix.is_some()
    }
}

impl<Driver> Default for Mutators<'_, Driver>
where
    Driver: XcallDriver,
{
    fn default() -> Self {
        Self::new()
    }
}
