use super::Argument;

/// A builder for the argument list of a remote call.
#[derive(Debug, Default, Clone)]
pub struct CallBuilder {
    /// The arguments to pass to the function.
    pub(super) arguments: Vec<Argument>,
}

impl CallBuilder {
    /// Creates an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an argument to the call being built.
    pub fn with_argument(mut self, argument: impl Into<Argument>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Returns the arguments collected so far.
    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }
}
