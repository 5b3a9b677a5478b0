use crate::Register;

/// An error that can occur when working with a target process.
#[derive(thiserror::Error, Debug)]
pub enum XcallError {
    /// An error occurred in the driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// An operating-system primitive failed.
    #[error("{operation} failed with OS error {code}")]
    Os {
        /// Name of the failed primitive.
        operation: &'static str,

        /// OS error code.
        code: u32,
    },

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A thread context was accessed while the thread was running.
    #[error("The thread is not suspended")]
    ThreadNotSuspended,

    /// The target process exited before the call completed.
    #[error("The target process terminated during the call")]
    PeerTerminated,

    /// A user-defined calling convention was used without a prefix mutator.
    #[error("User-defined calling convention requires a prefix mutator")]
    MissingPrefix,

    /// The number of arguments does not match the declared signature.
    #[error("Expected {expected} arguments, got {actual}")]
    ArgumentCount {
        /// Number of declared arguments.
        expected: usize,

        /// Number of supplied arguments.
        actual: usize,
    },

    /// An argument does not match the declared signature.
    #[error("Argument {index} does not match the declared type")]
    ArgumentType {
        /// Zero-based argument index.
        index: usize,
    },

    /// The register is not available for the target bitness.
    #[error("Register {0:?} is not available")]
    InvalidRegister(Register),

    /// The vector register index is out of range.
    #[error("Vector register xmm{0} is not available")]
    InvalidVectorRegister(usize),

    /// The vector lane is out of range for the element type.
    #[error("Lane {lane} is out of range ({lanes} lanes)")]
    InvalidLane {
        /// Requested lane.
        lane: usize,

        /// Number of lanes of the element type.
        lanes: usize,
    },

    /// A procedure required by the engine is not exported.
    #[error("Procedure {module}!{procedure} not found")]
    MissingProcedure {
        /// Module name.
        module: &'static str,

        /// Procedure name.
        procedure: &'static str,
    },

    /// Memory of the main module must not be freed.
    #[error("Refusing to free memory of the main module")]
    MainModuleMemory,

    /// The PE image is malformed.
    #[error("Invalid image: {0}")]
    InvalidImage(&'static str),

    /// The assembler rejected the source.
    #[error("Assembler error: {0}")]
    Assembler(String),

    /// The disassembler failed.
    #[error("Disassembler error: {0}")]
    Disassembler(String),

    /// The signature pattern and mask are malformed.
    #[error("Invalid signature pattern")]
    InvalidPattern,

    /// The given address has invalid width.
    #[error("Invalid address width")]
    InvalidAddressWidth,

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

impl XcallError {
    /// Creates an OS error for the given primitive.
    pub fn os(operation: &'static str, code: u32) -> Self {
        Self::Os { operation, code }
    }
}
