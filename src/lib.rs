//! Call functions and splice code inside another running process.
//!
//! The crate is a thin facade over the workspace crates:
//!
//! - the core ([`XcallCore`], [`XcallDriver`], typed memory access and
//!   export resolution) is re-exported at the top level
//! - [`arch`] holds the instruction-set specific code generators
//! - [`driver`] holds the process-access backends
//! - [`utils`] holds the injector, the interceptor and the scanner
//!
//! Every component except the core sits behind a cargo feature of the same
//! name.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use xcall_core::*;

/// Architecture-specific code generation.
pub mod arch {
    #[cfg(feature = "arch-x86")]
    #[cfg_attr(docsrs, doc(cfg(feature = "arch-x86")))]
    pub use xcall_arch_x86 as x86;
}

/// Process-access backends.
pub mod driver {
    #[cfg(all(feature = "driver-windows", windows, target_arch = "x86_64"))]
    #[cfg_attr(docsrs, doc(cfg(feature = "driver-windows")))]
    pub use xcall_driver_windows as windows;
}

#[cfg(feature = "utils")]
#[cfg_attr(docsrs, doc(cfg(feature = "utils")))]
pub use xcall_utils as utils;
