mod address;
mod hex;
mod info;
pub(crate) mod macros;
mod protection;

pub use self::{
    address::Va,
    hex::Hex,
    info::{Bitness, ModuleInfo, ProcessId, ProcessInfo},
    protection::MemoryProtection,
};
pub(crate) use self::info::module_stem;
