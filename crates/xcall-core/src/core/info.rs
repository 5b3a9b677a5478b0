use serde::{Deserialize, Serialize};

use super::Va;

/// Operating-system identifier of a process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u32);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instruction set width of the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bitness {
    /// 32-bit x86 (native or WOW64).
    X86,

    /// 64-bit x86-64.
    X64,
}

impl Bitness {
    /// Returns the pointer width in bytes.
    pub const fn address_width(self) -> usize {
        match self {
            Self::X86 => 4,
            Self::X64 => 8,
        }
    }

    /// Returns the pointer width in bits.
    pub const fn bits(self) -> u32 {
        match self {
            Self::X86 => 32,
            Self::X64 => 64,
        }
    }

    /// Returns `true` for 64-bit targets.
    pub const fn is_64bit(self) -> bool {
        matches!(self, Self::X64)
    }

    /// Returns the stack alignment a call site must maintain.
    pub const fn stack_alignment(self) -> u64 {
        match self {
            Self::X86 => 4,
            Self::X64 => 16,
        }
    }

    /// Returns the preferred load base of an executable image.
    ///
    /// Addresses captured from a disassembler listing are usually relative
    /// to this base.
    pub const fn preferred_image_base(self) -> Va {
        match self {
            Self::X86 => Va(0x0040_0000),
            Self::X64 => Va(0x0001_4000_0000),
        }
    }
}

/// A module (image) loaded in the target process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// File name of the module, e.g. `kernel32.dll`.
    pub name: String,

    /// Load base.
    pub base: Va,

    /// Size of the mapped image in bytes.
    pub size: u64,
}

impl ModuleInfo {
    /// Returns the first address past the end of the image.
    pub fn end(&self) -> Va {
        self.base + self.size
    }

    /// Checks whether `address` lies inside the image.
    pub fn contains(&self, address: Va) -> bool {
        address >= self.base && address < self.end()
    }

    /// Returns the lowercase module name without its extension.
    pub fn stem(&self) -> String {
        module_stem(&self.name)
    }
}

/// Normalizes a module name for comparison: lowercase and without extension.
pub(crate) fn module_stem(name: &str) -> String {
    let name = name.to_lowercase();
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_owned(),
        _ => name,
    }
}

/// Information about the target process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process identifier.
    pub pid: ProcessId,

    /// Instruction set width of the process.
    pub bitness: Bitness,

    /// The main executable image.
    pub main_module: ModuleInfo,
}
