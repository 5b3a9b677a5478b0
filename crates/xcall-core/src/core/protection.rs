use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Page protection of a memory region in the target process.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryProtection: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Execute permission.
        const X = 0b00000100;

        /// Combined Read and Write permissions.
        const RW = Self::R.bits() | Self::W.bits();

        /// Combined Read and Execute permissions.
        const RX = Self::R.bits() | Self::X.bits();

        /// Full access: Read, Write, and Execute permissions.
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl std::fmt::Display for MemoryProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = [b'-'; 3];

        if self.contains(MemoryProtection::R) {
            result[0] = b'r';
        }
        if self.contains(MemoryProtection::W) {
            result[1] = b'w';
        }
        if self.contains(MemoryProtection::X) {
            result[2] = b'x';
        }

        f.write_str(&String::from_utf8_lossy(&result))
    }
}
