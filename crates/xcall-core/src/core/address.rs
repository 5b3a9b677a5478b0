use super::macros::impl_address;

impl_address!(Va, u64, "virtual address inside the target process");

impl Va {
    /// Truncates the address to the given pointer width in bytes.
    pub const fn truncate(self, width: usize) -> Self {
        match width {
            4 => Self(self.0 & 0xffff_ffff),
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(Va(0x1007).align_down(8), Va(0x1000));
        assert_eq!(Va(0x1007).align_up(8), Va(0x1008));
        assert_eq!(Va(0x1008).align_up(8), Va(0x1008));
        assert_eq!(Va(0x1000).wrapping_offset(-0x20), Va(0xfe0));
    }

    #[test]
    fn truncate() {
        assert_eq!(Va(0x1_2345_6789).truncate(4), Va(0x2345_6789));
        assert_eq!(Va(0x1_2345_6789).truncate(8), Va(0x1_2345_6789));
    }
}
