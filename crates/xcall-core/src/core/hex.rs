macro_rules! impl_hex {
    ($($type:ty),*) => {
        $(
            impl ::std::fmt::Debug for Hex<$type> {
                fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                    fmt_padded(f, self.0)
                }
            }

            impl ::std::fmt::Display for Hex<$type> {
                fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                    fmt_padded(f, self.0)
                }
            }
        )*
    };
}

fn fmt_padded<T>(f: &mut ::std::fmt::Formatter, data: T) -> ::std::fmt::Result
where
    T: Copy + ::std::fmt::LowerHex,
{
    match size_of::<T>() {
        1 => write!(f, "0x{:02x}", data),
        2 => write!(f, "0x{:04x}", data),
        4 => write!(f, "0x{:08x}", data),
        8 => write!(f, "0x{:016x}", data),
        _ => write!(f, "0x{:x}", data),
    }
}

/// A hexadecimal representation of a value.
///
/// Used mostly as a `tracing` field formatter.
///
/// # Examples
///
/// ```
/// # use xcall_core::Hex;
/// assert_eq!(format!("{}", Hex(42u16)), "0x002a");
/// assert_eq!(format!("{}", Hex(&[0x90u8, 0xcc][..])), "[90 cc]");
/// ```
pub struct Hex<T>(pub T);

impl_hex!(i8, i16, i32, i64, u8, u16, u32, u64, u128, isize, usize);

impl ::std::fmt::Display for Hex<&[u8]> {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "[")?;

        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, " ")?;
            }

            write!(f, "{byte:02x}")?;
        }

        write!(f, "]")
    }
}

impl ::std::fmt::Debug for Hex<&[u8]> {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        ::std::fmt::Display::fmt(self, f)
    }
}
