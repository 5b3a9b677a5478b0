use xcall_core::Va;
use zerocopy::{Immutable, IntoBytes};

/// A function argument passed to a remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// An integer of the given size in bytes (1, 2, 4 or 8).
    ///
    /// Values narrower than the pointer width still occupy a full
    /// pointer-width slot.
    Integer {
        /// The value, sign- or zero-extended to 64 bits.
        value: u64,

        /// Size of the value in bytes.
        size: u8,
    },

    /// A 32-bit float.
    Float(f32),

    /// A 64-bit float.
    Double(f64),

    /// An address in the target process.
    Pointer(Va),

    /// A structure passed by value.
    Struct(Vec<u8>),

    /// A string copied into the target as NUL-terminated UTF-8.
    Utf8(String),

    /// A string copied into the target as NUL-terminated UTF-16.
    Utf16(String),
}

/// The declared type of an argument.
///
/// A function may declare the types it expects with
/// [`RemoteFunction::with_argument_types`]; each argument is checked
/// against its declared type before the call is made.
///
/// [`RemoteFunction::with_argument_types`]: super::RemoteFunction::with_argument_types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentType {
    /// An integer of the given size in bytes.
    Integer(u8),

    /// A 32-bit float.
    Float,

    /// A 64-bit float.
    Double,

    /// An address in the target process.
    Pointer,

    /// A structure passed by value.
    Struct,

    /// A UTF-8 string.
    Utf8,

    /// A UTF-16 string.
    Utf16,
}

impl Argument {
    /// Creates a by-value structure argument from a plain value.
    pub fn from_struct<T>(value: &T) -> Self
    where
        T: IntoBytes + Immutable,
    {
        Self::Struct(value.as_bytes().to_vec())
    }

    /// Creates a UTF-16 string argument.
    pub fn utf16(value: impl Into<String>) -> Self {
        Self::Utf16(value.into())
    }

    /// Returns the type of this argument.
    pub fn kind(&self) -> ArgumentType {
        match self {
            Self::Integer { size, .. } => ArgumentType::Integer(*size),
            Self::Float(_) => ArgumentType::Float,
            Self::Double(_) => ArgumentType::Double,
            Self::Pointer(_) => ArgumentType::Pointer,
            Self::Struct(_) => ArgumentType::Struct,
            Self::Utf8(_) => ArgumentType::Utf8,
            Self::Utf16(_) => ArgumentType::Utf16,
        }
    }

    /// Returns `true` for float and double arguments.
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float(_) | Self::Double(_))
    }

    /// Returns `true` for structures passed by value.
    pub fn is_struct(&self) -> bool {
        matches!(self, Self::Struct(_))
    }

    /// Returns `true` for values that are 64 bits wide regardless of the
    /// target bitness.
    pub fn is_wide(&self) -> bool {
        matches!(self, Self::Integer { size: 8, .. } | Self::Double(_))
    }
}

macro_rules! impl_from_num {
    ($($t:ty => $wide:ty),*) => {
        $(
            impl From<$t> for Argument {
                fn from(value: $t) -> Self {
                    Self::Integer {
                        value: value as $wide as u64,
                        size: size_of::<$t>() as u8,
                    }
                }
            }

            impl From<&$t> for Argument {
                fn from(value: &$t) -> Self {
                    Self::from(*value)
                }
            }
        )*
    };
}

impl_from_num!(
    u8 => u64, u16 => u64, u32 => u64, u64 => u64,
    i8 => i64, i16 => i64, i32 => i64, i64 => i64
);

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Self::from(value as u8)
    }
}

impl From<f32> for Argument {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<f64> for Argument {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<Va> for Argument {
    fn from(value: Va) -> Self {
        Self::Pointer(value)
    }
}

impl From<&Va> for Argument {
    fn from(value: &Va) -> Self {
        Self::from(*value)
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl From<&String> for Argument {
    fn from(value: &String) -> Self {
        Self::from(value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_keep_their_size() {
        assert_eq!(
            Argument::from(-1i32),
            Argument::Integer {
                value: u64::MAX,
                size: 4
            }
        );
        assert_eq!(
            Argument::from(0xffu8),
            Argument::Integer {
                value: 0xff,
                size: 1
            }
        );
        assert_eq!(Argument::from(true).kind(), ArgumentType::Integer(1));
    }

    #[test]
    fn classification() {
        assert!(Argument::from(1.0f32).is_float());
        assert!(Argument::from(1.0f64).is_wide());
        assert!(Argument::from(1u64).is_wide());
        assert!(!Argument::from(1u32).is_wide());
        assert!(Argument::from_struct(&[1u32, 2, 3]).is_struct());
        assert_eq!(Argument::utf16("x").kind(), ArgumentType::Utf16);
    }
}
