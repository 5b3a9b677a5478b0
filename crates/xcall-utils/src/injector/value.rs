use xcall_arch_x86::ReturnKind;
use xcall_core::{Bitness, Va};

/// A value returned by a remote function.
///
/// The wrapper stores the return register into a staging buffer according
/// to [`kind`](Self::kind); the value is then decoded from those bytes.
/// [`Default`] provides the value returned when the target exits during a
/// call and process exit is not treated as an error.
pub trait ReturnValue: Sized + Default {
    /// Returns how the value is returned for the given bitness.
    fn kind(bitness: Bitness) -> ReturnKind;

    /// Decodes the value from the staging buffer.
    fn from_le_bytes(bytes: &[u8]) -> Self;
}

impl ReturnValue for () {
    fn kind(_bitness: Bitness) -> ReturnKind {
        ReturnKind::Void
    }

    fn from_le_bytes(_bytes: &[u8]) -> Self {}
}

impl ReturnValue for bool {
    fn kind(_bitness: Bitness) -> ReturnKind {
        ReturnKind::Integer(1)
    }

    fn from_le_bytes(bytes: &[u8]) -> Self {
        bytes.first().is_some_and(|&byte| byte != 0)
    }
}

macro_rules! impl_return_value {
    ($($t:ty => $kind:expr),*) => {
        $(
            impl ReturnValue for $t {
                fn kind(_bitness: Bitness) -> ReturnKind {
                    $kind
                }

                fn from_le_bytes(bytes: &[u8]) -> Self {
                    let mut buffer = [0u8; size_of::<$t>()];
                    let length = buffer.len().min(bytes.len());
                    buffer[..length].copy_from_slice(&bytes[..length]);
                    <$t>::from_le_bytes(buffer)
                }
            }
        )*
    };
}

impl_return_value!(
    u8 => ReturnKind::Integer(1),
    i8 => ReturnKind::Integer(1),
    u16 => ReturnKind::Integer(2),
    i16 => ReturnKind::Integer(2),
    u32 => ReturnKind::Integer(4),
    i32 => ReturnKind::Integer(4),
    u64 => ReturnKind::Integer(8),
    i64 => ReturnKind::Integer(8),
    f32 => ReturnKind::Float,
    f64 => ReturnKind::Double
);

impl ReturnValue for Va {
    fn kind(bitness: Bitness) -> ReturnKind {
        ReturnKind::Integer(bitness.address_width() as u8)
    }

    fn from_le_bytes(bytes: &[u8]) -> Self {
        Va(<u64 as ReturnValue>::from_le_bytes(bytes))
    }
}
