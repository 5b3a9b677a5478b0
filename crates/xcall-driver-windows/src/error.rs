use windows::Win32::Foundation::GetLastError;

/// Error type for the Windows driver.
#[derive(Debug)]
pub enum Error {
    /// A Win32 call failed.
    Win32 {
        /// Name of the failed call.
        operation: &'static str,

        /// Win32 error code.
        code: u32,
    },

    /// The process has not loaded any module yet.
    NoModules,

    /// Operation not supported.
    NotSupported,
}

impl Error {
    /// Captures the calling thread's last error.
    pub(crate) fn last(operation: &'static str) -> Self {
        let code = unsafe { GetLastError() };
        Self::Win32 {
            operation,
            code: code.0,
        }
    }

    pub(crate) fn from_windows(operation: &'static str, error: windows::core::Error) -> Self {
        let hresult = error.code().0 as u32;

        // HRESULT_FROM_WIN32
        let code = match hresult & 0xffff_0000 {
            0x8007_0000 => hresult & 0xffff,
            _ => hresult,
        };

        Self::Win32 { operation, code }
    }
}

/// Attaches the name of the failed call to a `windows` result.
pub(crate) trait Win32ResultExt<T> {
    fn win32(self, operation: &'static str) -> Result<T, Error>;
}

impl<T> Win32ResultExt<T> for windows::core::Result<T> {
    fn win32(self, operation: &'static str) -> Result<T, Error> {
        self.map_err(|error| Error::from_windows(operation, error))
    }
}

impl From<Error> for xcall_core::XcallError {
    fn from(error: Error) -> Self {
        match error {
            Error::Win32 { operation, code } => Self::os(operation, code),
            Error::NoModules => Self::Other("the process has no modules loaded"),
            Error::NotSupported => Self::NotSupported,
        }
    }
}
