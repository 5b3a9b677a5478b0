use windows::Win32::Foundation::{CloseHandle, HANDLE};

/// A Win32 handle closed on drop.
#[derive(Debug)]
pub(crate) struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub(crate) fn new(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.0
    }
}

// SAFETY: Kernel handles are process-wide and may be used from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.0.is_invalid() {
            return;
        }

        if let Err(err) = unsafe { CloseHandle(self.0) } {
            tracing::warn!(%err, "failed to close handle");
        }
    }
}

/// A thread created in the target process.
#[derive(Debug)]
pub struct WindowsThread {
    pub(crate) handle: OwnedHandle,
    pub(crate) id: u32,
}

impl WindowsThread {
    /// Returns the thread identifier.
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// A manual-reset event owned by the controlling process.
#[derive(Debug)]
pub struct WindowsEvent {
    pub(crate) handle: OwnedHandle,
}
