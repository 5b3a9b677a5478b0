//! # Remote invocation example
//!
//! This example calls a few `kernel32` functions inside another process
//! and shows a message box from it when `user32.dll` is loaded.
//!
//! ```text
//! cargo run --example windows-invoke -- <pid>
//! ```
//!
//! # Possible log output
//!
//! ```text
//! DEBUG attached to process pid=4312 bitness=X64 main_module=notepad.exe base=0x00007ff6a7c20000
//!  INFO attached pid=4312 bitness=X64 main_module=notepad.exe
//! DEBUG thread created function=0x00007ff8d1c1e8c0 thread=WindowsThread { .. }
//!  INFO GetCurrentProcessId pid=4312
//!  INFO lstrlenA length=13
//!  INFO MessageBoxW result=1
//! ```

#[cfg(all(windows, target_arch = "x86_64"))]
mod common;

#[cfg(all(windows, target_arch = "x86_64"))]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use xcall::utils::injector::{Argument, CallBuilder, CallingConvention, RemoteFunction};

    let core = common::attach()?;

    let address = common::procedure(&core, "kernel32", "GetCurrentProcessId")?;
    let mut get_current_process_id =
        RemoteFunction::<_, u32>::new(&core, address, CallingConvention::Windows);
    let pid = get_current_process_id.invoke(CallBuilder::new())?;
    get_current_process_id.dispose()?;
    tracing::info!(pid, "GetCurrentProcessId");

    // String arguments are copied into the target and freed after the call.
    let address = common::procedure(&core, "kernel32", "lstrlenA")?;
    let mut lstrlen = RemoteFunction::<_, i32>::new(&core, address, CallingConvention::Windows);
    let length = lstrlen.invoke(CallBuilder::new().with_argument("Hello, world!"))?;
    lstrlen.dispose()?;
    tracing::info!(length, "lstrlenA");

    if core.find_module("user32.dll")?.is_none() {
        tracing::warn!("user32.dll is not loaded, skipping MessageBoxW");
        return Ok(());
    }

    let address = common::procedure(&core, "user32", "MessageBoxW")?;
    let mut message_box = RemoteFunction::<_, i32>::new(&core, address, CallingConvention::Windows);
    let result = message_box.invoke(
        CallBuilder::new()
            .with_argument(0u64)
            .with_argument(Argument::utf16("Hello from xcall!"))
            .with_argument(Argument::utf16("xcall"))
            .with_argument(0u32),
    )?;
    message_box.dispose()?;
    tracing::info!(result, "MessageBoxW");

    Ok(())
}

#[cfg(not(all(windows, target_arch = "x86_64")))]
fn main() {
    eprintln!("this example requires 64-bit Windows");
}
