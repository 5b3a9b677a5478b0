//! # Hooking example
//!
//! This example replaces `kernel32!GetTickCount` inside another process
//! with a hook that returns a constant, calls it through the hook, and
//! restores the original code. It also looks up a signature in the
//! main module.
//!
//! ```text
//! cargo run --example windows-hook -- <pid> ["48 8B ?? ?? C3"]
//! ```
//!
//! # Possible log output
//!
//! ```text
//!  INFO attached pid=4312 bitness=X64 main_module=notepad.exe
//!  INFO resolved thunk export=0x00007ff8d1c1b790 target=0x00007ff8cfa3c0f0
//! DEBUG hook installed address=0x00007ff8cfa3c0f0 block=0x000001d6e5a40000 consumed=14 kind=Jump
//!  INFO GetTickCount before=93016406 hooked=42
//!  INFO signature found address=0x00007ff6a7c2a1b4
//! ```

#[cfg(all(windows, target_arch = "x86_64"))]
mod common;

#[cfg(all(windows, target_arch = "x86_64"))]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use xcall::{
        arch::x86::{HookKind, X86Toolchain},
        utils::{
            injector::{CallBuilder, CallingConvention, RemoteFunction},
            interceptor::{Interceptor, reader},
            scanner::{Signature, scan_signature},
        },
    };

    let core = common::attach()?;

    // Exports in kernel32 are often thunks into kernelbase.
    let export = common::procedure(&core, "kernel32", "GetTickCount")?;
    let target = reader::read_thunk(&core, export)?;
    tracing::info!(%export, %target, "resolved thunk");

    let mut get_tick_count =
        RemoteFunction::<_, u32>::new(&core, export, CallingConvention::Windows);
    let before = get_tick_count.invoke(CallBuilder::new())?;

    // The body returns on its own, so the trailer is never reached.
    let mut interceptor = Interceptor::new(X86Toolchain);
    interceptor.install_hook(&core, target, "mov eax, 42\nret", HookKind::Jump, true)?;

    let hooked = get_tick_count.invoke(CallBuilder::new());
    interceptor.clear(&core)?;
    get_tick_count.dispose()?;

    let hooked = hooked?;
    tracing::info!(before, hooked, "GetTickCount");

    let pattern = std::env::args()
        .nth(2)
        .unwrap_or_else(|| String::from("48 89 5C 24 ?? 57 48 83 EC"));
    let signature = Signature::parse(&pattern)?;

    match scan_signature(&core, &signature, None)? {
        Some(address) => tracing::info!(%address, "signature found"),
        None => tracing::info!(%pattern, "signature not found"),
    }

    Ok(())
}

#[cfg(not(all(windows, target_arch = "x86_64")))]
fn main() {
    eprintln!("this example requires 64-bit Windows");
}
