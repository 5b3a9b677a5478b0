use xcall::{ProcessId, XcallCore, driver::windows::XcallWindowsDriver};

pub fn attach() -> Result<XcallCore<XcallWindowsDriver>, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let pid = match std::env::args().nth(1) {
        Some(pid) => pid.parse::<u32>()?,
        None => {
            eprintln!("usage: {} <pid>", env!("CARGO_CRATE_NAME"));
            std::process::exit(1);
        }
    };

    let driver = XcallWindowsDriver::new(ProcessId(pid))?;
    let core = XcallCore::new(driver)?;

    tracing::info!(
        pid = %core.info().pid,
        bitness = ?core.bitness(),
        main_module = %core.main_module().name,
        "attached"
    );

    Ok(core)
}

pub fn procedure<Driver>(
    core: &XcallCore<Driver>,
    module: &str,
    procedure: &str,
) -> Result<xcall::Va, Box<dyn std::error::Error>>
where
    Driver: xcall::XcallDriver,
{
    match core.procedure_address(module, procedure)? {
        Some(address) => Ok(address),
        None => Err(format!("{module}!{procedure} not found").into()),
    }
}
