use tracing::error;

/// The process-wide fault boundary: an unexpected failure in any background loop means shared
///  session state may be corrupt, and measurements taken from here on cannot be trusted. So we
///  log what we know and terminate.
pub fn fatal(task: &str, error: &anyhow::Error) -> ! {
    error!("internal fault in task '{}': {:#} - terminating", task, error);
    std::process::exit(1)
}

/// Routes panics in any thread or task through the fault boundary, after the default hook
///  printed its diagnostics. Without this, a panicking tokio task would just end silently.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("panic: {} - terminating", info);
        default_hook(info);
        std::process::exit(1);
    }));
}
