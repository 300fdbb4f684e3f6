//! Logging setup shared by the outer launcher and the inner `netns-init`
//! process.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Set to anything but `0`, `false` or an empty string to enable debug output.
pub const NSBOX_DEBUG_ENV: &str = "NSBOX_DEBUG";

/// Full `EnvFilter` directive, e.g. `nsbox::network::dns=trace`. Overrides
/// the level picked from the debug flag.
pub const NSBOX_LOG_ENV: &str = "NSBOX_LOG";

fn debug_requested(value: Option<&OsStr>) -> bool {
    match value.and_then(OsStr::to_str) {
        Some(v) => !matches!(v.trim().to_ascii_lowercase().as_str(), "" | "0" | "false" | "no" | "off"),
        None => value.is_some(),
    }
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "nsbox=debug,warn"
    } else {
        "nsbox=info,warn"
    }
}

/// Initialize logging from `-d`, `NSBOX_DEBUG` and `NSBOX_LOG`.
///
/// Logs go to stderr so they never mix with the sandboxed command's stdout.
/// In debug mode module targets are shown, which tells proxy, orchestrator
/// and launcher lines apart once pasta interleaves both processes.
pub fn init_debug_logging(force_debug: bool) {
    let debug_enabled = force_debug || debug_requested(std::env::var_os(NSBOX_DEBUG_ENV).as_deref());
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_env(NSBOX_LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(debug_enabled)
        .with_level(debug_enabled)
        .try_init()
        .ok();
}

/// Whether debug output was requested. Forwarded to `netns-init` as `-d`.
pub fn is_debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::SeqCst)
}
