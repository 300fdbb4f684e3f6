//! Utility modules.

pub mod debug;
pub mod path;
pub mod process;
pub mod shell;

pub use debug::{init_debug_logging, is_debug_enabled, NSBOX_DEBUG_ENV, NSBOX_LOG_ENV};
pub use path::{decode_dest, encode_dest, expand_home, is_within, normalize_absolute, resolve_existing};
pub use process::{
    exit_code_from_status, find_in_path, is_executable, shutdown_signal, terminate_pid,
};
pub use shell::{join_args, needs_shell_wrap, quote, quote_always, wrap_command};
