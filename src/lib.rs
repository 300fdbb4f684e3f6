//! nsbox - bubblewrap sandboxes with filtered network namespaces and persistent overlays.
//!
//! - [`sandbox`] compiles a [`SandboxConfig`] into a bubblewrap command line
//! - [`network`] isolates filtered launches in a pasta namespace with packet
//!   filter rules and a DNS proxy
//! - [`lifecycle`] manages named sandboxes and their installed wrappers

pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod sandbox;
pub mod utils;

pub use config::{NetworkMode, SandboxConfig};
pub use error::{ConfigError, Result, SandboxError};
pub use lifecycle::LifecycleManager;

/// Re-export commonly used items.
pub mod prelude {
    pub use crate::config::{load_profile, SandboxConfig};
    pub use crate::error::{Result, SandboxError};
    pub use crate::lifecycle::{LifecycleManager, StateLayout};
    pub use crate::sandbox::{compile, HostContext, LaunchPlan};
}
