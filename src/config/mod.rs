//! Configuration module.

pub mod loader;
pub mod schema;

pub use loader::{load_config, load_profile, parse_config, profile_path, profiles_dir, BUILTIN_PROFILE};
pub use schema::{
    parse_size, BindRule, DevMode, FilterMode, MountMode, NamespaceFlags, NetworkFilter,
    NetworkMode, NetworkSettings, OverlayMode, OverlayRule, PortForwarding, ProcessOptions,
    SandboxConfig, SystemPath, VirtualFilesystems, DEFAULT_SHELL, RESOLV_CONF,
};
