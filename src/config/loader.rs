//! Profile loading from ~/.config/nsbox/profiles.

use std::path::{Path, PathBuf};

use crate::config::schema::SandboxConfig;
use crate::error::{ConfigError, SandboxError};

/// Name of the profile that exists without a file on disk.
pub const BUILTIN_PROFILE: &str = "untrusted";

/// Directory holding `<name>.json` profiles.
pub fn profiles_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("nsbox").join("profiles"))
}

/// Resolve a profile reference to a file path. References containing a `/`
/// or ending in `.json` are paths, anything else is a name.
pub fn profile_path(reference: &str) -> Option<PathBuf> {
    if reference.contains('/') || reference.ends_with(".json") {
        return Some(PathBuf::from(crate::utils::expand_home(reference)));
    }
    profiles_dir().map(|dir| dir.join(format!("{}.json", reference)))
}

/// Load a profile by name or path.
///
/// A profile file named `untrusted` overrides the built-in one.
pub fn load_profile(reference: &str) -> Result<SandboxConfig, SandboxError> {
    match profile_path(reference) {
        Some(path) if path.exists() => load_config(&path),
        _ if reference == BUILTIN_PROFILE => Ok(SandboxConfig::untrusted()),
        Some(path) => Err(ConfigError::FileNotFound(path.display().to_string()).into()),
        None => Err(ConfigError::FileNotFound(reference.to_string()).into()),
    }
}

/// Load a profile from a file path.
pub fn load_config(path: &Path) -> Result<SandboxConfig, SandboxError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()).into());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ParseError(format!("Failed to read {}: {}", path.display(), e)))?;

    tracing::debug!("Loaded profile from {}", path.display());
    parse_config(&content)
}

/// Parse a profile from JSON.
///
/// Host patterns and CIDRs are validated while parsing. Structural checks
/// run in the compiler, once overlays have their storage assigned.
pub fn parse_config(json: &str) -> Result<SandboxConfig, SandboxError> {
    let config: SandboxConfig = serde_json::from_str(json)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse profile JSON: {}", e)))?;
    Ok(config)
}
