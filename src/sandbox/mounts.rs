//! Bind mount and overlay argument generation for bubblewrap.

use std::path::PathBuf;

use crate::config::{BindRule, MountMode, OverlayMode, OverlayRule, SandboxConfig};
use crate::error::{ConfigError, SandboxError};
use crate::utils::normalize_absolute;

/// Files needed for name resolution when the host network is shared.
pub const DNS_PATHS: &[&str] = &["/etc/resolv.conf", "/etc/hosts", "/etc/nsswitch.conf"];

/// CA bundle locations across distributions.
pub const SSL_CERT_PATHS: &[&str] = &[
    "/etc/ssl/certs",
    "/etc/ssl/cert.pem",
    "/etc/pki/tls/certs",
    "/etc/pki/ca-trust/extracted",
    "/etc/ca-certificates",
    "/usr/share/ca-certificates",
    "/usr/local/share/ca-certificates",
];

/// A single bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Source path on host.
    pub source: PathBuf,
    /// Target path in sandbox.
    pub target: PathBuf,
    /// Whether the mount is read-only.
    pub readonly: bool,
}

impl BindMount {
    /// Read-only bind at the same path.
    pub fn readonly(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            target: path,
            readonly: true,
        }
    }

    /// Writable bind at the same path.
    pub fn writable(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            target: path,
            readonly: false,
        }
    }

    /// Normalize a configured bind rule.
    pub fn from_rule(rule: &BindRule) -> Result<Self, ConfigError> {
        Ok(Self {
            source: normalize_absolute(&rule.source)?,
            target: normalize_absolute(&rule.dest)?,
            readonly: rule.mode == MountMode::Ro,
        })
    }

    /// Convert to bwrap arguments.
    pub fn to_bwrap_args(&self) -> Vec<String> {
        let flag = if self.readonly { "--ro-bind" } else { "--bind" };
        vec![
            flag.to_string(),
            self.source.display().to_string(),
            self.target.display().to_string(),
        ]
    }
}

/// Convert an overlay rule to bwrap arguments.
///
/// | mode       | source | arguments                                     |
/// |------------|--------|-----------------------------------------------|
/// | tmpfs      | none   | `--tmpfs DEST`                                |
/// | tmpfs      | set    | `--overlay-src SRC --tmp-overlay DEST`        |
/// | persistent | none   | `--bind WRITE DEST`                           |
/// | persistent | set    | `--overlay-src SRC --overlay WRITE WORK DEST` |
pub fn overlay_args(rule: &OverlayRule) -> Result<Vec<String>, ConfigError> {
    let dest = normalize_absolute(&rule.dest)?.display().to_string();
    let source = rule
        .source
        .as_deref()
        .map(normalize_absolute)
        .transpose()?
        .map(|p| p.display().to_string());

    let args = match (rule.mode, source) {
        (OverlayMode::Tmpfs, None) => vec!["--tmpfs".to_string(), dest],
        (OverlayMode::Tmpfs, Some(src)) => vec![
            "--overlay-src".to_string(),
            src,
            "--tmp-overlay".to_string(),
            dest,
        ],
        (OverlayMode::Persistent, source) => {
            let write = rule
                .write_dir
                .as_deref()
                .ok_or_else(|| ConfigError::MissingWriteDir(dest.clone()))?
                .display()
                .to_string();
            match source {
                None => vec!["--bind".to_string(), write, dest],
                Some(src) => {
                    let work = rule
                        .work_dir
                        .as_deref()
                        .ok_or_else(|| ConfigError::MissingWorkDir(dest.clone()))?
                        .display()
                        .to_string();
                    vec![
                        "--overlay-src".to_string(),
                        src,
                        "--overlay".to_string(),
                        write,
                        work,
                        dest,
                    ]
                }
            }
        }
    };
    Ok(args)
}

/// Create write and work directories for persistent overlays so the launcher
/// can mount them.
pub fn ensure_overlay_dirs(config: &SandboxConfig) -> Result<(), SandboxError> {
    for overlay in config
        .overlays
        .iter()
        .filter(|o| o.mode == OverlayMode::Persistent)
    {
        for dir in overlay.write_dir.iter().chain(overlay.work_dir.iter()) {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}
