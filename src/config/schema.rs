//! Sandbox configuration schema.
//!
//! A [`SandboxConfig`] is the whole description of one launch: mounts,
//! namespaces, environment and network policy. It is loaded from a JSON
//! profile (camelCase keys), adjusted by CLI overrides and then handed by
//! reference to the compilers; nothing mutates it afterwards.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::network::filter::{HostPattern, IpCidr};
use crate::utils::{is_within, normalize_absolute, resolve_existing};

static ENV_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));
static TMPFS_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+)([KkMmGg])?$").expect("valid regex"));

/// Where namespace launches mount their private resolver file.
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Default shell used to run commands containing shell operators.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Ro,
    Rw,
}

/// A host path exposed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRule {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub mode: MountMode,
}

impl BindRule {
    /// Read-only bind at the same path inside and outside.
    pub fn ro(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            dest: path,
            mode: MountMode::Ro,
        }
    }

    /// Read-write bind at the same path inside and outside.
    pub fn rw(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            dest: path,
            mode: MountMode::Rw,
        }
    }
}

/// Kind of writable layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayMode {
    /// Discarded when the sandbox exits.
    Tmpfs,
    /// Backed by a host write directory that survives exits.
    Persistent,
}

/// A writable layer at `dest`, optionally stacked over a host `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub dest: PathBuf,
    pub mode: OverlayMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

impl OverlayRule {
    /// Ephemeral tmpfs at `dest`.
    pub fn tmpfs(dest: impl Into<PathBuf>) -> Self {
        Self {
            source: None,
            dest: dest.into(),
            mode: OverlayMode::Tmpfs,
            write_dir: None,
            work_dir: None,
        }
    }

    /// Persistent layer at `dest`. Storage directories are assigned later by
    /// the lifecycle manager or set explicitly.
    pub fn persistent(dest: impl Into<PathBuf>) -> Self {
        Self {
            source: None,
            dest: dest.into(),
            mode: OverlayMode::Persistent,
            write_dir: None,
            work_dir: None,
        }
    }
}

/// Host system directories that can be exposed read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemPath {
    Usr,
    Bin,
    Lib,
    Lib64,
    Sbin,
    Etc,
}

impl SystemPath {
    /// Absolute host path.
    pub fn path(self) -> &'static str {
        match self {
            SystemPath::Usr => "/usr",
            SystemPath::Bin => "/bin",
            SystemPath::Lib => "/lib",
            SystemPath::Lib64 => "/lib64",
            SystemPath::Sbin => "/sbin",
            SystemPath::Etc => "/etc",
        }
    }
}

/// Namespaces to unshare.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamespaceFlags {
    pub user: bool,
    pub pid: bool,
    pub ipc: bool,
    pub uts: bool,
    pub cgroup: bool,
    /// Only honoured with network mode `disabled`; filtered modes get their
    /// namespace from pasta.
    pub net: bool,
    /// Block creation of nested user namespaces.
    pub disable_userns: bool,
}

/// Process-level launch options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessOptions {
    pub die_with_parent: bool,
    pub new_session: bool,
    pub as_pid_1: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chdir: Option<PathBuf>,
}

/// How /dev is populated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevMode {
    None,
    #[default]
    Minimal,
    Full,
}

/// Synthetic filesystems mounted by the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualFilesystems {
    pub dev: DevMode,
    pub proc: bool,
    pub tmp: bool,
    /// Size limit for /tmp, e.g. `100M`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmpfs_size: Option<String>,
}

impl Default for VirtualFilesystems {
    fn default() -> Self {
        Self {
            dev: DevMode::Minimal,
            proc: true,
            tmp: true,
            tmpfs_size: None,
        }
    }
}

/// Network access level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network flags at all.
    #[default]
    Disabled,
    /// Host network shared, DNS and certificates bound read-only.
    Enabled,
    /// Own namespace with firewall rules and DNS filtering.
    Filtered,
    /// Own namespace with packet capture for later review.
    Audit,
}

impl NetworkMode {
    /// Whether the launch goes through the namespace orchestrator.
    pub fn uses_namespace(self) -> bool {
        matches!(self, NetworkMode::Filtered | NetworkMode::Audit)
    }
}

/// Whether listed entries are the only ones allowed or the ones blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    Whitelist,
    Blacklist,
}

/// Hostname and address policy for a filtered namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFilter {
    pub mode: FilterMode,
    #[serde(default)]
    pub hosts: Vec<HostPattern>,
    #[serde(default)]
    pub cidrs: Vec<IpCidr>,
}

impl NetworkFilter {
    /// Reject filters with nothing in them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() && self.cidrs.is_empty() {
            return Err(ConfigError::EmptyFilter);
        }
        Ok(())
    }

    /// Whether the DNS proxy is needed.
    pub fn filters_hosts(&self) -> bool {
        !self.hosts.is_empty()
    }
}

/// pasta port forwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortForwarding {
    /// Sandbox ports reachable from the host (`-t`).
    pub expose: Vec<u16>,
    /// Host loopback ports reachable from the sandbox (`-T`).
    pub host: Vec<u16>,
}

/// Network section of a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSettings {
    pub mode: NetworkMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<NetworkFilter>,
    pub ports: PortForwarding,
    /// Where audit mode writes its capture. A temp file when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcap_path: Option<PathBuf>,
    /// Resolver the DNS proxy forwards to. First host nameserver when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_dns: Option<IpAddr>,
}

/// Complete description of one sandbox launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    pub binds: Vec<BindRule>,
    pub overlays: Vec<OverlayRule>,
    pub system_paths: BTreeSet<SystemPath>,
    pub namespaces: NamespaceFlags,
    pub process: ProcessOptions,
    pub filesystem: VirtualFilesystems,
    pub clear_env: bool,
    /// Host variables copied in when `clear_env` is set.
    pub keep_env: Vec<String>,
    pub unset_env: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Capabilities passed to `--cap-drop`.
    pub drop_caps: Vec<String>,
    pub network: NetworkSettings,
    /// Bind the working directory read-write and start there.
    pub bind_cwd: bool,
    pub shell: String,
    /// Command to run. Supplied at launch time, never stored in profiles.
    #[serde(skip)]
    pub command: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            binds: Vec::new(),
            overlays: Vec::new(),
            system_paths: BTreeSet::new(),
            namespaces: NamespaceFlags::default(),
            process: ProcessOptions::default(),
            filesystem: VirtualFilesystems::default(),
            clear_env: false,
            keep_env: Vec::new(),
            unset_env: Vec::new(),
            env: BTreeMap::new(),
            drop_caps: Vec::new(),
            network: NetworkSettings::default(),
            bind_cwd: false,
            shell: DEFAULT_SHELL.to_string(),
            command: Vec::new(),
        }
    }
}

impl SandboxConfig {
    /// The built-in `untrusted` profile: system directories read-only, a
    /// persistent home at /home/sandbox, every namespace unshared and
    /// private address ranges blocked once networking is turned on.
    pub fn untrusted() -> Self {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), "/home/sandbox".to_string());
        env.insert(
            "PATH".to_string(),
            "/usr/local/bin:/usr/bin:/bin:/usr/local/sbin:/usr/sbin:/sbin".to_string(),
        );

        let blocked = [
            "127.0.0.0/8",
            "::1/128",
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "169.254.0.0/16",
            "fe80::/10",
            "fc00::/7",
        ];

        Self {
            overlays: vec![OverlayRule::persistent("/home/sandbox")],
            system_paths: [
                SystemPath::Usr,
                SystemPath::Bin,
                SystemPath::Lib,
                SystemPath::Lib64,
                SystemPath::Sbin,
            ]
            .into_iter()
            .collect(),
            namespaces: NamespaceFlags {
                user: true,
                pid: true,
                ipc: true,
                uts: true,
                cgroup: true,
                net: true,
                disable_userns: false,
            },
            process: ProcessOptions {
                die_with_parent: true,
                new_session: true,
                hostname: Some("sandbox".to_string()),
                uid: Some(1000),
                gid: Some(1000),
                ..ProcessOptions::default()
            },
            clear_env: true,
            keep_env: vec!["TERM".to_string()],
            env,
            network: NetworkSettings {
                filter: Some(NetworkFilter {
                    mode: FilterMode::Blacklist,
                    hosts: Vec::new(),
                    cidrs: blocked
                        .iter()
                        .filter_map(|c| c.parse().ok())
                        .collect(),
                }),
                ..NetworkSettings::default()
            },
            ..Self::default()
        }
    }

    /// Check every structural invariant. Paths in the returned error are the
    /// normalized ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut dests: HashSet<PathBuf> = HashSet::new();

        for bind in &self.binds {
            normalize_absolute(&bind.source)?;
            let dest = normalize_absolute(&bind.dest)?;
            if !dests.insert(dest.clone()) {
                return Err(ConfigError::DuplicateDestination(dest.display().to_string()));
            }
        }

        self.validate_overlays(&dests)?;
        if self.network.mode.uses_namespace() {
            self.check_resolv_conf_kept()?;
        }

        for name in self.env.keys().chain(&self.keep_env).chain(&self.unset_env) {
            if !ENV_NAME.is_match(name) {
                return Err(ConfigError::InvalidEnvName(name.clone()));
            }
        }

        if let Some(size) = &self.filesystem.tmpfs_size {
            if parse_size(size).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "invalid tmpfs size '{}'",
                    size
                )));
            }
        }

        if (self.process.uid.is_some() || self.process.gid.is_some()) && !self.namespaces.user {
            return Err(ConfigError::ValidationError(
                "uid/gid require the user namespace".to_string(),
            ));
        }
        if self.namespaces.disable_userns && !self.namespaces.user {
            return Err(ConfigError::ValidationError(
                "disableUserns requires the user namespace".to_string(),
            ));
        }
        if self.process.hostname.is_some() && !self.namespaces.uts {
            return Err(ConfigError::ValidationError(
                "hostname requires the uts namespace".to_string(),
            ));
        }
        if let Some(dir) = &self.process.chdir {
            normalize_absolute(dir)?;
        }

        if self.network.mode == NetworkMode::Enabled && self.namespaces.net {
            return Err(ConfigError::ValidationError(
                "network mode 'enabled' conflicts with an unshared network namespace".to_string(),
            ));
        }
        if let Some(filter) = &self.network.filter {
            if self.network.mode.uses_namespace() {
                filter.validate()?;
            }
        } else if self.network.mode == NetworkMode::Filtered {
            return Err(ConfigError::EmptyFilter);
        }

        if self.shell.is_empty() {
            return Err(ConfigError::ValidationError("shell cannot be empty".to_string()));
        }

        Ok(())
    }

    fn validate_overlays(&self, bind_dests: &HashSet<PathBuf>) -> Result<(), ConfigError> {
        let mut seen: HashSet<(PathBuf, OverlayMode)> = HashSet::new();
        let mut storage: HashMap<PathBuf, PathBuf> = HashMap::new();

        for overlay in &self.overlays {
            let dest = normalize_absolute(&overlay.dest)?;
            if bind_dests.contains(&dest) {
                return Err(ConfigError::OverlappingMount {
                    dest: dest.display().to_string(),
                    other: "a bind mount".to_string(),
                });
            }
            // A tmpfs and a persistent overlay may target the same destination.
            if !seen.insert((dest.clone(), overlay.mode)) {
                return Err(ConfigError::DuplicateDestination(dest.display().to_string()));
            }
            if let Some(source) = &overlay.source {
                normalize_absolute(source)?;
            }

            if overlay.mode != OverlayMode::Persistent {
                continue;
            }
            let write_dir = overlay
                .write_dir
                .as_deref()
                .ok_or_else(|| ConfigError::MissingWriteDir(dest.display().to_string()))?;
            let mut dirs = vec![normalize_absolute(write_dir)?];
            match (&overlay.source, &overlay.work_dir) {
                (_, Some(work)) => dirs.push(normalize_absolute(work)?),
                (Some(_), None) => {
                    return Err(ConfigError::MissingWorkDir(dest.display().to_string()))
                }
                (None, None) => {}
            }
            for dir in dirs {
                if let Some(first) = storage.insert(dir.clone(), dest.clone()) {
                    return Err(ConfigError::SharedWriteDir {
                        dir: dir.display().to_string(),
                        first: first.display().to_string(),
                        second: dest.display().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// User mounts come after the private resolv.conf, so none may cover it.
    fn check_resolv_conf_kept(&self) -> Result<(), ConfigError> {
        let resolv = Path::new(RESOLV_CONF);
        let dests = self
            .binds
            .iter()
            .map(|b| &b.dest)
            .chain(self.overlays.iter().map(|o| &o.dest));
        for dest in dests {
            let dest = normalize_absolute(dest)?;
            if is_within(resolv, &dest) {
                return Err(ConfigError::OverlappingMount {
                    dest: dest.display().to_string(),
                    other: format!("the private {}", RESOLV_CONF),
                });
            }
        }
        Ok(())
    }

    /// Host paths writable from inside the sandbox, with symlinks resolved.
    pub fn writable_host_paths(&self) -> Vec<PathBuf> {
        let binds = self
            .binds
            .iter()
            .filter(|b| b.mode == MountMode::Rw)
            .map(|b| b.source.clone());
        let overlays = self
            .overlays
            .iter()
            .filter(|o| o.mode == OverlayMode::Persistent)
            .flat_map(|o| o.write_dir.iter().chain(o.work_dir.iter()).cloned());
        binds
            .chain(overlays)
            .filter(|p| p.is_absolute())
            .map(|p| resolve_existing(&p))
            .collect()
    }

    /// Whether `path` is covered by any writable mount source. Both sides are
    /// compared after resolving symlinks.
    pub fn exposes_writable(&self, path: &Path) -> bool {
        let path = resolve_existing(path);
        self.writable_host_paths()
            .iter()
            .any(|writable| is_within(&path, writable))
    }
}

/// Parse a size like `512`, `100M` or `1G` into bytes.
pub fn parse_size(size: &str) -> Option<u64> {
    let caps = TMPFS_SIZE.captures(size.trim())?;
    let value: u64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        None => 1,
        Some(unit) if unit == "K" => 1 << 10,
        Some(unit) if unit == "M" => 1 << 20,
        Some(_) => 1 << 30,
    };
    value.checked_mul(multiplier)
}
