//! Compilation of a [`SandboxConfig`] into a bubblewrap command line.
//!
//! Arguments are emitted in a fixed order because later mounts shadow
//! earlier ones at the same path:
//!
//! 1. namespace and process flags
//! 2. read-only system paths, virtual filesystems, network support files
//! 3. user read-only binds
//! 4. user read-write binds
//! 5. overlays, tmpfs before persistent
//! 6. environment
//! 7. working directory
//! 8. `--` and the command

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::config::{parse_size, DevMode, NetworkMode, OverlayMode, SandboxConfig, RESOLV_CONF};
use crate::error::{ConfigError, SandboxError};
use crate::sandbox::mounts::{overlay_args, BindMount, DNS_PATHS, SSL_CERT_PATHS};
use crate::utils::{is_within, join_args, normalize_absolute, wrap_command};

/// Launcher binary.
pub const BWRAP: &str = "bwrap";

/// Facts about the host the compiler needs. Tests build one by hand so
/// compilation never depends on the machine it runs on.
#[derive(Debug, Clone)]
pub struct HostContext {
    /// Working directory of the invoking process.
    pub cwd: PathBuf,
    /// Environment of the invoking process.
    pub env: BTreeMap<String, String>,
    /// File to mount at /etc/resolv.conf instead of the host's.
    pub resolv_conf: Option<PathBuf>,
    existing: Option<BTreeSet<PathBuf>>,
}

impl HostContext {
    /// Context of the current process, probing the real filesystem.
    pub fn current() -> Result<Self, SandboxError> {
        Ok(Self {
            cwd: std::env::current_dir()?,
            env: std::env::vars().collect(),
            resolv_conf: None,
            existing: None,
        })
    }

    /// Context where only `existing` paths are present on the host.
    pub fn fixed<I, P>(cwd: impl Into<PathBuf>, existing: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            cwd: cwd.into(),
            env: BTreeMap::new(),
            resolv_conf: None,
            existing: Some(existing.into_iter().map(Into::into).collect()),
        }
    }

    /// Replace the resolver configuration seen by the sandbox.
    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = Some(path.into());
        self
    }

    /// Whether a host path exists.
    pub fn exists(&self, path: &Path) -> bool {
        match &self.existing {
            Some(set) => set.contains(path),
            None => path.exists(),
        }
    }
}

/// A compiled launch: launcher options plus the in-sandbox command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Options for the launcher, excluding the `--` separator.
    pub args: Vec<String>,
    /// Command executed inside the sandbox.
    pub command: Vec<String>,
}

impl LaunchPlan {
    /// Full argv: `bwrap ARGS -- COMMAND`.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + self.command.len() + 2);
        argv.push(BWRAP.to_string());
        argv.extend(self.args.iter().cloned());
        argv.push("--".to_string());
        argv.extend(self.command.iter().cloned());
        argv
    }

    /// Shell-quoted form, for `--dry-run` and logs.
    pub fn to_shell_string(&self) -> String {
        join_args(self.to_argv())
    }
}

/// Compile a configuration into a launch plan.
///
/// Fails with a configuration error before anything runs when an invariant
/// does not hold.
pub fn compile(config: &SandboxConfig, host: &HostContext) -> Result<LaunchPlan, SandboxError> {
    config.validate()?;

    let mut args = Vec::new();
    push_namespace_args(config, &mut args);
    push_system_args(config, host, &mut args)?;

    let binds = config
        .binds
        .iter()
        .map(BindMount::from_rule)
        .collect::<Result<Vec<_>, _>>()?;
    for mount in binds.iter().filter(|m| m.readonly) {
        args.extend(mount.to_bwrap_args());
    }
    for mount in binds.iter().filter(|m| !m.readonly) {
        args.extend(mount.to_bwrap_args());
    }

    // A persistent overlay may stack on a tmpfs at the same destination, so
    // every tmpfs is mounted first.
    for mode in [OverlayMode::Tmpfs, OverlayMode::Persistent] {
        for overlay in config.overlays.iter().filter(|o| o.mode == mode) {
            args.extend(overlay_args(overlay)?);
        }
    }

    push_env_args(config, host, &mut args);
    push_cwd_args(config, host, &mut args)?;

    let command = if config.command.is_empty() {
        vec![config.shell.clone()]
    } else {
        wrap_command(&config.command, &config.shell)
    };

    let plan = LaunchPlan { args, command };
    tracing::debug!("Compiled launch: {}", plan.to_shell_string());
    Ok(plan)
}

fn push_namespace_args(config: &SandboxConfig, args: &mut Vec<String>) {
    let ns = &config.namespaces;
    let process = &config.process;

    let flags = [
        (ns.user, "--unshare-user"),
        (ns.pid || process.as_pid_1, "--unshare-pid"),
        (ns.ipc, "--unshare-ipc"),
        (ns.uts, "--unshare-uts"),
        (ns.cgroup, "--unshare-cgroup"),
        (
            ns.net && config.network.mode == NetworkMode::Disabled,
            "--unshare-net",
        ),
        (ns.disable_userns, "--disable-userns"),
    ];
    args.extend(flags.iter().filter(|(on, _)| *on).map(|(_, f)| f.to_string()));

    if let Some(uid) = process.uid {
        args.extend(["--uid".to_string(), uid.to_string()]);
    }
    if let Some(gid) = process.gid {
        args.extend(["--gid".to_string(), gid.to_string()]);
    }
    if let Some(hostname) = &process.hostname {
        args.extend(["--hostname".to_string(), hostname.clone()]);
    }

    let options = [
        (process.die_with_parent, "--die-with-parent"),
        (process.new_session, "--new-session"),
        (process.as_pid_1, "--as-pid-1"),
    ];
    args.extend(options.iter().filter(|(on, _)| *on).map(|(_, f)| f.to_string()));

    for cap in &config.drop_caps {
        args.extend(["--cap-drop".to_string(), cap.clone()]);
    }
}

fn push_system_args(
    config: &SandboxConfig,
    host: &HostContext,
    args: &mut Vec<String>,
) -> Result<(), SandboxError> {
    for system in &config.system_paths {
        let path = Path::new(system.path());
        if host.exists(path) {
            args.extend(BindMount::readonly(path).to_bwrap_args());
        } else {
            tracing::debug!("Skipping missing system path {}", path.display());
        }
    }

    let fs = &config.filesystem;
    match fs.dev {
        DevMode::None => {}
        DevMode::Minimal => args.extend(["--dev".to_string(), "/dev".to_string()]),
        DevMode::Full => args.extend([
            "--dev-bind".to_string(),
            "/dev".to_string(),
            "/dev".to_string(),
        ]),
    }
    if fs.proc {
        args.extend(["--proc".to_string(), "/proc".to_string()]);
    }
    if fs.tmp {
        if let Some(size) = &fs.tmpfs_size {
            let bytes = parse_size(size).ok_or_else(|| {
                ConfigError::ValidationError(format!("invalid tmpfs size '{}'", size))
            })?;
            args.extend(["--size".to_string(), bytes.to_string()]);
        }
        args.extend(["--tmpfs".to_string(), "/tmp".to_string()]);
    }

    match config.network.mode {
        NetworkMode::Disabled => {}
        NetworkMode::Enabled => {
            for path in DNS_PATHS.iter().chain(SSL_CERT_PATHS) {
                if host.exists(Path::new(path)) {
                    args.extend(BindMount::readonly(*path).to_bwrap_args());
                }
            }
        }
        NetworkMode::Filtered | NetworkMode::Audit => {
            for path in SSL_CERT_PATHS {
                if host.exists(Path::new(path)) {
                    args.extend(BindMount::readonly(*path).to_bwrap_args());
                }
            }
            match &host.resolv_conf {
                Some(resolv) => args.extend([
                    "--ro-bind".to_string(),
                    resolv.display().to_string(),
                    RESOLV_CONF.to_string(),
                ]),
                None => {
                    if host.exists(Path::new(RESOLV_CONF)) {
                        args.extend(BindMount::readonly(RESOLV_CONF).to_bwrap_args());
                    }
                }
            }
        }
    }
    Ok(())
}

fn push_env_args(config: &SandboxConfig, host: &HostContext, args: &mut Vec<String>) {
    if config.clear_env {
        args.push("--clearenv".to_string());
        for name in &config.keep_env {
            if config.env.contains_key(name) {
                continue;
            }
            if let Some(value) = host.env.get(name) {
                args.extend(["--setenv".to_string(), name.clone(), value.clone()]);
            }
        }
    }
    for name in &config.unset_env {
        args.extend(["--unsetenv".to_string(), name.clone()]);
    }
    for (name, value) in &config.env {
        args.extend(["--setenv".to_string(), name.clone(), value.clone()]);
    }
}

fn push_cwd_args(
    config: &SandboxConfig,
    host: &HostContext,
    args: &mut Vec<String>,
) -> Result<(), SandboxError> {
    let mut chdir = config
        .process
        .chdir
        .as_deref()
        .map(normalize_absolute)
        .transpose()?;

    if config.bind_cwd {
        let cwd = normalize_absolute(&host.cwd)?;
        let taken = config
            .binds
            .iter()
            .map(|b| &b.dest)
            .chain(config.overlays.iter().map(|o| &o.dest))
            .filter_map(|d| normalize_absolute(d).ok())
            .any(|d| d == cwd);
        if taken {
            return Err(ConfigError::OverlappingMount {
                dest: cwd.display().to_string(),
                other: "the working directory bind".to_string(),
            }
            .into());
        }
        if config.network.mode.uses_namespace() && is_within(Path::new(RESOLV_CONF), &cwd) {
            return Err(ConfigError::OverlappingMount {
                dest: cwd.display().to_string(),
                other: format!("the private {}", RESOLV_CONF),
            }
            .into());
        }
        args.extend(BindMount::writable(cwd.clone()).to_bwrap_args());
        chdir.get_or_insert(cwd);
    }

    if let Some(dir) = chdir {
        args.extend(["--chdir".to_string(), dir.display().to_string()]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BindRule, MountMode, NetworkFilter, FilterMode, OverlayRule, SystemPath};

    fn host() -> HostContext {
        HostContext::fixed("/home/me/project", ["/usr", "/lib", "/etc/resolv.conf", "/etc/ssl/certs"])
    }

    fn position(args: &[String], needle: &str) -> usize {
        args.iter().position(|a| a == needle).unwrap()
    }

    fn rposition(args: &[String], needle: &str) -> usize {
        args.iter().rposition(|a| a == needle).unwrap()
    }

    #[test]
    fn test_end_to_end_ro_rw_without_network() {
        let config = SandboxConfig {
            binds: vec![BindRule::ro("/tmp/ro"), BindRule::rw("/tmp/rw")],
            command: vec!["ls".to_string()],
            ..SandboxConfig::default()
        };
        let plan = compile(&config, &host()).unwrap();

        let ro = plan.args.windows(3).position(|w| w == ["--ro-bind", "/tmp/ro", "/tmp/ro"]);
        let rw = plan.args.windows(3).position(|w| w == ["--bind", "/tmp/rw", "/tmp/rw"]);
        assert!(ro.unwrap() < rw.unwrap());

        for arg in &plan.args {
            assert!(!arg.contains("net"), "unexpected network flag {arg}");
            assert!(!arg.contains("resolv"), "unexpected network bind {arg}");
        }
        assert_eq!(plan.to_argv().last().map(String::as_str), Some("ls"));
    }

    #[test]
    fn test_duplicate_destination_fails() {
        let config = SandboxConfig {
            binds: vec![
                BindRule::ro("/data"),
                BindRule {
                    source: "/other".into(),
                    dest: "/data".into(),
                    mode: MountMode::Rw,
                },
            ],
            ..SandboxConfig::default()
        };
        assert!(matches!(
            compile(&config, &host()),
            Err(SandboxError::Config(ConfigError::DuplicateDestination(_)))
        ));
    }

    #[test]
    fn test_ordering_namespaces_binds_overlays() {
        let mut persistent = OverlayRule::persistent("/home/sandbox");
        persistent.write_dir = Some("/state/home".into());
        let config = SandboxConfig {
            binds: vec![BindRule::rw("/srv/rw"), BindRule::ro("/srv/ro")],
            overlays: vec![persistent, OverlayRule::tmpfs("/scratch")],
            system_paths: [SystemPath::Usr].into_iter().collect(),
            namespaces: crate::config::NamespaceFlags {
                user: true,
                pid: true,
                ..Default::default()
            },
            env: [("A".to_string(), "1".to_string())].into_iter().collect(),
            bind_cwd: true,
            command: vec!["true".to_string()],
            ..SandboxConfig::default()
        };
        let plan = compile(&config, &host()).unwrap();
        let args = &plan.args;

        let last_ns = position(args, "--unshare-pid");
        let first_bind = position(args, "--ro-bind");
        assert!(position(args, "--unshare-user") < first_bind);
        assert!(last_ns < first_bind);

        // System path, then user ro, then user rw.
        assert_eq!(args[first_bind + 1], "/usr");
        let user_ro = args.windows(2).position(|w| w == ["--ro-bind", "/srv/ro"]).unwrap();
        let user_rw = args.windows(2).position(|w| w == ["--bind", "/srv/rw"]).unwrap();
        assert!(user_ro < user_rw);

        let tmpfs = rposition(args, "/scratch");
        let persistent_pos = args.windows(2).position(|w| w == ["--bind", "/state/home"]).unwrap();
        assert!(user_rw < tmpfs);
        assert!(tmpfs < persistent_pos);

        let setenv = position(args, "--setenv");
        let cwd_bind = args
            .windows(2)
            .position(|w| w == ["--bind", "/home/me/project"])
            .unwrap();
        assert!(persistent_pos < setenv);
        assert!(setenv < cwd_bind);
        assert_eq!(&args[args.len() - 2..], ["--chdir", "/home/me/project"]);
    }

    #[test]
    fn test_shell_operators_wrapped_after_separator() {
        let config = SandboxConfig {
            command: vec!["echo hi | tee /tmp/out".to_string()],
            shell: "/bin/sh".to_string(),
            ..SandboxConfig::default()
        };
        let argv = compile(&config, &host()).unwrap().to_argv();
        let sep = position(&argv, "--");
        assert_eq!(&argv[sep + 1..], ["/bin/sh", "-c", "echo hi | tee /tmp/out"]);
    }

    #[test]
    fn test_dash_command_not_parsed_as_flag() {
        let config = SandboxConfig {
            command: vec!["--version".to_string()],
            ..SandboxConfig::default()
        };
        let argv = compile(&config, &host()).unwrap().to_argv();
        assert_eq!(&argv[argv.len() - 2..], ["--", "--version"]);
    }

    #[test]
    fn test_empty_command_runs_shell() {
        let plan = compile(&SandboxConfig::default(), &host()).unwrap();
        assert_eq!(plan.command, vec!["/bin/bash"]);
    }

    #[test]
    fn test_missing_system_paths_skipped() {
        let config = SandboxConfig {
            system_paths: [SystemPath::Usr, SystemPath::Lib64].into_iter().collect(),
            ..SandboxConfig::default()
        };
        let plan = compile(&config, &host()).unwrap();
        assert!(plan.args.contains(&"/usr".to_string()));
        assert!(!plan.args.contains(&"/lib64".to_string()));
    }

    #[test]
    fn test_environment_args() {
        let mut host = host();
        host.env.insert("TERM".to_string(), "xterm".to_string());
        host.env.insert("SECRET".to_string(), "x".to_string());
        let config = SandboxConfig {
            clear_env: true,
            keep_env: vec!["TERM".to_string(), "MISSING".to_string()],
            unset_env: vec!["LD_PRELOAD".to_string()],
            env: [
                ("Z".to_string(), "last".to_string()),
                ("A".to_string(), "first".to_string()),
            ]
            .into_iter()
            .collect(),
            ..SandboxConfig::default()
        };
        let plan = compile(&config, &host).unwrap();
        let start = position(&plan.args, "--clearenv");
        assert_eq!(
            &plan.args[start..],
            [
                "--clearenv", "--setenv", "TERM", "xterm", "--unsetenv", "LD_PRELOAD",
                "--setenv", "A", "first", "--setenv", "Z", "last",
            ]
        );
    }

    #[test]
    fn test_enabled_network_binds_support_files() {
        let mut config = SandboxConfig::default();
        config.network.mode = NetworkMode::Enabled;
        let plan = compile(&config, &host()).unwrap();
        assert!(plan.args.windows(3).any(|w| w == ["--ro-bind", "/etc/resolv.conf", "/etc/resolv.conf"]));
        assert!(plan.args.windows(3).any(|w| w == ["--ro-bind", "/etc/ssl/certs", "/etc/ssl/certs"]));
        assert!(!plan.args.contains(&"--unshare-net".to_string()));
    }

    #[test]
    fn test_filtered_network_uses_private_resolv_conf() {
        let mut config = SandboxConfig::default();
        config.namespaces.net = true;
        config.network.mode = NetworkMode::Filtered;
        config.network.filter = Some(NetworkFilter {
            mode: FilterMode::Whitelist,
            hosts: vec!["github.com".parse().unwrap()],
            cidrs: vec![],
        });
        let host = host().with_resolv_conf("/tmp/nsbox-net-x/resolv.conf");
        let plan = compile(&config, &host).unwrap();
        assert!(!plan.args.contains(&"--unshare-net".to_string()));
        assert!(plan
            .args
            .windows(3)
            .any(|w| w == ["--ro-bind", "/tmp/nsbox-net-x/resolv.conf", "/etc/resolv.conf"]));
    }

    #[test]
    fn test_private_resolv_conf_cannot_be_shadowed() {
        let mut config = SandboxConfig::default();
        config.network.mode = NetworkMode::Filtered;
        config.network.filter = Some(NetworkFilter {
            mode: FilterMode::Blacklist,
            hosts: vec!["badsite.com".parse().unwrap()],
            cidrs: vec![],
        });
        let host = host().with_resolv_conf("/tmp/nsbox-net-x/resolv.conf");

        let mut tmpfs_etc = config.clone();
        tmpfs_etc.overlays = vec![OverlayRule::tmpfs("/etc")];
        let mut rw_resolv = config.clone();
        rw_resolv.binds = vec![BindRule::rw("/etc/resolv.conf")];
        for shadowing in [tmpfs_etc, rw_resolv] {
            assert!(matches!(
                compile(&shadowing, &host),
                Err(SandboxError::Config(ConfigError::OverlappingMount { .. }))
            ));
        }

        let cwd_etc = SandboxConfig {
            bind_cwd: true,
            ..config.clone()
        };
        let etc_host = HostContext::fixed("/etc", Vec::<PathBuf>::new())
            .with_resolv_conf("/tmp/nsbox-net-x/resolv.conf");
        assert!(matches!(
            compile(&cwd_etc, &etc_host),
            Err(SandboxError::Config(ConfigError::OverlappingMount { .. }))
        ));

        // The private file stays the last mount at /etc/resolv.conf.
        let plan = compile(&config, &host).unwrap();
        let resolv = plan.args.iter().rposition(|a| a == "/etc/resolv.conf").unwrap();
        assert_eq!(plan.args[resolv - 1], "/tmp/nsbox-net-x/resolv.conf");
    }

    #[test]
    fn test_tmpfs_before_persistent_at_same_dest() {
        let mut persistent = OverlayRule::persistent("/data");
        persistent.write_dir = Some("/state/data".into());
        let config = SandboxConfig {
            overlays: vec![persistent, OverlayRule::tmpfs("/data")],
            ..SandboxConfig::default()
        };
        let plan = compile(&config, &host()).unwrap();
        let tmpfs = plan.args.windows(2).position(|w| w == ["--tmpfs", "/data"]).unwrap();
        let persistent = plan
            .args
            .windows(3)
            .position(|w| w == ["--bind", "/state/data", "/data"])
            .unwrap();
        assert!(tmpfs < persistent);
    }

    #[test]
    fn test_disabled_network_with_unshare() {
        let mut config = SandboxConfig::default();
        config.namespaces.net = true;
        let plan = compile(&config, &host()).unwrap();
        assert_eq!(plan.args[0], "--unshare-net");
    }

    #[test]
    fn test_cwd_conflict_rejected() {
        let config = SandboxConfig {
            binds: vec![BindRule::ro("/home/me/project")],
            bind_cwd: true,
            ..SandboxConfig::default()
        };
        assert!(matches!(
            compile(&config, &host()),
            Err(SandboxError::Config(ConfigError::OverlappingMount { .. }))
        ));
    }

    #[test]
    fn test_process_options() {
        let mut config = SandboxConfig::untrusted();
        config.overlays.clear();
        config.process.as_pid_1 = true;
        config.drop_caps = vec!["ALL".to_string()];
        config.filesystem.tmpfs_size = Some("64M".to_string());
        let plan = compile(&config, &host()).unwrap();
        let args = &plan.args;
        assert!(args.windows(2).any(|w| w == ["--uid", "1000"]));
        assert!(args.windows(2).any(|w| w == ["--hostname", "sandbox"]));
        assert!(args.windows(2).any(|w| w == ["--cap-drop", "ALL"]));
        assert!(args.windows(4).any(|w| w == ["--size", "67108864", "--tmpfs", "/tmp"]));
        assert!(args.contains(&"--as-pid-1".to_string()));
        assert!(args.contains(&"--die-with-parent".to_string()));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let config = SandboxConfig {
            binds: vec![BindRule::ro("/a"), BindRule::rw("/b")],
            env: [("X".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]
                .into_iter()
                .collect(),
            ..SandboxConfig::default()
        };
        assert_eq!(compile(&config, &host()).unwrap(), compile(&config, &host()).unwrap());
    }
}
