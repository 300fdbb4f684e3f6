//! Outer half of a filtered or audited launch.
//!
//! Everything that can fail cheaply happens here, before pasta starts:
//! dependency checks, hostname resolution, rule compilation and the
//! writability checks on the helper files. The result is a plan file that
//! `nsbox netns-init` executes inside pasta's namespace.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use rand::Rng;
use tempfile::TempDir;
use tokio::process::Command;

use crate::config::{FilterMode, NetworkMode, NetworkSettings, SandboxConfig};
use crate::error::{ConfigError, SandboxError};
use crate::network::audit::AuditSummary;
use crate::network::dns::{host_upstream, PROXY_RESOLV_CONF};
use crate::network::firewall::{compile as compile_rules, resolve_hosts, CompiledRuleSet, Iptables};
use crate::network::netns::{current_netns, CapDrop};
use crate::network::orchestrator::{DnsPlan, NetnsPlan};
use crate::sandbox::{compile, HostContext, SandboxDependencyCheck};
use crate::utils::{
    exit_code_from_status, is_debug_enabled, is_within, join_args, resolve_existing,
    shutdown_signal, terminate_pid,
};

pub const PASTA: &str = "pasta";

/// Plan file inside a launch workdir. Locked by the launcher while it runs.
pub const PLAN_FILE: &str = "plan.json";
/// Workdir file naming the capture of an audit launch.
pub const CAPTURE_FILE: &str = "capture";

/// Prefix of the private directory holding the plan and resolv.conf.
pub fn workdir_prefix(mode: NetworkMode) -> &'static str {
    match mode {
        NetworkMode::Audit => "nsbox-audit-",
        _ => "nsbox-net-",
    }
}

/// pasta options, without the `--` and the command.
pub fn pasta_args(settings: &NetworkSettings, pcap: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = ["--config-net", "--foreground", "--quiet"]
        .into_iter()
        .map(String::from)
        .collect();
    if let Some(pcap) = pcap {
        // Spliced connections bypass the tap device and would not be captured.
        args.push("--no-splice".to_string());
        args.extend(["--pcap".to_string(), pcap.display().to_string()]);
    }
    for port in &settings.ports.expose {
        args.extend(["-t".to_string(), port.to_string()]);
    }
    for port in &settings.ports.host {
        args.extend(["-T".to_string(), port.to_string()]);
    }
    args
}

/// Full pasta argv running `self_exe netns-init --plan PLAN` in the namespace.
pub fn pasta_argv(
    settings: &NetworkSettings,
    pcap: Option<&Path>,
    self_exe: &Path,
    plan: &Path,
    debug: bool,
) -> Vec<String> {
    let mut argv = vec![PASTA.to_string()];
    argv.extend(pasta_args(settings, pcap));
    argv.push("--".to_string());
    argv.push(self_exe.display().to_string());
    if debug {
        argv.push("-d".to_string());
    }
    argv.extend([
        "netns-init".to_string(),
        "--plan".to_string(),
        plan.display().to_string(),
    ]);
    argv
}

/// Default capture location for audit runs.
fn default_pcap_path() -> PathBuf {
    let suffix: u32 = rand::thread_rng().gen();
    std::env::temp_dir().join(format!("nsbox-audit-{:08x}.pcap", suffix))
}

/// A written plan ready to hand to pasta.
pub struct PreparedLaunch {
    /// Removed when dropped.
    pub workdir: TempDir,
    pub plan_path: PathBuf,
    pub plan: NetnsPlan,
    pub pcap: Option<PathBuf>,
}

/// Host files that must stay read-only inside the sandbox.
fn check_not_writable(
    config: &SandboxConfig,
    host: &HostContext,
    paths: &[&Path],
) -> Result<(), SandboxError> {
    let cwd = resolve_existing(&host.cwd);
    for path in paths {
        let covered = config.exposes_writable(path)
            || (config.bind_cwd && is_within(&resolve_existing(path), &cwd));
        if covered {
            return Err(ConfigError::ValidationError(format!(
                "'{}' would be writable inside the sandbox",
                path.display()
            ))
            .into());
        }
    }
    Ok(())
}

/// Resolve, compile and write everything the inner process needs.
pub async fn prepare(
    config: &SandboxConfig,
    host: HostContext,
    self_exe: &Path,
) -> Result<PreparedLaunch, SandboxError> {
    let settings = &config.network;
    if !settings.mode.uses_namespace() {
        return Err(SandboxError::LaunchFailed(format!(
            "network mode {:?} does not use a namespace",
            settings.mode
        )));
    }
    config.validate()?;

    let mut deps = SandboxDependencyCheck::default();
    deps.require(crate::sandbox::BWRAP, "install the bubblewrap package")
        .require(PASTA, "install the passt package");
    deps.into_result()?;
    let cap_drop = CapDrop::detect()?;

    let workdir = tempfile::Builder::new()
        .prefix(workdir_prefix(settings.mode))
        .tempdir()?;
    let resolv_conf = workdir.path().join("resolv.conf");
    std::fs::write(&resolv_conf, PROXY_RESOLV_CONF)?;
    check_not_writable(config, &host, &[self_exe, workdir.path()])?;

    let upstream = match settings.upstream_dns {
        Some(ip) => ip,
        None => host_upstream()?,
    };

    let (rules, dns) = match &settings.filter {
        Some(filter) => {
            let resolved = resolve_hosts(filter).await?;
            let rules = compile_rules(filter, &resolved, Some(upstream));
            let dns = DnsPlan {
                mode: filter.mode,
                hosts: filter.hosts.clone(),
                upstream,
            };
            (rules, dns)
        }
        // Audit without a filter: the proxy forwards everything.
        None => (
            CompiledRuleSet::default(),
            DnsPlan {
                mode: FilterMode::Blacklist,
                hosts: Vec::new(),
                upstream,
            },
        ),
    };
    tracing::debug!("Firewall rules:\n{}", rules);

    let iptables = if rules.is_empty() {
        None
    } else {
        let iptables = Iptables::detect()?;
        iptables.check_rules(&rules)?;
        Some(iptables)
    };

    let launch = compile(config, &host.with_resolv_conf(&resolv_conf))?;

    let plan = NetnsPlan {
        host_netns: current_netns(),
        dns: Some(dns),
        rules,
        iptables,
        cap_drop,
        command: launch.to_argv(),
    };
    let plan_path = workdir.path().join(PLAN_FILE);
    plan.save(&plan_path)?;

    let pcap = (settings.mode == NetworkMode::Audit)
        .then(|| settings.pcap_path.clone().unwrap_or_else(default_pcap_path));
    if let Some(pcap) = &pcap {
        std::fs::write(workdir.path().join(CAPTURE_FILE), pcap.display().to_string())?;
    }

    Ok(PreparedLaunch {
        workdir,
        plan_path,
        plan,
        pcap,
    })
}

/// Run a prepared launch under pasta and return the command's exit code.
pub async fn execute(
    config: &SandboxConfig,
    prepared: PreparedLaunch,
    self_exe: &Path,
) -> Result<i32, SandboxError> {
    let argv = pasta_argv(
        &config.network,
        prepared.pcap.as_deref(),
        self_exe,
        &prepared.plan_path,
        is_debug_enabled(),
    );
    tracing::debug!("Starting: {}", argv.join(" "));
    let _running = hold_launch_lock(prepared.workdir.path())?;

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::inherit())
        .spawn()
        .map_err(|e| SandboxError::LaunchFailed(format!("{}: {}", PASTA, e)))?;

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = shutdown_signal() => {
            if let Some(pid) = child.id() {
                terminate_pid(pid);
            }
            child.wait().await?
        }
    };
    let code = exit_code_from_status(status);
    tracing::debug!("pasta exited with {}", code);

    if let Some(pcap) = &prepared.pcap {
        match AuditSummary::from_file(pcap) {
            Ok(summary) => eprint!("{}", summary.render(Some(pcap))),
            Err(e) => tracing::warn!("Could not read capture {}: {}", pcap.display(), e),
        }
    }
    drop(prepared.workdir);
    Ok(code)
}

/// Lock a launch workdir for as long as the returned file is open.
pub fn hold_launch_lock(workdir: &Path) -> Result<File, SandboxError> {
    let file = File::open(workdir.join(PLAN_FILE))?;
    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
        .map_err(|e| SandboxError::Io(e.into()))?;
    Ok(file)
}

/// Whether a launcher currently holds the lock on `workdir`.
pub fn launch_in_progress(workdir: &Path) -> bool {
    let Ok(file) = File::open(workdir.join(PLAN_FILE)) else {
        return false;
    };
    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => false,
        Err(Errno::EWOULDBLOCK) => true,
        Err(e) => {
            tracing::debug!("Cannot check lock in {}: {}", workdir.display(), e);
            false
        }
    }
}

/// Capture file written by the launch in `workdir`, if any.
pub fn launch_capture(workdir: &Path) -> Option<PathBuf> {
    std::fs::read_to_string(workdir.join(CAPTURE_FILE))
        .ok()
        .map(|s| PathBuf::from(s.trim()))
}

/// What a namespace launch would run, without resolving hosts or writing
/// anything: the pasta command line, then the capability-dropped bubblewrap
/// command run inside it. Paths under the private workdir are placeholders.
pub fn dry_run_lines(
    config: &SandboxConfig,
    host: &HostContext,
    self_exe: &Path,
) -> Result<Vec<String>, SandboxError> {
    let settings = &config.network;
    let workdir = std::env::temp_dir().join(format!("{}XXXXXX", workdir_prefix(settings.mode)));
    let launch = compile(config, &host.clone().with_resolv_conf(workdir.join("resolv.conf")))?;
    let pcap = (settings.mode == NetworkMode::Audit).then(|| {
        settings
            .pcap_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("nsbox-audit-XXXXXXXX.pcap"))
    });

    let outer = pasta_argv(
        settings,
        pcap.as_deref(),
        self_exe,
        &workdir.join(PLAN_FILE),
        is_debug_enabled(),
    );
    let mut inner = CapDrop::detect()
        .unwrap_or_else(|_| CapDrop::Setpriv(PathBuf::from("setpriv")))
        .prefix();
    inner.extend(launch.to_argv());
    Ok(vec![join_args(&outer), join_args(&inner)])
}

/// Launch `config` in its own network namespace.
pub async fn run_in_namespace(config: &SandboxConfig, host: HostContext) -> Result<i32, SandboxError> {
    let self_exe = std::env::current_exe()?;
    let prepared = prepare(config, host, &self_exe).await?;
    execute(config, prepared, &self_exe).await
}
