//! The real side effects of a filtered launch, run inside pasta's namespace.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::SandboxError;
use crate::network::dns::{DnsProxy, ProxyHandle};
use crate::network::firewall::{CompiledRuleSet, Iptables};
use crate::network::orchestrator::{
    DnsPlan, NetnsBackend, NetnsPlan, Orchestrator, Unprivileged, PROXY_LISTEN,
};
use crate::utils::{exit_code_from_status, find_in_path, is_executable, shutdown_signal, terminate_pid};

/// Tool used to remove CAP_NET_ADMIN from the command's bounding set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "path", rename_all = "lowercase")]
pub enum CapDrop {
    Setpriv(PathBuf),
    Capsh(PathBuf),
}

impl CapDrop {
    /// Prefer setpriv from util-linux, fall back to capsh from libcap.
    pub fn detect() -> Result<Self, SandboxError> {
        if let Some(path) = find_in_path("setpriv") {
            return Ok(CapDrop::Setpriv(path));
        }
        if let Some(path) = find_in_path("capsh") {
            return Ok(CapDrop::Capsh(path));
        }
        Err(SandboxError::missing(
            "setpriv",
            "install util-linux (setpriv) or libcap (capsh)",
        ))
    }

    pub fn path(&self) -> &Path {
        match self {
            CapDrop::Setpriv(p) | CapDrop::Capsh(p) => p,
        }
    }

    /// Arguments placed before the command.
    pub fn prefix(&self) -> Vec<String> {
        let program = self.path().display().to_string();
        match self {
            CapDrop::Setpriv(_) => vec![
                program,
                "--inh-caps=-net_admin".into(),
                "--ambient-caps=-net_admin".into(),
                "--bounding-set=-net_admin".into(),
                "--".into(),
            ],
            CapDrop::Capsh(_) => vec![
                program,
                "--drop=cap_net_admin".into(),
                "--".into(),
                "-c".into(),
                "exec \"$@\"".into(),
                "--".into(),
            ],
        }
    }
}

/// Inode of the current network namespace.
pub fn current_netns() -> Option<u64> {
    std::fs::metadata("/proc/self/ns/net").map(|m| m.ino()).ok()
}

/// Backend that runs iptables, binds the real proxy and spawns bubblewrap.
pub struct SystemBackend {
    host_netns: Option<u64>,
    iptables: Option<Iptables>,
    cap_drop: CapDrop,
    child: Option<Child>,
}

impl SystemBackend {
    pub fn new(plan: &NetnsPlan) -> Self {
        Self {
            host_netns: plan.host_netns,
            iptables: plan.iptables.clone(),
            cap_drop: plan.cap_drop.clone(),
            child: None,
        }
    }
}

impl NetnsBackend for SystemBackend {
    async fn namespace_up(&mut self) -> Result<(), SandboxError> {
        let current = current_netns();
        if current.is_some() && current == self.host_netns {
            return Err(SandboxError::LaunchFailed(
                "still in the host network namespace".to_string(),
            ));
        }
        Ok(())
    }

    async fn start_proxy(
        &mut self,
        dns: &DnsPlan,
        token: CancellationToken,
    ) -> Result<ProxyHandle, SandboxError> {
        let proxy = DnsProxy::bind(PROXY_LISTEN, dns.filter(), dns.upstream_addr()).await?;
        Ok(proxy.start(token))
    }

    async fn apply_rules(&mut self, rules: &CompiledRuleSet) -> Result<(), SandboxError> {
        if rules.is_empty() {
            return Ok(());
        }
        let iptables = self
            .iptables
            .as_ref()
            .ok_or_else(|| SandboxError::missing("iptables", "install iptables or iptables-nft"))?;

        for argv in iptables.commands(rules)? {
            tracing::debug!("Applying: {}", argv.join(" "));
            let output = Command::new(&argv[0])
                .args(&argv[1..])
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| SandboxError::LaunchFailed(format!("{}: {}", argv[0], e)))?;
            if !output.status.success() {
                return Err(SandboxError::CommandFailed(format!(
                    "`{}`: {}",
                    argv.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        Ok(())
    }

    async fn drop_capabilities(&mut self) -> Result<Vec<String>, SandboxError> {
        if !is_executable(self.cap_drop.path()) {
            return Err(SandboxError::missing(
                self.cap_drop.path().display().to_string(),
                "capability drop tool disappeared",
            ));
        }
        Ok(self.cap_drop.prefix())
    }

    async fn spawn(&mut self, launch: &Unprivileged, argv: &[String]) -> Result<(), SandboxError> {
        let argv = launch.command(argv);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::LaunchFailed("empty command".to_string()))?;
        let child = Command::new(program)
            .args(args)
            .spawn()
            .map_err(|e| SandboxError::LaunchFailed(format!("{}: {}", program, e)))?;
        self.child = Some(child);
        Ok(())
    }

    async fn wait(&mut self) -> Result<i32, SandboxError> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| SandboxError::LaunchFailed("no command running".to_string()))?;
        let status = child.wait().await?;
        Ok(exit_code_from_status(status))
    }

    async fn interrupt(&mut self) {
        if let Some(pid) = self.child.as_ref().and_then(Child::id) {
            terminate_pid(pid);
        }
    }

    async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Failed to kill command: {}", e);
            }
        }
    }
}

/// Entry point of the hidden `netns-init` subcommand.
pub async fn netns_init(plan_path: &Path) -> Result<i32, SandboxError> {
    let plan = NetnsPlan::load(plan_path)?;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let mut orchestrator = Orchestrator::new(SystemBackend::new(&plan));
    let result = orchestrator.run(&plan, cancel).await;
    signals.abort();
    result
}
