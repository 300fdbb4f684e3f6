//! Ordered bring-up and teardown of a filtered network launch.
//!
//! Runs inside the namespace pasta created. The sequence is
//! `Created → NamespaceUp → ProxyStarted → RulesApplied → CapabilityDropped →
//! CommandRunning → Exited`, strictly in that order. Any failure or interrupt
//! jumps to teardown: the proxy is stopped, a running command is killed and
//! `Exited` is recorded.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::FilterMode;
use crate::error::SandboxError;
use crate::network::dns::ProxyHandle;
use crate::network::filter::{HostFilter, HostPattern};
use crate::network::firewall::{CompiledRuleSet, Iptables};
use crate::network::netns::CapDrop;

/// Where the DNS proxy listens inside the namespace.
pub const PROXY_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53);

/// How long an interrupted command gets to exit before it is killed.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// Hostname policy handed to the DNS proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsPlan {
    pub mode: FilterMode,
    pub hosts: Vec<HostPattern>,
    pub upstream: IpAddr,
}

impl DnsPlan {
    pub fn filter(&self) -> HostFilter {
        HostFilter::new(self.mode, self.hosts.clone())
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        SocketAddr::new(self.upstream, 53)
    }
}

/// Everything the inner process needs, written by the outer process as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetnsPlan {
    /// Inode of the launching process's network namespace.
    pub host_netns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsPlan>,
    pub rules: CompiledRuleSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iptables: Option<Iptables>,
    pub cap_drop: CapDrop,
    /// Full bubblewrap argv.
    pub command: Vec<String>,
}

impl NetnsPlan {
    pub fn load(path: &Path) -> Result<Self, SandboxError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| SandboxError::LaunchFailed(format!("invalid plan {}: {}", path.display(), e)))
    }

    /// Write the plan next to its final path and rename it into place.
    pub fn save(&self, path: &Path) -> Result<(), SandboxError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SandboxError::LaunchFailed(format!("failed to encode plan: {}", e)))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, json.as_bytes())?;
        tmp.persist(path).map_err(|e| SandboxError::Io(e.error))?;
        Ok(())
    }
}

/// Progress of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetnsState {
    Created,
    NamespaceUp,
    ProxyStarted,
    RulesApplied,
    CapabilityDropped,
    CommandRunning,
    Exited,
}

impl fmt::Display for NetnsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Proof that the capability drop step ran. Only the orchestrator creates
/// one, and commands can only be spawned through it.
#[derive(Debug)]
pub struct Unprivileged {
    prefix: Vec<String>,
}

impl Unprivileged {
    /// `argv` prefixed with the capability dropping wrapper.
    pub fn command(&self, argv: &[String]) -> Vec<String> {
        self.prefix.iter().chain(argv).cloned().collect()
    }
}

/// The side effects of each step.
#[allow(async_fn_in_trait)]
pub trait NetnsBackend {
    /// Confirm the process is inside the new namespace.
    async fn namespace_up(&mut self) -> Result<(), SandboxError>;

    /// Bind and start the DNS proxy.
    async fn start_proxy(
        &mut self,
        dns: &DnsPlan,
        token: CancellationToken,
    ) -> Result<ProxyHandle, SandboxError>;

    /// Install packet filter rules. Called even for an empty rule set.
    async fn apply_rules(&mut self, rules: &CompiledRuleSet) -> Result<(), SandboxError>;

    /// Return the exec prefix that drops CAP_NET_ADMIN.
    async fn drop_capabilities(&mut self) -> Result<Vec<String>, SandboxError>;

    async fn spawn(&mut self, launch: &Unprivileged, argv: &[String]) -> Result<(), SandboxError>;

    /// Wait for the command and return its exit code.
    async fn wait(&mut self) -> Result<i32, SandboxError>;

    /// Ask the command to stop.
    async fn interrupt(&mut self);

    /// Stop the command unconditionally.
    async fn kill(&mut self);
}

/// Drives a backend through the launch sequence.
pub struct Orchestrator<B> {
    backend: B,
    states: Vec<NetnsState>,
}

impl<B: NetnsBackend> Orchestrator<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            states: vec![NetnsState::Created],
        }
    }

    /// Every state reached so far, in order.
    pub fn states(&self) -> &[NetnsState] {
        &self.states
    }

    pub fn state(&self) -> NetnsState {
        self.states.last().copied().unwrap_or(NetnsState::Created)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn advance(&mut self, state: NetnsState) {
        tracing::debug!("netns: {} -> {}", self.state(), state);
        self.states.push(state);
    }

    /// Run the plan to completion and return the command's exit code.
    pub async fn run(
        &mut self,
        plan: &NetnsPlan,
        cancel: CancellationToken,
    ) -> Result<i32, SandboxError> {
        let mut proxy: Option<ProxyHandle> = None;
        let mut running = false;

        let result = self.drive(plan, &cancel, &mut proxy, &mut running).await;

        if let Err(e) = &result {
            tracing::debug!("netns: tearing down after error: {}", e);
            if running {
                self.backend.kill().await;
                if let Err(e) = self.backend.wait().await {
                    tracing::debug!("netns: reaping command failed: {}", e);
                }
            }
        }
        if let Some(proxy) = proxy.take() {
            proxy.stop().await;
        }
        self.advance(NetnsState::Exited);
        result
    }

    async fn drive(
        &mut self,
        plan: &NetnsPlan,
        cancel: &CancellationToken,
        proxy: &mut Option<ProxyHandle>,
        running: &mut bool,
    ) -> Result<i32, SandboxError> {
        self.backend.namespace_up().await?;
        self.advance(NetnsState::NamespaceUp);
        check_cancelled(cancel)?;

        if let Some(dns) = &plan.dns {
            *proxy = Some(self.backend.start_proxy(dns, cancel.child_token()).await?);
            self.advance(NetnsState::ProxyStarted);
            check_cancelled(cancel)?;
        }

        self.backend.apply_rules(&plan.rules).await?;
        self.advance(NetnsState::RulesApplied);
        check_cancelled(cancel)?;

        let launch = Unprivileged {
            prefix: self.backend.drop_capabilities().await?,
        };
        self.advance(NetnsState::CapabilityDropped);
        check_cancelled(cancel)?;

        self.backend.spawn(&launch, &plan.command).await?;
        *running = true;
        self.advance(NetnsState::CommandRunning);

        let code = tokio::select! {
            code = self.backend.wait() => code?,
            _ = cancel.cancelled() => {
                tracing::debug!("netns: interrupted, stopping command");
                self.backend.interrupt().await;
                match tokio::time::timeout(INTERRUPT_GRACE, self.backend.wait()).await {
                    Ok(code) => code?,
                    Err(_) => {
                        self.backend.kill().await;
                        self.backend.wait().await?
                    }
                }
            }
        };
        *running = false;
        Ok(code)
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), SandboxError> {
    if cancel.is_cancelled() {
        return Err(SandboxError::LaunchFailed(
            "interrupted before the command started".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dns::DnsProxy;
    use std::path::PathBuf;
    use NetnsState::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        Namespace,
        Proxy,
        Rules,
        Drop,
        Spawn,
        Wait,
    }

    #[derive(Default)]
    struct FakeBackend {
        fail_at: Option<Step>,
        calls: Vec<&'static str>,
        spawned: Option<Vec<String>>,
        exit_code: i32,
        /// Command never exits on its own.
        hangs: bool,
        /// Command ignores interrupts.
        stubborn: bool,
        interrupted: bool,
        killed: bool,
    }

    impl FakeBackend {
        fn step(&mut self, step: Step, name: &'static str) -> Result<(), SandboxError> {
            self.calls.push(name);
            if self.fail_at == Some(step) {
                return Err(SandboxError::LaunchFailed(format!("{} failed", name)));
            }
            Ok(())
        }
    }

    impl NetnsBackend for FakeBackend {
        async fn namespace_up(&mut self) -> Result<(), SandboxError> {
            self.step(Step::Namespace, "namespace")
        }

        async fn start_proxy(
            &mut self,
            dns: &DnsPlan,
            token: CancellationToken,
        ) -> Result<ProxyHandle, SandboxError> {
            self.step(Step::Proxy, "proxy")?;
            let proxy = DnsProxy::bind("127.0.0.1:0".parse().unwrap(), dns.filter(), dns.upstream_addr()).await?;
            Ok(proxy.start(token))
        }

        async fn apply_rules(&mut self, _rules: &CompiledRuleSet) -> Result<(), SandboxError> {
            self.step(Step::Rules, "rules")
        }

        async fn drop_capabilities(&mut self) -> Result<Vec<String>, SandboxError> {
            self.step(Step::Drop, "drop")?;
            Ok(vec!["setpriv".to_string(), "--bounding-set=-net_admin".to_string(), "--".to_string()])
        }

        async fn spawn(&mut self, launch: &Unprivileged, argv: &[String]) -> Result<(), SandboxError> {
            self.step(Step::Spawn, "spawn")?;
            self.spawned = Some(launch.command(argv));
            Ok(())
        }

        async fn wait(&mut self) -> Result<i32, SandboxError> {
            self.calls.push("wait");
            if self.fail_at == Some(Step::Wait) {
                return Err(SandboxError::LaunchFailed("wait failed".to_string()));
            }
            let exits = !self.hangs || self.killed || (self.interrupted && !self.stubborn);
            if !exits {
                std::future::pending::<()>().await;
            }
            Ok(if self.killed { 137 } else if self.interrupted { 143 } else { self.exit_code })
        }

        async fn interrupt(&mut self) {
            self.calls.push("interrupt");
            self.interrupted = true;
        }

        async fn kill(&mut self) {
            self.calls.push("kill");
            self.killed = true;
        }
    }

    fn plan(with_dns: bool) -> NetnsPlan {
        NetnsPlan {
            host_netns: None,
            dns: with_dns.then(|| DnsPlan {
                mode: FilterMode::Whitelist,
                hosts: vec!["github.com".parse().unwrap()],
                upstream: "127.0.0.1".parse().unwrap(),
            }),
            rules: CompiledRuleSet::default(),
            iptables: None,
            cap_drop: CapDrop::Setpriv(PathBuf::from("/usr/bin/setpriv")),
            command: vec!["bwrap".to_string(), "--".to_string(), "true".to_string()],
        }
    }

    #[tokio::test]
    async fn test_full_sequence() {
        let mut orch = Orchestrator::new(FakeBackend {
            exit_code: 3,
            ..Default::default()
        });
        let code = orch.run(&plan(true), CancellationToken::new()).await.unwrap();
        assert_eq!(code, 3);
        assert_eq!(
            orch.states(),
            &[Created, NamespaceUp, ProxyStarted, RulesApplied, CapabilityDropped, CommandRunning, Exited]
        );
        assert_eq!(
            orch.backend().calls,
            vec!["namespace", "proxy", "rules", "drop", "spawn", "wait"]
        );
        let spawned = orch.backend().spawned.clone().unwrap();
        assert_eq!(spawned[0], "setpriv");
        assert_eq!(spawned[3], "bwrap");
    }

    #[tokio::test]
    async fn test_proxy_skipped_without_dns() {
        let mut orch = Orchestrator::new(FakeBackend::default());
        orch.run(&plan(false), CancellationToken::new()).await.unwrap();
        assert_eq!(
            orch.states(),
            &[Created, NamespaceUp, RulesApplied, CapabilityDropped, CommandRunning, Exited]
        );
    }

    #[tokio::test]
    async fn test_failure_at_each_step_stops_before_command() {
        let cases = [
            (Step::Namespace, vec![Created, Exited]),
            (Step::Proxy, vec![Created, NamespaceUp, Exited]),
            (Step::Rules, vec![Created, NamespaceUp, ProxyStarted, Exited]),
            (Step::Drop, vec![Created, NamespaceUp, ProxyStarted, RulesApplied, Exited]),
            (
                Step::Spawn,
                vec![Created, NamespaceUp, ProxyStarted, RulesApplied, CapabilityDropped, Exited],
            ),
        ];
        for (step, expected) in cases {
            let mut orch = Orchestrator::new(FakeBackend {
                fail_at: Some(step),
                ..Default::default()
            });
            let result = orch.run(&plan(true), CancellationToken::new()).await;
            assert!(matches!(result, Err(SandboxError::LaunchFailed(_))), "{:?}", step);
            assert_eq!(orch.states(), expected.as_slice(), "{:?}", step);
            assert!(orch.backend().spawned.is_none(), "{:?}", step);
            assert!(!orch.backend().calls.contains(&"kill"), "{:?}", step);
        }
    }

    #[tokio::test]
    async fn test_wait_failure_kills_command() {
        let mut orch = Orchestrator::new(FakeBackend {
            fail_at: Some(Step::Wait),
            ..Default::default()
        });
        assert!(orch.run(&plan(false), CancellationToken::new()).await.is_err());
        assert_eq!(orch.state(), Exited);
        assert!(orch.backend().killed);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut orch = Orchestrator::new(FakeBackend::default());
        assert!(orch.run(&plan(true), cancel).await.is_err());
        assert_eq!(orch.states(), &[Created, NamespaceUp, Exited]);
        assert!(orch.backend().spawned.is_none());
    }

    #[tokio::test]
    async fn test_interrupt_forwarded_to_command() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let mut orch = Orchestrator::new(FakeBackend {
            hangs: true,
            ..Default::default()
        });
        let code = orch.run(&plan(true), cancel).await.unwrap();
        assert_eq!(code, 143);
        assert!(orch.backend().interrupted);
        assert!(!orch.backend().killed);
        assert_eq!(orch.state(), Exited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_command_killed_after_grace() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let mut orch = Orchestrator::new(FakeBackend {
            hangs: true,
            stubborn: true,
            ..Default::default()
        });
        let code = orch.run(&plan(false), cancel).await.unwrap();
        assert_eq!(code, 137);
        let calls = &orch.backend().calls;
        let interrupt = calls.iter().position(|c| *c == "interrupt").unwrap();
        let kill = calls.iter().position(|c| *c == "kill").unwrap();
        assert!(interrupt < kill);
    }

    #[test]
    fn test_plan_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let original = plan(true);
        original.save(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"capDrop\""));
        assert!(content.contains("\"github.com\""));
        assert_eq!(NetnsPlan::load(&path).unwrap(), original);
    }
}
