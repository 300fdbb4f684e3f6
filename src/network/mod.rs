//! Network isolation: host patterns, firewall rules, the DNS proxy and the
//! namespace launch built on pasta.

pub mod audit;
pub mod dns;
pub mod filter;
pub mod firewall;
pub mod netns;
pub mod orchestrator;
pub mod pasta;

pub use audit::{format_bytes, AuditSummary};
pub use filter::{HostDecision, HostFilter, HostPattern, IpCidr, PatternKind};
pub use firewall::{compile as compile_rules, resolve_hosts, CompiledRuleSet, Iptables, ResolvedHosts, Rule};
pub use netns::{netns_init, CapDrop};
pub use orchestrator::{NetnsBackend, NetnsPlan, NetnsState, Orchestrator};
pub use pasta::{dry_run_lines, run_in_namespace};
