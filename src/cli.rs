//! CLI parsing and profile overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{BindRule, FilterMode, NetworkFilter, NetworkMode, SandboxConfig, BUILTIN_PROFILE};
use crate::error::{ConfigError, SandboxError};
use crate::lifecycle::Registration;
use crate::network::HostPattern;
use crate::utils::expand_home;

/// nsbox - run programs in bubblewrap sandboxes with optional filtered networking
#[derive(Parser, Debug)]
#[command(name = "nsbox")]
#[command(about = "Run programs in bubblewrap sandboxes with filtered networking and persistent overlays")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command in a sandbox
    Run(RunArgs),

    /// Install a wrapper in the bin directory for a program inside a sandbox
    Install(InstallArgs),

    /// Remove a sandbox, its wrappers and its overlay data
    Uninstall {
        /// Sandbox name
        name: String,
    },

    /// List sandboxes and orphaned sandbox directories
    List,

    /// Remove leftover temporary directories and captures
    Clean,

    /// Run inside the network namespace created by pasta
    #[command(name = "netns-init", hide = true)]
    NetnsInit {
        #[arg(long)]
        plan: PathBuf,
    },
}

/// Network mode override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NetworkArg {
    Disabled,
    Enabled,
    Filtered,
    Audit,
}

impl From<NetworkArg> for NetworkMode {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Disabled => NetworkMode::Disabled,
            NetworkArg::Enabled => NetworkMode::Enabled,
            NetworkArg::Filtered => NetworkMode::Filtered,
            NetworkArg::Audit => NetworkMode::Audit,
        }
    }
}

/// Options shared by `run` and `install` that end up in wrapper scripts.
#[derive(Args, Debug, Clone, Default)]
pub struct ExtraArgs {
    /// Bind a host path read-write at the same location
    #[arg(long = "bind", value_name = "PATH")]
    pub binds: Vec<PathBuf>,

    /// Set an environment variable inside the sandbox
    #[arg(long = "bind-env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
}

impl ExtraArgs {
    /// Parsed `--bind-env` values.
    pub fn env_map(&self) -> Result<BTreeMap<String, String>, SandboxError> {
        self.env
            .iter()
            .map(|spec| match spec.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
                _ => Err(ConfigError::ValidationError(format!(
                    "--bind-env expects KEY=VALUE, got '{}'",
                    spec
                ))
                .into()),
            })
            .collect()
    }

    /// `--bind` values as absolute paths.
    pub fn absolute_binds(&self, cwd: &Path) -> Vec<PathBuf> {
        self.binds.iter().map(|p| absolute(p, cwd)).collect()
    }

    pub fn registration(&self, profile: &str, cwd: &Path) -> Result<Registration, SandboxError> {
        Ok(Registration {
            profile: profile.to_string(),
            extra_binds: self.absolute_binds(cwd),
            extra_env: self.env_map()?,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Profile name or path to a profile JSON file
    #[arg(short = 'p', long, default_value = BUILTIN_PROFILE)]
    pub profile: String,

    /// Named sandbox whose overlays hold persistent state
    #[arg(short = 's', long)]
    pub sandbox: Option<String>,

    /// Bind the current directory read-write and start there
    #[arg(long)]
    pub bind_cwd: bool,

    /// Bind a host path read-only at the same location
    #[arg(long = "ro-bind", value_name = "PATH")]
    pub ro_binds: Vec<PathBuf>,

    #[command(flatten)]
    pub extra: ExtraArgs,

    /// Network mode
    #[arg(long, value_enum)]
    pub network: Option<NetworkArg>,

    /// Allow only these hosts (implies filtered networking)
    #[arg(long = "allow", value_name = "HOST", conflicts_with = "block")]
    pub allow: Vec<String>,

    /// Block these hosts (implies filtered networking)
    #[arg(long = "block", value_name = "HOST")]
    pub block: Vec<String>,

    /// Where audit mode writes its capture
    #[arg(long)]
    pub pcap: Option<PathBuf>,

    /// Print the launch command instead of running it
    #[arg(long)]
    pub dry_run: bool,

    /// Command and arguments to run (defaults to the profile's shell)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Apply command line overrides on top of a loaded profile.
    pub fn apply(&self, config: &mut SandboxConfig, cwd: &Path) -> Result<(), SandboxError> {
        for path in &self.ro_binds {
            config.binds.push(BindRule::ro(absolute(path, cwd)));
        }
        for path in self.extra.absolute_binds(cwd) {
            config.binds.push(BindRule::rw(path));
        }
        config.env.extend(self.extra.env_map()?);
        config.bind_cwd |= self.bind_cwd;

        self.apply_network(config)?;
        if let Some(pcap) = &self.pcap {
            config.network.pcap_path = Some(absolute(pcap, cwd));
        }

        let command = match self.command.first().map(String::as_str) {
            Some("--") => &self.command[1..],
            _ => &self.command[..],
        };
        config.command = command.to_vec();
        Ok(())
    }

    fn apply_network(&self, config: &mut SandboxConfig) -> Result<(), SandboxError> {
        let parse = |hosts: &[String]| -> Result<Vec<HostPattern>, ConfigError> {
            hosts.iter().map(|h| HostPattern::parse(h)).collect()
        };

        if !self.allow.is_empty() {
            config.network.filter = Some(NetworkFilter {
                mode: FilterMode::Whitelist,
                hosts: parse(&self.allow)?,
                cidrs: Vec::new(),
            });
        } else if !self.block.is_empty() {
            let hosts = parse(&self.block)?;
            match &mut config.network.filter {
                Some(filter) if filter.mode == FilterMode::Blacklist => filter.hosts.extend(hosts),
                _ => {
                    config.network.filter = Some(NetworkFilter {
                        mode: FilterMode::Blacklist,
                        hosts,
                        cidrs: Vec::new(),
                    })
                }
            }
        }

        let filtered = !self.allow.is_empty() || !self.block.is_empty();
        let mode = match (self.network, filtered) {
            (Some(arg), _) => NetworkMode::from(arg),
            (None, true) if !config.network.mode.uses_namespace() => NetworkMode::Filtered,
            (None, _) => config.network.mode,
        };
        if mode != NetworkMode::Disabled {
            // Network access comes from the host or from pasta, never from a bare unshare.
            config.namespaces.net = false;
        }
        config.network.mode = mode;
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct InstallArgs {
    /// Sandbox name
    pub name: String,

    /// Profile the wrapper runs with (defaults to the recorded one)
    #[arg(short = 'p', long)]
    pub profile: Option<String>,

    #[command(flatten)]
    pub extra: ExtraArgs,

    /// In-sandbox path of the program; prompts when omitted and several exist
    #[arg(long)]
    pub binary: Option<PathBuf>,
}

fn absolute(path: &Path, cwd: &Path) -> PathBuf {
    let expanded = PathBuf::from(expand_home(&path.display().to_string()));
    if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    }
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
