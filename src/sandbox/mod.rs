//! Bubblewrap launch compilation and external tool checks.

pub mod bwrap;
pub mod mounts;

use crate::error::SandboxError;
use crate::utils::{exit_code_from_status, find_in_path, shutdown_signal, terminate_pid};

pub use bwrap::{compile, HostContext, LaunchPlan, BWRAP};
pub use mounts::{ensure_overlay_dirs, overlay_args, BindMount};

/// A required external tool and how to get it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTool {
    pub tool: String,
    pub hint: String,
}

/// Result of checking sandbox dependencies.
#[derive(Debug, Clone, Default)]
pub struct SandboxDependencyCheck {
    /// Tools that prevent the sandbox from running.
    pub errors: Vec<MissingTool>,
    /// Warnings about degraded functionality.
    pub warnings: Vec<String>,
}

impl SandboxDependencyCheck {
    /// Returns true if there are no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Record `tool` as missing unless it is on `$PATH`.
    pub fn require(&mut self, tool: &str, hint: &str) -> &mut Self {
        if find_in_path(tool).is_none() {
            self.errors.push(MissingTool {
                tool: tool.to_string(),
                hint: hint.to_string(),
            });
        }
        self
    }

    /// Convert to Result, reporting the first missing tool.
    pub fn into_result(self) -> Result<Self, SandboxError> {
        for warning in &self.warnings {
            tracing::warn!("{}", warning);
        }
        match self.errors.into_iter().next() {
            None => Ok(Self {
                errors: Vec::new(),
                warnings: self.warnings,
            }),
            Some(missing) => Err(SandboxError::MissingDependency {
                tool: missing.tool,
                hint: missing.hint,
            }),
        }
    }
}

/// Check that bubblewrap is installed.
pub fn check_bwrap() -> SandboxDependencyCheck {
    let mut check = SandboxDependencyCheck::default();
    check.require(BWRAP, "install the bubblewrap package");
    check
}

/// Run a compiled launch without a network namespace and return the
/// command's exit code. SIGINT and SIGTERM are forwarded to bubblewrap.
pub async fn run_direct(plan: &LaunchPlan) -> Result<i32, SandboxError> {
    let argv = plan.to_argv();
    let mut child = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .spawn()
        .map_err(|e| SandboxError::LaunchFailed(format!("{}: {}", BWRAP, e)))?;

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = shutdown_signal() => {
            if let Some(pid) = child.id() {
                terminate_pid(pid);
            }
            child.wait().await?
        }
    };
    Ok(exit_code_from_status(status))
}
