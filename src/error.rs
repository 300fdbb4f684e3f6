//! Error types for nsbox.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for nsbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Missing dependency: {tool} ({hint})")]
    MissingDependency { tool: String, hint: String },

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Failed to resolve '{host}': {reason}")]
    NameResolution { host: String, reason: String },

    #[error("Sandbox '{name}' is busy: {reason}")]
    LifecycleConflict { name: String, reason: String },

    #[error("Sandbox '{0}' not found")]
    SandboxNotFound(String),

    #[error(
        "Uninstall of '{name}' incomplete: removed {} wrapper(s) but could not delete {}: {reason}",
        .removed_wrappers.len(),
        .failed_path.display()
    )]
    PartialUninstall {
        name: String,
        removed_wrappers: Vec<PathBuf>,
        removed_record: bool,
        /// The first path that could not be removed.
        failed_path: PathBuf,
        reason: String,
    },

    #[error("DNS proxy error: {0}")]
    Proxy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command failed: {0}")]
    CommandFailed(String),
}

impl SandboxError {
    /// Shorthand for a missing external tool.
    pub fn missing(tool: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingDependency {
            tool: tool.into(),
            hint: hint.into(),
        }
    }
}

/// Configuration-specific errors. All of these are raised before any process is started.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Duplicate mount destination '{0}'")]
    DuplicateDestination(String),

    #[error("Mount destination '{dest}' conflicts with {other}")]
    OverlappingMount { dest: String, other: String },

    #[error("Persistent overlay at '{0}' has no write directory")]
    MissingWriteDir(String),

    #[error("Persistent overlay at '{0}' has a source but no work directory")]
    MissingWorkDir(String),

    #[error("Write directory '{dir}' is shared by overlays at '{first}' and '{second}'")]
    SharedWriteDir {
        dir: String,
        first: String,
        second: String,
    },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid environment variable name '{0}'")]
    InvalidEnvName(String),

    #[error("Invalid host pattern '{pattern}': {reason}")]
    InvalidHostPattern { pattern: String, reason: String },

    #[error("Invalid CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("Network filter has no host patterns or CIDRs")]
    EmptyFilter,

    #[error("Invalid sandbox name '{0}'")]
    InvalidSandboxName(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
