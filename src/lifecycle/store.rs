//! On-disk layout, metadata records and per-name locks.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SandboxError};

/// How long to wait for another invocation holding a sandbox lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(50);

static SANDBOX_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("valid regex"));

/// Check that a sandbox name is safe to use as a file name.
pub fn validate_name(name: &str) -> Result<(), ConfigError> {
    if SANDBOX_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidSandboxName(name.to_string()))
    }
}

/// Where sandboxes, records, locks and wrappers live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    /// `$XDG_STATE_HOME/nsbox`.
    pub root: PathBuf,
    /// Directory wrapper scripts are installed into.
    pub bin_dir: PathBuf,
    /// Program the wrappers exec.
    pub self_exe: PathBuf,
}

impl StateLayout {
    /// Layout for the current user.
    pub fn for_user() -> Result<Self, SandboxError> {
        let home = dirs::home_dir();
        let state = dirs::state_dir()
            .or_else(|| home.as_ref().map(|h| h.join(".local").join("state")))
            .ok_or_else(|| SandboxError::LaunchFailed("cannot determine state directory".into()))?;
        let bin_dir = dirs::executable_dir()
            .or_else(|| home.as_ref().map(|h| h.join(".local").join("bin")))
            .ok_or_else(|| SandboxError::LaunchFailed("cannot determine bin directory".into()))?;
        Ok(Self {
            root: state.join("nsbox"),
            bin_dir,
            self_exe: std::env::current_exe()?,
        })
    }

    pub fn at(root: impl Into<PathBuf>, bin_dir: impl Into<PathBuf>, self_exe: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bin_dir: bin_dir.into(),
            self_exe: self_exe.into(),
        }
    }

    pub fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.records_dir().join(format!("{}.json", name))
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.root.join("sandboxes")
    }

    pub fn sandbox_dir(&self, name: &str) -> PathBuf {
        self.sandboxes_dir().join(name)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", name))
    }
}

/// Persistent metadata of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRecord {
    pub name: String,
    pub profile: String,
    pub overlay_dir: PathBuf,
    /// File names of installed wrappers in the bin directory.
    #[serde(default)]
    pub wrappers: Vec<String>,
    #[serde(default)]
    pub extra_binds: Vec<PathBuf>,
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl SandboxRecord {
    pub fn load(path: &Path) -> Result<Self, SandboxError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            ConfigError::ParseError(format!("record {}: {}", path.display(), e)).into()
        })
    }

    /// Write via a temp file in the same directory so readers never see a
    /// partial record.
    pub fn save(&self, path: &Path) -> Result<(), SandboxError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        write_atomic(path, json.as_bytes())
    }
}

/// Replace `path` with `content` atomically.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), SandboxError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SandboxError::Io(e.error))?;
    Ok(())
}

/// Exclusive lock on one sandbox name, released on drop.
#[derive(Debug)]
pub struct NameLock {
    file: File,
    name: String,
}

impl NameLock {
    /// Take the lock, retrying until `timeout` elapses.
    pub fn acquire(layout: &StateLayout, name: &str, timeout: Duration) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(layout.locks_dir())?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(layout.lock_path(name))?;

        let deadline = Instant::now() + timeout;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {
                    tracing::debug!("Locked sandbox '{}'", name);
                    return Ok(Self {
                        file,
                        name: name.to_string(),
                    });
                }
                Err(Errno::EWOULDBLOCK) | Err(Errno::EINTR) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(Errno::EWOULDBLOCK) => {
                    return Err(SandboxError::LifecycleConflict {
                        name: name.to_string(),
                        reason: format!("another nsbox process held the lock for {:?}", timeout),
                    });
                }
                Err(e) => return Err(SandboxError::Io(e.into())),
            }
        }
    }
}

impl Drop for NameLock {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            tracing::debug!("Failed to unlock sandbox '{}': {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(dir: &Path) -> StateLayout {
        StateLayout::at(dir.join("state"), dir.join("bin"), "/usr/bin/nsbox")
    }

    #[test]
    fn test_validate_name() {
        for name in ["claude", "my.tool_2", "A-b", "0"] {
            assert!(validate_name(name).is_ok(), "{name}");
        }
        for name in ["", "-x", ".hidden", "a/b", "../x", "sp ace", &"a".repeat(65)] {
            assert!(validate_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn test_layout_paths() {
        let l = StateLayout::at("/s", "/b", "/x");
        assert_eq!(l.record_path("n"), PathBuf::from("/s/records/n.json"));
        assert_eq!(l.sandbox_dir("n"), PathBuf::from("/s/sandboxes/n"));
        assert_eq!(l.lock_path("n"), PathBuf::from("/s/locks/n.lock"));
    }

    #[test]
    fn test_record_roundtrip_is_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records/r.json");
        let record = SandboxRecord {
            name: "r".into(),
            profile: "untrusted".into(),
            overlay_dir: "/s/sandboxes/r".into(),
            wrappers: vec!["tool".into()],
            extra_binds: vec![],
            extra_env: BTreeMap::from([("K".to_string(), "V".to_string())]),
        };
        record.save(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"overlayDir\""));
        assert!(raw.contains("\"extraEnv\""));
        assert_eq!(SandboxRecord::load(&path).unwrap(), record);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());

        let held = NameLock::acquire(&layout, "box", LOCK_TIMEOUT).unwrap();
        let err = NameLock::acquire(&layout, "box", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, SandboxError::LifecycleConflict { .. }));

        // Other names are independent.
        assert!(NameLock::acquire(&layout, "other", Duration::from_millis(100)).is_ok());

        drop(held);
        assert!(NameLock::acquire(&layout, "box", Duration::from_millis(100)).is_ok());
    }
}
