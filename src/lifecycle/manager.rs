//! Named sandboxes: creation, wrapper installation and removal.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use glob::MatchOptions;

use crate::config::{OverlayMode, SandboxConfig, BUILTIN_PROFILE};
use crate::error::SandboxError;
use crate::lifecycle::store::{
    validate_name, write_atomic, NameLock, SandboxRecord, StateLayout, LOCK_TIMEOUT,
};
use crate::network::pasta::{launch_capture, launch_in_progress};
use crate::sandbox::ensure_overlay_dirs;
use crate::utils::{decode_dest, encode_dest, is_executable, quote_always};

/// Subdirectories of a sandbox.
const OVERLAYS: &str = "overlays";
const OVERLAY_WORK: &str = ".overlay-work";

/// Overlay content never offered as an installable program.
const SKIPPED_PREFIXES: &[&str] = &[".cache/", ".local/share/", ".npm/", ".cargo/registry/"];

/// Settings recorded when a sandbox is first created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub profile: String,
    pub extra_binds: Vec<PathBuf>,
    pub extra_env: BTreeMap<String, String>,
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            profile: BUILTIN_PROFILE.to_string(),
            extra_binds: Vec::new(),
            extra_env: BTreeMap::new(),
        }
    }
}

/// A sandbox that exists on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub name: String,
    /// `sandboxes/<name>`.
    pub dir: PathBuf,
    pub record: SandboxRecord,
}

impl Sandbox {
    pub fn overlays_dir(&self) -> PathBuf {
        self.dir.join(OVERLAYS)
    }

    pub fn write_dir(&self, dest: &Path) -> PathBuf {
        self.overlays_dir().join(encode_dest(dest))
    }

    pub fn work_dir(&self, dest: &Path) -> PathBuf {
        self.dir.join(OVERLAY_WORK).join(encode_dest(dest))
    }
}

/// Known sandboxes and directories nothing refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub sandboxes: Vec<SandboxRecord>,
    /// Sandbox directories without a record.
    pub orphans: Vec<PathBuf>,
}

/// An executable found in a sandbox overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxExecutable {
    pub host_path: PathBuf,
    /// Path the program has inside the sandbox.
    pub sandbox_path: PathBuf,
}

/// An installed wrapper script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperHandle {
    pub path: PathBuf,
    pub binary: PathBuf,
}

/// What an uninstall removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallReport {
    pub removed_wrappers: Vec<PathBuf>,
    pub removed_record: bool,
    pub removed_dir: Option<PathBuf>,
}

impl UninstallReport {
    /// Turn what was removed so far into a partial-uninstall error.
    fn incomplete(self, name: &str, failed_path: PathBuf, e: std::io::Error) -> SandboxError {
        SandboxError::PartialUninstall {
            name: name.to_string(),
            removed_wrappers: self.removed_wrappers,
            removed_record: self.removed_record,
            failed_path,
            reason: e.to_string(),
        }
    }
}

/// What `clean` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    /// Belong to a launch that is still running.
    pub skipped: Vec<PathBuf>,
}

/// Manages named sandboxes under a [`StateLayout`].
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    layout: StateLayout,
}

impl LifecycleManager {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    fn lock(&self, name: &str) -> Result<NameLock, SandboxError> {
        NameLock::acquire(&self.layout, name, LOCK_TIMEOUT)
    }

    fn sandbox(&self, record: SandboxRecord) -> Sandbox {
        Sandbox {
            name: record.name.clone(),
            dir: self.layout.sandbox_dir(&record.name),
            record,
        }
    }

    /// Load an existing sandbox.
    pub fn get(&self, name: &str) -> Result<Sandbox, SandboxError> {
        validate_name(name)?;
        let path = self.layout.record_path(name);
        if !path.exists() {
            return Err(SandboxError::SandboxNotFound(name.to_string()));
        }
        Ok(self.sandbox(SandboxRecord::load(&path)?))
    }

    /// Create the sandbox if needed, with default registration settings.
    pub fn ensure(&self, name: &str) -> Result<Sandbox, SandboxError> {
        self.ensure_with(name, Registration::default())
    }

    /// Create the sandbox if needed. `registration` is only recorded when the
    /// record does not exist yet.
    pub fn ensure_with(&self, name: &str, registration: Registration) -> Result<Sandbox, SandboxError> {
        validate_name(name)?;
        let _lock = self.lock(name)?;

        let dir = self.layout.sandbox_dir(name);
        std::fs::create_dir_all(dir.join(OVERLAYS))?;
        std::fs::create_dir_all(dir.join(OVERLAY_WORK))?;

        let path = self.layout.record_path(name);
        if path.exists() {
            return Ok(self.sandbox(SandboxRecord::load(&path)?));
        }

        let record = SandboxRecord {
            name: name.to_string(),
            profile: registration.profile,
            overlay_dir: dir.join(OVERLAYS),
            wrappers: Vec::new(),
            extra_binds: registration.extra_binds,
            extra_env: registration.extra_env,
        };
        record.save(&path)?;
        tracing::debug!("Created sandbox '{}' at {}", name, dir.display());
        Ok(self.sandbox(record))
    }

    /// Replace the recorded profile, binds and environment of an existing
    /// sandbox. Wrappers installed afterwards use the new settings.
    pub fn update_registration(&self, name: &str, registration: Registration) -> Result<Sandbox, SandboxError> {
        validate_name(name)?;
        let _lock = self.lock(name)?;
        let path = self.layout.record_path(name);
        if !path.exists() {
            return Err(SandboxError::SandboxNotFound(name.to_string()));
        }
        let mut record = SandboxRecord::load(&path)?;
        record.profile = registration.profile;
        record.extra_binds = registration.extra_binds;
        record.extra_env = registration.extra_env;
        record.save(&path)?;
        Ok(self.sandbox(record))
    }

    /// Records, sorted by name, plus sandbox directories without one.
    pub fn list_all(&self) -> Result<Listing, SandboxError> {
        let mut listing = Listing::default();

        if let Ok(entries) = std::fs::read_dir(self.layout.records_dir()) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match SandboxRecord::load(&path) {
                    Ok(record) => listing.sandboxes.push(record),
                    Err(e) => tracing::warn!("Skipping unreadable record {}: {}", path.display(), e),
                }
            }
        }
        listing.sandboxes.sort_by(|a, b| a.name.cmp(&b.name));

        if let Ok(entries) = std::fs::read_dir(self.layout.sandboxes_dir()) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if path.is_dir() && !self.layout.record_path(name).exists() {
                    listing.orphans.push(path);
                }
            }
        }
        listing.orphans.sort();
        Ok(listing)
    }

    /// Point every persistent overlay of `config` at this sandbox's storage.
    pub fn apply_overlays(&self, sandbox: &Sandbox, config: &mut SandboxConfig) -> Result<(), SandboxError> {
        for overlay in config
            .overlays
            .iter_mut()
            .filter(|o| o.mode == OverlayMode::Persistent)
        {
            overlay.write_dir = Some(sandbox.write_dir(&overlay.dest));
            overlay.work_dir = Some(sandbox.work_dir(&overlay.dest));
        }
        ensure_overlay_dirs(config)
    }

    /// Executable files stored in the sandbox's overlays, as in-sandbox paths.
    pub fn find_executables(&self, sandbox: &Sandbox) -> Result<Vec<SandboxExecutable>, SandboxError> {
        let mut found = Vec::new();
        let Ok(entries) = std::fs::read_dir(sandbox.overlays_dir()) else {
            return Ok(found);
        };
        let options = MatchOptions {
            require_literal_leading_dot: false,
            ..MatchOptions::new()
        };

        for entry in entries.flatten() {
            let root = entry.path();
            if !root.is_dir() {
                continue;
            }
            let mount_point = decode_dest(&entry.file_name().to_string_lossy());
            let pattern = format!("{}/**/*", glob::Pattern::escape(&root.display().to_string()));
            let paths = glob::glob_with(&pattern, options)
                .map_err(|e| SandboxError::LaunchFailed(format!("bad overlay path: {}", e)))?;

            for path in paths.flatten() {
                let Ok(rel) = path.strip_prefix(&root) else {
                    continue;
                };
                let rel_str = rel.display().to_string();
                if SKIPPED_PREFIXES.iter().any(|p| rel_str.starts_with(p)) || !is_executable(&path) {
                    continue;
                }
                found.push(SandboxExecutable {
                    sandbox_path: mount_point.join(rel),
                    host_path: path,
                });
            }
        }
        found.sort_by(|a, b| a.sandbox_path.cmp(&b.sandbox_path));
        Ok(found)
    }

    /// Wrapper script text for `binary` inside `sandbox`.
    pub fn wrapper_script(&self, sandbox: &Sandbox, binary: &Path) -> String {
        let record = &sandbox.record;
        let mut words = vec![
            quote_always(&self.layout.self_exe.display().to_string()),
            "run".to_string(),
            "--profile".to_string(),
            quote_always(&record.profile),
            "--sandbox".to_string(),
            quote_always(&record.name),
            "--bind-cwd".to_string(),
        ];
        for bind in &record.extra_binds {
            words.push("--bind".to_string());
            words.push(quote_always(&bind.display().to_string()));
        }
        for (key, value) in &record.extra_env {
            words.push("--bind-env".to_string());
            words.push(quote_always(&format!("{}={}", key, value)));
        }
        words.push("--".to_string());
        words.push(quote_always(&binary.display().to_string()));
        words.push("\"$@\"".to_string());
        format!("#!/bin/sh\nexec {}\n", words.join(" "))
    }

    /// Install an executable wrapper for `binary` (an in-sandbox path) into
    /// the bin directory.
    pub fn install_wrapper(&self, sandbox: &Sandbox, binary: &Path) -> Result<WrapperHandle, SandboxError> {
        let file_name = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SandboxError::LaunchFailed(format!("'{}' has no file name", binary.display())))?;
        let _lock = self.lock(&sandbox.name)?;

        let target = self.layout.bin_dir.join(&file_name);
        let mut record = SandboxRecord::load(&self.layout.record_path(&sandbox.name))
            .map_err(|_| SandboxError::SandboxNotFound(sandbox.name.clone()))?;

        if target.exists() && !record.wrappers.contains(&file_name) {
            let owner = self
                .list_all()?
                .sandboxes
                .into_iter()
                .find(|r| r.wrappers.contains(&file_name))
                .map(|r| format!("sandbox '{}'", r.name))
                .unwrap_or_else(|| "a file not managed by nsbox".to_string());
            return Err(SandboxError::LifecycleConflict {
                name: sandbox.name.clone(),
                reason: format!("{} already belongs to {}", target.display(), owner),
            });
        }

        let script = self.wrapper_script(&self.sandbox(record.clone()), binary);
        write_atomic(&target, script.as_bytes())?;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))?;

        if !record.wrappers.contains(&file_name) {
            record.wrappers.push(file_name);
            record.wrappers.sort();
            record.save(&self.layout.record_path(&sandbox.name))?;
        }
        tracing::debug!("Installed wrapper {}", target.display());
        Ok(WrapperHandle {
            path: target,
            binary: binary.to_path_buf(),
        })
    }

    /// Remove wrappers, the record and the sandbox directory, in that order.
    pub fn uninstall(&self, name: &str) -> Result<UninstallReport, SandboxError> {
        validate_name(name)?;
        let _lock = self.lock(name)?;

        let record_path = self.layout.record_path(name);
        let dir = self.layout.sandbox_dir(name);
        let record = if record_path.exists() {
            Some(SandboxRecord::load(&record_path)?)
        } else {
            None
        };
        if record.is_none() && !dir.exists() {
            return Err(SandboxError::SandboxNotFound(name.to_string()));
        }

        let mut report = UninstallReport::default();
        if let Some(record) = &record {
            for wrapper in &record.wrappers {
                let path = self.layout.bin_dir.join(wrapper);
                if path.exists() {
                    if let Err(e) = std::fs::remove_file(&path) {
                        return Err(report.incomplete(name, path, e));
                    }
                    report.removed_wrappers.push(path);
                }
            }
            if let Err(e) = std::fs::remove_file(&record_path) {
                return Err(report.incomplete(name, record_path, e));
            }
            report.removed_record = true;
        }

        if dir.exists() {
            restore_owner_permissions(&dir);
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                return Err(report.incomplete(name, dir, e));
            }
            report.removed_dir = Some(dir);
        }
        Ok(report)
    }
}

/// overlayfs leaves its work directories mode 000; give the owner access
/// back so they can be deleted.
fn restore_owner_permissions(dir: &Path) {
    let Ok(meta) = std::fs::symlink_metadata(dir) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode | 0o700)) {
            tracing::debug!("Cannot fix permissions on {}: {}", dir.display(), e);
            return;
        }
    }
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            restore_owner_permissions(&entry.path());
        }
    }
}

/// Remove leftover launch directories and captures from `tmp`. Workdirs of
/// launches still running, and their captures, are skipped.
pub fn clean_temp_files(tmp: &Path) -> CleanReport {
    let mut report = CleanReport::default();
    let base = glob::Pattern::escape(&tmp.display().to_string());
    let mut candidates = Vec::new();
    for prefix in ["nsbox-net-", "nsbox-audit-"] {
        if let Ok(paths) = glob::glob(&format!("{}/{}*", base, prefix)) {
            candidates.extend(paths.flatten());
        }
    }

    let mut live = Vec::new();
    for dir in candidates.iter().filter(|p| p.is_dir()) {
        if launch_in_progress(dir) {
            live.push(dir.clone());
            live.extend(launch_capture(dir));
        }
    }

    for path in candidates {
        if live.contains(&path) {
            report.skipped.push(path);
            continue;
        }
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => report.removed.push(path),
            Err(e) => report.failed.push((path, e.to_string())),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayRule;
    use crate::network::pasta::{hold_launch_lock, CAPTURE_FILE, PLAN_FILE};

    fn manager(dir: &Path) -> LifecycleManager {
        LifecycleManager::new(StateLayout::at(
            dir.join("state"),
            dir.join("bin"),
            "/usr/local/bin/nsbox",
        ))
    }

    fn make_executable(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());

        let registration = Registration {
            profile: "dev".into(),
            extra_binds: vec!["/data".into()],
            extra_env: BTreeMap::new(),
        };
        let first = m.ensure_with("tool", registration).unwrap();
        let second = m.ensure("tool").unwrap();
        assert_eq!(first, second);
        assert_eq!(second.record.profile, "dev");
        assert!(second.overlays_dir().is_dir());
        assert_eq!(m.list_all().unwrap().sandboxes.len(), 1);
    }

    #[test]
    fn test_update_registration() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        assert!(matches!(
            m.update_registration("missing", Registration::default()),
            Err(SandboxError::SandboxNotFound(_))
        ));

        m.ensure("tool").unwrap();
        let updated = m
            .update_registration(
                "tool",
                Registration {
                    profile: "dev".into(),
                    extra_binds: vec![],
                    extra_env: BTreeMap::from([("A".to_string(), "1".to_string())]),
                },
            )
            .unwrap();
        assert_eq!(m.get("tool").unwrap(), updated);
        assert_eq!(updated.record.profile, "dev");
    }

    #[test]
    fn test_invalid_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        assert!(matches!(m.ensure("../escape"), Err(SandboxError::Config(_))));
        assert!(!dir.path().join("state").join("escape").exists());
    }

    #[test]
    fn test_orphans_listed() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.ensure("kept").unwrap();
        std::fs::create_dir_all(m.layout().sandbox_dir("leftover")).unwrap();

        let listing = m.list_all().unwrap();
        assert_eq!(listing.sandboxes.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["kept"]);
        assert_eq!(listing.orphans, vec![m.layout().sandbox_dir("leftover")]);
    }

    #[test]
    fn test_apply_overlays_assigns_storage() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let sandbox = m.ensure("s").unwrap();

        let mut config = SandboxConfig {
            overlays: vec![OverlayRule::persistent("/home/sandbox"), OverlayRule::tmpfs("/scratch")],
            ..SandboxConfig::default()
        };
        m.apply_overlays(&sandbox, &mut config).unwrap();

        let persistent = &config.overlays[0];
        let write_dir = sandbox.dir.join("overlays").join("home-sandbox");
        assert_eq!(persistent.write_dir.as_deref(), Some(write_dir.as_path()));
        assert_eq!(
            persistent.work_dir.as_deref(),
            Some(sandbox.dir.join(".overlay-work").join("home-sandbox").as_path())
        );
        assert!(write_dir.is_dir());
        assert!(config.overlays[1].write_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_find_executables_skips_caches() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let sandbox = m.ensure("s").unwrap();
        let home = sandbox.write_dir(Path::new("/home/sandbox"));

        make_executable(&home.join(".local/bin/claude"));
        make_executable(&home.join(".cache/tool/bin/skip"));
        make_executable(&home.join(".npm/_npx/x"));
        std::fs::write(home.join("notes.txt"), "x").unwrap();

        let found = m.find_executables(&sandbox).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sandbox_path, PathBuf::from("/home/sandbox/.local/bin/claude"));
        assert_eq!(found[0].host_path, home.join(".local/bin/claude"));
    }

    #[test]
    fn test_wrapper_script_quotes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let mut sandbox = m.ensure("s").unwrap();
        sandbox.record.extra_binds = vec!["/my data".into()];
        sandbox.record.extra_env = BTreeMap::from([("TOKEN".to_string(), "a'b".to_string())]);

        let script = m.wrapper_script(&sandbox, Path::new("/home/sandbox/.local/bin/claude"));
        assert_eq!(
            script,
            "#!/bin/sh\nexec '/usr/local/bin/nsbox' run --profile 'untrusted' --sandbox 's' --bind-cwd \
             --bind '/my data' --bind-env 'TOKEN=a'\"'\"'b' -- '/home/sandbox/.local/bin/claude' \"$@\"\n"
        );
    }

    #[test]
    fn test_install_wrapper_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let a = m.ensure("a").unwrap();
        let b = m.ensure("b").unwrap();

        let handle = m.install_wrapper(&a, Path::new("/home/sandbox/bin/tool")).unwrap();
        assert_eq!(handle.path, dir.path().join("bin/tool"));
        let mode = std::fs::metadata(&handle.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(m.get("a").unwrap().record.wrappers, vec!["tool"]);

        // Reinstalling for the owner is fine.
        assert!(m.install_wrapper(&a, Path::new("/home/sandbox/bin/tool")).is_ok());

        let err = m.install_wrapper(&b, Path::new("/usr/bin/tool")).unwrap_err();
        assert!(matches!(err, SandboxError::LifecycleConflict { .. }));

        std::fs::write(dir.path().join("bin/foreign"), "x").unwrap();
        let err = m.install_wrapper(&b, Path::new("/usr/bin/foreign")).unwrap_err();
        assert!(matches!(err, SandboxError::LifecycleConflict { .. }));
    }

    #[test]
    fn test_uninstall_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let sandbox = m.ensure("gone").unwrap();
        let wrapper = m.install_wrapper(&sandbox, Path::new("/home/sandbox/bin/t")).unwrap();

        // overlayfs work dirs end up mode 000.
        let work = sandbox.dir.join(".overlay-work/home-sandbox/work");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::set_permissions(&work, std::fs::Permissions::from_mode(0o000)).unwrap();

        let report = m.uninstall("gone").unwrap();
        assert_eq!(report.removed_wrappers, vec![wrapper.path.clone()]);
        assert!(report.removed_record);
        assert_eq!(report.removed_dir, Some(sandbox.dir.clone()));
        assert!(!wrapper.path.exists());
        assert!(!sandbox.dir.exists());
        assert!(matches!(m.get("gone"), Err(SandboxError::SandboxNotFound(_))));
        assert!(matches!(m.uninstall("gone"), Err(SandboxError::SandboxNotFound(_))));
    }

    #[test]
    fn test_uninstall_orphan_directory() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        std::fs::create_dir_all(m.layout().sandbox_dir("orphan").join("overlays")).unwrap();

        let report = m.uninstall("orphan").unwrap();
        assert!(!report.removed_record);
        assert!(report.removed_dir.is_some());
        assert!(m.list_all().unwrap().orphans.is_empty());
    }

    #[test]
    fn test_clean_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nsbox-net-abc/sub")).unwrap();
        std::fs::create_dir(dir.path().join("nsbox-audit-def")).unwrap();
        std::fs::write(dir.path().join("nsbox-audit-1234.pcap"), "").unwrap();
        std::fs::create_dir(dir.path().join("unrelated")).unwrap();

        let report = clean_temp_files(dir.path());
        assert_eq!(report.removed.len(), 3);
        assert!(report.failed.is_empty());
        assert!(dir.path().join("unrelated").exists());
        assert!(!dir.path().join("nsbox-net-abc").exists());
    }

    #[test]
    fn test_clean_skips_running_launch() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("nsbox-audit-live");
        std::fs::create_dir(&live).unwrap();
        std::fs::write(live.join(PLAN_FILE), "{}").unwrap();
        let capture = dir.path().join("nsbox-audit-0000beef.pcap");
        std::fs::write(&capture, "").unwrap();
        std::fs::write(live.join(CAPTURE_FILE), capture.display().to_string()).unwrap();
        let stale = dir.path().join("nsbox-net-stale");
        std::fs::create_dir(&stale).unwrap();
        std::fs::write(stale.join(PLAN_FILE), "{}").unwrap();

        let running = hold_launch_lock(&live).unwrap();
        let report = clean_temp_files(dir.path());
        assert_eq!(report.removed, vec![stale]);
        let mut skipped = report.skipped.clone();
        skipped.sort();
        let mut expected = vec![live.clone(), capture.clone()];
        expected.sort();
        assert_eq!(skipped, expected);
        assert!(live.exists() && capture.exists());

        drop(running);
        let report = clean_temp_files(dir.path());
        assert_eq!(report.removed.len(), 2);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn test_uninstall_reports_removed_wrappers_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let sandbox = m.ensure("stuck").unwrap();
        let first = m.install_wrapper(&sandbox, Path::new("/home/sandbox/bin/a")).unwrap();
        let second = m.install_wrapper(&sandbox, Path::new("/home/sandbox/bin/b")).unwrap();

        // A non-empty directory where the second wrapper was cannot be unlinked.
        std::fs::remove_file(&second.path).unwrap();
        std::fs::create_dir_all(second.path.join("keep")).unwrap();

        match m.uninstall("stuck").unwrap_err() {
            SandboxError::PartialUninstall {
                removed_wrappers,
                removed_record,
                failed_path,
                ..
            } => {
                assert_eq!(removed_wrappers, vec![first.path.clone()]);
                assert!(!removed_record);
                assert_eq!(failed_path, second.path);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(m.get("stuck").is_ok());
        assert!(sandbox.dir.exists());

        std::fs::remove_dir_all(&second.path).unwrap();
        let report = m.uninstall("stuck").unwrap();
        assert!(report.removed_record);
        assert!(!sandbox.dir.exists());
    }

    #[test]
    fn test_failed_directory_removal_leaves_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let sandbox = m.ensure("stuck").unwrap();
        let wrapper = m.install_wrapper(&sandbox, Path::new("/home/sandbox/bin/t")).unwrap();

        let sandboxes = m.layout().sandboxes_dir();
        std::fs::set_permissions(&sandboxes, std::fs::Permissions::from_mode(0o500)).unwrap();
        // Root ignores directory permissions.
        if std::fs::create_dir(sandboxes.join("writable")).is_ok() {
            std::fs::set_permissions(&sandboxes, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }
        let err = m.uninstall("stuck").unwrap_err();
        std::fs::set_permissions(&sandboxes, std::fs::Permissions::from_mode(0o755)).unwrap();

        match err {
            SandboxError::PartialUninstall {
                removed_wrappers,
                removed_record,
                failed_path,
                ..
            } => {
                assert_eq!(removed_wrappers, vec![wrapper.path.clone()]);
                assert!(removed_record);
                assert_eq!(failed_path, sandbox.dir);
            }
            other => panic!("unexpected {:?}", other),
        }
        let listing = m.list_all().unwrap();
        assert!(listing.sandboxes.is_empty());
        assert_eq!(listing.orphans, vec![sandbox.dir.clone()]);

        assert!(m.uninstall("stuck").unwrap().removed_dir.is_some());
        assert!(m.list_all().unwrap().orphans.is_empty());
    }

    #[test]
    fn test_concurrent_ensure_and_uninstall_stay_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..25 {
                    m.ensure("shared").unwrap();
                }
            });
            scope.spawn(|| {
                for _ in 0..25 {
                    match m.uninstall("shared") {
                        Ok(_) | Err(SandboxError::SandboxNotFound(_)) => {}
                        Err(e) => panic!("uninstall failed: {}", e),
                    }
                }
            });
        });

        let has_record = m.layout().record_path("shared").exists();
        assert_eq!(has_record, m.layout().sandbox_dir("shared").exists());
        assert!(m.list_all().unwrap().orphans.is_empty());
        if has_record {
            assert!(m.get("shared").unwrap().overlays_dir().is_dir());
        }
    }
}
