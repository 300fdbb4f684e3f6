//! Path normalization utilities.

use std::path::{Component, Path, PathBuf};

use crate::error::ConfigError;

/// Expand ~ to the home directory.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).display().to_string();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.display().to_string();
        }
    }
    path.to_string()
}

/// Lexically normalize an absolute path: collapse `.`, `..` and repeated or trailing slashes.
///
/// Does not touch the filesystem, so it works for destinations that only exist
/// inside the sandbox.
pub fn normalize_absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    let raw = path.as_os_str().to_string_lossy();
    if raw.contains('\0') {
        return Err(ConfigError::InvalidPath {
            path: raw.replace('\0', "\\0"),
            reason: "contains a NUL byte".to_string(),
        });
    }
    if !path.is_absolute() {
        return Err(ConfigError::InvalidPath {
            path: raw.into_owned(),
            reason: "must be absolute".to_string(),
        });
    }

    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Ok(out)
}

/// Whether `path` is `base` or lies below it. Both must already be normalized.
pub fn is_within(path: &Path, base: &Path) -> bool {
    path.starts_with(base)
}

/// Resolve symlinks and `..` against the filesystem for the longest existing
/// prefix of `path`; the missing remainder is appended as is.
///
/// Falls back to [`normalize_absolute`] when no prefix resolves.
pub fn resolve_existing(path: &Path) -> PathBuf {
    let mut base = path.to_path_buf();
    let mut missing = Vec::new();
    loop {
        if let Ok(mut real) = std::fs::canonicalize(&base) {
            real.extend(missing.iter().rev());
            return real;
        }
        match base.file_name() {
            Some(name) => missing.push(name.to_os_string()),
            None => break,
        }
        if !base.pop() {
            break;
        }
    }
    normalize_absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Encode an in-sandbox destination as a single directory name.
///
/// The mapping is reversible: `%` -> `%25`, `-` -> `%2D`, `/` -> `-`, and the
/// root directory becomes `root`.
pub fn encode_dest(dest: &Path) -> String {
    let s = dest.display().to_string();
    let trimmed = s.trim_start_matches('/');
    if trimmed.is_empty() {
        return "root".to_string();
    }
    trimmed
        .replace('%', "%25")
        .replace('-', "%2D")
        .replace('/', "-")
}

/// Inverse of [`encode_dest`].
pub fn decode_dest(name: &str) -> PathBuf {
    if name == "root" {
        return PathBuf::from("/");
    }
    let decoded = name
        .replace('-', "/")
        .replace("%2D", "-")
        .replace("%25", "%");
    PathBuf::from(format!("/{}", decoded))
}
