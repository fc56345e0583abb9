//! Miscellaneous helper utilities.
use std::env;
use std::path::{Path, PathBuf};

use reqwest::Url;

use crate::error::{Error, Result};

/// Search PATH for the first matching binary name.
#[must_use]
pub fn get_binary_path(names: &[&str]) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;

    for dir in env::split_paths(&path_var) {
        for name in names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }

            if cfg!(windows) {
                for ext in ["exe", "cmd", "bat"] {
                    let candidate = dir.join(format!("{}.{}", name, ext));
                    if candidate.is_file() {
                        return Some(candidate);
                    }
                }
            }
        }
    }

    None
}

/// Ensure a file path's parent directory exists.
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Platform configuration directory for this tool.
///
/// `%APPDATA%\rsmusicdl` on Windows, `~/.config/rsmusicdl` elsewhere.
#[must_use]
pub fn config_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        env::var_os("APPDATA")
            .or_else(|| env::var_os("USERPROFILE"))
            .map(|p| PathBuf::from(p).join("rsmusicdl"))
    } else {
        env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join("rsmusicdl"))
    }
}

/// Resolve a possibly relative URI against the URL it was found in.
pub fn resolve_uri(base: &str, uri: &str) -> Result<String> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(uri.to_string());
    }
    let base = Url::parse(base).map_err(|e| Error::Manifest(format!("Invalid URL {}: {}", base, e)))?;
    base.join(uri)
        .map(String::from)
        .map_err(|e| Error::Manifest(format!("Cannot resolve {} against {}: {}", uri, base, e)))
}

/// Replace characters that are invalid in file names.
#[must_use]
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
