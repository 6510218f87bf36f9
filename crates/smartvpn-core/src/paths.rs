//! Filesystem path helpers for configuration values.

use std::path::{Path, PathBuf};

/// Directory holding the default config files and certificates.
pub const CONFIG_DIR: &str = "~/.smartvpn";

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// `~/.smartvpn/<name>`, unexpanded.
pub fn default_path(name: &str) -> String {
    format!("{CONFIG_DIR}/{name}")
}
