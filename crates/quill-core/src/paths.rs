//! Configuration-path resolution.
//!
//! `XDG_CONFIG_HOME` overrides the default `~/.config` base; `HOME` locates
//! the home directory. Skill and configuration directories hang off the
//! Quill config dir.

use std::env;
use std::path::PathBuf;

/// The XDG config base: `$XDG_CONFIG_HOME`, else `$HOME/.config`.
#[must_use]
pub fn config_home() -> Option<PathBuf> {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg));
        }
    }
    home_dir().map(|home| home.join(".config"))
}

/// The Quill config directory: `<config_home>/quill`.
#[must_use]
pub fn quill_config_dir() -> Option<PathBuf> {
    config_home().map(|base| base.join("quill"))
}

/// Expand a leading `~/` to the user's home directory.
#[must_use]
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn home_dir() -> Option<PathBuf> {
    env::var("HOME").ok().filter(|h| !h.is_empty()).map(PathBuf::from)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
