//! XDG-compliant state directory resolution for the pulse daemon.
//!
//! Unlike a multi-workspace tool, pulse owns exactly one state directory
//! per running daemon. `StateDirLayout` names every file within it so
//! every subsystem agrees on where its piece lives.

use std::path::PathBuf;

use crate::error::PathError;

pub type PathResult<T> = std::result::Result<T, PathError>;

/// All file paths rooted at one pulse state directory.
#[derive(Debug, Clone)]
pub struct StateDirLayout {
    /// The state directory itself, e.g. `$XDG_STATE_HOME/pulse`.
    pub root: PathBuf,
}

impl StateDirLayout {
    /// Resolve the default state directory from XDG environment variables,
    /// falling back to `~/.local/state/pulse`.
    pub fn resolve() -> PathResult<Self> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| PathError::NoHome)?;

        let state_dir = std::env::var("XDG_STATE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/state"))
            .join("pulse");

        Ok(Self { root: state_dir })
    }

    /// Use an explicit directory (e.g. from `--state-dir`).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the state directory. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| PathError::CreateDir {
            path: self.root.display().to_string(),
            source: e,
        })
    }

    /// `state.json` — the atomically-written state snapshot.
    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// Sibling tempfile used for the atomic write of `state.json`.
    pub fn state_tmp_file(&self) -> PathBuf {
        self.root.join("state.json.tmp")
    }

    /// `audit.jsonl` — append-only applied/rejected mutation log.
    pub fn audit_file(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }

    /// `audit.old` — rotated audit log.
    pub fn audit_rotated_file(&self) -> PathBuf {
        self.root.join("audit.old")
    }

    /// `mutations.json` — the agent-writable mutation queue file.
    pub fn mutations_file(&self) -> PathBuf {
        self.root.join("mutations.json")
    }

    /// `pulse.pid` — the exclusive process lock file.
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("pulse.pid")
    }

    /// `pulse.toml` — an optional state-dir-local config override file.
    pub fn config_file(&self) -> PathBuf {
        self.root.join("pulse.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_derives_all_paths_under_root() {
        let layout = StateDirLayout::at("/tmp/pulse-test");
        assert_eq!(layout.state_file(), PathBuf::from("/tmp/pulse-test/state.json"));
        assert_eq!(
            layout.state_tmp_file(),
            PathBuf::from("/tmp/pulse-test/state.json.tmp")
        );
        assert_eq!(layout.audit_file(), PathBuf::from("/tmp/pulse-test/audit.jsonl"));
        assert_eq!(
            layout.mutations_file(),
            PathBuf::from("/tmp/pulse-test/mutations.json")
        );
        assert_eq!(layout.pid_file(), PathBuf::from("/tmp/pulse-test/pulse.pid"));
    }

    #[test]
    fn ensure_dirs_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateDirLayout::at(dir.path().join("nested"));
        layout.ensure_dirs().unwrap();
        layout.ensure_dirs().unwrap();
        assert!(layout.root.is_dir());
    }

    #[test]
    fn resolve_uses_xdg_state_home_when_set() {
        // SAFETY: single-threaded test, no concurrent env access.
        unsafe {
            std::env::set_var("XDG_STATE_HOME", "/tmp/xdg-state-test");
        }
        let layout = StateDirLayout::resolve().unwrap();
        assert_eq!(layout.root, PathBuf::from("/tmp/xdg-state-test/pulse"));
        unsafe {
            std::env::remove_var("XDG_STATE_HOME");
        }
    }
}
