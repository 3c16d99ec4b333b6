//! Crash-safe key/value persistence rooted at a state directory, plus
//! the exclusive process lock that ensures only one daemon owns it (C2).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigOverrides;
use crate::drive::DriveSnapshot;
use crate::error::StateError;
use crate::paths::StateDirLayout;

const SCHEMA_VERSION: u32 = 1;

/// `{timestamp, reason, top_drive, total_pressure, webhook_status, dispatched_turn_id}`
/// (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerHistoryEntry {
    pub timestamp: u64,
    pub reason: String,
    pub top_drive: Option<String>,
    pub total_pressure: f64,
    pub webhook_status: String,
    pub dispatched_turn_id: Option<String>,
}

/// `{timestamp, reason}` (spec.md §4.5 `last_trigger`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LastTrigger {
    pub timestamp: u64,
    pub reason: String,
}

/// The full persisted snapshot (spec.md §4.5 State Store keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub drives: DriveSnapshot,
    pub config_overrides: ConfigOverrides,
    pub last_trigger: LastTrigger,
    pub trigger_history: Vec<TriggerHistoryEntry>,
    pub mutation_timestamps: Vec<u64>,
    pub saved_at_monotonic: f64,
    pub saved_at_unix: u64,
}

/// Rotation cap on `trigger_history`, mirroring the audit log's
/// size-bounded rotation policy (spec.md §4.5).
pub const MAX_TRIGGER_HISTORY_ENTRIES: usize = 2000;

impl StateSnapshot {
    pub fn push_trigger_history(&mut self, entry: TriggerHistoryEntry) {
        self.trigger_history.push(entry);
        if self.trigger_history.len() > MAX_TRIGGER_HISTORY_ENTRIES {
            let overflow = self.trigger_history.len() - MAX_TRIGGER_HISTORY_ENTRIES;
            self.trigger_history.drain(0..overflow);
        }
    }
}

/// Owns the state directory's process lock and performs atomic writes.
#[derive(Debug)]
pub struct StateStore {
    layout: StateDirLayout,
}

impl StateStore {
    /// Acquire the exclusive process lock for `layout`, refusing to
    /// start if a live daemon already owns it (spec.md §4.5, §4.9 step 1).
    pub fn acquire(layout: StateDirLayout) -> Result<Self, StateError> {
        layout.ensure_dirs().map_err(|_| StateError::Io {
            source: std::io::Error::other("failed to create state directory"),
        })?;

        let pid_path = layout.pid_file();
        if let Some(existing_pid) = read_pid_file(&pid_path) {
            if process_alive(existing_pid) {
                return Err(StateError::Locked {
                    path: layout.root.display().to_string(),
                    pid: existing_pid,
                });
            }
            tracing::warn!(pid = existing_pid, "clearing stale process lock");
        }

        write_pid_file(&pid_path, std::process::id())?;
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &StateDirLayout {
        &self.layout
    }

    /// Release the process lock. Called on graceful shutdown.
    pub fn release(&self) {
        let _ = std::fs::remove_file(self.layout.pid_file());
    }

    /// Load the prior snapshot, if any. A missing file is not an error
    /// (fresh install); a corrupt file is fatal at startup (spec.md §7).
    pub fn load(&self) -> Result<Option<StateSnapshot>, StateError> {
        let path = self.layout.state_file();
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).map_err(|e| StateError::Io { source: e })?;
        let snapshot: StateSnapshot = serde_json::from_str(&text).map_err(|e| StateError::Corrupt {
            message: e.to_string(),
        })?;
        Ok(Some(snapshot))
    }

    /// Write the snapshot atomically: sibling tempfile in the same
    /// directory, fsync, then rename over the target (spec.md §6
    /// "bit-exact points"). Readers always see either the old or the
    /// new complete file.
    pub fn save(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        let tmp_path = self.layout.state_tmp_file();
        let final_path = self.layout.state_file();

        let mut snapshot = snapshot.clone();
        snapshot.version = SCHEMA_VERSION;

        let text = serde_json::to_string(&snapshot).map_err(|e| StateError::Corrupt {
            message: e.to_string(),
        })?;

        {
            let mut tmp = File::create(&tmp_path).map_err(|e| StateError::Io { source: e })?;
            tmp.write_all(text.as_bytes()).map_err(|e| StateError::Io { source: e })?;
            tmp.sync_all().map_err(|e| StateError::Io { source: e })?;
        }

        std::fs::rename(&tmp_path, &final_path).map_err(|e| StateError::Io { source: e })?;
        Ok(())
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    let mut text = String::new();
    File::open(path).ok()?.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}

fn write_pid_file(path: &Path, pid: u32) -> Result<(), StateError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| StateError::Io { source: e })?;
    write!(file, "{pid}").map_err(|e| StateError::Io { source: e })?;
    file.sync_all().map_err(|e| StateError::Io { source: e })?;
    Ok(())
}

/// Whether `pid` refers to a live process, via a signal-0 liveness probe.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::DriveEngine;

    fn sample_snapshot() -> StateSnapshot {
        StateSnapshot {
            version: SCHEMA_VERSION,
            drives: DriveEngine::new().snapshot(),
            config_overrides: ConfigOverrides::default(),
            last_trigger: LastTrigger::default(),
            trigger_history: Vec::new(),
            mutation_timestamps: Vec::new(),
            saved_at_monotonic: 0.0,
            saved_at_unix: 0,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateDirLayout::at(dir.path());
        layout.ensure_dirs().unwrap();
        let store = StateStore::acquire(layout).unwrap();
        store.save(&sample_snapshot()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.version, SCHEMA_VERSION);
    }

    #[test]
    fn missing_state_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateDirLayout::at(dir.path());
        layout.ensure_dirs().unwrap();
        let store = StateStore::acquire(layout).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn second_acquire_fails_while_first_process_alive() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateDirLayout::at(dir.path());
        layout.ensure_dirs().unwrap();
        // Our own process is alive, so writing our own PID simulates "held by a live peer."
        write_pid_file(&layout.pid_file(), std::process::id()).unwrap();
        let err = StateStore::acquire(layout).unwrap_err();
        assert!(matches!(err, StateError::Locked { .. }));
    }

    #[test]
    fn stale_lock_from_dead_pid_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateDirLayout::at(dir.path());
        layout.ensure_dirs().unwrap();
        // A PID essentially guaranteed not to be alive.
        write_pid_file(&layout.pid_file(), 2_000_000_000).unwrap();
        let store = StateStore::acquire(layout);
        assert!(store.is_ok());
    }

    #[test]
    fn release_removes_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateDirLayout::at(dir.path());
        layout.ensure_dirs().unwrap();
        let pid_path = layout.pid_file();
        let store = StateStore::acquire(layout).unwrap();
        assert!(pid_path.exists());
        store.release();
        assert!(!pid_path.exists());
    }

    #[test]
    fn trigger_history_rotates_past_cap() {
        let mut snapshot = sample_snapshot();
        for i in 0..(MAX_TRIGGER_HISTORY_ENTRIES + 10) {
            snapshot.push_trigger_history(TriggerHistoryEntry {
                timestamp: i as u64,
                reason: "test".into(),
                top_drive: None,
                total_pressure: 0.0,
                webhook_status: "ok".into(),
                dispatched_turn_id: None,
            });
        }
        assert_eq!(snapshot.trigger_history.len(), MAX_TRIGGER_HISTORY_ENTRIES);
    }
}
