//! Filesystem change sensor: reports paths changed since the last read,
//! ignoring the daemon's own writes (spec.md §4.6).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashSet;

use crate::error::SensorError;
use crate::sensors::{Reading, ReadingPayload, Sensor};

/// Paths the daemon itself just wrote, to be excluded from the next
/// reported change set. A `DashSet` rather than a mutexed `HashSet`
/// because writers (state save, mutation queue drain) and the fs sensor
/// touch it from different points in the loop without a shared lock.
#[derive(Debug, Clone, Default)]
pub struct SelfWriteSet {
    inner: Arc<DashSet<PathBuf>>,
}

impl SelfWriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_self_write(&self, path: impl AsRef<Path>) {
        let canonical = path
            .as_ref()
            .canonicalize()
            .unwrap_or_else(|_| path.as_ref().to_path_buf());
        self.inner.insert(canonical);
    }

    /// Returns `true` and drains the entry if `path` was a recent
    /// self-write (matched after path normalization).
    fn should_ignore(&self, path: &Path) -> bool {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.inner.remove(&canonical).is_some()
    }
}

/// Polls mtimes of a watched directory tree; no external filesystem-event
/// crate is used, matching the budget for a short, timeout-bounded read.
pub struct FsWatchSensor {
    name: String,
    watch_dir: PathBuf,
    self_writes: SelfWriteSet,
    last_mtimes: HashMap<PathBuf, SystemTime>,
}

impl FsWatchSensor {
    pub fn new(watch_dir: impl Into<PathBuf>, self_writes: SelfWriteSet) -> Self {
        Self {
            name: "fs_watch".to_string(),
            watch_dir: watch_dir.into(),
            self_writes,
            last_mtimes: HashMap::new(),
        }
    }

    fn scan(&self) -> HashMap<PathBuf, SystemTime> {
        let mut out = HashMap::new();
        let mut stack = vec![self.watch_dir.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    if let Ok(mtime) = meta.modified() {
                        out.insert(path, mtime);
                    }
                }
            }
        }
        out
    }
}

impl Sensor for FsWatchSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), SensorError> {
        std::fs::create_dir_all(&self.watch_dir).map_err(|e| SensorError::Io {
            name: self.name.clone(),
            message: e.to_string(),
        })?;
        self.last_mtimes = self.scan();
        Ok(())
    }

    fn read(&mut self, now_monotonic: f64) -> Result<Reading, SensorError> {
        let current = self.scan();
        let mut changed = HashSet::new();

        for (path, mtime) in &current {
            let changed_here = match self.last_mtimes.get(path) {
                Some(prev) => prev != mtime,
                None => true,
            };
            if changed_here && !self.self_writes.should_ignore(path) {
                changed.insert(path.display().to_string());
            }
        }

        self.last_mtimes = current;

        Ok(Reading {
            sensor: self.name.clone(),
            monotonic_secs: now_monotonic,
            payload: ReadingPayload::FilesystemChanges { changed_paths: changed },
            spike_directives: Vec::new(),
            stale: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_new_file_as_changed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sensor = FsWatchSensor::new(dir.path(), SelfWriteSet::new());
        sensor.initialize().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let reading = sensor.read(0.0).unwrap();
        match reading.payload {
            ReadingPayload::FilesystemChanges { changed_paths } => assert_eq!(changed_paths.len(), 1),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn self_write_is_ignored_once() {
        let dir = tempfile::tempdir().unwrap();
        let self_writes = SelfWriteSet::new();
        let mut sensor = FsWatchSensor::new(dir.path(), self_writes.clone());
        sensor.initialize().unwrap();
        let file = dir.path().join("state.json");
        std::fs::write(&file, "{}").unwrap();
        self_writes.mark_self_write(&file);
        let reading = sensor.read(0.0).unwrap();
        match reading.payload {
            ReadingPayload::FilesystemChanges { changed_paths } => assert!(changed_paths.is_empty()),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn missing_watch_dir_is_not_an_error_after_init() {
        let dir = tempfile::tempdir().unwrap();
        let watch = dir.path().join("does-not-exist-yet");
        let mut sensor = FsWatchSensor::new(&watch, SelfWriteSet::new());
        sensor.initialize().unwrap();
        assert!(watch.is_dir());
    }
}
