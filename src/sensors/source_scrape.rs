//! Cheap mtime scan of drive `sources`: emits `(drive_name, spike_delta)`
//! directives when a watched source has changed since the last tick
//! (spec.md §4.6).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::SensorError;
use crate::sensors::{Reading, ReadingPayload, Sensor};

pub struct SourceScrapeSensor {
    name: String,
    /// drive name -> source file paths to watch
    sources: HashMap<String, Vec<PathBuf>>,
    last_mtimes: HashMap<PathBuf, SystemTime>,
    spike_amount: f64,
}

impl SourceScrapeSensor {
    pub fn new(sources: HashMap<String, Vec<PathBuf>>, spike_amount: f64) -> Self {
        Self {
            name: "source_scrape".to_string(),
            sources,
            last_mtimes: HashMap::new(),
            spike_amount,
        }
    }

    pub fn set_sources(&mut self, sources: HashMap<String, Vec<PathBuf>>) {
        self.sources = sources;
    }
}

impl Sensor for SourceScrapeSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read(&mut self, now_monotonic: f64) -> Result<Reading, SensorError> {
        let mut changed_sources = std::collections::HashSet::new();
        let mut spike_directives = Vec::new();

        for (drive_name, paths) in &self.sources {
            let mut drive_changed = false;
            for path in paths {
                // A missing source file is "no change this tick," not an
                // error (spec.md §4.1 edge case).
                let Ok(meta) = std::fs::metadata(path) else {
                    continue;
                };
                let Ok(mtime) = meta.modified() else {
                    continue;
                };
                let changed = match self.last_mtimes.get(path) {
                    Some(prev) => *prev != mtime,
                    None => true,
                };
                self.last_mtimes.insert(path.clone(), mtime);
                if changed {
                    drive_changed = true;
                    changed_sources.insert(path.display().to_string());
                }
            }
            if drive_changed {
                spike_directives.push((drive_name.clone(), self.spike_amount));
            }
        }

        Ok(Reading {
            sensor: self.name.clone(),
            monotonic_secs: now_monotonic,
            payload: ReadingPayload::SourceScrape { changed_sources },
            spike_directives,
            stale: false,
        })
    }
}
