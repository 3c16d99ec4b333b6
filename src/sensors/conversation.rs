//! Conversation-activity sensor: reports whether a human conversation is
//! active, derived from the mtime of the largest qualifying log file in a
//! session directory (spec.md §4.6).

use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::SensorError;
use crate::sensors::{Reading, ReadingPayload, Sensor};

/// Log files smaller than this are treated as cron/hook noise, not a
/// real conversation session (spec.md §4.6).
pub const MIN_SESSION_FILE_BYTES: u64 = 100 * 1024;

pub struct ConversationSensor {
    name: String,
    session_dir: PathBuf,
}

impl ConversationSensor {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "conversation".to_string(),
            session_dir: session_dir.into(),
        }
    }

    fn largest_qualifying_file_mtime(&self) -> Option<SystemTime> {
        let entries = std::fs::read_dir(&self.session_dir).ok()?;
        entries
            .flatten()
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                if meta.is_file() && meta.len() >= MIN_SESSION_FILE_BYTES {
                    Some((meta.len(), meta.modified().ok()?))
                } else {
                    None
                }
            })
            .max_by_key(|(size, _)| *size)
            .map(|(_, mtime)| mtime)
    }
}

impl Sensor for ConversationSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read(&mut self, now_monotonic: f64) -> Result<Reading, SensorError> {
        let seconds_since_last_message = match self.largest_qualifying_file_mtime() {
            Some(mtime) => SystemTime::now()
                .duration_since(mtime)
                .map(|d| d.as_secs_f64())
                .unwrap_or(f64::MAX),
            None => f64::MAX,
        };

        Ok(Reading {
            sensor: self.name.clone(),
            monotonic_secs: now_monotonic,
            payload: ReadingPayload::ConversationActivity {
                active: seconds_since_last_message < 5.0,
                seconds_since_last_message,
            },
            spike_directives: Vec::new(),
            stale: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_small_files_as_noise() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cron.log"), vec![0u8; 1024]).unwrap();
        let mut sensor = ConversationSensor::new(dir.path());
        let reading = sensor.read(0.0).unwrap();
        match reading.payload {
            ReadingPayload::ConversationActivity {
                seconds_since_last_message,
                ..
            } => assert_eq!(seconds_since_last_message, f64::MAX),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn picks_largest_qualifying_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("session.log"), vec![0u8; MIN_SESSION_FILE_BYTES as usize + 1]).unwrap();
        let mut sensor = ConversationSensor::new(dir.path());
        let reading = sensor.read(0.0).unwrap();
        match reading.payload {
            ReadingPayload::ConversationActivity {
                seconds_since_last_message,
                ..
            } => assert!(seconds_since_last_message < 5.0),
            _ => panic!("wrong payload"),
        }
    }
}
