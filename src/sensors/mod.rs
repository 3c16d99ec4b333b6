//! Producers of typed readings the Drive Engine consumes each tick (C4).
//!
//! Each sensor implements [`Sensor`]: `initialize` (idempotent),
//! `read` (non-blocking, budget-bounded), and `stop`. A slow sensor must
//! never block the main loop — it returns stale data and lets a worker
//! refresh its cache in the background.

pub mod conversation;
pub mod fs_watch;
pub mod health;
pub mod source_scrape;

use std::collections::HashSet;
use std::time::Duration;

use crate::error::SensorError;

/// A snapshot produced by one sensor read.
#[derive(Debug, Clone, Default)]
pub struct Reading {
    pub sensor: String,
    pub monotonic_secs: f64,
    pub payload: ReadingPayload,
    /// Explicit `(drive_name, delta)` spike directives this reading wants
    /// applied to the Drive Engine after time-based accumulation.
    pub spike_directives: Vec<(String, f64)>,
    pub stale: bool,
}

/// The small typed payload a [`Reading`] carries.
#[derive(Debug, Clone, Default)]
pub enum ReadingPayload {
    #[default]
    Empty,
    FilesystemChanges {
        changed_paths: HashSet<String>,
    },
    ConversationActivity {
        active: bool,
        seconds_since_last_message: f64,
    },
    SystemHealth {
        memory_ok: bool,
        disk_ok: bool,
        degraded: bool,
    },
    SourceScrape {
        changed_sources: HashSet<String>,
    },
}

/// The default per-sensor read timeout budget (spec.md §4.6).
pub const DEFAULT_READ_BUDGET: Duration = Duration::from_secs(1);

/// The contract every sensor implements.
pub trait Sensor: Send {
    /// A stable name used in logs, `/state`, and `/metrics`.
    fn name(&self) -> &str;

    /// Acquire resources. Must be safe to call more than once.
    fn initialize(&mut self) -> Result<(), SensorError>;

    /// Produce a reading. Must not block beyond its own short internal
    /// budget; on timeout, return the last cached reading marked stale.
    fn read(&mut self, now_monotonic: f64) -> Result<Reading, SensorError>;

    /// Release resources.
    fn stop(&mut self) {}
}

/// Owns the full set of active sensors and reads them each loop iteration.
pub struct SensorSet {
    sensors: Vec<Box<dyn Sensor>>,
}

impl SensorSet {
    pub fn new() -> Self {
        Self { sensors: Vec::new() }
    }

    pub fn add(&mut self, sensor: Box<dyn Sensor>) {
        self.sensors.push(sensor);
    }

    pub fn initialize_all(&mut self) {
        for sensor in &mut self.sensors {
            if let Err(err) = sensor.initialize() {
                tracing::warn!(sensor = sensor.name(), error = %err, "sensor failed to initialize");
            }
        }
    }

    /// Read every sensor. A sensor error is logged and treated as an
    /// empty reading rather than aborting the loop iteration
    /// (spec.md §4.9 step 6).
    pub fn read_all(&mut self, now_monotonic: f64) -> Vec<Reading> {
        let mut readings = Vec::with_capacity(self.sensors.len());
        for sensor in &mut self.sensors {
            match sensor.read(now_monotonic) {
                Ok(reading) => readings.push(reading),
                Err(err) => {
                    tracing::warn!(sensor = sensor.name(), error = %err, "sensor read failed");
                    readings.push(Reading {
                        sensor: sensor.name().to_string(),
                        monotonic_secs: now_monotonic,
                        payload: ReadingPayload::Empty,
                        spike_directives: Vec::new(),
                        stale: true,
                    });
                }
            }
        }
        readings
    }

    pub fn stop_all(&mut self) {
        for sensor in &mut self.sensors {
            sensor.stop();
        }
    }
}

impl Default for SensorSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the union of changed source keys across all readings this
/// tick, for the Drive Engine's source-spike check.
pub fn changed_sources(readings: &[Reading]) -> HashSet<String> {
    let mut out = HashSet::new();
    for reading in readings {
        match &reading.payload {
            ReadingPayload::FilesystemChanges { changed_paths } => out.extend(changed_paths.iter().cloned()),
            ReadingPayload::SourceScrape { changed_sources } => out.extend(changed_sources.iter().cloned()),
            _ => {}
        }
    }
    out
}

/// Whether any reading reports an active human conversation within
/// `activity_threshold_secs` (spec.md §4.2 conversation suppression).
pub fn conversation_active(readings: &[Reading], activity_threshold_secs: f64) -> bool {
    readings.iter().any(|r| match r.payload {
        ReadingPayload::ConversationActivity {
            active,
            seconds_since_last_message,
        } => active || seconds_since_last_message <= activity_threshold_secs,
        _ => false,
    })
}

/// Seconds since the most recent conversation activity signal, or `None`
/// if no conversation sensor reported (used by the high-pressure override
/// idle-window check).
pub fn idle_seconds(readings: &[Reading]) -> Option<f64> {
    readings.iter().find_map(|r| match r.payload {
        ReadingPayload::ConversationActivity {
            seconds_since_last_message,
            ..
        } => Some(seconds_since_last_message),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_active_true_within_threshold() {
        let readings = vec![Reading {
            sensor: "conversation".into(),
            monotonic_secs: 0.0,
            payload: ReadingPayload::ConversationActivity {
                active: false,
                seconds_since_last_message: 10.0,
            },
            spike_directives: vec![],
            stale: false,
        }];
        assert!(conversation_active(&readings, 300.0));
        assert!(!conversation_active(&readings, 5.0));
    }

    #[test]
    fn changed_sources_unions_across_readings() {
        let readings = vec![
            Reading {
                sensor: "fs".into(),
                monotonic_secs: 0.0,
                payload: ReadingPayload::FilesystemChanges {
                    changed_paths: HashSet::from(["a.md".to_string()]),
                },
                spike_directives: vec![],
                stale: false,
            },
            Reading {
                sensor: "scrape".into(),
                monotonic_secs: 0.0,
                payload: ReadingPayload::SourceScrape {
                    changed_sources: HashSet::from(["b.md".to_string()]),
                },
                spike_directives: vec![],
                stale: false,
            },
        ];
        let changed = changed_sources(&readings);
        assert!(changed.contains("a.md"));
        assert!(changed.contains("b.md"));
    }
}
