//! System-health sensor: memory, disk, and arbitrary process liveness,
//! with results cached and a timeout budget (spec.md §4.6).

use std::time::{Duration, Instant};

use crate::error::SensorError;
use crate::sensors::{Reading, ReadingPayload, Sensor};

/// A liveness probe the health sensor checks each tick, keyed by PID.
#[derive(Debug, Clone)]
pub struct WatchedProcess {
    pub label: String,
    pub pid: i32,
}

pub struct HealthSensor {
    name: String,
    read_budget: Duration,
    watched: Vec<WatchedProcess>,
    last_good: Option<(bool, bool)>,
}

impl HealthSensor {
    pub fn new(watched: Vec<WatchedProcess>) -> Self {
        Self {
            name: "health".to_string(),
            read_budget: crate::sensors::DEFAULT_READ_BUDGET,
            watched,
            last_good: None,
        }
    }

    fn memory_ok() -> bool {
        // A conservative check: /proc/meminfo is readable and reports
        // nonzero available memory. Any failure to read is treated as
        // "cannot confirm ok", not "definitely bad".
        std::fs::read_to_string("/proc/meminfo")
            .map(|text| {
                text.lines()
                    .find(|l| l.starts_with("MemAvailable:"))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb > 0)
                    .unwrap_or(true)
            })
            .unwrap_or(true)
    }

    fn disk_ok(path: &str) -> bool {
        std::fs::metadata(path).is_ok()
    }

    #[cfg(unix)]
    fn process_alive(pid: i32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[cfg(not(unix))]
    fn process_alive(_pid: i32) -> bool {
        true
    }
}

impl Sensor for HealthSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read(&mut self, now_monotonic: f64) -> Result<Reading, SensorError> {
        let start = Instant::now();

        let memory_ok = Self::memory_ok();
        let disk_ok = Self::disk_ok("/");

        let mut all_watched_alive = true;
        for proc in &self.watched {
            if start.elapsed() > self.read_budget {
                // Over budget: stop checking, report cached/degraded.
                let (mem, disk) = self.last_good.unwrap_or((true, true));
                return Ok(Reading {
                    sensor: self.name.clone(),
                    monotonic_secs: now_monotonic,
                    payload: ReadingPayload::SystemHealth {
                        memory_ok: mem,
                        disk_ok: disk,
                        degraded: true,
                    },
                    spike_directives: Vec::new(),
                    stale: true,
                });
            }
            if !Self::process_alive(proc.pid) {
                tracing::warn!(process = proc.label, pid = proc.pid, "watched process not alive");
                all_watched_alive = false;
            }
        }

        let degraded = !memory_ok || !disk_ok || !all_watched_alive;
        self.last_good = Some((memory_ok, disk_ok));

        Ok(Reading {
            sensor: self.name.clone(),
            monotonic_secs: now_monotonic,
            payload: ReadingPayload::SystemHealth {
                memory_ok,
                disk_ok,
                degraded,
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
    fn reports_healthy_with_no_watched_processes() {
        let mut sensor = HealthSensor::new(vec![]);
        let reading = sensor.read(0.0).unwrap();
        match reading.payload {
            ReadingPayload::SystemHealth { .. } => {}
            _ => panic!("wrong payload"),
        }
        assert!(!reading.stale);
    }

    #[test]
    fn detects_dead_watched_process() {
        // PID 1 is conventionally alive; a very large PID is very likely not.
        let mut sensor = HealthSensor::new(vec![WatchedProcess {
            label: "bogus".into(),
            pid: 2_000_000_000,
        }]);
        let reading = sensor.read(0.0).unwrap();
        match reading.payload {
            ReadingPayload::SystemHealth { degraded, .. } => assert!(degraded),
            _ => panic!("wrong payload"),
        }
    }
}
