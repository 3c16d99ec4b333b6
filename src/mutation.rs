//! Serializes, validates, and applies agent-submitted mutation commands
//! (C8). Intake sources are logically identical: a JSON queue file the
//! agent writes to under an exclusive lock, and the HTTP `/config` POST.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::audit::{AuditEntry, AuditLog, AuditOutcome};
use crate::drive::DriveEngine;
use crate::error::MutationError;
use crate::guardrail::{Guardrails, RateWindow};

/// The kind-tagged mutation payload (spec.md §3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationKind {
    AdjustWeight { name: String, delta: f64 },
    AdjustThreshold { value: f64 },
    AdjustRate { value: f64 },
    AdjustCooldown { value_s: f64 },
    AdjustTurnsPerHour { value: u32 },
    AddDrive {
        name: String,
        #[serde(default)]
        weight: Option<f64>,
        #[serde(default)]
        sources: Vec<String>,
    },
    RemoveDrive { name: String },
    SpikeDrive { name: String, delta: f64 },
    DecayDrive { name: String, delta: f64 },
}

/// A tagged mutation record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mutation {
    #[serde(flatten)]
    pub kind: MutationKind,
    pub reason: String,
    pub submitted_at: u64,
}

impl Mutation {
    pub fn new(kind: MutationKind, reason: String, submitted_at: u64) -> Self {
        Self {
            kind,
            reason,
            submitted_at,
        }
    }

    fn kind_name(&self) -> &'static str {
        match &self.kind {
            MutationKind::AdjustWeight { .. } => "adjust_weight",
            MutationKind::AdjustThreshold { .. } => "adjust_threshold",
            MutationKind::AdjustRate { .. } => "adjust_rate",
            MutationKind::AdjustCooldown { .. } => "adjust_cooldown",
            MutationKind::AdjustTurnsPerHour { .. } => "adjust_turns_per_hour",
            MutationKind::AddDrive { .. } => "add_drive",
            MutationKind::RemoveDrive { .. } => "remove_drive",
            MutationKind::SpikeDrive { .. } => "spike_drive",
            MutationKind::DecayDrive { .. } => "decay_drive",
        }
    }
}

/// Applies `flock(2)`-based advisory exclusive locking around a whole
/// read-modify-write cycle, matching the donor's PID-file locking idiom
/// but held continuously across read, parse, and clear (spec.md §4.4).
fn with_exclusive_lock<T>(path: &Path, f: impl FnOnce(&mut File) -> Result<T, MutationError>) -> Result<T, MutationError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| MutationError::Malformed {
            message: format!("cannot open mutation queue {}: {e}", path.display()),
        })?;

    #[cfg(unix)]
    {
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid, open file descriptor for the duration of this call.
        let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if rc != 0 {
            return Err(MutationError::Malformed {
                message: "failed to acquire exclusive lock on mutation queue".to_string(),
            });
        }
    }

    let result = f(&mut file);

    #[cfg(unix)]
    {
        let fd = file.as_raw_fd();
        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }
    }

    result
}

/// Read the mutation queue file, parse it as a JSON array, and truncate
/// it to empty — all while the exclusive lock is held, so a concurrent
/// agent write can't interleave (spec.md §4.4).
pub fn drain_mutation_queue_file(path: &Path) -> Result<Vec<Mutation>, MutationError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    with_exclusive_lock(path, |file| {
        let mut text = String::new();
        file.seek(SeekFrom::Start(0)).ok();
        file.read_to_string(&mut text).map_err(|e| MutationError::Malformed {
            message: format!("failed to read mutation queue: {e}"),
        })?;

        let trimmed = text.trim();
        let mutations: Vec<Mutation> = if trimmed.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(trimmed).map_err(|e| MutationError::Malformed {
                message: format!("mutation queue is not a valid JSON array: {e}"),
            })?
        };

        file.set_len(0).ok();
        file.seek(SeekFrom::Start(0)).ok();
        file.write_all(b"[]").ok();
        file.flush().ok();

        Ok(mutations)
    })
}

/// Serializes mutation application so HTTP and file-queue paths cannot
/// race in-process (spec.md §4.4). Wraps the Drive Engine, the rolling
/// rate-limit window, and the audit log.
pub struct Mutator {
    inner: Mutex<()>,
    pub guardrails: Guardrails,
}

impl Mutator {
    pub fn new(guardrails: Guardrails) -> Self {
        Self {
            inner: Mutex::new(()),
            guardrails,
        }
    }

    /// Apply a batch of mutations in submission order. A malformed or
    /// rejected mutation is isolated into the audit log; the batch
    /// continues (spec.md §4.4).
    pub fn apply_batch(
        &self,
        engine: &mut DriveEngine,
        window: &mut RateWindow,
        audit_log: &mut AuditLog,
        mutations: Vec<Mutation>,
        now_unix: u64,
    ) {
        let _guard = self.inner.lock().expect("mutator mutex poisoned");
        for mutation in mutations {
            self.apply_one(engine, window, audit_log, mutation, now_unix);
        }
    }

    fn apply_one(
        &self,
        engine: &mut DriveEngine,
        window: &mut RateWindow,
        audit_log: &mut AuditLog,
        mutation: Mutation,
        now_unix: u64,
    ) {
        let kind_name = mutation.kind_name();

        if let Err(err) = self.guardrails.check_rate_limit(window, now_unix) {
            audit_log.append(AuditEntry::rejected(kind_name, &mutation, err.rule_name(), now_unix));
            return;
        }

        let (current_weight, protected) = match &mutation.kind {
            MutationKind::AdjustWeight { name, .. } | MutationKind::SpikeDrive { name, .. } | MutationKind::DecayDrive { name, .. } => {
                match engine.get(name) {
                    Some(d) => (Some(d.weight), d.protected),
                    None => (None, false),
                }
            }
            MutationKind::RemoveDrive { name } => match engine.get(name) {
                Some(d) => (Some(d.weight), d.protected),
                None => (None, false),
            },
            _ => (None, false),
        };

        let effective_value = match self.guardrails.check(&mutation, current_weight, protected) {
            Ok(v) => v,
            Err(err) => {
                audit_log.append(AuditEntry::rejected(kind_name, &mutation, err.rule_name(), now_unix));
                return;
            }
        };

        let before = self.describe_before(engine, &mutation);
        match self.apply_effect(engine, &mutation, effective_value, now_unix) {
            Ok(()) => {
                window.record(now_unix);
                let after = self.describe_before(engine, &mutation);
                audit_log.append(AuditEntry::accepted(kind_name, &mutation, before, after, now_unix));
            }
            Err(err) => {
                audit_log.append(AuditEntry::rejected(kind_name, &mutation, &format!("{err}"), now_unix));
            }
        }
    }

    fn describe_before(&self, engine: &DriveEngine, mutation: &Mutation) -> serde_json::Value {
        let name = match &mutation.kind {
            MutationKind::AdjustWeight { name, .. }
            | MutationKind::SpikeDrive { name, .. }
            | MutationKind::DecayDrive { name, .. }
            | MutationKind::RemoveDrive { name } => Some(name.as_str()),
            _ => None,
        };
        match name.and_then(|n| engine.get(n)) {
            Some(d) => serde_json::json!({"weight": d.weight, "pressure": d.pressure}),
            None => serde_json::Value::Null,
        }
    }

    fn apply_effect(
        &self,
        engine: &mut DriveEngine,
        mutation: &Mutation,
        effective_value: f64,
        now_unix: u64,
    ) -> Result<(), MutationError> {
        match &mutation.kind {
            MutationKind::AdjustWeight { name, .. } => {
                engine.set_weight(name, effective_value).map_err(|_| MutationError::DriveNotFound { name: name.clone() })
            }
            MutationKind::AdjustThreshold { .. } | MutationKind::AdjustRate { .. } | MutationKind::AdjustCooldown { .. } | MutationKind::AdjustTurnsPerHour { .. } => {
                // Config-level mutations are applied by the daemon against
                // `ConfigOverrides`, not the Drive Engine; this layer only
                // validates. See `daemon.rs` for the actual field write.
                Ok(())
            }
            MutationKind::AddDrive { name, weight, sources } => engine
                .add_drive(name, weight.unwrap_or(1.0), sources.clone(), false, now_unix)
                .map_err(|_| MutationError::AlreadyExists { name: name.clone() }),
            MutationKind::RemoveDrive { name } => {
                engine.remove_drive(name).map_err(|e| match e {
                    crate::drive::DriveEngineError::Protected(n) => MutationError::ProtectedDrive { name: n },
                    _ => MutationError::DriveNotFound { name: name.clone() },
                })
            }
            MutationKind::SpikeDrive { name, .. } => engine
                .spike(name, effective_value, f64::MAX)
                .map(|_| ())
                .map_err(|_| MutationError::DriveNotFound { name: name.clone() }),
            MutationKind::DecayDrive { name, .. } => engine
                .decay(name, effective_value.abs(), f64::MAX)
                .map(|_| ())
                .map_err(|_| MutationError::DriveNotFound { name: name.clone() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::guardrail::GuardrailLimits;

    fn mutator() -> Mutator {
        let config = Config::default();
        Mutator::new(Guardrails::new(GuardrailLimits::from_config(&config)))
    }

    #[test]
    fn malformed_queue_file_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mutations.json");
        std::fs::write(&path, "not json").unwrap();
        let err = drain_mutation_queue_file(&path).unwrap_err();
        assert!(matches!(err, MutationError::Malformed { .. }));
    }

    #[test]
    fn drain_clears_file_after_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mutations.json");
        std::fs::write(&path, r#"[{"type":"adjust_threshold","value":6.0,"reason":"r","submitted_at":0}]"#).unwrap();
        let mutations = drain_mutation_queue_file(&path).unwrap();
        assert_eq!(mutations.len(), 1);
        let second = drain_mutation_queue_file(&path).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn missing_queue_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.json");
        assert!(drain_mutation_queue_file(&path).unwrap().is_empty());
    }

    #[test]
    fn batch_isolates_a_single_bad_mutation() {
        let mutator = mutator();
        let mut engine = DriveEngine::new();
        engine.insert(crate::drive::Drive::new("curiosity", 1.0, vec![], false, 0));
        let mut window = RateWindow::default();
        let mut audit = AuditLog::in_memory();

        let mutations = vec![
            Mutation::new(MutationKind::AdjustThreshold { value: 999.0 }, "bad".into(), 0),
            Mutation::new(
                MutationKind::AdjustWeight {
                    name: "curiosity".into(),
                    delta: 0.05,
                },
                "good".into(),
                0,
            ),
        ];
        mutator.apply_batch(&mut engine, &mut window, &mut audit, mutations, 0);
        assert_eq!(audit.entries().len(), 2);
        assert_eq!(audit.entries()[0].outcome, AuditOutcome::Rejected);
        assert_eq!(audit.entries()[1].outcome, AuditOutcome::Accepted);
    }

    #[test]
    fn every_mutation_produces_exactly_one_audit_entry() {
        let mutator = mutator();
        let mut engine = DriveEngine::new();
        engine.insert(crate::drive::Drive::new("curiosity", 1.0, vec![], false, 0));
        let mut window = RateWindow::default();
        let mut audit = AuditLog::in_memory();
        let n = 5;
        let mutations: Vec<_> = (0..n)
            .map(|i| Mutation::new(MutationKind::SpikeDrive { name: "curiosity".into(), delta: 0.1 }, format!("r{i}"), 0))
            .collect();
        mutator.apply_batch(&mut engine, &mut window, &mut audit, mutations, 0);
        assert_eq!(audit.entries().len(), n);
    }
}
