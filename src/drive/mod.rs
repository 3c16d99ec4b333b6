//! The pressure model: per-drive state, weights, accumulation, spikes,
//! decay, and protected-drive rules (C5).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::sensors::Reading;

/// A named motivational channel with pressure and weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub name: String,
    pub weight: f64,
    pub pressure: f64,
    /// Monotonic timestamp (unix seconds) of the most recent successful
    /// feedback that named this drive.
    pub last_addressed: u64,
    pub sources: Vec<String>,
    pub protected: bool,
    pub created_at: u64,
}

impl Drive {
    pub fn new(name: impl Into<String>, weight: f64, sources: Vec<String>, protected: bool, created_at: u64) -> Self {
        Self {
            name: name.into(),
            weight,
            pressure: 0.0,
            last_addressed: 0,
            sources,
            protected,
            created_at,
        }
    }

    pub fn weighted_pressure(&self) -> f64 {
        self.pressure * self.weight
    }
}

/// Outcome reported for a `/feedback` submission (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOutcome {
    Success,
    Partial,
    Failure,
}

/// Errors `DriveEngine` operations may produce.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriveEngineError {
    #[error("drive \"{0}\" already exists")]
    AlreadyExists(String),
    #[error("cannot remove protected drive \"{0}\"")]
    Protected(String),
    #[error("drive \"{0}\" not found")]
    NotFound(String),
}

/// Persistable snapshot of engine state (spec.md §4.1 `snapshot`/`restore`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveSnapshot {
    pub drives: Vec<Drive>,
    pub total_triggers: u64,
    pub last_evaluation_time: f64,
}

/// Ordered mapping from drive name to [`Drive`], plus aggregate counters.
///
/// Insertion order is preserved (a `Vec` of names alongside the map) so
/// that ties on weighted pressure break deterministically, per spec.md
/// §4.2's "ties are broken by insertion order of drives."
#[derive(Debug, Clone)]
pub struct DriveEngine {
    order: Vec<String>,
    drives: HashMap<String, Drive>,
    pub total_triggers: u64,
    pub last_evaluation_time: f64,
}

impl DriveEngine {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            drives: HashMap::new(),
            total_triggers: 0,
            last_evaluation_time: 0.0,
        }
    }

    /// Iterate drives in stable insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Drive> {
        self.order.iter().filter_map(move |name| self.drives.get(name))
    }

    pub fn get(&self, name: &str) -> Option<&Drive> {
        self.drives.get(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn total_weighted_pressure(&self) -> f64 {
        self.iter().map(Drive::weighted_pressure).sum()
    }

    /// The drive with the highest weighted pressure, ties broken by
    /// insertion order (first inserted wins).
    pub fn top_drive(&self) -> Option<&Drive> {
        let mut best: Option<&Drive> = None;
        for drive in self.iter() {
            match best {
                None => best = Some(drive),
                Some(b) if drive.weighted_pressure() > b.weighted_pressure() => best = Some(drive),
                _ => {}
            }
        }
        best
    }

    /// Add a drive to the engine, preserving insertion order.
    pub fn insert(&mut self, drive: Drive) {
        if !self.drives.contains_key(&drive.name) {
            self.order.push(drive.name.clone());
        }
        self.drives.insert(drive.name.clone(), drive);
    }

    /// Time-based pressure accumulation plus source-change and
    /// sensor-directed spikes, for one loop iteration (spec.md §4.1).
    ///
    /// `pressure_rate` is per minute; `dt_secs` is the elapsed wall time
    /// in seconds since the previous tick.
    pub fn tick(
        &mut self,
        dt_secs: f64,
        pressure_rate: f64,
        max_pressure: f64,
        spike_amount: f64,
        readings: &[Reading],
        changed_sources: &HashSet<String>,
    ) {
        let names: Vec<String> = self.order.clone();
        for name in &names {
            let drive = self.drives.get_mut(name).expect("order/drives in sync");
            drive.pressure = (drive.pressure + pressure_rate * (dt_secs / 60.0) * drive.weight)
                .clamp(0.0, max_pressure);

            if drive.sources.iter().any(|s| changed_sources.contains(s)) {
                drive.pressure = (drive.pressure + spike_amount).clamp(0.0, max_pressure);
            }
        }

        for reading in readings {
            for (drive_name, delta) in &reading.spike_directives {
                if let Some(drive) = self.drives.get_mut(drive_name) {
                    drive.pressure = (drive.pressure + delta).clamp(0.0, max_pressure);
                }
            }
        }
    }

    /// Apply a bounded manual spike to one drive. `delta` should already
    /// be guardrail-bounded by the caller; this still clamps the result.
    pub fn spike(&mut self, name: &str, delta: f64, max_pressure: f64) -> Result<f64, DriveEngineError> {
        let drive = self
            .drives
            .get_mut(name)
            .ok_or_else(|| DriveEngineError::NotFound(name.to_string()))?;
        drive.pressure = (drive.pressure + delta).clamp(0.0, max_pressure);
        Ok(drive.pressure)
    }

    /// Apply a bounded manual decay to one drive.
    pub fn decay(&mut self, name: &str, delta: f64, max_pressure: f64) -> Result<f64, DriveEngineError> {
        self.spike(name, -delta.abs(), max_pressure)
    }

    /// Decay drives following a `/feedback` submission (spec.md §4.1,
    /// §4.8). The addressed drives get a full `success_decay`-scaled
    /// decay; other drives with nonzero weighted pressure get a
    /// proportional decay scaled by their share of total weighted
    /// pressure and `proportional_scale` (spec.md §9: tunable, default 2.0).
    ///
    /// Returns `(before, after)` pressure pairs for every drive whose
    /// pressure changed. Drive names in `addressed` that no longer exist
    /// (removed mid-flight) are silently skipped.
    pub fn apply_feedback(
        &mut self,
        addressed: &[String],
        outcome: FeedbackOutcome,
        success_decay: f64,
        proportional_scale: f64,
        max_pressure: f64,
    ) -> HashMap<String, (f64, f64)> {
        let mut result = HashMap::new();

        let effective_decay = match outcome {
            FeedbackOutcome::Success => success_decay,
            FeedbackOutcome::Partial => success_decay / 2.0,
            FeedbackOutcome::Failure => 0.0,
        };
        if effective_decay <= 0.0 {
            return result;
        }

        let total_pressure = self.total_weighted_pressure();
        let names: Vec<String> = self.order.clone();

        for name in &names {
            let drive = self.drives.get_mut(name).expect("order/drives in sync");
            let before = drive.pressure;

            if addressed.iter().any(|n| n == name) {
                drive.pressure = (before * (1.0 - effective_decay)).clamp(0.0, max_pressure);
                result.insert(name.clone(), (before, drive.pressure));
                continue;
            }

            let weighted = before * drive.weight;
            if weighted > 0.0 && total_pressure > 0.0 {
                let share = weighted / total_pressure;
                let fraction = (effective_decay * share * proportional_scale).min(1.0);
                if fraction > 0.0 {
                    drive.pressure = (before * (1.0 - fraction)).clamp(0.0, max_pressure);
                    result.insert(name.clone(), (before, drive.pressure));
                }
            }
        }

        result
    }

    pub fn mark_addressed(&mut self, name: &str, now_unix: u64) {
        if let Some(drive) = self.drives.get_mut(name) {
            drive.last_addressed = now_unix;
        }
    }

    /// Add a non-protected or protected drive; rejected if the name is
    /// already present (spec.md §4.1 edge case).
    pub fn add_drive(
        &mut self,
        name: &str,
        weight: f64,
        sources: Vec<String>,
        protected: bool,
        now_unix: u64,
    ) -> Result<(), DriveEngineError> {
        if self.drives.contains_key(name) {
            return Err(DriveEngineError::AlreadyExists(name.to_string()));
        }
        self.insert(Drive::new(name, weight, sources, protected, now_unix));
        Ok(())
    }

    /// Remove a non-protected drive. Protected drives can never be removed.
    pub fn remove_drive(&mut self, name: &str) -> Result<(), DriveEngineError> {
        match self.drives.get(name) {
            None => Err(DriveEngineError::NotFound(name.to_string())),
            Some(d) if d.protected => Err(DriveEngineError::Protected(name.to_string())),
            Some(_) => {
                self.drives.remove(name);
                self.order.retain(|n| n != name);
                Ok(())
            }
        }
    }

    pub fn set_weight(&mut self, name: &str, weight: f64) -> Result<(), DriveEngineError> {
        let drive = self
            .drives
            .get_mut(name)
            .ok_or_else(|| DriveEngineError::NotFound(name.to_string()))?;
        drive.weight = weight;
        Ok(())
    }

    pub fn set_sources(&mut self, name: &str, sources: Vec<String>) -> Result<(), DriveEngineError> {
        let drive = self
            .drives
            .get_mut(name)
            .ok_or_else(|| DriveEngineError::NotFound(name.to_string()))?;
        drive.sources = sources;
        Ok(())
    }

    /// Adjust weights toward `performance_history` targets by at most
    /// `max_delta` per call, clamped to `[floor(drive), weight_max]`
    /// (spec.md §4.1).
    pub fn evolve_weights(
        &mut self,
        performance_deltas: &HashMap<String, f64>,
        max_delta: f64,
        weight_min: f64,
        weight_max: f64,
        weight_protected_min: f64,
    ) {
        for name in self.order.clone() {
            let Some(&raw_delta) = performance_deltas.get(&name) else {
                continue;
            };
            let drive = self.drives.get_mut(&name).expect("order/drives in sync");
            let bounded_delta = raw_delta.clamp(-max_delta, max_delta);
            let floor = if drive.protected { weight_protected_min } else { weight_min };
            drive.weight = (drive.weight + bounded_delta).clamp(floor, weight_max);
        }
    }

    pub fn record_trigger(&mut self) {
        self.total_triggers += 1;
    }

    pub fn record_evaluation(&mut self, now_monotonic: f64) {
        self.last_evaluation_time = now_monotonic;
    }

    pub fn snapshot(&self) -> DriveSnapshot {
        DriveSnapshot {
            drives: self.iter().cloned().collect(),
            total_triggers: self.total_triggers,
            last_evaluation_time: self.last_evaluation_time,
        }
    }

    pub fn restore(snapshot: DriveSnapshot) -> Self {
        let mut engine = Self::new();
        for drive in snapshot.drives {
            engine.insert(drive);
        }
        engine.total_triggers = snapshot.total_triggers;
        engine.last_evaluation_time = snapshot.last_evaluation_time;
        engine
    }
}

impl Default for DriveEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(goals_p: f64, curiosity_p: f64) -> DriveEngine {
        let mut engine = DriveEngine::new();
        let mut goals = Drive::new("goals", 1.0, vec![], true, 0);
        goals.pressure = goals_p;
        engine.insert(goals);
        let mut curiosity = Drive::new("curiosity", 1.0, vec![], false, 0);
        curiosity.pressure = curiosity_p;
        engine.insert(curiosity);
        engine
    }

    #[test]
    fn tick_accumulates_pressure_per_minute() {
        let mut engine = DriveEngine::new();
        engine.insert(Drive::new("goals", 1.0, vec![], true, 0));
        engine.tick(60.0, 0.05, 20.0, 1.5, &[], &HashSet::new());
        assert!((engine.get("goals").unwrap().pressure - 0.05).abs() < 1e-9);
    }

    #[test]
    fn tick_clamps_to_max_pressure() {
        let mut engine = DriveEngine::new();
        let mut goals = Drive::new("goals", 1.0, vec![], true, 0);
        goals.pressure = 19.99;
        engine.insert(goals);
        engine.tick(600.0, 1.0, 20.0, 1.5, &[], &HashSet::new());
        assert_eq!(engine.get("goals").unwrap().pressure, 20.0);
    }

    #[test]
    fn tick_spikes_on_changed_source() {
        let mut engine = DriveEngine::new();
        engine.insert(Drive::new("goals", 1.0, vec!["notes.md".into()], true, 0));
        let mut changed = HashSet::new();
        changed.insert("notes.md".to_string());
        engine.tick(0.0, 0.0, 20.0, 1.5, &[], &changed);
        assert_eq!(engine.get("goals").unwrap().pressure, 1.5);
    }

    #[test]
    fn scenario_1_trigger_and_success_feedback_decays_top_drive() {
        let mut engine = engine_with(6.0, 0.0);
        let addressed = vec!["goals".to_string()];
        let result = engine.apply_feedback(&addressed, FeedbackOutcome::Success, 0.7, 2.0, 20.0);
        assert!((engine.get("goals").unwrap().pressure - 1.8).abs() < 1e-9);
        assert_eq!(engine.get("curiosity").unwrap().pressure, 0.0);
        assert!(result.contains_key("goals"));
        assert!(!result.contains_key("curiosity"));
    }

    #[test]
    fn scenario_2_proportional_decay_on_combined_trigger() {
        let mut engine = engine_with(3.0, 3.0);
        let addressed = vec!["goals".to_string()];
        engine.apply_feedback(&addressed, FeedbackOutcome::Success, 0.7, 2.0, 20.0);
        assert!((engine.get("goals").unwrap().pressure - 0.9).abs() < 1e-9);
        assert!((engine.get("curiosity").unwrap().pressure - 0.9).abs() < 1e-9);
        let total_after = engine.total_weighted_pressure();
        assert!(total_after <= 5.0);
    }

    #[test]
    fn failure_outcome_does_not_decay() {
        let mut engine = engine_with(6.0, 0.0);
        let addressed = vec!["goals".to_string()];
        let result = engine.apply_feedback(&addressed, FeedbackOutcome::Failure, 0.7, 2.0, 20.0);
        assert_eq!(engine.get("goals").unwrap().pressure, 6.0);
        assert!(result.is_empty());
    }

    #[test]
    fn feedback_on_removed_drive_is_a_no_op() {
        let mut engine = engine_with(6.0, 0.0);
        let addressed = vec!["nonexistent".to_string()];
        let result = engine.apply_feedback(&addressed, FeedbackOutcome::Success, 0.7, 2.0, 20.0);
        assert!(result.is_empty());
        assert_eq!(engine.get("goals").unwrap().pressure, 6.0);
    }

    #[test]
    fn add_drive_rejects_duplicate_name() {
        let mut engine = engine_with(0.0, 0.0);
        let err = engine.add_drive("goals", 1.0, vec![], false, 0).unwrap_err();
        assert_eq!(err, DriveEngineError::AlreadyExists("goals".into()));
    }

    #[test]
    fn remove_drive_rejects_protected() {
        let mut engine = engine_with(0.0, 0.0);
        let err = engine.remove_drive("goals").unwrap_err();
        assert_eq!(err, DriveEngineError::Protected("goals".into()));
    }

    #[test]
    fn remove_drive_succeeds_for_non_protected() {
        let mut engine = engine_with(0.0, 0.0);
        engine.remove_drive("curiosity").unwrap();
        assert!(engine.get("curiosity").is_none());
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn top_drive_breaks_ties_by_insertion_order() {
        let engine = engine_with(5.0, 5.0);
        assert_eq!(engine.top_drive().unwrap().name, "goals");
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let engine = engine_with(3.5, 2.1);
        let snap = engine.snapshot();
        let restored = DriveEngine::restore(snap);
        assert_eq!(restored.get("goals").unwrap().pressure, 3.5);
        assert_eq!(restored.get("curiosity").unwrap().pressure, 2.1);
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn repeated_zero_factor_decay_all_is_identity() {
        let mut engine = engine_with(3.0, 3.0);
        let before = engine.total_weighted_pressure();
        engine.apply_feedback(&[], FeedbackOutcome::Failure, 0.7, 2.0, 20.0);
        engine.apply_feedback(&[], FeedbackOutcome::Failure, 0.7, 2.0, 20.0);
        assert_eq!(engine.total_weighted_pressure(), before);
    }

    #[test]
    fn spike_then_decay_returns_to_start_within_epsilon() {
        let mut engine = engine_with(2.0, 0.0);
        engine.spike("goals", 3.0, 20.0).unwrap();
        engine.decay("goals", 3.0, 20.0).unwrap();
        assert!((engine.get("goals").unwrap().pressure - 2.0).abs() < 1e-9);
    }

    #[test]
    fn evolve_weights_bounds_delta_per_cycle() {
        let mut engine = engine_with(0.0, 0.0);
        let mut history = HashMap::new();
        history.insert("curiosity".to_string(), 5.0);
        engine.evolve_weights(&history, 0.2, 0.1, 3.0, 0.5);
        assert!((engine.get("curiosity").unwrap().weight - 1.2).abs() < 1e-9);
    }

    #[test]
    fn all_zero_weight_or_pressure_yields_zero_total() {
        let engine = engine_with(0.0, 0.0);
        assert_eq!(engine.total_weighted_pressure(), 0.0);
    }
}
