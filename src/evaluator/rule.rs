//! Threshold-based evaluator: the "EXCEPTION-rule guard" design
//! (spec.md §4.2).

use crate::drive::DriveEngine;
use crate::evaluator::{Evaluator, EvaluatorMode, TriggerDecision};
use crate::sensors::{conversation_active, idle_seconds, Reading};

#[derive(Debug, Clone)]
pub struct RuleEvaluatorConfig {
    pub trigger_threshold: f64,
    pub exception_floor: f64,
    pub high_p_threshold: f64,
    pub idle_window_s: f64,
    pub activity_threshold_s: f64,
}

pub struct RuleEvaluator {
    pub config: RuleEvaluatorConfig,
}

impl RuleEvaluator {
    pub fn new(config: RuleEvaluatorConfig) -> Self {
        Self { config }
    }
}

impl Evaluator for RuleEvaluator {
    fn decide(&mut self, engine: &DriveEngine, readings: &[Reading], _now_unix: u64, _now_monotonic: f64) -> TriggerDecision {
        let total_pressure = engine.total_weighted_pressure();

        if conversation_active(readings, self.config.activity_threshold_s) {
            return TriggerDecision::no_trigger("conversation suppressed", total_pressure);
        }

        let top = engine.top_drive();
        let top_pair = top.map(|d| (d.name.clone(), d.weighted_pressure()));

        // High-pressure override: wins unconditionally once pressure and
        // idle time both clear their bars (spec.md §4.2).
        let idle = idle_seconds(readings).unwrap_or(f64::MAX);
        if total_pressure > self.config.high_p_threshold && idle > self.config.idle_window_s {
            return TriggerDecision {
                should_trigger: true,
                reason: "high pressure override".to_string(),
                top_drive: top_pair,
                total_pressure,
                sensor_context: format!("idle {idle:.0}s"),
                suppress_for: None,
            };
        }

        let exceeds_floor = top.map(|d| d.weighted_pressure() > self.config.exception_floor).unwrap_or(false);

        if total_pressure >= self.config.trigger_threshold && exceeds_floor {
            return TriggerDecision {
                should_trigger: true,
                reason: "threshold exceeded".to_string(),
                top_drive: top_pair,
                total_pressure,
                sensor_context: String::new(),
                suppress_for: None,
            };
        }

        TriggerDecision::no_trigger("below threshold", total_pressure)
    }

    fn mode(&self) -> EvaluatorMode {
        EvaluatorMode::Rule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::Drive;

    fn config() -> RuleEvaluatorConfig {
        RuleEvaluatorConfig {
            trigger_threshold: 5.0,
            exception_floor: 1.5,
            high_p_threshold: 10.0,
            idle_window_s: 1800.0,
            activity_threshold_s: 300.0,
        }
    }

    #[test]
    fn single_drive_above_threshold_and_floor_triggers() {
        let mut engine = DriveEngine::new();
        let mut d = Drive::new("goals", 1.0, vec![], true, 0);
        d.pressure = 5.1;
        engine.insert(d);
        let mut eval = RuleEvaluator::new(config());
        let decision = eval.decide(&engine, &[], 0, 0.0);
        assert!(decision.should_trigger);
        assert_eq!(decision.top_drive.unwrap().0, "goals");
    }

    #[test]
    fn six_small_drives_below_floor_do_not_trigger() {
        let mut engine = DriveEngine::new();
        for i in 0..6 {
            let mut d = Drive::new(format!("d{i}"), 1.0, vec![], false, 0);
            d.pressure = 0.85;
            engine.insert(d);
        }
        let mut eval = RuleEvaluator::new(config());
        let decision = eval.decide(&engine, &[], 0, 0.0);
        assert!((engine.total_weighted_pressure() - 5.1).abs() < 1e-9);
        assert!(!decision.should_trigger);
    }

    #[test]
    fn high_pressure_override_ignores_floor_when_idle() {
        let mut engine = DriveEngine::new();
        for i in 0..6 {
            let mut d = Drive::new(format!("d{i}"), 1.0, vec![], false, 0);
            d.pressure = 1.8;
            engine.insert(d);
        }
        assert!(engine.total_weighted_pressure() > 10.0);
        let readings = vec![crate::sensors::Reading {
            sensor: "conversation".into(),
            monotonic_secs: 0.0,
            payload: crate::sensors::ReadingPayload::ConversationActivity {
                active: false,
                seconds_since_last_message: 3600.0,
            },
            spike_directives: vec![],
            stale: false,
        }];
        let mut eval = RuleEvaluator::new(config());
        let decision = eval.decide(&engine, &readings, 0, 0.0);
        assert!(decision.should_trigger);
        assert_eq!(decision.reason, "high pressure override");
    }

    #[test]
    fn active_conversation_suppresses_trigger() {
        let mut engine = DriveEngine::new();
        let mut d = Drive::new("goals", 1.0, vec![], true, 0);
        d.pressure = 20.0;
        engine.insert(d);
        let readings = vec![crate::sensors::Reading {
            sensor: "conversation".into(),
            monotonic_secs: 0.0,
            payload: crate::sensors::ReadingPayload::ConversationActivity {
                active: true,
                seconds_since_last_message: 1.0,
            },
            spike_directives: vec![],
            stale: false,
        }];
        let mut eval = RuleEvaluator::new(config());
        let decision = eval.decide(&engine, &readings, 0, 0.0);
        assert!(!decision.should_trigger);
        assert_eq!(decision.reason, "conversation suppressed");
    }
}
