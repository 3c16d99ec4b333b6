//! LLM-backed evaluator with automatic degraded-mode fallback to the
//! rule evaluator (spec.md §4.2).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drive::DriveEngine;
use crate::evaluator::rule::RuleEvaluator;
use crate::evaluator::{Evaluator, EvaluatorMode, TriggerDecision};
use crate::sensors::{conversation_active, idle_seconds, Reading};

#[derive(Debug, Serialize)]
struct ModelRequest<'a> {
    drives: Vec<DriveSummary>,
    sensor_summary: &'a str,
    working_memory_hint: &'a str,
}

#[derive(Debug, Serialize)]
struct DriveSummary {
    name: String,
    pressure: f64,
    weight: f64,
}

#[derive(Debug, Deserialize)]
struct ModelResponse {
    should_trigger: bool,
    reason: String,
    #[serde(default)]
    suppress_minutes: Option<f64>,
}

pub struct ModelEvaluatorConfig {
    pub endpoint: String,
    pub fail_threshold: u32,
    pub recovery_interval_s: f64,
    pub request_timeout_s: u64,
    pub activity_threshold_s: f64,
    pub high_p_threshold: f64,
    pub idle_window_s: f64,
}

/// Composes a structured prompt from drive state and sensor summaries
/// and asks an external LLM whether to trigger. Falls back to a rule
/// evaluator after `N_fail` consecutive failures and probes for
/// recovery every `recovery_interval_s`.
pub struct ModelEvaluator {
    config: ModelEvaluatorConfig,
    agent: ureq::Agent,
    fallback: RuleEvaluator,
    consecutive_failures: u32,
    degraded: bool,
    last_probe_monotonic: f64,
    suppress_until_monotonic: Option<f64>,
}

impl ModelEvaluator {
    pub fn new(config: ModelEvaluatorConfig, fallback: RuleEvaluator) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.request_timeout_s))
            .build();
        Self {
            config,
            agent,
            fallback,
            consecutive_failures: 0,
            degraded: false,
            last_probe_monotonic: f64::NEG_INFINITY,
            suppress_until_monotonic: None,
        }
    }

    fn call_model(&self, engine: &DriveEngine, readings: &[Reading]) -> Result<ModelResponse, String> {
        let drives = engine
            .iter()
            .map(|d| DriveSummary {
                name: d.name.clone(),
                pressure: d.pressure,
                weight: d.weight,
            })
            .collect();
        let sensor_summary = if conversation_active(readings, self.config.activity_threshold_s) {
            "conversation active"
        } else {
            "idle"
        };
        let request = ModelRequest {
            drives,
            sensor_summary,
            working_memory_hint: "",
        };

        let response = self
            .agent
            .post(&self.config.endpoint)
            .send_json(ureq::json!(request));

        match response {
            Ok(resp) => resp
                .into_json::<ModelResponse>()
                .map_err(|e| format!("parse error: {e}")),
            Err(ureq::Error::Status(code, _)) => Err(format!("status {code}")),
            Err(ureq::Error::Transport(t)) => Err(format!("transport error: {t}")),
        }
    }

    fn high_pressure_override(&self, engine: &DriveEngine, readings: &[Reading]) -> Option<TriggerDecision> {
        let total_pressure = engine.total_weighted_pressure();
        let idle = idle_seconds(readings).unwrap_or(f64::MAX);
        if total_pressure > self.config.high_p_threshold && idle > self.config.idle_window_s {
            let top_drive = engine.top_drive().map(|d| (d.name.clone(), d.weighted_pressure()));
            return Some(TriggerDecision {
                should_trigger: true,
                reason: "high pressure override".to_string(),
                top_drive,
                total_pressure,
                sensor_context: format!("idle {idle:.0}s"),
                suppress_for: None,
            });
        }
        None
    }
}

impl Evaluator for ModelEvaluator {
    fn decide(&mut self, engine: &DriveEngine, readings: &[Reading], now_unix: u64, now_monotonic: f64) -> TriggerDecision {
        // High-pressure override always wins, even in model mode (spec.md §4.2).
        if let Some(decision) = self.high_pressure_override(engine, readings) {
            return decision;
        }

        if conversation_active(readings, self.config.activity_threshold_s) {
            return TriggerDecision::no_trigger("conversation suppressed", engine.total_weighted_pressure());
        }

        if let Some(until) = self.suppress_until_monotonic {
            if now_monotonic < until {
                return TriggerDecision::no_trigger("suppressed by evaluator", engine.total_weighted_pressure());
            }
            self.suppress_until_monotonic = None;
        }

        if self.degraded {
            let due_for_probe = now_monotonic - self.last_probe_monotonic >= self.config.recovery_interval_s;
            if !due_for_probe {
                return self.fallback.decide(engine, readings, now_unix, now_monotonic);
            }
            self.last_probe_monotonic = now_monotonic;
        }

        match self.call_model(engine, readings) {
            Ok(response) => {
                self.consecutive_failures = 0;
                self.degraded = false;
                if let Some(minutes) = response.suppress_minutes {
                    if minutes > 0.0 {
                        self.suppress_until_monotonic = Some(now_monotonic + minutes * 60.0);
                    }
                }
                let top_drive = engine.top_drive().map(|d| (d.name.clone(), d.weighted_pressure()));
                TriggerDecision {
                    should_trigger: response.should_trigger,
                    reason: response.reason,
                    top_drive,
                    total_pressure: engine.total_weighted_pressure(),
                    sensor_context: String::new(),
                    suppress_for: response.suppress_minutes.map(|m| Duration::from_secs_f64(m * 60.0)),
                }
            }
            Err(err) => {
                self.consecutive_failures += 1;
                tracing::warn!(error = %err, failures = self.consecutive_failures, "model evaluator call failed");
                if self.consecutive_failures >= self.config.fail_threshold {
                    self.degraded = true;
                    self.last_probe_monotonic = now_monotonic;
                }
                self.fallback.decide(engine, readings, now_unix, now_monotonic)
            }
        }
    }

    fn mode(&self) -> EvaluatorMode {
        if self.degraded {
            EvaluatorMode::Degraded
        } else {
            EvaluatorMode::Model
        }
    }
}
