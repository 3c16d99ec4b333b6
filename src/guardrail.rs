//! Pure-logic predicate layer called by the Mutator before any mutation
//! is applied (C7). Rejections never mutate state; they produce an
//! [`AuditEntry`](crate::audit::AuditEntry) with `outcome = "rejected"`
//! and the rule name.

use std::collections::VecDeque;

use crate::config::Config;
use crate::error::GuardrailError;
use crate::mutation::{Mutation, MutationKind};

/// Bounds and limits the guardrail layer enforces, derived from config.
#[derive(Debug, Clone)]
pub struct GuardrailLimits {
    pub weight_min: f64,
    pub weight_max: f64,
    pub weight_protected_min: f64,
    pub max_weight_delta_per_call: f64,
    pub threshold_range: (f64, f64),
    pub rate_range: (f64, f64),
    pub cooldown_range_s: (f64, f64),
    pub turns_per_hour_range: (u32, u32),
    pub max_manual_delta: f64,
    pub mutation_rate_cap_per_hour: u32,
}

impl GuardrailLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            weight_min: config.weight_min,
            weight_max: config.weight_max,
            weight_protected_min: config.weight_protected_min,
            max_weight_delta_per_call: 0.1,
            threshold_range: (0.5, 50.0),
            rate_range: (0.001, 1.0),
            cooldown_range_s: (60.0, 7200.0),
            turns_per_hour_range: (1, 60),
            max_manual_delta: config.max_manual_delta,
            mutation_rate_cap_per_hour: config.mutation_rate_cap_per_hour,
        }
    }

    pub fn weight_floor(&self, protected: bool) -> f64 {
        if protected {
            self.weight_protected_min
        } else {
            self.weight_min
        }
    }
}

/// Tracks the rolling-hour mutation rate limit. Persisted as a flat list
/// of unix-second timestamps so restarts do not reset the window
/// (spec.md §4.3, §8 "hourly mutation cap holds across a simulated restart").
#[derive(Debug, Clone, Default)]
pub struct RateWindow {
    timestamps: VecDeque<u64>,
}

const ROLLING_WINDOW_SECS: u64 = 3600;

impl RateWindow {
    pub fn from_timestamps(timestamps: Vec<u64>) -> Self {
        Self {
            timestamps: timestamps.into(),
        }
    }

    pub fn to_vec(&self) -> Vec<u64> {
        self.timestamps.iter().copied().collect()
    }

    fn prune(&mut self, now_unix: u64) {
        while let Some(&front) = self.timestamps.front() {
            if now_unix.saturating_sub(front) > ROLLING_WINDOW_SECS {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn count_in_window(&mut self, now_unix: u64) -> usize {
        self.prune(now_unix);
        self.timestamps.len()
    }

    /// Check the cap without recording; callers record only on accept.
    pub fn would_exceed(&mut self, now_unix: u64, cap: u32) -> bool {
        self.count_in_window(now_unix) >= cap as usize
    }

    pub fn record(&mut self, now_unix: u64) {
        self.timestamps.push_back(now_unix);
    }
}

/// Applies the per-kind value checks in spec.md §4.3's table.
pub struct Guardrails {
    pub limits: GuardrailLimits,
}

impl Guardrails {
    pub fn new(limits: GuardrailLimits) -> Self {
        Self { limits }
    }

    /// Check the global rolling-hour rate limit. Must be called before
    /// per-kind validation so a rate-limited mutation never reaches the
    /// Drive Engine (spec.md §4.4 "validation precedes effect").
    pub fn check_rate_limit(&self, window: &mut RateWindow, now_unix: u64) -> Result<(), GuardrailError> {
        let cap = self.limits.mutation_rate_cap_per_hour;
        if window.would_exceed(now_unix, cap) {
            return Err(GuardrailError::RateLimitExceeded {
                count: window.count_in_window(now_unix),
                cap: cap as usize,
            });
        }
        Ok(())
    }

    /// Validate and, if needed, clamp a mutation's kind-specific value.
    /// Returns the (possibly clamped) effective value to apply, or an
    /// error describing which rule rejected it.
    pub fn check(&self, mutation: &Mutation, current_weight: Option<f64>, drive_protected: bool) -> Result<f64, GuardrailError> {
        match &mutation.kind {
            MutationKind::AdjustWeight { delta, .. } => {
                if delta.abs() > self.limits.max_weight_delta_per_call {
                    return Err(GuardrailError::Rejected {
                        rule: "adjust_weight".to_string(),
                        message: format!(
                            "delta {delta} exceeds max per-call bound {}",
                            self.limits.max_weight_delta_per_call
                        ),
                    });
                }
                let floor = self.limits.weight_floor(drive_protected);
                let base = current_weight.unwrap_or(floor);
                Ok((base + delta).clamp(floor, self.limits.weight_max))
            }
            MutationKind::AdjustThreshold { value } => {
                self.check_range("adjust_threshold", *value, self.limits.threshold_range)
            }
            MutationKind::AdjustRate { value } => self.check_range("adjust_rate", *value, self.limits.rate_range),
            MutationKind::AdjustCooldown { value_s } => {
                self.check_range("adjust_cooldown", *value_s, self.limits.cooldown_range_s)
            }
            MutationKind::AdjustTurnsPerHour { value } => {
                let (lo, hi) = self.limits.turns_per_hour_range;
                if *value < lo || *value > hi {
                    return Err(GuardrailError::Rejected {
                        rule: "adjust_turns_per_hour".to_string(),
                        message: format!("{value} outside [{lo}, {hi}]"),
                    });
                }
                Ok(*value as f64)
            }
            MutationKind::AddDrive { name, .. } => {
                if name.trim().is_empty() {
                    return Err(GuardrailError::Rejected {
                        rule: "add_drive".to_string(),
                        message: "drive name must not be empty".to_string(),
                    });
                }
                Ok(0.0)
            }
            MutationKind::RemoveDrive { .. } => {
                if drive_protected {
                    return Err(GuardrailError::Rejected {
                        rule: "remove_drive".to_string(),
                        message: "protected drives cannot be removed".to_string(),
                    });
                }
                Ok(0.0)
            }
            MutationKind::SpikeDrive { delta, .. } | MutationKind::DecayDrive { delta, .. } => {
                if delta.abs() > self.limits.max_manual_delta {
                    return Err(GuardrailError::Rejected {
                        rule: "spike_or_decay_drive".to_string(),
                        message: format!("|delta|={} exceeds max_manual_delta", delta.abs()),
                    });
                }
                Ok(*delta)
            }
        }
    }

    fn check_range(&self, rule: &str, value: f64, (lo, hi): (f64, f64)) -> Result<f64, GuardrailError> {
        if value < lo || value > hi {
            return Err(GuardrailError::Rejected {
                rule: rule.to_string(),
                message: format!("{value} outside [{lo}, {hi}]"),
            });
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Mutation;

    fn limits() -> GuardrailLimits {
        GuardrailLimits {
            weight_min: 0.1,
            weight_max: 3.0,
            weight_protected_min: 0.5,
            max_weight_delta_per_call: 0.1,
            threshold_range: (0.5, 50.0),
            rate_range: (0.001, 1.0),
            cooldown_range_s: (60.0, 7200.0),
            turns_per_hour_range: (1, 60),
            max_manual_delta: 2.0,
            mutation_rate_cap_per_hour: 10,
        }
    }

    #[test]
    fn adjust_threshold_out_of_range_is_rejected() {
        let guardrails = Guardrails::new(limits());
        let mutation = Mutation::new(
            MutationKind::AdjustThreshold { value: 100.0 },
            "too high".to_string(),
            0,
        );
        let err = guardrails.check(&mutation, None, false).unwrap_err();
        assert_eq!(err.rule_name(), "adjust_threshold");
    }

    #[test]
    fn adjust_weight_delta_bound_enforced() {
        let guardrails = Guardrails::new(limits());
        let mutation = Mutation::new(
            MutationKind::AdjustWeight {
                name: "curiosity".to_string(),
                delta: 0.5,
            },
            "too big".to_string(),
            0,
        );
        let err = guardrails.check(&mutation, Some(1.0), false).unwrap_err();
        assert_eq!(err.rule_name(), "adjust_weight");
    }

    #[test]
    fn adjust_weight_clamps_to_protected_floor() {
        let guardrails = Guardrails::new(limits());
        let mutation = Mutation::new(
            MutationKind::AdjustWeight {
                name: "goals".to_string(),
                delta: -0.1,
            },
            "lower".to_string(),
            0,
        );
        let effective = guardrails.check(&mutation, Some(0.55), true).unwrap();
        assert!(effective >= 0.5);
    }

    #[test]
    fn remove_protected_drive_is_rejected() {
        let guardrails = Guardrails::new(limits());
        let mutation = Mutation::new(
            MutationKind::RemoveDrive { name: "goals".to_string() },
            "cleanup".to_string(),
            0,
        );
        let err = guardrails.check(&mutation, None, true).unwrap_err();
        assert_eq!(err.rule_name(), "remove_drive");
    }

    #[test]
    fn rate_window_persists_across_simulated_restart() {
        let mut window = RateWindow::from_timestamps(vec![100, 200, 300]);
        // Simulate a restart: rebuild from the same persisted vec.
        let restored = RateWindow::from_timestamps(window.to_vec());
        window = restored;
        assert_eq!(window.count_in_window(400), 3);
    }

    #[test]
    fn rate_window_prunes_entries_older_than_one_hour() {
        let mut window = RateWindow::from_timestamps(vec![0, 3500]);
        assert_eq!(window.count_in_window(3700), 1);
    }

    #[test]
    fn tenth_mutation_allowed_eleventh_rejected() {
        let guardrails = Guardrails::new(limits());
        let mut window = RateWindow::default();
        for i in 0..10 {
            guardrails.check_rate_limit(&mut window, i).unwrap();
            window.record(i);
        }
        let err = guardrails.check_rate_limit(&mut window, 10).unwrap_err();
        assert_eq!(err.rule_name(), "rate_limit_exceeded");
    }
}
