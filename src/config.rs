//! Daemon configuration: immutable file/CLI-loaded settings plus the
//! mutable subset the agent may adjust via mutations.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Names of drives the engine refuses to remove and clamps to a higher
/// weight floor. Fixed per spec, not configurable.
pub const PROTECTED_DRIVES: &[&str] = &["goals", "growth"];

fn default_http_port() -> u16 {
    9719
}

fn default_webhook_auth_header() -> String {
    "Authorization".to_string()
}

fn default_loop_interval_s() -> f64 {
    15.0
}

fn default_save_interval_s() -> f64 {
    60.0
}

fn default_trigger_threshold() -> f64 {
    5.0
}

fn default_high_p_threshold() -> f64 {
    10.0
}

fn default_idle_window_s() -> f64 {
    1800.0
}

fn default_exception_floor() -> f64 {
    1.5
}

fn default_pressure_rate() -> f64 {
    0.05
}

fn default_max_pressure() -> f64 {
    20.0
}

fn default_success_decay() -> f64 {
    0.7
}

fn default_proportional_decay_scale() -> f64 {
    2.0
}

fn default_min_trigger_interval_s() -> f64 {
    300.0
}

fn default_max_turns_per_hour() -> u32 {
    10
}

fn default_activity_threshold_s() -> f64 {
    300.0
}

fn default_spike_amount() -> f64 {
    1.5
}

fn default_weight_min() -> f64 {
    0.1
}

fn default_weight_max() -> f64 {
    3.0
}

fn default_weight_protected_min() -> f64 {
    0.5
}

fn default_max_evolution_delta() -> f64 {
    0.2
}

fn default_max_manual_delta() -> f64 {
    2.0
}

fn default_audit_max_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_mutation_rate_cap_per_hour() -> u32 {
    10
}

fn default_webhook_timeout_s() -> u64 {
    10
}

fn default_webhook_retries() -> u32 {
    3
}

fn default_model_recovery_interval_s() -> f64 {
    300.0
}

fn default_model_fail_threshold() -> u32 {
    3
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

/// A statically-declared drive loaded from config at first boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveSpec {
    pub name: String,
    #[serde(default = "default_weight_for_new_drive")]
    pub weight: f64,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub protected: bool,
}

fn default_weight_for_new_drive() -> f64 {
    1.0
}

fn default_drives() -> Vec<DriveSpec> {
    vec![
        DriveSpec {
            name: "goals".into(),
            weight: 1.0,
            sources: Vec::new(),
            protected: true,
        },
        DriveSpec {
            name: "growth".into(),
            weight: 1.0,
            sources: Vec::new(),
            protected: true,
        },
        DriveSpec {
            name: "curiosity".into(),
            weight: 1.0,
            sources: Vec::new(),
            protected: false,
        },
    ]
}

/// Which evaluator implementation the daemon uses (C6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    Rule,
    Model,
}

impl Default for EvaluatorKind {
    fn default() -> Self {
        EvaluatorKind::Rule
    }
}

/// Full daemon configuration, loaded from TOML and overridable by CLI flags.
///
/// Fields here are immutable at runtime except through the separate
/// [`ConfigOverrides`] layer, which is what mutations actually adjust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_host")]
    pub http_host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_token: Option<String>,
    #[serde(default = "default_webhook_auth_header")]
    pub webhook_auth_header: String,
    #[serde(default = "default_webhook_timeout_s")]
    pub webhook_timeout_s: u64,
    #[serde(default = "default_webhook_retries")]
    pub webhook_retries: u32,

    #[serde(default = "default_loop_interval_s")]
    pub loop_interval_s: f64,
    #[serde(default = "default_save_interval_s")]
    pub save_interval_s: f64,

    #[serde(default)]
    pub evaluator: EvaluatorKind,
    #[serde(default = "default_model_fail_threshold")]
    pub model_fail_threshold: u32,
    #[serde(default = "default_model_recovery_interval_s")]
    pub model_recovery_interval_s: f64,
    #[serde(default)]
    pub model_endpoint: Option<String>,

    #[serde(default = "default_high_p_threshold")]
    pub high_p_threshold: f64,
    #[serde(default = "default_idle_window_s")]
    pub idle_window_s: f64,
    #[serde(default = "default_exception_floor")]
    pub exception_floor: f64,
    #[serde(default = "default_activity_threshold_s")]
    pub activity_threshold_s: f64,

    #[serde(default = "default_weight_min")]
    pub weight_min: f64,
    #[serde(default = "default_weight_max")]
    pub weight_max: f64,
    #[serde(default = "default_weight_protected_min")]
    pub weight_protected_min: f64,
    #[serde(default = "default_max_evolution_delta")]
    pub max_evolution_delta: f64,
    #[serde(default = "default_max_manual_delta")]
    pub max_manual_delta: f64,
    #[serde(default = "default_spike_amount")]
    pub spike_amount: f64,
    #[serde(default = "default_proportional_decay_scale")]
    pub proportional_decay_scale: f64,

    #[serde(default = "default_audit_max_bytes")]
    pub audit_max_bytes: u64,
    #[serde(default = "default_mutation_rate_cap_per_hour")]
    pub mutation_rate_cap_per_hour: u32,

    #[serde(default = "default_drives")]
    pub drives: Vec<DriveSpec>,

    /// The mutable subset' starting values; overridden at runtime by
    /// persisted [`ConfigOverrides`] if present.
    #[serde(flatten)]
    pub mutable: ConfigOverrides,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: default_bind_host(),
            http_port: default_http_port(),
            webhook_url: None,
            webhook_token: None,
            webhook_auth_header: default_webhook_auth_header(),
            webhook_timeout_s: default_webhook_timeout_s(),
            webhook_retries: default_webhook_retries(),
            loop_interval_s: default_loop_interval_s(),
            save_interval_s: default_save_interval_s(),
            evaluator: EvaluatorKind::default(),
            model_fail_threshold: default_model_fail_threshold(),
            model_recovery_interval_s: default_model_recovery_interval_s(),
            model_endpoint: None,
            high_p_threshold: default_high_p_threshold(),
            idle_window_s: default_idle_window_s(),
            exception_floor: default_exception_floor(),
            activity_threshold_s: default_activity_threshold_s(),
            weight_min: default_weight_min(),
            weight_max: default_weight_max(),
            weight_protected_min: default_weight_protected_min(),
            max_evolution_delta: default_max_evolution_delta(),
            max_manual_delta: default_max_manual_delta(),
            spike_amount: default_spike_amount(),
            proportional_decay_scale: default_proportional_decay_scale(),
            audit_max_bytes: default_audit_max_bytes(),
            mutation_rate_cap_per_hour: default_mutation_rate_cap_per_hour(),
            drives: default_drives(),
            mutable: ConfigOverrides::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults if `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.weight_min > self.weight_max {
            return Err(ConfigError::Invalid {
                message: "weight_min must be <= weight_max".into(),
            });
        }
        if self.weight_protected_min < self.weight_min || self.weight_protected_min > self.weight_max
        {
            return Err(ConfigError::Invalid {
                message: "weight_protected_min must lie within [weight_min, weight_max]".into(),
            });
        }
        for spec in &self.drives {
            if spec.name.is_empty() {
                return Err(ConfigError::Invalid {
                    message: "drive name must not be empty".into(),
                });
            }
        }
        Ok(())
    }
}

/// The mutable subset of config the agent may adjust via mutations
/// (spec.md §3, §4.4). Persisted separately from the loaded file so a
/// mutation never has to rewrite it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: f64,
    #[serde(default = "default_pressure_rate")]
    pub pressure_rate: f64,
    #[serde(default = "default_max_pressure")]
    pub max_pressure: f64,
    #[serde(default = "default_success_decay")]
    pub success_decay: f64,
    #[serde(default = "default_min_trigger_interval_s")]
    pub min_trigger_interval_s: f64,
    #[serde(default = "default_max_turns_per_hour")]
    pub max_turns_per_hour: u32,
    /// Per-drive weight and source overrides, keyed by drive name.
    #[serde(default)]
    pub drive_weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub drive_sources: BTreeMap<String, Vec<String>>,
}

impl Default for ConfigOverrides {
    fn default() -> Self {
        Self {
            trigger_threshold: default_trigger_threshold(),
            pressure_rate: default_pressure_rate(),
            max_pressure: default_max_pressure(),
            success_decay: default_success_decay(),
            min_trigger_interval_s: default_min_trigger_interval_s(),
            max_turns_per_hour: default_max_turns_per_hour(),
            drive_weights: BTreeMap::new(),
            drive_sources: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn is_protected(name: &str) -> bool {
        PROTECTED_DRIVES.contains(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_protected_drives() {
        let config = Config::default();
        let names: Vec<_> = config.drives.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"goals"));
        assert!(names.contains(&"growth"));
        assert!(config.drives.iter().find(|d| d.name == "goals").unwrap().protected);
    }

    #[test]
    fn load_without_path_returns_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.http_port, 9719);
    }

    #[test]
    fn load_rejects_invalid_weight_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "weight_min = 5.0\nweight_max = 1.0\n").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn load_parses_overrides_from_flattened_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.toml");
        std::fs::write(&path, "trigger_threshold = 7.5\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.mutable.trigger_threshold, 7.5);
    }
}
