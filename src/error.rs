//! Rich diagnostic error types for the pulse daemon.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]`
//! derives, providing error codes, help text, and source chains so
//! operators know exactly what went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the pulse daemon.
///
/// Each variant wraps a subsystem-specific error, preserving the full
/// diagnostic chain (error codes, help text, source spans) through to
/// the operator.
#[derive(Debug, Error, Diagnostic)]
pub enum PulseError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Guardrail(#[from] GuardrailError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] PathError),
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file: {path}")]
    #[diagnostic(
        code(pulse::config::read),
        help("Check that the file exists and is readable, or omit --config to use defaults.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {path}")]
    #[diagnostic(
        code(pulse::config::parse),
        help("The config file must be valid TOML. Check for syntax errors near the reported line.")
    )]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration value: {message}")]
    #[diagnostic(
        code(pulse::config::invalid),
        help("Check the config reference for valid ranges for this field.")
    )]
    Invalid { message: String },
}

// ---------------------------------------------------------------------------
// State store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StateError {
    #[error("I/O error accessing state directory: {source}")]
    #[diagnostic(
        code(pulse::state::io),
        help(
            "A filesystem operation failed. Check that the state directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("state file is corrupt or unreadable: {message}")]
    #[diagnostic(
        code(pulse::state::corrupt),
        help(
            "The persisted state file could not be parsed. If this is a fresh \
             install, remove the state directory. Otherwise restore from a backup."
        )
    )]
    Corrupt { message: String },

    #[error("another pulse daemon already owns state directory {path} (pid {pid})")]
    #[diagnostic(
        code(pulse::state::locked),
        help(
            "Only one daemon may run per state directory. Stop the other process \
             or point --state-dir at a different directory."
        )
    )]
    Locked { path: String, pid: u32 },
}

// ---------------------------------------------------------------------------
// Guardrail errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GuardrailError {
    #[error("mutation rejected by guardrail \"{rule}\": {message}")]
    #[diagnostic(
        code(pulse::guardrail::rejected),
        help("Adjust the submitted value to satisfy the guardrail, or consult the audit log for the rule that blocked it.")
    )]
    Rejected { rule: String, message: String },

    #[error("mutation rate limit exceeded: {count} mutations in the last hour (cap {cap})")]
    #[diagnostic(
        code(pulse::guardrail::rate_limit),
        help("Wait for the rolling hourly window to free up, or raise max_turns_per_hour via config.")
    )]
    RateLimitExceeded { count: usize, cap: usize },
}

impl GuardrailError {
    /// The rule name recorded in the audit log for a rejected mutation.
    pub fn rule_name(&self) -> &str {
        match self {
            GuardrailError::Rejected { rule, .. } => rule,
            GuardrailError::RateLimitExceeded { .. } => "rate_limit_exceeded",
        }
    }
}

// ---------------------------------------------------------------------------
// Mutation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum MutationError {
    #[error("malformed mutation: {message}")]
    #[diagnostic(
        code(pulse::mutation::malformed),
        help("Check that the mutation object has the required fields for its kind.")
    )]
    Malformed { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Guardrail(#[from] GuardrailError),

    #[error("drive \"{name}\" already exists")]
    #[diagnostic(
        code(pulse::mutation::already_exists),
        help("Choose a different drive name, or remove the existing drive first.")
    )]
    AlreadyExists { name: String },

    #[error("drive \"{name}\" not found")]
    #[diagnostic(
        code(pulse::mutation::not_found),
        help("Check /state for the current list of drive names.")
    )]
    DriveNotFound { name: String },

    #[error("cannot remove protected drive \"{name}\"")]
    #[diagnostic(
        code(pulse::mutation::protected),
        help("Protected drives cannot be removed. Adjust its weight instead.")
    )]
    ProtectedDrive { name: String },
}

// ---------------------------------------------------------------------------
// Webhook errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum WebhookError {
    #[error("webhook request timed out after {timeout_s}s")]
    #[diagnostic(
        code(pulse::webhook::timeout),
        help("The agent host did not respond in time. Check its health, or raise webhook_timeout_s.")
    )]
    Timeout { timeout_s: u64 },

    #[error("webhook transport error: {message}")]
    #[diagnostic(
        code(pulse::webhook::transport),
        help("Check network connectivity to the configured webhook URL.")
    )]
    Transport { message: String },

    #[error("webhook returned client error status {status}")]
    #[diagnostic(
        code(pulse::webhook::client_error),
        help("A 4xx response is not retried. Check the webhook URL, auth token, and payload shape.")
    )]
    ClientError { status: u16 },

    #[error("webhook returned server error status {status} after {attempts} attempts")]
    #[diagnostic(
        code(pulse::webhook::server_error),
        help("The agent host repeatedly failed. Check its logs.")
    )]
    ServerError { status: u16, attempts: u32 },
}

// ---------------------------------------------------------------------------
// Sensor errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SensorError {
    #[error("sensor \"{name}\" timed out")]
    #[diagnostic(
        code(pulse::sensor::timeout),
        help("The sensor's read budget was exceeded; stale data will be used this tick.")
    )]
    Timeout { name: String },

    #[error("sensor \"{name}\" I/O error: {message}")]
    #[diagnostic(
        code(pulse::sensor::io),
        help("Check the resource the sensor reads (files, subprocess, etc).")
    )]
    Io { name: String, message: String },
}

// ---------------------------------------------------------------------------
// Path errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("cannot determine home directory")]
    #[diagnostic(
        code(pulse::paths::no_home),
        help("Set the HOME environment variable, or pass --state-dir explicitly.")
    )]
    NoHome,

    #[error("failed to create directory: {path}")]
    #[diagnostic(
        code(pulse::paths::create_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience alias for functions returning pulse results.
pub type PulseResult<T> = std::result::Result<T, PulseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guardrail_error_converts_to_pulse_error() {
        let err = GuardrailError::RateLimitExceeded { count: 11, cap: 10 };
        let pulse: PulseError = err.into();
        assert!(matches!(
            pulse,
            PulseError::Guardrail(GuardrailError::RateLimitExceeded { .. })
        ));
    }

    #[test]
    fn mutation_error_wraps_guardrail_error() {
        let guardrail_err = GuardrailError::Rejected {
            rule: "adjust_weight".into(),
            message: "out of bounds".into(),
        };
        let mutation_err: MutationError = guardrail_err.into();
        assert!(matches!(mutation_err, MutationError::Guardrail(_)));
    }

    #[test]
    fn guardrail_error_rule_name_is_stable() {
        let err = GuardrailError::Rejected {
            rule: "adjust_threshold".into(),
            message: "out of range".into(),
        };
        assert_eq!(err.rule_name(), "adjust_threshold");

        let rate_err = GuardrailError::RateLimitExceeded { count: 1, cap: 1 };
        assert_eq!(rate_err.rule_name(), "rate_limit_exceeded");
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = StateError::Locked {
            path: "/tmp/pulse".into(),
            pid: 1234,
        };
        let msg = format!("{err}");
        assert!(msg.contains("1234"));
        assert!(msg.contains("/tmp/pulse"));
    }
}
