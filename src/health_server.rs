//! HTTP surface: `/health`, `/state`, `/config`, `/feedback`, `/trigger`,
//! `/metrics`, `/mutations` (C10).
//!
//! GET requests are served from a read-only snapshot produced at the end
//! of each main-loop iteration (double-buffered); writes are forwarded
//! to the main loop over a bounded channel and never mutate core state
//! directly from a request handler (spec.md §5).

use std::sync::{Arc, RwLock};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;

use crate::audit::AuditEntry;
use crate::config::ConfigOverrides;
use crate::drive::FeedbackOutcome;
use crate::state::LastTrigger;

#[derive(Debug, Clone, Serialize)]
pub struct DriveView {
    pub name: String,
    pub pressure: f64,
    pub weight: f64,
    pub last_addressed: u64,
    pub sources: Vec<String>,
    pub protected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub drives: Vec<DriveView>,
    pub sensor_summary: String,
    pub config: ConfigOverrides,
    pub rate_limit_window_count: usize,
    pub rate_limit_cap: u32,
    pub last_trigger: LastTrigger,
    pub evaluator_mode: String,
}

/// The read-only snapshot published once per loop iteration.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub started_at_unix: u64,
    pub uptime_s: f64,
    pub version: &'static str,
    pub state_view: StateView,
    pub triggers_total: u64,
    pub feedback_success: u64,
    pub feedback_partial: u64,
    pub feedback_failure: u64,
    pub unknown_field_warnings: u64,
    pub mutator_enabled: bool,
}

/// A request the HTTP layer cannot satisfy itself, forwarded to the main
/// loop and drained each iteration (spec.md §5, §4.9).
pub enum DaemonCommand {
    SubmitMutation {
        mutation: crate::mutation::Mutation,
        respond: oneshot::Sender<Result<(), String>>,
    },
    ForceTrigger {
        respond: oneshot::Sender<ForceTriggerOutcome>,
    },
    Feedback {
        drives_addressed: Vec<String>,
        outcome: FeedbackOutcome,
        respond: oneshot::Sender<std::collections::HashMap<String, (f64, f64)>>,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum ForceTriggerOutcome {
    Dispatched,
    RateLimited,
    WebhookFailed,
}

#[derive(Clone)]
pub struct ServerState {
    pub snapshot: Arc<RwLock<ServerSnapshot>>,
    pub audit_tail: Arc<dyn Fn(usize) -> Vec<AuditEntry> + Send + Sync>,
    pub commands: mpsc::Sender<DaemonCommand>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(state_handler))
        .route("/config", get(get_config).post(post_config))
        .route("/trigger", post(trigger))
        .route("/feedback", post(feedback))
        .route("/mutations", get(mutations))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_s: f64,
    version: &'static str,
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let snapshot = state.snapshot.read().expect("snapshot lock poisoned");
    Json(HealthResponse {
        status: "ok",
        uptime_s: snapshot.uptime_s,
        version: snapshot.version,
    })
}

async fn state_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let snapshot = state.snapshot.read().expect("snapshot lock poisoned");
    Json(snapshot.state_view.clone())
}

async fn get_config(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let snapshot = state.snapshot.read().expect("snapshot lock poisoned");
    Json(snapshot.state_view.config.clone())
}

async fn post_config(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<crate::mutation::Mutation>,
) -> impl IntoResponse {
    let mutator_enabled = state.snapshot.read().expect("snapshot lock poisoned").mutator_enabled;
    if !mutator_enabled {
        return (StatusCode::FORBIDDEN, "mutator disabled").into_response();
    }

    let (tx, rx) = oneshot::channel();
    if state
        .commands
        .send(DaemonCommand::SubmitMutation { mutation: body, respond: tx })
        .await
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "daemon loop unavailable").into_response();
    }

    match rx.await {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(message)) => (StatusCode::BAD_REQUEST, message).into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "no response from daemon loop").into_response(),
    }
}

async fn trigger(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    if state.commands.send(DaemonCommand::ForceTrigger { respond: tx }).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match rx.await {
        Ok(ForceTriggerOutcome::Dispatched) => StatusCode::OK.into_response(),
        Ok(ForceTriggerOutcome::RateLimited) => StatusCode::TOO_MANY_REQUESTS.into_response(),
        Ok(ForceTriggerOutcome::WebhookFailed) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    drives_addressed: Vec<String>,
    outcome: String,
    #[serde(default)]
    #[allow(dead_code)]
    summary: Option<String>,
}

#[derive(Serialize)]
struct FeedbackResponse {
    changes: std::collections::HashMap<String, (f64, f64)>,
}

async fn feedback(State(state): State<Arc<ServerState>>, Json(body): Json<FeedbackRequest>) -> impl IntoResponse {
    let outcome = match body.outcome.as_str() {
        "success" => FeedbackOutcome::Success,
        "partial" => FeedbackOutcome::Partial,
        "failure" => FeedbackOutcome::Failure,
        other => return (StatusCode::BAD_REQUEST, format!("unknown outcome: {other}")).into_response(),
    };

    let (tx, rx) = oneshot::channel();
    if state
        .commands
        .send(DaemonCommand::Feedback {
            drives_addressed: body.drives_addressed,
            outcome,
            respond: tx,
        })
        .await
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match rx.await {
        Ok(changes) => Json(FeedbackResponse { changes }).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct MutationsQuery {
    n: Option<usize>,
}

async fn mutations(State(state): State<Arc<ServerState>>, Query(query): Query<MutationsQuery>) -> impl IntoResponse {
    let n = query.n.unwrap_or(20).clamp(1, 1000);
    Json((state.audit_tail)(n))
}

async fn metrics(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let snapshot = state.snapshot.read().expect("snapshot lock poisoned");
    let mut lines = vec![
        format!("pulse_uptime_seconds {}", snapshot.uptime_s),
        format!("pulse_triggers_total {}", snapshot.triggers_total),
        format!("pulse_feedback_success_total {}", snapshot.feedback_success),
        format!("pulse_feedback_partial_total {}", snapshot.feedback_partial),
        format!("pulse_feedback_failure_total {}", snapshot.feedback_failure),
        format!("pulse_unknown_field_warnings_total {}", snapshot.unknown_field_warnings),
    ];
    for drive in &snapshot.state_view.drives {
        lines.push(format!("pulse_drive_pressure{{drive=\"{}\"}} {}", drive.name, drive.pressure));
    }
    lines.sort();
    (StatusCode::OK, lines.join("\n") + "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> ServerSnapshot {
        ServerSnapshot {
            started_at_unix: 0,
            uptime_s: 10.0,
            version: "0.1.0",
            state_view: StateView {
                drives: vec![DriveView {
                    name: "goals".into(),
                    pressure: 1.0,
                    weight: 1.0,
                    last_addressed: 0,
                    sources: vec![],
                    protected: true,
                }],
                sensor_summary: "idle".into(),
                config: ConfigOverrides::default(),
                rate_limit_window_count: 0,
                rate_limit_cap: 10,
                last_trigger: LastTrigger::default(),
                evaluator_mode: "rule".into(),
            },
            triggers_total: 0,
            feedback_success: 0,
            feedback_partial: 0,
            feedback_failure: 0,
            unknown_field_warnings: 0,
            mutator_enabled: true,
        }
    }

    #[test]
    fn metrics_lines_are_sorted_and_newline_terminated() {
        let snapshot = sample_snapshot();
        let mut lines = vec![
            format!("pulse_uptime_seconds {}", snapshot.uptime_s),
            format!("pulse_triggers_total {}", snapshot.triggers_total),
        ];
        lines.sort();
        let text = lines.join("\n") + "\n";
        assert!(text.ends_with('\n'));
    }
}
