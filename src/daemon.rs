//! Owns the main loop: schedules sensor reads, drive ticks, evaluator
//! calls, webhook dispatch, feedback ingestion, mutation drain, and
//! periodic save. Handles signals and cleanup (C11).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::audit::AuditLog;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigOverrides};
use crate::drive::{Drive, DriveEngine};
use crate::evaluator::model::{ModelEvaluator, ModelEvaluatorConfig};
use crate::evaluator::rule::{RuleEvaluator, RuleEvaluatorConfig};
use crate::evaluator::{Evaluator, EvaluatorMode};
use crate::guardrail::{GuardrailLimits, Guardrails, RateWindow};
use crate::health_server::{self, DaemonCommand, DriveView, ForceTriggerOutcome, ServerSnapshot, ServerState, StateView};
use crate::mutation::{drain_mutation_queue_file, Mutation, Mutator};
use crate::paths::StateDirLayout;
use crate::sensors::fs_watch::{FsWatchSensor, SelfWriteSet};
use crate::sensors::conversation::ConversationSensor;
use crate::sensors::health::HealthSensor;
use crate::sensors::{changed_sources, SensorSet};
use crate::state::{LastTrigger, StateSnapshot, StateStore, TriggerHistoryEntry};
use crate::webhook::{HookKind, WebhookClient};

const MAX_CONSECUTIVE_ITERATION_FAILURES: u32 = 5;

pub struct Daemon {
    config: Config,
    state_dir: PathBuf,
}

impl Daemon {
    pub fn new(config: Config, state_dir: PathBuf) -> Self {
        Self { config, state_dir }
    }

    /// Run until a shutdown signal is received. Blocking; spawns its own
    /// Tokio runtime for the HTTP server on a background thread.
    pub fn run(self) -> Result<(), crate::error::PulseError> {
        let layout = StateDirLayout::at(&self.state_dir);
        let store = StateStore::acquire(layout.clone())?;
        let persisted = store.load()?;

        let clock = SystemClock::new();
        let mut overrides = persisted
            .as_ref()
            .map(|s| s.config_overrides.clone())
            .unwrap_or_else(|| self.config.mutable.clone());

        let mut engine = build_engine(&self.config, persisted.as_ref());
        let mut trigger_window = RateWindow::from_timestamps(
            persisted
                .as_ref()
                .map(|s| s.mutation_timestamps.clone())
                .unwrap_or_default(),
        );
        let mut mutation_window = RateWindow::default();
        let mut last_trigger = persisted.as_ref().map(|s| s.last_trigger.clone()).unwrap_or_default();
        let mut trigger_history: Vec<TriggerHistoryEntry> =
            persisted.as_ref().map(|s| s.trigger_history.clone()).unwrap_or_default();

        let guardrails = Guardrails::new(GuardrailLimits::from_config(&self.config));
        let mutator = Mutator::new(guardrails);
        let mut audit_log = AuditLog::open(layout.audit_file(), self.config.audit_max_bytes)?;

        let self_writes = SelfWriteSet::new();
        let mut sensors = SensorSet::new();
        sensors.add(Box::new(FsWatchSensor::new(self.state_dir.join("watch"), self_writes.clone())));
        sensors.add(Box::new(ConversationSensor::new(self.state_dir.join("sessions"))));
        sensors.add(Box::new(HealthSensor::new(Vec::new())));
        sensors.initialize_all();

        let webhook = WebhookClient::new(
            self.config.webhook_url.clone(),
            self.config.webhook_token.clone(),
            self.config.webhook_auth_header.clone(),
            self.config.webhook_timeout_s,
            self.config.webhook_retries,
        );
        if self.config.webhook_token.is_none() {
            tracing::warn!("no webhook token configured; wake calls will be recorded with auth=missing");
        }

        let mut evaluator: Box<dyn Evaluator> = match self.config.evaluator {
            crate::config::EvaluatorKind::Rule => Box::new(RuleEvaluator::new(rule_config(&self.config, &overrides))),
            crate::config::EvaluatorKind::Model => {
                let fallback = RuleEvaluator::new(rule_config(&self.config, &overrides));
                let model_config = ModelEvaluatorConfig {
                    endpoint: self.config.model_endpoint.clone().unwrap_or_default(),
                    fail_threshold: self.config.model_fail_threshold,
                    recovery_interval_s: self.config.model_recovery_interval_s,
                    request_timeout_s: self.config.webhook_timeout_s,
                    activity_threshold_s: overrides.min_trigger_interval_s.max(self.config.activity_threshold_s),
                    high_p_threshold: self.config.high_p_threshold,
                    idle_window_s: self.config.idle_window_s,
                };
                Box::new(ModelEvaluator::new(model_config, fallback))
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let snapshot_lock = Arc::new(RwLock::new(make_snapshot(
            0,
            clock.unix_secs(),
            &engine,
            &overrides,
            &mutation_window_count(&mutation_window, clock.unix_secs()),
            self.config.mutation_rate_cap_per_hour,
            &last_trigger,
            evaluator.mode(),
            "idle",
            true,
        )));

        let (command_tx, mut command_rx) = mpsc::channel::<DaemonCommand>(256);
        let http_runtime_handle = spawn_http_server(
            self.config.http_host.clone(),
            self.config.http_port,
            snapshot_lock.clone(),
            command_tx,
            layout.audit_file(),
            running.clone(),
        );

        let loop_interval = Duration::from_secs_f64(self.config.loop_interval_s.max(0.1));
        let save_interval = Duration::from_secs_f64(self.config.save_interval_s.max(1.0));
        let mut last_tick = Instant::now();
        let mut last_save = Instant::now();
        let mut consecutive_failures = 0u32;
        let mutations_file = layout.mutations_file();

        tracing::info!(
            state_dir = %self.state_dir.display(),
            http_port = self.config.http_port,
            drives = engine.len(),
            evaluator = ?evaluator.mode(),
            "pulse daemon starting"
        );

        while running.load(Ordering::SeqCst) {
            let iteration_result = (|| -> Result<(), crate::error::PulseError> {
                let now = Instant::now();
                let dt_secs = now.duration_since(last_tick).as_secs_f64();
                last_tick = now;
                let now_unix = clock.unix_secs();
                let now_monotonic = clock.monotonic_secs();

                let readings = sensors.read_all(now_monotonic);
                let changed = changed_sources(&readings);
                engine.tick(
                    dt_secs,
                    overrides.pressure_rate,
                    overrides.max_pressure,
                    self.config.spike_amount,
                    &readings,
                    &changed,
                );

                let turns_per_hour_cap = overrides.max_turns_per_hour;
                let min_trigger_interval_s = overrides.min_trigger_interval_s;
                drain_commands(
                    &mut command_rx,
                    &mutator,
                    &mut engine,
                    &mut overrides,
                    &mut mutation_window,
                    &mut audit_log,
                    &webhook,
                    &mut trigger_window,
                    &mut last_trigger,
                    &mut trigger_history,
                    self.config.mutation_rate_cap_per_hour,
                    turns_per_hour_cap,
                    min_trigger_interval_s,
                    now_unix,
                );

                if let Ok(file_mutations) = drain_mutation_queue_file(&mutations_file) {
                    if !file_mutations.is_empty() {
                        mutator.apply_batch(&mut engine, &mut mutation_window, &mut audit_log, file_mutations, now_unix);
                    }
                }

                let decision = evaluator.decide(&engine, &readings, now_unix, now_monotonic);
                engine.record_evaluation(now_monotonic);

                if decision.should_trigger {
                    let cooldown_ok = now_unix.saturating_sub(last_trigger.timestamp) as f64 >= overrides.min_trigger_interval_s;
                    let cap_ok = !trigger_window.would_exceed(now_unix, overrides.max_turns_per_hour);
                    if cooldown_ok && cap_ok {
                        dispatch_trigger(
                            &webhook,
                            &decision,
                            &mut engine,
                            &mut trigger_window,
                            &mut last_trigger,
                            &mut trigger_history,
                            now_unix,
                        );
                    }
                }

                if last_save.elapsed() >= save_interval {
                    persist(&store, &engine, &overrides, &last_trigger, &trigger_history, &trigger_window, &clock)?;
                    last_save = Instant::now();
                }

                let snapshot = make_snapshot(
                    engine.total_triggers,
                    now_unix,
                    &engine,
                    &overrides,
                    &mutation_window_count(&mutation_window, now_unix),
                    self.config.mutation_rate_cap_per_hour,
                    &last_trigger,
                    evaluator.mode(),
                    "idle",
                    true,
                );
                *snapshot_lock.write().expect("snapshot lock poisoned") = snapshot;

                Ok(())
            })();

            match iteration_result {
                Ok(()) => consecutive_failures = 0,
                Err(err) => {
                    consecutive_failures += 1;
                    tracing::warn!(error = %err, consecutive_failures, "loop iteration failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_ITERATION_FAILURES {
                        tracing::error!("too many consecutive loop failures, stopping");
                        break;
                    }
                }
            }

            let elapsed = last_tick.elapsed();
            if elapsed < loop_interval {
                std::thread::sleep(loop_interval - elapsed);
            }
        }

        persist(&store, &engine, &overrides, &last_trigger, &trigger_history, &trigger_window, &clock)?;
        sensors.stop_all();
        store.release();
        drop(http_runtime_handle);
        tracing::info!("pulse daemon stopped");
        Ok(())
    }
}

fn rule_config(config: &Config, overrides: &ConfigOverrides) -> RuleEvaluatorConfig {
    RuleEvaluatorConfig {
        trigger_threshold: overrides.trigger_threshold,
        exception_floor: config.exception_floor,
        high_p_threshold: config.high_p_threshold,
        idle_window_s: config.idle_window_s,
        activity_threshold_s: config.activity_threshold_s,
    }
}

fn build_engine(config: &Config, persisted: Option<&StateSnapshot>) -> DriveEngine {
    match persisted {
        Some(snapshot) => {
            let mut engine = DriveEngine::restore(snapshot.drives.clone());
            // Drives declared in config but missing from the persisted
            // snapshot fall back to config defaults (spec.md §4.9 step 3).
            for spec in &config.drives {
                if engine.get(&spec.name).is_none() {
                    engine.insert(Drive::new(&spec.name, spec.weight, spec.sources.clone(), spec.protected, 0));
                }
            }
            engine
        }
        None => {
            let mut engine = DriveEngine::new();
            for spec in &config.drives {
                engine.insert(Drive::new(&spec.name, spec.weight, spec.sources.clone(), spec.protected, 0));
            }
            engine
        }
    }
}

fn mutation_window_count(window: &RateWindow, now_unix: u64) -> usize {
    let mut w = window.clone();
    w.count_in_window(now_unix)
}

#[allow(clippy::too_many_arguments)]
fn drain_commands(
    command_rx: &mut mpsc::Receiver<DaemonCommand>,
    mutator: &Mutator,
    engine: &mut DriveEngine,
    overrides: &mut ConfigOverrides,
    mutation_window: &mut RateWindow,
    audit_log: &mut AuditLog,
    webhook: &WebhookClient,
    trigger_window: &mut RateWindow,
    last_trigger: &mut LastTrigger,
    trigger_history: &mut Vec<TriggerHistoryEntry>,
    mutation_cap: u32,
    turns_per_hour_cap: u32,
    min_trigger_interval_s: f64,
    now_unix: u64,
) {
    while let Ok(command) = command_rx.try_recv() {
        match command {
            DaemonCommand::SubmitMutation { mutation, respond } => {
                let outcome = apply_mutation_with_overrides(mutator, engine, overrides, mutation_window, audit_log, mutation, now_unix, mutation_cap);
                let _ = respond.send(outcome);
            }
            DaemonCommand::ForceTrigger { respond } => {
                let cooldown_ok = now_unix.saturating_sub(last_trigger.timestamp) as f64 >= min_trigger_interval_s;
                let cap_ok = !trigger_window.would_exceed(now_unix, turns_per_hour_cap);
                let outcome = if !cooldown_ok || !cap_ok {
                    ForceTriggerOutcome::RateLimited
                } else {
                    let decision = crate::evaluator::TriggerDecision {
                        should_trigger: true,
                        reason: "manual trigger".to_string(),
                        top_drive: engine.top_drive().map(|d| (d.name.clone(), d.weighted_pressure())),
                        total_pressure: engine.total_weighted_pressure(),
                        sensor_context: String::new(),
                        suppress_for: None,
                    };
                    let result = dispatch_trigger(webhook, &decision, engine, trigger_window, last_trigger, trigger_history, now_unix);
                    if result {
                        ForceTriggerOutcome::Dispatched
                    } else {
                        ForceTriggerOutcome::WebhookFailed
                    }
                };
                let _ = respond.send(outcome);
            }
            DaemonCommand::Feedback {
                drives_addressed,
                outcome,
                respond,
            } => {
                let changes = engine.apply_feedback(
                    &drives_addressed,
                    outcome,
                    overrides.success_decay,
                    2.0,
                    overrides.max_pressure,
                );
                for name in &drives_addressed {
                    engine.mark_addressed(name, now_unix);
                }
                let _ = respond.send(changes);
            }
        }
    }
}

fn apply_mutation_with_overrides(
    mutator: &Mutator,
    engine: &mut DriveEngine,
    overrides: &mut ConfigOverrides,
    mutation_window: &mut RateWindow,
    audit_log: &mut AuditLog,
    mutation: Mutation,
    now_unix: u64,
    mutation_cap: u32,
) -> Result<(), String> {
    use crate::mutation::MutationKind;

    if let Err(err) = mutator.guardrails.check_rate_limit(mutation_window, now_unix) {
        audit_log.append(crate::audit::AuditEntry::rejected(
            mutation_kind_name(&mutation.kind),
            &mutation,
            err.rule_name(),
            now_unix,
        ));
        return Err(err.to_string());
    }

    match &mutation.kind {
        MutationKind::AdjustThreshold { .. } | MutationKind::AdjustRate { .. } | MutationKind::AdjustCooldown { .. } | MutationKind::AdjustTurnsPerHour { .. } => {
            let value = match mutator.guardrails.check(&mutation, None, false) {
                Ok(v) => v,
                Err(err) => {
                    audit_log.append(crate::audit::AuditEntry::rejected(
                        mutation_kind_name(&mutation.kind),
                        &mutation,
                        err.rule_name(),
                        now_unix,
                    ));
                    return Err(err.to_string());
                }
            };
            let before = serde_json::to_value(&*overrides).unwrap_or_default();
            match &mutation.kind {
                MutationKind::AdjustThreshold { .. } => overrides.trigger_threshold = value,
                MutationKind::AdjustRate { .. } => overrides.pressure_rate = value,
                MutationKind::AdjustCooldown { .. } => overrides.min_trigger_interval_s = value,
                MutationKind::AdjustTurnsPerHour { .. } => overrides.max_turns_per_hour = value as u32,
                _ => unreachable!(),
            }
            mutation_window.record(now_unix);
            let after = serde_json::to_value(&*overrides).unwrap_or_default();
            audit_log.append(crate::audit::AuditEntry::accepted(mutation_kind_name(&mutation.kind), &mutation, before, after, now_unix));
            Ok(())
        }
        _ => {
            mutator.apply_batch(engine, mutation_window, audit_log, vec![mutation], now_unix);
            Ok(())
        }
    }
}

fn mutation_kind_name(kind: &crate::mutation::MutationKind) -> &'static str {
    use crate::mutation::MutationKind;
    match kind {
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

fn dispatch_trigger(
    webhook: &WebhookClient,
    decision: &crate::evaluator::TriggerDecision,
    engine: &mut DriveEngine,
    trigger_window: &mut RateWindow,
    last_trigger: &mut LastTrigger,
    trigger_history: &mut Vec<TriggerHistoryEntry>,
    now_unix: u64,
) -> bool {
    let top_name = decision.top_drive.as_ref().map(|(n, _)| n.clone());
    let message = format!(
        "{} (top drive: {})",
        decision.reason,
        top_name.clone().unwrap_or_else(|| "none".to_string())
    );
    let metadata = serde_json::json!({
        "timestamp": now_unix,
        "total_pressure": decision.total_pressure,
        "top_drive": top_name,
    });

    let result = webhook.wake(HookKind::Agent, &message, metadata);

    trigger_window.record(now_unix);
    engine.record_trigger();
    *last_trigger = LastTrigger {
        timestamp: now_unix,
        reason: decision.reason.clone(),
    };
    trigger_history.push(TriggerHistoryEntry {
        timestamp: now_unix,
        reason: decision.reason.clone(),
        top_drive: top_name,
        total_pressure: decision.total_pressure,
        webhook_status: result.status.clone(),
        dispatched_turn_id: result.session_key.clone(),
    });
    if trigger_history.len() > crate::state::MAX_TRIGGER_HISTORY_ENTRIES {
        let overflow = trigger_history.len() - crate::state::MAX_TRIGGER_HISTORY_ENTRIES;
        trigger_history.drain(0..overflow);
    }

    result.ok
}

#[allow(clippy::too_many_arguments)]
fn persist(
    store: &StateStore,
    engine: &DriveEngine,
    overrides: &ConfigOverrides,
    last_trigger: &LastTrigger,
    trigger_history: &[TriggerHistoryEntry],
    trigger_window: &RateWindow,
    clock: &SystemClock,
) -> Result<(), crate::error::PulseError> {
    let snapshot = StateSnapshot {
        version: 1,
        drives: engine.snapshot(),
        config_overrides: overrides.clone(),
        last_trigger: last_trigger.clone(),
        trigger_history: trigger_history.to_vec(),
        mutation_timestamps: trigger_window.to_vec(),
        saved_at_monotonic: clock.monotonic_secs(),
        saved_at_unix: clock.unix_secs(),
    };
    store.save(&snapshot).map_err(Into::into)
}

#[allow(clippy::too_many_arguments)]
fn make_snapshot(
    triggers_total: u64,
    now_unix: u64,
    engine: &DriveEngine,
    overrides: &ConfigOverrides,
    rate_limit_window_count: &usize,
    rate_limit_cap: u32,
    last_trigger: &LastTrigger,
    mode: EvaluatorMode,
    sensor_summary: &str,
    mutator_enabled: bool,
) -> ServerSnapshot {
    let drives = engine
        .iter()
        .map(|d| DriveView {
            name: d.name.clone(),
            pressure: d.pressure,
            weight: d.weight,
            last_addressed: d.last_addressed,
            sources: d.sources.clone(),
            protected: d.protected,
        })
        .collect();

    ServerSnapshot {
        started_at_unix: now_unix,
        uptime_s: 0.0,
        version: env!("CARGO_PKG_VERSION"),
        state_view: StateView {
            drives,
            sensor_summary: sensor_summary.to_string(),
            config: overrides.clone(),
            rate_limit_window_count: *rate_limit_window_count,
            rate_limit_cap,
            last_trigger: last_trigger.clone(),
            evaluator_mode: match mode {
                EvaluatorMode::Rule => "rule".to_string(),
                EvaluatorMode::Model => "model".to_string(),
                EvaluatorMode::Degraded => "degraded".to_string(),
            },
        },
        triggers_total,
        feedback_success: 0,
        feedback_partial: 0,
        feedback_failure: 0,
        unknown_field_warnings: 0,
        mutator_enabled,
    }
}

fn spawn_http_server(
    host: String,
    port: u16,
    snapshot: Arc<RwLock<ServerSnapshot>>,
    commands: mpsc::Sender<DaemonCommand>,
    audit_path: PathBuf,
    running: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to build HTTP runtime");

        runtime.block_on(async move {
            let audit_tail = Arc::new(move |n: usize| {
                crate::audit::AuditLog::open(audit_path.clone(), u64::MAX)
                    .map(|log| log.recent(n))
                    .unwrap_or_default()
            });

            let state = ServerState {
                snapshot,
                audit_tail,
                commands,
            };
            let app = health_server::router(state);

            let addr: std::net::SocketAddr = format!("{host}:{port}").parse().expect("invalid bind address");
            let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind HTTP listener");

            let shutdown_running = running.clone();
            let shutdown = async move {
                let ctrl_c = async {
                    tokio::signal::ctrl_c().await.ok();
                };
                #[cfg(unix)]
                let terminate = async {
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler")
                        .recv()
                        .await;
                };
                #[cfg(not(unix))]
                let terminate = std::future::pending::<()>();

                tokio::select! {
                    _ = ctrl_c => {},
                    _ = terminate => {},
                }
                shutdown_running.store(false, Ordering::SeqCst);
            };

            axum::serve(listener, app).with_graceful_shutdown(shutdown).await.ok();
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_engine_falls_back_to_config_defaults_when_no_snapshot() {
        let config = Config::default();
        let engine = build_engine(&config, None);
        assert!(engine.get("goals").is_some());
        assert!(engine.get("growth").is_some());
    }

    #[test]
    fn build_engine_keeps_persisted_drives_missing_from_config() {
        let mut config = Config::default();
        config.drives.retain(|d| d.name != "curiosity");
        let mut persisted_engine = DriveEngine::new();
        persisted_engine.insert(Drive::new("curiosity", 1.0, vec![], false, 0));
        let snapshot = StateSnapshot {
            version: 1,
            drives: persisted_engine.snapshot(),
            config_overrides: ConfigOverrides::default(),
            last_trigger: LastTrigger::default(),
            trigger_history: vec![],
            mutation_timestamps: vec![],
            saved_at_monotonic: 0.0,
            saved_at_unix: 0,
        };
        let engine = build_engine(&config, Some(&snapshot));
        assert!(engine.get("curiosity").is_some());
        assert!(engine.get("goals").is_some());
    }
}
