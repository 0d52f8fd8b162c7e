/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::module_name_repetitions)]

use std::process;
use std::sync::Arc;
use std::time::Duration;

use agora_config::Config;
use agora_core::{
    spawn_workers, AgentStatus, ChainEngine, ChainStep, CoreError, CronScheduler, NatsTransport,
    Outcome, PgStore, Router, SystemClock, TaskSpec,
};
use agora_runtime::{connect_nats, shutdown_signal};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const SERVICE_NAME: &str = "dispatcher";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum DispatcherError {
    #[error("nats error: {0}")]
    Nats(String),
    #[error("store error: {0}")]
    Store(#[from] agora_core::StoreError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("deserialization error: {0}")]
    Deserialize(#[from] serde_json::Error),
}

impl From<async_nats::ConnectError> for DispatcherError {
    fn from(e: async_nats::ConnectError) -> Self {
        Self::Nats(e.to_string())
    }
}

impl From<async_nats::PublishError> for DispatcherError {
    fn from(e: async_nats::PublishError) -> Self {
        Self::Nats(e.to_string())
    }
}

impl From<async_nats::SubscribeError> for DispatcherError {
    fn from(e: async_nats::SubscribeError) -> Self {
        Self::Nats(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    router: Arc<Router>,
    chains: Arc<ChainEngine>,
    cron: Arc<CronScheduler>,
    nats: async_nats::Client,
    config: Arc<Config>,
}

async fn init_state(config: Config) -> Result<AppState, DispatcherError> {
    let store = PgStore::connect(&config.postgres).await?;
    let nats = connect_nats(&config.nats).await?;
    let transport = NatsTransport::new(
        nats.clone(),
        &config.nats.subject_prefix,
        &config.agora.env,
    );

    let router = Arc::new(Router::new(
        Arc::new(store),
        Arc::new(SystemClock),
        Arc::new(transport),
        &config,
    ));
    let chains = Arc::new(ChainEngine::new(Arc::clone(&router)));
    let cron = Arc::new(CronScheduler::new(Arc::clone(&router)));

    Ok(AppState {
        router,
        chains,
        cron,
        nats,
        config: Arc::new(config),
    })
}

// ---------------------------------------------------------------------------
// Intake payloads
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
struct OutcomePayload {
    task_id: String,
    agent_id: String,
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CancelPayload {
    task_id: String,
    cancelled_by: String,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize, Debug)]
struct HeartbeatPayload {
    agent_id: String,
    #[serde(default = "default_agent_status")]
    status: AgentStatus,
}

fn default_agent_status() -> AgentStatus {
    AgentStatus::Active
}

#[derive(Deserialize, Debug)]
struct RegisterPayload {
    agent_id: String,
    capabilities: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct ChainStepPayload {
    key: String,
    #[serde(default)]
    after: Vec<String>,
    #[serde(flatten)]
    spec: TaskSpec,
}

#[derive(Deserialize, Debug)]
struct ChainPayload {
    client_id: String,
    steps: Vec<ChainStepPayload>,
}

#[derive(Deserialize, Debug)]
struct SchedulePayload {
    name: String,
    cron_expression: String,
    template: TaskSpec,
}

#[derive(Deserialize, Debug)]
struct StatusPayload {
    task_id: String,
}

#[derive(Deserialize, Debug)]
struct ScheduleRefPayload {
    schedule_id: String,
}

#[derive(Deserialize, Debug)]
struct ExecutionsPayload {
    schedule_id: String,
    #[serde(default = "default_execution_limit")]
    limit: usize,
}

fn default_execution_limit() -> usize {
    50
}

#[derive(Deserialize, Debug)]
struct BatchPayload {
    tasks: Vec<TaskSpec>,
}

#[derive(Deserialize, Debug)]
struct BatchRefPayload {
    batch_id: String,
}

#[derive(Deserialize, Debug)]
struct BatchCancelPayload {
    batch_id: String,
    cancelled_by: String,
    #[serde(default = "default_batch_reason")]
    reason: String,
}

fn default_batch_reason() -> String {
    "Batch cancellation".to_string()
}

/// One NATS intake subject per external operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intake {
    Submit,
    Outcome,
    Cancel,
    Heartbeat,
    Register,
    Chain,
    Schedule,
    SchedulePause,
    ScheduleResume,
    ScheduleExecutions,
    Status,
    Batch,
    BatchStatus,
    BatchCancel,
}

impl Intake {
    const ALL: [Self; 14] = [
        Self::Submit,
        Self::Outcome,
        Self::Cancel,
        Self::Heartbeat,
        Self::Register,
        Self::Chain,
        Self::Schedule,
        Self::SchedulePause,
        Self::ScheduleResume,
        Self::ScheduleExecutions,
        Self::Status,
        Self::Batch,
        Self::BatchStatus,
        Self::BatchCancel,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Outcome => "outcome",
            Self::Cancel => "cancel",
            Self::Heartbeat => "heartbeat",
            Self::Register => "register",
            Self::Chain => "chain",
            Self::Schedule => "schedule",
            Self::SchedulePause => "schedule.pause",
            Self::ScheduleResume => "schedule.resume",
            Self::ScheduleExecutions => "schedule.executions",
            Self::Status => "status",
            Self::Batch => "batch",
            Self::BatchStatus => "batch.status",
            Self::BatchCancel => "batch.cancel",
        }
    }

    fn subject(self, prefix: &str, env: &str) -> String {
        format!("{prefix}.{env}.dispatcher.{}", self.name())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle(state: &AppState, intake: Intake, payload: &[u8]) -> Result<Value, DispatcherError> {
    match intake {
        Intake::Submit => {
            let spec: TaskSpec = serde_json::from_slice(payload)?;
            let task_id = state.router.submit(spec).await?;
            Ok(json!({ "task_id": task_id }))
        }
        Intake::Outcome => {
            let p: OutcomePayload = serde_json::from_slice(payload)?;
            let outcome = Outcome::from_parts(p.success, p.result, p.error);
            let task = state
                .router
                .report_outcome(&p.task_id, &p.agent_id, outcome)
                .await?;
            Ok(json!({ "task_id": task.id, "status": task.status }))
        }
        Intake::Cancel => {
            let p: CancelPayload = serde_json::from_slice(payload)?;
            let cancelled = state
                .router
                .cancel(&p.task_id, &p.cancelled_by, &p.reason)
                .await?;
            Ok(json!({ "task_id": p.task_id, "cancelled": cancelled }))
        }
        Intake::Heartbeat => {
            let p: HeartbeatPayload = serde_json::from_slice(payload)?;
            let agent = state.router.heartbeat(&p.agent_id, p.status).await?;
            Ok(json!({ "agent_id": agent.agent_id, "status": agent.status }))
        }
        Intake::Register => {
            let p: RegisterPayload = serde_json::from_slice(payload)?;
            let agent = state
                .router
                .register_agent(&p.agent_id, &p.capabilities)
                .await?;
            Ok(json!({ "agent_id": agent.agent_id, "trust_score": agent.trust_score }))
        }
        Intake::Chain => {
            let p: ChainPayload = serde_json::from_slice(payload)?;
            let steps = chain_steps(p.steps);
            let chain_id = state.chains.create_chain(&p.client_id, steps).await?;
            Ok(json!({ "chain_id": chain_id }))
        }
        Intake::Schedule => {
            let p: SchedulePayload = serde_json::from_slice(payload)?;
            let schedule_id = state
                .cron
                .create_schedule(&p.name, &p.cron_expression, p.template)
                .await?;
            Ok(json!({ "schedule_id": schedule_id }))
        }
        Intake::SchedulePause => {
            let p: ScheduleRefPayload = serde_json::from_slice(payload)?;
            let schedule = state.cron.pause(&p.schedule_id).await?;
            Ok(json!({ "schedule_id": schedule.schedule_id, "status": schedule.status }))
        }
        Intake::ScheduleResume => {
            let p: ScheduleRefPayload = serde_json::from_slice(payload)?;
            let schedule = state.cron.resume(&p.schedule_id).await?;
            Ok(json!({
                "schedule_id": schedule.schedule_id,
                "status": schedule.status,
                "next_run_at": schedule.next_run_at,
            }))
        }
        Intake::ScheduleExecutions => {
            let p: ExecutionsPayload = serde_json::from_slice(payload)?;
            let runs = state.cron.executions(&p.schedule_id, p.limit).await?;
            Ok(serde_json::to_value(runs)?)
        }
        Intake::Status => {
            let p: StatusPayload = serde_json::from_slice(payload)?;
            let task = state.router.get_status(&p.task_id).await?;
            Ok(serde_json::to_value(task)?)
        }
        Intake::Batch => {
            let p: BatchPayload = serde_json::from_slice(payload)?;
            let receipt = state.router.submit_batch(&p.tasks).await?;
            Ok(serde_json::to_value(receipt)?)
        }
        Intake::BatchStatus => {
            let p: BatchRefPayload = serde_json::from_slice(payload)?;
            let status = state.router.batch_status(&p.batch_id).await?;
            Ok(serde_json::to_value(status)?)
        }
        Intake::BatchCancel => {
            let p: BatchCancelPayload = serde_json::from_slice(payload)?;
            let outcome = state
                .router
                .cancel_batch(&p.batch_id, &p.cancelled_by, &p.reason)
                .await?;
            Ok(serde_json::to_value(outcome)?)
        }
    }
}

fn chain_steps(steps: Vec<ChainStepPayload>) -> Vec<ChainStep> {
    steps
        .into_iter()
        .map(|s| ChainStep {
            key: s.key,
            spec: s.spec,
            after: s.after,
        })
        .collect()
}

fn reply_body(result: &Result<Value, DispatcherError>) -> Value {
    match result {
        Ok(body) => json!({ "ok": true, "data": body }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}

// ---------------------------------------------------------------------------
// Subscription loop
// ---------------------------------------------------------------------------

async fn run_intake_subscription(
    state: Arc<AppState>,
    intake: Intake,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), DispatcherError> {
    let subject = intake.subject(&state.config.nats.subject_prefix, &state.config.agora.env);

    info!(subject = %subject, "subscribing to {}", intake.name());

    let mut subscriber = state.nats.subscribe(subject.clone()).await?;

    loop {
        tokio::select! {
            msg = subscriber.next() => {
                match msg {
                    Some(nats_msg) => {
                        let state_clone = Arc::clone(&state);
                        tokio::spawn(async move {
                            let result = handle(&state_clone, intake, &nats_msg.payload).await;
                            if let Err(e) = &result {
                                warn!(error = %e, intake = intake.name(), "intake request failed");
                            }
                            if let Some(reply) = nats_msg.reply {
                                let body = reply_body(&result).to_string();
                                if let Err(e) = state_clone.nats.publish(reply, body.into()).await {
                                    warn!(error = %e, intake = intake.name(), "failed to publish reply");
                                }
                            } else {
                                debug!(intake = intake.name(), "no reply subject");
                            }
                        });
                    }
                    None => {
                        warn!(subject = %subject, "subscription stream ended");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!(subject = %subject, "shutdown signal, stopping subscription");
                break;
            }
        }
    }

    if let Err(e) = subscriber.unsubscribe().await {
        warn!(error = %e, subject = %subject, "failed to unsubscribe");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let boot_config = Config::load().unwrap_or_else(|e| {
        eprintln!("fatal: failed to load config: {e}");
        process::exit(1);
    });

    let _telemetry_guard =
        agora_telemetry::init_telemetry(SERVICE_NAME, SERVICE_VERSION, &boot_config.telemetry)
            .unwrap_or_else(|e| {
                eprintln!("fatal: telemetry init failed: {e}");
                process::exit(1);
            });

    info!(
        service = SERVICE_NAME,
        version = SERVICE_VERSION,
        env = %boot_config.agora.env,
        "starting dispatcher"
    );

    let state = match init_state(boot_config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "fatal: failed to initialise dispatcher");
            process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = spawn_workers(
        &state.router,
        &state.chains,
        &state.cron,
        state.router.config(),
        &shutdown_rx,
    );
    info!(workers = ?workers.names(), "background workers started");

    let mut intake_handles = Vec::new();
    for intake in Intake::ALL {
        let sub_state = Arc::clone(&state);
        let sub_shutdown = shutdown_rx.clone();
        intake_handles.push(tokio::spawn(async move {
            if let Err(e) = run_intake_subscription(sub_state, intake, sub_shutdown).await {
                error!(error = %e, intake = intake.name(), "intake subscription failed");
            }
        }));
    }

    shutdown_signal().await;

    info!("initiating graceful shutdown");

    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(state.router.config().shutdown_grace_secs);
    match tokio::time::timeout(grace, async {
        for handle in intake_handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "intake subscription panicked");
            }
        }
    })
    .await
    {
        Ok(()) => info!("intake subscriptions stopped"),
        Err(_) => warn!("intake shutdown timed out after {grace:?}"),
    }
    workers.join(grace).await;

    let health = state.router.health();
    info!(
        healthy = health.healthy,
        open = health.open,
        half_open = health.half_open,
        "dispatcher shutdown complete"
    );
}

// ===========================================================================
// Tests
// ===========================================================================
