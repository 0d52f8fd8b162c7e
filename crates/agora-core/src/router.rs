/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Composition root of the dispatch engine.
//!
//! The [`Router`] owns one instance of every collaborator and is the only
//! component that moves tasks between states on behalf of agents and
//! clients. Periodic workers and the chain engine call into it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use agora_config::{Config, DispatchConfig};
use agora_runtime::{
    CircuitBreaker, CircuitSettings, DispatchError, FailoverDispatcher, FailoverError,
    HealthSummary, RoutingEvent,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::model::{Agent, AgentStatus, Task, TaskSpec, TaskStatus};
use crate::queue::{FairScheduler, QueueStats};
use crate::retry::{is_retryable, RetryDecision, RetryManager};
use crate::store::{modify_agent, modify_task, modify_task_for_agent, TaskFilter, TaskStore};
use crate::timeouts::{timeout_message, TimeoutManager};
use crate::transport::{AgentTransport, DispatchPayload};
use crate::trust::{TaskOutcome, TrustModel};

/// Poll interval while waiting on a task somebody else is running.
const EXECUTE_POLL: Duration = Duration::from_millis(200);

/// What an agent reports back for an ACTIVE task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(String),
}

impl Outcome {
    /// Build from the wire shape `{success, result, error}`.
    #[must_use]
    pub fn from_parts(success: bool, result: Option<Value>, error: Option<String>) -> Self {
        if success {
            Self::Success(result.unwrap_or(Value::Null))
        } else {
            Self::Failure(error.unwrap_or_else(|| "agent reported failure".to_string()))
        }
    }
}

/// The failure path a task takes once it has left ACTIVE.
enum Settled {
    Requeued(Task),
    Failed(Task),
}

/// Result of walking the ranked agents for a PENDING task.
enum Claim {
    /// Claimed by the agent at the head of the list.
    Won(Task, Vec<String>),
    /// Every ranked agent was at its cap.
    Saturated,
    /// Someone else moved the task first.
    Lost,
}

/// Where a submitted task came from.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Origin<'a> {
    pub chain_id: Option<&'a str>,
    pub schedule_id: Option<&'a str>,
    pub batch_id: Option<&'a str>,
}

impl<'a> Origin<'a> {
    pub(crate) fn chain(chain_id: &'a str) -> Self {
        Self {
            chain_id: Some(chain_id),
            ..Self::default()
        }
    }

    pub(crate) fn schedule(schedule_id: &'a str) -> Self {
        Self {
            schedule_id: Some(schedule_id),
            ..Self::default()
        }
    }

    pub(crate) fn batch(batch_id: &'a str) -> Self {
        Self {
            batch_id: Some(batch_id),
            ..Self::default()
        }
    }
}

pub struct Router {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn AgentTransport>,
    trust: Arc<TrustModel>,
    scheduler: FairScheduler,
    retry: RetryManager,
    failover: Arc<FailoverDispatcher>,
    timeouts: TimeoutManager,
    cfg: DispatchConfig,
}

impl Router {
    /// Wire every collaborator from `config`.
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn AgentTransport>,
        config: &Config,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(CircuitSettings::from(&config.circuit)));
        Self {
            trust: Arc::new(TrustModel::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                config.trust.clone(),
            )),
            scheduler: FairScheduler::from_config(config.queue.clone()),
            retry: RetryManager::new(config.retry.clone()),
            failover: Arc::new(FailoverDispatcher::from_config(breaker, &config.failover)),
            timeouts: TimeoutManager::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                config.retry.at_risk_fraction,
            ),
            cfg: config.dispatch.clone(),
            store,
            clock,
            transport,
        }
    }

    /// Swap the fair scheduler, e.g. for a seeded strategy.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: FairScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn trust(&self) -> &Arc<TrustModel> {
        &self.trust
    }

    #[must_use]
    pub fn failover(&self) -> &Arc<FailoverDispatcher> {
        &self.failover
    }

    #[must_use]
    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    #[must_use]
    pub fn retry(&self) -> &RetryManager {
        &self.retry
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.cfg
    }

    // -----------------------------------------------------------------------
    // Client operations
    // -----------------------------------------------------------------------

    /// Validate and store a new PENDING task. Returns its id.
    pub async fn submit(&self, spec: TaskSpec) -> Result<String> {
        let task = self.submit_with(&spec, Origin::default()).await?;
        Ok(task.id)
    }

    pub(crate) async fn submit_with(&self, spec: &TaskSpec, origin: Origin<'_>) -> Result<Task> {
        spec.validate()?;
        for dep in &spec.depends_on {
            let Some(parent) = self.store.get_task(dep).await? else {
                return Err(CoreError::Validation(format!("unknown dependency {dep}")));
            };
            if matches!(parent.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                return Err(CoreError::Validation(format!(
                    "dependency {dep} is already {}",
                    parent.status
                )));
            }
        }

        let mut task = Task::from_spec(
            Uuid::new_v4().to_string(),
            spec,
            self.clock.now(),
            self.cfg.default_timeout_secs,
            self.retry.config().default_max_retries,
            self.retry.default_policy(),
        );
        task.chain_id = origin.chain_id.map(str::to_string);
        task.schedule_id = origin.schedule_id.map(str::to_string);
        task.batch_id = origin.batch_id.map(str::to_string);
        self.store.insert_task(&task).await?;

        info!(
            task_id = %task.id,
            client_id = %task.client_id,
            capability = %task.capability_required,
            priority = task.priority,
            "task submitted"
        );
        Ok(task)
    }

    pub async fn get_status(&self, task_id: &str) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", task_id))
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(filter).await?)
    }

    /// Cancel a non-terminal task. `false` when it had already finished.
    pub async fn cancel(&self, task_id: &str, who: &str, reason: &str) -> Result<bool> {
        let now = self.clock.now();
        match modify_task(self.store.as_ref(), task_id, |t| t.cancel(who, reason, now)).await {
            Ok(task) => {
                info!(task_id = %task.id, cancelled_by = %who, reason = %reason, "task cancelled");
                self.propagate(task_id, "cancelled").await;
                Ok(true)
            }
            Err(CoreError::InvalidTransition { from, .. }) => {
                debug!(task_id = %task_id, status = %from, "cancel ignored for finished task");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Put a FAILED task back into the queue by hand. Consumes one retry.
    pub async fn retry_failed(&self, task_id: &str) -> Result<Task> {
        let now = self.clock.now();
        let task = modify_task(self.store.as_ref(), task_id, |t| {
            if t.status != TaskStatus::Failed {
                return Err(CoreError::InvalidTransition {
                    task_id: t.id.clone(),
                    from: t.status,
                    to: TaskStatus::Pending,
                });
            }
            let error = t.error.clone().unwrap_or_default();
            t.requeue(error, now)
        })
        .await?;
        info!(task_id = %task.id, retry_count = task.retry_count, "failed task requeued by hand");
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Agent operations
    // -----------------------------------------------------------------------

    /// Register an agent, or refresh the capabilities of a known one.
    pub async fn register_agent(&self, agent_id: &str, capabilities: &[String]) -> Result<Agent> {
        if agent_id.trim().is_empty() {
            return Err(CoreError::Validation("agent_id must not be empty".into()));
        }
        let now = self.clock.now();
        if self.store.get_agent(agent_id).await?.is_some() {
            let agent = modify_agent(self.store.as_ref(), agent_id, |a| {
                a.capabilities = capabilities.iter().cloned().collect();
                a.status = AgentStatus::Active;
                a.last_heartbeat = Some(now);
                Ok(())
            })
            .await?;
            info!(agent_id = %agent_id, capabilities = ?agent.capabilities, "agent re-registered");
            return Ok(agent);
        }

        let agent = Agent::new(
            agent_id,
            capabilities.iter().cloned(),
            self.trust.config().initial_score,
            now,
        );
        self.store.insert_agent(&agent).await?;
        info!(agent_id = %agent_id, capabilities = ?agent.capabilities, "agent registered");
        Ok(agent)
    }

    pub async fn heartbeat(&self, agent_id: &str, status: AgentStatus) -> Result<Agent> {
        let now = self.clock.now();
        let agent = modify_agent(self.store.as_ref(), agent_id, |a| {
            a.status = status;
            a.last_heartbeat = Some(now);
            Ok(())
        })
        .await?;
        debug!(agent_id = %agent_id, status = %status, "heartbeat");
        Ok(agent)
    }

    /// Mark agents OFFLINE once their heartbeat is older than the configured
    /// window. Returns the ids that changed.
    pub async fn mark_stale_agents(&self) -> Result<Vec<String>> {
        let now = self.clock.now();
        let window = chrono::Duration::seconds(
            i64::try_from(self.cfg.stale_agent_after_secs).unwrap_or(i64::MAX),
        );
        let stale = |a: &Agent| {
            a.status != AgentStatus::Offline
                && a.last_heartbeat.map_or(true, |beat| now - beat > window)
        };

        let mut marked = Vec::new();
        for agent in self.store.list_agents().await? {
            if !stale(&agent) {
                continue;
            }
            let result = modify_agent(self.store.as_ref(), &agent.agent_id, |a| {
                if stale(a) {
                    a.status = AgentStatus::Offline;
                }
                Ok(())
            })
            .await;
            match result {
                Ok(a) if a.status == AgentStatus::Offline => {
                    warn!(agent_id = %a.agent_id, "agent heartbeat stale, marked offline");
                    marked.push(a.agent_id);
                }
                Ok(_) => {}
                Err(e) => warn!(agent_id = %agent.agent_id, error = %e, "failed to mark agent offline"),
            }
        }
        Ok(marked)
    }

    // -----------------------------------------------------------------------
    // Manual lifecycle
    // -----------------------------------------------------------------------

    /// Hand a PENDING task to a specific agent. Refused with
    /// `AgentSaturated` once the agent holds its cap of in-flight tasks.
    pub async fn assign(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| CoreError::not_found("agent", agent_id))?;
        let task = self.get_status(task_id).await?;
        if agent.status != AgentStatus::Active {
            return Err(CoreError::Validation(format!(
                "agent {agent_id} is {}",
                agent.status
            )));
        }
        if !agent.has_capability(&task.capability_required) {
            return Err(CoreError::Validation(format!(
                "agent {agent_id} lacks capability {}",
                task.capability_required
            )));
        }

        let now = self.clock.now();
        let task = modify_task_for_agent(
            self.store.as_ref(),
            task_id,
            agent_id,
            self.cfg.max_concurrent_per_agent,
            |t| t.assign(agent_id, now),
        )
        .await?;
        info!(task_id = %task_id, agent_id = %agent_id, "task assigned");
        Ok(task)
    }

    /// The assigned agent accepts its task.
    pub async fn start_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let now = self.clock.now();
        let task = modify_task(self.store.as_ref(), task_id, |t| t.start(agent_id, now)).await?;
        info!(task_id = %task_id, agent_id = %agent_id, "task started");
        Ok(task)
    }

    /// Settle an ACTIVE task with the assigned agent's result.
    pub async fn report_outcome(
        &self,
        task_id: &str,
        agent_id: &str,
        outcome: Outcome,
    ) -> Result<Task> {
        match outcome {
            Outcome::Success(value) => {
                let now = self.clock.now();
                let task = modify_task(self.store.as_ref(), task_id, |t| {
                    t.complete(agent_id, value.clone(), now)
                })
                .await?;
                self.credit(agent_id, &task).await;
                info!(task_id = %task_id, agent_id = %agent_id, "task completed");
                Ok(task)
            }
            Outcome::Failure(error) => {
                let settled = self
                    .settle_failure(task_id, &error, |t| {
                        let held = t.assigned_agent_id.as_deref() == Some(agent_id);
                        t.status == TaskStatus::Active && held
                    })
                    .await?;
                self.charge(agent_id, task_id).await;
                Ok(settled)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Periodic passes
    // -----------------------------------------------------------------------

    /// One routing tick over every ready PENDING task.
    pub async fn route_pending(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        self.route(false).await
    }

    /// One routing tick restricted to tasks whose retry backoff has elapsed.
    pub async fn route_due_retries(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        self.route(true).await
    }

    async fn route(self: &Arc<Self>, retries_only: bool) -> Result<Vec<JoinHandle<()>>> {
        let mut ready = self.ready_tasks(retries_only).await?;
        let mut loads = self.loads().await?;
        let mut handles = Vec::new();

        while handles.len() < self.cfg.batch_limit {
            let Some(idx) = self.scheduler.select(&ready) else {
                break;
            };
            let task = ready.swap_remove(idx);
            let agents = self.ranked_agent_ids(&task.capability_required, &loads).await?;
            if agents.is_empty() {
                debug!(
                    task_id = %task.id,
                    capability = %task.capability_required,
                    "no eligible agent, task stays pending"
                );
                continue;
            }

            let (task, agents) = match self.claim_first(&task.id, agents).await? {
                Claim::Won(task, agents) => (task, agents),
                Claim::Saturated => {
                    debug!(task_id = %task.id, "every ranked agent at capacity, task stays pending");
                    continue;
                }
                Claim::Lost => {
                    debug!(task_id = %task.id, "task claimed elsewhere");
                    continue;
                }
            };
            if let Some(holder) = agents.first() {
                *loads.entry(holder.clone()).or_default() += 1;
            }

            let router = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let task_id = task.id.clone();
                if let Err(e) = router.dispatch(task, agents).await {
                    warn!(task_id = %task_id, error = %e, "dispatch failed");
                }
            }));
        }

        if !handles.is_empty() {
            info!(dispatched = handles.len(), retries_only, "routing tick complete");
        }
        Ok(handles)
    }

    /// Fail ACTIVE tasks that outlived their timeout and route them through
    /// the retry check. Returns the settled tasks.
    pub async fn check_timeouts(&self) -> Result<Vec<Task>> {
        let mut settled = Vec::new();
        for task in self.timeouts.expired(self.cfg.batch_limit).await? {
            let error = timeout_message(task.timeout_seconds);
            let attempt = task.started_at;
            let result = self
                .settle_failure(&task.id, &error, |t| {
                    t.status == TaskStatus::Active && t.started_at == attempt
                })
                .await;
            match result {
                Ok(done) => {
                    warn!(
                        task_id = %task.id,
                        timeout_seconds = task.timeout_seconds,
                        status = %done.status,
                        "task timed out"
                    );
                    if let Some(agent_id) = &task.assigned_agent_id {
                        self.charge(agent_id, &task.id).await;
                    }
                    settled.push(done);
                }
                Err(e) if e.is_conflict() => {
                    debug!(task_id = %task.id, "timed out task already settled");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(settled)
    }

    /// Age-based priority boost over PENDING tasks. Returns how many changed.
    pub async fn boost_aged_tasks(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut boosted = 0;
        for task in self
            .store
            .list_tasks(&TaskFilter::status(TaskStatus::Pending))
            .await?
        {
            let mut candidate = task.clone();
            if !self.scheduler.boost(&mut candidate, now) {
                continue;
            }
            let mut changed = false;
            let result = modify_task(self.store.as_ref(), &task.id, |t| {
                changed = self.scheduler.boost(t, now);
                Ok(())
            })
            .await;
            match result {
                Ok(t) if changed => {
                    debug!(task_id = %t.id, priority = t.priority, "priority boosted");
                    boosted += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "priority boost failed"),
            }
        }
        if boosted > 0 {
            info!(boosted, "aged tasks boosted");
        }
        Ok(boosted)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let open = TaskFilter {
            statuses: vec![TaskStatus::Pending, TaskStatus::Assigned, TaskStatus::Active],
            ..TaskFilter::default()
        };
        Ok(FairScheduler::stats(&self.store.list_tasks(&open).await?))
    }

    // -----------------------------------------------------------------------
    // Routing health
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn health(&self) -> HealthSummary {
        self.failover.health_summary()
    }

    #[must_use]
    pub fn routing_log(&self, task_id: &str) -> Vec<RoutingEvent> {
        self.failover.routing_log(task_id)
    }

    #[must_use]
    pub fn recent_routing_failures(&self, limit: usize) -> Vec<RoutingEvent> {
        self.failover.recent_failures(limit)
    }

    pub fn reset_circuit(&self, agent_id: &str) {
        self.failover.breaker().reset(agent_id);
        info!(agent_id = %agent_id, "circuit reset by operator");
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run one task to a terminal state, waiting out retry backoff. Used by
    /// the chain engine, whose tasks are not picked up by routing ticks.
    pub async fn execute_task(&self, task_id: &str) -> Result<Task> {
        loop {
            let task = self.get_status(task_id).await?;
            match task.status {
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                    return Ok(task);
                }
                TaskStatus::Assigned | TaskStatus::Active => {
                    tokio::time::sleep(EXECUTE_POLL).await;
                }
                TaskStatus::Pending => {
                    let now = self.clock.now();
                    if !task.retry_due(now) {
                        let wait = task
                            .next_retry_at
                            .map(|at| (at - now).to_std().unwrap_or(EXECUTE_POLL))
                            .unwrap_or(EXECUTE_POLL);
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    let loads = self.loads().await?;
                    let agents = self.ranked_agent_ids(&task.capability_required, &loads).await?;
                    if agents.is_empty() {
                        if self.has_capable_agent(&task.capability_required).await? {
                            debug!(
                                task_id = %task_id,
                                capability = %task.capability_required,
                                "capable agents saturated, waiting"
                            );
                            tokio::time::sleep(self.saturation_wait()).await;
                            continue;
                        }
                        let error = format!(
                            "no eligible agent for capability {}",
                            task.capability_required
                        );
                        let failed = modify_task(self.store.as_ref(), task_id, |t| {
                            t.fail_unrunnable(error.as_str(), now)
                        })
                        .await;
                        match failed {
                            Ok(_) => warn!(task_id = %task_id, error = %error, "task unrunnable"),
                            Err(e) if e.is_conflict() => {}
                            Err(e) => return Err(e),
                        }
                        continue;
                    }

                    match self.claim_first(task_id, agents).await? {
                        Claim::Won(claimed, agents) => {
                            self.dispatch(claimed, agents).await?;
                        }
                        Claim::Saturated => tokio::time::sleep(self.saturation_wait()).await,
                        Claim::Lost => {}
                    }
                }
            }
        }
    }

    /// Claim for the first ranked agent with room. The winning agent is
    /// moved to the head of the returned list.
    async fn claim_first(&self, task_id: &str, mut agents: Vec<String>) -> Result<Claim> {
        let mut won = None;
        for (idx, agent_id) in agents.iter().enumerate() {
            let claimed = self.claim(task_id, agent_id).await;
            match claimed {
                Ok(task) => {
                    won = Some((idx, task));
                    break;
                }
                Err(CoreError::AgentSaturated(_)) => {
                    debug!(task_id = %task_id, agent_id = %agent_id, "agent at capacity, trying next");
                }
                Err(e) if e.is_conflict() => return Ok(Claim::Lost),
                Err(e) => return Err(e),
            }
        }
        let Some((idx, task)) = won else {
            return Ok(Claim::Saturated);
        };
        agents[..=idx].rotate_right(1);
        Ok(Claim::Won(task, agents))
    }

    /// PENDING -> ASSIGNED -> ACTIVE on behalf of `agent_id`, as two
    /// conditional writes. The first one is admitted against the agent's cap.
    async fn claim(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let now = self.clock.now();
        modify_task_for_agent(
            self.store.as_ref(),
            task_id,
            agent_id,
            self.cfg.max_concurrent_per_agent,
            |t| {
                if !t.retry_due(now) {
                    return Err(CoreError::InvalidTransition {
                        task_id: t.id.clone(),
                        from: t.status,
                        to: TaskStatus::Assigned,
                    });
                }
                t.assign(agent_id, now)
            },
        )
        .await?;
        let task = modify_task(self.store.as_ref(), task_id, |t| t.start(agent_id, now)).await?;
        debug!(task_id = %task_id, agent_id = %agent_id, "task claimed");
        Ok(task)
    }

    /// Deliver an ACTIVE task through the failover dispatcher and settle it.
    ///
    /// The store always names the agent currently being contacted: before a
    /// fallback agent is tried the task is handed over to it, subject to
    /// that agent's cap.
    async fn dispatch(&self, task: Task, agents: Vec<String>) -> Result<Task> {
        let attempt = task.started_at;
        let payload = DispatchPayload::from(&task);
        let budget = Duration::from_secs(task.timeout_seconds);
        let failed_agents = parking_lot::Mutex::new(Vec::<String>::new());
        let holder = parking_lot::Mutex::new(task.assigned_agent_id.clone());

        let transport = self.transport.as_ref();
        let payload_ref = &payload;
        let failed_ref = &failed_agents;
        let holder_ref = &holder;
        let task_id = task.id.as_str();
        let result = self
            .failover
            .dispatch_admitted(
                task_id,
                &agents,
                move |agent_id| async move {
                    let held = holder_ref.lock().as_deref() == Some(agent_id.as_str());
                    if held {
                        return true;
                    }
                    match self.hand_over_to(task_id, &agent_id, attempt).await {
                        Ok(_) => {
                            *holder_ref.lock() = Some(agent_id);
                            true
                        }
                        Err(e) => {
                            debug!(task_id = %task_id, agent_id = %agent_id, error = %e, "agent not admitted");
                            false
                        }
                    }
                },
                move |agent_id| async move {
                    let delivered = match tokio::time::timeout(
                        budget,
                        transport.deliver(&agent_id, payload_ref),
                    )
                    .await
                    {
                        Ok(r) => r,
                        Err(_) => Err(DispatchError::Timeout(payload_ref.timeout_seconds)),
                    };
                    match delivered {
                        Ok(value) => Ok(value),
                        Err(e) => {
                            failed_ref.lock().push(agent_id);
                            let reason = e.to_string();
                            if is_retryable(&reason) {
                                Err(e)
                            } else {
                                Err(DispatchError::Permanent(reason))
                            }
                        }
                    }
                },
            )
            .await;

        for agent_id in failed_agents.into_inner() {
            self.charge(&agent_id, &task.id).await;
        }

        let same_attempt = |t: &Task| t.status == TaskStatus::Active && t.started_at == attempt;
        match result {
            Ok(success) => {
                let now = self.clock.now();
                let winner = success.agent_id;
                let completed = modify_task(self.store.as_ref(), &task.id, |t| {
                    if !same_attempt(t) {
                        return Err(stale(t));
                    }
                    t.complete(&winner, success.value.clone(), now)
                })
                .await;
                match completed {
                    Ok(done) => {
                        self.credit(&winner, &done).await;
                        info!(
                            task_id = %done.id,
                            agent_id = %winner,
                            attempt = success.attempt,
                            "task completed"
                        );
                        Ok(done)
                    }
                    Err(e) if e.is_conflict() => {
                        info!(task_id = %task.id, agent_id = %winner, "discarding stale result");
                        self.get_status(&task.id).await
                    }
                    Err(e) => Err(e),
                }
            }
            Err(
                FailoverError::AllAgentsFailed {
                    last_error: error, ..
                }
                | FailoverError::Permanent { error, .. },
            ) => match self.settle_failure(&task.id, &error, same_attempt).await {
                Err(e) if e.is_conflict() => {
                    info!(task_id = %task.id, "discarding stale failure");
                    self.get_status(&task.id).await
                }
                other => other,
            },
        }
    }

    /// Move the ACTIVE task of this attempt onto `agent_id`, admitted
    /// against that agent's cap.
    async fn hand_over_to(
        &self,
        task_id: &str,
        agent_id: &str,
        attempt: Option<DateTime<Utc>>,
    ) -> Result<Task> {
        let now = self.clock.now();
        modify_task_for_agent(
            self.store.as_ref(),
            task_id,
            agent_id,
            self.cfg.max_concurrent_per_agent,
            |t| {
                if !(t.status == TaskStatus::Active && t.started_at == attempt) {
                    return Err(stale(t));
                }
                t.hand_over(agent_id, now)
            },
        )
        .await
    }

    /// Move an ACTIVE task that failed with `error` to PENDING (retry) or
    /// FAILED. `guard` must hold on the stored row or the write is refused.
    async fn settle_failure<G>(&self, task_id: &str, error: &str, guard: G) -> Result<Task>
    where
        G: Fn(&Task) -> bool + Send + Sync,
    {
        let now = self.clock.now();
        let mut decision = RetryDecision::Permanent;
        let task = modify_task(self.store.as_ref(), task_id, |t| {
            if !guard(t) {
                return Err(stale(t));
            }
            decision = self.retry.evaluate(t, error, now);
            match &decision {
                RetryDecision::Retry { next_retry_at, .. } => t.requeue(error, *next_retry_at),
                RetryDecision::Permanent | RetryDecision::Exhausted => t.fail(error, now),
            }
        })
        .await?;

        let settled = match decision {
            RetryDecision::Retry { delay_secs, .. } => {
                info!(
                    task_id = %task_id,
                    retry_count = task.retry_count,
                    delay_secs,
                    error = %error,
                    "task requeued for retry"
                );
                Settled::Requeued(task)
            }
            RetryDecision::Permanent => {
                warn!(task_id = %task_id, error = %error, "task failed permanently");
                Settled::Failed(task)
            }
            RetryDecision::Exhausted => {
                warn!(
                    task_id = %task_id,
                    retry_count = task.retry_count,
                    error = %error,
                    "task failed, retries exhausted"
                );
                Settled::Failed(task)
            }
        };

        match settled {
            Settled::Requeued(task) => Ok(task),
            Settled::Failed(task) => {
                self.propagate(task_id, "failed").await;
                Ok(task)
            }
        }
    }

    /// Fail PENDING tasks that wait on a task which can no longer complete,
    /// transitively. Chain members are left to the chain engine.
    async fn propagate(&self, root: &str, verb: &str) {
        let mut queue = VecDeque::from([root.to_string()]);
        while let Some(parent) = queue.pop_front() {
            let filter = TaskFilter {
                statuses: vec![TaskStatus::Pending],
                depends_on: Some(parent.clone()),
                ..TaskFilter::default()
            };
            let dependents = match self.store.list_tasks(&filter).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(task_id = %parent, error = %e, "dependency lookup failed");
                    continue;
                }
            };
            let error = format!("Dependency task {parent} {verb}");
            for child in dependents.into_iter().filter(|t| t.chain_id.is_none()) {
                let now = self.clock.now();
                match modify_task(self.store.as_ref(), &child.id, |t| {
                    t.fail_unrunnable(error.as_str(), now)
                })
                .await
                {
                    Ok(_) => {
                        info!(task_id = %child.id, dependency = %parent, "dependent task failed");
                        queue.push_back(child.id);
                    }
                    Err(e) if e.is_conflict() => {}
                    Err(e) => warn!(task_id = %child.id, error = %e, "failed to fail dependent"),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// PENDING, unchained, retry-due tasks whose dependencies all completed.
    async fn ready_tasks(&self, retries_only: bool) -> Result<Vec<Task>> {
        let now = self.clock.now();
        let pending = self
            .store
            .list_tasks(&TaskFilter::status(TaskStatus::Pending))
            .await?;

        let mut dep_status: HashMap<String, Option<TaskStatus>> = HashMap::new();
        let mut ready = Vec::new();
        for task in pending {
            if task.chain_id.is_some() || !task.retry_due(now) {
                continue;
            }
            if retries_only && task.retry_count == 0 {
                continue;
            }
            let mut runnable = true;
            for dep in &task.depends_on {
                let status = match dep_status.get(dep) {
                    Some(s) => *s,
                    None => {
                        let s = self.store.get_task(dep).await?.map(|t| t.status);
                        dep_status.insert(dep.clone(), s);
                        s
                    }
                };
                if status != Some(TaskStatus::Completed) {
                    runnable = false;
                    break;
                }
            }
            if runnable {
                ready.push(task);
            }
        }
        Ok(ready)
    }

    /// In-flight task count per agent.
    async fn loads(&self) -> Result<HashMap<String, usize>> {
        let filter = TaskFilter {
            statuses: vec![TaskStatus::Assigned, TaskStatus::Active],
            ..TaskFilter::default()
        };
        Ok(FairScheduler::stats(&self.store.list_tasks(&filter).await?).agent_workload)
    }

    /// Some ACTIVE agent could run `capability` once it has room.
    async fn has_capable_agent(&self, capability: &str) -> Result<bool> {
        let agents = self
            .trust
            .rank_agents(capability, &HashMap::new(), usize::MAX, self.cfg.min_trust_score)
            .await?;
        Ok(!agents.is_empty())
    }

    fn saturation_wait(&self) -> Duration {
        Duration::from_secs(self.cfg.routing_interval_secs.max(1))
    }

    async fn ranked_agent_ids(
        &self,
        capability: &str,
        loads: &HashMap<String, usize>,
    ) -> Result<Vec<String>> {
        Ok(self
            .trust
            .rank_agents(
                capability,
                loads,
                self.cfg.max_concurrent_per_agent,
                self.cfg.min_trust_score,
            )
            .await?
            .into_iter()
            .map(|a| a.agent_id)
            .collect())
    }

    async fn credit(&self, agent_id: &str, task: &Task) {
        let outcome = TaskOutcome {
            success: true,
            elapsed_seconds: elapsed_between(task.started_at, task.completed_at),
            timeout_seconds: task.timeout_seconds,
        };
        if let Err(e) = self.trust.record_task_outcome(agent_id, &task.id, outcome).await {
            warn!(agent_id = %agent_id, task_id = %task.id, error = %e, "trust credit failed");
        }
    }

    async fn charge(&self, agent_id: &str, task_id: &str) {
        let outcome = TaskOutcome {
            success: false,
            elapsed_seconds: None,
            timeout_seconds: 0,
        };
        if let Err(e) = self.trust.record_task_outcome(agent_id, task_id, outcome).await {
            warn!(agent_id = %agent_id, task_id = %task_id, error = %e, "trust charge failed");
        }
    }
}

fn stale(t: &Task) -> CoreError {
    CoreError::InvalidTransition {
        task_id: t.id.clone(),
        from: t.status,
        to: TaskStatus::Failed,
    }
}

#[allow(clippy::cast_precision_loss)]
fn elapsed_between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<f64> {
    let (start, end) = (start?, end?);
    Some((end - start).num_milliseconds() as f64 / 1000.0)
}
