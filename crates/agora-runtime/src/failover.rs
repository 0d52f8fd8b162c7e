/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Failover dispatch across a ranked agent list.
//!
//! For each outer attempt the agent list is walked in rank order. Agents
//! whose circuit is OPEN are skipped; everyone else is tried through their
//! circuit breaker until one succeeds. Every step lands in a bounded
//! routing log.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::circuit::{CircuitBreaker, CircuitError, CircuitState};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Outcome of a single delivery to a single agent.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{0}")]
    Failed(String),
    #[error("Task timed out after {0} seconds")]
    Timeout(u64),
    #[error("agent unreachable: {0}")]
    Unreachable(String),
    /// The agent answered with an error no other agent will fix.
    #[error("{0}")]
    Permanent(String),
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum FailoverError {
    #[error("all agents failed for task {task_id} after {attempts} attempt(s): {last_error}")]
    AllAgentsFailed {
        task_id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("task {task_id} failed permanently on agent {agent_id}: {error}")]
    Permanent {
        task_id: String,
        agent_id: String,
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Routing log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingStatus {
    Skipped,
    Success,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingEvent {
    pub task_id: String,
    pub agent_id: String,
    pub attempt: u32,
    pub status: RoutingStatus,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailoverSuccess<T> {
    pub agent_id: String,
    pub attempt: u32,
    pub value: T,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    pub total_agents: usize,
    pub healthy: usize,
    pub half_open: usize,
    pub open: usize,
    pub routing_events: usize,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct FailoverDispatcher {
    breaker: Arc<CircuitBreaker>,
    max_attempts: u32,
    capacity: usize,
    log: Mutex<VecDeque<RoutingEvent>>,
}

impl FailoverDispatcher {
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, max_attempts: u32, capacity: usize) -> Self {
        Self {
            breaker,
            max_attempts: max_attempts.max(1),
            capacity: capacity.max(1),
            log: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn from_config(breaker: Arc<CircuitBreaker>, cfg: &agora_config::FailoverConfig) -> Self {
        Self::new(breaker, cfg.max_attempts, cfg.routing_log_capacity)
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Dispatch `task_id` to the first agent in `agents` that accepts it.
    ///
    /// `call` receives the agent id and performs one delivery.
    ///
    /// # Errors
    ///
    /// `FailoverError::AllAgentsFailed` once every agent has been skipped,
    /// rejected or has failed on every attempt. `FailoverError::Permanent`
    /// as soon as one agent reports a permanent failure.
    pub async fn dispatch<F, Fut, T>(
        &self,
        task_id: &str,
        agents: &[String],
        call: F,
    ) -> Result<FailoverSuccess<T>, FailoverError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        self.dispatch_admitted(task_id, agents, |_| std::future::ready(true), call)
            .await
    }

    /// Like [`dispatch`](Self::dispatch), but every agent must pass `admit`
    /// right before it is contacted. A refused agent is logged as skipped.
    ///
    /// # Errors
    ///
    /// Same as [`dispatch`](Self::dispatch).
    pub async fn dispatch_admitted<A, AFut, F, Fut, T>(
        &self,
        task_id: &str,
        agents: &[String],
        mut admit: A,
        mut call: F,
    ) -> Result<FailoverSuccess<T>, FailoverError>
    where
        A: FnMut(String) -> AFut,
        AFut: Future<Output = bool>,
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let mut last_error = String::from("no agents available");

        for attempt in 1..=self.max_attempts {
            for agent_id in agents {
                if self.breaker.state(agent_id) == CircuitState::Open {
                    self.record(task_id, agent_id, attempt, RoutingStatus::Skipped, Some("circuit open"));
                    continue;
                }
                if !admit(agent_id.clone()).await {
                    self.record(task_id, agent_id, attempt, RoutingStatus::Skipped, Some("agent at capacity"));
                    last_error = format!("agent {agent_id} at capacity");
                    continue;
                }

                let outcome = self.breaker.call(agent_id, || call(agent_id.clone())).await;
                match outcome {
                    Ok(value) => {
                        self.record(task_id, agent_id, attempt, RoutingStatus::Success, None);
                        info!(task_id = %task_id, agent_id = %agent_id, attempt, "task dispatched");
                        return Ok(FailoverSuccess {
                            agent_id: agent_id.clone(),
                            attempt,
                            value,
                        });
                    }
                    Err(CircuitError::Open(_)) => {
                        self.record(task_id, agent_id, attempt, RoutingStatus::Rejected, Some("circuit open"));
                        last_error = format!("circuit open for agent {agent_id}");
                    }
                    Err(CircuitError::Inner(DispatchError::Permanent(error))) => {
                        warn!(
                            task_id = %task_id,
                            agent_id = %agent_id,
                            attempt,
                            error = %error,
                            "permanent dispatch failure, stopping failover"
                        );
                        self.record(task_id, agent_id, attempt, RoutingStatus::Failed, Some(&error));
                        return Err(FailoverError::Permanent {
                            task_id: task_id.to_string(),
                            agent_id: agent_id.clone(),
                            error,
                        });
                    }
                    Err(CircuitError::Inner(e)) => {
                        let reason = e.to_string();
                        warn!(
                            task_id = %task_id,
                            agent_id = %agent_id,
                            attempt,
                            error = %reason,
                            "dispatch attempt failed"
                        );
                        self.record(task_id, agent_id, attempt, RoutingStatus::Failed, Some(&reason));
                        last_error = reason;
                    }
                }
            }
        }

        warn!(task_id = %task_id, attempts = self.max_attempts, "all agents failed");
        Err(FailoverError::AllAgentsFailed {
            task_id: task_id.to_string(),
            attempts: self.max_attempts,
            last_error,
        })
    }

    fn record(
        &self,
        task_id: &str,
        agent_id: &str,
        attempt: u32,
        status: RoutingStatus,
        reason: Option<&str>,
    ) {
        let mut log = self.log.lock();
        if log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(RoutingEvent {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            attempt,
            status,
            reason: reason.map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    /// Routing events for one task, oldest first.
    #[must_use]
    pub fn routing_log(&self, task_id: &str) -> Vec<RoutingEvent> {
        self.log
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Most recent non-success events, newest first.
    #[must_use]
    pub fn recent_failures(&self, limit: usize) -> Vec<RoutingEvent> {
        self.log
            .lock()
            .iter()
            .rev()
            .filter(|e| e.status != RoutingStatus::Success)
            .take(limit)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn health_summary(&self) -> HealthSummary {
        let snapshots = self.breaker.snapshots();
        let mut summary = HealthSummary {
            total_agents: snapshots.len(),
            routing_events: self.log.lock().len(),
            ..HealthSummary::default()
        };
        for snap in &snapshots {
            match self.breaker.state(&snap.agent_id) {
                CircuitState::Closed => summary.healthy += 1,
                CircuitState::HalfOpen => summary.half_open += 1,
                CircuitState::Open => summary.open += 1,
            }
        }
        summary
    }
}
