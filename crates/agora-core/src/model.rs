/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Records owned by the dispatch engine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Status enums are stored as their upper-case names.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(CoreError::Validation(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Active,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(TaskStatus {
    Pending => "PENDING",
    Assigned => "ASSIGNED",
    Active => "ACTIVE",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Holds an agent slot.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Assigned | Self::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

text_enum!(RetryPolicy {
    Exponential => "exponential",
    Linear => "linear",
    Fixed => "fixed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Active,
    Degraded,
    Offline,
}

text_enum!(AgentStatus {
    Active => "ACTIVE",
    Degraded => "DEGRADED",
    Offline => "OFFLINE",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Deadlocked,
}

text_enum!(ChainStatus {
    Pending => "PENDING",
    Running => "RUNNING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Deadlocked => "DEADLOCKED",
});

impl ChainStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Deadlocked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Active,
    Paused,
}

text_enum!(ScheduleStatus {
    Active => "ACTIVE",
    Paused => "PAUSED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustEvent {
    TaskCompleted,
    TaskFailed,
    Recalculated,
    Manual,
}

text_enum!(TrustEvent {
    TaskCompleted => "task_completed",
    TaskFailed => "task_failed",
    Recalculated => "recalculated",
    Manual => "manual",
});

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

/// What a client submits. Unset knobs fall back to the engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub client_id: String,
    pub capability_required: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TaskSpec {
    #[must_use]
    pub fn new(client_id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            capability_required: capability.into(),
            priority: DEFAULT_PRIORITY,
            input: Value::Null,
            timeout_seconds: None,
            max_retries: None,
            retry_policy: None,
            depends_on: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, policy: RetryPolicy) -> Self {
        self.max_retries = Some(max_retries);
        self.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn depending_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Shape checks that need no store access.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.client_id.trim().is_empty() {
            return Err(CoreError::Validation("client_id must not be empty".into()));
        }
        if self.capability_required.trim().is_empty() {
            return Err(CoreError::Validation(
                "capability_required must not be empty".into(),
            ));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(CoreError::Validation(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {}",
                self.priority
            )));
        }
        if self.timeout_seconds == Some(0) {
            return Err(CoreError::Validation(
                "timeout_seconds must be positive".into(),
            ));
        }
        let unique: BTreeSet<&String> = self.depends_on.iter().collect();
        if unique.len() != self.depends_on.len() {
            return Err(CoreError::Validation("depends_on contains duplicates".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub client_id: String,
    pub capability_required: String,
    pub priority: u8,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<String>,
    pub input: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub depends_on: Vec<String>,
    pub chain_id: Option<String>,
    pub schedule_id: Option<String>,
    /// Set when the task was submitted as part of a batch.
    pub batch_id: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub cancellation_reason: Option<String>,
    /// Last age-based priority boost.
    pub boosted_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: i64,
}

impl Task {
    /// Materialize a validated spec into a fresh PENDING task.
    #[must_use]
    pub fn from_spec(
        id: String,
        spec: &TaskSpec,
        now: DateTime<Utc>,
        default_timeout: u64,
        default_max_retries: u32,
        default_policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            client_id: spec.client_id.clone(),
            capability_required: spec.capability_required.clone(),
            priority: spec.priority,
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            input: spec.input.clone(),
            result: None,
            error: None,
            created_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            timeout_seconds: spec.timeout_seconds.unwrap_or(default_timeout),
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            retry_policy: spec.retry_policy.unwrap_or(default_policy),
            next_retry_at: None,
            depends_on: spec.depends_on.clone(),
            chain_id: None,
            schedule_id: None,
            batch_id: None,
            cancelled_at: None,
            cancelled_by: None,
            cancellation_reason: None,
            boosted_at: None,
            version: 0,
        }
    }

    /// Retry backoff has elapsed (or the task was never retried).
    #[must_use]
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_count == 0 || self.next_retry_at.map_or(true, |at| now >= at)
    }

    /// Seconds spent since the task went ACTIVE.
    #[must_use]
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        self.started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0)
    }
}

// ---------------------------------------------------------------------------
// Agent and trust audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub agent_id: String,
    pub capabilities: BTreeSet<String>,
    pub trust_score: f64,
    pub total_completed: i64,
    pub total_failed: i64,
    pub avg_completion_time_seconds: Option<f64>,
    pub last_task_completed_at: Option<DateTime<Utc>>,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub version: i64,
}

impl Agent {
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
        initial_score: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: capabilities.into_iter().collect(),
            trust_score: initial_score.clamp(0.0, 1.0),
            total_completed: 0,
            total_failed: 0,
            avg_completion_time_seconds: None,
            last_task_completed_at: None,
            status: AgentStatus::Active,
            last_heartbeat: Some(now),
            registered_at: now,
            version: 0,
        }
    }

    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    #[must_use]
    pub fn total_tasks(&self) -> i64 {
        self.total_completed + self.total_failed
    }
}

/// Immutable audit entry, one per trust mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustRecord {
    pub id: String,
    pub agent_id: String,
    pub event_type: TrustEvent,
    pub delta: f64,
    pub score_before: f64,
    pub score_after: f64,
    pub task_id: Option<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Chains and schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskChain {
    pub chain_id: String,
    pub client_id: String,
    /// Member task ids in creation order.
    pub task_ids: Vec<String>,
    /// task id -> predecessor ids.
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub status: ChainStatus,
    pub step_results: BTreeMap<String, Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    pub schedule_id: String,
    pub name: String,
    pub cron_expression: String,
    pub template: TaskSpec,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_runs: i64,
    pub failed_runs: i64,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}
