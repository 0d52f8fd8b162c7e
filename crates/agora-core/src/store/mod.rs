/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Store of record.
//!
//! Every mutable row carries a `version`. `update_*` writes only when the
//! stored version equals the version on the passed record, bumps it by one
//! and returns whether the write won. Callers normally go through the
//! `modify_*` helpers, which re-read and retry on a lost race.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::model::{
    Agent, ChainStatus, ScheduleStatus, ScheduledTask, Task, TaskChain, TaskStatus, TrustRecord,
};

/// Re-read attempts before an optimistic write gives up.
pub const MAX_CAS_RETRIES: u32 = 5;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("duplicate {kind}: {id}")]
    Duplicate { kind: &'static str, id: String },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Task query. Empty `statuses` matches every status.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Vec<TaskStatus>,
    pub capability: Option<String>,
    pub assigned_agent_id: Option<String>,
    pub chain_id: Option<String>,
    pub schedule_id: Option<String>,
    pub batch_id: Option<String>,
    /// Tasks whose `depends_on` contains this id.
    pub depends_on: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    #[must_use]
    pub fn status(status: TaskStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && self
                .capability
                .as_ref()
                .map_or(true, |c| &task.capability_required == c)
            && self
                .assigned_agent_id
                .as_ref()
                .map_or(true, |a| task.assigned_agent_id.as_ref() == Some(a))
            && self
                .chain_id
                .as_ref()
                .map_or(true, |c| task.chain_id.as_ref() == Some(c))
            && self
                .schedule_id
                .as_ref()
                .map_or(true, |s| task.schedule_id.as_ref() == Some(s))
            && self
                .batch_id
                .as_ref()
                .map_or(true, |b| task.batch_id.as_ref() == Some(b))
            && self
                .depends_on
                .as_ref()
                .map_or(true, |d| task.depends_on.contains(d))
    }
}

/// Result of a compare-and-swap that also admits the task to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CappedWrite {
    Written,
    /// Stored version moved on.
    Lost,
    /// The agent already holds `cap` other in-flight tasks.
    AtCapacity,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> std::result::Result<(), StoreError>;
    async fn get_task(&self, id: &str) -> std::result::Result<Option<Task>, StoreError>;
    async fn update_task(&self, task: &Task) -> std::result::Result<bool, StoreError>;
    /// `update_task`, but only while `agent_id` holds fewer than `cap`
    /// in-flight tasks other than this one. The count and the write are
    /// one atomic step per agent.
    async fn update_task_within_cap(
        &self,
        task: &Task,
        agent_id: &str,
        cap: usize,
    ) -> std::result::Result<CappedWrite, StoreError>;
    /// Ordered by `created_at`, then id.
    async fn list_tasks(&self, filter: &TaskFilter) -> std::result::Result<Vec<Task>, StoreError>;

    async fn insert_agent(&self, agent: &Agent) -> std::result::Result<(), StoreError>;
    async fn get_agent(&self, agent_id: &str) -> std::result::Result<Option<Agent>, StoreError>;
    async fn update_agent(&self, agent: &Agent) -> std::result::Result<bool, StoreError>;
    async fn list_agents(&self) -> std::result::Result<Vec<Agent>, StoreError>;
    /// Write the agent and its audit record atomically.
    async fn apply_trust(
        &self,
        agent: &Agent,
        record: &TrustRecord,
    ) -> std::result::Result<bool, StoreError>;
    /// Newest first.
    async fn trust_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> std::result::Result<Vec<TrustRecord>, StoreError>;

    async fn insert_chain(&self, chain: &TaskChain) -> std::result::Result<(), StoreError>;
    async fn get_chain(&self, chain_id: &str) -> std::result::Result<Option<TaskChain>, StoreError>;
    async fn update_chain(&self, chain: &TaskChain) -> std::result::Result<bool, StoreError>;
    async fn list_chains(
        &self,
        status: Option<ChainStatus>,
    ) -> std::result::Result<Vec<TaskChain>, StoreError>;

    async fn insert_schedule(&self, schedule: &ScheduledTask)
        -> std::result::Result<(), StoreError>;
    async fn get_schedule(
        &self,
        schedule_id: &str,
    ) -> std::result::Result<Option<ScheduledTask>, StoreError>;
    async fn update_schedule(&self, schedule: &ScheduledTask)
        -> std::result::Result<bool, StoreError>;
    async fn list_schedules(
        &self,
        status: Option<ScheduleStatus>,
    ) -> std::result::Result<Vec<ScheduledTask>, StoreError>;
    async fn delete_schedule(&self, schedule_id: &str) -> std::result::Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// Optimistic read-modify-write
// ---------------------------------------------------------------------------

macro_rules! modify_fn {
    ($(#[$doc:meta])* $fn_name:ident, $ty:ty, $get:ident, $update:ident, $kind:literal) => {
        $(#[$doc])*
        pub async fn $fn_name<F>(store: &dyn TaskStore, id: &str, mut mutate: F) -> Result<$ty>
        where
            F: FnMut(&mut $ty) -> Result<()> + Send,
        {
            for attempt in 1..=MAX_CAS_RETRIES {
                let mut row = store.$get(id).await?.ok_or_else(|| CoreError::not_found($kind, id))?;
                mutate(&mut row)?;
                if store.$update(&row).await? {
                    row.version += 1;
                    return Ok(row);
                }
                debug!(kind = $kind, id = %id, attempt, "optimistic write lost, re-reading");
            }
            Err(CoreError::Contention(format!("{} {id}", $kind)))
        }
    };
}

modify_fn!(
    /// Re-read the task, apply `mutate`, compare-and-swap. A mutation error
    /// (e.g. `InvalidTransition` after someone else moved the task) aborts
    /// without writing.
    modify_task, Task, get_task, update_task, "task"
);
/// `modify_task` for mutations that hand the task to `agent_id`. Fails with
/// `AgentSaturated` instead of pushing the agent past `cap`.
pub async fn modify_task_for_agent<F>(
    store: &dyn TaskStore,
    id: &str,
    agent_id: &str,
    cap: usize,
    mut mutate: F,
) -> Result<Task>
where
    F: FnMut(&mut Task) -> Result<()> + Send,
{
    for attempt in 1..=MAX_CAS_RETRIES {
        let mut row = store
            .get_task(id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", id))?;
        mutate(&mut row)?;
        match store.update_task_within_cap(&row, agent_id, cap).await? {
            CappedWrite::Written => {
                row.version += 1;
                return Ok(row);
            }
            CappedWrite::AtCapacity => {
                return Err(CoreError::AgentSaturated(agent_id.to_string()));
            }
            CappedWrite::Lost => {
                debug!(kind = "task", id = %id, attempt, "optimistic write lost, re-reading");
            }
        }
    }
    Err(CoreError::Contention(format!("task {id}")))
}

modify_fn!(modify_agent, Agent, get_agent, update_agent, "agent");
modify_fn!(modify_chain, TaskChain, get_chain, update_chain, "chain");
modify_fn!(modify_schedule, ScheduledTask, get_schedule, update_schedule, "schedule");

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{RetryPolicy, TaskSpec};
    use chrono::Utc;

    fn task(id: &str, capability: &str) -> Task {
        Task::from_spec(
            id.into(),
            &TaskSpec::new("c", capability).depending_on(&["dep"]),
            Utc::now(),
            60,
            3,
            RetryPolicy::Exponential,
        )
    }

    #[test]
    fn test_filter_matching() {
        let t = task("t1", "ocr");
        assert!(TaskFilter::default().matches(&t));
        assert!(TaskFilter::status(TaskStatus::Pending).matches(&t));
        assert!(!TaskFilter::status(TaskStatus::Active).matches(&t));
        let by_dep = TaskFilter {
            depends_on: Some("dep".into()),
            ..TaskFilter::default()
        };
        assert!(by_dep.matches(&t));
        let by_cap = TaskFilter {
            capability: Some("translate".into()),
            ..TaskFilter::default()
        };
        assert!(!by_cap.matches(&t));
        let by_batch = TaskFilter {
            batch_id: Some("b1".into()),
            ..TaskFilter::default()
        };
        assert!(!by_batch.matches(&t));
        let mut batched = t.clone();
        batched.batch_id = Some("b1".into());
        assert!(by_batch.matches(&batched));
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Duplicate {
            kind: "task",
            id: "t1".into(),
        };
        assert_eq!(err.to_string(), "duplicate task: t1");
    }
}
