/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Deadline tracking for ACTIVE tasks.
//!
//! Detection only. Expired tasks are failed by the router so they go
//! through the same trust and retry path as any other failure.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::model::{Task, TaskStatus};
use crate::store::{modify_task, TaskFilter, TaskStore};

#[must_use]
pub fn timeout_message(timeout_seconds: u64) -> String {
    format!("Task timed out after {timeout_seconds} seconds")
}

/// Seconds left before the deadline. `None` unless ACTIVE.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn remaining_seconds(task: &Task, now: DateTime<Utc>) -> Option<f64> {
    if task.status != TaskStatus::Active {
        return None;
    }
    task.elapsed_seconds(now)
        .map(|elapsed| task.timeout_seconds as f64 - elapsed)
}

#[must_use]
pub fn is_expired(task: &Task, now: DateTime<Utc>) -> bool {
    remaining_seconds(task, now).is_some_and(|left| left < 0.0)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AtRiskTask {
    pub task_id: String,
    pub agent_id: Option<String>,
    pub remaining_seconds: f64,
    pub timeout_seconds: u64,
}

pub struct TimeoutManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    at_risk_fraction: f64,
}

impl TimeoutManager {
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, at_risk_fraction: f64) -> Self {
        Self {
            store,
            clock,
            at_risk_fraction,
        }
    }

    /// ACTIVE tasks past their deadline, oldest first.
    pub async fn expired(&self, limit: usize) -> Result<Vec<Task>> {
        let now = self.clock.now();
        let active = self
            .store
            .list_tasks(&TaskFilter::status(TaskStatus::Active))
            .await?;
        Ok(active
            .into_iter()
            .filter(|t| is_expired(t, now))
            .take(limit)
            .collect())
    }

    /// ACTIVE tasks still running but with less than the at-risk fraction
    /// of their budget left.
    #[allow(clippy::cast_precision_loss)]
    pub async fn at_risk(&self) -> Result<Vec<AtRiskTask>> {
        let now = self.clock.now();
        let active = self
            .store
            .list_tasks(&TaskFilter::status(TaskStatus::Active))
            .await?;
        Ok(active
            .into_iter()
            .filter_map(|t| {
                let left = remaining_seconds(&t, now)?;
                let threshold = t.timeout_seconds as f64 * self.at_risk_fraction;
                (left > 0.0 && left < threshold).then(|| AtRiskTask {
                    task_id: t.id.clone(),
                    agent_id: t.assigned_agent_id.clone(),
                    remaining_seconds: left,
                    timeout_seconds: t.timeout_seconds,
                })
            })
            .collect())
    }

    /// Change the deadline of a task that has not finished yet.
    pub async fn set_timeout(&self, task_id: &str, timeout_seconds: u64) -> Result<Task> {
        if timeout_seconds == 0 {
            return Err(CoreError::Validation(
                "timeout_seconds must be positive".into(),
            ));
        }
        modify_task(self.store.as_ref(), task_id, |t| {
            if t.status.is_terminal() {
                return Err(CoreError::Validation(format!(
                    "task {} is {}, timeout can no longer change",
                    t.id, t.status
                )));
            }
            t.timeout_seconds = timeout_seconds;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{RetryPolicy, TaskSpec};
    use crate::store::memory::MemoryStore;
    use chrono::Duration;

    async fn setup() -> (TimeoutManager, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let mgr = TimeoutManager::new(
            store.clone() as Arc<dyn TaskStore>,
            clock.clone() as Arc<dyn Clock>,
            0.1,
        );
        (mgr, store, clock)
    }

    async fn active_task(store: &MemoryStore, id: &str, timeout: u64, now: DateTime<Utc>) {
        let mut t = Task::from_spec(
            id.into(),
            &TaskSpec::new("c", "ocr").with_timeout(timeout),
            now,
            300,
            3,
            RetryPolicy::Exponential,
        );
        t.assign("a", now).unwrap();
        t.start("a", now).unwrap();
        store.insert_task(&t).await.unwrap();
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(timeout_message(30), "Task timed out after 30 seconds");
    }

    #[tokio::test]
    async fn test_expired_and_at_risk() {
        let (mgr, store, clock) = setup().await;
        let now = clock.now();
        active_task(&store, "short", 10, now).await;
        active_task(&store, "long", 100, now).await;

        clock.advance(Duration::seconds(5));
        assert!(mgr.expired(10).await.unwrap().is_empty());
        assert!(mgr.at_risk().await.unwrap().is_empty());

        clock.advance(Duration::seconds(87));
        let risky = mgr.at_risk().await.unwrap();
        assert_eq!(risky.len(), 1);
        assert_eq!(risky[0].task_id, "long");
        assert!((risky[0].remaining_seconds - 8.0).abs() < 1e-9);

        let expired = mgr.expired(10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "short");
    }

    #[tokio::test]
    async fn test_exactly_at_deadline_is_not_expired() {
        let (mgr, store, clock) = setup().await;
        active_task(&store, "t", 10, clock.now()).await;
        clock.advance(Duration::seconds(10));
        assert!(mgr.expired(10).await.unwrap().is_empty());
        clock.advance(Duration::milliseconds(1));
        assert_eq!(mgr.expired(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_timeout() {
        let (mgr, store, clock) = setup().await;
        active_task(&store, "t", 10, clock.now()).await;
        let updated = mgr.set_timeout("t", 60).await.unwrap();
        assert_eq!(updated.timeout_seconds, 60);
        clock.advance(Duration::seconds(30));
        assert!(mgr.expired(10).await.unwrap().is_empty());

        assert!(matches!(
            mgr.set_timeout("t", 0).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            mgr.set_timeout("missing", 5).await,
            Err(CoreError::NotFound { .. })
        ));
    }
}
