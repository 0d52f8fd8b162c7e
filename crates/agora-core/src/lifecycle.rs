/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Guarded task transitions.
//!
//! ```text
//! PENDING -> ASSIGNED -> ACTIVE -> COMPLETED | FAILED
//!    ^                     |          |
//!    +----- requeue -------+----------+   (retry manager approval)
//! any non-terminal -> CANCELLED
//! PENDING -> FAILED                        (unrunnable: dependency failed)
//! ```
//!
//! A rejected transition returns `InvalidTransition` and leaves the task
//! untouched. Persisting the result is the caller's job.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::model::{Task, TaskStatus};

impl Task {
    fn reject(&self, to: TaskStatus) -> CoreError {
        CoreError::InvalidTransition {
            task_id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    fn held_by(&self, agent_id: &str) -> bool {
        self.assigned_agent_id.as_deref() == Some(agent_id)
    }

    /// PENDING -> ASSIGNED.
    pub fn assign(&mut self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Pending || self.assigned_agent_id.is_some() {
            return Err(self.reject(TaskStatus::Assigned));
        }
        self.status = TaskStatus::Assigned;
        self.assigned_agent_id = Some(agent_id.to_string());
        self.assigned_at = Some(now);
        Ok(())
    }

    /// Move an in-flight task to another agent without changing its status.
    pub fn hand_over(&mut self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.status.is_in_flight() {
            return Err(self.reject(self.status));
        }
        if !self.held_by(agent_id) {
            self.assigned_agent_id = Some(agent_id.to_string());
            self.assigned_at = Some(now);
        }
        Ok(())
    }

    /// ASSIGNED -> ACTIVE, only for the assigned agent.
    pub fn start(&mut self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Assigned || !self.held_by(agent_id) {
            return Err(self.reject(TaskStatus::Active));
        }
        self.status = TaskStatus::Active;
        self.started_at = Some(now);
        Ok(())
    }

    /// ACTIVE -> COMPLETED, only for the assigned agent.
    pub fn complete(&mut self, agent_id: &str, result: Value, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Active || !self.held_by(agent_id) {
            return Err(self.reject(TaskStatus::Completed));
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.assigned_agent_id = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// ACTIVE -> FAILED.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Active {
            return Err(self.reject(TaskStatus::Failed));
        }
        self.settle_failed(error.into(), now);
        Ok(())
    }

    /// PENDING -> FAILED for a task that can never run.
    pub fn fail_unrunnable(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(self.reject(TaskStatus::Failed));
        }
        self.settle_failed(error.into(), now);
        Ok(())
    }

    fn settle_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.assigned_agent_id = None;
        self.next_retry_at = None;
        self.completed_at = Some(now);
    }

    /// ACTIVE or FAILED -> PENDING with one more retry consumed.
    pub fn requeue(
        &mut self,
        error: impl Into<String>,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let retryable_state = matches!(self.status, TaskStatus::Active | TaskStatus::Failed);
        if !retryable_state || self.retry_count >= self.max_retries {
            return Err(self.reject(TaskStatus::Pending));
        }
        self.status = TaskStatus::Pending;
        self.retry_count += 1;
        self.next_retry_at = Some(next_retry_at);
        self.error = Some(error.into());
        self.assigned_agent_id = None;
        self.assigned_at = None;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }

    /// Any non-terminal state -> CANCELLED.
    pub fn cancel(&mut self, by: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.reject(TaskStatus::Cancelled));
        }
        self.status = TaskStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.cancelled_by = Some(by.to_string());
        self.cancellation_reason = Some(reason.to_string());
        self.assigned_agent_id = None;
        self.next_retry_at = None;
        self.completed_at = Some(now);
        Ok(())
    }
}
