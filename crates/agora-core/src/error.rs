/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

use agora_runtime::FailoverError;

use crate::model::TaskStatus;
use crate::store::StoreError;

/// Errors surfaced by the dispatch engine.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("permanent failure: {0}")]
    PermanentFailure(String),
    #[error("retryable failure: {0}")]
    RetryableFailure(String),
    #[error("circuit open for agent {0}")]
    CircuitOpen(String),
    #[error(transparent)]
    AllAgentsFailed(#[from] FailoverError),
    #[error("chain {0} deadlocked: incomplete tasks remain but none can run")]
    ChainDeadlock(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("agent {0} is at its concurrency cap")]
    AgentSaturated(String),
    #[error("concurrent update contention on {0}")]
    Contention(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Lost an optimistic race or hit an illegal state change. Callers that
    /// compete for the same row treat this as "someone else got there first".
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. } | Self::Contention(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidTransition {
            task_id: "t1".into(),
            from: TaskStatus::Completed,
            to: TaskStatus::Active,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for task t1: COMPLETED -> ACTIVE"
        );
        assert!(err.is_conflict());
        assert_eq!(
            CoreError::not_found("task", "x").to_string(),
            "task not found: x"
        );
        assert!(!CoreError::Validation("bad".into()).is_conflict());
        assert!(!CoreError::AgentSaturated("a".into()).is_conflict());
    }
}
