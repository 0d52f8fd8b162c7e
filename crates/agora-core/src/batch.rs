/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Submit, inspect and cancel groups of tasks under one batch id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{Task, TaskSpec, TaskStatus};
use crate::router::{Origin, Router};
use crate::store::TaskFilter;

/// A spec in a batch that was not stored.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemError {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    /// Stored tasks, in submission order.
    pub task_ids: Vec<String>,
    pub errors: Vec<BatchItemError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchTaskSummary {
    pub task_id: String,
    pub status: TaskStatus,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub total: usize,
    pub status_counts: BTreeMap<String, usize>,
    /// Every task of the batch is terminal.
    pub finished: bool,
    pub tasks: Vec<BatchTaskSummary>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchCancellation {
    pub cancelled: Vec<String>,
    /// Already terminal when the cancellation arrived.
    pub skipped: Vec<String>,
}

fn new_batch_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("batch_{}", &raw[..16])
}

impl Router {
    /// Store every valid spec as a PENDING task tagged with a fresh batch
    /// id. Invalid specs are reported by index and do not stop the rest.
    pub async fn submit_batch(&self, specs: &[TaskSpec]) -> Result<BatchReceipt> {
        if specs.is_empty() {
            return Err(CoreError::Validation("batch must contain at least one task".into()));
        }
        let batch_id = new_batch_id();
        let mut receipt = BatchReceipt {
            batch_id: batch_id.clone(),
            task_ids: Vec::with_capacity(specs.len()),
            errors: Vec::new(),
        };
        for (index, spec) in specs.iter().enumerate() {
            match self.submit_with(spec, Origin::batch(&batch_id)).await {
                Ok(task) => receipt.task_ids.push(task.id),
                Err(e @ CoreError::Validation(_)) => {
                    warn!(batch_id = %batch_id, index, error = %e, "batch item rejected");
                    receipt.errors.push(BatchItemError {
                        index,
                        error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            batch_id = %batch_id,
            created = receipt.task_ids.len(),
            rejected = receipt.errors.len(),
            "batch submitted"
        );
        Ok(receipt)
    }

    pub async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        let tasks = self.batch_tasks(batch_id).await?;
        let mut status_counts = BTreeMap::new();
        for task in &tasks {
            *status_counts.entry(task.status.to_string()).or_default() += 1;
        }
        Ok(BatchStatus {
            batch_id: batch_id.to_string(),
            total: tasks.len(),
            status_counts,
            finished: tasks.iter().all(|t| t.status.is_terminal()),
            tasks: tasks
                .into_iter()
                .map(|t| BatchTaskSummary {
                    task_id: t.id,
                    status: t.status,
                    priority: t.priority,
                    created_at: t.created_at,
                    completed_at: t.completed_at,
                })
                .collect(),
        })
    }

    /// Cancel every non-terminal task of the batch.
    pub async fn cancel_batch(
        &self,
        batch_id: &str,
        who: &str,
        reason: &str,
    ) -> Result<BatchCancellation> {
        let mut outcome = BatchCancellation::default();
        for task in self.batch_tasks(batch_id).await? {
            if self.cancel(&task.id, who, reason).await? {
                outcome.cancelled.push(task.id);
            } else {
                outcome.skipped.push(task.id);
            }
        }
        info!(
            batch_id = %batch_id,
            cancelled = outcome.cancelled.len(),
            skipped = outcome.skipped.len(),
            "batch cancelled"
        );
        Ok(outcome)
    }

    async fn batch_tasks(&self, batch_id: &str) -> Result<Vec<Task>> {
        let filter = TaskFilter {
            batch_id: Some(batch_id.to_string()),
            ..TaskFilter::default()
        };
        let tasks = self.store().list_tasks(&filter).await?;
        if tasks.is_empty() {
            return Err(CoreError::not_found("batch", batch_id));
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_id_shape() {
        let id = new_batch_id();
        assert!(id.starts_with("batch_"));
        assert_eq!(id.len(), "batch_".len() + 16);
        assert_ne!(id, new_batch_id());
    }
}
