/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Recurring task templates driven by 5-field cron expressions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{ScheduleStatus, ScheduledTask, Task, TaskSpec, TaskStatus};
use crate::router::{Origin, Router};
use crate::store::{modify_schedule, TaskFilter};

/// Parse a standard 5-field expression (minute hour day month weekday).
pub fn parse_cron(expression: &str) -> Result<Cron> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(CoreError::Validation(format!(
            "cron expression must have 5 fields, got {fields}: {expression:?}"
        )));
    }
    Cron::new(expression)
        .parse()
        .map_err(|e| CoreError::Validation(format!("invalid cron expression {expression:?}: {e}")))
}

/// First occurrence strictly after `after`.
pub fn next_run(cron: &Cron, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    cron.find_next_occurrence(&after, false)
        .map_err(|e| CoreError::Validation(format!("cron expression never fires: {e}")))
}

/// One materialized run of a schedule and how it ended.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleExecution {
    pub task_id: String,
    pub status: TaskStatus,
    pub executed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl From<Task> for ScheduleExecution {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            executed_at: task.created_at,
            completed_at: task.completed_at,
            result: task.result,
            error: task.error,
        }
    }
}

pub struct CronScheduler {
    router: Arc<Router>,
}

impl CronScheduler {
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub async fn create_schedule(
        &self,
        name: &str,
        cron_expression: &str,
        template: TaskSpec,
    ) -> Result<String> {
        if name.trim().is_empty() {
            return Err(CoreError::Validation("schedule name must not be empty".into()));
        }
        template.validate()?;
        if !template.depends_on.is_empty() {
            return Err(CoreError::Validation(
                "scheduled templates cannot declare dependencies".into(),
            ));
        }
        let now = self.router.clock().now();
        let next_run_at = next_run(&parse_cron(cron_expression)?, now)?;

        let schedule = ScheduledTask {
            schedule_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            cron_expression: cron_expression.to_string(),
            template,
            next_run_at,
            last_run_at: None,
            total_runs: 0,
            failed_runs: 0,
            status: ScheduleStatus::Active,
            created_at: now,
            version: 0,
        };
        self.router.store().insert_schedule(&schedule).await?;
        info!(
            schedule_id = %schedule.schedule_id,
            name = %name,
            cron = %cron_expression,
            next_run_at = %next_run_at,
            "schedule created"
        );
        Ok(schedule.schedule_id)
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<ScheduledTask> {
        self.router
            .store()
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| CoreError::not_found("schedule", schedule_id))
    }

    pub async fn list_schedules(&self, status: Option<ScheduleStatus>) -> Result<Vec<ScheduledTask>> {
        Ok(self.router.store().list_schedules(status).await?)
    }

    /// Runs of `schedule_id`, newest first.
    pub async fn executions(&self, schedule_id: &str, limit: usize) -> Result<Vec<ScheduleExecution>> {
        self.get_schedule(schedule_id).await?;
        let filter = TaskFilter {
            schedule_id: Some(schedule_id.to_string()),
            ..TaskFilter::default()
        };
        let runs = self.router.store().list_tasks(&filter).await?;
        Ok(runs
            .into_iter()
            .rev()
            .take(limit)
            .map(ScheduleExecution::from)
            .collect())
    }

    pub async fn pause(&self, schedule_id: &str) -> Result<ScheduledTask> {
        let schedule = modify_schedule(self.router.store().as_ref(), schedule_id, |s| {
            s.status = ScheduleStatus::Paused;
            Ok(())
        })
        .await?;
        info!(schedule_id = %schedule_id, "schedule paused");
        Ok(schedule)
    }

    /// Reactivate a schedule. The next run is computed from now; missed runs
    /// are not replayed.
    pub async fn resume(&self, schedule_id: &str) -> Result<ScheduledTask> {
        let now = self.router.clock().now();
        let schedule = modify_schedule(self.router.store().as_ref(), schedule_id, |s| {
            s.next_run_at = next_run(&parse_cron(&s.cron_expression)?, now)?;
            s.status = ScheduleStatus::Active;
            Ok(())
        })
        .await?;
        info!(schedule_id = %schedule_id, next_run_at = %schedule.next_run_at, "schedule resumed");
        Ok(schedule)
    }

    pub async fn update_cron(&self, schedule_id: &str, cron_expression: &str) -> Result<ScheduledTask> {
        let cron = parse_cron(cron_expression)?;
        let now = self.router.clock().now();
        let next_run_at = next_run(&cron, now)?;
        let schedule = modify_schedule(self.router.store().as_ref(), schedule_id, |s| {
            s.cron_expression = cron_expression.to_string();
            s.next_run_at = next_run_at;
            Ok(())
        })
        .await?;
        info!(schedule_id = %schedule_id, cron = %cron_expression, "schedule cron updated");
        Ok(schedule)
    }

    pub async fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        let deleted = self.router.store().delete_schedule(schedule_id).await?;
        if deleted {
            info!(schedule_id = %schedule_id, "schedule deleted");
        }
        Ok(deleted)
    }

    /// Materialize one task for every ACTIVE schedule that is due. Returns
    /// the ids of the created tasks.
    pub async fn run_due(&self) -> Result<Vec<String>> {
        let now = self.router.clock().now();
        let store = self.router.store().as_ref();
        let mut created = Vec::new();

        for schedule in self.list_schedules(Some(ScheduleStatus::Active)).await? {
            if schedule.next_run_at > now {
                continue;
            }
            let id = schedule.schedule_id.as_str();
            let due_at = schedule.next_run_at;
            let next = parse_cron(&schedule.cron_expression).and_then(|c| next_run(&c, now));
            let Ok(next_run_at) = next else {
                warn!(schedule_id = %id, cron = %schedule.cron_expression, "schedule cannot fire again, pausing");
                if let Err(e) = self.pause(id).await {
                    warn!(schedule_id = %id, error = %e, "failed to pause schedule");
                }
                continue;
            };

            // Advancing next_run_at is the claim: only one tick wins it.
            let claim = modify_schedule(store, id, |s| {
                if s.status != ScheduleStatus::Active || s.next_run_at != due_at {
                    return Err(CoreError::Contention(format!("schedule {id}")));
                }
                s.next_run_at = next_run_at;
                s.last_run_at = Some(now);
                Ok(())
            })
            .await;
            match claim {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    debug!(schedule_id = %id, "schedule run claimed elsewhere");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let materialized = self
                .router
                .submit_with(&schedule.template, Origin::schedule(id))
                .await;
            let ok = materialized.is_ok();
            match materialized {
                Ok(task) => {
                    info!(schedule_id = %id, task_id = %task.id, next_run_at = %next_run_at, "scheduled task created");
                    created.push(task.id);
                }
                Err(e) => warn!(schedule_id = %id, error = %e, "scheduled task materialization failed"),
            }
            modify_schedule(store, id, |s| {
                if ok {
                    s.total_runs += 1;
                } else {
                    s.failed_runs += 1;
                }
                Ok(())
            })
            .await?;
        }
        Ok(created)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_cron() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 9 * * 1-5").is_ok());
        assert!(matches!(
            parse_cron("* * * *"),
            Err(CoreError::Validation(_))
        ));
        assert!(parse_cron("0 0 * * * *").is_err());
        assert!(parse_cron("61 * * * *").is_err());
        assert!(parse_cron("not a cron at all").is_err());
    }

    #[test]
    fn test_next_run_is_strictly_after() {
        let cron = parse_cron("*/15 * * * *").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap();
        assert_eq!(
            next_run(&cron, at).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).unwrap()
        );
        let between = Utc.with_ymd_and_hms(2026, 3, 1, 10, 16, 30).unwrap();
        assert_eq!(
            next_run(&cron, between).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).unwrap()
        );
    }
}
