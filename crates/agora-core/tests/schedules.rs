/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

#![allow(clippy::unwrap_used)]

mod common;

use agora_core::{CoreError, ScheduleStatus, TaskFilter, TaskSpec, TaskStatus};
use agora_runtime::DispatchError;
use chrono::{Duration, TimeZone, Utc};
use common::Harness;

#[tokio::test]
async fn test_due_schedule_materializes_once_without_catch_up() {
    let h = Harness::new();
    // clock starts at 10:02
    let id = h
        .cron
        .create_schedule("report", "*/5 * * * *", TaskSpec::new("c", "report").with_priority(4))
        .await
        .unwrap();
    let schedule = h.cron.get_schedule(&id).await.unwrap();
    assert_eq!(
        schedule.next_run_at,
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 5, 0).unwrap()
    );

    assert!(h.cron.run_due().await.unwrap().is_empty());

    // the service was down for half an hour: one run, not six
    h.clock.advance(Duration::minutes(29));
    let created = h.cron.run_due().await.unwrap();
    assert_eq!(created.len(), 1);
    assert!(h.cron.run_due().await.unwrap().is_empty());

    let schedule = h.cron.get_schedule(&id).await.unwrap();
    assert_eq!(schedule.total_runs, 1);
    assert_eq!(schedule.failed_runs, 0);
    assert_eq!(schedule.last_run_at, Some(h.clock_now()));
    assert_eq!(
        schedule.next_run_at,
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 35, 0).unwrap()
    );

    let task = h.router.get_status(&created[0]).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.priority, 4);
    assert_eq!(task.schedule_id.as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn test_invalid_cron_rejected_at_creation() {
    let h = Harness::new();
    for bad in ["* * * *", "99 * * * *", "every minute", "0 0 * * * *"] {
        assert!(matches!(
            h.cron
                .create_schedule("bad", bad, TaskSpec::new("c", "report"))
                .await,
            Err(CoreError::Validation(_))
        ));
    }
    assert!(h.cron.list_schedules(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pause_resume_update_delete() {
    let h = Harness::new();
    let id = h
        .cron
        .create_schedule("nightly", "0 2 * * *", TaskSpec::new("c", "backup"))
        .await
        .unwrap();

    h.cron.pause(&id).await.unwrap();
    h.clock.advance(Duration::days(3));
    assert!(h.cron.run_due().await.unwrap().is_empty());
    assert_eq!(
        h.cron.list_schedules(Some(ScheduleStatus::Paused)).await.unwrap().len(),
        1
    );

    // resuming does not replay the three missed nights
    let resumed = h.cron.resume(&id).await.unwrap();
    assert_eq!(resumed.status, ScheduleStatus::Active);
    assert_eq!(
        resumed.next_run_at,
        Utc.with_ymd_and_hms(2026, 3, 6, 2, 0, 0).unwrap()
    );
    assert!(h.cron.run_due().await.unwrap().is_empty());

    let updated = h.cron.update_cron(&id, "30 * * * *").await.unwrap();
    assert_eq!(updated.cron_expression, "30 * * * *");
    assert_eq!(
        updated.next_run_at,
        Utc.with_ymd_and_hms(2026, 3, 5, 10, 30, 0).unwrap()
    );
    assert!(h.cron.update_cron(&id, "nope").await.is_err());

    assert!(h.cron.delete_schedule(&id).await.unwrap());
    assert!(!h.cron.delete_schedule(&id).await.unwrap());
    assert!(matches!(
        h.cron.get_schedule(&id).await,
        Err(CoreError::NotFound { .. })
    ));
    assert!(h
        .store_tasks()
        .await
        .is_empty());
}

#[tokio::test]
async fn test_executions_list_runs_newest_first_with_outcomes() {
    let h = Harness::new();
    h.agent("r", &["report"]).await;
    let id = h
        .cron
        .create_schedule("report", "*/5 * * * *", TaskSpec::new("c", "report"))
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(3));
    let first = h.cron.run_due().await.unwrap().remove(0);
    h.route().await;

    h.transport
        .script("r", vec![Err(DispatchError::Failed("Authentication failed".into()))]);
    h.clock.advance(Duration::minutes(5));
    let second = h.cron.run_due().await.unwrap().remove(0);
    h.route().await;

    h.clock.advance(Duration::minutes(5));
    let third = h.cron.run_due().await.unwrap().remove(0);

    let runs = h.cron.executions(&id, 10).await.unwrap();
    let ids: Vec<&str> = runs.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec![third.as_str(), second.as_str(), first.as_str()]);

    assert_eq!(runs[0].status, TaskStatus::Pending);
    assert!(runs[0].completed_at.is_none());
    assert_eq!(runs[1].status, TaskStatus::Failed);
    assert_eq!(runs[1].error.as_deref(), Some("Authentication failed"));
    assert_eq!(runs[2].status, TaskStatus::Completed);
    assert!(runs[2].result.is_some());
    assert_eq!(runs[2].executed_at, Utc.with_ymd_and_hms(2026, 3, 2, 10, 5, 0).unwrap());

    assert_eq!(h.cron.executions(&id, 2).await.unwrap().len(), 2);
    // plain submissions never show up as runs
    h.router.submit(TaskSpec::new("c", "report")).await.unwrap();
    assert_eq!(h.cron.executions(&id, 10).await.unwrap().len(), 3);
    assert!(matches!(
        h.cron.executions("ghost", 10).await,
        Err(CoreError::NotFound { .. })
    ));
}

impl Harness {
    fn clock_now(&self) -> chrono::DateTime<Utc> {
        use agora_core::Clock;
        self.clock.now()
    }

    async fn store_tasks(&self) -> Vec<agora_core::Task> {
        self.router.list_tasks(&TaskFilter::default()).await.unwrap()
    }
}
