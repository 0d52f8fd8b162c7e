/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Postgres store. Schema: `migrations/0001_agora.sql`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

use super::{CappedWrite, StoreError, TaskFilter, TaskStore};
use crate::model::{
    Agent, ChainStatus, ScheduleStatus, ScheduledTask, Task, TaskChain, TrustRecord,
};

const TASK_COLUMNS: &str = "id, client_id, capability_required, priority, status, \
    assigned_agent_id, input, result, error, created_at, assigned_at, started_at, \
    completed_at, timeout_seconds, retry_count, max_retries, retry_policy, next_retry_at, \
    depends_on, chain_id, schedule_id, batch_id, cancelled_at, cancelled_by, \
    cancellation_reason, boosted_at, version";

const AGENT_COLUMNS: &str = "agent_id, capabilities, trust_score, total_completed, \
    total_failed, avg_completion_time_seconds, last_task_completed_at, status, \
    last_heartbeat, registered_at, version";

const TRUST_COLUMNS: &str =
    "id, agent_id, event_type, delta, score_before, score_after, task_id, reason, created_at";

const CHAIN_COLUMNS: &str = "chain_id, client_id, task_ids, dependencies, status, \
    step_results, error, created_at, completed_at, version";

const SCHEDULE_COLUMNS: &str = "schedule_id, name, cron_expression, template, next_run_at, \
    last_run_at, total_runs, failed_runs, status, created_at, version";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from config. The password is read from the environment
    /// variable named by `password_env`.
    pub async fn connect(config: &agora_config::PostgresConfig) -> Result<Self, StoreError> {
        let password = std::env::var(&config.password_env).unwrap_or_default();
        let url = format!(
            "postgres://{}:{}@{}:{}/{}",
            config.user, password, config.host, config.port, config.database,
        );
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&url)
            .await?;
        info!(host = %config.host, database = %config.database, "postgres pool connected");
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn corrupt(field: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{field}: {detail}"))
}

fn parse_text<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e| corrupt(column, e))
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let priority: i16 = row.try_get("priority")?;
    let timeout: i64 = row.try_get("timeout_seconds")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let max_retries: i32 = row.try_get("max_retries")?;
    Ok(Task {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        capability_required: row.try_get("capability_required")?,
        priority: u8::try_from(priority).map_err(|e| corrupt("priority", e))?,
        status: parse_text(row, "status")?,
        assigned_agent_id: row.try_get("assigned_agent_id")?,
        input: row.try_get("input")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        assigned_at: row.try_get("assigned_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        timeout_seconds: u64::try_from(timeout).map_err(|e| corrupt("timeout_seconds", e))?,
        retry_count: u32::try_from(retry_count).map_err(|e| corrupt("retry_count", e))?,
        max_retries: u32::try_from(max_retries).map_err(|e| corrupt("max_retries", e))?,
        retry_policy: parse_text(row, "retry_policy")?,
        next_retry_at: row.try_get("next_retry_at")?,
        depends_on: row.try_get("depends_on")?,
        chain_id: row.try_get("chain_id")?,
        schedule_id: row.try_get("schedule_id")?,
        batch_id: row.try_get("batch_id")?,
        cancelled_at: row.try_get("cancelled_at")?,
        cancelled_by: row.try_get("cancelled_by")?,
        cancellation_reason: row.try_get("cancellation_reason")?,
        boosted_at: row.try_get("boosted_at")?,
        version: row.try_get("version")?,
    })
}

fn agent_from_row(row: &PgRow) -> Result<Agent, StoreError> {
    let capabilities: Vec<String> = row.try_get("capabilities")?;
    Ok(Agent {
        agent_id: row.try_get("agent_id")?,
        capabilities: capabilities.into_iter().collect(),
        trust_score: row.try_get("trust_score")?,
        total_completed: row.try_get("total_completed")?,
        total_failed: row.try_get("total_failed")?,
        avg_completion_time_seconds: row.try_get("avg_completion_time_seconds")?,
        last_task_completed_at: row.try_get("last_task_completed_at")?,
        status: parse_text(row, "status")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        registered_at: row.try_get("registered_at")?,
        version: row.try_get("version")?,
    })
}

fn trust_from_row(row: &PgRow) -> Result<TrustRecord, StoreError> {
    Ok(TrustRecord {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        event_type: parse_text(row, "event_type")?,
        delta: row.try_get("delta")?,
        score_before: row.try_get("score_before")?,
        score_after: row.try_get("score_after")?,
        task_id: row.try_get("task_id")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn chain_from_row(row: &PgRow) -> Result<TaskChain, StoreError> {
    let dependencies: serde_json::Value = row.try_get("dependencies")?;
    let step_results: serde_json::Value = row.try_get("step_results")?;
    Ok(TaskChain {
        chain_id: row.try_get("chain_id")?,
        client_id: row.try_get("client_id")?,
        task_ids: row.try_get("task_ids")?,
        dependencies: serde_json::from_value::<BTreeMap<String, Vec<String>>>(dependencies)?,
        status: parse_text(row, "status")?,
        step_results: serde_json::from_value(step_results)?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        version: row.try_get("version")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<ScheduledTask, StoreError> {
    let template: serde_json::Value = row.try_get("template")?;
    Ok(ScheduledTask {
        schedule_id: row.try_get("schedule_id")?,
        name: row.try_get("name")?,
        cron_expression: row.try_get("cron_expression")?,
        template: serde_json::from_value(template)?,
        next_run_at: row.try_get("next_run_at")?,
        last_run_at: row.try_get("last_run_at")?,
        total_runs: row.try_get("total_runs")?,
        failed_runs: row.try_get("failed_runs")?,
        status: parse_text(row, "status")?,
        created_at: row.try_get("created_at")?,
        version: row.try_get("version")?,
    })
}

/// Map a unique-key violation onto `Duplicate`.
fn on_insert(kind: &'static str, id: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate {
            kind,
            id: id.to_string(),
        },
        _ => StoreError::Database(err),
    }
}

fn as_i64(value: u64, field: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|e| corrupt(field, e))
}

fn as_i32(value: u32, field: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|e| corrupt(field, e))
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

#[async_trait]
impl TaskStore for PgStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, \
              $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)"
        ))
        .bind(&task.id)
        .bind(&task.client_id)
        .bind(&task.capability_required)
        .bind(i16::from(task.priority))
        .bind(task.status.as_str())
        .bind(&task.assigned_agent_id)
        .bind(&task.input)
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.created_at)
        .bind(task.assigned_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(as_i64(task.timeout_seconds, "timeout_seconds")?)
        .bind(as_i32(task.retry_count, "retry_count")?)
        .bind(as_i32(task.max_retries, "max_retries")?)
        .bind(task.retry_policy.as_str())
        .bind(task.next_retry_at)
        .bind(&task.depends_on)
        .bind(&task.chain_id)
        .bind(&task.schedule_id)
        .bind(&task.batch_id)
        .bind(task.cancelled_at)
        .bind(&task.cancelled_by)
        .bind(&task.cancellation_reason)
        .bind(task.boosted_at)
        .bind(task.version)
        .execute(&self.pool)
        .await
        .map_err(|e| on_insert("task", &task.id, e))?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn update_task(&self, task: &Task) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        update_task_on(&mut conn, task).await
    }

    async fn update_task_within_cap(
        &self,
        task: &Task,
        agent_id: &str,
        cap: usize,
    ) -> Result<CappedWrite, StoreError> {
        let mut tx = self.pool.begin().await?;
        // serialises admissions per agent until commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        let held: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks
             WHERE assigned_agent_id = $1 AND status IN ('ASSIGNED', 'ACTIVE') AND id <> $2",
        )
        .bind(agent_id)
        .bind(&task.id)
        .fetch_one(&mut *tx)
        .await?;
        if held >= i64::try_from(cap).unwrap_or(i64::MAX) {
            tx.rollback().await?;
            return Ok(CappedWrite::AtCapacity);
        }
        if !update_task_on(&mut tx, task).await? {
            tx.rollback().await?;
            return Ok(CappedWrite::Lost);
        }
        tx.commit().await?;
        Ok(CappedWrite::Written)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE TRUE"));
        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter.statuses.iter().map(ToString::to_string).collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(capability) = &filter.capability {
            qb.push(" AND capability_required = ").push_bind(capability.clone());
        }
        if let Some(agent_id) = &filter.assigned_agent_id {
            qb.push(" AND assigned_agent_id = ").push_bind(agent_id.clone());
        }
        if let Some(chain_id) = &filter.chain_id {
            qb.push(" AND chain_id = ").push_bind(chain_id.clone());
        }
        if let Some(schedule_id) = &filter.schedule_id {
            qb.push(" AND schedule_id = ").push_bind(schedule_id.clone());
        }
        if let Some(batch_id) = &filter.batch_id {
            qb.push(" AND batch_id = ").push_bind(batch_id.clone());
        }
        if let Some(dep) = &filter.depends_on {
            qb.push(" AND ").push_bind(dep.clone()).push(" = ANY(depends_on)");
        }
        qb.push(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn insert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let capabilities: Vec<String> = agent.capabilities.iter().cloned().collect();
        sqlx::query(&format!(
            "INSERT INTO agents ({AGENT_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(&agent.agent_id)
        .bind(capabilities)
        .bind(agent.trust_score)
        .bind(agent.total_completed)
        .bind(agent.total_failed)
        .bind(agent.avg_completion_time_seconds)
        .bind(agent.last_task_completed_at)
        .bind(agent.status.as_str())
        .bind(agent.last_heartbeat)
        .bind(agent.registered_at)
        .bind(agent.version)
        .execute(&self.pool)
        .await
        .map_err(|e| on_insert("agent", &agent.agent_id, e))?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = $1"
        ))
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn update_agent(&self, agent: &Agent) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        update_agent_on(&mut conn, agent).await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents ORDER BY agent_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn apply_trust(&self, agent: &Agent, record: &TrustRecord) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !update_agent_on(&mut tx, agent).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query(&format!(
            "INSERT INTO trust_records ({TRUST_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(&record.id)
        .bind(&record.agent_id)
        .bind(record.event_type.as_str())
        .bind(record.delta)
        .bind(record.score_before)
        .bind(record.score_after)
        .bind(&record.task_id)
        .bind(&record.reason)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn trust_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<TrustRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRUST_COLUMNS} FROM trust_records WHERE agent_id = $1 \
             ORDER BY seq DESC LIMIT $2"
        ))
        .bind(agent_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trust_from_row).collect()
    }

    async fn insert_chain(&self, chain: &TaskChain) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO task_chains ({CHAIN_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(&chain.chain_id)
        .bind(&chain.client_id)
        .bind(&chain.task_ids)
        .bind(serde_json::to_value(&chain.dependencies)?)
        .bind(chain.status.as_str())
        .bind(serde_json::to_value(&chain.step_results)?)
        .bind(&chain.error)
        .bind(chain.created_at)
        .bind(chain.completed_at)
        .bind(chain.version)
        .execute(&self.pool)
        .await
        .map_err(|e| on_insert("chain", &chain.chain_id, e))?;
        Ok(())
    }

    async fn get_chain(&self, chain_id: &str) -> Result<Option<TaskChain>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CHAIN_COLUMNS} FROM task_chains WHERE chain_id = $1"
        ))
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(chain_from_row).transpose()
    }

    async fn update_chain(&self, chain: &TaskChain) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE task_chains SET
                status = $3, step_results = $4, error = $5, completed_at = $6,
                version = version + 1
             WHERE chain_id = $1 AND version = $2",
        )
        .bind(&chain.chain_id)
        .bind(chain.version)
        .bind(chain.status.as_str())
        .bind(serde_json::to_value(&chain.step_results)?)
        .bind(&chain.error)
        .bind(chain.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_chains(&self, status: Option<ChainStatus>) -> Result<Vec<TaskChain>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHAIN_COLUMNS} FROM task_chains \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at ASC, chain_id ASC"
        ))
        .bind(status.map(ChainStatus::as_str))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chain_from_row).collect()
    }

    async fn insert_schedule(&self, schedule: &ScheduledTask) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO scheduled_tasks ({SCHEDULE_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(&schedule.schedule_id)
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(serde_json::to_value(&schedule.template)?)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.total_runs)
        .bind(schedule.failed_runs)
        .bind(schedule.status.as_str())
        .bind(schedule.created_at)
        .bind(schedule.version)
        .execute(&self.pool)
        .await
        .map_err(|e| on_insert("schedule", &schedule.schedule_id, e))?;
        Ok(())
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduledTask>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks WHERE schedule_id = $1"
        ))
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn update_schedule(&self, schedule: &ScheduledTask) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scheduled_tasks SET
                name = $3, cron_expression = $4, template = $5, next_run_at = $6,
                last_run_at = $7, total_runs = $8, failed_runs = $9, status = $10,
                version = version + 1
             WHERE schedule_id = $1 AND version = $2",
        )
        .bind(&schedule.schedule_id)
        .bind(schedule.version)
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(serde_json::to_value(&schedule.template)?)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.total_runs)
        .bind(schedule.failed_runs)
        .bind(schedule.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_schedules(
        &self,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY next_run_at ASC, schedule_id ASC"
        ))
        .bind(status.map(ScheduleStatus::as_str))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn delete_schedule(&self, schedule_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE schedule_id = $1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

async fn update_task_on(conn: &mut sqlx::PgConnection, task: &Task) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "UPDATE tasks SET
            priority = $3, status = $4, assigned_agent_id = $5, result = $6, error = $7,
            assigned_at = $8, started_at = $9, completed_at = $10, timeout_seconds = $11,
            retry_count = $12, max_retries = $13, next_retry_at = $14,
            cancelled_at = $15, cancelled_by = $16, cancellation_reason = $17,
            boosted_at = $18, version = version + 1
         WHERE id = $1 AND version = $2",
    )
    .bind(&task.id)
    .bind(task.version)
    .bind(i16::from(task.priority))
    .bind(task.status.as_str())
    .bind(&task.assigned_agent_id)
    .bind(&task.result)
    .bind(&task.error)
    .bind(task.assigned_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(as_i64(task.timeout_seconds, "timeout_seconds")?)
    .bind(as_i32(task.retry_count, "retry_count")?)
    .bind(as_i32(task.max_retries, "max_retries")?)
    .bind(task.next_retry_at)
    .bind(task.cancelled_at)
    .bind(&task.cancelled_by)
    .bind(&task.cancellation_reason)
    .bind(task.boosted_at)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn update_agent_on(
    conn: &mut sqlx::PgConnection,
    agent: &Agent,
) -> Result<bool, StoreError> {
    let capabilities: Vec<String> = agent.capabilities.iter().cloned().collect();
    let result = sqlx::query(
        "UPDATE agents SET
            capabilities = $3, trust_score = $4, total_completed = $5, total_failed = $6,
            avg_completion_time_seconds = $7, last_task_completed_at = $8, status = $9,
            last_heartbeat = $10, version = version + 1
         WHERE agent_id = $1 AND version = $2",
    )
    .bind(&agent.agent_id)
    .bind(agent.version)
    .bind(capabilities)
    .bind(agent.trust_score)
    .bind(agent.total_completed)
    .bind(agent.total_failed)
    .bind(agent.avg_completion_time_seconds)
    .bind(agent.last_task_completed_at)
    .bind(agent.status.as_str())
    .bind(agent.last_heartbeat)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
