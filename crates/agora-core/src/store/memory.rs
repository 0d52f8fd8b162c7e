/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! In-process store. Same compare-and-swap contract as Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CappedWrite, StoreError, TaskFilter, TaskStore};
use crate::model::{
    Agent, ChainStatus, ScheduleStatus, ScheduledTask, Task, TaskChain, TrustRecord,
};

#[derive(Default)]
struct Tables {
    tasks: HashMap<String, Task>,
    agents: HashMap<String, Agent>,
    trust_records: Vec<TrustRecord>,
    chains: HashMap<String, TaskChain>,
    schedules: HashMap<String, ScheduledTask>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Insert `row` under `id` unless the key exists.
fn insert_new<T: Clone>(
    map: &mut HashMap<String, T>,
    kind: &'static str,
    id: &str,
    row: &T,
) -> Result<(), StoreError> {
    if map.contains_key(id) {
        return Err(StoreError::Duplicate {
            kind,
            id: id.to_string(),
        });
    }
    map.insert(id.to_string(), row.clone());
    Ok(())
}

trait Versioned: Clone {
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);
}

macro_rules! versioned {
    ($($ty:ty),+) => {
        $(impl Versioned for $ty {
            fn version(&self) -> i64 {
                self.version
            }
            fn set_version(&mut self, version: i64) {
                self.version = version;
            }
        })+
    };
}

versioned!(Task, Agent, TaskChain, ScheduledTask);

/// Compare-and-swap on `version`.
fn cas<T: Versioned>(map: &mut HashMap<String, T>, id: &str, row: &T) -> bool {
    let Some(stored) = map.get_mut(id) else {
        return false;
    };
    if stored.version() != row.version() {
        return false;
    }
    let mut incoming = row.clone();
    incoming.set_version(row.version() + 1);
    *stored = incoming;
    true
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        insert_new(&mut self.tables.write().tasks, "task", &task.id, task)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tables.read().tasks.get(id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<bool, StoreError> {
        Ok(cas(&mut self.tables.write().tasks, &task.id, task))
    }

    async fn update_task_within_cap(
        &self,
        task: &Task,
        agent_id: &str,
        cap: usize,
    ) -> Result<CappedWrite, StoreError> {
        let mut tables = self.tables.write();
        let held = tables
            .tasks
            .values()
            .filter(|t| {
                t.id != task.id
                    && t.status.is_in_flight()
                    && t.assigned_agent_id.as_deref() == Some(agent_id)
            })
            .count();
        if held >= cap {
            return Ok(CappedWrite::AtCapacity);
        }
        Ok(if cas(&mut tables.tasks, &task.id, task) {
            CappedWrite::Written
        } else {
            CappedWrite::Lost
        })
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let tables = self.tables.read();
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn insert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        insert_new(&mut self.tables.write().agents, "agent", &agent.agent_id, agent)
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self.tables.read().agents.get(agent_id).cloned())
    }

    async fn update_agent(&self, agent: &Agent) -> Result<bool, StoreError> {
        Ok(cas(&mut self.tables.write().agents, &agent.agent_id, agent))
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let mut agents: Vec<Agent> = self.tables.read().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    async fn apply_trust(&self, agent: &Agent, record: &TrustRecord) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        if !cas(&mut tables.agents, &agent.agent_id, agent) {
            return Ok(false);
        }
        tables.trust_records.push(record.clone());
        Ok(true)
    }

    async fn trust_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<TrustRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .trust_records
            .iter()
            .rev()
            .filter(|r| r.agent_id == agent_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_chain(&self, chain: &TaskChain) -> Result<(), StoreError> {
        insert_new(&mut self.tables.write().chains, "chain", &chain.chain_id, chain)
    }

    async fn get_chain(&self, chain_id: &str) -> Result<Option<TaskChain>, StoreError> {
        Ok(self.tables.read().chains.get(chain_id).cloned())
    }

    async fn update_chain(&self, chain: &TaskChain) -> Result<bool, StoreError> {
        Ok(cas(&mut self.tables.write().chains, &chain.chain_id, chain))
    }

    async fn list_chains(&self, status: Option<ChainStatus>) -> Result<Vec<TaskChain>, StoreError> {
        let mut chains: Vec<TaskChain> = self
            .tables
            .read()
            .chains
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        chains.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.chain_id.cmp(&b.chain_id))
        });
        Ok(chains)
    }

    async fn insert_schedule(&self, schedule: &ScheduledTask) -> Result<(), StoreError> {
        insert_new(
            &mut self.tables.write().schedules,
            "schedule",
            &schedule.schedule_id,
            schedule,
        )
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduledTask>, StoreError> {
        Ok(self.tables.read().schedules.get(schedule_id).cloned())
    }

    async fn update_schedule(&self, schedule: &ScheduledTask) -> Result<bool, StoreError> {
        Ok(cas(&mut self.tables.write().schedules, &schedule.schedule_id, schedule))
    }

    async fn list_schedules(
        &self,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        let mut schedules: Vec<ScheduledTask> = self
            .tables
            .read()
            .schedules
            .values()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .cloned()
            .collect();
        schedules.sort_by(|a, b| {
            a.next_run_at
                .cmp(&b.next_run_at)
                .then_with(|| a.schedule_id.cmp(&b.schedule_id))
        });
        Ok(schedules)
    }

    async fn delete_schedule(&self, schedule_id: &str) -> Result<bool, StoreError> {
        Ok(self.tables.write().schedules.remove(schedule_id).is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{RetryPolicy, TaskSpec, TaskStatus, TrustEvent};
    use crate::error::CoreError;
    use crate::store::{modify_task, modify_task_for_agent};
    use chrono::Utc;

    fn task(id: &str) -> Task {
        Task::from_spec(
            id.into(),
            &TaskSpec::new("c", "ocr"),
            Utc::now(),
            60,
            3,
            RetryPolicy::Exponential,
        )
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        store.insert_task(&task("t1")).await.unwrap();
        let err = store.insert_task(&task("t1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { kind: "task", .. }));
    }

    #[tokio::test]
    async fn test_stale_version_loses() {
        let store = MemoryStore::new();
        let t = task("t1");
        store.insert_task(&t).await.unwrap();

        let mut first = store.get_task("t1").await.unwrap().unwrap();
        let mut second = first.clone();
        first.priority = 9;
        second.priority = 2;
        assert!(store.update_task(&first).await.unwrap());
        assert!(!store.update_task(&second).await.unwrap());

        let stored = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(stored.priority, 9);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_modify_task_aborts_on_invalid_transition() {
        let store = MemoryStore::new();
        store.insert_task(&task("t1")).await.unwrap();
        let now = Utc::now();
        let claimed = modify_task(&store, "t1", |t| t.assign("a", now)).await.unwrap();
        assert_eq!(claimed.version, 1);
        assert_eq!(claimed.status, TaskStatus::Assigned);

        let lost = modify_task(&store, "t1", |t| t.assign("b", now)).await;
        assert!(lost.unwrap_err().is_conflict());
        let stored = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(stored.assigned_agent_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_capped_write_refuses_saturated_agent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..2 {
            let mut busy = task(&format!("busy{i}"));
            busy.assign("a", now).unwrap();
            store.insert_task(&busy).await.unwrap();
        }
        store.insert_task(&task("t1")).await.unwrap();

        let err = modify_task_for_agent(&store, "t1", "a", 2, |t| t.assign("a", now))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AgentSaturated(ref id) if id == "a"));
        let stored = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);

        // the task itself never counts against its holder
        let claimed = modify_task_for_agent(&store, "t1", "a", 3, |t| t.assign("a", now))
            .await
            .unwrap();
        assert_eq!(claimed.status, TaskStatus::Assigned);
        let again = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(
            store.update_task_within_cap(&again, "a", 3).await.unwrap(),
            CappedWrite::Written
        );
    }

    #[tokio::test]
    async fn test_apply_trust_is_atomic() {
        let store = MemoryStore::new();
        let agent = Agent::new("a", vec!["ocr".into()], 0.5, Utc::now());
        store.insert_agent(&agent).await.unwrap();
        let record = TrustRecord {
            id: "r1".into(),
            agent_id: "a".into(),
            event_type: TrustEvent::Manual,
            delta: 0.1,
            score_before: 0.5,
            score_after: 0.6,
            task_id: None,
            reason: "test".into(),
            created_at: Utc::now(),
        };
        let mut updated = agent.clone();
        updated.trust_score = 0.6;
        assert!(store.apply_trust(&updated, &record).await.unwrap());
        // stale version: neither the agent nor the record is written
        assert!(!store.apply_trust(&updated, &record).await.unwrap());
        assert_eq!(store.trust_history("a", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_tasks_ordering_and_limit() {
        let store = MemoryStore::new();
        let mut a = task("a");
        let mut b = task("b");
        b.created_at = a.created_at - chrono::Duration::seconds(5);
        a.priority = 9;
        store.insert_task(&a).await.unwrap();
        store.insert_task(&b).await.unwrap();
        let all = store.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(all[0].id, "b");
        let limited = store
            .list_tasks(&TaskFilter {
                limit: Some(1),
                ..TaskFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
