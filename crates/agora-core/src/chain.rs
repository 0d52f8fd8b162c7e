/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Dependency chains: a DAG of tasks executed in rounds.
//!
//! Each round runs every PENDING member whose predecessors have all
//! completed, concurrently, and joins on all of them. One failure fails
//! the chain and cancels what is left. A round with nothing runnable and
//! work outstanding marks the chain DEADLOCKED.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{ChainStatus, Task, TaskChain, TaskSpec, TaskStatus};
use crate::router::{Origin, Router};
use crate::store::modify_chain;

const CANCELLED_BY: &str = "chain-engine";

/// One node of a chain. `after` names the keys of its predecessors.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStep {
    pub key: String,
    pub spec: TaskSpec,
    pub after: Vec<String>,
}

impl ChainStep {
    #[must_use]
    pub fn new(key: impl Into<String>, spec: TaskSpec) -> Self {
        Self {
            key: key.into(),
            spec,
            after: Vec::new(),
        }
    }

    #[must_use]
    pub fn after(mut self, keys: &[&str]) -> Self {
        self.after = keys.iter().map(|k| (*k).to_string()).collect();
        self
    }
}

/// Order `steps` so every step follows its predecessors. Rejects unknown
/// references and cycles.
fn topological_order(steps: &[ChainStep]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.key.as_str(), i))
        .collect();
    if index.len() != steps.len() {
        return Err(CoreError::Validation("chain step keys must be unique".into()));
    }
    for step in steps {
        for dep in &step.after {
            if !index.contains_key(dep.as_str()) {
                return Err(CoreError::Validation(format!(
                    "step {} depends on unknown step {dep}",
                    step.key
                )));
            }
        }
    }

    let mut placed = vec![false; steps.len()];
    let mut order = Vec::with_capacity(steps.len());
    while order.len() < steps.len() {
        let next = steps.iter().enumerate().find(|(i, s)| {
            !placed[*i] && s.after.iter().all(|d| placed[index[d.as_str()]])
        });
        let Some((i, _)) = next else {
            return Err(CoreError::Validation("chain dependencies contain a cycle".into()));
        };
        placed[i] = true;
        order.push(i);
    }
    Ok(order)
}

pub struct ChainEngine {
    router: Arc<Router>,
}

impl ChainEngine {
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Validate the DAG, create its member tasks and store a PENDING chain.
    pub async fn create_chain(&self, client_id: &str, steps: Vec<ChainStep>) -> Result<String> {
        if steps.is_empty() {
            return Err(CoreError::Validation("chain must have at least one step".into()));
        }
        for step in &steps {
            step.spec.validate()?;
            if !step.spec.depends_on.is_empty() {
                return Err(CoreError::Validation(format!(
                    "step {} must declare predecessors with `after`",
                    step.key
                )));
            }
        }
        let order = topological_order(&steps)?;

        let chain_id = Uuid::new_v4().to_string();
        let mut task_of: HashMap<&str, String> = HashMap::new();
        let mut task_ids = Vec::with_capacity(steps.len());
        let mut dependencies = BTreeMap::new();
        for i in order {
            let step = &steps[i];
            let preds: Vec<String> = step
                .after
                .iter()
                .filter_map(|k| task_of.get(k.as_str()).cloned())
                .collect();
            let mut spec = step.spec.clone();
            spec.depends_on.clone_from(&preds);
            let task = self.router.submit_with(&spec, Origin::chain(&chain_id)).await?;
            task_of.insert(step.key.as_str(), task.id.clone());
            dependencies.insert(task.id.clone(), preds);
            task_ids.push(task.id);
        }

        let chain = TaskChain {
            chain_id: chain_id.clone(),
            client_id: client_id.to_string(),
            task_ids,
            dependencies,
            status: ChainStatus::Pending,
            step_results: BTreeMap::new(),
            error: None,
            created_at: self.router.clock().now(),
            completed_at: None,
            version: 0,
        };
        self.router.store().insert_chain(&chain).await?;
        info!(chain_id = %chain_id, steps = chain.task_ids.len(), "chain created");
        Ok(chain_id)
    }

    pub async fn get_chain(&self, chain_id: &str) -> Result<TaskChain> {
        self.router
            .store()
            .get_chain(chain_id)
            .await?
            .ok_or_else(|| CoreError::not_found("chain", chain_id))
    }

    pub async fn list_chains(&self, status: Option<ChainStatus>) -> Result<Vec<TaskChain>> {
        Ok(self.router.store().list_chains(status).await?)
    }

    /// Run a PENDING chain to a terminal status.
    ///
    /// Returns the final chain for COMPLETED and FAILED, and
    /// `ChainDeadlock` when no member can make progress.
    pub async fn run_chain(&self, chain_id: &str) -> Result<TaskChain> {
        let store = self.router.store().as_ref();
        let mut chain = modify_chain(store, chain_id, |c| {
            if c.status != ChainStatus::Pending {
                return Err(CoreError::Validation(format!(
                    "chain {} is {}",
                    c.chain_id, c.status
                )));
            }
            c.status = ChainStatus::Running;
            Ok(())
        })
        .await?;
        info!(chain_id = %chain_id, "chain started");

        let mut round = 0u32;
        loop {
            let members = self.members(&chain).await?;
            let completed: HashSet<&str> = members
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .map(|t| t.id.as_str())
                .collect();

            if completed.len() == members.len() {
                return self.finish(chain_id, ChainStatus::Completed, None).await;
            }
            if let Some(dead) = members
                .iter()
                .find(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
            {
                let error = member_error(dead);
                return self.fail(chain_id, &members, error).await;
            }

            let runnable: Vec<&Task> = members
                .iter()
                .filter(|t| match t.status {
                    TaskStatus::Pending => {
                        t.depends_on.iter().all(|d| completed.contains(d.as_str()))
                    }
                    TaskStatus::Assigned | TaskStatus::Active => true,
                    _ => false,
                })
                .collect();

            if runnable.is_empty() {
                let error = format!(
                    "no runnable tasks, {} of {} incomplete",
                    members.len() - completed.len(),
                    members.len()
                );
                warn!(chain_id = %chain_id, error = %error, "chain deadlocked");
                self.cancel_remaining(&members, "chain deadlocked").await;
                self.finish(chain_id, ChainStatus::Deadlocked, Some(error))
                    .await?;
                return Err(CoreError::ChainDeadlock(chain_id.to_string()));
            }

            round += 1;
            debug!(chain_id = %chain_id, round, tasks = runnable.len(), "chain round");
            let outcomes = join_all(runnable.iter().map(|t| self.router.execute_task(&t.id))).await;

            let mut results = Vec::new();
            let mut failure = None;
            for (task, outcome) in runnable.iter().zip(outcomes) {
                match outcome {
                    Ok(done) if done.status == TaskStatus::Completed => {
                        results.push((done.id.clone(), done.result.clone().unwrap_or_default()));
                    }
                    Ok(done) => {
                        failure.get_or_insert_with(|| member_error(&done));
                    }
                    Err(e) => {
                        failure.get_or_insert_with(|| format!("Task {} failed: {e}", task.id));
                    }
                }
            }

            if !results.is_empty() {
                chain = modify_chain(store, chain_id, |c| {
                    for (id, value) in &results {
                        c.step_results.insert(id.clone(), value.clone());
                    }
                    Ok(())
                })
                .await?;
            }

            if let Some(error) = failure {
                let members = self.members(&chain).await?;
                return self.fail(chain_id, &members, error).await;
            }
        }
    }

    /// Spawn a runner for every PENDING chain.
    pub async fn run_pending_chains(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let pending = self.list_chains(Some(ChainStatus::Pending)).await?;
        let mut handles = Vec::with_capacity(pending.len());
        for chain in pending {
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                match engine.run_chain(&chain.chain_id).await {
                    Ok(done) => {
                        info!(chain_id = %done.chain_id, status = %done.status, "chain finished");
                    }
                    Err(CoreError::Validation(reason)) => {
                        debug!(chain_id = %chain.chain_id, reason = %reason, "chain already claimed");
                    }
                    Err(e) => warn!(chain_id = %chain.chain_id, error = %e, "chain run failed"),
                }
            }));
        }
        Ok(handles)
    }

    async fn members(&self, chain: &TaskChain) -> Result<Vec<Task>> {
        let mut members = Vec::with_capacity(chain.task_ids.len());
        for id in &chain.task_ids {
            members.push(self.router.get_status(id).await?);
        }
        Ok(members)
    }

    async fn fail(&self, chain_id: &str, members: &[Task], error: String) -> Result<TaskChain> {
        warn!(chain_id = %chain_id, error = %error, "chain failed");
        self.cancel_remaining(members, "chain failed").await;
        self.finish(chain_id, ChainStatus::Failed, Some(error)).await
    }

    async fn cancel_remaining(&self, members: &[Task], reason: &str) {
        for task in members.iter().filter(|t| !t.status.is_terminal()) {
            if let Err(e) = self.router.cancel(&task.id, CANCELLED_BY, reason).await {
                warn!(task_id = %task.id, error = %e, "failed to cancel chain member");
            }
        }
    }

    async fn finish(
        &self,
        chain_id: &str,
        status: ChainStatus,
        error: Option<String>,
    ) -> Result<TaskChain> {
        let now = self.router.clock().now();
        let chain = modify_chain(self.router.store().as_ref(), chain_id, |c| {
            c.status = status;
            c.error.clone_from(&error);
            c.completed_at = Some(now);
            Ok(())
        })
        .await?;
        if status == ChainStatus::Completed {
            info!(chain_id = %chain_id, "chain completed");
        }
        Ok(chain)
    }
}

fn member_error(task: &Task) -> String {
    match task.status {
        TaskStatus::Cancelled => format!("Task {} was cancelled", task.id),
        _ => format!(
            "Task {} failed: {}",
            task.id,
            task.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn step(key: &str, after: &[&str]) -> ChainStep {
        ChainStep::new(key, TaskSpec::new("c", "ocr")).after(after)
    }

    #[test]
    fn test_topological_order() {
        let steps = vec![step("c", &["b"]), step("a", &[]), step("b", &["a"])];
        let order = topological_order(&steps).unwrap();
        let keys: Vec<&str> = order.iter().map(|i| steps[*i].key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_keeps_input_order() {
        let steps = vec![
            step("root", &[]),
            step("left", &["root"]),
            step("right", &["root"]),
            step("join", &["left", "right"]),
        ];
        assert_eq!(topological_order(&steps).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_rejects_bad_graphs() {
        let cycle = vec![step("a", &["b"]), step("b", &["a"])];
        assert!(matches!(
            topological_order(&cycle),
            Err(CoreError::Validation(_))
        ));
        let unknown = vec![step("a", &["ghost"])];
        assert!(topological_order(&unknown).is_err());
        let dup = vec![step("a", &[]), step("a", &[])];
        assert!(topological_order(&dup).is_err());
        let own = vec![step("a", &["a"])];
        assert!(topological_order(&own).is_err());
    }
}
