/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Agent reputation.
//!
//! The score moves by small deltas on every task outcome. Each move is a
//! read-modify-write under a per-agent lock, written together with an
//! immutable [`TrustRecord`] so the full history can be replayed.

use std::collections::HashMap;
use std::sync::Arc;

use agora_config::TrustConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::model::{Agent, AgentStatus, TrustEvent, TrustRecord};
use crate::store::{TaskStore, MAX_CAS_RETRIES};

// ---------------------------------------------------------------------------
// Formula
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Excellent,
    High,
    Medium,
    Low,
    VeryLow,
}

impl TrustLevel {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Self::Excellent
        } else if score >= 0.7 {
            Self::High
        } else if score >= 0.5 {
            Self::Medium
        } else if score >= 0.3 {
            Self::Low
        } else {
            Self::VeryLow
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::VeryLow => "very_low",
        }
    }
}

/// Derive a score from an agent's history alone.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn compute_score(cfg: &TrustConfig, agent: &Agent, now: DateTime<Utc>) -> f64 {
    let completed = agent.total_completed.max(0) as f64;
    let failed = agent.total_failed.max(0) as f64;
    let total = completed + failed;
    let (success_rate, failure_rate) = if total > 0.0 {
        (completed / total, failed / total)
    } else {
        (0.0, 0.0)
    };

    let success_bonus = success_rate * cfg.success_weight;
    let volume_bonus = ((completed + 1.0).log10() * cfg.volume_weight).min(cfg.volume_cap);
    let speed_bonus = match agent.avg_completion_time_seconds {
        Some(avg) if avg > 0.0 => {
            ((cfg.speed_baseline_secs / avg - 0.5).max(0.0) * cfg.speed_weight).min(cfg.speed_cap)
        }
        _ => 0.0,
    };
    let failure_penalty = failure_rate * cfg.failure_weight;
    let inactivity_penalty = match agent.last_task_completed_at {
        Some(last) => {
            let idle_days = (now - last).num_days() - cfg.inactivity_grace_days;
            idle_days.max(0) as f64 * cfg.inactivity_per_day
        }
        None => cfg.never_completed_penalty,
    };

    (cfg.base + success_bonus + volume_bonus + speed_bonus - failure_penalty - inactivity_penalty)
        .clamp(0.0, 1.0)
}

/// How one task ended for the agent that ran it.
#[derive(Debug, Clone, Copy)]
pub struct TaskOutcome {
    pub success: bool,
    pub elapsed_seconds: Option<f64>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub agent_id: String,
    pub trust_score: f64,
    pub trust_level: TrustLevel,
    pub total_completed: i64,
    pub total_failed: i64,
    pub success_rate: f64,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

pub struct TrustModel {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    cfg: TrustConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TrustModel {
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, cfg: TrustConfig) -> Self {
        Self {
            store,
            clock,
            cfg,
            locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TrustConfig {
        &self.cfg
    }

    fn lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Apply one audited change. `change` updates counters on the agent and
    /// returns the delta to add to the current score.
    async fn mutate<F>(
        &self,
        agent_id: &str,
        event: TrustEvent,
        task_id: Option<&str>,
        reason: &str,
        mut change: F,
    ) -> Result<TrustRecord>
    where
        F: FnMut(&mut Agent, DateTime<Utc>) -> f64 + Send,
    {
        let lock = self.lock_for(agent_id);
        let _held = lock.lock().await;

        for attempt in 1..=MAX_CAS_RETRIES {
            let mut agent = self
                .store
                .get_agent(agent_id)
                .await?
                .ok_or_else(|| CoreError::not_found("agent", agent_id))?;
            let now = self.clock.now();
            let before = agent.trust_score.clamp(0.0, 1.0);
            let delta = change(&mut agent, now);
            let after = (before + delta).clamp(0.0, 1.0);
            agent.trust_score = after;

            let record = TrustRecord {
                id: Uuid::new_v4().to_string(),
                agent_id: agent_id.to_string(),
                event_type: event,
                delta,
                score_before: before,
                score_after: after,
                task_id: task_id.map(str::to_string),
                reason: reason.to_string(),
                created_at: now,
            };

            if self.store.apply_trust(&agent, &record).await? {
                debug!(
                    agent_id = %agent_id,
                    event = %event,
                    delta,
                    score_before = before,
                    score_after = after,
                    "trust adjusted"
                );
                return Ok(record);
            }
            debug!(agent_id = %agent_id, attempt, "trust write lost, re-reading");
        }
        Err(CoreError::Contention(format!("agent {agent_id}")))
    }

    /// Manual adjustment by an operator.
    pub async fn adjust(&self, agent_id: &str, delta: f64, reason: &str) -> Result<TrustRecord> {
        if !delta.is_finite() {
            return Err(CoreError::Validation("delta must be finite".into()));
        }
        self.mutate(agent_id, TrustEvent::Manual, None, reason, |_, _| delta)
            .await
    }

    /// Charge or reward an agent for how a task ended.
    pub async fn record_task_outcome(
        &self,
        agent_id: &str,
        task_id: &str,
        outcome: TaskOutcome,
    ) -> Result<TrustRecord> {
        let cfg = &self.cfg;
        if !outcome.success {
            return self
                .mutate(agent_id, TrustEvent::TaskFailed, Some(task_id), "task failed", |a, _| {
                    a.total_failed += 1;
                    cfg.failure_delta
                })
                .await;
        }

        #[allow(clippy::cast_precision_loss)]
        let early = outcome.elapsed_seconds.is_some_and(|elapsed| {
            elapsed < outcome.timeout_seconds as f64 * cfg.early_completion_fraction
        });
        let reason = if early {
            "task completed early"
        } else {
            "task completed"
        };
        self.mutate(
            agent_id,
            TrustEvent::TaskCompleted,
            Some(task_id),
            reason,
            |a, now| {
                a.total_completed += 1;
                a.last_task_completed_at = Some(now);
                if let Some(elapsed) = outcome.elapsed_seconds {
                    let w = cfg.completion_time_ema_weight;
                    a.avg_completion_time_seconds = Some(match a.avg_completion_time_seconds {
                        Some(avg) => avg * (1.0 - w) + elapsed * w,
                        None => elapsed,
                    });
                }
                if early {
                    cfg.completion_delta + cfg.early_completion_bonus
                } else {
                    cfg.completion_delta
                }
            },
        )
        .await
    }

    /// Replace the running score with the formula score.
    pub async fn recalculate(&self, agent_id: &str) -> Result<TrustRecord> {
        let cfg = &self.cfg;
        let record = self
            .mutate(
                agent_id,
                TrustEvent::Recalculated,
                None,
                "recalculated from task history",
                |a, now| compute_score(cfg, a, now) - a.trust_score.clamp(0.0, 1.0),
            )
            .await?;
        info!(
            agent_id = %agent_id,
            score_before = record.score_before,
            score_after = record.score_after,
            "trust score recalculated"
        );
        Ok(record)
    }

    /// Eligible agents for `capability`, best first.
    ///
    /// Eligible means ACTIVE, advertising the capability, at or above
    /// `min_trust`, and below `max_concurrent` in-flight tasks. Order is
    /// trust descending, then load ascending, then agent id.
    pub async fn rank_agents(
        &self,
        capability: &str,
        loads: &HashMap<String, usize>,
        max_concurrent: usize,
        min_trust: f64,
    ) -> Result<Vec<Agent>> {
        let load_of = |id: &str| loads.get(id).copied().unwrap_or(0);
        let mut eligible: Vec<Agent> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| {
                a.status == AgentStatus::Active
                    && a.has_capability(capability)
                    && a.trust_score >= min_trust
                    && load_of(&a.agent_id) < max_concurrent
            })
            .collect();
        eligible.sort_by(|a, b| {
            b.trust_score
                .total_cmp(&a.trust_score)
                .then_with(|| load_of(&a.agent_id).cmp(&load_of(&b.agent_id)))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        Ok(eligible)
    }

    #[allow(clippy::cast_precision_loss)]
    pub async fn leaderboard(
        &self,
        limit: usize,
        min_completed: i64,
    ) -> Result<Vec<LeaderboardEntry>> {
        let mut agents: Vec<Agent> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.total_completed >= min_completed)
            .collect();
        agents.sort_by(|a, b| {
            b.trust_score
                .total_cmp(&a.trust_score)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        Ok(agents
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, a)| {
                let total = a.total_tasks();
                LeaderboardEntry {
                    rank: i + 1,
                    trust_level: TrustLevel::from_score(a.trust_score),
                    success_rate: if total > 0 {
                        a.total_completed as f64 / total as f64
                    } else {
                        0.0
                    },
                    agent_id: a.agent_id,
                    trust_score: a.trust_score,
                    total_completed: a.total_completed,
                    total_failed: a.total_failed,
                }
            })
            .collect())
    }

    pub async fn history(&self, agent_id: &str, limit: usize) -> Result<Vec<TrustRecord>> {
        Ok(self.store.trust_history(agent_id, limit).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryStore;
    use chrono::Duration;

    async fn model_with(ids: &[&str]) -> (TrustModel, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        for id in ids {
            store
                .insert_agent(&Agent::new(*id, vec!["ocr".into()], 0.5, clock.now()))
                .await
                .unwrap();
        }
        let model = TrustModel::new(
            store.clone() as Arc<dyn TaskStore>,
            clock.clone() as Arc<dyn Clock>,
            TrustConfig::default(),
        );
        (model, store, clock)
    }

    fn outcome(success: bool, elapsed: f64) -> TaskOutcome {
        TaskOutcome {
            success,
            elapsed_seconds: Some(elapsed),
            timeout_seconds: 300,
        }
    }

    #[test]
    fn test_formula_new_agent() {
        let cfg = TrustConfig::default();
        let now = Utc::now();
        let agent = Agent::new("a", Vec::<String>::new(), 0.5, now);
        // base 0.5, no history, never completed: -0.1
        assert!((compute_score(&cfg, &agent, now) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_formula_reliable_fast_agent() {
        let cfg = TrustConfig::default();
        let now = Utc::now();
        let mut agent = Agent::new("a", Vec::<String>::new(), 0.5, now);
        agent.total_completed = 99;
        agent.avg_completion_time_seconds = Some(100.0);
        agent.last_task_completed_at = Some(now);
        // 0.5 + 0.3 + min(0.1, 2*0.05) + min(0.1, 2.5*0.2)
        assert!((compute_score(&cfg, &agent, now) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_formula_penalties() {
        let cfg = TrustConfig::default();
        let now = Utc::now();
        let mut agent = Agent::new("a", Vec::<String>::new(), 0.5, now);
        agent.total_completed = 1;
        agent.total_failed = 1;
        agent.last_task_completed_at = Some(now - Duration::days(40));
        let expected = 0.5 + 0.5 * 0.3 + (2f64.log10() * 0.05) - 0.5 * 0.5 - 10.0 * 0.01;
        assert!((compute_score(&cfg, &agent, now) - expected).abs() < 1e-9);

        agent.total_failed = 1000;
        assert!(compute_score(&cfg, &agent, now) >= 0.0);
    }

    #[test]
    fn test_trust_levels() {
        assert_eq!(TrustLevel::from_score(0.95), TrustLevel::Excellent);
        assert_eq!(TrustLevel::from_score(0.7), TrustLevel::High);
        assert_eq!(TrustLevel::from_score(0.5), TrustLevel::Medium);
        assert_eq!(TrustLevel::from_score(0.3), TrustLevel::Low);
        assert_eq!(TrustLevel::from_score(0.29).as_str(), "very_low");
    }

    #[tokio::test]
    async fn test_completion_and_early_bonus() {
        let (model, store, _) = model_with(&["a"]).await;
        let slow = model
            .record_task_outcome("a", "t1", outcome(true, 200.0))
            .await
            .unwrap();
        assert!((slow.delta - 0.02).abs() < 1e-12);
        let fast = model
            .record_task_outcome("a", "t2", outcome(true, 100.0))
            .await
            .unwrap();
        assert!((fast.delta - 0.05).abs() < 1e-12);
        assert_eq!(fast.reason, "task completed early");

        let agent = store.get_agent("a").await.unwrap().unwrap();
        assert_eq!(agent.total_completed, 2);
        // EMA: 200 * 0.7 + 100 * 0.3
        assert!((agent.avg_completion_time_seconds.unwrap() - 170.0).abs() < 1e-9);
        assert!((agent.trust_score - 0.57).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failures_clamp_at_zero() {
        let (model, store, _) = model_with(&["a"]).await;
        for i in 0..30 {
            let rec = model
                .record_task_outcome("a", &format!("t{i}"), outcome(false, 1.0))
                .await
                .unwrap();
            assert!((0.0..=1.0).contains(&rec.score_after));
            assert_eq!(
                rec.score_after,
                (rec.score_before + rec.delta).clamp(0.0, 1.0)
            );
        }
        let agent = store.get_agent("a").await.unwrap().unwrap();
        assert_eq!(agent.trust_score, 0.0);
        assert_eq!(agent.total_failed, 30);
        assert_eq!(model.history("a", 100).await.unwrap().len(), 30);
    }

    #[tokio::test]
    async fn test_concurrent_outcomes_lose_no_updates() {
        let (model, store, _) = model_with(&["a"]).await;
        let model = Arc::new(model);
        let handles: Vec<_> = (0..40)
            .map(|i| {
                let model = Arc::clone(&model);
                tokio::spawn(async move {
                    model
                        .record_task_outcome("a", &format!("t{i}"), outcome(i % 2 == 0, 10.0))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        let agent = store.get_agent("a").await.unwrap().unwrap();
        assert_eq!(agent.total_completed, 20);
        assert_eq!(agent.total_failed, 20);
        assert_eq!(model.history("a", 100).await.unwrap().len(), 40);
    }

    #[tokio::test]
    async fn test_recalculate_audits_change() {
        let (model, store, _) = model_with(&["a"]).await;
        let rec = model.recalculate("a").await.unwrap();
        assert_eq!(rec.event_type, TrustEvent::Recalculated);
        assert!((rec.score_after - 0.4).abs() < 1e-9);
        let agent = store.get_agent("a").await.unwrap().unwrap();
        assert!((agent.trust_score - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let (model, _, _) = model_with(&[]).await;
        let err = model.adjust("ghost", 0.1, "x").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: "agent", .. }));
    }

    #[tokio::test]
    async fn test_rank_agents_ordering() {
        let (model, _, _) = model_with(&["a", "b", "c", "d"]).await;
        model.adjust("c", 0.2, "boost").await.unwrap();
        model.adjust("d", -0.4, "penalty").await.unwrap();
        let mut loads = HashMap::new();
        loads.insert("a".to_string(), 2);
        loads.insert("b".to_string(), 1);

        let ranked = model.rank_agents("ocr", &loads, 5, 0.3).await.unwrap();
        let ids: Vec<&str> = ranked.iter().map(|a| a.agent_id.as_str()).collect();
        // c highest; a and b tie on score, b has less load; d below min trust
        assert_eq!(ids, vec!["c", "b", "a"]);

        loads.insert("c".to_string(), 5);
        let capped = model.rank_agents("ocr", &loads, 5, 0.0).await.unwrap();
        assert!(capped.iter().all(|a| a.agent_id != "c"));
        assert!(model
            .rank_agents("translate", &loads, 5, 0.0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_leaderboard() {
        let (model, _, _) = model_with(&["a", "b"]).await;
        model
            .record_task_outcome("b", "t1", outcome(true, 10.0))
            .await
            .unwrap();
        let board = model.leaderboard(10, 0).await.unwrap();
        assert_eq!(board[0].agent_id, "b");
        assert_eq!(board[0].rank, 1);
        assert!((board[0].success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(model.leaderboard(10, 1).await.unwrap().len(), 1);
    }
}
