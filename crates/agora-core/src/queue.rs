/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Weighted fair selection over pending tasks, plus age-based boosting.

use std::collections::HashMap;

use agora_config::QueueConfig;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::model::{Task, TaskStatus};

/// Decides, per pick, whether to use strict priority order or the fair
/// (oldest low/medium task) order.
pub trait SelectionStrategy: Send + Sync {
    fn prefer_strict(&self) -> bool;
}

/// Coin flip with a configurable bias, seedable for reproducible runs.
pub struct RandomStrategy {
    strict_probability: f64,
    rng: Mutex<fastrand::Rng>,
}

impl RandomStrategy {
    #[must_use]
    pub fn new(strict_probability: f64) -> Self {
        Self {
            strict_probability,
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    #[must_use]
    pub fn seeded(strict_probability: f64, seed: u64) -> Self {
        Self {
            strict_probability,
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl SelectionStrategy for RandomStrategy {
    fn prefer_strict(&self) -> bool {
        self.rng.lock().f64() < self.strict_probability
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub total_pending: usize,
    /// priority >= 8
    pub high: usize,
    /// priority 5..=7
    pub medium: usize,
    /// priority < 5
    pub low: usize,
    pub by_priority: HashMap<u8, usize>,
    pub by_capability: HashMap<String, usize>,
    /// In-flight (ASSIGNED + ACTIVE) tasks per agent.
    pub agent_workload: HashMap<String, usize>,
}

pub struct FairScheduler {
    cfg: QueueConfig,
    strategy: Box<dyn SelectionStrategy>,
}

fn strict_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

fn age_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

impl FairScheduler {
    #[must_use]
    pub fn new(cfg: QueueConfig, strategy: Box<dyn SelectionStrategy>) -> Self {
        Self { cfg, strategy }
    }

    #[must_use]
    pub fn from_config(cfg: QueueConfig) -> Self {
        let strategy = RandomStrategy::new(cfg.strict_priority_probability);
        Self::new(cfg, Box::new(strategy))
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    /// Index of the next task to hand out from `candidates`, which must all
    /// be ready to run.
    ///
    /// Strict picks take the highest priority, oldest first. Fair picks take
    /// the oldest task at or below the fair ceiling, falling back to strict
    /// when there is none.
    #[must_use]
    pub fn select(&self, candidates: &[Task]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let strict = || {
            candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| strict_order(a, b))
                .map(|(i, _)| i)
        };
        if self.strategy.prefer_strict() {
            return strict();
        }
        candidates
            .iter()
            .enumerate()
            .filter(|(_, t)| t.priority <= self.cfg.fair_priority_ceiling)
            .min_by(|(_, a), (_, b)| age_order(a, b))
            .map(|(i, _)| i)
            .or_else(strict)
    }

    /// Apply the age boost to one task. Returns whether it changed.
    ///
    /// A task is boosted at most once per aging window: after a boost it
    /// must wait another full window before it can be boosted again.
    pub fn boost(&self, task: &mut Task, now: DateTime<Utc>) -> bool {
        let window = Duration::hours(self.cfg.age_boost_after_hours);
        let aged = now - task.created_at > window;
        let window_open = task.boosted_at.map_or(true, |at| now - at >= window);
        if task.status != TaskStatus::Pending
            || !aged
            || !window_open
            || task.priority >= self.cfg.age_boost_below_priority
            || task.priority >= self.cfg.age_boost_cap
        {
            return false;
        }
        task.priority = task
            .priority
            .saturating_add(self.cfg.age_boost_amount)
            .min(self.cfg.age_boost_cap);
        task.boosted_at = Some(now);
        true
    }

    /// Depth and workload figures. `tasks` may contain any statuses.
    #[must_use]
    pub fn stats(tasks: &[Task]) -> QueueStats {
        let mut stats = QueueStats::default();
        for task in tasks {
            if task.status.is_in_flight() {
                if let Some(agent) = &task.assigned_agent_id {
                    *stats.agent_workload.entry(agent.clone()).or_default() += 1;
                }
                continue;
            }
            if task.status != TaskStatus::Pending {
                continue;
            }
            stats.total_pending += 1;
            match task.priority {
                8.. => stats.high += 1,
                5..=7 => stats.medium += 1,
                _ => stats.low += 1,
            }
            *stats.by_priority.entry(task.priority).or_default() += 1;
            *stats
                .by_capability
                .entry(task.capability_required.clone())
                .or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{RetryPolicy, TaskSpec};

    struct Always(bool);

    impl SelectionStrategy for Always {
        fn prefer_strict(&self) -> bool {
            self.0
        }
    }

    fn task(id: &str, priority: u8, created: DateTime<Utc>) -> Task {
        Task::from_spec(
            id.into(),
            &TaskSpec::new("c", "ocr").with_priority(priority),
            created,
            60,
            3,
            RetryPolicy::Exponential,
        )
    }

    fn sample(now: DateTime<Utc>) -> Vec<Task> {
        [3u8, 8, 5, 10, 1]
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let offset = i64::try_from(i).unwrap();
                task(&format!("t{i}"), *p, now - Duration::minutes(10 - offset))
            })
            .collect()
    }

    #[test]
    fn test_strict_pick() {
        let sched = FairScheduler::new(QueueConfig::default(), Box::new(Always(true)));
        let tasks = sample(Utc::now());
        assert_eq!(tasks[sched.select(&tasks).unwrap()].priority, 10);
    }

    #[test]
    fn test_fair_pick_takes_oldest_under_ceiling() {
        let sched = FairScheduler::new(QueueConfig::default(), Box::new(Always(false)));
        let tasks = sample(Utc::now());
        // t0 (priority 3) is the oldest
        assert_eq!(tasks[sched.select(&tasks).unwrap()].id, "t0");
    }

    #[test]
    fn test_fair_pick_falls_back_to_strict() {
        let sched = FairScheduler::new(QueueConfig::default(), Box::new(Always(false)));
        let now = Utc::now();
        let tasks = vec![task("a", 9, now), task("b", 10, now)];
        assert_eq!(tasks[sched.select(&tasks).unwrap()].id, "b");
        assert!(sched.select(&[]).is_none());
    }

    #[test]
    fn test_strict_ties_break_by_age() {
        let sched = FairScheduler::new(QueueConfig::default(), Box::new(Always(true)));
        let now = Utc::now();
        let tasks = vec![task("new", 8, now), task("old", 8, now - Duration::seconds(5))];
        assert_eq!(tasks[sched.select(&tasks).unwrap()].id, "old");
    }

    #[test]
    fn test_seeded_strategy_is_reproducible() {
        let a = RandomStrategy::seeded(0.7, 42);
        let b = RandomStrategy::seeded(0.7, 42);
        let left: Vec<bool> = (0..50).map(|_| a.prefer_strict()).collect();
        let right: Vec<bool> = (0..50).map(|_| b.prefer_strict()).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn test_seeded_mix_matches_strict_probability() {
        let sched = FairScheduler::new(
            QueueConfig::default(),
            Box::new(RandomStrategy::seeded(0.7, 7)),
        );
        let tasks = sample(Utc::now());
        let picks = 1000;
        let mut by_id: HashMap<&str, usize> = HashMap::new();
        for _ in 0..picks {
            *by_id.entry(tasks[sched.select(&tasks).unwrap()].id.as_str()).or_default() += 1;
        }

        // strict picks land on t3 (priority 10), fair picks on t0 (oldest, priority 3)
        let strict = by_id.get("t3").copied().unwrap_or(0);
        let fair = by_id.get("t0").copied().unwrap_or(0);
        assert_eq!(strict + fair, picks);
        #[allow(clippy::cast_precision_loss)]
        let share = strict as f64 / picks as f64;
        assert!((share - 0.7).abs() < 0.05, "strict share {share}");
        assert!(fair > 0, "low priority work must be picked");
    }

    #[test]
    fn test_boost_is_one_shot_per_window() {
        let sched = FairScheduler::from_config(QueueConfig::default());
        let now = Utc::now();
        let mut t = task("t", 3, now - Duration::hours(25));
        assert!(sched.boost(&mut t, now));
        assert_eq!(t.priority, 5);
        assert!(!sched.boost(&mut t, now));
        assert!(!sched.boost(&mut t, now + Duration::hours(23)));
        assert_eq!(t.priority, 5);

        // next window
        assert!(sched.boost(&mut t, now + Duration::hours(24)));
        assert_eq!(t.priority, 7);
        // at the threshold, no further boosts
        assert!(!sched.boost(&mut t, now + Duration::hours(72)));
    }

    #[test]
    fn test_boost_skips_young_and_high_priority() {
        let sched = FairScheduler::from_config(QueueConfig::default());
        let now = Utc::now();
        let mut young = task("y", 3, now - Duration::hours(2));
        assert!(!sched.boost(&mut young, now));
        let mut high = task("h", 7, now - Duration::hours(48));
        assert!(!sched.boost(&mut high, now));
    }

    #[test]
    fn test_boost_caps_priority() {
        let cfg = QueueConfig {
            age_boost_below_priority: 10,
            ..QueueConfig::default()
        };
        let sched = FairScheduler::from_config(cfg);
        let now = Utc::now();
        let mut t = task("t", 8, now - Duration::hours(30));
        assert!(sched.boost(&mut t, now));
        assert_eq!(t.priority, 9);
        assert!(!sched.boost(&mut t, now + Duration::hours(48)));
    }

    #[test]
    fn test_stats_buckets() {
        let now = Utc::now();
        let mut tasks = sample(now);
        tasks[0].assign("a", now).unwrap();
        let stats = FairScheduler::stats(&tasks);
        assert_eq!(stats.total_pending, 4);
        assert_eq!(stats.high, 2);
        assert_eq!(stats.medium, 1);
        assert_eq!(stats.low, 1);
        assert_eq!(stats.agent_workload.get("a"), Some(&1));
        assert_eq!(stats.by_capability.get("ocr"), Some(&4));
    }
}
