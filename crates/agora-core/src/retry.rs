/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Failure classification and retry backoff.

use agora_config::RetryConfig;
use chrono::{DateTime, Duration, Utc};

use crate::model::{RetryPolicy, Task};

/// Error fragments that mark a failure as permanent (case-insensitive).
pub const NON_RETRYABLE_PATTERNS: [&str; 6] = [
    "invalid input",
    "authentication failed",
    "permission denied",
    "not found",
    "bad request",
    "validation error",
];

/// Upper bound on any computed delay (one year).
const MAX_DELAY_SECS: i64 = 365 * 24 * 3600;

#[must_use]
pub fn is_retryable(error: &str) -> bool {
    let lower = error.to_lowercase();
    !NON_RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        next_retry_at: DateTime<Utc>,
        delay_secs: u64,
    },
    /// The error itself rules out a retry.
    Permanent,
    /// Retry budget used up.
    Exhausted,
}

pub struct RetryManager {
    cfg: RetryConfig,
}

impl RetryManager {
    #[must_use]
    pub fn new(cfg: RetryConfig) -> Self {
        Self { cfg }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.cfg
    }

    /// Policy for tasks submitted without one. Unknown names fall back to
    /// exponential.
    #[must_use]
    pub fn default_policy(&self) -> RetryPolicy {
        self.cfg.default_policy.parse().unwrap_or_default()
    }

    /// Delay before retry attempt `n` (0-indexed).
    #[must_use]
    pub fn backoff_secs(&self, policy: RetryPolicy, n: u32) -> u64 {
        match policy {
            RetryPolicy::Exponential => 2u64
                .checked_pow(n)
                .unwrap_or(u64::MAX)
                .min(self.cfg.exponential_cap_secs),
            RetryPolicy::Linear => (u64::from(n) + 1).saturating_mul(self.cfg.linear_step_secs),
            RetryPolicy::Fixed => self.cfg.fixed_delay_secs,
        }
    }

    /// Whether `task` may run again after failing with `error`.
    #[must_use]
    pub fn evaluate(&self, task: &Task, error: &str, now: DateTime<Utc>) -> RetryDecision {
        if !is_retryable(error) {
            return RetryDecision::Permanent;
        }
        if task.retry_count >= task.max_retries {
            return RetryDecision::Exhausted;
        }
        let delay_secs = self.backoff_secs(task.retry_policy, task.retry_count);
        let secs = i64::try_from(delay_secs)
            .unwrap_or(i64::MAX)
            .min(MAX_DELAY_SECS);
        let delay = Duration::seconds(secs);
        RetryDecision::Retry {
            next_retry_at: now + delay,
            delay_secs,
        }
    }
}
