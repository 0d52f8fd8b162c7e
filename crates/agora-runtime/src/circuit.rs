/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Per-agent circuit breaker.
//!
//! Each agent gets its own circuit, guarded by its own mutex:
//!
//! ```text
//! CLOSED --(failure_count >= threshold)--> OPEN
//! OPEN --(backoff elapsed, next call)--> HALF_OPEN
//! HALF_OPEN --(half_open_max_calls consecutive successes)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN (backoff *= multiplier, capped)
//! ```
//!
//! Calls made while OPEN never reach the agent. They count as rejections,
//! not failures.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Errors surfaced by [`CircuitBreaker::call`].
#[derive(thiserror::Error, Debug)]
pub enum CircuitError<E> {
    #[error("circuit open for agent {0}")]
    Open(String),
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub half_open_max_calls: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self::from(&agora_config::CircuitConfig::default())
    }
}

impl From<&agora_config::CircuitConfig> for CircuitSettings {
    fn from(cfg: &agora_config::CircuitConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            half_open_max_calls: cfg.half_open_max_calls.max(1),
            initial_backoff: Duration::from_secs_f64(cfg.initial_backoff_secs.max(0.0)),
            backoff_multiplier: cfg.backoff_multiplier.max(1.0),
            max_backoff: Duration::from_secs_f64(cfg.max_backoff_secs.max(0.0)),
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// Consecutive failures since the last success.
    failure_count: u32,
    success_count: u64,
    total_rejections: u64,
    opened_at: Option<Instant>,
    /// Consecutive successes while HALF_OPEN.
    half_open_calls: u32,
    half_open_in_flight: u32,
    backoff: Duration,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

impl Circuit {
    fn new(settings: &CircuitSettings) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_rejections: 0,
            opened_at: None,
            half_open_calls: 0,
            half_open_in_flight: 0,
            backoff: settings.initial_backoff,
            last_failure_at: None,
            last_success_at: None,
        }
    }

    fn backoff_elapsed(&self, now: Instant) -> bool {
        self.opened_at
            .is_some_and(|opened| now.saturating_duration_since(opened) >= self.backoff)
    }
}

/// Point-in-time view of one agent's circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub agent_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub total_rejections: u64,
    pub half_open_calls: u32,
    pub backoff_seconds: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Registry of per-agent circuits. Cheap to share behind an `Arc`.
pub struct CircuitBreaker {
    settings: CircuitSettings,
    circuits: DashMap<String, Arc<Mutex<Circuit>>>,
}

/// Decrements the half-open in-flight counter even if the guarded call is
/// dropped mid-flight (e.g. by an outer timeout).
struct TrialGuard {
    circuit: Arc<Mutex<Circuit>>,
}

impl Drop for TrialGuard {
    fn drop(&mut self) {
        let mut c = self.circuit.lock();
        c.half_open_in_flight = c.half_open_in_flight.saturating_sub(1);
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(settings: CircuitSettings) -> Self {
        Self {
            settings,
            circuits: DashMap::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &CircuitSettings {
        &self.settings
    }

    fn circuit(&self, agent_id: &str) -> Arc<Mutex<Circuit>> {
        if let Some(existing) = self.circuits.get(agent_id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.circuits
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Circuit::new(&self.settings))))
                .value(),
        )
    }

    /// Effective state for routing decisions. An OPEN circuit whose backoff
    /// has elapsed reports HALF_OPEN: the next call will be let through.
    #[must_use]
    pub fn state(&self, agent_id: &str) -> CircuitState {
        let Some(entry) = self.circuits.get(agent_id) else {
            return CircuitState::Closed;
        };
        let c = entry.value().lock();
        if c.state == CircuitState::Open && c.backoff_elapsed(Instant::now()) {
            CircuitState::HalfOpen
        } else {
            c.state
        }
    }

    /// Run `call` through `agent_id`'s circuit.
    ///
    /// `call` is only invoked when the circuit admits the request.
    ///
    /// # Errors
    ///
    /// `CircuitError::Open` when the circuit rejects the call, otherwise
    /// `CircuitError::Inner` carrying the call's own error.
    pub async fn call<F, Fut, T, E>(&self, agent_id: &str, call: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let circuit = self.circuit(agent_id);
        let trial = self.admit(agent_id, &circuit)?;
        let _guard = trial.then(|| TrialGuard {
            circuit: Arc::clone(&circuit),
        });

        match call().await {
            Ok(value) => {
                self.on_success(agent_id, &mut circuit.lock());
                Ok(value)
            }
            Err(e) => {
                self.on_failure(agent_id, &mut circuit.lock());
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Decide whether a call may proceed. Returns whether it is a
    /// half-open trial call.
    fn admit<E>(&self, agent_id: &str, circuit: &Mutex<Circuit>) -> Result<bool, CircuitError<E>> {
        let mut c = circuit.lock();
        match c.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                if c.backoff_elapsed(Instant::now()) {
                    c.state = CircuitState::HalfOpen;
                    c.half_open_calls = 0;
                    c.half_open_in_flight = 1;
                    info!(agent_id = %agent_id, "circuit half-open");
                    Ok(true)
                } else {
                    c.total_rejections += 1;
                    Err(CircuitError::Open(agent_id.to_string()))
                }
            }
            CircuitState::HalfOpen => {
                if c.half_open_in_flight >= self.settings.half_open_max_calls {
                    c.total_rejections += 1;
                    return Err(CircuitError::Open(agent_id.to_string()));
                }
                c.half_open_in_flight += 1;
                Ok(true)
            }
        }
    }

    fn on_success(&self, agent_id: &str, c: &mut Circuit) {
        c.success_count += 1;
        c.failure_count = 0;
        c.last_success_at = Some(Utc::now());
        match c.state {
            CircuitState::HalfOpen => {
                c.half_open_calls += 1;
                if c.half_open_calls >= self.settings.half_open_max_calls {
                    self.close(agent_id, c);
                }
            }
            CircuitState::Closed => c.backoff = self.settings.initial_backoff,
            // A stale trial call finished after another one re-opened the circuit.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, agent_id: &str, c: &mut Circuit) {
        c.failure_count += 1;
        c.last_failure_at = Some(Utc::now());
        match c.state {
            CircuitState::HalfOpen => self.open(agent_id, c, true),
            CircuitState::Closed => {
                if c.failure_count >= self.settings.failure_threshold {
                    self.open(agent_id, c, false);
                } else {
                    warn!(
                        agent_id = %agent_id,
                        failures = c.failure_count,
                        threshold = self.settings.failure_threshold,
                        "agent call failed"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, agent_id: &str, c: &mut Circuit, reopen: bool) {
        if reopen {
            let next = c.backoff.mul_f64(self.settings.backoff_multiplier);
            c.backoff = next.min(self.settings.max_backoff);
        }
        c.state = CircuitState::Open;
        c.opened_at = Some(Instant::now());
        c.half_open_calls = 0;
        warn!(
            agent_id = %agent_id,
            failures = c.failure_count,
            backoff_secs = c.backoff.as_secs_f64(),
            reopen,
            "circuit opened"
        );
    }

    fn close(&self, agent_id: &str, c: &mut Circuit) {
        c.state = CircuitState::Closed;
        c.failure_count = 0;
        c.half_open_calls = 0;
        c.opened_at = None;
        c.backoff = self.settings.initial_backoff;
        info!(agent_id = %agent_id, "circuit closed, agent recovered");
    }

    /// Force an agent's circuit back to CLOSED.
    pub fn reset(&self, agent_id: &str) {
        if let Some(entry) = self.circuits.get(agent_id) {
            let mut c = entry.value().lock();
            self.close(agent_id, &mut c);
        }
    }

    #[must_use]
    pub fn snapshot(&self, agent_id: &str) -> CircuitSnapshot {
        let circuit = self.circuit(agent_id);
        let c = circuit.lock();
        CircuitSnapshot {
            agent_id: agent_id.to_string(),
            state: c.state,
            failure_count: c.failure_count,
            success_count: c.success_count,
            total_rejections: c.total_rejections,
            half_open_calls: c.half_open_calls,
            backoff_seconds: c.backoff.as_secs_f64(),
            last_failure_at: c.last_failure_at,
            last_success_at: c.last_success_at,
        }
    }

    /// Snapshots of every known circuit, ordered by agent id.
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut ids: Vec<String> = self.circuits.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.iter().map(|id| self.snapshot(id)).collect()
    }
}
