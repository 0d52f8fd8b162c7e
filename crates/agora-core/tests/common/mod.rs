/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use agora_config::Config;
use agora_core::{
    AgentTransport, ChainEngine, Clock, CronScheduler, DispatchPayload, FairScheduler,
    ManualClock, MemoryStore, Router, SelectionStrategy, TaskStore,
};
use agora_runtime::DispatchError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

pub type Reply = Result<Value, DispatchError>;

/// In-process agents. Each agent answers from its script, then from its
/// fallback; agents with neither succeed.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallbacks: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<(String, String)>>,
    delay: Mutex<Option<Duration>>,
    in_flight: Mutex<HashMap<String, usize>>,
    peaks: Mutex<HashMap<String, usize>>,
}

impl ScriptedTransport {
    /// Every delivery takes `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Most deliveries one agent was working on at the same time.
    pub fn peak(&self, agent: &str) -> usize {
        self.peaks.lock().get(agent).copied().unwrap_or(0)
    }

    pub fn script(&self, agent: &str, replies: Vec<Reply>) {
        self.scripts.lock().insert(agent.into(), replies.into());
    }

    pub fn always(&self, agent: &str, reply: Reply) {
        self.fallbacks.lock().insert(agent.into(), reply);
    }

    pub fn always_fail(&self, agent: &str, error: &str) {
        self.always(agent, Err(DispatchError::Failed(error.into())));
    }

    /// `(agent_id, task_id)` in delivery order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, agent: &str) -> usize {
        self.calls.lock().iter().filter(|(a, _)| a == agent).count()
    }

    pub fn delivered(&self, task_id: &str) -> bool {
        self.calls.lock().iter().any(|(_, t)| t == task_id)
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn deliver(&self, agent_id: &str, payload: &DispatchPayload) -> Reply {
        self.calls
            .lock()
            .push((agent_id.to_string(), payload.task_id.clone()));
        {
            let mut in_flight = self.in_flight.lock();
            let now = in_flight.entry(agent_id.to_string()).or_default();
            *now += 1;
            let mut peaks = self.peaks.lock();
            let peak = peaks.entry(agent_id.to_string()).or_default();
            *peak = (*peak).max(*now);
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(n) = self.in_flight.lock().get_mut(agent_id) {
            *n -= 1;
        }
        if let Some(reply) = self
            .scripts
            .lock()
            .get_mut(agent_id)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.fallbacks
            .lock()
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| Ok(json!({"agent": agent_id, "task": payload.task_id})))
    }
}

pub struct StrictOnly;

impl SelectionStrategy for StrictOnly {
    fn prefer_strict(&self) -> bool {
        true
    }
}

pub struct Harness {
    pub router: Arc<Router>,
    pub chains: Arc<ChainEngine>,
    pub cron: Arc<CronScheduler>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<ScriptedTransport>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config(""))
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(epoch()));
        let transport = Arc::new(ScriptedTransport::default());
        let router = Router::new(
            store.clone() as Arc<dyn TaskStore>,
            clock.clone() as Arc<dyn Clock>,
            transport.clone() as Arc<dyn AgentTransport>,
            &config,
        )
        .with_scheduler(FairScheduler::new(config.queue.clone(), Box::new(StrictOnly)));
        let router = Arc::new(router);
        Self {
            chains: Arc::new(ChainEngine::new(Arc::clone(&router))),
            cron: Arc::new(CronScheduler::new(Arc::clone(&router))),
            router,
            store,
            clock,
            transport,
        }
    }

    pub async fn agent(&self, id: &str, capabilities: &[&str]) {
        let caps: Vec<String> = capabilities.iter().map(|c| (*c).to_string()).collect();
        self.router.register_agent(id, &caps).await.unwrap();
    }

    /// One routing tick, waiting for every dispatch it started.
    pub async fn route(&self) -> usize {
        join(self.router.route_pending().await.unwrap()).await
    }

    pub async fn route_retries(&self) -> usize {
        join(self.router.route_due_retries().await.unwrap()).await
    }
}

pub async fn join(handles: Vec<JoinHandle<()>>) -> usize {
    let n = handles.len();
    for h in handles {
        h.await.unwrap();
    }
    n
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 2, 0).unwrap()
}

/// Minimal config plus `extra` TOML sections.
pub fn config(extra: &str) -> Config {
    let base = r#"
        [agora]
        env = "test"
        version = "0.1.0"

        [postgres]
        host = "localhost"
        port = 5432
        database = "agora"
        user = "agora"
        password_env = "AGORA_PG_PASSWORD"

        [nats]
        url = "nats://localhost:4222"
        subject_prefix = "agora"
    "#;
    toml::from_str(&format!("{base}\n{extra}")).unwrap()
}
