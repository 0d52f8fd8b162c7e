/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Trust-aware task dispatch and resilience engine.
//!
//! Clients submit tasks that require a capability; agents advertise
//! capabilities and are ranked by trust. The [`Router`] ties together the
//! fair scheduler, the trust model, the failover dispatcher and the
//! retry/timeout manager. Chains and cron schedules feed new PENDING tasks
//! into the same pipeline.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod batch;
pub mod chain;
pub mod clock;
pub mod cron;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod queue;
pub mod retry;
pub mod router;
pub mod store;
pub mod timeouts;
pub mod transport;
pub mod trust;
pub mod workers;

pub use batch::{BatchCancellation, BatchItemError, BatchReceipt, BatchStatus, BatchTaskSummary};
pub use chain::{ChainEngine, ChainStep};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::{CronScheduler, ScheduleExecution};
pub use error::{CoreError, Result};
pub use model::{
    Agent, AgentStatus, ChainStatus, RetryPolicy, ScheduleStatus, ScheduledTask, Task, TaskChain,
    TaskSpec, TaskStatus, TrustEvent, TrustRecord,
};
pub use queue::{FairScheduler, QueueStats, RandomStrategy, SelectionStrategy};
pub use retry::{RetryDecision, RetryManager};
pub use router::{Outcome, Router};
pub use store::{
    memory::MemoryStore, postgres::PgStore, CappedWrite, StoreError, TaskFilter, TaskStore,
};
pub use timeouts::{AtRiskTask, TimeoutManager};
pub use transport::{AgentTransport, DispatchPayload, NatsTransport};
pub use trust::{LeaderboardEntry, TrustLevel, TrustModel};
pub use workers::{spawn_workers, WorkerHandles};
