/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Periodic background loops. Each runs on its own ticker and stops when
//! the shutdown channel flips to `true`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agora_config::DispatchConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::chain::ChainEngine;
use crate::cron::CronScheduler;
use crate::error::Result;
use crate::router::Router;

pub struct WorkerHandles {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerHandles {
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Wait for every loop to stop, giving up after `grace`.
    pub async fn join(self, grace: Duration) {
        let all = async {
            for (name, handle) in self.handles {
                if let Err(e) = handle.await {
                    warn!(worker = name, error = %e, "worker panicked");
                }
            }
        };
        match tokio::time::timeout(grace, all).await {
            Ok(()) => info!("all background tasks stopped"),
            Err(_) => warn!("shutdown timeout, some tasks may not have stopped cleanly"),
        }
    }
}

fn period(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

/// Run `tick` every `every` until shutdown. A failed tick is logged and the
/// loop carries on.
fn spawn_loop<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(worker = name, period_secs = every.as_secs(), "worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = tick().await {
                        warn!(worker = name, error = %e, "worker tick failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!(worker = name, "shutdown signal, stopping loop");
                    break;
                }
            }
        }
    })
}

/// Start the routing, retry, timeout, cron, chain, boost and liveness loops.
#[must_use]
pub fn spawn_workers(
    router: &Arc<Router>,
    chains: &Arc<ChainEngine>,
    cron: &Arc<CronScheduler>,
    cfg: &DispatchConfig,
    shutdown_rx: &watch::Receiver<bool>,
) -> WorkerHandles {
    let mut handles = Vec::new();

    let r = Arc::clone(router);
    handles.push((
        "routing",
        spawn_loop("routing", period(cfg.routing_interval_secs), shutdown_rx.clone(), move || {
            let r = Arc::clone(&r);
            async move {
                let spawned = r.route_pending().await?;
                debug!(dispatched = spawned.len(), "routing tick");
                Ok(())
            }
        }),
    ));

    let r = Arc::clone(router);
    handles.push((
        "retry",
        spawn_loop("retry", period(cfg.retry_interval_secs), shutdown_rx.clone(), move || {
            let r = Arc::clone(&r);
            async move {
                let spawned = r.route_due_retries().await?;
                debug!(dispatched = spawned.len(), "retry tick");
                Ok(())
            }
        }),
    ));

    let r = Arc::clone(router);
    handles.push((
        "timeouts",
        spawn_loop(
            "timeouts",
            period(cfg.timeout_check_interval_secs),
            shutdown_rx.clone(),
            move || {
                let r = Arc::clone(&r);
                async move {
                    let settled = r.check_timeouts().await?;
                    for risk in r.timeouts().at_risk().await? {
                        warn!(
                            task_id = %risk.task_id,
                            agent_id = ?risk.agent_id,
                            remaining_seconds = risk.remaining_seconds,
                            "task at risk of timing out"
                        );
                    }
                    if !settled.is_empty() {
                        info!(timed_out = settled.len(), "timeout sweep complete");
                    }
                    Ok(())
                }
            },
        ),
    ));

    let c = Arc::clone(cron);
    handles.push((
        "cron",
        spawn_loop("cron", period(cfg.cron_interval_secs), shutdown_rx.clone(), move || {
            let c = Arc::clone(&c);
            async move {
                let created = c.run_due().await?;
                if !created.is_empty() {
                    info!(created = created.len(), "cron tick materialized tasks");
                }
                Ok(())
            }
        }),
    ));

    let e = Arc::clone(chains);
    handles.push((
        "chains",
        spawn_loop("chains", period(cfg.chain_interval_secs), shutdown_rx.clone(), move || {
            let e = Arc::clone(&e);
            async move {
                let started = e.run_pending_chains().await?;
                if !started.is_empty() {
                    info!(chains = started.len(), "chains started");
                }
                Ok(())
            }
        }),
    ));

    let r = Arc::clone(router);
    handles.push((
        "boost",
        spawn_loop("boost", period(cfg.boost_interval_secs), shutdown_rx.clone(), move || {
            let r = Arc::clone(&r);
            async move {
                r.boost_aged_tasks().await?;
                Ok(())
            }
        }),
    ));

    let r = Arc::clone(router);
    handles.push((
        "liveness",
        spawn_loop(
            "liveness",
            period(cfg.stale_agent_check_secs),
            shutdown_rx.clone(),
            move || {
                let r = Arc::clone(&r);
                async move {
                    r.mark_stale_agents().await?;
                    Ok(())
                }
            },
        ),
    ));

    WorkerHandles { handles }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_loop_ticks_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_loop("test", Duration::from_secs(5), rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        // first tick fires immediately, then every 5s
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_does_not_stop_loop() {
        let (tx, rx) = watch::channel(false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_loop("flaky", Duration::from_secs(1), rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::CoreError::Validation("boom".into()))
            }
        });
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_period_floor() {
        assert_eq!(period(0), Duration::from_secs(1));
        assert_eq!(period(30), Duration::from_secs(30));
    }
}
