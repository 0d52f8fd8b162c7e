/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Shared runtime utilities for Agora services.
//!
//! - [`CircuitBreaker`]: per-agent CLOSED / OPEN / HALF-OPEN failure detector
//! - [`FailoverDispatcher`]: walks a ranked agent list through the breakers
//!   and records every attempt in a bounded routing log
//! - [`shutdown_signal`]: graceful SIGINT/SIGTERM handler
//! - [`connect_nats`]: cluster-aware NATS connection

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod circuit;
pub mod failover;

pub use circuit::{CircuitBreaker, CircuitError, CircuitSettings, CircuitSnapshot, CircuitState};
pub use failover::{
    DispatchError, FailoverDispatcher, FailoverError, FailoverSuccess, HealthSummary,
    RoutingEvent, RoutingStatus,
};

use tracing::{error, info};

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Wait for SIGINT (ctrl-c) or SIGTERM, then return.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .unwrap_or_else(|e| error!(error = %e, "ctrl-c handler failed"));
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// NATS connection (cluster-aware)
// ---------------------------------------------------------------------------

/// Connect to NATS, using cluster URLs if configured.
///
/// # Errors
///
/// Returns `async_nats::ConnectError` if the connection fails.
pub async fn connect_nats(
    config: &agora_config::NatsConfig,
) -> Result<async_nats::Client, async_nats::ConnectError> {
    let client = if config.cluster_urls.is_empty() {
        async_nats::connect(&config.url).await?
    } else {
        let mut addrs: Vec<String> = vec![config.url.clone()];
        addrs.extend(config.cluster_urls.clone());
        async_nats::connect(addrs.as_slice()).await?
    };
    info!(
        url = %config.url,
        cluster_size = config.cluster_urls.len(),
        "nats connected"
    );
    Ok(client)
}
