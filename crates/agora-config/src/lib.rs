/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub agora: AgoraConfig,
    pub postgres: PostgresConfig,
    pub nats: NatsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct AgoraConfig {
    pub env: String,
    pub version: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    /// Name of the environment variable holding the password.
    pub password_env: String,
    #[serde(default = "default_pg_min")]
    pub min_connections: u32,
    #[serde(default = "default_pg_max")]
    pub max_connections: u32,
}

fn default_pg_min() -> u32 {
    5
}
fn default_pg_max() -> u32 {
    20
}

#[derive(Deserialize, Clone, Debug)]
pub struct NatsConfig {
    pub url: String,
    pub subject_prefix: String,
    #[serde(default)]
    pub cluster_urls: Vec<String>,
    #[serde(default = "default_nats_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_nats_request_timeout() -> u64 {
    300
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// JSON log lines when true, human-readable otherwise.
    #[serde(default = "default_json_logs")]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            sample_rate: default_sample_rate(),
            json_logs: default_json_logs(),
        }
    }
}

fn default_json_logs() -> bool {
    true
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Dispatch workers
// ---------------------------------------------------------------------------

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DispatchConfig {
    pub routing_interval_secs: u64,
    pub timeout_check_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub cron_interval_secs: u64,
    pub chain_interval_secs: u64,
    pub boost_interval_secs: u64,
    pub stale_agent_check_secs: u64,
    /// Upper bound on tasks examined per worker tick.
    pub batch_limit: usize,
    /// Hard cap on ASSIGNED + ACTIVE tasks per agent.
    pub max_concurrent_per_agent: usize,
    /// Used when a submission does not carry its own timeout.
    pub default_timeout_secs: u64,
    pub min_trust_score: f64,
    pub stale_agent_after_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            routing_interval_secs: 5,
            timeout_check_interval_secs: 30,
            retry_interval_secs: 10,
            cron_interval_secs: 30,
            chain_interval_secs: 5,
            boost_interval_secs: 300,
            stale_agent_check_secs: 60,
            batch_limit: 50,
            max_concurrent_per_agent: 5,
            default_timeout_secs: 300,
            min_trust_score: 0.0,
            stale_agent_after_secs: 300,
            shutdown_grace_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Fair queue
// ---------------------------------------------------------------------------

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct QueueConfig {
    /// Probability of a strict `(priority desc, created_at asc)` pick.
    pub strict_priority_probability: f64,
    /// Highest priority eligible for the fair (oldest-first) pick.
    pub fair_priority_ceiling: u8,
    pub age_boost_after_hours: i64,
    /// Only tasks strictly below this priority are boosted.
    pub age_boost_below_priority: u8,
    pub age_boost_amount: u8,
    pub age_boost_cap: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            strict_priority_probability: 0.7,
            fair_priority_ceiling: 7,
            age_boost_after_hours: 24,
            age_boost_below_priority: 7,
            age_boost_amount: 2,
            age_boost_cap: 9,
        }
    }
}

// ---------------------------------------------------------------------------
// Trust model
// ---------------------------------------------------------------------------

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TrustConfig {
    pub base: f64,
    pub success_weight: f64,
    pub volume_weight: f64,
    pub volume_cap: f64,
    pub speed_weight: f64,
    pub speed_cap: f64,
    pub speed_baseline_secs: f64,
    pub failure_weight: f64,
    pub inactivity_grace_days: i64,
    pub inactivity_per_day: f64,
    pub never_completed_penalty: f64,
    pub completion_delta: f64,
    pub early_completion_bonus: f64,
    /// Fraction of the timeout budget under which a completion counts as early.
    pub early_completion_fraction: f64,
    pub failure_delta: f64,
    pub initial_score: f64,
    /// Weight of the newest sample in the completion-time moving average.
    pub completion_time_ema_weight: f64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            base: 0.5,
            success_weight: 0.3,
            volume_weight: 0.05,
            volume_cap: 0.1,
            speed_weight: 0.2,
            speed_cap: 0.1,
            speed_baseline_secs: 300.0,
            failure_weight: 0.5,
            inactivity_grace_days: 30,
            inactivity_per_day: 0.01,
            never_completed_penalty: 0.1,
            completion_delta: 0.02,
            early_completion_bonus: 0.03,
            early_completion_fraction: 0.5,
            failure_delta: -0.05,
            initial_score: 0.5,
            completion_time_ema_weight: 0.3,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry, circuit breaking, failover
// ---------------------------------------------------------------------------

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RetryConfig {
    pub default_max_retries: u32,
    /// One of `exponential`, `linear`, `fixed`.
    pub default_policy: String,
    pub exponential_cap_secs: u64,
    pub linear_step_secs: u64,
    pub fixed_delay_secs: u64,
    pub at_risk_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_policy: "exponential".to_string(),
            exponential_cap_secs: 60,
            linear_step_secs: 5,
            fixed_delay_secs: 10,
            at_risk_fraction: 0.1,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub half_open_max_calls: u32,
    pub initial_backoff_secs: f64,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_max_calls: 3,
            initial_backoff_secs: 1.0,
            backoff_multiplier: 1.5,
            max_backoff_secs: 60.0,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct FailoverConfig {
    pub max_attempts: u32,
    pub routing_log_capacity: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            routing_log_capacity: 1000,
        }
    }
}

impl Config {
    /// Load configuration from the file named by the `AGORA_CONFIG` env var,
    /// with `AGORA_<SECTION>__<KEY>` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `config::ConfigError` if the config file is missing, malformed,
    /// or required fields are absent.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("AGORA_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&config_path))
            .add_source(
                config::Environment::with_prefix("AGORA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}
