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

use agora_config::TelemetryConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{Sampler, TracerProvider};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Errors from telemetry initialization.
#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("opentelemetry setup failed: {0}")]
    Setup(String),
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Flushes and shuts down the OTLP pipeline on drop.
/// Hold it for the lifetime of the process.
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans are being exported over OTLP.
    #[must_use]
    pub fn exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(ref provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("telemetry shutdown error: {e}");
            }
        }
    }
}

/// Map a configured sample rate onto an OTel sampler.
fn sampler_for(rate: f64) -> Sampler {
    if (rate - 1.0).abs() < f64::EPSILON || rate > 1.0 {
        Sampler::AlwaysOn
    } else if rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(rate)
    }
}

fn fmt_layer(json: bool) -> Box<dyn Layer<Registry> + Send + Sync> {
    if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    }
}

/// Initialize the tracing subscriber with optional OpenTelemetry export.
///
/// `RUST_LOG` drives the filter (default `info`). When `config.enabled` is
/// true an OTLP/gRPC span exporter is attached and tagged with the service
/// name and version.
///
/// # Errors
///
/// Returns `TelemetryError` if the OTLP exporter cannot be built or a global
/// subscriber is already installed.
pub fn init_telemetry(
    service_name: &str,
    service_version: &str,
    config: &TelemetryConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if !config.enabled {
        tracing_subscriber::registry()
            .with(fmt_layer(config.json_logs))
            .with(env_filter)
            .try_init()
            .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))?;
        return Ok(TelemetryGuard { provider: None });
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| TelemetryError::Setup(format!("{e:?}")))?;

    let resource = opentelemetry_sdk::Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", service_version.to_string()),
    ]);

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_sampler(sampler_for(config.sample_rate))
        .with_resource(resource)
        .build();

    let tracer = provider.tracer(service_name.to_string());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(fmt_layer(config.json_logs))
        .with(env_filter)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))?;

    Ok(TelemetryGuard {
        provider: Some(provider),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_drop_without_provider() {
        let guard = TelemetryGuard { provider: None };
        assert!(!guard.exporting());
        drop(guard);
    }

    #[test]
    fn test_sampler_selection() {
        assert!(matches!(sampler_for(1.0), Sampler::AlwaysOn));
        assert!(matches!(sampler_for(0.0), Sampler::AlwaysOff));
        assert!(matches!(sampler_for(-2.0), Sampler::AlwaysOff));
        assert!(matches!(sampler_for(0.25), Sampler::TraceIdRatioBased(r) if (r - 0.25).abs() < f64::EPSILON));
    }

    #[test]
    fn test_telemetry_error_display() {
        let err = TelemetryError::Setup("boom".to_string());
        assert_eq!(err.to_string(), "opentelemetry setup failed: boom");
    }

    #[test]
    fn test_config_deserialize_from_toml() {
        let toml_str = r#"
enabled = true
otlp_endpoint = "http://collector:4317"
sample_rate = 0.5
json_logs = false
"#;
        let config: TelemetryConfig = toml::from_str(toml_str).unwrap();
        assert!(config.enabled);
        assert_eq!(config.otlp_endpoint, "http://collector:4317");
        assert!((config.sample_rate - 0.5).abs() < f64::EPSILON);
        assert!(!config.json_logs);
    }

    #[test]
    fn test_config_defaults() {
        let config = TelemetryConfig::default();
        assert!(!config.enabled);
        assert!(config.json_logs);
        assert_eq!(config.otlp_endpoint, "http://localhost:4317");
    }
}
