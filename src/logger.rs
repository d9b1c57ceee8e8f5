use std::{path::PathBuf, sync::OnceLock};

use anyhow::Result;
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource, logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use crate::config::ConfigManagerType;

pub const SERVICE_NAME: &str = "chatflow";
/// Rolling text log file name inside the log directory.
pub const LOG_FILE: &str = "chatflow.log";
/// Rolling JSON file with one line per `target = "dispatch"` event.
pub const DISPATCH_LOG_FILE: &str = "dispatch.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `chatflow=debug,reqwest=warn`.
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    /// OTLP/HTTP collector base url, e.g. `http://localhost:4318`.
    pub otel_endpoint: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            otel_endpoint: None,
        }
    }
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>, otel_endpoint: Option<String>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
            otel_endpoint,
        }
    }

    /// `CHATFLOW_LOG_LEVEL`, `CHATFLOW_LOG_DIR` and `OTEL_EXPORTER_OTLP_ENDPOINT`.
    pub async fn from_manager(config: &dyn ConfigManagerType) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Self {
            log_level: non_empty(config.get("CHATFLOW_LOG_LEVEL").await).unwrap_or_else(|| "info".into()),
            log_dir: non_empty(config.get("CHATFLOW_LOG_DIR").await).map(PathBuf::from),
            otel_endpoint: non_empty(config.get("OTEL_EXPORTER_OTLP_ENDPOINT").await),
        }
    }
}

/// Keeps exporters alive; call [`Telemetry::shutdown`] to flush them.
#[derive(Default)]
pub struct Telemetry {
    otel: Option<OtelProviders>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").field("otel", &self.otel.is_some()).finish()
    }
}

struct OtelProviders {
    logs: SdkLoggerProvider,
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
}

impl Telemetry {
    pub fn exports_otel(&self) -> bool {
        self.otel.is_some()
    }

    pub fn shutdown(self) {
        let Some(otel) = self.otel else {
            return;
        };
        if let Err(e) = otel.traces.shutdown() {
            warn!(error = %e, "trace exporter shutdown failed");
        }
        if let Err(e) = otel.metrics.shutdown() {
            warn!(error = %e, "metric exporter shutdown failed");
        }
        if let Err(e) = otel.logs.shutdown() {
            warn!(error = %e, "log exporter shutdown failed");
        }
    }
}

/// Install the global subscriber.
///
/// With an OTLP endpoint, events are bridged to OpenTelemetry logs and the
/// global tracer and meter providers export over OTLP/HTTP. Otherwise, with a
/// log directory, events go to a daily rolling text log plus a JSON file of
/// dispatch events. With neither, events are printed to stdout.
pub fn init_tracing(config: &LogConfig) -> Result<Telemetry> {
    if let Some(endpoint) = config.otel_endpoint.as_deref() {
        return init_otel(&config.log_level, endpoint);
    }
    if let Some(dir) = config.log_dir.as_deref() {
        std::fs::create_dir_all(dir)?;
        let text = fmt::layer()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE))
            .with_ansi(false)
            .with_filter(EnvFilter::try_new(&config.log_level)?);
        let events = fmt::layer()
            .json()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, DISPATCH_LOG_FILE))
            .with_target(true)
            .with_filter(EnvFilter::try_new("dispatch=debug")?);
        Registry::default().with(text).with(events).try_init()?;
        info!(dir = %dir.display(), "file logging initialised");
        return Ok(Telemetry::default());
    }

    Registry::default()
        .with(fmt::layer().with_filter(EnvFilter::try_new(&config.log_level)?))
        .try_init()?;
    Ok(Telemetry::default())
}

fn init_otel(log_level: &str, endpoint: &str) -> Result<Telemetry> {
    let base = endpoint.trim_end_matches('/');

    let logs = SdkLoggerProvider::builder()
        .with_batch_exporter(
            LogExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(format!("{base}/v1/logs"))
                .build()?,
        )
        .with_resource(resource())
        .build();
    let traces = SdkTracerProvider::builder()
        .with_batch_exporter(
            SpanExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(format!("{base}/v1/traces"))
                .build()?,
        )
        .with_resource(resource())
        .build();
    let metrics = SdkMeterProvider::builder()
        .with_periodic_exporter(
            MetricExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(format!("{base}/v1/metrics"))
                .build()?,
        )
        .with_resource(resource())
        .build();

    // exporter traffic must not feed back into the exporter
    let bridge_filter = EnvFilter::try_new(log_level)?
        .add_directive("hyper=off".parse()?)
        .add_directive("tonic=off".parse()?)
        .add_directive("h2=off".parse()?)
        .add_directive("reqwest=off".parse()?);
    let bridge = OpenTelemetryTracingBridge::new(&logs).with_filter(bridge_filter);
    let stdout = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::try_new(log_level)?);
    Registry::default().with(bridge).with(stdout).try_init()?;

    global::set_tracer_provider(traces.clone());
    global::set_meter_provider(metrics.clone());
    info!(endpoint = base, "OpenTelemetry export enabled");

    Ok(Telemetry {
        otel: Some(OtelProviders { logs, traces, metrics }),
    })
}

fn resource() -> Resource {
    static RESOURCE: OnceLock<Resource> = OnceLock::new();
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfigManager;

    #[tokio::test]
    async fn test_log_config_from_manager() {
        let mgr = MapConfigManager::new()
            .with("CHATFLOW_LOG_LEVEL", "debug")
            .with("CHATFLOW_LOG_DIR", "/tmp/chatflow-logs")
            .with("OTEL_EXPORTER_OTLP_ENDPOINT", "");
        let config = LogConfig::from_manager(&mgr).await;
        assert_eq!(
            config,
            LogConfig::new("debug", Some(PathBuf::from("/tmp/chatflow-logs")), None)
        );
        assert_eq!(LogConfig::from_manager(&MapConfigManager::new()).await, LogConfig::default());
    }

    #[test]
    fn test_invalid_filter_is_an_error() {
        let config = LogConfig::new("chatflow=[", None, None);
        assert!(init_tracing(&config).is_err());
    }
}
