use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::ExporterBuildError;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::{EnvFilter, Registry};
use url::Url;

use crate::env::{LogLevel, default_filter};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to build OTLP exporter")]
    OtlpExporter(#[from] ExporterBuildError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("HTTP client thread panicked")]
    ThreadPanicked,

    #[error("Failed to set global subscriber")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Keeps the tracer provider alive; pending spans are flushed on drop.
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let _ = self.tracer_provider.force_flush();
    }
}

/// Instrumentation scope for spans emitted by application code, as opposed
/// to the `service.name` resource attribute that identifies the deployment.
const TRACER_NAME: &str = "lunchbox-tracer";

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub endpoint: Url,
    pub api_key: String,
    pub service_name: String,
    pub deployment_environment: String,
}

/// The blocking client starts its own runtime, so it has to be built off
/// any tokio worker thread.
fn build_http_client() -> Result<reqwest::blocking::Client, TelemetryError> {
    std::thread::spawn(|| reqwest::blocking::Client::builder().gzip(true).build())
        .join()
        .map_err(|_| TelemetryError::ThreadPanicked)?
        .map_err(TelemetryError::from)
}

fn build_tracer_provider(config: TelemetryConfig) -> Result<SdkTracerProvider, TelemetryError> {
    let headers = HashMap::from([("authorization".to_string(), config.api_key)]);

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_http_client(build_http_client()?)
        .with_endpoint(config.endpoint.as_str())
        .with_headers(headers)
        .build()?;

    let processor = BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            BatchConfigBuilder::default()
                .with_max_export_batch_size(512)
                .with_max_queue_size(2048)
                .with_scheduled_delay(Duration::from_secs(3))
                .build(),
        )
        .build();

    let resource = Resource::builder()
        .with_service_name(config.service_name)
        .with_attributes(vec![KeyValue::new(
            "deployment.environment",
            config.deployment_environment,
        )])
        .build();

    Ok(SdkTracerProvider::builder()
        .with_span_processor(processor)
        .with_resource(resource)
        .build())
}

fn env_filter(log_level: &LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(log_level).into())
}

/// Installs the global subscriber: compact console output plus span export
/// to the configured OTLP endpoint.
pub fn setup_telemetry(
    config: TelemetryConfig,
    log_level: &LogLevel,
) -> Result<TelemetryGuard, TelemetryError> {
    let tracer_provider = build_tracer_provider(config)?;

    let otel_layer = tracing_opentelemetry::layer()
        .with_tracer(tracer_provider.tracer(TRACER_NAME))
        .with_filter(env_filter(log_level));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(env_filter(log_level));

    tracing::subscriber::set_global_default(Registry::default().with(fmt_layer).with(otel_layer))?;

    Ok(TelemetryGuard { tracer_provider })
}
