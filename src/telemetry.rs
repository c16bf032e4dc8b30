//! OpenTelemetry trace export
//!
//! Spans from `tracing` are exported over OTLP/gRPC to the collector named by
//! `OTEL_EXPORTER_OTLP_ENDPOINT`.

use opentelemetry::trace::TraceError;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

const SERVICE_NAME: &str = "moduleops-controller";

/// Build the OTLP pipeline and return a layer for the given subscriber
pub fn init_telemetry<S>(_subscriber: &S) -> Result<OpenTelemetryLayer<S, Tracer>, TraceError>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let mut exporter = opentelemetry_otlp::new_exporter().tonic();
    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        exporter = exporter.with_endpoint(endpoint);
    }

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(trace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flush buffered spans
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
