use anyhow::Result;
use opentelemetry::{trace::TracerProvider, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, WithExportConfig};
use opentelemetry_sdk::{
    logs::{BatchLogProcessor, LoggerProvider},
    propagation::TraceContextPropagator,
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt};
use tracing_subscriber::{EnvFilter, Layer};

use super::{LogFormat, TelemetryConfig, TelemetryProviders};

/// Initialize telemetry with OpenTelemetry support
///
/// When OTEL is enabled:
/// - Sets up OTLP exporters for traces and logs
/// - Bridges tracing spans and events to OpenTelemetry
/// - Configures W3C Trace Context propagation so consumer spans join the
///   publisher's trace
///
/// When OTEL is disabled only the stdout layer is installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<Option<TelemetryProviders>> {
    let env_filter = env_filter(&config.log_level);

    if config.otel_enabled {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        let resource = Resource::new(vec![KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            config.service_name.clone(),
        )]);

        let tracer_provider = build_tracer_provider(&config.otel_endpoint, resource.clone())?;
        let logger_provider = build_logger_provider(&config.otel_endpoint, resource)?;

        let tracer = tracer_provider.tracer(config.service_name.clone());
        let otel_trace_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        let otel_log_layer = OpenTelemetryTracingBridge::new(&logger_provider);

        // The trace layer must come before the log bridge so events can see the OTel context
        tracing_subscriber::registry()
            .with(env_filter)
            .with(otel_trace_layer)
            .with(otel_log_layer)
            .with(fmt_layer(config.log_format))
            .try_init()?;

        Ok(Some(TelemetryProviders {
            tracer_provider,
            logger_provider,
        }))
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer(config.log_format))
            .try_init()?;

        Ok(None)
    }
}

/// `RUST_LOG` wins over the configured level
fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_span_list(true)
            .with_current_span(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    }
}

fn build_tracer_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build())
}

fn build_logger_provider(endpoint: &str, resource: Resource) -> Result<LoggerProvider> {
    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let processor = BatchLogProcessor::builder(exporter, runtime::Tokio).build();

    Ok(LoggerProvider::builder()
        .with_log_processor(processor)
        .with_resource(resource)
        .build())
}

/// Shutdown telemetry and flush any pending traces and logs
pub fn shutdown_telemetry(providers: Option<TelemetryProviders>) {
    if let Some(providers) = providers {
        if let Err(e) = providers.tracer_provider.shutdown() {
            eprintln!("Error shutting down tracer provider: {:?}", e);
        }
        if let Err(e) = providers.logger_provider.shutdown() {
            eprintln!("Error shutting down logger provider: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "sms-service");
        assert_eq!(config.otel_endpoint, "http://localhost:4317");
        assert!(!config.otel_enabled);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("text"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("yaml"), LogFormat::Json);
    }

    #[test]
    fn test_shutdown_without_providers_is_noop() {
        shutdown_telemetry(None);
    }
}
