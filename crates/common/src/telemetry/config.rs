use opentelemetry_sdk::{logs::LoggerProvider, trace::TracerProvider as SdkTracerProvider};

/// Output format of the stdout log layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    /// Parse a configured format name, falling back to JSON for unknown values
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Configuration for telemetry initialization
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otel_endpoint: String,
    pub otel_enabled: bool,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "sms-service".to_string(),
            otel_endpoint: "http://localhost:4317".to_string(),
            otel_enabled: false,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

/// Providers returned from telemetry initialization for proper shutdown
pub struct TelemetryProviders {
    pub tracer_provider: SdkTracerProvider,
    pub logger_provider: LoggerProvider,
}
