use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Stdout log format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,

    // NATS configuration
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Timeout for connecting to NATS at startup
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// NATS JetStream stream carrying SMS notification requests
    #[serde(default = "default_sms_notifications_stream")]
    pub sms_notifications_stream: String,

    /// NATS subject pattern for the consumer filter
    #[serde(default = "default_sms_notifications_subject")]
    pub sms_notifications_subject: String,

    /// Durable consumer name
    #[serde(default = "default_sms_consumer_name")]
    pub sms_consumer_name: String,

    /// NATS JetStream stream receiving dead-lettered notifications
    #[serde(default = "default_sms_dead_letter_stream")]
    pub sms_dead_letter_stream: String,

    /// Subject dead-lettered notifications are published to
    #[serde(default = "default_sms_dead_letter_subject")]
    pub sms_dead_letter_subject: String,

    // Consumer tuning
    /// Messages processed at the same time
    #[serde(default = "default_sms_concurrency")]
    pub sms_concurrency: usize,

    /// Messages fetched per receive
    #[serde(default = "default_sms_prefetch")]
    pub sms_prefetch: usize,

    #[serde(default = "default_sms_max_wait_secs")]
    pub sms_max_wait_secs: u64,

    /// Time the broker waits for an outcome before redelivering
    #[serde(default = "default_sms_ack_wait_secs")]
    pub sms_ack_wait_secs: u64,

    /// Broker-side delivery limit per message
    #[serde(default = "default_sms_max_deliver")]
    pub sms_max_deliver: i64,

    /// Must stay false; the consumer refuses to start otherwise
    #[serde(default)]
    pub sms_auto_ack: bool,

    /// Upper bound on waiting for in-flight messages at shutdown
    #[serde(default = "default_sms_drain_timeout_secs")]
    pub sms_drain_timeout_secs: u64,

    // OpenTelemetry configuration
    #[serde(default)]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    /// Timeout for closers at shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("SMS_SERVICE"))
            .build()?
            .try_deserialize()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    10
}

fn default_sms_notifications_stream() -> String {
    "sms_notifications".to_string()
}

fn default_sms_notifications_subject() -> String {
    "sms_notifications.>".to_string()
}

fn default_sms_consumer_name() -> String {
    "sms-service".to_string()
}

fn default_sms_dead_letter_stream() -> String {
    "sms_notifications_dead_letter".to_string()
}

fn default_sms_dead_letter_subject() -> String {
    "sms_notifications_dead_letter.requested".to_string()
}

fn default_sms_concurrency() -> usize {
    1
}

fn default_sms_prefetch() -> usize {
    1
}

fn default_sms_max_wait_secs() -> u64 {
    5
}

fn default_sms_ack_wait_secs() -> u64 {
    30
}

fn default_sms_max_deliver() -> i64 {
    10
}

fn default_sms_drain_timeout_secs() -> u64 {
    30
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "sms-service".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}
