use std::fmt;
use thiserror::Error;
use tracing::error;

/// Broker transport failures that are not caused by the content of a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to receive messages: {0}")]
    Receive(String),

    #[error("disconnected from NATS: {0}")]
    Disconnected(String),

    #[error("failed to {action} message {message_id}: {detail}")]
    Settle {
        action: &'static str,
        message_id: String,
        detail: String,
    },

    #[error("failed to publish to {subject}: {detail}")]
    Publish { subject: String, detail: String },
}

impl TransportError {
    pub fn settle(
        action: &'static str,
        message_id: impl Into<String>,
        detail: impl fmt::Display,
    ) -> Self {
        Self::Settle {
            action,
            message_id: message_id.into(),
            detail: detail.to_string(),
        }
    }
}

/// Failures of the subscription lifecycle; the only errors that reach the
/// owner of a consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid consumer configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to open subscription {entity_path}: {detail}")]
    Open { entity_path: String, detail: String },

    #[error("connection for subscription {entity_path} is unrecoverable: {detail}")]
    ConnectionLost { entity_path: String, detail: String },
}

/// Operation that raised an infrastructure error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Receive,
    Complete,
    DeadLetter,
    Abandon,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Receive => "Receive",
            Self::Complete => "Complete",
            Self::DeadLetter => "DeadLetter",
            Self::Abandon => "Abandon",
        }
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An infrastructure error together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfrastructureError {
    pub error_source: ErrorSource,
    pub entity_path: String,
    pub error: TransportError,
}

impl InfrastructureError {
    pub fn new(
        error_source: ErrorSource,
        entity_path: impl Into<String>,
        error: TransportError,
    ) -> Self {
        Self {
            error_source,
            entity_path: entity_path.into(),
            error,
        }
    }
}

/// Side channel for failures that are not attributable to a single message.
///
/// Reports never influence the outcome of any envelope.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &InfrastructureError);
}

/// Reports infrastructure errors as `tracing` events.
#[derive(Debug, Clone, Default)]
pub struct TracingErrorReporter;

impl TracingErrorReporter {
    pub fn new() -> Self {
        Self
    }
}

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, error: &InfrastructureError) {
        error!(
            error_source = %error.error_source,
            entity_path = %error.entity_path,
            error = %error.error,
            "error in nats consumer. source: {}, entity path: {}",
            error.error_source,
            error.entity_path
        );
    }
}
