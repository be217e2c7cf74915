use async_nats::HeaderMap;
use bytes::Bytes;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Request type for consuming a single NATS message through Tower.
///
/// This owns all the message data, allowing it to be passed through
/// Tower middleware layers without lifetime concerns. The delivery context
/// stays with the consumer; services only decide the outcome.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    /// Broker-assigned message id
    pub message_id: String,
    /// The NATS subject the message was published to
    pub subject: String,
    /// The message payload
    pub payload: Bytes,
    /// Optional headers (used for trace context propagation)
    pub headers: Option<HeaderMap>,
    /// Number of times this message has been delivered, including this one
    pub delivery_count: u64,
    /// Cancelled when the consumer is asked to stop
    pub cancellation: CancellationToken,
}

impl ConsumeRequest {
    pub fn new(
        message_id: impl Into<String>,
        subject: impl Into<String>,
        payload: Bytes,
        headers: Option<HeaderMap>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            subject: subject.into(),
            payload,
            headers,
            delivery_count: 1,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_delivery_count(mut self, delivery_count: u64) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Terminal decision for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed - acknowledge and remove from the subscription
    Complete,
    /// Permanently unprocessable - move to the dead-letter destination
    DeadLetter { reason: String, description: String },
    /// Transient failure - return to the subscription for redelivery
    Abandon,
}

impl Outcome {
    pub fn complete() -> Self {
        Self::Complete
    }

    pub fn dead_letter(reason: impl Into<String>, description: impl Into<String>) -> Self {
        Self::DeadLetter {
            reason: reason.into(),
            description: description.into(),
        }
    }

    pub fn abandon() -> Self {
        Self::Abandon
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Self::DeadLetter { .. })
    }

    pub fn is_abandon(&self) -> bool {
        matches!(self, Self::Abandon)
    }

    /// Dead-letter reason code, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::DeadLetter { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::DeadLetter { .. } => "dead_letter",
            Self::Abandon => "abandon",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
