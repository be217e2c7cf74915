use crate::domain::{HandlerError, NotificationError};
use common::nats::Outcome;

/// Dead-letter reason for bodies that are not a valid notification
pub const DESERIALIZATION_FAILED: &str = "DeserializationFailed";
/// Dead-letter reason for bodies that decode to nothing
pub const NULL_MESSAGE: &str = "NullMessage";
pub const NULL_MESSAGE_DESCRIPTION: &str = "Message body deserialized to null";

/// What happened to a single message before the broker outcome is chosen
#[derive(Debug)]
pub enum ProcessingResult {
    /// Body is not a valid notification; carries the decoder's message
    DecodeFailed(String),
    NullPayload,
    HandlerFailed(HandlerError),
    HandlerSucceeded,
}

impl From<NotificationError> for ProcessingResult {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::Decode(e) => Self::DecodeFailed(e.to_string()),
            NotificationError::NullPayload => Self::NullPayload,
        }
    }
}

/// Map a processing result to the outcome applied at the broker.
///
/// Decode problems are permanent and dead-lettered. Every handler failure is
/// retried; the broker's delivery limit bounds poison messages.
pub fn decide_outcome(result: &ProcessingResult) -> Outcome {
    match result {
        ProcessingResult::DecodeFailed(detail) => {
            Outcome::dead_letter(DESERIALIZATION_FAILED, detail.as_str())
        }
        ProcessingResult::NullPayload => {
            Outcome::dead_letter(NULL_MESSAGE, NULL_MESSAGE_DESCRIPTION)
        }
        ProcessingResult::HandlerFailed(_) => Outcome::Abandon,
        ProcessingResult::HandlerSucceeded => Outcome::Complete,
    }
}
