use thiserror::Error;

/// Why a message body could not be turned into a notification
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("invalid notification payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("message body deserialized to null")]
    NullPayload,
}

/// Failure reported by an [`SmsNotificationHandler`](crate::domain::SmsNotificationHandler).
///
/// Every variant is treated as transient and the message is redelivered.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("notification handling was cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}
