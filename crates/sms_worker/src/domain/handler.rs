use crate::domain::{HandlerError, SmsNotificationRequested};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Business capability invoked once per decoded notification.
///
/// Implementations report success or failure only; broker outcomes are
/// decided by the consumer. With a concurrency above 1 the handler is
/// called from several tasks at once.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SmsNotificationHandler: Send + Sync {
    async fn handle(
        &self,
        notification: SmsNotificationRequested,
        cancellation: CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Placeholder handler that records the request and succeeds
#[derive(Debug, Clone, Default)]
pub struct LoggingSmsNotificationHandler;

impl LoggingSmsNotificationHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SmsNotificationHandler for LoggingSmsNotificationHandler {
    async fn handle(
        &self,
        notification: SmsNotificationRequested,
        cancellation: CancellationToken,
    ) -> Result<(), HandlerError> {
        if cancellation.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }

        info!(
            venue_id = notification.venue_id,
            message_length = notification.message.len(),
            "handling SMS notification for venue {}",
            notification.venue_id
        );
        Ok(())
    }
}
