use crate::domain::{
    decide_outcome, decode_notification, ProcessingResult, SmsNotificationHandler,
};
use common::nats::{ConsumeRequest, Outcome};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, warn};

/// Tower service for processing individual SMS notification messages.
///
/// This service:
/// 1. Decodes the JSON body into an SmsNotificationRequested
/// 2. Delegates to the SmsNotificationHandler
/// 3. Maps the result to an Outcome through `decide_outcome`
///
/// It never fails; every per-message problem becomes an outcome.
#[derive(Clone)]
pub struct SmsNotificationService {
    handler: Arc<dyn SmsNotificationHandler>,
}

impl SmsNotificationService {
    pub fn new(handler: Arc<dyn SmsNotificationHandler>) -> Self {
        Self { handler }
    }
}

async fn process(handler: &dyn SmsNotificationHandler, req: &ConsumeRequest) -> ProcessingResult {
    let notification = match decode_notification(&req.payload) {
        Ok(notification) => notification,
        Err(e) => {
            warn!(
                message_id = %req.message_id,
                error = %e,
                "failed to decode SMS notification"
            );
            return e.into();
        }
    };

    let venue_id = notification.venue_id;
    debug!(
        message_id = %req.message_id,
        venue_id,
        delivery_count = req.delivery_count,
        "processing SMS notification"
    );

    match handler.handle(notification, req.cancellation.clone()).await {
        Ok(()) => ProcessingResult::HandlerSucceeded,
        Err(e) => {
            warn!(
                message_id = %req.message_id,
                venue_id,
                error = %e,
                "SMS notification handler failed"
            );
            ProcessingResult::HandlerFailed(e)
        }
    }
}

impl Service<ConsumeRequest> for SmsNotificationService {
    type Response = Outcome;
    type Error = anyhow::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ConsumeRequest) -> Self::Future {
        let handler = Arc::clone(&self.handler);

        Box::pin(async move {
            let result = process(handler.as_ref(), &req).await;
            Ok(decide_outcome(&result))
        })
    }
}
