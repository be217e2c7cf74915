use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::nats::{ConsumeRequest, Outcome};
use tower::{Layer, Service};
use tracing::{error, info, warn, Instrument, Span};

/// Tower layer that logs the outcome of every consumed message
#[derive(Clone, Default)]
pub struct NatsConsumeLoggingLayer;

impl NatsConsumeLoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for NatsConsumeLoggingLayer {
    type Service = NatsConsumeLoggingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        NatsConsumeLoggingService { inner: service }
    }
}

/// Service that logs message id, outcome and duration of each consumption
#[derive(Clone)]
pub struct NatsConsumeLoggingService<S> {
    inner: S,
}

impl<S> Service<ConsumeRequest> for NatsConsumeLoggingService<S>
where
    S: Service<ConsumeRequest, Response = Outcome> + Clone + Send + 'static,
    S::Error: std::fmt::Display + Send,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ConsumeRequest) -> Self::Future {
        let message_id = req.message_id.clone();
        let subject = req.subject.clone();
        let payload_size = req.payload.len();
        let start = Instant::now();
        // Take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let span = Span::current();

        Box::pin(
            async move {
                let result = inner.call(req).await;
                let duration_ms = start.elapsed().as_millis();

                match &result {
                    Ok(Outcome::Complete) => {
                        info!(
                            message_id = %message_id,
                            subject = %subject,
                            payload_bytes = payload_size,
                            outcome = "complete",
                            duration_ms = %duration_ms,
                            "successfully processed message {message_id} in {duration_ms}ms"
                        );
                    }
                    Ok(Outcome::DeadLetter {
                        reason,
                        description,
                    }) => {
                        error!(
                            message_id = %message_id,
                            subject = %subject,
                            payload_bytes = payload_size,
                            outcome = "dead_letter",
                            reason = %reason,
                            description = %description,
                            duration_ms = %duration_ms,
                            "dead-lettering message {message_id} [{reason}]"
                        );
                    }
                    Ok(Outcome::Abandon) => {
                        warn!(
                            message_id = %message_id,
                            subject = %subject,
                            payload_bytes = payload_size,
                            outcome = "abandon",
                            duration_ms = %duration_ms,
                            "abandoning message {message_id} for redelivery"
                        );
                    }
                    Err(e) => {
                        error!(
                            message_id = %message_id,
                            subject = %subject,
                            payload_bytes = payload_size,
                            duration_ms = %duration_ms,
                            error = %e,
                            "failed to consume message {message_id} in {duration_ms}ms: {e}"
                        );
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use tower::ServiceExt;

    #[derive(Clone)]
    struct FixedOutcome(Result<Outcome, String>);

    impl Service<ConsumeRequest> for FixedOutcome {
        type Response = Outcome;
        type Error = anyhow::Error;
        type Future = BoxFuture<'static, Result<Outcome, anyhow::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: ConsumeRequest) -> Self::Future {
            let result = self.0.clone().map_err(anyhow::Error::msg);
            Box::pin(async move { result })
        }
    }

    fn request() -> ConsumeRequest {
        ConsumeRequest::new("msg-1", "test.subject", Bytes::from("{}"), None)
    }

    #[tokio::test]
    async fn test_logging_passes_outcome_through() {
        let service = NatsConsumeLoggingLayer::new().layer(FixedOutcome(Ok(
            Outcome::dead_letter("NullMessage", "Message body deserialized to null"),
        )));

        let outcome = service.oneshot(request()).await.unwrap();
        assert_eq!(outcome.reason(), Some("NullMessage"));
    }

    #[tokio::test]
    async fn test_logging_passes_error_through() {
        let service =
            NatsConsumeLoggingLayer::new().layer(FixedOutcome(Err("service down".to_string())));

        let err = service.oneshot(request()).await.unwrap_err();
        assert_eq!(err.to_string(), "service down");
    }
}
