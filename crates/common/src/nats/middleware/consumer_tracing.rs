use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::nats::trace_context::extract_trace_context;
use crate::nats::{ConsumeRequest, Outcome};
use tower::{Layer, Service};
use tracing::{field, info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Configuration for NATS consume tracing middleware
#[derive(Clone, Debug)]
pub struct NatsConsumeTracingConfig {
    /// Span name reported to OpenTelemetry
    pub operation_name: String,
}

impl NatsConsumeTracingConfig {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
        }
    }
}

impl Default for NatsConsumeTracingConfig {
    fn default() -> Self {
        Self::new("nats_consume")
    }
}

/// Tower layer that opens a span per consumed message, parented to the
/// publisher's trace when the message carries W3C trace context headers
#[derive(Clone, Default)]
pub struct NatsConsumeTracingLayer {
    config: NatsConsumeTracingConfig,
}

impl NatsConsumeTracingLayer {
    pub fn new(config: NatsConsumeTracingConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for NatsConsumeTracingLayer {
    type Service = NatsConsumeTracingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        NatsConsumeTracingService {
            inner: service,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct NatsConsumeTracingService<S> {
    inner: S,
    config: NatsConsumeTracingConfig,
}

impl<S> Service<ConsumeRequest> for NatsConsumeTracingService<S>
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
        let span = info_span!(
            target: "nats",
            "nats_consume",
            otel.name = %self.config.operation_name,
            messaging.system = "nats",
            messaging.operation = "process",
            messaging.destination.name = %req.subject,
            messaging.message.id = %req.message_id,
            messaging.message.body.size = req.payload.len(),
            messaging.message.delivery_count = req.delivery_count,
            outcome = field::Empty,
            otel.status_code = field::Empty,
        );

        if let Some(headers) = &req.headers {
            span.set_parent(extract_trace_context(headers));
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let record_span = span.clone();

        Box::pin(
            async move {
                let result = inner.call(req).await;

                match &result {
                    Ok(outcome) => {
                        record_span.record("outcome", outcome.as_str());
                        // Dead-lettered messages are failures from the caller's point of view
                        let status = if outcome.is_dead_letter() { "ERROR" } else { "OK" };
                        record_span.record("otel.status_code", status);
                    }
                    Err(e) => {
                        record_span.record("otel.status_code", "ERROR");
                        tracing::error!(error = %e, "nats consume failed");
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
    use async_nats::HeaderMap;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use tower::ServiceExt;

    #[derive(Clone)]
    struct AbandonAll;

    impl Service<ConsumeRequest> for AbandonAll {
        type Response = Outcome;
        type Error = anyhow::Error;
        type Future = BoxFuture<'static, Result<Outcome, anyhow::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: ConsumeRequest) -> Self::Future {
            Box::pin(async move { Ok(Outcome::Abandon) })
        }
    }

    #[tokio::test]
    async fn test_tracing_passes_outcome_through() {
        let service = NatsConsumeTracingLayer::new(NatsConsumeTracingConfig::new(
            "process_sms_notification",
        ))
        .layer(AbandonAll);

        let mut headers = HeaderMap::new();
        headers.insert(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        );
        let req = ConsumeRequest::new("msg-1", "sms.requested", Bytes::new(), Some(headers));

        let outcome = service.oneshot(req).await.unwrap();
        assert!(outcome.is_abandon());
    }

    #[test]
    fn test_default_operation_name() {
        assert_eq!(NatsConsumeTracingConfig::default().operation_name, "nats_consume");
    }
}
