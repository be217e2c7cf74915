use crate::domain::SmsNotificationHandler;
use crate::nats::SmsNotificationService;
use common::nats::{
    ConsumerConfig, ConsumerState, ErrorReporter, JetStreamConsumer, LifecycleError,
    NatsConsumeLoggingLayer, NatsConsumeLoggingService, NatsConsumeTracingConfig,
    NatsConsumeTracingLayer, NatsConsumeTracingService, TowerConsumer,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::debug;

/// Type alias for the layered SMS notification consumer service
type SmsNotificationLayeredService =
    NatsConsumeTracingService<NatsConsumeLoggingService<SmsNotificationService>>;

/// Subscription to SMS notification requests
pub struct SmsNotificationConsumer {
    consumer: TowerConsumer<SmsNotificationLayeredService>,
}

impl SmsNotificationConsumer {
    pub fn new(
        jetstream: Arc<dyn JetStreamConsumer>,
        config: ConsumerConfig,
        handler: Arc<dyn SmsNotificationHandler>,
    ) -> Self {
        debug!(
            stream = %config.stream_name,
            consumer = %config.consumer_name,
            filter = %config.filter_subject,
            "initializing SMS notification consumer with Tower middleware"
        );

        let inner_service = SmsNotificationService::new(handler);
        let layered_service = ServiceBuilder::new()
            .layer(NatsConsumeTracingLayer::new(NatsConsumeTracingConfig::new(
                "process_sms_notification",
            )))
            .layer(NatsConsumeLoggingLayer::new())
            .service(inner_service);

        Self {
            consumer: TowerConsumer::new(jetstream, config, layered_service),
        }
    }

    pub fn with_error_reporter(self, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            consumer: self.consumer.with_error_reporter(reporter),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.consumer.state()
    }

    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.consumer.start().await
    }

    pub async fn stop(&self) {
        self.consumer.stop().await
    }

    pub async fn closed(&self) -> Result<(), LifecycleError> {
        self.consumer.closed().await
    }

    pub async fn dispose(self) {
        self.consumer.dispose().await
    }

    /// Run the consumer until cancelled or the subscription fails
    pub async fn run(self, ctx: CancellationToken) -> Result<(), LifecycleError> {
        debug!("starting SMS notification consumer");
        self.consumer.run(ctx).await
    }
}
