use crate::domain::SmsNotificationHandler;
use crate::nats::SmsNotificationConsumer;
use common::nats::{ConsumerConfig, ErrorReporter, JetStreamConsumer};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SmsWorkerConfig {
    pub stream: String,
    pub subject: String,
    pub consumer_name: String,
    pub concurrency: usize,
    pub prefetch: usize,
    pub max_wait: Duration,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub auto_ack: bool,
    pub drain_timeout: Duration,
}

impl SmsWorkerConfig {
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            concurrency: self.concurrency,
            prefetch: self.prefetch,
            max_wait: self.max_wait,
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver,
            auto_ack: self.auto_ack,
            drain_timeout: self.drain_timeout,
            ..ConsumerConfig::new(&self.stream, &self.consumer_name, &self.subject)
        }
    }
}

pub struct SmsWorker {
    consumer: SmsNotificationConsumer,
}

impl SmsWorker {
    pub fn new(
        jetstream: Arc<dyn JetStreamConsumer>,
        handler: Arc<dyn SmsNotificationHandler>,
        reporter: Arc<dyn ErrorReporter>,
        config: SmsWorkerConfig,
    ) -> Self {
        info!(
            stream = %config.stream,
            subject = %config.subject,
            concurrency = config.concurrency,
            "Initializing SMS worker"
        );

        let consumer = SmsNotificationConsumer::new(jetstream, config.consumer_config(), handler)
            .with_error_reporter(reporter);

        Self { consumer }
    }

    /// The consumer as a runner process; a lost connection fails the process
    pub fn into_runner_process(
        self,
    ) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static
    {
        let consumer = self.consumer;
        move |ctx| Box::pin(async move { Ok(consumer.run(ctx).await?) })
    }
}
