use crate::nats::{ReceivedBatch, TransportError};
use anyhow::Result;
use async_nats::jetstream;
use async_nats::HeaderMap;
use async_trait::async_trait;

/// Trait for JetStream consumer operations
/// Abstracts the operations needed to create and use a NATS JetStream consumer
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamConsumer: Send + Sync {
    /// Create (or bind to) a durable pull consumer on a stream
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>>;
}

/// Trait for pull consumer operations
/// Abstracts the receive operation on a pull consumer
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// Fetch up to `max_messages` envelopes, waiting up to `expires`.
    /// An empty batch means nothing was available before the request expired.
    /// `Err` is reserved for a pull request that could not be issued at all.
    async fn fetch_envelopes(
        &self,
        max_messages: usize,
        expires: std::time::Duration,
    ) -> std::result::Result<ReceivedBatch, TransportError>;
}

/// Trait for JetStream publisher operations
/// Abstracts the operations needed to create streams and publish messages
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamPublisher: Send + Sync {
    /// Get an existing stream by name
    async fn get_stream(&self, stream_name: &str) -> Result<()>;

    /// Create a new stream with the given configuration
    async fn create_stream(&self, config: jetstream::stream::Config) -> Result<()>;

    /// Publish a message to a subject and await the JetStream acknowledgment.
    /// Trace context of the current span is added to `headers`.
    async fn publish(&self, subject: String, headers: HeaderMap, payload: bytes::Bytes)
        -> Result<()>;
}
