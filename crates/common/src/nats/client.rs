use crate::nats::trace_context::inject_trace_context;
use crate::nats::traits::{JetStreamConsumer, JetStreamPublisher, PullConsumer};
use crate::nats::{DeliveryContext, Envelope, ReceivedBatch, TransportError};
use anyhow::{Context, Result};
use async_nats::connection::State;
use async_nats::jetstream::{self, stream::Config as StreamConfig, AckKind};
use async_nats::HeaderMap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Header carrying the publisher-assigned message id
const NATS_MSG_ID: &str = "Nats-Msg-Id";

pub const DEAD_LETTER_REASON: &str = "Dead-Letter-Reason";
pub const DEAD_LETTER_DESCRIPTION: &str = "Dead-Letter-Description";
pub const ORIGINAL_SUBJECT: &str = "Original-Subject";
pub const ORIGINAL_MESSAGE_ID: &str = "Original-Message-Id";

pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "Connecting to NATS");

        // Configure connection timeout for establishing the TCP connection
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client.clone());

        info!("Successfully connected to NATS");
        Ok(Self { client, jetstream })
    }

    /// Make sure a stream capturing `<stream_name>.>` exists
    pub async fn ensure_stream(&self, stream_name: &str, description: &str) -> Result<()> {
        let publisher = NatsJetStreamPublisher::new(self.jetstream.clone());
        ensure_stream(&publisher, stream_name, description).await
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Create a JetStreamConsumer whose deliveries dead-letter to `dead_letter_subject`
    pub fn create_consumer_client(
        &self,
        dead_letter_subject: impl Into<String>,
    ) -> Arc<dyn JetStreamConsumer> {
        Arc::new(NatsJetStreamConsumer::new(
            self.client.clone(),
            self.jetstream.clone(),
            DeadLetterTarget::new(self.create_publisher_client(), dead_letter_subject),
        ))
    }

    /// Create a JetStreamPublisher trait object from this client
    pub fn create_publisher_client(&self) -> Arc<dyn JetStreamPublisher> {
        Arc::new(NatsJetStreamPublisher::new(self.jetstream.clone()))
    }

    pub async fn close(self) {
        info!("Closing NATS connection");
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection before close");
        }
        // Connection closes when the last client handle is dropped
    }
}

/// Create the stream unless it already exists
pub async fn ensure_stream(
    publisher: &dyn JetStreamPublisher,
    stream_name: &str,
    description: &str,
) -> Result<()> {
    info!(stream = %stream_name, "Ensuring stream exists");

    if publisher.get_stream(stream_name).await.is_ok() {
        info!(stream = %stream_name, "Stream already exists");
        return Ok(());
    }

    let stream_config = StreamConfig {
        name: stream_name.to_string(),
        subjects: vec![format!("{}.>", stream_name)],
        description: Some(description.to_string()),
        ..Default::default()
    };
    publisher.create_stream(stream_config).await?;
    info!(stream = %stream_name, "Created stream");

    Ok(())
}

/// Where dead-lettered deliveries are republished
#[derive(Clone)]
pub struct DeadLetterTarget {
    publisher: Arc<dyn JetStreamPublisher>,
    subject: String,
}

impl DeadLetterTarget {
    pub fn new(publisher: Arc<dyn JetStreamPublisher>, subject: impl Into<String>) -> Self {
        Self {
            publisher,
            subject: subject.into(),
        }
    }
}

/// Concrete implementation of JetStreamConsumer using async-nats
pub struct NatsJetStreamConsumer {
    client: async_nats::Client,
    context: jetstream::Context,
    dead_letter: DeadLetterTarget,
}

impl NatsJetStreamConsumer {
    pub fn new(
        client: async_nats::Client,
        context: jetstream::Context,
        dead_letter: DeadLetterTarget,
    ) -> Self {
        Self {
            client,
            context,
            dead_letter,
        }
    }
}

#[async_trait]
impl JetStreamConsumer for NatsJetStreamConsumer {
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>> {
        let consumer = self
            .context
            .create_consumer_on_stream(config, stream_name)
            .await
            .context("Failed to create consumer")?;

        Ok(Box::new(NatsPullConsumer {
            client: self.client.clone(),
            consumer,
            dead_letter: self.dead_letter.clone(),
        }))
    }
}

/// Concrete implementation of PullConsumer using async-nats
pub struct NatsPullConsumer {
    client: async_nats::Client,
    consumer: jetstream::consumer::PullConsumer,
    dead_letter: DeadLetterTarget,
}

impl NatsPullConsumer {
    fn receive_error(&self, detail: impl std::fmt::Display) -> TransportError {
        match self.client.connection_state() {
            State::Disconnected => TransportError::Disconnected(detail.to_string()),
            _ => TransportError::Receive(detail.to_string()),
        }
    }

    fn into_envelope(&self, message: jetstream::Message) -> Envelope {
        let subject = message.subject.to_string();
        let headers = message.headers.clone();
        let body = message.payload.clone();

        let (sequence_id, delivery_count) = match message.info() {
            Ok(info) => (
                format!("{}:{}", info.stream, info.stream_sequence),
                u64::try_from(info.delivered).unwrap_or(1),
            ),
            Err(e) => {
                warn!(subject = %subject, error = %e, "message has no JetStream metadata");
                (subject.clone(), 1)
            }
        };

        let id = headers
            .as_ref()
            .and_then(|h| h.get(NATS_MSG_ID))
            .map(|v| v.as_str().to_string())
            .unwrap_or(sequence_id);

        let delivery = JetStreamDelivery {
            message_id: id.clone(),
            message,
            dead_letter: self.dead_letter.clone(),
        };

        Envelope::new(id, subject, body, headers, delivery_count, Box::new(delivery))
    }
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch_envelopes(
        &self,
        max_messages: usize,
        expires: Duration,
    ) -> std::result::Result<ReceivedBatch, TransportError> {
        use futures::StreamExt;

        let mut messages = self
            .consumer
            .batch()
            .max_messages(max_messages)
            .expires(expires)
            .messages()
            .await
            .map_err(|e| self.receive_error(e))?;

        let mut batch = ReceivedBatch::default();
        while let Some(msg) = messages.next().await {
            match msg {
                Ok(message) => batch.envelopes.push(self.into_envelope(message)),
                Err(e) => {
                    warn!(error = %e, "Error receiving message");
                    batch.errors.push(self.receive_error(e));
                }
            }
        }

        Ok(batch)
    }
}

/// Delivery context backed by a JetStream message
struct JetStreamDelivery {
    message_id: String,
    message: jetstream::Message,
    dead_letter: DeadLetterTarget,
}

/// Header values must stay on one line
fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[async_trait]
impl DeliveryContext for JetStreamDelivery {
    async fn complete(self: Box<Self>) -> std::result::Result<(), TransportError> {
        self.message
            .ack()
            .await
            .map_err(|e| TransportError::settle("ack", &self.message_id, e))
    }

    async fn dead_letter(
        self: Box<Self>,
        reason: &str,
        description: &str,
    ) -> std::result::Result<(), TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(DEAD_LETTER_REASON, header_value(reason).as_str());
        headers.insert(DEAD_LETTER_DESCRIPTION, header_value(description).as_str());
        headers.insert(ORIGINAL_SUBJECT, self.message.subject.as_str());
        headers.insert(ORIGINAL_MESSAGE_ID, self.message_id.as_str());

        let published = self
            .dead_letter
            .publisher
            .publish(
                self.dead_letter.subject.clone(),
                headers,
                self.message.payload.clone(),
            )
            .await;

        if let Err(e) = published {
            // Leave the dead-letter decision to the next delivery
            if let Err(nak_err) = self.message.ack_with(AckKind::Nak(None)).await {
                warn!(
                    message_id = %self.message_id,
                    error = %nak_err,
                    "failed to return message after dead-letter publish failure"
                );
            }
            return Err(TransportError::Publish {
                subject: self.dead_letter.subject.clone(),
                detail: format!("{:#}", e),
            });
        }

        debug!(
            message_id = %self.message_id,
            dead_letter_subject = %self.dead_letter.subject,
            "published message to dead-letter subject"
        );

        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| TransportError::settle("terminate", &self.message_id, e))
    }

    async fn abandon(self: Box<Self>) -> std::result::Result<(), TransportError> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| TransportError::settle("nak", &self.message_id, e))
    }
}

/// Concrete implementation of JetStreamPublisher using async-nats
pub struct NatsJetStreamPublisher {
    context: jetstream::Context,
}

impl NatsJetStreamPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamPublisher for NatsJetStreamPublisher {
    async fn get_stream(&self, stream_name: &str) -> Result<()> {
        self.context
            .get_stream(stream_name)
            .await
            .context("Failed to get stream")?;
        Ok(())
    }

    async fn create_stream(&self, config: jetstream::stream::Config) -> Result<()> {
        self.context
            .create_stream(config)
            .await
            .context("Failed to create stream")?;
        Ok(())
    }

    #[instrument(skip(self, headers, payload), fields(subject = %subject, payload_size = payload.len()))]
    async fn publish(
        &self,
        subject: String,
        mut headers: HeaderMap,
        payload: bytes::Bytes,
    ) -> Result<()> {
        // Inject trace context into headers for distributed tracing
        inject_trace_context(&mut headers);

        let ack = self
            .context
            .publish_with_headers(subject, headers, payload)
            .await
            .context("Failed to publish message to JetStream")?;

        ack.await
            .context("Failed to receive JetStream acknowledgment")?;
        Ok(())
    }
}
