use crate::nats::{Outcome, TransportError};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Handle back to the broker for settling a single delivery.
///
/// Every method consumes the context, so a delivery can be settled at most
/// once.
#[async_trait]
pub trait DeliveryContext: Send {
    /// Acknowledge the delivery and remove it from the subscription
    async fn complete(self: Box<Self>) -> Result<(), TransportError>;

    /// Move the delivery to the dead-letter destination; it is not retried
    async fn dead_letter(
        self: Box<Self>,
        reason: &str,
        description: &str,
    ) -> Result<(), TransportError>;

    /// Return the delivery to the subscription for redelivery
    async fn abandon(self: Box<Self>) -> Result<(), TransportError>;
}

/// One delivery attempt of a message from the broker.
pub struct Envelope {
    /// Broker-assigned id, stable across redeliveries of the same message
    pub id: String,
    pub subject: String,
    pub body: Bytes,
    pub headers: Option<HeaderMap>,
    /// 1 for the first delivery, incremented on every redelivery
    pub delivery_count: u64,
    delivery: Box<dyn DeliveryContext>,
}

impl Envelope {
    pub fn new(
        id: impl Into<String>,
        subject: impl Into<String>,
        body: Bytes,
        headers: Option<HeaderMap>,
        delivery_count: u64,
        delivery: Box<dyn DeliveryContext>,
    ) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            body,
            headers,
            delivery_count,
            delivery,
        }
    }

    /// Apply an outcome against the delivery context, releasing it.
    pub async fn settle(self, outcome: &Outcome) -> Result<(), TransportError> {
        match outcome {
            Outcome::Complete => self.delivery.complete().await,
            Outcome::DeadLetter {
                reason,
                description,
            } => self.delivery.dead_letter(reason, description).await,
            Outcome::Abandon => self.delivery.abandon().await,
        }
    }
}

/// Everything one receive produced.
///
/// `errors` holds transport failures that arrived alongside (or instead of)
/// messages in the same pull request.
#[derive(Debug, Default)]
pub struct ReceivedBatch {
    pub envelopes: Vec<Envelope>,
    pub errors: Vec<TransportError>,
}

impl ReceivedBatch {
    pub fn new(envelopes: Vec<Envelope>) -> Self {
        Self {
            envelopes,
            errors: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty() && self.errors.is_empty()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("body_len", &self.body.len())
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}
