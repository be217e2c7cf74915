//! In-process stand-in for a JetStream stream, used by tests to drive a
//! [`TowerConsumer`](crate::nats::TowerConsumer) without a NATS server.

use crate::nats::traits::{JetStreamConsumer, PullConsumer};
use crate::nats::{DeliveryContext, Envelope, ReceivedBatch, TransportError};
use anyhow::Result;
use async_nats::jetstream;
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How the consumer resolved a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Completed {
        message_id: String,
    },
    DeadLettered {
        message_id: String,
        reason: String,
        description: String,
    },
    Abandoned {
        message_id: String,
    },
}

impl Settlement {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Completed { message_id }
            | Self::DeadLettered { message_id, .. }
            | Self::Abandoned { message_id } => message_id,
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: String,
    subject: String,
    body: Bytes,
    headers: Option<HeaderMap>,
    delivery_count: u64,
}

enum Queued {
    Message(QueuedMessage),
    ReceiveFailure(TransportError),
    BatchError(TransportError),
}

#[derive(Default)]
struct BrokerState {
    queue: VecDeque<Queued>,
    settlements: Vec<Settlement>,
    settlement_attempts: usize,
    settlement_failures: VecDeque<String>,
    open_failure: Option<String>,
    opened: Vec<(String, jetstream::consumer::pull::Config)>,
    max_deliver: Option<u64>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    published: Notify,
    settled: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A single in-memory stream that any number of consumers can pull from.
///
/// Clones share the same queue.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requeue abandoned messages until they have been delivered `max_deliver` times
    pub fn with_redelivery(self, max_deliver: u64) -> Self {
        self.shared.lock().max_deliver = Some(max_deliver);
        self
    }

    pub fn publish(&self, subject: impl Into<String>, id: impl Into<String>, body: impl Into<Bytes>) {
        self.publish_with_headers(subject, id, body, None);
    }

    pub fn publish_with_headers(
        &self,
        subject: impl Into<String>,
        id: impl Into<String>,
        body: impl Into<Bytes>,
        headers: Option<HeaderMap>,
    ) {
        self.shared
            .lock()
            .queue
            .push_back(Queued::Message(QueuedMessage {
                id: id.into(),
                subject: subject.into(),
                body: body.into(),
                headers,
                delivery_count: 1,
            }));
        self.shared.published.notify_waiters();
    }

    /// Queue a failed receive; it is returned in place of the next batch
    pub fn fail_next_receive(&self, error: TransportError) {
        self.shared
            .lock()
            .queue
            .push_back(Queued::ReceiveFailure(error));
        self.shared.published.notify_waiters();
    }

    /// Queue a transport error that is returned as part of a batch, next to
    /// whatever messages surround it in the queue
    pub fn fail_within_next_batch(&self, error: TransportError) {
        self.shared
            .lock()
            .queue
            .push_back(Queued::BatchError(error));
        self.shared.published.notify_waiters();
    }

    /// Make the next settlement fail without being recorded
    pub fn fail_next_settlement(&self, detail: impl Into<String>) {
        self.shared
            .lock()
            .settlement_failures
            .push_back(detail.into());
    }

    /// Make opening a subscription fail
    pub fn fail_open(&self, detail: impl Into<String>) {
        self.shared.lock().open_failure = Some(detail.into());
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.lock().settlements.clone()
    }

    /// Messages still waiting to be received
    pub fn pending(&self) -> usize {
        self.shared
            .lock()
            .queue
            .iter()
            .filter(|queued| matches!(queued, Queued::Message(_)))
            .count()
    }

    /// Number of subscriptions opened against this broker
    pub fn open_count(&self) -> usize {
        self.shared.lock().opened.len()
    }

    /// Stream name and consumer config of the most recent subscription
    pub fn last_consumer_config(&self) -> Option<(String, jetstream::consumer::pull::Config)> {
        self.shared.lock().opened.last().cloned()
    }

    /// Wait until at least `count` settlements are recorded or `timeout` elapses,
    /// then return what was recorded
    pub async fn wait_for_settlements(&self, count: usize, timeout: Duration) -> Vec<Settlement> {
        self.wait_until(timeout, |state| state.settlements.len() >= count)
            .await;
        self.settlements()
    }

    /// Like [`wait_for_settlements`](Self::wait_for_settlements) but counts failed attempts too
    pub async fn wait_for_settlement_attempts(&self, count: usize, timeout: Duration) -> usize {
        self.wait_until(timeout, |state| state.settlement_attempts >= count)
            .await;
        self.shared.lock().settlement_attempts
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn(&BrokerState) -> bool) {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if done(&self.shared.lock()) {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl JetStreamConsumer for InMemoryBroker {
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>> {
        let mut state = self.shared.lock();
        if let Some(detail) = state.open_failure.clone() {
            anyhow::bail!(detail);
        }
        state.opened.push((stream_name.to_string(), config));

        Ok(Box::new(InMemoryPullConsumer {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct InMemoryPullConsumer {
    shared: Arc<Shared>,
}

impl InMemoryPullConsumer {
    fn take(&self, max_messages: usize) -> std::result::Result<ReceivedBatch, TransportError> {
        let mut state = self.shared.lock();

        if let Some(Queued::ReceiveFailure(_)) = state.queue.front() {
            if let Some(Queued::ReceiveFailure(err)) = state.queue.pop_front() {
                return Err(err);
            }
        }

        let mut batch = ReceivedBatch::default();
        while batch.envelopes.len() < max_messages {
            match state.queue.front() {
                Some(Queued::Message(_)) | Some(Queued::BatchError(_)) => {}
                _ => break,
            }
            match state.queue.pop_front() {
                Some(Queued::Message(message)) => batch.envelopes.push(self.envelope(message)),
                Some(Queued::BatchError(err)) => batch.errors.push(err),
                _ => {}
            }
        }
        Ok(batch)
    }

    fn envelope(&self, message: QueuedMessage) -> Envelope {
        Envelope::new(
            message.id.clone(),
            message.subject.clone(),
            message.body.clone(),
            message.headers.clone(),
            message.delivery_count,
            Box::new(InMemoryDelivery {
                shared: Arc::clone(&self.shared),
                message,
            }),
        )
    }
}

#[async_trait]
impl PullConsumer for InMemoryPullConsumer {
    async fn fetch_envelopes(
        &self,
        max_messages: usize,
        expires: Duration,
    ) -> std::result::Result<ReceivedBatch, TransportError> {
        let notified = self.shared.published.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch = self.take(max_messages)?;
        if !batch.is_empty() {
            return Ok(batch);
        }

        // Nothing queued: behave like a pull request waiting out its expiry
        let _ = tokio::time::timeout(expires, notified).await;
        self.take(max_messages)
    }
}

struct InMemoryDelivery {
    shared: Arc<Shared>,
    message: QueuedMessage,
}

impl InMemoryDelivery {
    fn settle(
        self,
        action: &'static str,
        settlement: Settlement,
    ) -> std::result::Result<(), TransportError> {
        let result = {
            let mut state = self.shared.lock();
            state.settlement_attempts += 1;

            match state.settlement_failures.pop_front() {
                Some(detail) => Err(TransportError::settle(action, &self.message.id, detail)),
                None => {
                    let abandoned = matches!(settlement, Settlement::Abandoned { .. });
                    state.settlements.push(settlement);

                    let redeliver = abandoned
                        && state
                            .max_deliver
                            .is_some_and(|max| self.message.delivery_count < max);
                    if redeliver {
                        let mut message = self.message.clone();
                        message.delivery_count += 1;
                        state.queue.push_back(Queued::Message(message));
                    }
                    Ok(redeliver)
                }
            }
        };

        self.shared.settled.notify_waiters();
        match result {
            Ok(true) => {
                self.shared.published.notify_waiters();
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl DeliveryContext for InMemoryDelivery {
    async fn complete(self: Box<Self>) -> std::result::Result<(), TransportError> {
        let message_id = self.message.id.clone();
        self.settle("ack", Settlement::Completed { message_id })
    }

    async fn dead_letter(
        self: Box<Self>,
        reason: &str,
        description: &str,
    ) -> std::result::Result<(), TransportError> {
        let message_id = self.message.id.clone();
        self.settle(
            "terminate",
            Settlement::DeadLettered {
                message_id,
                reason: reason.to_string(),
                description: description.to_string(),
            },
        )
    }

    async fn abandon(self: Box<Self>) -> std::result::Result<(), TransportError> {
        let message_id = self.message.id.clone();
        self.settle("nak", Settlement::Abandoned { message_id })
    }
}
