use crate::nats::{
    ConsumeRequest, Envelope, ErrorReporter, ErrorSource, InfrastructureError, JetStreamConsumer,
    LifecycleError, Outcome, PullConsumer, TracingErrorReporter, TransportError,
};
use async_nats::jetstream;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, warn};

/// Settings for a [`TowerConsumer`] subscription.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// JetStream stream the subscription reads from
    pub stream_name: String,
    /// Durable consumer name
    pub consumer_name: String,
    pub filter_subject: String,
    /// Number of worker slots; each slot handles one message at a time
    pub concurrency: usize,
    /// Messages fetched per receive by a slot
    pub prefetch: usize,
    /// How long a receive waits for messages before returning empty
    pub max_wait: Duration,
    /// Time the broker waits for an outcome before redelivering
    pub ack_wait: Duration,
    /// Broker-side limit on deliveries of a single message
    pub max_deliver: i64,
    /// Must stay false: every delivery gets an explicit outcome
    pub auto_ack: bool,
    /// Upper bound on how long `stop()` waits for in-flight messages
    pub drain_timeout: Duration,
    /// Pause after a failed receive
    pub retry_backoff: Duration,
    /// Consecutive failed receives after which the connection is considered lost
    pub max_consecutive_receive_failures: u32,
}

impl ConsumerConfig {
    pub fn new(
        stream_name: impl Into<String>,
        consumer_name: impl Into<String>,
        filter_subject: impl Into<String>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            consumer_name: consumer_name.into(),
            filter_subject: filter_subject.into(),
            concurrency: 1,
            prefetch: 1,
            max_wait: Duration::from_secs(5),
            ack_wait: Duration::from_secs(30),
            max_deliver: 10,
            auto_ack: false,
            drain_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
            max_consecutive_receive_failures: 10,
        }
    }

    /// Identifies the subscription in logs and error reports
    pub fn entity_path(&self) -> String {
        format!("{}/{}", self.stream_name, self.consumer_name)
    }

    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.auto_ack {
            return Err(LifecycleError::InvalidConfig(
                "auto_ack must be disabled; outcomes are always settled explicitly".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(LifecycleError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.prefetch == 0 {
            return Err(LifecycleError::InvalidConfig(
                "prefetch must be at least 1".to_string(),
            ));
        }
        if self.max_consecutive_receive_failures == 0 {
            return Err(LifecycleError::InvalidConfig(
                "max_consecutive_receive_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn pull_config(&self) -> jetstream::consumer::pull::Config {
        jetstream::consumer::pull::Config {
            name: Some(self.consumer_name.clone()),
            durable_name: Some(self.consumer_name.clone()),
            filter_subject: self.filter_subject.clone(),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver,
            ..Default::default()
        }
    }
}

/// Lifecycle of a [`TowerConsumer`].
///
/// `Starting` and `Stopping` are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

struct ActiveSubscription {
    token: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// A NATS consumer that processes messages through a Tower service stack.
///
/// Each worker slot receives, decides and settles one message at a time, so
/// with the default concurrency of 1 no two messages are ever processed at
/// once. The service only decides the [`Outcome`]; the consumer owns the
/// delivery context and applies the outcome exactly once.
pub struct TowerConsumer<S> {
    jetstream: Arc<dyn JetStreamConsumer>,
    config: ConsumerConfig,
    service: S,
    reporter: Arc<dyn ErrorReporter>,
    state: Arc<watch::Sender<ConsumerState>>,
    fatal: Arc<Mutex<Option<LifecycleError>>>,
    active: tokio::sync::Mutex<Option<ActiveSubscription>>,
}

impl<S> TowerConsumer<S>
where
    S: Service<ConsumeRequest, Response = Outcome, Error = anyhow::Error>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    /// Create a stopped consumer; nothing is opened until [`start`](Self::start)
    pub fn new(jetstream: Arc<dyn JetStreamConsumer>, config: ConsumerConfig, service: S) -> Self {
        let (state, _) = watch::channel(ConsumerState::Stopped);
        Self {
            jetstream,
            config,
            service,
            reporter: Arc::new(TracingErrorReporter::new()),
            state: Arc::new(state),
            fatal: Arc::new(Mutex::new(None)),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the default `tracing` error reporter
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Open the subscription and spawn the worker slots.
    ///
    /// No-op if already running.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let mut active = self.active.lock().await;
        let entity_path = self.config.entity_path();

        if let Some(subscription) = active.as_ref() {
            if !subscription.supervisor.is_finished() {
                debug!(entity_path = %entity_path, "consumer already running");
                return Ok(());
            }
        }
        *active = None;
        *lock(&self.fatal) = None;

        self.config.validate()?;
        self.state.send_replace(ConsumerState::Starting);
        info!(
            entity_path = %entity_path,
            filter_subject = %self.config.filter_subject,
            concurrency = self.config.concurrency,
            "starting nats consumer"
        );

        let consumer: Arc<dyn PullConsumer> = match self
            .jetstream
            .create_consumer(self.config.pull_config(), &self.config.stream_name)
            .await
        {
            Ok(consumer) => Arc::from(consumer),
            Err(e) => {
                self.state.send_replace(ConsumerState::Stopped);
                error!(entity_path = %entity_path, error = %e, "failed to open subscription");
                return Err(LifecycleError::Open {
                    entity_path,
                    detail: format!("{:#}", e),
                });
            }
        };

        let token = CancellationToken::new();
        let mut slots = JoinSet::new();
        for slot in 0..self.config.concurrency {
            let worker = Slot {
                slot,
                consumer: Arc::clone(&consumer),
                service: self.service.clone(),
                reporter: Arc::clone(&self.reporter),
                config: self.config.clone(),
                entity_path: entity_path.clone(),
                token: token.clone(),
            };
            slots.spawn(worker.run());
        }

        self.state.send_replace(ConsumerState::Running);

        let supervisor = tokio::spawn(supervise(
            slots,
            token.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.fatal),
            entity_path.clone(),
        ));
        *active = Some(ActiveSubscription { token, supervisor });

        info!(entity_path = %entity_path, "nats consumer running");
        Ok(())
    }

    /// Stop receiving, cancel in-flight handlers and wait for their outcomes
    /// to be applied, bounded by the drain timeout.
    ///
    /// Messages still unresolved when the timeout elapses are left unsettled
    /// and redeliver once their ack wait expires. No-op if already stopped.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let entity_path = self.config.entity_path();

        let Some(subscription) = active.take() else {
            debug!(entity_path = %entity_path, "consumer already stopped");
            return;
        };

        if subscription.supervisor.is_finished() {
            // Stopped on its own after a fatal error
            return;
        }

        self.state.send_replace(ConsumerState::Stopping);
        info!(entity_path = %entity_path, "stopping nats consumer");
        subscription.token.cancel();

        let mut supervisor = subscription.supervisor;
        match tokio::time::timeout(self.config.drain_timeout, &mut supervisor).await {
            Ok(_) => {
                debug!(entity_path = %entity_path, "in-flight messages drained");
            }
            Err(_) => {
                warn!(
                    entity_path = %entity_path,
                    drain_timeout_ms = self.config.drain_timeout.as_millis(),
                    "drain timeout elapsed, abandoning in-flight messages to broker redelivery"
                );
                supervisor.abort();
                let _ = supervisor.await;
            }
        }

        self.state.send_replace(ConsumerState::Stopped);
        info!(entity_path = %entity_path, "nats consumer stopped");
    }

    /// Resolves once the consumer is stopped.
    ///
    /// Returns the lifecycle error if the subscription stopped because its
    /// connection was lost. Resolves immediately for a consumer that was
    /// never started.
    pub async fn closed(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = state
            .wait_for(|state| *state == ConsumerState::Stopped)
            .await;

        match lock(&self.fatal).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop (if still running) and release the broker client.
    pub async fn dispose(self) {
        self.stop().await;
        debug!(entity_path = %self.config.entity_path(), "nats consumer disposed");
    }

    /// Run until `ctx` is cancelled or the subscription fails, then dispose
    pub async fn run(self, ctx: CancellationToken) -> Result<(), LifecycleError> {
        self.start().await?;

        let result = tokio::select! {
            _ = ctx.cancelled() => {
                info!(
                    entity_path = %self.config.entity_path(),
                    "received shutdown signal, stopping consumer"
                );
                Ok(())
            }
            result = self.closed() => result,
        };

        self.dispose().await;
        result
    }
}

impl<S> Drop for TowerConsumer<S> {
    fn drop(&mut self) {
        if let Some(subscription) = self.active.get_mut().take() {
            subscription.token.cancel();
            subscription.supervisor.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wait for all slots; the first fatal slot error stops the others and the
/// consumer.
async fn supervise(
    mut slots: JoinSet<Result<(), LifecycleError>>,
    token: CancellationToken,
    state: Arc<watch::Sender<ConsumerState>>,
    fatal: Arc<Mutex<Option<LifecycleError>>>,
    entity_path: String,
) {
    let mut failure = None;

    while let Some(joined) = slots.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(entity_path = %entity_path, error = %e, "subscription failed, stopping consumer");
                token.cancel();
                failure.get_or_insert(e);
            }
            Err(e) if e.is_panic() => {
                error!(entity_path = %entity_path, error = %e, "consumer slot panicked, stopping consumer");
                token.cancel();
                failure.get_or_insert(LifecycleError::ConnectionLost {
                    entity_path: entity_path.clone(),
                    detail: format!("consumer slot panicked: {}", e),
                });
            }
            Err(_) => {}
        }
    }

    if let Some(err) = failure {
        *lock(&fatal) = Some(err);
        state.send_replace(ConsumerState::Stopped);
    }
}

/// A strictly sequential receive, decide, settle loop
struct Slot<S> {
    slot: usize,
    consumer: Arc<dyn PullConsumer>,
    service: S,
    reporter: Arc<dyn ErrorReporter>,
    config: ConsumerConfig,
    entity_path: String,
    token: CancellationToken,
}

impl<S> Slot<S>
where
    S: Service<ConsumeRequest, Response = Outcome, Error = anyhow::Error> + Send + 'static,
    S::Future: Send + 'static,
{
    async fn run(mut self) -> Result<(), LifecycleError> {
        debug!(entity_path = %self.entity_path, slot = self.slot, "consumer slot started");
        let mut consecutive_failures = 0u32;

        loop {
            let received = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                received = self.consumer.fetch_envelopes(self.config.prefetch, self.config.max_wait) => received,
            };

            let failure = match received {
                Ok(batch) => {
                    let failed = batch.envelopes.is_empty() && !batch.errors.is_empty();
                    let last_error = batch.errors.last().cloned();
                    for e in batch.errors {
                        self.report(ErrorSource::Receive, e);
                    }

                    if !batch.envelopes.is_empty() {
                        debug!(
                            slot = self.slot,
                            message_count = batch.envelopes.len(),
                            "received messages"
                        );
                    }

                    let mut envelopes = batch.envelopes.into_iter();
                    while let Some(envelope) = envelopes.next() {
                        if self.token.is_cancelled() {
                            self.release(std::iter::once(envelope).chain(envelopes.by_ref()))
                                .await;
                            break;
                        }
                        self.process(envelope).await;
                    }

                    if failed {
                        last_error
                    } else {
                        consecutive_failures = 0;
                        None
                    }
                }
                Err(e) => {
                    self.report(ErrorSource::Receive, e.clone());
                    Some(e)
                }
            };

            let Some(e) = failure else {
                continue;
            };

            consecutive_failures += 1;
            if consecutive_failures >= self.config.max_consecutive_receive_failures {
                return Err(LifecycleError::ConnectionLost {
                    entity_path: self.entity_path.clone(),
                    detail: format!(
                        "{} consecutive receive failures, last: {}",
                        consecutive_failures, e
                    ),
                });
            }

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_backoff) => {}
            }
        }

        debug!(entity_path = %self.entity_path, slot = self.slot, "consumer slot stopped");
        Ok(())
    }

    async fn process(&mut self, envelope: Envelope) {
        let message_id = envelope.id.clone();
        let request = ConsumeRequest::new(
            envelope.id.clone(),
            envelope.subject.clone(),
            envelope.body.clone(),
            envelope.headers.clone(),
        )
        .with_delivery_count(envelope.delivery_count)
        .with_cancellation(self.token.clone());

        let outcome = self.decide(request).await;

        match envelope.settle(&outcome).await {
            Ok(()) => {
                debug!(message_id = %message_id, outcome = %outcome, "applied message outcome");
            }
            Err(e) => self.report(error_source(&outcome), e),
        }
    }

    /// Run the service; errors and panics resolve to `Abandon`
    async fn decide(&mut self, request: ConsumeRequest) -> Outcome {
        let message_id = request.message_id.clone();
        let service = &mut self.service;
        let call = async move {
            ServiceExt::<ConsumeRequest>::ready(service)
                .await?
                .call(request)
                .await
        };

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(
                    message_id = %message_id,
                    error = %e,
                    "service error processing message, abandoning"
                );
                Outcome::Abandon
            }
            Err(_) => {
                error!(message_id = %message_id, "panic while processing message, abandoning");
                Outcome::Abandon
            }
        }
    }

    /// Return messages that were received but never started
    async fn release(&mut self, envelopes: impl Iterator<Item = Envelope>) {
        for envelope in envelopes {
            debug!(message_id = %envelope.id, "releasing unprocessed message");
            if let Err(e) = envelope.settle(&Outcome::Abandon).await {
                self.report(ErrorSource::Abandon, e);
            }
        }
    }

    fn report(&self, error_source: ErrorSource, error: TransportError) {
        self.reporter.report(&InfrastructureError::new(
            error_source,
            self.entity_path.clone(),
            error,
        ));
    }
}

fn error_source(outcome: &Outcome) -> ErrorSource {
    match outcome {
        Outcome::Complete => ErrorSource::Complete,
        Outcome::DeadLetter { .. } => ErrorSource::DeadLetter,
        Outcome::Abandon => ErrorSource::Abandon,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nats::traits::MockJetStreamConsumer;
    use crate::nats::{InMemoryBroker, MockErrorReporter, Settlement};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::time::Instant;

    const SUBJECT: &str = "test-stream.created";

    /// Acks everything, dead-letters payloads equal to "poison", errors on "error"
    #[derive(Clone)]
    struct ScriptedService;

    impl Service<ConsumeRequest> for ScriptedService {
        type Response = Outcome;
        type Error = anyhow::Error;
        type Future = BoxFuture<'static, Result<Outcome, anyhow::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: ConsumeRequest) -> Self::Future {
            Box::pin(async move {
                match &req.payload[..] {
                    b"poison" => Ok(Outcome::dead_letter("Poison", "poison payload")),
                    b"error" => Err(anyhow::anyhow!("service failure")),
                    b"panic" => panic!("service panicked"),
                    _ => Ok(Outcome::Complete),
                }
            })
        }
    }

    /// Holds each message for `delay`, tracking how many are in flight
    #[derive(Clone)]
    struct SlowService {
        delay: Duration,
        honor_cancellation: bool,
        calls: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl SlowService {
        fn new(delay: Duration, honor_cancellation: bool) -> Self {
            Self {
                delay,
                honor_cancellation,
                calls: Arc::new(AtomicUsize::new(0)),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Service<ConsumeRequest> for SlowService {
        type Response = Outcome;
        type Error = anyhow::Error;
        type Future = BoxFuture<'static, Result<Outcome, anyhow::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: ConsumeRequest) -> Self::Future {
            let this = self.clone();
            Box::pin(async move {
                this.calls.fetch_add(1, Ordering::SeqCst);
                let now = this.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                this.max_in_flight.fetch_max(now, Ordering::SeqCst);

                let outcome = if this.honor_cancellation {
                    tokio::select! {
                        _ = req.cancellation.cancelled() => Outcome::Abandon,
                        _ = tokio::time::sleep(this.delay) => Outcome::Complete,
                    }
                } else {
                    tokio::time::sleep(this.delay).await;
                    Outcome::Complete
                };

                this.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(outcome)
            })
        }
    }

    fn test_config() -> ConsumerConfig {
        ConsumerConfig {
            max_wait: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(5),
            drain_timeout: Duration::from_secs(2),
            ..ConsumerConfig::new("test-stream", "test-consumer", "test-stream.>")
        }
    }

    fn consumer<S>(broker: &InMemoryBroker, config: ConsumerConfig, service: S) -> TowerConsumer<S>
    where
        S: Service<ConsumeRequest, Response = Outcome, Error = anyhow::Error>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        TowerConsumer::new(Arc::new(broker.clone()), config, service)
    }

    #[test]
    fn test_config_defaults() {
        let config = ConsumerConfig::new("sms", "sms-service", "sms.>");
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.prefetch, 1);
        assert!(!config.auto_ack);
        assert_eq!(config.entity_path(), "sms/sms-service");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_auto_ack() {
        let config = ConsumerConfig {
            auto_ack: true,
            ..ConsumerConfig::new("sms", "sms-service", "sms.>")
        };
        assert!(matches!(
            config.validate(),
            Err(LifecycleError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_zero_concurrency() {
        let config = ConsumerConfig {
            concurrency: 0,
            ..ConsumerConfig::new("sms", "sms-service", "sms.>")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pull_config_uses_explicit_ack() {
        let config = ConsumerConfig::new("sms", "sms-service", "sms.>");
        let pull = config.pull_config();
        assert_eq!(pull.durable_name.as_deref(), Some("sms-service"));
        assert_eq!(pull.ack_policy, jetstream::consumer::AckPolicy::Explicit);
        assert_eq!(pull.max_deliver, 10);
        assert_eq!(pull.filter_subject, "sms.>");
    }

    #[tokio::test]
    async fn test_start_failure_returns_lifecycle_error() {
        let mut mock_jetstream = MockJetStreamConsumer::new();
        mock_jetstream
            .expect_create_consumer()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("stream not found")));

        let consumer = TowerConsumer::new(Arc::new(mock_jetstream), test_config(), ScriptedService);

        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Open { .. }));
        assert!(err.to_string().contains("stream not found"));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config_without_opening() {
        let mut mock_jetstream = MockJetStreamConsumer::new();
        mock_jetstream.expect_create_consumer().never();

        let config = ConsumerConfig {
            auto_ack: true,
            ..test_config()
        };
        let consumer = TowerConsumer::new(Arc::new(mock_jetstream), config, ScriptedService);

        assert!(matches!(
            consumer.start().await,
            Err(LifecycleError::InvalidConfig(_))
        ));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker, test_config(), ScriptedService);

        consumer.start().await.unwrap();
        consumer.start().await.unwrap();

        assert_eq!(consumer.state(), ConsumerState::Running);
        assert_eq!(broker.open_count(), 1);

        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker, test_config(), ScriptedService);

        consumer.stop().await;
        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(broker.open_count(), 0);
    }

    #[tokio::test]
    async fn test_each_outcome_is_applied_once() {
        let broker = InMemoryBroker::new();
        broker.publish(SUBJECT, "m-1", "ok");
        broker.publish(SUBJECT, "m-2", "poison");
        broker.publish(SUBJECT, "m-3", "error");

        let consumer = consumer(&broker, test_config(), ScriptedService);
        consumer.start().await.unwrap();

        let settlements = broker
            .wait_for_settlements(3, Duration::from_secs(5))
            .await;
        consumer.stop().await;

        assert_eq!(
            settlements,
            vec![
                Settlement::Completed {
                    message_id: "m-1".to_string()
                },
                Settlement::DeadLettered {
                    message_id: "m-2".to_string(),
                    reason: "Poison".to_string(),
                    description: "poison payload".to_string(),
                },
                Settlement::Abandoned {
                    message_id: "m-3".to_string()
                },
            ]
        );
        assert_eq!(broker.settlements().len(), 3);
    }

    #[tokio::test]
    async fn test_service_panic_abandons_message() {
        let broker = InMemoryBroker::new();
        broker.publish(SUBJECT, "m-1", "panic");
        broker.publish(SUBJECT, "m-2", "ok");

        let consumer = consumer(&broker, test_config(), ScriptedService);
        consumer.start().await.unwrap();

        let settlements = broker
            .wait_for_settlements(2, Duration::from_secs(5))
            .await;
        consumer.stop().await;

        assert_eq!(
            settlements[0],
            Settlement::Abandoned {
                message_id: "m-1".to_string()
            }
        );
        assert_eq!(
            settlements[1],
            Settlement::Completed {
                message_id: "m-2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_single_slot_never_overlaps() {
        let broker = InMemoryBroker::new();
        for i in 0..5 {
            broker.publish(SUBJECT, format!("m-{}", i), "ok");
        }

        let service = SlowService::new(Duration::from_millis(10), false);
        let max_in_flight = Arc::clone(&service.max_in_flight);
        let consumer = consumer(&broker, test_config(), service);
        consumer.start().await.unwrap();

        let settlements = broker
            .wait_for_settlements(5, Duration::from_secs(5))
            .await;
        consumer.stop().await;

        assert_eq!(settlements.len(), 5);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrency_bounds_in_flight_messages() {
        let broker = InMemoryBroker::new();
        for i in 0..8 {
            broker.publish(SUBJECT, format!("m-{}", i), "ok");
        }

        let service = SlowService::new(Duration::from_millis(20), false);
        let max_in_flight = Arc::clone(&service.max_in_flight);
        let config = ConsumerConfig {
            concurrency: 2,
            ..test_config()
        };
        let consumer = consumer(&broker, config, service);
        consumer.start().await.unwrap();

        let settlements = broker
            .wait_for_settlements(8, Duration::from_secs(5))
            .await;
        consumer.stop().await;

        assert_eq!(settlements.len(), 8);
        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_handler() {
        let broker = InMemoryBroker::new();
        broker.publish(SUBJECT, "m-1", "slow");

        let service = SlowService::new(Duration::from_secs(60), true);
        let in_flight = Arc::clone(&service.in_flight);
        let consumer = consumer(&broker, test_config(), service);
        consumer.start().await.unwrap();

        while in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = Instant::now();
        consumer.stop().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(
            broker.settlements(),
            vec![Settlement::Abandoned {
                message_id: "m-1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_stop_mid_batch_releases_unstarted_messages() {
        let broker = InMemoryBroker::new();
        for i in 1..=3 {
            broker.publish(SUBJECT, format!("m-{}", i), "slow");
        }

        let service = SlowService::new(Duration::from_secs(60), true);
        let calls = Arc::clone(&service.calls);
        let in_flight = Arc::clone(&service.in_flight);
        let config = ConsumerConfig {
            prefetch: 3,
            ..test_config()
        };
        let consumer = consumer(&broker, config, service);
        consumer.start().await.unwrap();

        while in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        consumer.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.pending(), 0);
        assert_eq!(
            broker.settlements(),
            vec![
                Settlement::Abandoned {
                    message_id: "m-1".to_string()
                },
                Settlement::Abandoned {
                    message_id: "m-2".to_string()
                },
                Settlement::Abandoned {
                    message_id: "m-3".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_drain_timeout_bounds_stop() {
        let broker = InMemoryBroker::new();
        broker.publish(SUBJECT, "m-1", "slow");

        let service = SlowService::new(Duration::from_secs(60), false);
        let in_flight = Arc::clone(&service.in_flight);
        let config = ConsumerConfig {
            drain_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let consumer = consumer(&broker, config, service);
        consumer.start().await.unwrap();

        while in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = Instant::now();
        consumer.stop().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        // Left unsettled for the broker to redeliver
        assert!(broker.settlements().is_empty());
    }

    #[tokio::test]
    async fn test_receive_errors_are_reported_and_consumption_continues() {
        let broker = InMemoryBroker::new();
        broker.fail_next_receive(TransportError::Receive("timeout".to_string()));
        broker.publish(SUBJECT, "m-1", "ok");

        let mut reporter = MockErrorReporter::new();
        reporter
            .expect_report()
            .withf(|e: &InfrastructureError| {
                e.error_source == ErrorSource::Receive
                    && e.entity_path == "test-stream/test-consumer"
            })
            .times(1)
            .return_const(());

        let consumer = consumer(&broker, test_config(), ScriptedService)
            .with_error_reporter(Arc::new(reporter));
        consumer.start().await.unwrap();

        let settlements = broker
            .wait_for_settlements(1, Duration::from_secs(5))
            .await;
        assert_eq!(consumer.state(), ConsumerState::Running);
        consumer.stop().await;

        assert_eq!(
            settlements,
            vec![Settlement::Completed {
                message_id: "m-1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_errors_received_alongside_messages_are_reported() {
        let broker = InMemoryBroker::new();
        broker.publish(SUBJECT, "m-1", "ok");
        broker.fail_within_next_batch(TransportError::Receive("heartbeat missed".to_string()));
        broker.publish(SUBJECT, "m-2", "ok");

        let mut reporter = MockErrorReporter::new();
        reporter
            .expect_report()
            .withf(|e: &InfrastructureError| {
                e.error_source == ErrorSource::Receive
                    && e.entity_path == "test-stream/test-consumer"
                    && e.error == TransportError::Receive("heartbeat missed".to_string())
            })
            .times(1)
            .return_const(());

        let config = ConsumerConfig {
            prefetch: 2,
            ..test_config()
        };
        let consumer = consumer(&broker, config, ScriptedService)
            .with_error_reporter(Arc::new(reporter));
        consumer.start().await.unwrap();

        let settlements = broker
            .wait_for_settlements(2, Duration::from_secs(5))
            .await;
        assert_eq!(consumer.state(), ConsumerState::Running);
        consumer.stop().await;

        assert_eq!(
            settlements,
            vec![
                Settlement::Completed {
                    message_id: "m-1".to_string()
                },
                Settlement::Completed {
                    message_id: "m-2".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_settle_failure_is_reported() {
        let broker = InMemoryBroker::new();
        broker.fail_next_settlement("connection reset");
        broker.publish(SUBJECT, "m-1", "ok");

        let mut reporter = MockErrorReporter::new();
        reporter
            .expect_report()
            .withf(|e: &InfrastructureError| e.error_source == ErrorSource::Complete)
            .times(1)
            .return_const(());

        let consumer = consumer(&broker, test_config(), ScriptedService)
            .with_error_reporter(Arc::new(reporter));
        consumer.start().await.unwrap();

        broker
            .wait_for_settlement_attempts(1, Duration::from_secs(5))
            .await;
        consumer.stop().await;

        assert!(broker.settlements().is_empty());
    }

    #[tokio::test]
    async fn test_unrecoverable_connection_stops_consumer() {
        let broker = InMemoryBroker::new();
        for _ in 0..3 {
            broker.fail_next_receive(TransportError::Disconnected("closed".to_string()));
        }

        let config = ConsumerConfig {
            max_consecutive_receive_failures: 3,
            ..test_config()
        };
        let consumer = consumer(&broker, config, ScriptedService);
        consumer.start().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), consumer.closed())
            .await
            .expect("consumer should stop after repeated receive failures");

        assert!(matches!(result, Err(LifecycleError::ConnectionLost { .. })));
        assert_eq!(consumer.state(), ConsumerState::Stopped);

        // Stop after a fatal error is a no-op
        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_restart_replaces_previous_connection_error() {
        let broker = InMemoryBroker::new();
        for _ in 0..2 {
            broker.fail_next_receive(TransportError::Disconnected("closed".to_string()));
        }

        let config = ConsumerConfig {
            max_consecutive_receive_failures: 2,
            ..test_config()
        };
        let consumer = consumer(&broker, config, ScriptedService);
        consumer.start().await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), consumer.closed())
            .await
            .unwrap();
        assert!(matches!(first, Err(LifecycleError::ConnectionLost { .. })));

        broker.fail_open("bad target");
        let restart = consumer.start().await;
        assert!(matches!(restart, Err(LifecycleError::Open { .. })));

        let closed = tokio::time::timeout(Duration::from_secs(1), consumer.closed())
            .await
            .unwrap();
        assert!(closed.is_ok());
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker, test_config(), ScriptedService);

        consumer.start().await.unwrap();
        consumer.stop().await;

        broker.publish(SUBJECT, "m-1", "ok");
        consumer.start().await.unwrap();
        broker
            .wait_for_settlements(1, Duration::from_secs(5))
            .await;
        consumer.stop().await;

        assert_eq!(broker.open_count(), 2);
        assert_eq!(broker.settlements().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let broker = InMemoryBroker::new();
        broker.publish(SUBJECT, "m-1", "ok");
        let consumer = consumer(&broker, test_config(), ScriptedService);

        let ctx = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(ctx.clone()));

        broker
            .wait_for_settlements(1, Duration::from_secs(5))
            .await;
        ctx.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_closed_resolves_immediately_when_never_started() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker, test_config(), ScriptedService);

        let result = tokio::time::timeout(Duration::from_secs(1), consumer.closed()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
