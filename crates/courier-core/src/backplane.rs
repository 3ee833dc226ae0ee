//! Cross-process replication.
//!
//! Every process owns one [`Backplane`] carrying a random source identifier.
//! Published events are wrapped in an [`Envelope`] tagged with that source
//! and pushed through every configured transport. One consumer task per
//! transport feeds received envelopes into the local [`Hub`], discarding the
//! ones this process published itself.

use courier_protocol::{Envelope, Event, ProtocolError};
use courier_transport::{BackplaneStream, BackplaneTransport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::hub::{Hub, Topic};
use crate::metrics;

/// Backplane errors.
#[derive(Debug, Error)]
pub enum BackplaneError {
    /// The envelope could not be encoded.
    #[error("Envelope encode failed: {0}")]
    Encode(#[from] ProtocolError),

    /// A transport rejected the publish.
    #[error("Publish on {transport} failed: {source}")]
    Publish {
        transport: &'static str,
        #[source]
        source: TransportError,
    },

    /// A transport refused the subscription.
    #[error("Subscribe on {transport} failed: {source}")]
    Subscribe {
        transport: &'static str,
        #[source]
        source: TransportError,
    },
}

/// Backplane configuration.
#[derive(Debug, Clone)]
pub struct BackplaneConfig {
    /// Subjects are `{subject_prefix}.events`.
    pub subject_prefix: String,
    /// Resubscribe attempts after a stream error before the consumer gives up.
    pub resubscribe_attempts: u32,
    /// Delay before the first resubscribe attempt.
    pub initial_delay: Duration,
    /// Upper bound on the resubscribe delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "courier".to_string(),
            resubscribe_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl BackplaneConfig {
    /// The subject every envelope is published on.
    #[must_use]
    pub fn subject(&self) -> String {
        format!("{}.events", self.subject_prefix)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Process-wide replication endpoint.
pub struct Backplane {
    source: String,
    subject: String,
    config: BackplaneConfig,
    transports: Vec<Arc<dyn BackplaneTransport>>,
}

impl Backplane {
    /// Create a backplane with a fresh source identifier and no transports.
    #[must_use]
    pub fn new(config: BackplaneConfig) -> Self {
        Self::with_source(Uuid::new_v4().to_string(), config)
    }

    /// Create a backplane with an explicit source identifier.
    #[must_use]
    pub fn with_source(source: impl Into<String>, config: BackplaneConfig) -> Self {
        Self {
            source: source.into(),
            subject: config.subject(),
            config,
            transports: Vec::new(),
        }
    }

    /// A backplane that replicates nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(BackplaneConfig::default())
    }

    /// Add a transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn BackplaneTransport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// This process's source identifier.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Check if any transport is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.transports.is_empty()
    }

    /// Names of the configured transports.
    #[must_use]
    pub fn transport_names(&self) -> Vec<&'static str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    /// Replicate an event to other processes through every transport.
    ///
    /// Each transport is attempted even if an earlier one fails; the first
    /// failure is returned. Nothing is retried.
    pub async fn publish(&self, event: &Event) -> Result<(), BackplaneError> {
        if self.transports.is_empty() {
            return Ok(());
        }

        let payload = Envelope::new(self.source.clone(), event.clone()).encode()?;
        let mut first_error = None;

        for transport in &self.transports {
            match transport.publish(&self.subject, payload.clone()).await {
                Ok(()) => {
                    trace!(transport = transport.name(), event = %event.id(), "Published envelope");
                }
                Err(source) => {
                    metrics::record_backplane_error(transport.name(), "publish");
                    warn!(transport = transport.name(), error = %source, "Backplane publish failed");
                    first_error.get_or_insert(BackplaneError::Publish {
                        transport: transport.name(),
                        source,
                    });
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Subscribe on every transport and spawn one consumer task per transport.
    ///
    /// Subscriptions are established before this returns. All consumers stop
    /// when `cancel` fires.
    pub async fn start(
        &self,
        hub: Arc<Hub>,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, BackplaneError> {
        let mut handles = Vec::with_capacity(self.transports.len());

        for transport in &self.transports {
            let stream = transport
                .subscribe(&self.subject)
                .await
                .map_err(|source| BackplaneError::Subscribe {
                    transport: transport.name(),
                    source,
                })?;

            let consumer = Consumer {
                transport: Arc::clone(transport),
                subject: self.subject.clone(),
                source: self.source.clone(),
                config: self.config.clone(),
                hub: Arc::clone(&hub),
                cancel: cancel.clone(),
            };
            handles.push(tokio::spawn(consumer.run(stream)));
            info!(transport = transport.name(), subject = %self.subject, "Backplane consumer started");
        }

        Ok(handles)
    }
}

impl std::fmt::Debug for Backplane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backplane")
            .field("source", &self.source)
            .field("subject", &self.subject)
            .field("transports", &self.transport_names())
            .finish()
    }
}

struct Consumer {
    transport: Arc<dyn BackplaneTransport>,
    subject: String,
    source: String,
    config: BackplaneConfig,
    hub: Arc<Hub>,
    cancel: CancellationToken,
}

impl Consumer {
    async fn run(self, mut stream: Box<dyn BackplaneStream>) {
        let name = self.transport.name();

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!(transport = name, "Backplane consumer cancelled");
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Ok(Some(payload)) => {
                    self.dispatch(&payload);
                }
                Ok(None) => {
                    error!(transport = name, "Backplane transport closed, consumer exiting");
                    return;
                }
                Err(e) => {
                    metrics::record_backplane_error(name, "consume");
                    warn!(transport = name, error = %e, "Backplane receive failed");
                    match self.resubscribe().await {
                        Some(fresh) => stream = fresh,
                        None => return,
                    }
                }
            }
        }
    }

    /// Hand a received envelope to the hub. Returns whether it was broadcast.
    fn dispatch(&self, payload: &[u8]) -> bool {
        let name = self.transport.name();
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::record_backplane_error(name, "decode");
                warn!(transport = name, error = %e, "Dropping undecodable envelope");
                return false;
            }
        };

        if envelope.is_from(&self.source) {
            metrics::record_self_echo();
            trace!(transport = name, event = %envelope.payload.id(), "Discarding self-echo");
            return false;
        }

        let topic = Topic::for_event(&envelope.payload);
        debug!(transport = name, topic = %topic, origin = %envelope.source, "Replicating event");
        self.hub.broadcast(&topic, Arc::new(envelope.payload));
        true
    }

    async fn resubscribe(&self) -> Option<Box<dyn BackplaneStream>> {
        let name = self.transport.name();
        let mut delay = self.config.initial_delay;

        for attempt in 1..=self.config.resubscribe_attempts {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!(transport = name, "Backplane consumer cancelled during resubscribe");
                    return None;
                }
                () = tokio::time::sleep(delay) => {}
            }

            match self.transport.subscribe(&self.subject).await {
                Ok(stream) => {
                    info!(transport = name, attempt, "Backplane resubscribed");
                    return Some(stream);
                }
                Err(e) => {
                    metrics::record_backplane_error(name, "subscribe");
                    debug!(transport = name, attempt, error = %e, retry_in = ?delay, "Resubscribe failed");
                    delay = self.config.next_delay(delay);
                }
            }
        }

        error!(
            transport = name,
            attempts = self.config.resubscribe_attempts,
            "Backplane connection lost, consumer exiting"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use courier_protocol::{Message, Notification};
    use courier_transport::{MemoryBus, MemoryQueue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_millis(100);

    fn backplane(source: &str, transport: Arc<dyn BackplaneTransport>) -> Backplane {
        Backplane::with_source(source, BackplaneConfig::default()).with_transport(transport)
    }

    #[tokio::test]
    async fn test_replicates_to_other_process() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();

        let hub_a = Arc::new(Hub::new());
        let hub_b = Arc::new(Hub::new());
        let a = backplane("a", bus.clone());
        let b = backplane("b", bus.clone());
        a.start(hub_a.clone(), cancel.clone()).await.unwrap();
        b.start(hub_b.clone(), cancel.clone()).await.unwrap();

        let (tx_b, mut rx_b) = hub_b.channel();
        hub_b.register(Topic::room("r1"), tx_b);

        let event: Event = Message::new("alice", "r1", "hello").into();
        a.publish(&event).await.unwrap();

        let received = timeout(WAIT, rx_b.recv()).await.unwrap().unwrap();
        assert_eq!(received.id(), event.id());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_self_echo_discarded() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();
        let hub = Arc::new(Hub::new());
        let a = backplane("a", bus.clone());
        a.start(hub.clone(), cancel.clone()).await.unwrap();

        let (tx, mut rx) = hub.channel();
        hub.register(Topic::user("bob"), tx);

        a.publish(&Notification::new("bob", "mention", "hi").into())
            .await
            .unwrap();

        assert!(timeout(WAIT, rx.recv()).await.is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_undecodable_payload_skipped() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();
        let hub = Arc::new(Hub::new());
        let b = backplane("b", bus.clone());
        b.start(hub.clone(), cancel.clone()).await.unwrap();

        let (tx, mut rx) = hub.channel();
        hub.register(Topic::room("r1"), tx);

        let subject = BackplaneConfig::default().subject();
        bus.publish(&subject, Bytes::from_static(b"not json"))
            .await
            .unwrap();
        let good = Envelope::new("a", Message::new("alice", "r1", "after"))
            .encode()
            .unwrap();
        bus.publish(&subject, good).await.unwrap();

        let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(matches!(&*received, Event::Message(m) if m.content == "after"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_queue_transport_delivers() {
        let queue = Arc::new(MemoryQueue::new());
        let cancel = CancellationToken::new();
        let hub = Arc::new(Hub::new());
        let b = backplane("b", queue.clone());
        b.start(hub.clone(), cancel.clone()).await.unwrap();

        let (tx, mut rx) = hub.channel();
        hub.register(Topic::room("r1"), tx);

        backplane("a", queue)
            .publish(&Message::new("alice", "r1", "queued").into())
            .await
            .unwrap();

        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_publish_without_transports_is_noop() {
        let bp = Backplane::disabled();
        assert!(!bp.is_enabled());
        bp.publish(&Message::new("a", "r1", "x").into()).await.unwrap();
    }

    struct Broken;

    #[async_trait]
    impl BackplaneTransport for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn publish(&self, _subject: &str, _payload: Bytes) -> Result<(), TransportError> {
            Err(TransportError::SendFailed("down".into()))
        }

        async fn subscribe(
            &self,
            _subject: &str,
        ) -> Result<Box<dyn BackplaneStream>, TransportError> {
            Err(TransportError::ConnectionClosed)
        }
    }

    #[tokio::test]
    async fn test_publish_failure_surfaced_other_transports_still_used() {
        let bus = Arc::new(MemoryBus::new());
        let mut listener = bus.subscribe(&BackplaneConfig::default().subject()).await.unwrap();

        let bp = Backplane::with_source("a", BackplaneConfig::default())
            .with_transport(Arc::new(Broken))
            .with_transport(bus.clone());
        let err = bp
            .publish(&Message::new("a", "r1", "x").into())
            .await
            .unwrap_err();
        assert!(matches!(err, BackplaneError::Publish { transport: "broken", .. }));

        assert!(timeout(WAIT, listener.next()).await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_fails_on_refused_subscription() {
        let bp = backplane("a", Arc::new(Broken));
        let result = bp.start(Arc::new(Hub::new()), CancellationToken::new()).await;
        assert!(matches!(result, Err(BackplaneError::Subscribe { .. })));
    }

    #[tokio::test]
    async fn test_cancel_stops_consumers() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();
        let handles = backplane("a", bus)
            .start(Arc::new(Hub::new()), cancel.clone())
            .await
            .unwrap();

        cancel.cancel();
        for handle in handles {
            timeout(WAIT, handle).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_consumer_exits_when_transport_closes() {
        let bus = MemoryBus::new();
        let handles = backplane("a", Arc::new(bus.clone()))
            .start(Arc::new(Hub::new()), CancellationToken::new())
            .await
            .unwrap();

        bus.shutdown();
        for handle in handles {
            timeout(WAIT, handle).await.unwrap().unwrap();
        }
    }

    /// First subscription yields a stream that fails immediately.
    struct Flaky {
        bus: MemoryBus,
        subscribes: AtomicUsize,
    }

    struct Failing;

    #[async_trait]
    impl BackplaneStream for Failing {
        async fn next(&mut self) -> Result<Option<Bytes>, TransportError> {
            Err(TransportError::ReceiveFailed("reset".into()))
        }
    }

    #[async_trait]
    impl BackplaneTransport for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
            self.bus.publish(subject, payload).await
        }

        async fn subscribe(&self, subject: &str) -> Result<Box<dyn BackplaneStream>, TransportError> {
            if self.subscribes.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(Box::new(Failing));
            }
            self.bus.subscribe(subject).await
        }
    }

    #[tokio::test]
    async fn test_resubscribes_after_stream_error() {
        let flaky = Arc::new(Flaky {
            bus: MemoryBus::new(),
            subscribes: AtomicUsize::new(0),
        });
        let config = BackplaneConfig {
            initial_delay: Duration::from_millis(1),
            ..BackplaneConfig::default()
        };
        let cancel = CancellationToken::new();
        let hub = Arc::new(Hub::new());
        let (tx, mut rx) = hub.channel();
        hub.register(Topic::room("r1"), tx);

        Backplane::with_source("b", config.clone())
            .with_transport(flaky.clone())
            .start(hub.clone(), cancel.clone())
            .await
            .unwrap();

        timeout(Duration::from_secs(1), async {
            while flaky.subscribes.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        Backplane::with_source("a", config)
            .with_transport(flaky)
            .publish(&Message::new("alice", "r1", "again").into())
            .await
            .unwrap();
        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_some());
        cancel.cancel();
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = BackplaneConfig::default();
        let mut delay = config.initial_delay;
        for _ in 0..20 {
            delay = config.next_delay(delay);
        }
        assert_eq!(delay, config.max_delay);
    }
}
