//! MQTT broker session.
//!
//! [`BrokerListener`] owns the rumqttc event loop. It is the only writer to
//! the topic cache and runs as a single background task for the lifetime of
//! the process. [`BrokerHandle`] is the cloneable publish side handed to the
//! HTTP gateway.
//!
//! ## Publish confirmation
//!
//! rumqttc does not hand back a packet id from `publish()`, so confirmations
//! are matched by order: every publish pushes a waiter onto a FIFO before the
//! request is queued (under a submit lock, so FIFO order == wire order). When
//! the event loop reports `Outgoing::Publish(pkid)` the front waiter is either
//! completed (QoS 0) or parked under its packet id until `PubAck` (QoS 1) or
//! `PubComp` (QoS 2) arrives.
//!
//! ## Reconnection
//!
//! After startup, connection errors never stop the listener. It marks the
//! broker unavailable, fails every pending confirmation, and polls again
//! after an exponential backoff (1s doubling up to 60s). Subscriptions are
//! re-issued on every CONNACK. Cached payloads are kept while disconnected.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    SubscribeFilter,
};
use tokio::sync::oneshot;

use crate::config::MqttConfig;
use crate::error::{RelayError, Result};
use crate::state::TopicCache;
use crate::topic;

/// Capacity of the request channel between `AsyncClient` and the event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long startup waits for the first CONNACK.
const STARTUP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

// ── Publisher seam ────────────────────────────────────────────────────────────

/// Result of a single publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Broker confirmed delivery at the configured QoS.
    Confirmed,
    /// Client error, timeout, or connection lost while waiting.
    Failed,
    /// No broker connection at the time of the request.
    BrokerUnavailable,
}

/// Outbound publish path used by the gateway.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> PublishOutcome;
}

// ── Confirmation tracking ─────────────────────────────────────────────────────

#[derive(Default)]
struct Confirmations {
    /// Submitted, not yet written to the network.
    queued: VecDeque<(QoS, oneshot::Sender<()>)>,
    /// QoS 1/2 packets written, waiting for PubAck / PubComp.
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

impl Confirmations {
    fn enqueue(&mut self, qos: QoS, done: oneshot::Sender<()>) {
        self.queued.push_back((qos, done));
    }

    fn on_outgoing_publish(&mut self, pkid: u16) {
        let Some((qos, done)) = self.queued.pop_front() else {
            return;
        };
        match qos {
            QoS::AtMostOnce => {
                let _ = done.send(());
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                self.inflight.insert(pkid, done);
            }
        }
    }

    fn on_acknowledged(&mut self, pkid: u16) {
        if let Some(done) = self.inflight.remove(&pkid) {
            let _ = done.send(());
        }
    }

    /// Drop every waiter. Returns how many were pending.
    fn fail_all(&mut self) -> usize {
        let pending = self.queued.len() + self.inflight.len();
        self.queued.clear();
        self.inflight.clear();
        pending
    }
}

/// State shared between the listener task and every handle clone.
#[derive(Default)]
struct BrokerLink {
    connected: AtomicBool,
    confirmations: Mutex<Confirmations>,
    /// Serializes enqueue + publish so FIFO order matches wire order.
    submit: tokio::sync::Mutex<()>,
}

// ── Handle (publish side) ─────────────────────────────────────────────────────

/// Cloneable publish handle.
#[derive(Clone)]
pub struct BrokerHandle {
    client: AsyncClient,
    link: Arc<BrokerLink>,
    qos: QoS,
    retain: bool,
    publish_timeout: Duration,
}

impl BrokerHandle {
    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::Acquire)
    }

    /// Send DISCONNECT. Best effort, used on shutdown.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "MQTT disconnect request failed");
        }
    }
}

#[async_trait]
impl Publisher for BrokerHandle {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> PublishOutcome {
        if !self.is_connected() {
            tracing::error!(topic = topic, "Cannot publish, MQTT broker unavailable");
            return PublishOutcome::BrokerUnavailable;
        }

        let (done_tx, done_rx) = oneshot::channel();
        let attempt = async {
            {
                let _submit = self.link.submit.lock().await;
                let slot = QueuedSlot::push(&self.link.confirmations, self.qos, done_tx);

                if let Err(e) = self
                    .client
                    .publish(topic, self.qos, self.retain, payload)
                    .await
                {
                    tracing::error!(topic = topic, error = %e, "Error publishing to topic");
                    return PublishOutcome::Failed;
                }
                slot.submitted();
            }

            match done_rx.await {
                Ok(()) => {
                    tracing::info!(topic = topic, "Successfully published to topic");
                    PublishOutcome::Confirmed
                }
                Err(_) => {
                    tracing::error!(
                        topic = topic,
                        "Error publishing to topic: connection lost before confirmation"
                    );
                    PublishOutcome::Failed
                }
            }
        };

        match tokio::time::timeout(self.publish_timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(
                    topic = topic,
                    timeout_secs = self.publish_timeout.as_secs_f64(),
                    "Error publishing to topic: no confirmation before timeout"
                );
                PublishOutcome::Failed
            }
        }
    }
}

/// A waiter pushed onto the FIFO while the submit lock is held.
///
/// Dropped before `submitted()` (client error or timeout while the request
/// channel is full) it takes its waiter back off the queue. The submit lock is
/// still held at that point, so the back of the queue is this waiter.
struct QueuedSlot<'a> {
    confirmations: &'a Mutex<Confirmations>,
    armed: bool,
}

impl<'a> QueuedSlot<'a> {
    fn push(confirmations: &'a Mutex<Confirmations>, qos: QoS, done: oneshot::Sender<()>) -> Self {
        confirmations.lock().enqueue(qos, done);
        Self {
            confirmations,
            armed: true,
        }
    }

    fn submitted(mut self) {
        self.armed = false;
    }
}

impl Drop for QueuedSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.confirmations.lock().queued.pop_back();
        }
    }
}

// ── Listener (event loop side) ────────────────────────────────────────────────

/// Owns the MQTT event loop and feeds inbound messages into the cache.
pub struct BrokerListener {
    client: AsyncClient,
    eventloop: EventLoop,
    cache: TopicCache,
    subscriptions: Vec<String>,
    subscribe_qos: QoS,
    link: Arc<BrokerLink>,
    host: String,
    port: u16,
}

impl BrokerListener {
    /// Build the client pair and register every subscription in the cache.
    /// Nothing touches the network until the event loop is polled.
    pub fn new(config: &MqttConfig, cache: TopicCache) -> (BrokerHandle, Self) {
        let mut options = MqttOptions::new(config.client_id.as_str(), config.host.as_str(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if !config.user.is_empty() {
            options.set_credentials(config.user.as_str(), config.pass.as_str());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let link = Arc::new(BrokerLink::default());

        for sub in &config.subscribe_topics {
            tracing::info!(topic = sub.as_str(), "Subscribing to topic");
            cache.register(&topic::resource_path(sub));
        }

        let handle = BrokerHandle {
            client: client.clone(),
            link: link.clone(),
            qos: config.publish_qos,
            retain: config.retain,
            publish_timeout: config.publish_timeout,
        };

        let listener = Self {
            client,
            eventloop,
            cache,
            subscriptions: config.subscribe_topics.clone(),
            subscribe_qos: config.subscribe_qos,
            link,
            host: config.host.clone(),
            port: config.port,
        };

        (handle, listener)
    }

    /// Topic filters sent with every SUBSCRIBE.
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Build the client and block until the broker accepts the connection.
    /// Any failure here is fatal to startup.
    pub async fn connect(config: &MqttConfig, cache: TopicCache) -> Result<(BrokerHandle, Self)> {
        let (handle, mut listener) = Self::new(config, cache);

        tracing::info!(
            host = config.host.as_str(),
            port = config.port,
            client_id = config.client_id.as_str(),
            "Connecting to MQTT broker..."
        );

        let host = listener.host.clone();
        let port = listener.port;
        let connected =
            tokio::time::timeout(STARTUP_CONNECT_TIMEOUT, listener.wait_for_connack()).await;
        match connected {
            Ok(Ok(())) => Ok((handle, listener)),
            Ok(Err(source)) => Err(RelayError::BrokerUnreachable { host, port, source }),
            Err(_) => Err(RelayError::BrokerTimeout { host, port }),
        }
    }

    async fn wait_for_connack(&mut self) -> std::result::Result<(), ConnectionError> {
        loop {
            let event = self.eventloop.poll().await?;
            let connected = matches!(event, Event::Incoming(Packet::ConnAck(_)));
            self.handle_event(event);
            if connected {
                return Ok(());
            }
        }
    }

    /// Delivery loop. Runs until every client handle is dropped.
    pub async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self.eventloop.poll().await {
                Ok(event) => {
                    if matches!(event, Event::Incoming(Packet::ConnAck(_))) {
                        backoff = INITIAL_BACKOFF;
                    }
                    self.handle_event(event);
                }
                Err(ConnectionError::RequestsDone) => {
                    tracing::info!("MQTT client closed, stopping broker listener");
                    self.link.connected.store(false, Ordering::Release);
                    break;
                }
                Err(e) => {
                    self.link.connected.store(false, Ordering::Release);
                    let failed = self.link.confirmations.lock().fail_all();

                    tracing::warn!(
                        host = self.host.as_str(),
                        port = self.port,
                        error = %e,
                        failed_publishes = failed,
                        backoff_secs = backoff.as_secs(),
                        "MQTT connection lost, reconnecting after backoff..."
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.link.connected.store(true, Ordering::Release);
                tracing::info!(
                    host = self.host.as_str(),
                    port = self.port,
                    "Connected to MQTT broker"
                );
                self.subscribe_all();
            }
            Event::Incoming(Packet::Publish(publish)) => self.on_message(&publish),
            Event::Incoming(Packet::PubAck(ack)) => {
                self.link.confirmations.lock().on_acknowledged(ack.pkid);
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                self.link.confirmations.lock().on_acknowledged(comp.pkid);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                tracing::debug!(pkid = ack.pkid, return_codes = ?ack.return_codes, "Subscription acknowledged");
            }
            Event::Incoming(Packet::Disconnect) => {
                tracing::warn!("Broker sent DISCONNECT");
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                self.link.confirmations.lock().on_outgoing_publish(pkid);
            }
            other => {
                tracing::trace!(event = ?other, "MQTT event");
            }
        }
    }

    fn subscribe_all(&self) {
        if self.subscriptions.is_empty() {
            return;
        }

        let filters = self
            .subscriptions
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), self.subscribe_qos));

        if let Err(e) = self.client.try_subscribe_many(filters) {
            tracing::error!(error = %e, "Failed to queue subscribe request");
        }
    }

    fn on_message(&self, publish: &Publish) {
        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
        tracing::debug!(
            topic = publish.topic.as_str(),
            payload = payload.as_str(),
            qos = ?publish.qos,
            retain = publish.retain,
            "MQTT message received"
        );

        let path = topic::resource_path(&publish.topic);
        if !self.cache.contains(&path) {
            tracing::debug!(topic = publish.topic.as_str(), "Ignoring message on unregistered topic");
            return;
        }
        self.cache.set(&path, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck};

    fn test_config() -> MqttConfig {
        MqttConfig {
            subscribe_topics: vec!["sensors/temp".to_string()],
            publish_topics: vec!["actors/valve".to_string()],
            publish_timeout: Duration::from_millis(200),
            ..MqttConfig::default()
        }
    }

    fn publish_event(topic: &str, payload: &str) -> Event {
        Event::Incoming(Packet::Publish(Publish::new(
            topic,
            QoS::AtMostOnce,
            payload.as_bytes().to_vec(),
        )))
    }

    async fn wait_until_queued(link: &BrokerLink, n: usize) {
        for _ in 0..1000 {
            if link.confirmations.lock().queued.len() == n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("publish was never queued");
    }

    #[test]
    fn test_confirmations_qos0_complete_on_write() {
        let mut c = Confirmations::default();
        let (tx, mut rx) = oneshot::channel();
        c.enqueue(QoS::AtMostOnce, tx);

        c.on_outgoing_publish(0);
        assert!(rx.try_recv().is_ok());
        assert!(c.queued.is_empty());
        assert!(c.inflight.is_empty());
    }

    #[test]
    fn test_confirmations_qos1_wait_for_matching_ack() {
        let mut c = Confirmations::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        c.enqueue(QoS::AtLeastOnce, tx1);
        c.enqueue(QoS::AtLeastOnce, tx2);

        c.on_outgoing_publish(7);
        c.on_outgoing_publish(8);
        assert!(rx1.try_recv().is_err());

        c.on_acknowledged(8);
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());

        c.on_acknowledged(7);
        assert!(rx1.try_recv().is_ok());
        assert!(c.inflight.is_empty());
    }

    #[test]
    fn test_confirmations_fail_all_drops_waiters() {
        let mut c = Confirmations::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        c.enqueue(QoS::AtLeastOnce, tx1);
        c.on_outgoing_publish(1);
        c.enqueue(QoS::AtMostOnce, tx2);

        assert_eq!(c.fail_all(), 2);
        assert!(matches!(rx1.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
        assert!(matches!(rx2.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
    }

    #[test]
    fn test_stray_outgoing_publish_is_ignored() {
        let mut c = Confirmations::default();
        c.on_outgoing_publish(3);
        c.on_acknowledged(3);
        assert_eq!(c.fail_all(), 0);
    }

    #[tokio::test]
    async fn test_new_registers_subscriptions_as_absent() {
        let cache = TopicCache::new();
        let (handle, _listener) = BrokerListener::new(&test_config(), cache.clone());

        assert_eq!(cache.get("/sensors/temp"), Some(None));
        assert_eq!(cache.get("/actors/valve"), None);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_inbound_message_updates_cache() {
        let cache = TopicCache::new();
        let (_handle, mut listener) = BrokerListener::new(&test_config(), cache.clone());

        listener.handle_event(publish_event("sensors/temp", "23.5"));
        assert_eq!(cache.get("/sensors/temp"), Some(Some("23.5".to_string())));

        listener.handle_event(publish_event("sensors/temp", "24.0"));
        assert_eq!(cache.get("/sensors/temp"), Some(Some("24.0".to_string())));
    }

    #[tokio::test]
    async fn test_message_on_unregistered_topic_is_dropped() {
        let cache = TopicCache::new();
        let (_handle, mut listener) = BrokerListener::new(&test_config(), cache.clone());

        listener.handle_event(publish_event("sensors/other", "1"));
        assert_eq!(cache.get("/sensors/other"), None);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_connack_marks_broker_available() {
        let cache = TopicCache::new();
        let (handle, mut listener) = BrokerListener::new(&test_config(), cache);

        listener.handle_event(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))));
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn test_publish_without_broker_is_unavailable() {
        let (handle, _listener) = BrokerListener::new(&test_config(), TopicCache::new());
        let outcome = handle.publish("actors/valve", b"open".to_vec()).await;
        assert_eq!(outcome, PublishOutcome::BrokerUnavailable);
    }

    #[tokio::test]
    async fn test_publish_confirmed_when_packet_written() {
        let (handle, mut listener) = BrokerListener::new(&test_config(), TopicCache::new());
        handle.link.connected.store(true, Ordering::Release);

        let publisher = handle.clone();
        let task =
            tokio::spawn(async move { publisher.publish("actors/valve", b"open".to_vec()).await });

        wait_until_queued(&handle.link, 1).await;
        listener.handle_event(Event::Outgoing(Outgoing::Publish(0)));

        assert_eq!(task.await.unwrap(), PublishOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_publish_qos1_confirmed_on_puback() {
        let config = MqttConfig {
            publish_qos: QoS::AtLeastOnce,
            ..test_config()
        };
        let (handle, mut listener) = BrokerListener::new(&config, TopicCache::new());
        handle.link.connected.store(true, Ordering::Release);

        let publisher = handle.clone();
        let task =
            tokio::spawn(async move { publisher.publish("actors/valve", b"open".to_vec()).await });

        wait_until_queued(&handle.link, 1).await;
        listener.handle_event(Event::Outgoing(Outgoing::Publish(1)));
        listener.handle_event(Event::Incoming(Packet::PubAck(PubAck::new(1))));

        assert_eq!(task.await.unwrap(), PublishOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_publish_times_out_without_confirmation() {
        let (handle, _listener) = BrokerListener::new(&test_config(), TopicCache::new());
        handle.link.connected.store(true, Ordering::Release);

        let outcome = handle.publish("actors/valve", b"open".to_vec()).await;
        assert_eq!(outcome, PublishOutcome::Failed);
    }

    #[tokio::test]
    async fn test_publish_times_out_waiting_for_submit_lock() {
        let (handle, _listener) = BrokerListener::new(&test_config(), TopicCache::new());
        handle.link.connected.store(true, Ordering::Release);

        let _held = handle.link.submit.lock().await;
        let outcome = handle.publish("actors/valve", b"open".to_vec()).await;

        assert_eq!(outcome, PublishOutcome::Failed);
        assert!(handle.link.confirmations.lock().queued.is_empty());
    }

    #[tokio::test]
    async fn test_publish_times_out_on_full_request_channel() {
        let (handle, _listener) = BrokerListener::new(&test_config(), TopicCache::new());
        handle.link.connected.store(true, Ordering::Release);

        for _ in 0..REQUEST_CHANNEL_CAPACITY {
            handle
                .client
                .try_publish("actors/valve", QoS::AtMostOnce, false, b"x".to_vec())
                .unwrap();
        }

        let started = tokio::time::Instant::now();
        let outcome = handle.publish("actors/valve", b"open".to_vec()).await;

        assert_eq!(outcome, PublishOutcome::Failed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(handle.link.confirmations.lock().queued.is_empty());
    }

    #[tokio::test]
    async fn test_publish_fails_when_connection_drops() {
        let (handle, _listener) = BrokerListener::new(&test_config(), TopicCache::new());
        handle.link.connected.store(true, Ordering::Release);

        let publisher = handle.clone();
        let task =
            tokio::spawn(async move { publisher.publish("actors/valve", b"open".to_vec()).await });

        wait_until_queued(&handle.link, 1).await;
        handle.link.confirmations.lock().fail_all();

        assert_eq!(task.await.unwrap(), PublishOutcome::Failed);
    }
}
