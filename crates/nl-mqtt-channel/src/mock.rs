//! Test doubles: a recording `Channel` and an in-memory MQTT broker.
//!
//! `MockChannel` records publish and subscribe calls for assertion.
//! `MockBroker` implements `Connector` and speaks real MQTT bytes, so a
//! `Session` can be driven end to end without a network.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time;

use crate::channel::{Channel, InboundMessage};
use crate::codec::{
    Connack, ConnectReturnCode, FrameBuffer, Packet, PacketIdAllocator, Publish, QoS, Suback,
    SubackCode,
};
use crate::error::{MqttError, MqttResult};
use crate::state::ConnectionState;
use crate::transport::{Connector, Link};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── MockChannel ───────────────────────────────────────────────

/// A recorded publish call.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Mock implementation of the `Channel` trait.
///
/// Stores all publishes and subscriptions in memory for test verification.
pub struct MockChannel {
    client_id: String,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    fail_publishes: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::with_client_id("mock-client")
    }

    pub fn with_client_id(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            fail_publishes: AtomicBool::new(false),
        }
    }

    /// Make every later publish fail with `NotConnected`.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Get all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    /// Get all subscription filters.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.subscriptions).clone()
    }

    /// Get the last published message.
    pub fn last_published(&self) -> Option<PublishedMessage> {
        lock(&self.published).last().cloned()
    }

    /// Get published messages for a specific topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        lock(&self.published)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Check whether a subscription was made to the given filter.
    pub fn is_subscribed_to(&self, filter: &str) -> bool {
        lock(&self.subscriptions).iter().any(|(f, _)| f == filter)
    }

    /// Clear all recorded state.
    pub fn reset(&self) {
        lock(&self.published).clear();
        lock(&self.subscriptions).clear();
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(MqttError::NotConnected(ConnectionState::Disconnected));
        }
        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()> {
        lock(&self.subscriptions).push((filter.to_string(), qos));
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }
}

// ── MockBroker ────────────────────────────────────────────────

/// Produces replies for client publishes (e.g. a simulated device).
pub type Responder = Arc<dyn Fn(&InboundMessage) -> Vec<InboundMessage> + Send + Sync>;

struct ClientLink {
    id: u64,
    to_client: mpsc::Sender<Vec<u8>>,
    task: Option<AbortHandle>,
}

#[derive(Default)]
struct BrokerState {
    next_link_id: u64,
    links: Vec<ClientLink>,
    refuse: Option<ConnectReturnCode>,
    unreachable: bool,
    silent_pings: bool,
    suback_delay: Option<Duration>,
    rejected_filters: HashSet<String>,
    responder: Option<Responder>,
    packet_ids: PacketIdAllocator,

    connect_attempts: u32,
    accepted: u32,
    urls: Vec<String>,
    client_ids: Vec<String>,
    subscriptions: Vec<(String, QoS)>,
    published: Vec<Publish>,
}

/// In-memory MQTT 3.1.1 broker for tests.
///
/// Answers CONNACK, SUBACK, PUBACK and PINGRESP, records what clients
/// send, and can refuse connections, inject publishes or cut links.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    // ── Behaviour switches ──

    /// Answer CONNECT with the given refusal code (or accept when `None`).
    pub fn refuse_connections(&self, code: Option<ConnectReturnCode>) {
        self.state().refuse = code;
    }

    /// Fail `open()` at the transport level.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn set_ping_responses(&self, respond: bool) {
        self.state().silent_pings = !respond;
    }

    /// Hold every SUBACK back for `delay`.
    pub fn set_suback_delay(&self, delay: Option<Duration>) {
        self.state().suback_delay = delay;
    }

    /// SUBACK this filter with the failure code.
    pub fn reject_subscription(&self, filter: impl Into<String>) {
        self.state().rejected_filters.insert(filter.into());
    }

    /// Reply to client publishes; replies go back on the same link.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&InboundMessage) -> Vec<InboundMessage> + Send + Sync + 'static,
    {
        self.state().responder = Some(Arc::new(responder));
    }

    /// Cut every live link, as if the network went away.
    pub fn drop_connections(&self) {
        let links = std::mem::take(&mut self.state().links);
        for link in links {
            if let Some(task) = link.task {
                task.abort();
            }
        }
    }

    /// Publish to every connected client. Returns how many received it.
    pub async fn inject(&self, topic: &str, payload: &[u8]) -> usize {
        let targets: Vec<(mpsc::Sender<Vec<u8>>, Vec<u8>)> = {
            let mut state = self.state();
            let links: Vec<_> = state.links.iter().map(|l| l.to_client.clone()).collect();
            links
                .into_iter()
                .map(|tx| {
                    let id = state.packet_ids.next_id();
                    (tx, publish_frame(topic, payload.to_vec(), id))
                })
                .collect()
        };
        let mut delivered = 0;
        for (tx, frame) in targets {
            if tx.send(frame).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    // ── Observations ──

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn accepted_connections(&self) -> u32 {
        self.state().accepted
    }

    pub fn connection_count(&self) -> usize {
        self.state().links.len()
    }

    pub fn last_url(&self) -> Option<String> {
        self.state().urls.last().cloned()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state().client_ids.clone()
    }

    /// Every filter subscribed, across all connections, in order.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.state().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<Publish> {
        self.state().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Publish> {
        self.state()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    // ── Protocol handling ──

    /// Frames to send back, and whether to close the link afterwards.
    fn handle(&self, packet: Packet) -> (Vec<Vec<u8>>, bool) {
        let mut state = self.state();
        match packet {
            Packet::Connect(connect) => {
                state.client_ids.push(connect.client_id);
                let code = state.refuse.unwrap_or(ConnectReturnCode::Accepted);
                if code == ConnectReturnCode::Accepted {
                    state.accepted += 1;
                }
                let connack = Packet::Connack(Connack {
                    session_present: false,
                    code,
                });
                (vec![frame(connack)], code != ConnectReturnCode::Accepted)
            }
            Packet::Subscribe(subscribe) => {
                let codes = subscribe
                    .filters
                    .iter()
                    .map(|(filter, qos)| {
                        if state.rejected_filters.contains(filter) {
                            SubackCode::Failure
                        } else {
                            SubackCode::Granted(*qos)
                        }
                    })
                    .collect();
                state.subscriptions.extend(subscribe.filters);
                let suback = Packet::Suback(Suback {
                    packet_id: subscribe.packet_id,
                    codes,
                });
                (vec![frame(suback)], false)
            }
            Packet::Publish(publish) => {
                let mut out = Vec::new();
                if let (QoS::AtLeastOnce, Some(id)) = (publish.qos, publish.packet_id) {
                    out.push(frame(Packet::Puback(id)));
                }
                let inbound = InboundMessage::new(publish.topic.clone(), publish.payload.clone());
                state.published.push(publish);
                let responder = state.responder.clone();
                // The responder may call back into the broker.
                drop(state);
                if let Some(responder) = responder {
                    let replies = responder(&inbound);
                    let mut state = self.state();
                    for reply in replies {
                        let id = state.packet_ids.next_id();
                        out.push(publish_frame(&reply.topic, reply.payload, id));
                    }
                }
                (out, false)
            }
            Packet::Pingreq if state.silent_pings => (Vec::new(), false),
            Packet::Pingreq => (vec![frame(Packet::Pingresp)], false),
            Packet::Disconnect => (Vec::new(), true),
            // Client PUBACKs for our QoS 1 deliveries.
            _ => (Vec::new(), false),
        }
    }

    fn forget(&self, link_id: u64) {
        self.state().links.retain(|l| l.id != link_id);
    }

    async fn serve(self, link_id: u64, mut rx: mpsc::Receiver<Vec<u8>>, tx: mpsc::Sender<Vec<u8>>) {
        let mut frames = FrameBuffer::new();
        'link: while let Some(bytes) = rx.recv().await {
            frames.extend(&bytes);
            loop {
                let packet = match frames.next_packet() {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "mock broker dropped malformed packet");
                        continue;
                    }
                };
                let is_subscribe = matches!(packet, Packet::Subscribe(_));
                let (replies, close) = self.handle(packet);
                let delay = self.state().suback_delay;
                if let (true, Some(delay)) = (is_subscribe, delay) {
                    time::sleep(delay).await;
                }
                for reply in replies {
                    if tx.send(reply).await.is_err() {
                        break 'link;
                    }
                }
                if close {
                    break 'link;
                }
            }
        }
        self.forget(link_id);
    }
}

fn frame(packet: Packet) -> Vec<u8> {
    // Packets built here are always well formed.
    packet.encode().unwrap_or_default()
}

fn publish_frame(topic: &str, payload: Vec<u8>, packet_id: u16) -> Vec<u8> {
    let mut publish = Publish::new(topic, QoS::AtLeastOnce, payload);
    publish.packet_id = Some(packet_id);
    frame(Packet::Publish(publish))
}

#[async_trait]
impl Connector for MockBroker {
    async fn open(&self, url: &str) -> MqttResult<Link> {
        let (client_tx, broker_rx) = mpsc::channel(64);
        let (broker_tx, client_rx) = mpsc::channel(64);
        let link_id = {
            let mut state = self.state();
            state.connect_attempts += 1;
            state.urls.push(url.to_string());
            if state.unreachable {
                return Err(MqttError::Transport("mock broker unreachable".into()));
            }
            state.next_link_id += 1;
            let id = state.next_link_id;
            state.links.push(ClientLink {
                id,
                to_client: broker_tx.clone(),
                task: None,
            });
            id
        };

        let task = tokio::spawn(self.clone().serve(link_id, broker_rx, broker_tx));
        if let Some(link) = self.state().links.iter_mut().find(|l| l.id == link_id) {
            link.task = Some(task.abort_handle());
        }
        Ok(Link {
            tx: client_tx,
            rx: client_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_records_messages() {
        let mock = MockChannel::new();
        mock.publish("test/topic", b"hello", QoS::AtLeastOnce)
            .await
            .unwrap();
        mock.publish("test/other", b"world", QoS::AtMostOnce)
            .await
            .unwrap();

        let msgs = mock.published();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].topic, "test/topic");
        assert_eq!(msgs[0].payload, b"hello");
        assert_eq!(msgs[1].qos, QoS::AtMostOnce);
        assert_eq!(mock.published_to("test/other").len(), 1);
    }

    #[tokio::test]
    async fn subscribe_records_filters() {
        let mock = MockChannel::new();
        mock.subscribe("cmd/52/+/res/#", QoS::AtLeastOnce)
            .await
            .unwrap();

        assert!(mock.is_subscribed_to("cmd/52/+/res/#"));
        assert!(!mock.is_subscribed_to("cmd/52/+/st"));
    }

    #[tokio::test]
    async fn failing_publishes() {
        let mock = MockChannel::with_client_id("c1");
        assert_eq!(mock.client_id(), "c1");
        mock.fail_publishes(true);
        assert!(mock.publish("t", b"d", QoS::AtMostOnce).await.is_err());
        assert!(mock.last_published().is_none());
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let mock = MockChannel::new();
        mock.publish("t", b"d", QoS::AtMostOnce).await.unwrap();
        mock.subscribe("f", QoS::AtLeastOnce).await.unwrap();

        mock.reset();
        assert!(mock.published().is_empty());
        assert!(mock.subscriptions().is_empty());
    }

    async fn raw_connect(broker: &MockBroker) -> (Link, FrameBuffer) {
        let mut link = broker.open("wss://mock/mqtt").await.unwrap();
        let connect = crate::codec::Connect::new("raw", 30, true);
        link.tx.send(Packet::Connect(connect).encode().unwrap()).await.unwrap();
        let mut frames = FrameBuffer::new();
        frames.extend(&link.rx.recv().await.unwrap());
        (link, frames)
    }

    #[tokio::test]
    async fn broker_accepts_and_answers_pings() {
        let broker = MockBroker::new();
        let (mut link, mut frames) = raw_connect(&broker).await;
        assert!(matches!(
            frames.next_packet().unwrap(),
            Some(Packet::Connack(Connack { code: ConnectReturnCode::Accepted, .. }))
        ));

        link.tx.send(Packet::Pingreq.encode().unwrap()).await.unwrap();
        frames.extend(&link.rx.recv().await.unwrap());
        assert_eq!(frames.next_packet().unwrap(), Some(Packet::Pingresp));
        assert_eq!(broker.connection_count(), 1);
        assert_eq!(broker.client_ids(), vec!["raw".to_string()]);
    }

    #[tokio::test]
    async fn broker_refusal_closes_link() {
        let broker = MockBroker::new();
        broker.refuse_connections(Some(ConnectReturnCode::BadUsernameOrPassword));
        let (mut link, mut frames) = raw_connect(&broker).await;
        assert!(matches!(
            frames.next_packet().unwrap(),
            Some(Packet::Connack(Connack {
                code: ConnectReturnCode::BadUsernameOrPassword,
                ..
            }))
        ));
        assert!(link.rx.recv().await.is_none());
        assert_eq!(broker.accepted_connections(), 0);
    }

    #[tokio::test]
    async fn responder_replies_on_same_link() {
        let broker = MockBroker::new();
        broker.set_responder(|msg| vec![InboundMessage::new("reply/topic", msg.payload.clone())]);
        let (mut link, mut frames) = raw_connect(&broker).await;
        frames.next_packet().unwrap();

        let publish = Publish::new("req/topic", QoS::AtMostOnce, b"ping".to_vec());
        link.tx.send(Packet::Publish(publish).encode().unwrap()).await.unwrap();
        frames.extend(&link.rx.recv().await.unwrap());
        let Some(Packet::Publish(reply)) = frames.next_packet().unwrap() else {
            panic!("expected reply publish");
        };
        assert_eq!(reply.topic, "reply/topic");
        assert_eq!(reply.payload, b"ping");
        assert_eq!(broker.published_to("req/topic").len(), 1);
    }

    #[tokio::test]
    async fn unreachable_broker_fails_open() {
        let broker = MockBroker::new();
        broker.set_unreachable(true);
        assert!(broker.open("wss://mock/mqtt").await.is_err());
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn drop_connections_closes_client_side() {
        let broker = MockBroker::new();
        let (mut link, _) = raw_connect(&broker).await;
        broker.drop_connections();
        assert!(link.rx.recv().await.is_none());
        assert_eq!(broker.connection_count(), 0);
    }
}
