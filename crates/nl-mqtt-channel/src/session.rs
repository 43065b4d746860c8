//! Connection manager: one MQTT session over a pluggable transport.
//!
//! `Session` is a cheap clonable handle. Behind it run, per live link:
//! - a reader task, the only consumer of inbound bytes
//! - a supervisor task that pings the broker and reconnects with backoff
//!   when the link drops
//!
//! Inbound PUBLISH packets are fanned out on a broadcast channel
//! ([`Session::messages`]); lifecycle changes are published on a watch
//! channel ([`Session::watch_state`]).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::backoff::Backoff;
use crate::channel::{Channel, InboundMessage};
use crate::codec::{
    CodecError, Connack, Connect, ConnectReturnCode, FrameBuffer, Packet, PacketIdAllocator,
    Publish, QoS, Subscribe, SubackCode,
};
use crate::config::SessionConfig;
use crate::error::{MqttError, MqttResult};
use crate::sigv4::{Credentials, presign_url};
use crate::state::ConnectionState;
use crate::transport::{Connector, Link};

const MESSAGE_BUFFER: usize = 256;

// ── Credentials ───────────────────────────────────────────────

/// Source of fresh signing credentials, consulted before every connect.
///
/// Returning `AuthenticationExpired` during reconnection is fatal: the
/// session moves to `Failed` instead of retrying.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self) -> MqttResult<Credentials>;
}

/// Fixed credentials, e.g. loaded from a config file.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self) -> MqttResult<Credentials> {
        Ok(self.0.clone())
    }
}

// ── Statistics ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnection_count: u64,
    /// Set on every successful connect, cleared when the link goes away.
    pub connected_since: Option<DateTime<Utc>>,
}

// ── Session ───────────────────────────────────────────────────

enum Ack {
    Puback,
    Suback(Vec<SubackCode>),
}

enum AckWait {
    Lost,
    TimedOut,
}

struct LinkHandle {
    writer: mpsc::Sender<Vec<u8>>,
    reader: AbortHandle,
}

#[derive(Default)]
struct Shared {
    subscriptions: Vec<(String, QoS)>,
    link: Option<LinkHandle>,
    packet_ids: PacketIdAllocator,
    pending_acks: HashMap<u16, oneshot::Sender<Ack>>,
    supervisor: Option<JoinHandle<()>>,
    last_pong: Option<Instant>,
    stats: Statistics,
}

struct Inner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    state: watch::Sender<ConnectionState>,
    messages: broadcast::Sender<InboundMessage>,
    shared: Mutex<Shared>,
    /// Serializes `connect()` and `disconnect()`.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Handle to one MQTT connection and its background tasks.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.inner.config.client_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                credentials,
                state,
                messages,
                shared: Mutex::new(Shared::default()),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Inbound publishes in arrival order. Receivers only see messages
    /// that arrive after they subscribe.
    pub fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inner.messages.subscribe()
    }

    pub fn statistics(&self) -> Statistics {
        self.shared().stats.clone()
    }

    /// Registered topic filters, replayed on every (re)connect.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.shared().subscriptions.clone()
    }

    /// Make one connection attempt.
    ///
    /// On success the session is `Connected` and a supervisor keeps it
    /// that way. On failure the error is returned and the state is
    /// `Disconnected`; no automatic retry happens.
    pub async fn connect(&self) -> MqttResult<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.state().is_connected() {
            return Ok(());
        }
        self.stop_supervisor().await;
        self.teardown_link();
        self.set_state(ConnectionState::Connecting);
        tracing::info!(
            client_id = %self.inner.config.client_id,
            endpoint = %self.inner.config.signing.host,
            "connecting"
        );

        let attempt = async {
            let credentials = self.inner.credentials.credentials().await?;
            self.establish(&credentials).await
        };
        match attempt.await {
            Ok(reader) => {
                let supervisor = tokio::spawn(self.clone().supervise(reader));
                self.shared().supervisor = Some(supervisor);
                Ok(())
            }
            Err(e) => {
                self.teardown_link();
                self.set_state(ConnectionState::Disconnected);
                tracing::warn!(error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Stop background tasks, say goodbye to the broker and drop the link.
    pub async fn disconnect(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.stop_supervisor().await;

        if self.state().is_connected() {
            if let Err(e) = self.write(Packet::Disconnect).await {
                tracing::debug!(error = %e, "DISCONNECT not delivered");
            }
        }
        self.teardown_link();
        self.shared().stats.connected_since = None;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(client_id = %self.inner.config.client_id, "disconnected");
    }

    // ── Lifecycle internals ───────────────────────────────────

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!(from = %current, to = %next, "state change");
            *current = next;
            true
        });
    }

    async fn stop_supervisor(&self) {
        let supervisor = self.shared().supervisor.take();
        if let Some(handle) = supervisor {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Drop the current link. Waiters for acks see `ConnectionLost`.
    fn teardown_link(&self) {
        let mut shared = self.shared();
        if let Some(link) = shared.link.take() {
            link.reader.abort();
        }
        shared.pending_acks.clear();
    }

    /// Sign, open, CONNECT, replay subscriptions, then go `Connected`.
    async fn establish(&self, credentials: &Credentials) -> MqttResult<JoinHandle<()>> {
        let config = &self.inner.config;
        let url = presign_url(&config.signing, credentials, Utc::now());

        let (link, frames, ack) = time::timeout(config.connect_timeout, self.handshake(&url))
            .await
            .map_err(|_| {
                MqttError::Transport(format!("no CONNACK within {:?}", config.connect_timeout))
            })??;
        match ack.code {
            ConnectReturnCode::Accepted => {}
            code if code.is_auth_failure() => {
                return Err(MqttError::AuthenticationExpired(code.to_string()));
            }
            code => return Err(MqttError::ConnectionRefused(code)),
        }

        let Link { tx, rx } = link;
        let reader = tokio::spawn(self.clone().read_loop(rx, frames));
        {
            let mut shared = self.shared();
            shared.link = Some(LinkHandle {
                writer: tx,
                reader: reader.abort_handle(),
            });
            shared.last_pong = Some(Instant::now());
        }

        let mut replayed: Vec<(String, QoS)> = Vec::new();
        loop {
            // `subscribe` registers under the same lock, so a filter added
            // mid-replay is either picked up here or sent by its caller.
            let missing: Vec<(String, QoS)> = {
                let mut shared = self.shared();
                let missing: Vec<_> = shared
                    .subscriptions
                    .iter()
                    .filter(|sub| !replayed.contains(sub))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    shared.stats.connected_since = Some(Utc::now());
                    shared.last_pong = Some(Instant::now());
                    self.set_state(ConnectionState::Connected);
                    break;
                }
                missing
            };
            for (filter, qos) in missing {
                if let Err(e) = self.send_subscribe(&filter, qos).await {
                    self.teardown_link();
                    return Err(e);
                }
                replayed.push((filter, qos));
            }
        }
        tracing::debug!(count = replayed.len(), "subscriptions replayed");
        tracing::info!(client_id = %self.inner.config.client_id, "connected");
        Ok(reader)
    }

    async fn handshake(&self, url: &str) -> MqttResult<(Link, FrameBuffer, Connack)> {
        let config = &self.inner.config;
        let mut link = self.inner.connector.open(url).await?;
        let connect = Connect::new(
            config.client_id.clone(),
            config.keep_alive,
            config.clean_session,
        );
        link.tx
            .send(Packet::Connect(connect).encode()?)
            .await
            .map_err(|_| MqttError::Transport("link closed before CONNECT".into()))?;

        let mut frames = FrameBuffer::new();
        loop {
            if let Some(packet) = frames.next_packet()? {
                return match packet {
                    Packet::Connack(ack) => Ok((link, frames, ack)),
                    other => Err(CodecError::Malformed {
                        packet: "connack",
                        reason: format!("expected CONNACK, got {:?}", other.packet_type()),
                    }
                    .into()),
                };
            }
            let bytes = link
                .rx
                .recv()
                .await
                .ok_or_else(|| MqttError::Transport("link closed before CONNACK".into()))?;
            frames.extend(&bytes);
        }
    }

    // ── Background tasks ──────────────────────────────────────

    async fn read_loop(self, mut rx: mpsc::Receiver<Vec<u8>>, mut frames: FrameBuffer) {
        loop {
            loop {
                match frames.next_packet() {
                    Ok(Some(packet)) => self.handle_packet(packet).await,
                    Ok(None) => break,
                    Err(e @ CodecError::RemainingLengthOverflow) => {
                        tracing::warn!(error = %e, "unrecoverable framing error, dropping link");
                        return;
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping malformed packet"),
                }
            }
            match rx.recv().await {
                Some(bytes) => frames.extend(&bytes),
                None => {
                    tracing::debug!("link closed by peer");
                    return;
                }
            }
        }
    }

    async fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::Publish(publish) => {
                if let (QoS::AtLeastOnce, Some(id)) = (publish.qos, publish.packet_id) {
                    if let Err(e) = self.write(Packet::Puback(id)).await {
                        tracing::debug!(error = %e, packet_id = id, "PUBACK not sent");
                    }
                }
                self.shared().stats.messages_received += 1;
                tracing::trace!(topic = %publish.topic, bytes = publish.payload.len(), "inbound publish");
                // No receivers is fine; nobody is listening yet.
                let _ = self
                    .inner
                    .messages
                    .send(InboundMessage::new(publish.topic, publish.payload));
            }
            Packet::Puback(id) => self.resolve_ack(id, Ack::Puback),
            Packet::Suback(suback) => self.resolve_ack(suback.packet_id, Ack::Suback(suback.codes)),
            Packet::Pingresp => self.shared().last_pong = Some(Instant::now()),
            other => tracing::debug!(packet = ?other.packet_type(), "ignoring unexpected packet"),
        }
    }

    /// Watches the link until it dies, then reconnects with backoff.
    /// Ends in `Failed` when retries run out.
    async fn supervise(self, mut reader: JoinHandle<()>) {
        let mut backoff = Backoff::new(self.inner.config.backoff.clone());
        loop {
            self.monitor_link(&mut reader).await;
            self.teardown_link();
            {
                let mut shared = self.shared();
                shared.stats.reconnection_count += 1;
                shared.stats.connected_since = None;
            }
            self.set_state(ConnectionState::Reconnecting);
            tracing::warn!(client_id = %self.inner.config.client_id, "connection lost, reconnecting");

            reader = match self.reconnect(&mut backoff).await {
                Ok(reader) => reader,
                Err(e) => {
                    tracing::error!(error = %e, "giving up on reconnect");
                    self.set_state(ConnectionState::Failed);
                    return;
                }
            };
            backoff.reset();
        }
    }

    async fn monitor_link(&self, reader: &mut JoinHandle<()>) {
        let interval = self.inner.config.health_check_interval;
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = &mut *reader => return,
                _ = ticker.tick() => {
                    let last_pong = self.shared().last_pong;
                    if last_pong.is_some_and(|at| at.elapsed() > interval * 2) {
                        tracing::warn!("no PINGRESP within two health-check intervals");
                        return;
                    }
                    if let Err(e) = self.write(Packet::Pingreq).await {
                        tracing::warn!(error = %e, "health-check ping failed");
                        return;
                    }
                }
            }
        }
    }

    async fn reconnect(&self, backoff: &mut Backoff) -> MqttResult<JoinHandle<()>> {
        let mut rejected: Option<(Credentials, MqttError)> = None;
        loop {
            let delay = backoff.next_sleep()?;
            let attempt = backoff.attempt();
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            time::sleep(delay).await;

            let credentials = match self.inner.credentials.credentials().await {
                Ok(credentials) => credentials,
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "credential refresh failed");
                    continue;
                }
            };
            if let Some((previous, error)) = &rejected {
                if *previous == credentials {
                    tracing::error!(attempt, "provider returned credentials the broker already rejected");
                    return Err(error.clone());
                }
            }
            match self.establish(&credentials).await {
                Ok(reader) => {
                    tracing::info!(attempt, "reconnected");
                    return Ok(reader);
                }
                Err(e) if e.is_auth() => {
                    self.teardown_link();
                    tracing::warn!(error = %e, attempt, "broker rejected credentials");
                    rejected = Some((credentials, e));
                }
                Err(e) => {
                    self.teardown_link();
                    tracing::warn!(error = %e, attempt, "reconnect attempt failed");
                }
            }
        }
    }

    // ── Packet I/O ────────────────────────────────────────────

    async fn write(&self, packet: Packet) -> MqttResult<()> {
        let bytes = packet.encode()?;
        let writer = self.shared().link.as_ref().map(|link| link.writer.clone());
        let Some(writer) = writer else {
            return Err(MqttError::NotConnected(self.state()));
        };
        writer
            .send(bytes)
            .await
            .map_err(|_| MqttError::ConnectionLost)
    }

    fn request_ack(&self) -> (u16, oneshot::Receiver<Ack>) {
        let (tx, rx) = oneshot::channel();
        let mut shared = self.shared();
        let id = shared.packet_ids.next_id();
        shared.pending_acks.insert(id, tx);
        (id, rx)
    }

    fn forget_ack(&self, id: u16) {
        self.shared().pending_acks.remove(&id);
    }

    fn resolve_ack(&self, id: u16, ack: Ack) {
        let waiter = self.shared().pending_acks.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(ack);
            }
            None => tracing::debug!(packet_id = id, "ack for unknown packet id"),
        }
    }

    async fn wait_ack(&self, id: u16, rx: oneshot::Receiver<Ack>) -> Result<Ack, AckWait> {
        match time::timeout(self.inner.config.operation_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(AckWait::Lost),
            Err(_) => {
                self.forget_ack(id);
                Err(AckWait::TimedOut)
            }
        }
    }

    async fn send_subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()> {
        let (id, rx) = self.request_ack();
        let packet = Packet::Subscribe(Subscribe {
            packet_id: id,
            filters: vec![(filter.to_string(), qos)],
        });
        if let Err(e) = self.write(packet).await {
            self.forget_ack(id);
            return Err(e);
        }
        match self.wait_ack(id, rx).await {
            Ok(Ack::Suback(codes)) if codes.is_empty() || codes.contains(&SubackCode::Failure) => Err(
                MqttError::SubscriptionFailure(format!("{filter}: rejected by broker")),
            ),
            Ok(_) => {
                tracing::debug!(filter, ?qos, "subscribed");
                Ok(())
            }
            Err(AckWait::Lost) => Err(MqttError::ConnectionLost),
            Err(AckWait::TimedOut) => Err(MqttError::SubscriptionFailure(format!(
                "{filter}: no SUBACK within {:?}",
                self.inner.config.operation_timeout
            ))),
        }
    }

    /// Record `filter` and report whether the link is already `Connected`.
    fn register_subscription(&self, filter: &str, qos: QoS) -> bool {
        let mut shared = self.shared();
        match shared.subscriptions.iter_mut().find(|(f, _)| f == filter) {
            Some(existing) => existing.1 = qos,
            None => shared.subscriptions.push((filter.to_string(), qos)),
        }
        self.state().is_connected()
    }
}

#[async_trait]
impl Channel for Session {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        let state = self.state();
        if !state.is_connected() {
            return Err(MqttError::NotConnected(state));
        }

        let mut publish = Publish::new(topic, qos, payload.to_vec());
        match qos {
            QoS::AtMostOnce => {
                self.write(Packet::Publish(publish)).await?;
                self.shared().stats.messages_sent += 1;
                Ok(())
            }
            QoS::AtLeastOnce => {
                let (id, rx) = self.request_ack();
                publish.packet_id = Some(id);
                if let Err(e) = self.write(Packet::Publish(publish)).await {
                    self.forget_ack(id);
                    return Err(e);
                }
                self.shared().stats.messages_sent += 1;
                match self.wait_ack(id, rx).await {
                    Ok(_) => Ok(()),
                    Err(AckWait::Lost) => Err(MqttError::ConnectionLost),
                    Err(AckWait::TimedOut) => Err(MqttError::Transport(format!(
                        "no PUBACK for packet {id} within {:?}",
                        self.inner.config.operation_timeout
                    ))),
                }
            }
            QoS::ExactlyOnce => Err(MqttError::Other("QoS 2 publishing is not supported".into())),
        }
    }

    /// Register `filter`; when connected it is also subscribed right away.
    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()> {
        if self.register_subscription(filter, qos) {
            self.send_subscribe(filter, qos).await?;
        }
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }
}
