//! Request/response correlation over the shared session.
//!
//! Each command carries a fresh `sessionID`; the device echoes it in its
//! reply. The correlator keeps one pending slot per id and completes it
//! when a reply with that id shows up on any subscribed topic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::{self, Instant};

use nl_protocol::commands::{CommandEnvelope, CommandRequest, ResponseEnvelope, new_session_id};
use nl_protocol::device::DeviceInfo;
use nl_protocol::topics::DeviceTopics;

use crate::channel::{Channel, InboundMessage, publish_json};
use crate::codec::QoS;
use crate::error::{MqttError, MqttResult};
use crate::state::ConnectionState;

struct PendingRequest {
    response_topic: String,
    submitted_at: Instant,
    timeout: Duration,
    slot: oneshot::Sender<MqttResult<Value>>,
}

/// Matches device replies to in-flight commands for one device.
pub struct Correlator<C: Channel + ?Sized> {
    channel: Arc<C>,
    device: DeviceInfo,
    topics: DeviceTopics,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl<C: Channel + ?Sized> Correlator<C> {
    pub fn new(channel: Arc<C>, device: DeviceInfo) -> Self {
        let topics = DeviceTopics::new(&device, channel.client_id());
        Self {
            channel,
            device,
            topics,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// Register the reply filters for this device with the channel.
    pub async fn subscribe(&self) -> MqttResult<()> {
        for filter in self.topics.subscriptions() {
            self.channel.subscribe(&filter, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Publish `request` and wait up to `timeout` for the matching reply.
    ///
    /// Returns the reply's `response` object.
    pub async fn send(&self, request: &CommandRequest, timeout: Duration) -> MqttResult<Value> {
        let deadline = Instant::now() + timeout;
        let session_id = new_session_id();
        let request_topic = self.topics.command(&request.topic_suffix);
        let response_topic = self.topics.response(request.effective_response_suffix());
        let envelope = CommandEnvelope::new(
            &self.device,
            self.channel.client_id(),
            &session_id,
            request,
            &request_topic,
            &response_topic,
        );

        let (slot, result) = oneshot::channel();
        self.pending().insert(
            session_id.clone(),
            PendingRequest {
                response_topic: response_topic.clone(),
                submitted_at: Instant::now(),
                timeout,
                slot,
            },
        );

        // The PUBACK wait counts against the reply deadline.
        let exchange = async {
            publish_json(&*self.channel, &request_topic, &envelope, QoS::AtLeastOnce).await?;
            tracing::debug!(
                session_id = %session_id,
                command = request.command,
                topic = %request_topic,
                response_topic = %response_topic,
                "command sent"
            );
            result.await.unwrap_or(Err(MqttError::ConnectionLost))
        };

        let outcome = time::timeout_at(deadline, exchange).await;
        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                self.pending().remove(&session_id);
                Err(e)
            }
            Err(_) => {
                self.pending().remove(&session_id);
                tracing::warn!(session_id = %session_id, ?timeout, "command timed out");
                Err(MqttError::CommandTimeout {
                    session_id,
                    timeout,
                })
            }
        }
    }

    /// Offer an inbound message to the pending table.
    ///
    /// Returns `true` if it completed a pending request. Messages without
    /// a known `sessionID` are left for other consumers.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> bool {
        let Ok(reply) = ResponseEnvelope::parse(payload) else {
            tracing::trace!(topic, "non-JSON message ignored by correlator");
            return false;
        };
        let Some(session_id) = reply.session_id else {
            return false;
        };
        let pending = self.pending().remove(&session_id);
        let Some(pending) = pending else {
            tracing::debug!(session_id = %session_id, topic, "reply for unknown session");
            return false;
        };
        if pending.response_topic != topic {
            tracing::debug!(
                session_id = %session_id,
                expected = %pending.response_topic,
                topic,
                "reply arrived on an unexpected topic"
            );
        }
        tracing::debug!(
            session_id = %session_id,
            elapsed_ms = pending.submitted_at.elapsed().as_millis() as u64,
            timeout_ms = pending.timeout.as_millis() as u64,
            "reply matched"
        );
        // The caller may have given up already.
        let _ = pending.slot.send(Ok(reply.response));
        true
    }

    /// Resolve every pending request with `ConnectionLost`.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingRequest> = self.pending().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.slot.send(Err(MqttError::ConnectionLost));
        }
        if count > 0 {
            tracing::warn!(count, "failed pending commands after connection loss");
        }
        count
    }

    /// Dispatch loop: feeds inbound messages to the pending table and
    /// fails everything when the session goes down.
    ///
    /// Runs until the message channel closes.
    pub async fn run(
        &self,
        mut messages: broadcast::Receiver<InboundMessage>,
        mut state: watch::Receiver<ConnectionState>,
    ) {
        let mut watching_state = true;
        loop {
            tokio::select! {
                received = messages.recv() => match received {
                    Ok(msg) => {
                        self.handle_message(&msg.topic, &msg.payload);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "correlator lagged behind inbound messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                changed = state.changed(), if watching_state => {
                    if changed.is_err() {
                        watching_state = false;
                        continue;
                    }
                    let current = *state.borrow_and_update();
                    if current.is_down() {
                        self.fail_all();
                    }
                }
            }
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChannel;
    use serde_json::json;

    fn device() -> DeviceInfo {
        DeviceInfo {
            mac_address: "04786332fca0".into(),
            device_type: 52,
            additional_value: "5322".into(),
            home_group_id: "1021".into(),
            user_id: "4471".into(),
            controller_id: None,
        }
    }

    fn correlator() -> Arc<Correlator<MockChannel>> {
        Arc::new(Correlator::new(Arc::new(MockChannel::new()), device()))
    }

    async fn wait_for_publish(correlator: &Correlator<MockChannel>, count: usize) -> Vec<CommandEnvelope> {
        for _ in 0..200 {
            let published = correlator.channel().published();
            if published.len() >= count {
                return published
                    .iter()
                    .map(|m| serde_json::from_slice(&m.payload).unwrap())
                    .collect();
            }
            time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {count} publishes");
    }

    fn reply(session_id: &str, response: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({"sessionID": session_id, "response": response})).unwrap()
    }

    #[tokio::test]
    async fn envelope_uses_device_topics() {
        let c = correlator();
        let task = {
            let c = c.clone();
            tokio::spawn(async move {
                c.send(&CommandRequest::get_status(), Duration::from_secs(1)).await
            })
        };
        let sent = wait_for_publish(&c, 1).await;
        let envelope = &sent[0];
        assert_eq!(envelope.request_topic, "cmd/52/navilink-04786332fca0/st");
        assert_eq!(envelope.response_topic, "cmd/52/1021/4471/mock-client/res/st");
        assert_eq!(envelope.client_id, "mock-client");
        assert_eq!(c.channel().last_published().unwrap().qos, QoS::AtLeastOnce);

        assert!(c.handle_message(&envelope.response_topic, &reply(&envelope.session_id, json!({"ok": 1}))));
        assert_eq!(task.await.unwrap().unwrap(), json!({"ok": 1}));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_resolves_only_matching_request() {
        let c = correlator();
        let first = {
            let c = c.clone();
            tokio::spawn(async move {
                c.send(&CommandRequest::get_status(), Duration::from_millis(200)).await
            })
        };
        let second = {
            let c = c.clone();
            tokio::spawn(async move {
                c.send(&CommandRequest::get_reservations(), Duration::from_secs(1)).await
            })
        };
        let sent = wait_for_publish(&c, 2).await;
        let reservations = sent
            .iter()
            .find(|e| e.request_topic.ends_with("rsv/rd"))
            .unwrap();

        assert!(c.handle_message("any/topic", &reply(&reservations.session_id, json!("rsv"))));
        assert_eq!(second.await.unwrap().unwrap(), json!("rsv"));

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, MqttError::CommandTimeout { .. }));
    }

    #[tokio::test]
    async fn timeout_removes_entry_and_drops_late_reply() {
        let c = correlator();
        let started = std::time::Instant::now();
        let err = c
            .send(&CommandRequest::get_status(), Duration::from_millis(10))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        let MqttError::CommandTimeout { session_id, timeout } = err else {
            panic!("expected timeout, got {err:?}");
        };
        assert_eq!(timeout, Duration::from_millis(10));
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(500));
        assert_eq!(c.pending_count(), 0);

        assert!(!c.handle_message("late", &reply(&session_id, json!({}))));
    }

    #[tokio::test]
    async fn unknown_and_malformed_replies_are_ignored() {
        let c = correlator();
        assert!(!c.handle_message("t", &reply("nobody", json!({}))));
        assert!(!c.handle_message("t", b"not json"));
        assert!(!c.handle_message("t", br#"{"response": {}}"#));
    }

    #[tokio::test]
    async fn fail_all_reports_connection_lost() {
        let c = correlator();
        let task = {
            let c = c.clone();
            tokio::spawn(async move {
                c.send(&CommandRequest::get_status(), Duration::from_secs(5)).await
            })
        };
        wait_for_publish(&c, 1).await;
        assert_eq!(c.fail_all(), 1);
        assert!(matches!(task.await.unwrap(), Err(MqttError::ConnectionLost)));
    }

    #[tokio::test]
    async fn run_dispatches_and_fails_on_disconnect() {
        let c = correlator();
        let (msg_tx, msg_rx) = broadcast::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let runner = {
            let c = c.clone();
            tokio::spawn(async move { c.run(msg_rx, state_rx).await })
        };

        let answered = {
            let c = c.clone();
            tokio::spawn(async move {
                c.send(&CommandRequest::get_status(), Duration::from_secs(5)).await
            })
        };
        let sent = wait_for_publish(&c, 1).await;
        msg_tx
            .send(InboundMessage::new(
                sent[0].response_topic.clone(),
                reply(&sent[0].session_id, json!({"status": {}})),
            ))
            .unwrap();
        assert!(answered.await.unwrap().is_ok());

        let orphaned = {
            let c = c.clone();
            tokio::spawn(async move {
                c.send(&CommandRequest::get_status(), Duration::from_secs(5)).await
            })
        };
        wait_for_publish(&c, 2).await;
        state_tx.send(ConnectionState::Disconnected).unwrap();
        assert!(matches!(orphaned.await.unwrap(), Err(MqttError::ConnectionLost)));

        drop(msg_tx);
        runner.await.unwrap();
    }

    /// Acknowledges every publish only after a fixed delay.
    struct SlowAckChannel {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Channel for SlowAckChannel {
        async fn publish(&self, _topic: &str, _payload: &[u8], _qos: QoS) -> MqttResult<()> {
            time::sleep(self.delay).await;
            Ok(())
        }

        async fn subscribe(&self, _filter: &str, _qos: QoS) -> MqttResult<()> {
            Ok(())
        }

        fn client_id(&self) -> &str {
            "slow-client"
        }
    }

    #[tokio::test]
    async fn slow_puback_counts_against_timeout() {
        let c = Arc::new(Correlator::new(
            Arc::new(SlowAckChannel {
                delay: Duration::from_millis(500),
            }),
            device(),
        ));
        let started = std::time::Instant::now();
        let task = {
            let c = c.clone();
            tokio::spawn(async move {
                c.send(&CommandRequest::get_status(), Duration::from_millis(10)).await
            })
        };

        let err = task.await.unwrap().unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, MqttError::CommandTimeout { .. }));
        assert!(elapsed < Duration::from_millis(200), "took {elapsed:?}");
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn publish_failure_removes_entry() {
        let channel = Arc::new(MockChannel::new());
        channel.fail_publishes(true);
        let c = Correlator::new(channel, device());
        let err = c
            .send(&CommandRequest::get_status(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MqttError::NotConnected(_)));
        assert_eq!(c.pending_count(), 0);
    }
}
