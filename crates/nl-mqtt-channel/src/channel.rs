//! Publish/subscribe abstraction shared by the live session and test doubles.

use async_trait::async_trait;
use serde::Serialize;

use crate::codec::QoS;
use crate::error::{MqttError, MqttResult};

// ── Channel trait ─────────────────────────────────────────────

/// Abstraction for MQTT message publishing and subscribing.
///
/// Enables mocking in tests without a real MQTT broker.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Publish a raw payload to a topic.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<()>;

    /// MQTT client id of the underlying connection. Replies are routed
    /// to topics containing it.
    fn client_id(&self) -> &str;
}

/// A PUBLISH received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Serialize `payload` as JSON and publish it.
pub async fn publish_json<C, T>(channel: &C, topic: &str, payload: &T, qos: QoS) -> MqttResult<()>
where
    C: Channel + ?Sized,
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(payload).map_err(|e| MqttError::Serialization(e.to_string()))?;
    channel.publish(topic, &bytes, qos).await
}
