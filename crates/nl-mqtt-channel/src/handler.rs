//! Inbound message classification.
//!
//! Turns raw publishes from the session into typed `IncomingMessage`
//! variants so consumers can dispatch without topic string matching.

use nl_protocol::commands::ResponseEnvelope;
use nl_protocol::telemetry::carries_status;
use nl_protocol::topics::{self, ParsedTopic};

use crate::channel::InboundMessage;

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Device reply carrying a status snapshot (solicited or pushed).
    Status {
        topic: ParsedTopic,
        envelope: ResponseEnvelope,
    },
    /// Any other device reply.
    Reply {
        topic: ParsedTopic,
        envelope: ResponseEnvelope,
    },
    /// Unrecognized topic or payload.
    Unknown { topic: String, payload: Vec<u8> },
}

impl IncomingMessage {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Status { envelope, .. } | Self::Reply { envelope, .. } => {
                envelope.session_id.as_deref()
            }
            Self::Unknown { .. } => None,
        }
    }
}

/// Classify a raw publish.
///
/// Only reply topics are considered: the client-session reply tree and
/// the device-wide `.../res` topic. Command topics echoed back by the
/// broker are `Unknown`.
pub fn classify(message: &InboundMessage) -> IncomingMessage {
    let unknown = || IncomingMessage::Unknown {
        topic: message.topic.clone(),
        payload: message.payload.clone(),
    };

    let Some(parsed) = topics::parse_topic(&message.topic) else {
        return unknown();
    };
    let is_reply = match &parsed {
        ParsedTopic::Response { .. } => true,
        ParsedTopic::Command { suffix, .. } => suffix == "res" || suffix.starts_with("res/"),
    };
    if !is_reply {
        return unknown();
    }

    match ResponseEnvelope::parse(&message.payload) {
        Ok(envelope) if carries_status(&envelope.response) => IncomingMessage::Status {
            topic: parsed,
            envelope,
        },
        Ok(envelope) => IncomingMessage::Reply {
            topic: parsed,
            envelope,
        },
        Err(e) => {
            tracing::debug!(topic = %message.topic, error = %e, "unparseable reply");
            unknown()
        }
    }
}
