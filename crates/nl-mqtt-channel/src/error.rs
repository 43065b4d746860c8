//! Session-layer error types.

use std::time::Duration;

use thiserror::Error;

use crate::codec::{CodecError, ConnectReturnCode};
use crate::state::ConnectionState;

/// Errors that can occur during MQTT operations.
#[derive(Debug, Clone, Error)]
pub enum MqttError {
    /// Credentials were refused or reported expired; fetch new ones.
    #[error("authentication expired: {0}")]
    AuthenticationExpired(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("connection refused by broker: {0}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("command {session_id} timed out after {timeout:?}")]
    CommandTimeout { session_id: String, timeout: Duration },

    #[error("subscription failed: {0}")]
    SubscriptionFailure(String),

    #[error("gave up after {0} reconnect attempts")]
    MaxRetriesExceeded(u32),

    #[error("connection lost")]
    ConnectionLost,

    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl MqttError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthenticationExpired(_))
    }
}

/// Convenience alias for MQTT results.
pub type MqttResult<T> = Result<T, MqttError>;

impl From<crate::backoff::BackoffError> for MqttError {
    fn from(error: crate::backoff::BackoffError) -> Self {
        match error {
            crate::backoff::BackoffError::Exhausted(attempts) => Self::MaxRetriesExceeded(attempts),
        }
    }
}
