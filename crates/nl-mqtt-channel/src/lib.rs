//! MQTT session layer for the NaviLink cloud gateway (AWS IoT Core).
//!
//! Provides everything between a device command and the wire:
//! - `sigv4` presigned WebSocket URLs
//! - `codec` for MQTT 3.1.1 packets
//! - `Session`, a self-healing connection with subscription replay
//! - `Correlator`, matching device replies to in-flight commands
//! - `Channel` trait plus `MockChannel` / `MockBroker` for tests

pub mod backoff;
pub mod channel;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod handler;
pub mod mock;
pub mod session;
pub mod sigv4;
pub mod state;
pub mod transport;

// Re-exports for convenience.
pub use channel::{Channel, InboundMessage, publish_json};
pub use codec::QoS;
pub use config::{BackoffConfig, MqttConfig, SessionConfig};
pub use correlator::Correlator;
pub use error::{MqttError, MqttResult};
pub use handler::{IncomingMessage, classify};
pub use mock::{MockBroker, MockChannel};
pub use session::{CredentialProvider, Session, StaticCredentials, Statistics};
pub use sigv4::{Credentials, SigningParams, presign_url};
pub use state::ConnectionState;
pub use transport::{Connector, Link, WebSocketConnector};
