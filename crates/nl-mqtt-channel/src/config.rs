use std::time::Duration;

use serde::Deserialize;

use crate::sigv4::SigningParams;

/// MQTT connection configuration, loadable from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// AWS IoT data endpoint hosting the NaviLink gateway.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// MQTT client ID. A fresh UUID is used when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Keep-alive interval in seconds, sent in CONNECT.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Deadline for the WebSocket upgrade plus CONNACK.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Deadline for SUBACK and PUBACK.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub reconnect: BackoffConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            region: default_region(),
            client_id: None,
            keepalive_secs: default_keepalive(),
            clean_session: default_clean_session(),
            connect_timeout_secs: default_connect_timeout(),
            operation_timeout_secs: default_operation_timeout(),
            health_check_interval_secs: default_health_check_interval(),
            reconnect: BackoffConfig::default(),
        }
    }
}

impl MqttConfig {
    pub fn session_config(&self) -> SessionConfig {
        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        SessionConfig {
            signing: SigningParams::iot(&self.endpoint, &self.region),
            client_id,
            keep_alive: self.keepalive_secs,
            clean_session: self.clean_session,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            backoff: self.reconnect.clone(),
        }
    }
}

/// Reconnect policy: `delay = min(initial * multiplier^(attempt-1), max)`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Scale each delay by a random factor in [0.5, 1.5].
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Resolved settings for one `Session`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub signing: SigningParams,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub health_check_interval: Duration,
    pub backoff: BackoffConfig,
}

impl SessionConfig {
    pub fn new(signing: SigningParams, client_id: impl Into<String>) -> Self {
        Self {
            signing,
            client_id: client_id.into(),
            keep_alive: default_keepalive(),
            clean_session: default_clean_session(),
            connect_timeout: Duration::from_secs(default_connect_timeout()),
            operation_timeout: Duration::from_secs(default_operation_timeout()),
            health_check_interval: Duration::from_secs(default_health_check_interval()),
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_endpoint() -> String {
    "a1t30mldyslmuq-ats.iot.us-east-1.amazonaws.com".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_keepalive() -> u16 {
    30
}

fn default_clean_session() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_operation_timeout() -> u64 {
    10
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    20
}

fn default_initial_delay() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    120.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}
