//! Monitor configuration, loadable from TOML.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use nl_mqtt_channel::{Credentials, MqttConfig};
use nl_protocol::device::DeviceInfo;
use nl_protocol::telemetry::OperationModeTable;

use crate::poller::PollerConfig;

/// Top-level configuration for the monitor binary.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Water heater to talk to.
    pub device: DeviceInfo,
    /// Static AWS credentials. A real deployment obtains these from the
    /// account login flow and refreshes them before they expire.
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// Seconds between fire-and-forget status polls.
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
    /// Consecutive poll failures before the poller gives up.
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,
    /// Deadline for a correlated command reply.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Overrides for the operation-mode names, keyed by code.
    #[serde(default)]
    pub operation_modes: BTreeMap<String, String>,
}

#[derive(Clone, Deserialize)]
pub struct CredentialsConfig {
    pub access_key_id: String,
    pub secret_key: String,
    #[serde(default)]
    pub session_token: String,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl From<&CredentialsConfig> for Credentials {
    fn from(config: &CredentialsConfig) -> Self {
        Credentials::new(
            &config.access_key_id,
            &config.secret_key,
            &config.session_token,
        )
    }
}

fn default_polling_interval() -> u64 {
    15
}

fn default_max_poll_errors() -> u32 {
    10
}

fn default_command_timeout() -> u64 {
    10
}

impl MonitorConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing config {path}"))?;
        Ok(config)
    }

    /// Built-in operation modes with the configured overrides applied.
    pub fn mode_table(&self) -> anyhow::Result<OperationModeTable> {
        let overrides = OperationModeTable::from_str_pairs(&self.operation_modes)?;
        Ok(OperationModeTable::default().merged(&overrides))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(self.polling_interval_secs),
            max_errors: self.max_poll_errors,
            ..PollerConfig::default()
        }
    }
}
