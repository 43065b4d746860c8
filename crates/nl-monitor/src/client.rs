//! Typed device commands on top of the correlator.
//!
//! `DeviceClient` turns each NaviLink operation into one correlated
//! request and decodes the reply into a domain type.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use nl_mqtt_channel::{Channel, Correlator, MqttError};
use nl_protocol::commands::{CommandRequest, DhwMode};
use nl_protocol::device::{Reservation, parse_reservations};
use nl_protocol::error::ProtocolError;
use nl_protocol::telemetry::{StatusDecoder, TelemetrySample, carries_status};

/// Errors returned by `DeviceClient` operations.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Mqtt(#[from] MqttError),

    #[error("unexpected reply: {0}")]
    Protocol(#[from] ProtocolError),

    /// Rejected locally, nothing was sent.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Request/response operations against one water heater.
pub struct DeviceClient<C: Channel + ?Sized> {
    correlator: Arc<Correlator<C>>,
    decoder: StatusDecoder,
    timeout: Duration,
    last_sample: Mutex<Option<TelemetrySample>>,
}

impl<C: Channel + ?Sized> DeviceClient<C> {
    pub fn new(correlator: Arc<Correlator<C>>, decoder: StatusDecoder, timeout: Duration) -> Self {
        Self {
            correlator,
            decoder,
            timeout,
            last_sample: Mutex::new(None),
        }
    }

    pub fn correlator(&self) -> &Arc<Correlator<C>> {
        &self.correlator
    }

    pub fn decoder(&self) -> &StatusDecoder {
        &self.decoder
    }

    /// Most recent sample returned by [`get_status`](Self::get_status).
    pub fn last_sample(&self) -> Option<TelemetrySample> {
        self.last_sample
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Channel and feature information (`status/start`).
    pub async fn get_device_info(&self) -> Result<Value, CommandError> {
        self.send(&CommandRequest::get_device_info()).await
    }

    /// Request a status snapshot and decode it.
    pub async fn get_status(&self) -> Result<TelemetrySample, CommandError> {
        let response = self.send(&CommandRequest::get_status()).await?;
        if !carries_status(&response) {
            return Err(ProtocolError::InvalidPayload("reply carries no status".into()).into());
        }
        let sample = self.decoder.decode(&response)?;
        tracing::debug!(
            charge = sample.dhw_charge_per,
            mode = %sample.operation_mode,
            "status received"
        );
        *self
            .last_sample
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sample.clone());
        Ok(sample)
    }

    pub async fn get_reservations(&self) -> Result<Vec<Reservation>, CommandError> {
        let response = self.send(&CommandRequest::get_reservations()).await?;
        Ok(parse_reservations(&response))
    }

    /// Set the DHW target temperature in °F.
    pub async fn set_dhw_temperature(&self, temperature: i64) -> Result<Value, CommandError> {
        let request = CommandRequest::set_dhw_temperature(temperature).map_err(invalid)?;
        tracing::info!(temperature, "setting DHW temperature");
        self.send(&request).await
    }

    pub async fn set_dhw_mode(&self, mode: DhwMode) -> Result<Value, CommandError> {
        tracing::info!(?mode, code = mode.code(), "setting DHW mode");
        self.send(&CommandRequest::set_dhw_mode(mode)).await
    }

    /// Like [`set_dhw_mode`](Self::set_dhw_mode), from a raw mode code.
    pub async fn set_dhw_mode_code(&self, code: i64) -> Result<Value, CommandError> {
        let mode = DhwMode::from_code(code).map_err(invalid)?;
        self.set_dhw_mode(mode).await
    }

    /// Switch to hybrid mode.
    pub async fn turn_on(&self) -> Result<Value, CommandError> {
        self.set_dhw_mode(DhwMode::Hybrid).await
    }

    /// Switch to energy saver. The unit has no true off state.
    pub async fn turn_off(&self) -> Result<Value, CommandError> {
        self.set_dhw_mode(DhwMode::EnergySaver).await
    }

    async fn send(&self, request: &CommandRequest) -> Result<Value, CommandError> {
        Ok(self.correlator.send(request, self.timeout).await?)
    }
}

fn invalid(err: ProtocolError) -> CommandError {
    CommandError::InvalidParameter(err.to_string())
}
