use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceInfo;
use crate::error::ProtocolError;
use crate::topics;

/// Payload schema version spoken by the NaviLink gateway.
pub const PROTOCOL_VERSION: u32 = 2;

pub const CMD_GET_DEVICE_INFO: u32 = 16_777_217;
pub const CMD_GET_STATUS: u32 = 16_777_219;
pub const CMD_GET_RESERVATIONS: u32 = 16_777_222;
pub const CMD_SET_DHW_MODE: u32 = 33_554_437;
pub const CMD_SET_DHW_TEMPERATURE: u32 = 33_554_438;

/// Accepted DHW set-point range in °F.
pub const DHW_TEMPERATURE_MIN: i64 = 70;
pub const DHW_TEMPERATURE_MAX: i64 = 131;

/// Generate a fresh per-request correlation id.
pub fn new_session_id() -> String {
    Uuid::now_v7().to_string()
}

// ─── DHW modes ───

/// Domestic hot water operating mode accepted by the `dhw-mode` control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DhwMode {
    HeatPump,
    Hybrid,
    Electric,
    EnergySaver,
    HighDemand,
}

impl DhwMode {
    pub fn code(self) -> i64 {
        match self {
            Self::HeatPump => 2,
            Self::Hybrid => 3,
            Self::Electric => 4,
            Self::EnergySaver => 5,
            Self::HighDemand => 6,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, ProtocolError> {
        match code {
            2 => Ok(Self::HeatPump),
            3 => Ok(Self::Hybrid),
            4 => Ok(Self::Electric),
            5 => Ok(Self::EnergySaver),
            6 => Ok(Self::HighDemand),
            other => Err(ProtocolError::OutOfRange {
                field: "dhw mode",
                value: other,
                expected: "2-6".into(),
            }),
        }
    }
}

// ─── Typed requests ───

/// Control parameters carried by `ctrl` commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlParams {
    pub mode: String,
    pub param: Vec<i64>,
    pub param_str: String,
}

/// A typed command submitted to the correlator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: u32,
    /// Suffix below the device command base, e.g. `st` or `rsv/rd`.
    pub topic_suffix: String,
    /// Reply suffix below the response base. `None` uses the last
    /// segment of `topic_suffix`, `Some("")` the base itself.
    pub response_suffix: Option<String>,
    pub control: Option<ControlParams>,
}

impl CommandRequest {
    pub fn new(command: u32, topic_suffix: impl Into<String>) -> Self {
        Self {
            command,
            topic_suffix: topic_suffix.into(),
            response_suffix: None,
            control: None,
        }
    }

    pub fn with_response_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.response_suffix = Some(suffix.into());
        self
    }

    pub fn get_device_info() -> Self {
        Self::new(CMD_GET_DEVICE_INFO, "status/start").with_response_suffix("channelinfo")
    }

    pub fn get_status() -> Self {
        Self::new(CMD_GET_STATUS, "st")
    }

    pub fn get_reservations() -> Self {
        Self::new(CMD_GET_RESERVATIONS, "rsv/rd")
    }

    /// Set the DHW target temperature (°F).
    pub fn set_dhw_temperature(temperature: i64) -> Result<Self, ProtocolError> {
        if !(DHW_TEMPERATURE_MIN..=DHW_TEMPERATURE_MAX).contains(&temperature) {
            return Err(ProtocolError::OutOfRange {
                field: "dhw temperature",
                value: temperature,
                expected: format!("{DHW_TEMPERATURE_MIN}-{DHW_TEMPERATURE_MAX}"),
            });
        }
        Ok(Self::control(
            CMD_SET_DHW_TEMPERATURE,
            "dhw-temp-setting",
            temperature,
        ))
    }

    pub fn set_dhw_mode(mode: DhwMode) -> Self {
        Self::control(CMD_SET_DHW_MODE, "dhw-mode", mode.code())
    }

    fn control(command: u32, mode: &str, value: i64) -> Self {
        Self {
            command,
            topic_suffix: "ctrl".into(),
            response_suffix: Some(String::new()),
            control: Some(ControlParams {
                mode: mode.into(),
                param: vec![value],
                param_str: String::new(),
            }),
        }
    }

    pub fn effective_response_suffix(&self) -> &str {
        match &self.response_suffix {
            Some(s) => s,
            None => topics::default_response_suffix(&self.topic_suffix),
        }
    }
}

// ─── Wire payloads ───

/// Inner `request` object of a command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    pub additional_value: String,
    pub command: u32,
    pub device_type: u32,
    pub mac_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_str: Option<String>,
}

/// Request/response command published to the device command topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    pub request: RequestBody,
    #[serde(rename = "requestTopic")]
    pub request_topic: String,
    #[serde(rename = "responseTopic")]
    pub response_topic: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
}

impl CommandEnvelope {
    pub fn new(
        device: &DeviceInfo,
        client_id: impl Into<String>,
        session_id: impl Into<String>,
        request: &CommandRequest,
        request_topic: impl Into<String>,
        response_topic: impl Into<String>,
    ) -> Self {
        let control = request.control.as_ref();
        Self {
            client_id: client_id.into(),
            protocol_version: PROTOCOL_VERSION,
            request: RequestBody {
                additional_value: device.additional_value.clone(),
                command: request.command,
                device_type: device.device_type,
                mac_address: device.mac_address.clone(),
                mode: control.map(|c| c.mode.clone()),
                param: control.map(|c| c.param.clone()),
                param_str: control.map(|c| c.param_str.clone()),
            },
            request_topic: request_topic.into(),
            response_topic: response_topic.into(),
            session_id: session_id.into(),
        }
    }
}

/// Channel selector in a status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSelector {
    pub channel_number: u32,
    pub unit_number_end: u32,
    pub unit_number_start: u32,
}

impl Default for ChannelSelector {
    fn default() -> Self {
        Self {
            channel_number: 1,
            unit_number_end: 1,
            unit_number_start: 1,
        }
    }
}

/// Fire-and-forget status poll. The reply arrives as a push update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPoll {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub command: u32,
    pub status: ChannelSelector,
}

impl StatusPoll {
    pub fn new(device: &DeviceInfo, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            session_id: new_session_id(),
            device_id: device.poll_device_id().to_string(),
            command: CMD_GET_STATUS,
            status: ChannelSelector::default(),
        }
    }
}

/// Reply published by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    /// Correlation id, if the reply carries one. Numeric ids are
    /// normalized to their decimal string.
    pub session_id: Option<String>,
    /// The `response` object, or `Null` when absent.
    pub response: serde_json::Value,
}

impl ResponseEnvelope {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: serde_json::Value) -> Result<Self, ProtocolError> {
        let Some(obj) = value.as_object_mut() else {
            return Err(ProtocolError::InvalidPayload(
                "reply is not a JSON object".into(),
            ));
        };
        let session_id = match obj.get("sessionID") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let response = obj
            .remove("response")
            .unwrap_or(serde_json::Value::Null);
        Ok(Self {
            session_id,
            response,
        })
    }
}
