//! Status decoding: vendor payloads into normalized `TelemetrySample`s.
//!
//! Accepted payload shapes, tried in order:
//! ```text
//! {"response": {"status": {...}}}
//! {"response": {"channelStatus": {"channel": {...}}}}
//! {"response": {...}}
//! {"status": {...}}
//! {...}
//! ```
//!
//! Unit conversions:
//! - DHW temperatures: raw + 20 °F calibration offset
//! - tank / refrigerant sensors: tenths of °F
//! - ambient sensor: tenths of °C, reported in °F

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::status::{ChannelStatus, DeviceStatus};

/// Offset between raw DHW registers and the temperature shown in the app.
pub const TEMPERATURE_CALIBRATION_OFFSET: i64 = 20;

pub fn calibrate_from_raw(raw: i64) -> f64 {
    raw.saturating_add(TEMPERATURE_CALIBRATION_OFFSET) as f64
}

pub fn calibrate_to_raw(display: f64) -> i64 {
    (display.round() as i64).saturating_sub(TEMPERATURE_CALIBRATION_OFFSET)
}

pub fn tenths(raw: i64) -> f64 {
    raw as f64 / 10.0
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ─── Operation modes ───

/// Decoded operation-mode register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationMode {
    Known { code: i64, name: String },
    /// Code absent from the mode table; never guessed.
    Unknown(i64),
}

impl OperationMode {
    pub fn code(&self) -> i64 {
        match self {
            Self::Known { code, .. } | Self::Unknown(code) => *code,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known { .. })
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known { name, .. } => f.write_str(name),
            Self::Unknown(code) => write!(f, "unknown_{code}"),
        }
    }
}

impl Serialize for OperationMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Mapping from operation-mode register values to names.
///
/// The codes were learned from observed traffic and vary between hardware
/// revisions, so the table is data rather than an enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationModeTable {
    names: BTreeMap<i64, String>,
}

impl OperationModeTable {
    pub fn new(names: BTreeMap<i64, String>) -> Self {
        Self { names }
    }

    /// Build from string keys, as found in TOML tables.
    pub fn from_str_pairs<'a, I>(pairs: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut names = BTreeMap::new();
        for (key, name) in pairs {
            let code = key
                .trim()
                .parse::<i64>()
                .map_err(|_| ProtocolError::InvalidModeTable(format!("bad code {key:?}")))?;
            if name.is_empty() {
                return Err(ProtocolError::InvalidModeTable(format!(
                    "empty name for code {code}"
                )));
            }
            names.insert(code, name.clone());
        }
        Ok(Self { names })
    }

    /// Overlay `other` on top of this table.
    pub fn merged(mut self, other: &OperationModeTable) -> Self {
        for (code, name) in &other.names {
            self.names.insert(*code, name.clone());
        }
        self
    }

    pub fn lookup(&self, code: i64) -> OperationMode {
        match self.names.get(&code) {
            Some(name) => OperationMode::Known {
                code,
                name: name.clone(),
            },
            None => OperationMode::Unknown(code),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for OperationModeTable {
    fn default() -> Self {
        let names = [
            (0, "standby"),
            (32, "heat_pump_active"),
            (33, "electric_backup"),
            (34, "hybrid_mode"),
        ]
        .into_iter()
        .map(|(c, n)| (c, n.to_string()))
        .collect();
        Self { names }
    }
}

// ─── Component status ───

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Off,
    Ready,
    Active,
    Unknown,
}

impl ComponentStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Off,
            1 => Self::Ready,
            2 => Self::Active,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Unknown => "unknown",
        }
    }
}

// ─── Telemetry sample ───

/// Normalized snapshot of a device status reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    /// Tank charge, percent.
    pub dhw_charge_per: i64,
    pub wifi_rssi: i64,
    pub operation_mode: OperationMode,
    pub error_code: i64,
    pub sub_error_code: i64,
    /// Calibrated outlet temperature, °F.
    pub dhw_temperature: f64,
    pub dhw_temperature_setting: f64,
    pub dhw_target_temperature_setting: f64,
    pub tank_upper_temperature: f64,
    pub tank_lower_temperature: f64,
    pub discharge_temperature: f64,
    pub suction_temperature: f64,
    pub evaporator_temperature: f64,
    /// Ambient air, °F.
    pub ambient_temperature: f64,
    /// Instantaneous draw, watts.
    pub current_inst_power: i64,
    pub heat_pump_status: i64,
    pub resistance_heater_status: i64,
    pub defrost_mode: i64,
    pub compressor: ComponentStatus,
    pub upper_element: ComponentStatus,
    pub lower_element: ComponentStatus,
    pub eco_use: i64,
    /// The undecoded record, for registers not promoted above.
    pub raw: DeviceStatus,
    pub captured_at: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn has_error(&self) -> bool {
        self.error_code != 0
    }
}

// ─── Decoder ───

/// Which layout a payload uses.
#[derive(Debug, Clone, Copy, PartialEq)]
enum StatusBody<'a> {
    Registers(&'a Value),
    Channel(&'a Value),
}

fn locate(payload: &Value) -> StatusBody<'_> {
    let body = payload.get("response").unwrap_or(payload);
    if let Some(channel) = body.get("channelStatus") {
        return StatusBody::Channel(channel.get("channel").unwrap_or(channel));
    }
    StatusBody::Registers(body.get("status").unwrap_or(body))
}

/// Whether a reply body carries a status snapshot worth decoding.
pub fn carries_status(payload: &Value) -> bool {
    let body = payload.get("response").unwrap_or(payload);
    body.get("status").is_some() || body.get("channelStatus").is_some()
}

/// Stateless status decoder parameterized by the operation-mode table.
#[derive(Debug, Clone, Default)]
pub struct StatusDecoder {
    modes: OperationModeTable,
}

impl StatusDecoder {
    pub fn new(modes: OperationModeTable) -> Self {
        Self { modes }
    }

    pub fn modes(&self) -> &OperationModeTable {
        &self.modes
    }

    pub fn decode_slice(&self, payload: &[u8]) -> Result<TelemetrySample, ProtocolError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        self.decode(&value)
    }

    pub fn decode(&self, payload: &Value) -> Result<TelemetrySample, ProtocolError> {
        let (status, defrost_mode) = match locate(payload) {
            StatusBody::Registers(v) => (parse_registers(v)?, 0),
            StatusBody::Channel(v) => {
                let channel: ChannelStatus = serde_json::from_value(v.clone())
                    .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
                (channel.to_device_status(), i64::from(channel.defrost_mode))
            }
        };
        Ok(self.sample(status, defrost_mode))
    }

    /// Normalize an already-parsed register record.
    pub fn from_status(&self, status: DeviceStatus) -> TelemetrySample {
        self.sample(status, 0)
    }

    fn sample(&self, status: DeviceStatus, defrost_mode: i64) -> TelemetrySample {
        TelemetrySample {
            dhw_charge_per: status.dhw_charge_per,
            wifi_rssi: status.wifi_rssi,
            operation_mode: self.modes.lookup(status.operation_mode),
            error_code: status.error_code,
            sub_error_code: status.sub_error_code,
            dhw_temperature: calibrate_from_raw(status.dhw_temperature),
            dhw_temperature_setting: calibrate_from_raw(status.dhw_temperature_setting),
            dhw_target_temperature_setting: calibrate_from_raw(
                status.dhw_target_temperature_setting,
            ),
            tank_upper_temperature: tenths(status.tank_upper_temperature),
            tank_lower_temperature: tenths(status.tank_lower_temperature),
            discharge_temperature: tenths(status.discharge_temperature),
            suction_temperature: tenths(status.suction_temperature),
            evaporator_temperature: tenths(status.evaporator_temperature),
            ambient_temperature: round1(celsius_to_fahrenheit(tenths(
                status.ambient_temperature,
            ))),
            current_inst_power: status.current_inst_power,
            heat_pump_status: status.comp_use,
            resistance_heater_status: status.heat_upper_use.max(status.heat_lower_use),
            defrost_mode,
            compressor: ComponentStatus::from_code(status.comp_use),
            upper_element: ComponentStatus::from_code(status.heat_upper_use),
            lower_element: ComponentStatus::from_code(status.heat_lower_use),
            eco_use: status.eco_use,
            raw: status,
            captured_at: Utc::now(),
        }
    }
}

fn parse_registers(value: &Value) -> Result<DeviceStatus, ProtocolError> {
    if !value.is_object() {
        return Err(ProtocolError::InvalidPayload(
            "status body is not an object".into(),
        ));
    }
    serde_json::from_value(value.clone()).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}
