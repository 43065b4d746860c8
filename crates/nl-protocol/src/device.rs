use serde::{Deserialize, Serialize};

/// Registry record for a water heater, as supplied by the account API.
///
/// Every topic the session publishes to or listens on is derived from
/// these fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Controller MAC address, lower-case hex without separators.
    pub mac_address: String,
    /// Numeric device type (52 for NWP500 units).
    pub device_type: u32,
    /// Opaque value echoed back in every request body.
    #[serde(default)]
    pub additional_value: String,
    /// Home (location group) the device is registered under.
    pub home_group_id: String,
    /// Account owning the session.
    pub user_id: String,
    /// Controller serial, used as the device id in status polls when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<String>,
}

impl DeviceInfo {
    /// Identifier used in fire-and-forget status polls.
    pub fn poll_device_id(&self) -> &str {
        self.controller_id.as_deref().unwrap_or(&self.mac_address)
    }
}

/// One entry of the device's reservation (schedule) table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Reservation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurring: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,
}

/// Extract reservations from a `rsv/rd` reply body.
///
/// Entries that fail to deserialize are skipped.
pub fn parse_reservations(response: &serde_json::Value) -> Vec<Reservation> {
    response
        .get("reservation")
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| serde_json::from_value(e.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
