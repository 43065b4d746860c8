//! MQTT topic builders and parsers for the NaviLink topic hierarchy.
//!
//! Topic structure:
//! ```text
//! cmd/{device_type}/navilink-{mac}/{suffix}                               device command
//! cmd/{device_type}/navilink-{mac}/res                                    device-wide replies
//! cmd/{device_type}/{home_group_id}/{user_id}/{client_session}/res        reply base
//! cmd/{device_type}/{home_group_id}/{user_id}/{client_session}/res/{sfx}  scoped reply
//! ```

use crate::device::DeviceInfo;

const PREFIX: &str = "cmd";
const DEVICE_PREFIX: &str = "navilink-";
const RESPONSE_SEGMENT: &str = "res";

// ─── Command topics ───

pub fn command_base(device_type: u32, mac_address: &str) -> String {
    format!("{PREFIX}/{device_type}/{DEVICE_PREFIX}{mac_address}")
}

pub fn command(device_type: u32, mac_address: &str, suffix: &str) -> String {
    format!("{}/{suffix}", command_base(device_type, mac_address))
}

/// Fire-and-forget status poll target.
pub fn status_poll(device_type: u32, mac_address: &str) -> String {
    command(device_type, mac_address, "status/channelstatus")
}

/// Replies addressed to the device topic rather than to a client session.
pub fn device_responses(device_type: u32, mac_address: &str) -> String {
    command(device_type, mac_address, RESPONSE_SEGMENT)
}

// ─── Response topics ───

pub fn response_base(
    device_type: u32,
    home_group_id: &str,
    user_id: &str,
    client_session: &str,
) -> String {
    format!("{PREFIX}/{device_type}/{home_group_id}/{user_id}/{client_session}/{RESPONSE_SEGMENT}")
}

/// Reply topic; an empty suffix addresses the base.
pub fn response(
    device_type: u32,
    home_group_id: &str,
    user_id: &str,
    client_session: &str,
    suffix: &str,
) -> String {
    let base = response_base(device_type, home_group_id, user_id, client_session);
    if suffix.is_empty() {
        base
    } else {
        format!("{base}/{suffix}")
    }
}

/// Wildcard covering the reply base and every suffix below it.
pub fn response_wildcard(
    device_type: u32,
    home_group_id: &str,
    user_id: &str,
    client_session: &str,
) -> String {
    format!(
        "{}/#",
        response_base(device_type, home_group_id, user_id, client_session)
    )
}

/// Reply suffix the device uses when the caller does not name one:
/// the last path segment of the request suffix.
pub fn default_response_suffix(topic_suffix: &str) -> &str {
    topic_suffix.rsplit('/').next().unwrap_or("")
}

// ─── Per-device convenience ───

/// All topics a session needs for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub command_base: String,
    pub response_base: String,
}

impl DeviceTopics {
    pub fn new(device: &DeviceInfo, client_session: &str) -> Self {
        Self {
            command_base: command_base(device.device_type, &device.mac_address),
            response_base: response_base(
                device.device_type,
                &device.home_group_id,
                &device.user_id,
                client_session,
            ),
        }
    }

    pub fn command(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.command_base)
    }

    pub fn response(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            self.response_base.clone()
        } else {
            format!("{}/{suffix}", self.response_base)
        }
    }

    /// Filters subscribed on every (re)connect.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/{RESPONSE_SEGMENT}", self.command_base),
            self.response_base.clone(),
            format!("{}/#", self.response_base),
        ]
    }
}

// ─── Topic parsing ───

/// Parsed NaviLink topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTopic {
    /// `cmd/{type}/navilink-{mac}/{suffix}`
    Command {
        device_type: u32,
        mac_address: String,
        suffix: String,
    },
    /// `cmd/{type}/{home}/{user}/{session}/res[/suffix]`
    Response {
        device_type: u32,
        home_group_id: String,
        user_id: String,
        client_session: String,
        suffix: Option<String>,
    },
}

/// Parse a topic string into its components.
/// Returns `None` if the topic doesn't match either layout.
pub fn parse_topic(topic: &str) -> Option<ParsedTopic> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.first() != Some(&PREFIX) || parts.len() < 4 {
        return None;
    }

    let device_type = parts[1].parse::<u32>().ok()?;

    // Command topic: cmd/{type}/navilink-{mac}/{suffix...}
    if let Some(mac) = parts[2].strip_prefix(DEVICE_PREFIX) {
        if mac.is_empty() {
            return None;
        }
        return Some(ParsedTopic::Command {
            device_type,
            mac_address: mac.to_string(),
            suffix: parts[3..].join("/"),
        });
    }

    // Response topic: cmd/{type}/{home}/{user}/{session}/res[/suffix...]
    if parts.len() >= 6 && parts[5] == RESPONSE_SEGMENT {
        let suffix = (parts.len() > 6).then(|| parts[6..].join("/"));
        return Some(ParsedTopic::Response {
            device_type,
            home_group_id: parts[2].to_string(),
            user_id: parts[3].to_string(),
            client_session: parts[4].to_string(),
            suffix,
        });
    }

    None
}
