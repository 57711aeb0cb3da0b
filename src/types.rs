//! Data structures exchanged between the master and its workers.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and
//! travel over the message bus wrapped in an envelope (see
//! [`crate::bus::envelope`]).  Workers announce themselves with
//! [`DiscoveryMessage`], the master answers with a [`DiscoveryAck`] and,
//! when placement changes, a [`DeviceAssignmentMessage`].  Commands and
//! state flow as [`DeviceCommandMessage`] and [`DeviceUpdateMessage`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Worker properties used for selector matching.
pub type Properties = BTreeMap<String, String>;

/// Free-form device state snapshot.
pub type DeviceState = serde_json::Map<String, Value>;

/// Periodic worker heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub node_id: String,
    #[serde(default)]
    pub properties: Properties,
    pub max_devices: usize,
    /// Set until the worker has heard from the master after (re)starting.
    #[serde(default)]
    pub is_first_start: bool,
}

/// Master reply to every discovery, sent on the worker's own channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryAck {
    pub node_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Device,
    /// Extended API endpoints; tracked apart from regular devices.
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Hub,
    Light,
    Switch,
    Sensor,
    Lock,
    Cover,
    Climate,
    Camera,
    Vacuum,
    Media,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Hub => "hub",
            DeviceType::Light => "light",
            DeviceType::Switch => "switch",
            DeviceType::Sensor => "sensor",
            DeviceType::Lock => "lock",
            DeviceType::Cover => "cover",
            DeviceType::Climate => "climate",
            DeviceType::Camera => "camera",
            DeviceType::Vacuum => "vacuum",
            DeviceType::Media => "media",
        }
    }
}

/// One device placed on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub plugin: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub kind: DeviceKind,
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

impl DeviceAssignment {
    /// Identity of the assignment: a digest of the trimmed name and the
    /// canonical JSON rendering of its config.  Key order and whitespace in
    /// the original config source do not affect it.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.config.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Runtime ID the loaded device is registered under.
    pub fn device_id(&self) -> String {
        device_id(self.device_type, &self.name)
    }
}

/// Order-independent identity of a device set.
pub fn identity_set<'a, I>(devices: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a DeviceAssignment>,
{
    devices.into_iter().map(DeviceAssignment::fingerprint).collect()
}

pub fn device_id(device_type: DeviceType, name: &str) -> String {
    format!("{}.{}", device_type.as_str(), slug(name))
}

/// ID of a device reported by a hub.
pub fn sub_device_id(hub_id: &str, device_type: DeviceType, name: &str) -> String {
    format!("{}/{}", hub_id, device_id(device_type, name))
}

fn slug(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Complete device set for one worker; replaces whatever it had before.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAssignmentMessage {
    pub devices: Vec<DeviceAssignment>,
}

/// The closed set of commands a device may support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum DeviceCommand {
    On,
    Off,
    Toggle,
    SetBrightness { value: u8 },
    SetColor { r: u8, g: u8, b: u8 },
    SetTemperature { value: f64 },
    Lock,
    Unlock,
    Open,
    Close,
    Stop,
    Refresh,
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::On => "on",
            DeviceCommand::Off => "off",
            DeviceCommand::Toggle => "toggle",
            DeviceCommand::SetBrightness { .. } => "set_brightness",
            DeviceCommand::SetColor { .. } => "set_color",
            DeviceCommand::SetTemperature { .. } => "set_temperature",
            DeviceCommand::Lock => "lock",
            DeviceCommand::Unlock => "unlock",
            DeviceCommand::Open => "open",
            DeviceCommand::Close => "close",
            DeviceCommand::Stop => "stop",
            DeviceCommand::Refresh => "refresh",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommandMessage {
    pub device_id: String,
    pub command: DeviceCommand,
}

/// State snapshot of a device, broadcast on the device-updates channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdateMessage {
    pub device_id: String,
    pub worker_id: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub state: DeviceState,
}

/// Outcome of a single load attempt on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLoadStatus {
    pub worker_id: String,
    pub device_name: String,
    pub loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
