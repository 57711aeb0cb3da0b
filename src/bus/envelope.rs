//! Envelope wrapping every payload that crosses the bus.
//!
//! On the wire an envelope is a JSON object:
//!
//! ```json
//! {"type": "discovery", "sent_at": 1700000000, "payload": { ... }}
//! ```
//!
//! `sent_at` is in epoch seconds.  Receivers drop anything older than
//! [`TTL_SECS`] before looking at the payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BusError;
use crate::types::{
    DeviceAssignmentMessage, DeviceCommandMessage, DeviceLoadStatus, DeviceUpdateMessage,
    DiscoveryAck, DiscoveryMessage,
};

/// Maximum accepted age of an envelope.
pub const TTL_SECS: i64 = 10;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    message_type: String,
    sent_at: i64,
    #[serde(default)]
    payload: Value,
}

/// A decoded bus message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Discovery(DiscoveryMessage),
    DiscoveryAck(DiscoveryAck),
    DeviceAssignment(DeviceAssignmentMessage),
    DeviceCommand(DeviceCommandMessage),
    DeviceUpdate(DeviceUpdateMessage),
    DeviceLoadStatus(DeviceLoadStatus),
}

/// A payload type that can travel inside an envelope.
pub trait Payload: Serialize + DeserializeOwned {
    /// Discriminator written into the envelope header.
    const TYPE: &'static str;

    fn into_message(self) -> Message;
}

macro_rules! payload {
    ($ty:ty, $name:literal, $variant:ident) => {
        impl Payload for $ty {
            const TYPE: &'static str = $name;

            fn into_message(self) -> Message {
                Message::$variant(self)
            }
        }
    };
}

payload!(DiscoveryMessage, "discovery", Discovery);
payload!(DiscoveryAck, "discovery_ack", DiscoveryAck);
payload!(DeviceAssignmentMessage, "device_assignment", DeviceAssignment);
payload!(DeviceCommandMessage, "device_command", DeviceCommand);
payload!(DeviceUpdateMessage, "device_update", DeviceUpdate);
payload!(DeviceLoadStatus, "device_load_status", DeviceLoadStatus);

type Decoder = fn(Value) -> Result<Message, serde_json::Error>;

fn decode<T: Payload>(payload: Value) -> Result<Message, serde_json::Error> {
    serde_json::from_value::<T>(payload).map(Payload::into_message)
}

const DECODERS: &[(&str, Decoder)] = &[
    (DiscoveryMessage::TYPE, decode::<DiscoveryMessage> as Decoder),
    (DiscoveryAck::TYPE, decode::<DiscoveryAck> as Decoder),
    (DeviceAssignmentMessage::TYPE, decode::<DeviceAssignmentMessage> as Decoder),
    (DeviceCommandMessage::TYPE, decode::<DeviceCommandMessage> as Decoder),
    (DeviceUpdateMessage::TYPE, decode::<DeviceUpdateMessage> as Decoder),
    (DeviceLoadStatus::TYPE, decode::<DeviceLoadStatus> as Decoder),
];

/// Current time in epoch seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Wraps `payload` into an envelope stamped with `sent_at`.
pub fn encode<T: Payload>(payload: &T, sent_at: i64) -> Result<Vec<u8>, BusError> {
    let envelope = Envelope {
        message_type: T::TYPE.to_string(),
        sent_at,
        payload: serde_json::to_value(payload).map_err(BusError::Encode)?,
    };
    serde_json::to_vec(&envelope).map_err(BusError::Encode)
}

/// Parses a raw envelope received at `now`.
///
/// The header is checked before the payload is touched: a stale envelope is
/// rejected even if its payload would not decode.
pub fn parse(raw: &[u8], now: i64) -> Result<Message, BusError> {
    let envelope: Envelope = serde_json::from_slice(raw).map_err(BusError::Corrupted)?;

    let age = now - envelope.sent_at;
    if age > TTL_SECS {
        return Err(BusError::Stale {
            message_type: envelope.message_type,
            age,
        });
    }

    let decoder = DECODERS
        .iter()
        .find(|(name, _)| *name == envelope.message_type)
        .map(|(_, decoder)| *decoder)
        .ok_or_else(|| BusError::UnknownType(envelope.message_type.clone()))?;

    decoder(envelope.payload).map_err(BusError::Corrupted)
}
