//! Message bus abstraction.
//!
//! The transport itself is pluggable behind [`Bus`]: it only moves raw
//! bytes between named channels.  [`MessageBus`] sits on top and takes care
//! of envelopes, channel naming and the TTL check on receipt.  Delivery is
//! at-most-once; nothing here retries or acknowledges.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod envelope;
pub mod local;

pub use envelope::{Message, Payload};
pub use local::LocalBus;

/// Broadcast channel carrying worker heartbeats.
pub const DISCOVERY_CHANNEL: &str = "discovery";
/// Broadcast channel carrying device state and load reports.
pub const DEVICE_UPDATES_CHANNEL: &str = "device-updates";

/// Raw message queue handed to [`Bus::subscribe`].
pub type RawQueue = mpsc::Sender<Vec<u8>>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("corrupted message: {0}")]
    Corrupted(#[source] serde_json::Error),
    #[error("stale {message_type} message ({age}s old)")]
    Stale { message_type: String, age: i64 },
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("bus transport error: {0}")]
    Transport(String),
}

/// Raw pub/sub transport over named channels.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, messages: Vec<Vec<u8>>) -> Result<(), BusError>;

    async fn subscribe(&self, channel: &str, queue: RawQueue) -> Result<(), BusError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;
}

/// Name of the point-to-point channel addressing one worker.
pub fn worker_channel(name: &str) -> String {
    format!("worker{}", name)
}

/// Envelope-aware front end of a [`Bus`].
#[derive(Clone)]
pub struct MessageBus {
    transport: Arc<dyn Bus>,
}

impl MessageBus {
    pub fn new(transport: Arc<dyn Bus>) -> Self {
        Self { transport }
    }

    /// Publishes every payload, each in its own envelope.
    pub async fn publish<T: Payload>(&self, channel: &str, payloads: &[T]) -> Result<(), BusError> {
        let now = envelope::now_secs();
        let messages = payloads
            .iter()
            .map(|p| envelope::encode(p, now))
            .collect::<Result<Vec<_>, _>>()?;
        self.transport.publish(channel, messages).await
    }

    pub async fn send<T: Payload>(&self, channel: &str, payload: &T) -> Result<(), BusError> {
        self.publish(channel, std::slice::from_ref(payload)).await
    }

    pub async fn publish_to_worker<T: Payload>(
        &self,
        worker: &str,
        payload: &T,
    ) -> Result<(), BusError> {
        self.send(&worker_channel(worker), payload).await
    }

    pub async fn subscribe(&self, channel: &str, queue: RawQueue) -> Result<(), BusError> {
        self.transport.subscribe(channel, queue).await
    }

    pub async fn subscribe_to_worker(&self, worker: &str, queue: RawQueue) -> Result<(), BusError> {
        self.subscribe(&worker_channel(worker), queue).await
    }

    pub async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        self.transport.unsubscribe(channel).await
    }
}

/// Parses a raw envelope received now.  Transport failures are logged and
/// absorbed.
pub fn receive(raw: &[u8]) -> Option<Message> {
    match envelope::parse(raw, envelope::now_secs()) {
        Ok(message) => Some(message),
        Err(e @ BusError::Stale { .. }) => {
            debug!("Dropping message: {}", e);
            None
        }
        Err(e) => {
            warn!("Dropping message: {}", e);
            None
        }
    }
}
