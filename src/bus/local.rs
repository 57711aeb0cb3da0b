//! In-process bus used by standalone deployments and tests.
//!
//! Publishing never waits on a subscriber: a message for a full queue is
//! dropped for that subscriber.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;

use super::{Bus, BusError, RawQueue};

#[derive(Debug, Default)]
pub struct LocalBus {
    channels: RwLock<HashMap<String, Vec<RawQueue>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, channel: &str, messages: Vec<Vec<u8>>) -> Result<(), BusError> {
        let queues = {
            let map = self.channels.read().await;
            match map.get(channel) {
                Some(queues) => queues.clone(),
                None => {
                    debug!("No subscribers on {}, dropping {} message(s)", channel, messages.len());
                    return Ok(());
                }
            }
        };

        let mut closed = false;
        for message in messages {
            for queue in &queues {
                match queue.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("Subscriber on {} is backed up, dropping a message", channel);
                    }
                    Err(TrySendError::Closed(_)) => closed = true,
                }
            }
        }

        if closed {
            let mut map = self.channels.write().await;
            if let Some(queues) = map.get_mut(channel) {
                queues.retain(|q| !q.is_closed());
                if queues.is_empty() {
                    map.remove(channel);
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, queue: RawQueue) -> Result<(), BusError> {
        let mut map = self.channels.write().await;
        map.entry(channel.to_string()).or_default().push(queue);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        let mut map = self.channels.write().await;
        map.remove(channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let bus = LocalBus::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        bus.subscribe("discovery", tx1).await.unwrap();
        bus.subscribe("discovery", tx2).await.unwrap();

        bus.publish("discovery", vec![b"ping".to_vec()]).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), b"ping".to_vec());
        assert_eq!(rx2.recv().await.unwrap(), b"ping".to_vec());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::channel(4);
        bus.subscribe("workerw1", tx).await.unwrap();
        bus.unsubscribe("workerw1").await.unwrap();

        bus.publish("workerw1", vec![b"late".to_vec()]).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_subscriber_does_not_block_publish() {
        let bus = LocalBus::new();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(4);
        bus.subscribe("discovery", slow_tx).await.unwrap();
        bus.subscribe("discovery", fast_tx).await.unwrap();

        bus.publish("discovery", vec![b"a".to_vec(), b"b".to_vec()])
            .await
            .unwrap();

        assert_eq!(slow_rx.recv().await.unwrap(), b"a".to_vec());
        assert!(slow_rx.try_recv().is_err());
        assert_eq!(fast_rx.recv().await.unwrap(), b"a".to_vec());
        assert_eq!(fast_rx.recv().await.unwrap(), b"b".to_vec());
    }

    #[tokio::test]
    async fn closed_queues_are_pruned() {
        let bus = LocalBus::new();
        let (tx, rx) = mpsc::channel(4);
        bus.subscribe("device-updates", tx).await.unwrap();
        drop(rx);

        bus.publish("device-updates", vec![b"x".to_vec()]).await.unwrap();
        assert!(bus.channels.read().await.get("device-updates").is_none());
    }
}
