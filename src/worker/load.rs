//! Deadline-bounded device loading.
//!
//! The loader call runs in its own task.  When the deadline passes first the
//! caller moves on and the load is signalled to cancel; whatever instance
//! it still produces is unloaded by that task once it arrives, so a
//! timed-out device gets exactly one unload call.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::plugin::{
    Cancellation, DeviceInstance, DeviceLoader, DiscoveredDevice, InitData, LoadError,
    LoadRequest, SecretStore,
};
use crate::types::{DeviceAssignment, DeviceState, DeviceType};

const UPDATE_DEPTH: usize = 32;
const DISCOVERY_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum LoadFailure {
    #[error(transparent)]
    Plugin(#[from] LoadError),
    #[error("load did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("load task aborted")]
    Aborted,
}

/// A successfully loaded device and the channels it reports on.
pub struct Loaded {
    pub instance: Arc<dyn DeviceInstance>,
    pub updates: mpsc::Receiver<DeviceState>,
    pub discovery: Option<mpsc::Receiver<DiscoveredDevice>>,
}

pub async fn load_bounded(
    loader: Arc<dyn DeviceLoader>,
    assignment: &DeviceAssignment,
    node_id: &str,
    secrets: SecretStore,
    deadline: Duration,
) -> Result<Loaded, LoadFailure> {
    let config = serde_json::to_vec(&assignment.config).map_err(LoadError::InvalidConfig)?;
    let (updates_tx, updates) = mpsc::channel(UPDATE_DEPTH);
    let (discovery_tx, discovery) = if assignment.device_type == DeviceType::Hub {
        let (tx, rx) = mpsc::channel(DISCOVERY_DEPTH);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let cancel = Cancellation::new();
    let request = LoadRequest {
        plugin: assignment.plugin.clone(),
        device_type: assignment.device_type,
        name: assignment.name.clone(),
        config,
        init: InitData {
            node_id: node_id.to_string(),
            secrets,
            updates: updates_tx,
            discovery: discovery_tx,
            cancel: cancel.clone(),
        },
    };

    let (done_tx, mut done_rx) = oneshot::channel();
    let name = assignment.name.clone();
    tokio::spawn(async move {
        let result = loader.load(request).await;
        if let Err(Ok(late)) = done_tx.send(result) {
            info!("Load of {} finished after its deadline, unloading it", name);
            late.unload().await;
        }
    });

    tokio::select! {
        biased;

        result = &mut done_rx => match result {
            Ok(Ok(instance)) => Ok(Loaded {
                instance,
                updates,
                discovery,
            }),
            Ok(Err(e)) => Err(LoadFailure::Plugin(e)),
            Err(_) => Err(LoadFailure::Aborted),
        },
        _ = tokio::time::sleep(deadline) => {
            cancel.cancel();
            done_rx.close();
            // Sent between the deadline firing and close().
            if let Ok(Ok(instance)) = done_rx.try_recv() {
                instance.unload().await;
            }
            Err(LoadFailure::TimedOut(deadline))
        }
    }
}
