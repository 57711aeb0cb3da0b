//! Worker coordinator.
//!
//! Applies device assignments from the master, keeps the loaded devices
//! running and forwards their state.  All mutation of the device table
//! happens under one lock, so an assignment pass and a retry pass never
//! interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bus::{self, BusError, Message, MessageBus, DEVICE_UPDATES_CHANNEL, DISCOVERY_CHANNEL};
use crate::config::WorkerConfig;
use crate::plugin::{DeviceInstance, DeviceLoader, DiscoveredDevice, SecretStore};
use crate::types::{
    identity_set, sub_device_id, DeviceAssignment, DeviceAssignmentMessage, DeviceCommandMessage,
    DeviceKind, DeviceLoadStatus, DeviceState, DeviceType, DeviceUpdateMessage, DiscoveryAck,
    DiscoveryMessage, Properties,
};

mod load;

pub use load::LoadFailure;

use load::{load_bounded, Loaded};

const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub node_id: String,
    pub max_devices: usize,
    pub properties: Properties,
    pub device_load_timeout: Duration,
    pub long_time_no_see: Duration,
    pub secrets: SecretStore,
}

impl WorkerSettings {
    pub fn from_config(node_id: &str, config: &WorkerConfig) -> Self {
        Self {
            node_id: node_id.to_string(),
            max_devices: config.max_devices,
            properties: config.properties.clone(),
            device_load_timeout: config.device_load_timeout(),
            long_time_no_see: config.long_time_no_see(),
            secrets: Arc::new(config.secrets.clone()),
        }
    }
}

/// A loaded device or API.
struct DeviceHandle {
    device_type: DeviceType,
    instance: Arc<dyn DeviceInstance>,
    commands: Vec<String>,
    state: DeviceState,
    /// Hub that reported this device, if any.
    parent: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

/// A device waiting for another load attempt.
struct PendingLoad {
    id: String,
    assignment: DeviceAssignment,
    /// Hub that reported this device, if any.
    parent: Option<String>,
}

impl PendingLoad {
    fn top_level(assignment: DeviceAssignment) -> Self {
        Self {
            id: assignment.device_id(),
            assignment,
            parent: None,
        }
    }
}

#[derive(Default)]
struct DeviceTable {
    /// Bumped whenever the loaded set is thrown away.
    generation: u64,
    /// Last assignment applied, including entries that failed to load.
    applied: Vec<DeviceAssignment>,
    devices: HashMap<String, DeviceHandle>,
    extended_apis: HashMap<String, DeviceHandle>,
    pending: Vec<PendingLoad>,
}

impl DeviceTable {
    fn handles_mut(&mut self, kind: DeviceKind) -> &mut HashMap<String, DeviceHandle> {
        match kind {
            DeviceKind::Device => &mut self.devices,
            DeviceKind::Api => &mut self.extended_apis,
        }
    }

    /// Unloads one device and everything it discovered, children first.
    async fn unload_device(&mut self, id: &str) {
        let mut order = vec![id.to_string()];
        let mut next = 0;
        while next < order.len() {
            let parent = order[next].clone();
            order.extend(
                self.devices
                    .iter()
                    .filter(|(_, h)| h.parent.as_deref() == Some(parent.as_str()))
                    .map(|(child, _)| child.clone()),
            );
            next += 1;
        }

        for id in order.into_iter().rev() {
            let Some(handle) = self
                .devices
                .remove(&id)
                .or_else(|| self.extended_apis.remove(&id))
            else {
                continue;
            };
            for task in &handle.tasks {
                task.abort();
            }
            handle.instance.unload().await;
            debug!("Unloaded {}", id);
        }
        self.drop_orphans();
    }

    /// Pending children whose hub is gone are dropped; the hub re-reports
    /// them when it loads again.
    fn drop_orphans(&mut self) {
        let devices = &self.devices;
        self.pending.retain(|p| match &p.parent {
            Some(hub) => devices.contains_key(hub),
            None => true,
        });
    }

    async fn unload_all(&mut self) -> usize {
        self.generation += 1;
        let ids: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, h)| h.parent.is_none())
            .map(|(id, _)| id.clone())
            .chain(self.extended_apis.keys().cloned())
            .collect();
        let count = self.devices.len() + self.extended_apis.len();
        for id in ids {
            self.unload_device(&id).await;
        }
        count
    }
}

pub struct Worker {
    bus: MessageBus,
    loader: Arc<dyn DeviceLoader>,
    settings: WorkerSettings,
    table: Mutex<DeviceTable>,
    last_master_contact: std::sync::Mutex<Instant>,
    first_start: AtomicBool,
}

impl Worker {
    pub fn new(bus: MessageBus, loader: Arc<dyn DeviceLoader>, settings: WorkerSettings) -> Self {
        Self {
            bus,
            loader,
            settings,
            table: Mutex::new(DeviceTable::default()),
            last_master_contact: std::sync::Mutex::new(Instant::now()),
            first_start: AtomicBool::new(true),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.settings.node_id
    }

    /// Listens on the worker channel until the bus goes away.
    pub async fn run(self: Arc<Self>) -> Result<(), BusError> {
        let (tx, mut rx) = mpsc::channel(QUEUE_DEPTH);
        self.bus.subscribe_to_worker(self.node_id(), tx).await?;
        info!("Worker {} listening", self.node_id());
        self.send_discovery().await;

        while let Some(raw) = rx.recv().await {
            let Some(message) = bus::receive(&raw) else {
                continue;
            };
            match message {
                Message::DeviceAssignment(msg) => {
                    self.on_device_assignment(msg).await;
                }
                Message::DeviceCommand(msg) => self.on_device_command(msg).await,
                Message::DiscoveryAck(ack) => self.on_discovery_ack(ack),
                other => debug!("Worker ignoring {:?}", other),
            }
        }
        info!("Worker {} channel closed, shutting down", self.node_id());
        Ok(())
    }

    /// Periodic heartbeat to the master.
    pub async fn send_discovery(&self) {
        let msg = DiscoveryMessage {
            node_id: self.settings.node_id.clone(),
            properties: self.settings.properties.clone(),
            max_devices: self.settings.max_devices,
            is_first_start: self.first_start.load(Ordering::SeqCst),
        };
        if let Err(e) = self.bus.send(DISCOVERY_CHANNEL, &msg).await {
            warn!("Failed to send discovery: {}", e);
        }
    }

    pub fn on_discovery_ack(&self, ack: DiscoveryAck) {
        if ack.node_id != self.settings.node_id {
            return;
        }
        self.touch_master();
    }

    fn touch_master(&self) {
        self.first_start.store(false, Ordering::SeqCst);
        if let Ok(mut last) = self.last_master_contact.lock() {
            *last = Instant::now();
        }
    }

    /// Replaces the loaded devices with `msg`.  Returns false when the
    /// assignment matches the one already applied and nothing was done.
    pub async fn on_device_assignment(self: &Arc<Self>, msg: DeviceAssignmentMessage) -> bool {
        self.touch_master();
        let mut table = self.table.lock().await;
        if identity_set(&table.applied) == identity_set(&msg.devices) {
            debug!("Assignment unchanged, nothing to do");
            return false;
        }

        let unloaded = table.unload_all().await;
        info!(
            "Applying assignment of {} devices (unloaded {})",
            msg.devices.len(),
            unloaded
        );
        table.applied = msg.devices.clone();
        table.pending.clear();
        let generation = table.generation;

        let results = join_all(msg.devices.iter().map(|a| self.load(a))).await;
        for (assignment, result) in msg.devices.into_iter().zip(results) {
            self.settle(&mut table, PendingLoad::top_level(assignment), result, generation)
                .await;
        }
        true
    }

    /// Re-attempts every device that failed to load.  Returns how many are
    /// still pending.
    pub async fn retry_load(self: &Arc<Self>) -> usize {
        let mut table = self.table.lock().await;
        table.drop_orphans();
        if table.pending.is_empty() {
            return 0;
        }
        let pending = std::mem::take(&mut table.pending);
        info!("Retrying {} devices", pending.len());
        let generation = table.generation;

        let results = join_all(pending.iter().map(|p| self.load(&p.assignment))).await;
        for (entry, result) in pending.into_iter().zip(results) {
            self.settle(&mut table, entry, result, generation).await;
        }
        table.pending.len()
    }

    /// Periodic job: drops every device when the master has been silent for
    /// too long.  Returns true if it did.
    pub async fn check_stale_master(&self) -> bool {
        let silent_for = match self.last_master_contact.lock() {
            Ok(last) => last.elapsed(),
            Err(_) => return false,
        };
        if silent_for <= self.settings.long_time_no_see {
            return false;
        }

        let mut table = self.table.lock().await;
        let unloaded = table.unload_all().await;
        table.applied.clear();
        table.pending.clear();
        // Ask the master to re-send our assignment once it is back.
        self.first_start.store(true, Ordering::SeqCst);
        if unloaded > 0 {
            warn!(
                "No word from master for {:?}, unloaded {} devices",
                silent_for, unloaded
            );
        }
        true
    }

    pub async fn on_device_command(&self, msg: DeviceCommandMessage) {
        let target = {
            let table = self.table.lock().await;
            table
                .devices
                .get(&msg.device_id)
                .map(|h| (Arc::clone(&h.instance), h.device_type, h.commands.clone()))
        };
        let Some((instance, device_type, commands)) = target else {
            warn!("Command for unknown device {}", msg.device_id);
            return;
        };
        if !commands.iter().any(|c| c == msg.command.name()) {
            warn!("Device {} does not support {}", msg.device_id, msg.command.name());
            return;
        }

        match instance.invoke(&msg.command).await {
            Ok(state) => {
                {
                    let mut table = self.table.lock().await;
                    if let Some(handle) = table.devices.get_mut(&msg.device_id) {
                        handle.state = state.clone();
                    }
                }
                self.publish_state(&msg.device_id, device_type, commands, state)
                    .await;
            }
            Err(e) => warn!("{} on {} failed: {}", msg.command.name(), msg.device_id, e),
        }
    }

    /// Unloads everything; used on shutdown.
    pub async fn shutdown(&self) {
        let mut table = self.table.lock().await;
        let unloaded = table.unload_all().await;
        table.applied.clear();
        table.pending.clear();
        info!("Worker {} unloaded {} devices", self.node_id(), unloaded);
    }

    /// IDs of the loaded devices, sorted.
    pub async fn loaded_devices(&self) -> Vec<String> {
        let table = self.table.lock().await;
        let mut ids: Vec<String> = table.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn loaded_apis(&self) -> Vec<String> {
        let table = self.table.lock().await;
        let mut ids: Vec<String> = table.extended_apis.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Names of the devices waiting for a retry, sorted.
    pub async fn pending_devices(&self) -> Vec<String> {
        let table = self.table.lock().await;
        let mut names: Vec<String> = table
            .pending
            .iter()
            .map(|p| p.assignment.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn device_state(&self, id: &str) -> Option<DeviceState> {
        let table = self.table.lock().await;
        table.devices.get(id).map(|h| h.state.clone())
    }

    async fn load(&self, assignment: &DeviceAssignment) -> Result<Loaded, LoadFailure> {
        load_bounded(
            Arc::clone(&self.loader),
            assignment,
            &self.settings.node_id,
            Arc::clone(&self.settings.secrets),
            self.settings.device_load_timeout,
        )
        .await
    }

    /// Records the outcome of one load attempt.
    async fn settle(
        self: &Arc<Self>,
        table: &mut DeviceTable,
        entry: PendingLoad,
        result: Result<Loaded, LoadFailure>,
        generation: u64,
    ) {
        let name = entry.assignment.name.clone();
        let error = match result {
            Ok(loaded) => {
                let PendingLoad {
                    id,
                    assignment,
                    parent,
                } = entry;
                self.register(table, id, &assignment, loaded, generation, parent)
                    .await;
                None
            }
            Err(e) => {
                warn!("Failed to load {}: {}", entry.id, e);
                table.pending.push(entry);
                Some(e.to_string())
            }
        };
        let status = DeviceLoadStatus {
            worker_id: self.settings.node_id.clone(),
            device_name: name,
            loaded: error.is_none(),
            error,
        };
        if let Err(e) = self.bus.send(DEVICE_UPDATES_CHANNEL, &status).await {
            warn!("Failed to report load status: {}", e);
        }
    }

    async fn register(
        self: &Arc<Self>,
        table: &mut DeviceTable,
        id: String,
        assignment: &DeviceAssignment,
        loaded: Loaded,
        generation: u64,
        parent: Option<String>,
    ) {
        let Loaded {
            instance,
            updates,
            discovery,
        } = loaded;
        let commands = instance.commands();
        let state = instance.state().await;
        let device_type = assignment.device_type;

        let mut tasks = vec![tokio::spawn(Arc::clone(self).forward_updates(
            id.clone(),
            device_type,
            commands.clone(),
            generation,
            updates,
        ))];
        if let Some(found) = discovery {
            tasks.push(tokio::spawn(Arc::clone(self).watch_hub(
                id.clone(),
                assignment.plugin.clone(),
                generation,
                found,
            )));
        }

        if table.devices.contains_key(&id) || table.extended_apis.contains_key(&id) {
            warn!("Device ID {} loaded twice, replacing the old instance", id);
            table.unload_device(&id).await;
        }
        info!("Loaded {}", id);
        table.handles_mut(assignment.kind).insert(
            id.clone(),
            DeviceHandle {
                device_type,
                instance,
                commands: commands.clone(),
                state: state.clone(),
                parent,
                tasks,
            },
        );
        if assignment.kind == DeviceKind::Device {
            self.publish_state(&id, device_type, commands, state).await;
        }
    }

    async fn publish_state(
        &self,
        id: &str,
        device_type: DeviceType,
        commands: Vec<String>,
        state: DeviceState,
    ) {
        let update = DeviceUpdateMessage {
            device_id: id.to_string(),
            worker_id: self.settings.node_id.clone(),
            device_type,
            commands,
            state,
        };
        if let Err(e) = self.bus.send(DEVICE_UPDATES_CHANNEL, &update).await {
            warn!("Failed to publish update for {}: {}", id, e);
        }
    }

    /// Relays state pushed by a device until it is unloaded.
    async fn forward_updates(
        self: Arc<Self>,
        id: String,
        device_type: DeviceType,
        commands: Vec<String>,
        generation: u64,
        mut updates: mpsc::Receiver<DeviceState>,
    ) {
        while let Some(state) = updates.recv().await {
            {
                let mut table = self.table.lock().await;
                if table.generation != generation {
                    return;
                }
                match table.devices.get_mut(&id) {
                    Some(handle) => handle.state = state.clone(),
                    None => return,
                }
            }
            self.publish_state(&id, device_type, commands.clone(), state)
                .await;
        }
    }

    /// Loads devices reported by a hub, registering them under the hub.
    fn watch_hub(
        self: Arc<Self>,
        hub_id: String,
        plugin: String,
        generation: u64,
        mut found: mpsc::Receiver<DiscoveredDevice>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            while let Some(device) = found.recv().await {
                let id = sub_device_id(&hub_id, device.device_type, &device.name);
                let assignment = DeviceAssignment {
                    plugin: plugin.clone(),
                    device_type: device.device_type,
                    kind: DeviceKind::Device,
                    name: device.name,
                    config: device.config,
                };
                let result = self.load(&assignment).await;

                let mut table = self.table.lock().await;
                if table.generation != generation || !table.devices.contains_key(&hub_id) {
                    drop(table);
                    debug!("Hub {} is gone, dropping {}", hub_id, id);
                    if let Ok(loaded) = result {
                        loaded.instance.unload().await;
                    }
                    return;
                }
                let entry = PendingLoad {
                    id,
                    assignment,
                    parent: Some(hub_id.clone()),
                };
                self.settle(&mut table, entry, result, generation).await;
            }
        })
    }
}
