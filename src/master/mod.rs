//! Master coordinator.
//!
//! Owns the worker registry and decides which worker runs which device.
//! Worker-registry updates (discovery) and device distribution (rebalance)
//! are serialized under two separate locks, so a long rebalance never
//! holds up heartbeat processing.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;

use crate::bus::{self, BusError, Message, MessageBus, DEVICE_UPDATES_CHANNEL, DISCOVERY_CHANNEL};
use crate::plugin::DeviceInstance;
use crate::types::{
    identity_set, DeviceAssignment, DeviceAssignmentMessage, DeviceCommand, DeviceCommandMessage,
    DeviceLoadStatus, DeviceState, DeviceType, DeviceUpdateMessage, DiscoveryAck,
    DiscoveryMessage, Properties,
};

pub mod selector;

pub use selector::{CatalogError, DeviceCatalog};

use selector::{compile_pattern, normalize_properties, same_properties};

const QUEUE_DEPTH: usize = 256;

/// A known worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: String,
    pub last_seen: Instant,
    /// Normalized: lower-cased keys plus the synthetic `name` property.
    pub properties: Properties,
    pub max_devices: usize,
    /// Last assignment published to this worker.
    pub assigned: Vec<DeviceAssignment>,
    /// Devices the worker reported as failing to load.
    pub failed_devices: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOwner {
    Worker(String),
    Master,
}

/// Last known state of a device, as reported on the update channel.
#[derive(Debug, Clone)]
pub struct KnownDevice {
    pub id: String,
    pub owner: DeviceOwner,
    pub device_type: DeviceType,
    pub commands: Vec<String>,
    pub state: DeviceState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryOutcome {
    /// New worker or changed properties.
    Rebalance,
    /// Worker restarted without property changes; re-send this assignment.
    Recover(Vec<DeviceAssignment>),
    Refreshed,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid device pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub struct Master {
    bus: MessageBus,
    catalog: DeviceCatalog,
    worker_stale_after: Duration,
    workers: Mutex<HashMap<String, WorkerRecord>>,
    distribution: Mutex<()>,
    devices: RwLock<HashMap<String, KnownDevice>>,
    local_devices: RwLock<HashMap<String, Arc<dyn DeviceInstance>>>,
}

/// Per-pass view of a worker used by [`place_devices`].
struct Slot<'a> {
    id: &'a str,
    properties: &'a Properties,
    max_devices: usize,
    placed: Vec<DeviceAssignment>,
}

/// Computes a device placement.
///
/// Catalog entries are visited most specific first.  Each goes to the
/// matching worker with the fewest devices placed so far in this pass that
/// still has room; ties go to the lowest worker ID.
pub fn place_devices(
    catalog: &DeviceCatalog,
    workers: &[&WorkerRecord],
) -> BTreeMap<String, Vec<DeviceAssignment>> {
    let mut slots: Vec<Slot<'_>> = workers
        .iter()
        .map(|w| Slot {
            id: &w.id,
            properties: &w.properties,
            max_devices: w.max_devices,
            placed: Vec::new(),
        })
        .collect();
    slots.sort_by(|a, b| a.id.cmp(b.id));

    for entry in catalog.entries() {
        let name = &entry.assignment.name;
        let candidates: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| entry.selector.matches(slot.properties))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            warn!("No worker for device {}", name);
            continue;
        }

        let mut best: Option<usize> = None;
        for i in candidates {
            let slot = &slots[i];
            if slot.placed.len() >= slot.max_devices {
                continue;
            }
            match best {
                Some(b) if slots[b].placed.len() <= slot.placed.len() => {}
                _ => best = Some(i),
            }
        }

        match best {
            Some(i) => slots[i].placed.push(entry.assignment.clone()),
            None => warn!("Too many devices: every worker eligible for {} is full", name),
        }
    }

    slots
        .into_iter()
        .map(|slot| (slot.id.to_string(), slot.placed))
        .collect()
}

impl Master {
    pub fn new(bus: MessageBus, catalog: DeviceCatalog, worker_stale_after: Duration) -> Self {
        Self {
            bus,
            catalog,
            worker_stale_after,
            workers: Mutex::new(HashMap::new()),
            distribution: Mutex::new(()),
            devices: RwLock::new(HashMap::new()),
            local_devices: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes to the broadcast channels and processes messages until the
    /// bus goes away.
    pub async fn run(self: Arc<Self>) -> Result<(), BusError> {
        let (discovery_tx, mut discovery_rx) = mpsc::channel(QUEUE_DEPTH);
        let (updates_tx, mut updates_rx) = mpsc::channel(QUEUE_DEPTH);
        self.bus.subscribe(DISCOVERY_CHANNEL, discovery_tx).await?;
        self.bus.subscribe(DEVICE_UPDATES_CHANNEL, updates_tx).await?;
        info!("Master listening for {} devices", self.catalog.len());

        loop {
            let raw = tokio::select! {
                Some(raw) = discovery_rx.recv() => raw,
                Some(raw) = updates_rx.recv() => raw,
                else => break,
            };
            let Some(message) = bus::receive(&raw) else {
                continue;
            };
            match message {
                Message::Discovery(msg) => self.on_discovery(msg).await,
                Message::DeviceUpdate(msg) => self.on_device_update(msg).await,
                Message::DeviceLoadStatus(msg) => self.on_load_status(msg).await,
                other => debug!("Master ignoring {:?}", other),
            }
        }
        info!("Master bus subscriptions closed, shutting down");
        Ok(())
    }

    /// Handles a heartbeat: acks it, then recovers or rebalances as needed.
    pub async fn on_discovery(self: &Arc<Self>, msg: DiscoveryMessage) {
        let node_id = msg.node_id.clone();
        let outcome = self.handle_discovery(msg).await;

        let ack = DiscoveryAck {
            node_id: node_id.clone(),
        };
        if let Err(e) = self.bus.publish_to_worker(&node_id, &ack).await {
            warn!("Failed to ack discovery from {}: {}", node_id, e);
        }

        match outcome {
            DiscoveryOutcome::Refreshed => {}
            DiscoveryOutcome::Recover(devices) => {
                info!("Worker {} restarted, re-sending {} devices", node_id, devices.len());
                let msg = DeviceAssignmentMessage { devices };
                if let Err(e) = self.bus.publish_to_worker(&node_id, &msg).await {
                    warn!("Failed to re-send assignment to {}: {}", node_id, e);
                }
            }
            DiscoveryOutcome::Rebalance => {
                let master = Arc::clone(self);
                tokio::spawn(async move {
                    master.rebalance().await;
                });
            }
        }
    }

    /// Updates the registry for one heartbeat.
    pub async fn handle_discovery(&self, msg: DiscoveryMessage) -> DiscoveryOutcome {
        let properties = normalize_properties(&msg.node_id, &msg.properties);
        let mut workers = self.workers.lock().await;

        let record = match workers.entry(msg.node_id.clone()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                info!("New worker {} (max {} devices)", msg.node_id, msg.max_devices);
                slot.insert(WorkerRecord {
                    id: msg.node_id,
                    last_seen: Instant::now(),
                    properties,
                    max_devices: msg.max_devices,
                    assigned: Vec::new(),
                    failed_devices: BTreeSet::new(),
                });
                return DiscoveryOutcome::Rebalance;
            }
        };

        record.last_seen = Instant::now();
        let capacity_changed = record.max_devices != msg.max_devices;
        record.max_devices = msg.max_devices;

        if !same_properties(&record.properties, &properties) {
            info!("Worker {} changed properties", record.id);
            record.properties = properties;
            return DiscoveryOutcome::Rebalance;
        }
        if msg.is_first_start {
            return DiscoveryOutcome::Recover(record.assigned.clone());
        }
        if capacity_changed {
            debug!("Worker {} now takes {} devices", record.id, record.max_devices);
        }
        DiscoveryOutcome::Refreshed
    }

    /// Recomputes placement and publishes every assignment that changed.
    /// Returns the IDs of the workers that were sent a new assignment.
    pub async fn rebalance(&self) -> Vec<String> {
        let _distribution = self.distribution.lock().await;

        let snapshot: Vec<WorkerRecord> = {
            let workers = self.workers.lock().await;
            workers.values().cloned().collect()
        };
        let records: Vec<&WorkerRecord> = snapshot.iter().collect();
        let mut placement = place_devices(&self.catalog, &records);

        let mut changed = Vec::new();
        for record in &snapshot {
            let devices = placement.remove(&record.id).unwrap_or_default();
            if identity_set(&devices) == identity_set(&record.assigned) {
                continue;
            }
            info!("Assigning {} devices to worker {}", devices.len(), record.id);
            let msg = DeviceAssignmentMessage { devices };
            if let Err(e) = self.bus.publish_to_worker(&record.id, &msg).await {
                warn!("Failed to publish assignment to {}: {}", record.id, e);
                continue;
            }
            let mut workers = self.workers.lock().await;
            if let Some(current) = workers.get_mut(&record.id) {
                current.assigned = msg.devices;
                current.failed_devices.clear();
            }
            changed.push(record.id.clone());
        }
        self.prune_unplaced_devices().await;
        changed.sort();
        changed
    }

    /// Forgets worker devices that are no longer part of their worker's
    /// assignment.  Hub children follow their hub.
    async fn prune_unplaced_devices(&self) {
        let placed: HashMap<String, HashSet<String>> = {
            let workers = self.workers.lock().await;
            workers
                .values()
                .map(|w| (w.id.clone(), w.assigned.iter().map(DeviceAssignment::device_id).collect()))
                .collect()
        };
        let mut devices = self.devices.write().await;
        devices.retain(|id, device| match &device.owner {
            DeviceOwner::Master => true,
            DeviceOwner::Worker(worker) => {
                let Some(ids) = placed.get(worker) else {
                    return false;
                };
                let top = id.split_once('/').map_or(id.as_str(), |(hub, _)| hub);
                let keep = ids.contains(top);
                if !keep {
                    debug!("Device {} is no longer placed on {}", id, worker);
                }
                keep
            }
        });
    }

    /// Removes workers that have not sent a heartbeat recently.  Returns the
    /// removed IDs.
    pub async fn sweep_stale_workers(&self) -> Vec<String> {
        let removed: Vec<String> = {
            let mut workers = self.workers.lock().await;
            let now = Instant::now();
            let stale: Vec<String> = workers
                .values()
                .filter(|w| now.duration_since(w.last_seen) > self.worker_stale_after)
                .map(|w| w.id.clone())
                .collect();
            for id in &stale {
                warn!("Worker {} went silent, removing it", id);
                workers.remove(id);
            }
            stale
        };

        if !removed.is_empty() {
            let mut devices = self.devices.write().await;
            devices.retain(|_, d| match &d.owner {
                DeviceOwner::Worker(w) => !removed.contains(w),
                DeviceOwner::Master => true,
            });
        }
        removed
    }

    /// Periodic job: sweep, then rebalance if anything was removed.
    pub async fn check_stale_workers(&self) {
        if !self.sweep_stale_workers().await.is_empty() {
            self.rebalance().await;
        }
    }

    pub async fn on_device_update(&self, msg: DeviceUpdateMessage) {
        debug!("Update from {} for {}", msg.worker_id, msg.device_id);
        self.record_device(msg, DeviceOwner::Worker).await;
    }

    async fn record_device(&self, msg: DeviceUpdateMessage, owner: impl FnOnce(String) -> DeviceOwner) {
        let mut devices = self.devices.write().await;
        devices.insert(
            msg.device_id.clone(),
            KnownDevice {
                id: msg.device_id,
                owner: owner(msg.worker_id),
                device_type: msg.device_type,
                commands: msg.commands,
                state: msg.state,
            },
        );
    }

    pub async fn on_load_status(&self, msg: DeviceLoadStatus) {
        let mut workers = self.workers.lock().await;
        let Some(record) = workers.get_mut(&msg.worker_id) else {
            debug!("Load status from unknown worker {}", msg.worker_id);
            return;
        };
        if msg.loaded {
            record.failed_devices.remove(&msg.device_name);
        } else {
            warn!(
                "Worker {} failed to load {}: {}",
                msg.worker_id,
                msg.device_name,
                msg.error.as_deref().unwrap_or("unknown error")
            );
            record.failed_devices.insert(msg.device_name);
        }
    }

    /// Registers a device served by the master process itself.
    pub async fn register_master_device(
        &self,
        id: &str,
        device_type: DeviceType,
        instance: Arc<dyn DeviceInstance>,
    ) {
        let update = DeviceUpdateMessage {
            device_id: id.to_string(),
            worker_id: String::new(),
            device_type,
            commands: instance.commands(),
            state: instance.state().await,
        };
        self.local_devices
            .write()
            .await
            .insert(id.to_string(), instance);
        self.push_master_device_update(update).await;
    }

    /// Records a state change of a master-local device.
    pub async fn push_master_device_update(&self, update: DeviceUpdateMessage) {
        self.record_device(update, |_| DeviceOwner::Master).await;
    }

    /// Sends `command` to every known device whose ID matches the glob
    /// `pattern` and that supports it.  Returns how many devices it was
    /// dispatched to.
    pub async fn invoke_device_command(
        &self,
        pattern: &str,
        command: DeviceCommand,
    ) -> Result<usize, CommandError> {
        let matcher = compile_pattern(pattern)?;
        let targets: Vec<KnownDevice> = {
            let devices = self.devices.read().await;
            let mut matched: Vec<KnownDevice> = devices
                .values()
                .filter(|d| matcher.is_match(&d.id))
                .cloned()
                .collect();
            matched.sort_by(|a, b| a.id.cmp(&b.id));
            matched
        };
        if targets.is_empty() {
            warn!("No device matches {}", pattern);
        }

        let mut dispatched = 0;
        for device in targets {
            if !device.commands.iter().any(|c| c == command.name()) {
                warn!("Device {} does not support {}", device.id, command.name());
                continue;
            }
            match &device.owner {
                DeviceOwner::Master => {
                    let instance = self.local_devices.read().await.get(&device.id).cloned();
                    let Some(instance) = instance else {
                        warn!("Master device {} has no handler", device.id);
                        continue;
                    };
                    match instance.invoke(&command).await {
                        Ok(state) => {
                            self.push_master_device_update(DeviceUpdateMessage {
                                device_id: device.id.clone(),
                                worker_id: String::new(),
                                device_type: device.device_type,
                                commands: device.commands.clone(),
                                state,
                            })
                            .await;
                            dispatched += 1;
                        }
                        Err(e) => warn!("Command {} on {} failed: {}", command.name(), device.id, e),
                    }
                }
                DeviceOwner::Worker(worker) => {
                    let msg = DeviceCommandMessage {
                        device_id: device.id.clone(),
                        command: command.clone(),
                    };
                    match self.bus.publish_to_worker(worker, &msg).await {
                        Ok(()) => dispatched += 1,
                        Err(e) => warn!("Failed to send command to {}: {}", worker, e),
                    }
                }
            }
        }
        Ok(dispatched)
    }

    /// Snapshot of the registry, ordered by worker ID.
    pub async fn get_workers(&self) -> Vec<WorkerRecord> {
        let workers = self.workers.lock().await;
        let mut records: Vec<WorkerRecord> = workers.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn get_device(&self, id: &str) -> Option<KnownDevice> {
        self.devices.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{envelope, receive, Bus, LocalBus};
    use crate::config::DeviceConfig;
    use crate::plugin::{DeviceError, PluginRegistry};
    use crate::types::DeviceKind;
    use crate::worker::{Worker, WorkerSettings};
    use async_trait::async_trait;

    fn device(name: &str, selector: &[(&str, &str)]) -> DeviceConfig {
        DeviceConfig {
            name: name.into(),
            plugin: "virtual".into(),
            device_type: DeviceType::Switch,
            kind: DeviceKind::Device,
            config: serde_json::Value::Null,
            selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn discovery(node: &str, max: usize, props: &[(&str, &str)], first: bool) -> DiscoveryMessage {
        DiscoveryMessage {
            node_id: node.into(),
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            max_devices: max,
            is_first_start: first,
        }
    }

    fn master(devices: &[DeviceConfig]) -> (Arc<Master>, MessageBus) {
        let bus = MessageBus::new(Arc::new(LocalBus::new()));
        let catalog = DeviceCatalog::new(devices).unwrap();
        let master = Master::new(bus.clone(), catalog, Duration::from_secs(120));
        (Arc::new(master), bus)
    }

    async fn listen(bus: &MessageBus, worker: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(16);
        bus.subscribe_to_worker(worker, tx).await.unwrap();
        rx
    }

    fn drain_assignments(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<DeviceAssignmentMessage> {
        let mut out = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            if let Some(Message::DeviceAssignment(msg)) = receive(&raw) {
                out.push(msg);
            }
        }
        out
    }

    async fn assigned_names(master: &Master, worker: &str) -> Vec<String> {
        let workers = master.get_workers().await;
        let record = workers.iter().find(|w| w.id == worker).unwrap();
        let mut names: Vec<String> = record.assigned.iter().map(|d| d.name.clone()).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn two_workers_split_unselected_devices_evenly() {
        let (master, _bus) = master(&[
            device("a", &[]),
            device("b", &[]),
            device("c", &[]),
            device("d", &[]),
        ]);
        master.handle_discovery(discovery("w1", 10, &[], true)).await;
        master.handle_discovery(discovery("w2", 10, &[], true)).await;

        assert_eq!(master.rebalance().await, vec!["w1", "w2"]);
        assert_eq!(assigned_names(&master, "w1").await.len(), 2);
        assert_eq!(assigned_names(&master, "w2").await.len(), 2);
    }

    #[tokio::test]
    async fn selected_and_generic_devices_land_on_matching_worker() {
        let (master, _bus) = master(&[
            device("generic", &[]),
            device("pinned", &[("name", "worker-1")]),
        ]);
        master
            .handle_discovery(discovery("worker-1", 10, &[], true))
            .await;
        master.rebalance().await;
        assert_eq!(assigned_names(&master, "worker-1").await, vec!["generic", "pinned"]);
    }

    #[tokio::test]
    async fn selector_excludes_non_matching_workers() {
        let (master, _bus) = master(&[device("pinned", &[("name", "worker-1")])]);
        master.handle_discovery(discovery("worker-2", 10, &[], true)).await;
        master.handle_discovery(discovery("worker-1", 10, &[], true)).await;
        master.rebalance().await;
        assert_eq!(assigned_names(&master, "worker-1").await, vec!["pinned"]);
        assert!(assigned_names(&master, "worker-2").await.is_empty());
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded() {
        let (master, _bus) = master(&[device("a", &[]), device("b", &[]), device("c", &[])]);
        master.handle_discovery(discovery("w1", 2, &[], true)).await;
        master.rebalance().await;
        assert_eq!(assigned_names(&master, "w1").await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn specific_devices_are_placed_before_generic_ones() {
        let (master, _bus) = master(&[
            device("generic", &[]),
            device("kitchen-only", &[("room", "kitchen")]),
        ]);
        master
            .handle_discovery(discovery("w1", 1, &[("Room", "Kitchen")], true))
            .await;
        master.handle_discovery(discovery("w2", 1, &[], true)).await;
        master.rebalance().await;
        assert_eq!(assigned_names(&master, "w1").await, vec!["kitchen-only"]);
        assert_eq!(assigned_names(&master, "w2").await, vec!["generic"]);
    }

    #[tokio::test]
    async fn unchanged_assignment_is_not_republished() {
        let (master, bus) = master(&[device("a", &[]), device("b", &[])]);
        let mut rx = listen(&bus, "w1").await;
        master.handle_discovery(discovery("w1", 10, &[], true)).await;

        assert_eq!(master.rebalance().await, vec!["w1"]);
        let sent = drain_assignments(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].devices.len(), 2);

        assert!(master.rebalance().await.is_empty());
        assert!(drain_assignments(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn discovery_branches() {
        let (master, _bus) = master(&[device("a", &[])]);
        let first = discovery("w1", 4, &[("room", "hall")], true);
        assert_eq!(master.handle_discovery(first.clone()).await, DiscoveryOutcome::Rebalance);
        master.rebalance().await;

        let steady = discovery("w1", 5, &[("ROOM", "hall")], false);
        assert_eq!(master.handle_discovery(steady).await, DiscoveryOutcome::Refreshed);
        assert_eq!(master.get_workers().await[0].max_devices, 5);

        match master.handle_discovery(first).await {
            DiscoveryOutcome::Recover(devices) => assert_eq!(devices[0].name, "a"),
            other => panic!("expected recovery, got {:?}", other),
        }

        let moved = discovery("w1", 4, &[("room", "garage")], true);
        assert_eq!(master.handle_discovery(moved).await, DiscoveryOutcome::Rebalance);
    }

    #[tokio::test]
    async fn on_discovery_acks_and_recovers() {
        let (master, bus) = master(&[device("a", &[])]);
        let mut rx = listen(&bus, "w1").await;
        master.handle_discovery(discovery("w1", 4, &[], false)).await;
        master.rebalance().await;
        drain_assignments(&mut rx);

        master.on_discovery(discovery("w1", 4, &[], true)).await;
        let ack = receive(&rx.recv().await.unwrap());
        assert_eq!(ack, Some(Message::DiscoveryAck(DiscoveryAck { node_id: "w1".into() })));
        match receive(&rx.recv().await.unwrap()) {
            Some(Message::DeviceAssignment(msg)) => assert_eq!(msg.devices[0].name, "a"),
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_workers_are_removed_and_devices_redistributed() {
        let (master, _bus) = master(&[device("a", &[]), device("b", &[])]);
        master.handle_discovery(discovery("w1", 10, &[], true)).await;
        master.handle_discovery(discovery("w2", 10, &[], true)).await;
        master.rebalance().await;
        assert_eq!(assigned_names(&master, "w1").await.len(), 1);

        tokio::time::advance(Duration::from_secs(100)).await;
        master.handle_discovery(discovery("w2", 10, &[], false)).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(master.sweep_stale_workers().await, vec!["w1"]);
        master.rebalance().await;
        assert_eq!(assigned_names(&master, "w2").await, vec!["a", "b"]);
        assert!(master.sweep_stale_workers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_check_publishes_redistributed_assignment() {
        let (master, bus) = master(&[device("a", &[]), device("b", &[])]);
        master.handle_discovery(discovery("w1", 10, &[], true)).await;
        master.handle_discovery(discovery("w2", 10, &[], true)).await;
        master.rebalance().await;
        let mut rx = listen(&bus, "w2").await;

        tokio::time::advance(Duration::from_secs(100)).await;
        master.handle_discovery(discovery("w2", 10, &[], false)).await;
        master.check_stale_workers().await;
        assert!(drain_assignments(&mut rx).is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        master.check_stale_workers().await;
        let sent = drain_assignments(&mut rx);
        assert_eq!(sent.len(), 1);
        let mut names: Vec<_> = sent[0].devices.iter().map(|d| d.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(master.get_workers().await.len(), 1);
    }

    #[tokio::test]
    async fn unplaced_devices_are_forgotten_after_rebalance() {
        let (master, _bus) = master(&[device("a", &[]), device("b", &[("room", "kitchen")])]);
        master
            .handle_discovery(discovery("w1", 10, &[("room", "kitchen")], true))
            .await;
        master.rebalance().await;
        for id in ["switch.a", "switch.b", "switch.b/light.child"] {
            master
                .on_device_update(DeviceUpdateMessage {
                    device_id: id.into(),
                    worker_id: "w1".into(),
                    device_type: DeviceType::Switch,
                    commands: vec!["on".into()],
                    state: DeviceState::new(),
                })
                .await;
        }

        let moved = discovery("w1", 10, &[("room", "garage")], false);
        assert_eq!(master.handle_discovery(moved).await, DiscoveryOutcome::Rebalance);
        master.rebalance().await;

        assert!(master.get_device("switch.a").await.is_some());
        assert!(master.get_device("switch.b").await.is_none());
        assert!(master.get_device("switch.b/light.child").await.is_none());
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn master_and_worker_converge_over_the_bus() {
        let transport = Arc::new(LocalBus::new());
        let bus = MessageBus::new(transport.clone());
        let mut catalog = vec![device("a", &[]), device("b", &[])];
        catalog[1].device_type = DeviceType::Light;
        let master = Arc::new(Master::new(
            bus.clone(),
            DeviceCatalog::new(&catalog).unwrap(),
            Duration::from_secs(120),
        ));
        let settings = WorkerSettings {
            node_id: "w1".into(),
            max_devices: 10,
            properties: Properties::new(),
            device_load_timeout: Duration::from_secs(2),
            long_time_no_see: Duration::from_secs(60),
            secrets: Default::default(),
        };
        let worker = Arc::new(Worker::new(
            bus.clone(),
            Arc::new(PluginRegistry::with_builtins()),
            settings,
        ));

        let master_task = tokio::spawn(Arc::clone(&master).run());
        let worker_task = tokio::spawn(Arc::clone(&worker).run());

        // The first heartbeat may go out before the master subscribes.
        let loaded = eventually(|| {
            let worker = Arc::clone(&worker);
            async move {
                worker.send_discovery().await;
                worker.loaded_devices().await == vec!["light.b", "switch.a"]
            }
        })
        .await;
        assert!(loaded);

        let recorded = eventually(|| {
            let master = Arc::clone(&master);
            async move {
                match (master.get_device("switch.a").await, master.get_device("light.b").await) {
                    (Some(a), Some(b)) => {
                        a.owner == DeviceOwner::Worker("w1".into())
                            && b.owner == DeviceOwner::Worker("w1".into())
                    }
                    _ => false,
                }
            }
        })
        .await;
        assert!(recorded);

        // Commands travel master -> worker and the new state comes back.
        assert_eq!(master.invoke_device_command("light.*", DeviceCommand::On).await.unwrap(), 1);
        let switched = eventually(|| {
            let master = Arc::clone(&master);
            async move {
                master
                    .get_device("light.b")
                    .await
                    .and_then(|d| d.state.get("on").cloned())
                    == Some(serde_json::json!(true))
            }
        })
        .await;
        assert!(switched);

        // Expired heartbeats never reach the registry; fresh ones behind
        // them on the same channel still do.
        let ghost = discovery("ghost", 10, &[], true);
        let stale = envelope::encode(&ghost, envelope::now_secs() - envelope::TTL_SECS - 5).unwrap();
        let fresh = envelope::encode(&discovery("w2", 10, &[], true), envelope::now_secs()).unwrap();
        transport.publish(DISCOVERY_CHANNEL, vec![stale, fresh]).await.unwrap();
        let registered = eventually(|| {
            let master = Arc::clone(&master);
            async move { master.get_workers().await.len() == 2 }
        })
        .await;
        assert!(registered);
        let ids: Vec<String> = master.get_workers().await.into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["w1", "w2"]);

        master_task.abort();
        worker_task.abort();
    }

    #[tokio::test]
    async fn commands_route_to_owning_worker() {
        let (master, bus) = master(&[]);
        let mut rx = listen(&bus, "w1").await;
        for id in ["light.kitchen", "light.hall", "switch.porch"] {
            master
                .on_device_update(DeviceUpdateMessage {
                    device_id: id.into(),
                    worker_id: "w1".into(),
                    device_type: DeviceType::Light,
                    commands: if id == "light.hall" {
                        vec!["refresh".into()]
                    } else {
                        vec!["on".into(), "off".into()]
                    },
                    state: DeviceState::new(),
                })
                .await;
        }

        let sent = master.invoke_device_command("light.*", DeviceCommand::On).await.unwrap();
        assert_eq!(sent, 1);
        match receive(&rx.recv().await.unwrap()) {
            Some(Message::DeviceCommand(cmd)) => {
                assert_eq!(cmd.device_id, "light.kitchen");
                assert_eq!(cmd.command, DeviceCommand::On);
            }
            other => panic!("expected command, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(master.invoke_device_command("fan.*", DeviceCommand::On).await.unwrap(), 0);
    }

    struct Group {
        calls: std::sync::Mutex<Vec<DeviceCommand>>,
    }

    #[async_trait]
    impl DeviceInstance for Group {
        fn commands(&self) -> Vec<String> {
            vec!["off".into()]
        }

        async fn state(&self) -> DeviceState {
            DeviceState::new()
        }

        async fn invoke(&self, command: &DeviceCommand) -> Result<DeviceState, DeviceError> {
            self.calls.lock().unwrap().push(command.clone());
            let mut state = DeviceState::new();
            state.insert("on".into(), serde_json::json!(false));
            Ok(state)
        }

        async fn unload(&self) {}
    }

    #[tokio::test]
    async fn master_devices_are_invoked_in_process() {
        let (master, _bus) = master(&[]);
        let group = Arc::new(Group {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        master
            .register_master_device("group.downstairs", DeviceType::Light, group.clone())
            .await;

        let sent = master
            .invoke_device_command("group.*", DeviceCommand::Off)
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(*group.calls.lock().unwrap(), vec![DeviceCommand::Off]);

        let known = master.get_device("group.downstairs").await.unwrap();
        assert_eq!(known.owner, DeviceOwner::Master);
        assert_eq!(known.state.get("on"), Some(&serde_json::json!(false)));
    }

    #[tokio::test]
    async fn load_failures_are_tracked_per_worker() {
        let (master, _bus) = master(&[]);
        master.handle_discovery(discovery("w1", 1, &[], true)).await;
        let status = |loaded| DeviceLoadStatus {
            worker_id: "w1".into(),
            device_name: "lamp".into(),
            loaded,
            error: (!loaded).then(|| "boom".to_string()),
        };

        master.on_load_status(status(false)).await;
        assert!(master.get_workers().await[0].failed_devices.contains("lamp"));
        master.on_load_status(status(true)).await;
        assert!(master.get_workers().await[0].failed_devices.is_empty());
    }
}
