//! Device plugin boundary.
//!
//! A [`DeviceLoader`] turns an assignment into a running
//! [`DeviceInstance`].  How providers are resolved is up to the loader; the
//! daemon uses a [`PluginRegistry`] of in-process factories.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::types::{DeviceCommand, DeviceState, DeviceType};

pub mod virtual_device;

/// Secrets handed to plugins, keyed by name.
pub type SecretStore = Arc<HashMap<String, String>>;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unknown plugin `{0}`")]
    UnknownPlugin(String),
    #[error("plugin `{plugin}` does not provide {device_type:?} devices")]
    UnsupportedType {
        plugin: String,
        device_type: DeviceType,
    },
    #[error("invalid device config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
    #[error("load cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("command `{0}` is not supported")]
    Unsupported(&'static str),
    #[error("{0}")]
    Failed(String),
}

/// Cooperative cancellation signal for a load in flight.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`Cancellation::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Sub-device reported by a hub after it has been loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub device_type: DeviceType,
    pub name: String,
    pub config: Value,
}

/// Everything a plugin gets from its host besides its own config.
#[derive(Clone)]
pub struct InitData {
    pub node_id: String,
    pub secrets: SecretStore,
    /// Asynchronous state changes pushed by the device.
    pub updates: mpsc::Sender<DeviceState>,
    /// Only set for hubs.
    pub discovery: Option<mpsc::Sender<DiscoveredDevice>>,
    pub cancel: Cancellation,
}

pub struct LoadRequest {
    pub plugin: String,
    pub device_type: DeviceType,
    pub name: String,
    /// Raw per-device config, JSON encoded.
    pub config: Vec<u8>,
    pub init: InitData,
}

/// A loaded device.
#[async_trait]
pub trait DeviceInstance: Send + Sync {
    /// Names of the [`DeviceCommand`]s this device accepts.
    fn commands(&self) -> Vec<String>;

    async fn state(&self) -> DeviceState;

    /// Runs a command and returns the resulting state.
    async fn invoke(&self, command: &DeviceCommand) -> Result<DeviceState, DeviceError>;

    async fn unload(&self);
}

#[async_trait]
pub trait DeviceLoader: Send + Sync {
    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn DeviceInstance>, LoadError>;
}

type Factory =
    Arc<dyn Fn(LoadRequest) -> BoxFuture<'static, Result<Arc<dyn DeviceInstance>, LoadError>> + Send + Sync>;

/// [`DeviceLoader`] dispatching on the plugin name.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    factories: HashMap<String, Factory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        virtual_device::register(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, plugin: &str, factory: F)
    where
        F: Fn(LoadRequest) -> BoxFuture<'static, Result<Arc<dyn DeviceInstance>, LoadError>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(plugin.to_string(), Arc::new(factory));
    }
}

#[async_trait]
impl DeviceLoader for PluginRegistry {
    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn DeviceInstance>, LoadError> {
        let factory = self
            .factories
            .get(&request.plugin)
            .cloned()
            .ok_or_else(|| LoadError::UnknownPlugin(request.plugin.clone()))?;
        if request.init.cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        factory(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(plugin: &str) -> LoadRequest {
        let (updates, _) = mpsc::channel(1);
        LoadRequest {
            plugin: plugin.into(),
            device_type: DeviceType::Switch,
            name: "Porch".into(),
            config: b"{}".to_vec(),
            init: InitData {
                node_id: "w1".into(),
                secrets: SecretStore::default(),
                updates,
                discovery: None,
                cancel: Cancellation::new(),
            },
        }
    }

    #[tokio::test]
    async fn unknown_plugin_is_an_error() {
        let registry = PluginRegistry::new();
        match registry.load(request("zigbee")).await {
            Err(LoadError::UnknownPlugin(name)) => assert_eq!(name, "zigbee"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn builtin_virtual_plugin_is_registered() {
        let registry = PluginRegistry::with_builtins();
        let device = registry.load(request("virtual")).await.unwrap();
        assert!(device.commands().contains(&"toggle".to_string()));
    }

    #[tokio::test]
    async fn cancellation_wakes_waiters() {
        let cancel = Cancellation::new();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cancel.cancelled().await })
        };
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
    }
}
