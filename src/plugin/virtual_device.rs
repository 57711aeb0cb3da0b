//! Built-in `virtual` plugin: software-only lights, switches, sensors and a
//! hub that reports a configured list of children.  Useful for trying out a
//! deployment without hardware.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{
    DeviceError, DeviceInstance, DiscoveredDevice, LoadError, LoadRequest, PluginRegistry,
};
use crate::types::{DeviceCommand, DeviceState, DeviceType};

pub const PLUGIN: &str = "virtual";

pub fn register(registry: &mut PluginRegistry) {
    registry.register(PLUGIN, |request| load(request).boxed());
}

async fn load(request: LoadRequest) -> Result<Arc<dyn DeviceInstance>, LoadError> {
    match request.device_type {
        DeviceType::Hub => Ok(Arc::new(VirtualHub::start(request)?)),
        DeviceType::Light | DeviceType::Switch | DeviceType::Sensor => {
            Ok(Arc::new(VirtualDevice::new(request)?))
        }
        other => Err(LoadError::UnsupportedType {
            plugin: PLUGIN.to_string(),
            device_type: other,
        }),
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeviceConfig {
    #[serde(default)]
    on: bool,
    #[serde(default)]
    brightness: Option<u8>,
    #[serde(default)]
    value: Option<Value>,
}

fn parse_config<T: DeserializeOwned + Default>(raw: &[u8]) -> Result<T, LoadError> {
    if raw.is_empty() || raw == b"null" {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(raw)?)
}

struct VirtualDevice {
    name: String,
    device_type: DeviceType,
    state: Mutex<DeviceState>,
}

impl VirtualDevice {
    fn new(request: LoadRequest) -> Result<Self, LoadError> {
        let config: DeviceConfig = parse_config(&request.config)?;
        let mut state = DeviceState::new();
        match request.device_type {
            DeviceType::Sensor => {
                state.insert("value".into(), config.value.unwrap_or(Value::Null));
            }
            DeviceType::Light => {
                state.insert("on".into(), json!(config.on));
                state.insert("brightness".into(), json!(config.brightness.unwrap_or(100)));
            }
            _ => {
                state.insert("on".into(), json!(config.on));
            }
        }
        Ok(Self {
            name: request.name,
            device_type: request.device_type,
            state: Mutex::new(state),
        })
    }

    fn set_on(state: &mut DeviceState, on: bool) {
        state.insert("on".into(), json!(on));
    }
}

#[async_trait]
impl DeviceInstance for VirtualDevice {
    fn commands(&self) -> Vec<String> {
        let names: &[&str] = match self.device_type {
            DeviceType::Sensor => &["refresh"],
            DeviceType::Light => &["on", "off", "toggle", "set_brightness"],
            _ => &["on", "off", "toggle"],
        };
        names.iter().map(|n| n.to_string()).collect()
    }

    async fn state(&self) -> DeviceState {
        self.state.lock().await.clone()
    }

    async fn invoke(&self, command: &DeviceCommand) -> Result<DeviceState, DeviceError> {
        if !self.commands().iter().any(|c| c == command.name()) {
            return Err(DeviceError::Unsupported(command.name()));
        }
        let mut state = self.state.lock().await;
        match command {
            DeviceCommand::On => Self::set_on(&mut state, true),
            DeviceCommand::Off => Self::set_on(&mut state, false),
            DeviceCommand::Toggle => {
                let on = state.get("on").and_then(Value::as_bool).unwrap_or(false);
                Self::set_on(&mut state, !on);
            }
            DeviceCommand::SetBrightness { value } => {
                state.insert("brightness".into(), json!(value));
                Self::set_on(&mut state, *value > 0);
            }
            _ => {}
        }
        debug!("{} handled {}", self.name, command.name());
        Ok(state.clone())
    }

    async fn unload(&self) {
        debug!("Unloading virtual device {}", self.name);
    }
}

#[derive(Debug, Default, Deserialize)]
struct HubConfig {
    #[serde(default)]
    children: Vec<ChildConfig>,
}

#[derive(Debug, Deserialize)]
struct ChildConfig {
    name: String,
    device_type: DeviceType,
    #[serde(default)]
    config: Value,
}

fn hub_state(children: usize) -> DeviceState {
    let mut state = DeviceState::new();
    state.insert("children".into(), json!(children));
    state
}

struct VirtualHub {
    name: String,
    children: usize,
    announcer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl VirtualHub {
    fn start(request: LoadRequest) -> Result<Self, LoadError> {
        let config: HubConfig = parse_config(&request.config)?;
        let children = config.children.len();
        let announcer = request.init.discovery.clone().map(|discovery| {
            let name = request.name.clone();
            let updates = request.init.updates.clone();
            tokio::spawn(async move {
                for child in config.children {
                    let found = DiscoveredDevice {
                        device_type: child.device_type,
                        name: child.name,
                        config: child.config,
                    };
                    if discovery.send(found).await.is_err() {
                        debug!("Hub {} discovery listener went away", name);
                        return;
                    }
                }
                let mut state = hub_state(children);
                state.insert("announced".into(), json!(true));
                let _ = updates.send(state).await;
            })
        });
        info!("Virtual hub {} announcing {} children", request.name, children);
        Ok(Self {
            name: request.name,
            children,
            announcer: std::sync::Mutex::new(announcer),
        })
    }
}

#[async_trait]
impl DeviceInstance for VirtualHub {
    fn commands(&self) -> Vec<String> {
        vec!["refresh".to_string()]
    }

    async fn state(&self) -> DeviceState {
        hub_state(self.children)
    }

    async fn invoke(&self, command: &DeviceCommand) -> Result<DeviceState, DeviceError> {
        match command {
            DeviceCommand::Refresh => Ok(self.state().await),
            other => Err(DeviceError::Unsupported(other.name())),
        }
    }

    async fn unload(&self) {
        if let Ok(mut announcer) = self.announcer.lock() {
            if let Some(task) = announcer.take() {
                task.abort();
            }
        }
        debug!("Unloading virtual hub {}", self.name);
    }
}
