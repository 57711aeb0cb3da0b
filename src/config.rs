use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DeviceAssignment, DeviceKind, DeviceType, Properties};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Worker,
    /// Master and worker in one process over the in-memory bus.
    Standalone,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub role: Role,
    pub node_id: String,
    pub master: MasterConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MasterConfig {
    pub worker_stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    pub max_devices: usize,
    #[serde(default)]
    pub properties: Properties,
    pub device_load_timeout_secs: u64,
    pub long_time_no_see_secs: u64,
    pub discovery_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub stale_check_interval_secs: u64,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Catalog entry for a device the master has to place.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub name: String,
    pub plugin: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub kind: DeviceKind,
    #[serde(default)]
    pub config: Value,
    /// Property key → regex the hosting worker must match.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

impl DeviceConfig {
    pub fn assignment(&self) -> DeviceAssignment {
        DeviceAssignment {
            plugin: self.plugin.clone(),
            device_type: self.device_type,
            kind: self.kind,
            name: self.name.clone(),
            config: self.config.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Standalone,
            node_id: "hearth".into(),
            master: MasterConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            worker_stale_after_secs: 120,
            sweep_interval_secs: 15,
            devices: Vec::new(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_devices: 50,
            properties: Properties::new(),
            device_load_timeout_secs: 5,
            long_time_no_see_secs: 180,
            discovery_interval_secs: 5,
            retry_interval_secs: 30,
            stale_check_interval_secs: 30,
            secrets: HashMap::new(),
        }
    }
}

impl MasterConfig {
    pub fn worker_stale_after(&self) -> Duration {
        Duration::from_secs(self.worker_stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl WorkerConfig {
    pub fn device_load_timeout(&self) -> Duration {
        Duration::from_secs(self.device_load_timeout_secs)
    }

    pub fn long_time_no_see(&self) -> Duration {
        Duration::from_secs(self.long_time_no_see_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_check_interval_secs)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("hearth.toml"))
            .merge(Json::file("hearth.json"))
            .merge(Env::prefixed("HEARTH_").split("__"))
    }
}
