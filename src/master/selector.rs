//! Device selectors and the placement catalog.

use std::collections::{BTreeMap, HashMap, HashSet};

use regex::{Regex, RegexBuilder};
use thiserror::Error;

use crate::config::DeviceConfig;
use crate::types::{DeviceAssignment, Properties};

/// Synthetic property carrying the worker's own name.
pub const NAME_PROPERTY: &str = "name";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("device name `{0}` is used more than once")]
    DuplicateName(String),
    #[error("devices `{first}` and `{second}` would both load as `{id}`")]
    DuplicateId {
        id: String,
        first: String,
        second: String,
    },
    #[error("device `{device}` has an invalid selector for `{key}`: {source}")]
    InvalidSelector {
        device: String,
        key: String,
        #[source]
        source: regex::Error,
    },
}

/// Property constraints a worker must satisfy to host a device.
///
/// Keys are compared lower-cased; values are case-insensitive, unanchored
/// regular expressions.
#[derive(Debug, Clone)]
pub struct Selector {
    rules: Vec<(String, Regex)>,
}

impl Selector {
    pub fn compile(selector: &BTreeMap<String, String>) -> Result<Self, (String, regex::Error)> {
        let rules = selector
            .iter()
            .map(|(key, pattern)| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|re| (key.to_lowercase(), re))
                    .map_err(|e| (key.clone(), e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn specificity(&self) -> usize {
        self.rules.len()
    }

    /// `properties` must already be normalized.
    pub fn matches(&self, properties: &Properties) -> bool {
        self.rules.iter().all(|(key, re)| {
            properties
                .get(key)
                .map(|value| re.is_match(value))
                .unwrap_or(false)
        })
    }
}

/// Lower-cases property keys and injects the worker's name.
pub fn normalize_properties(node_id: &str, properties: &Properties) -> Properties {
    let mut normalized: Properties = properties
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect();
    normalized.insert(NAME_PROPERTY.to_string(), node_id.to_string());
    normalized
}

/// Equality of two normalized property maps, ignoring the name property.
pub fn same_properties(a: &Properties, b: &Properties) -> bool {
    let strip = |p: &Properties| {
        p.iter()
            .filter(|(k, _)| k.as_str() != NAME_PROPERTY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Properties>()
    };
    strip(a) == strip(b)
}

/// Compiles a device-ID pattern.  `*` and `?` are glob wildcards; anything
/// else matches literally.  Matching is case-insensitive and anchored.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    RegexBuilder::new(&re).case_insensitive(true).build()
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub assignment: DeviceAssignment,
    pub selector: Selector,
}

/// Immutable set of devices to place, most specific selectors first.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    entries: Vec<CatalogEntry>,
}

impl DeviceCatalog {
    pub fn new(devices: &[DeviceConfig]) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        let mut ids: HashMap<String, &str> = HashMap::new();
        let mut entries = Vec::with_capacity(devices.len());
        for device in devices {
            let name = device.name.trim();
            if !seen.insert(name) {
                return Err(CatalogError::DuplicateName(name.to_string()));
            }
            let assignment = device.assignment();
            let id = assignment.device_id();
            if let Some(first) = ids.get(&id) {
                return Err(CatalogError::DuplicateId {
                    id,
                    first: first.to_string(),
                    second: device.name.clone(),
                });
            }
            ids.insert(id, &device.name);
            let selector = Selector::compile(&device.selector).map_err(|(key, source)| {
                CatalogError::InvalidSelector {
                    device: device.name.clone(),
                    key,
                    source,
                }
            })?;
            entries.push(CatalogEntry {
                assignment,
                selector,
            });
        }
        // Stable: equally specific devices keep their configured order.
        entries.sort_by(|a, b| b.selector.specificity().cmp(&a.selector.specificity()));
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
