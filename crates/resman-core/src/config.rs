use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_TOPIC: &str = "lm_vnfc_state_change";

/// Manager configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Reported as `resourceManagerId` in instance details.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub resource_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub internal_dir: Option<PathBuf>,
    #[serde(default)]
    pub publish_all_ports: bool,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub events: Option<EventsConfig>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default = "default_locations")]
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Features {
    #[serde(default = "enabled")]
    pub asynchronous_transition_response: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            asynchronous_transition_response: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventsConfig {
    pub url: String,
    #[serde(default = "default_topic")]
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistenceConfig {
    #[serde(default = "enabled")]
    pub purge_on_start: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            purge_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Location {
    pub name: String,
    #[serde(rename = "type", default = "default_location_type")]
    pub kind: String,
}

impl Location {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: default_location_type(),
        }
    }
}

fn enabled() -> bool {
    true
}

fn default_name() -> String {
    "docker-rm".to_owned()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/resman")
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_owned()
}

fn default_location_type() -> String {
    "docker".to_owned()
}

fn default_locations() -> Vec<Location> {
    vec![Location::new("local")]
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            resource_dirs: Vec::new(),
            internal_dir: None,
            publish_all_ports: false,
            features: Features::default(),
            events: None,
            persistence: PersistenceConfig::default(),
            locations: default_locations(),
        }
    }
}

impl ManagerConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CoreError::Config(format!("invalid manager config: {e}")))?;
        if config.locations.is_empty() {
            return Err(CoreError::Config(
                "at least one deployment location is required".to_owned(),
            ));
        }
        Ok(config)
    }

    pub fn location(&self, name: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.name == name)
    }

    /// The location discovered and defaulted network instances are placed in.
    pub fn first_location(&self) -> Option<&Location> {
        self.locations.first()
    }
}
