use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde_derive::Deserialize;

/// Device timeout used when a room has no setting (or a zero setting).
pub const DEFAULT_DEVICE_TIMEOUT_MS: u64 = 5000;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub registry: Option<RegistryConfig>,
    pub setup: Option<SetupConfig>,
    pub rooms: Option<Vec<RoomConfig>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct RegistryConfig {
    pub state_topic_path: Option<String>,
    pub cache_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct SetupConfig {
    pub step_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct RoomConfig {
    pub name: String,
    pub max_distance: Option<f64>,
    pub absorption: Option<f64>,
    pub active_scan: Option<bool>,
    pub timeout: Option<u64>,
    #[serde(default)]
    pub devices: HashSet<String>,
}

impl AppConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;

        toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn topic_path(&self) -> String {
        self.mqtt
            .topic_path
            .clone()
            .unwrap_or("espresense".to_string())
    }

    /// Settings for `name`, or an empty watch-list with default timeout when
    /// the room is not configured.
    pub fn room(&self, name: &str) -> RoomConfig {
        self.rooms
            .iter()
            .flatten()
            .find(|room| room.name == name)
            .cloned()
            .unwrap_or_else(|| RoomConfig {
                name: name.to_string(),
                ..Default::default()
            })
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.setup
            .as_ref()
            .and_then(|s| s.step_timeout_ms)
            .map(Duration::from_millis)
    }
}

impl RoomConfig {
    pub fn device_timeout(&self) -> Duration {
        match self.timeout {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => Duration::from_millis(DEFAULT_DEVICE_TIMEOUT_MS),
        }
    }

    pub fn watches(&self, device_id: &str) -> bool {
        self.devices.contains(device_id)
    }
}
