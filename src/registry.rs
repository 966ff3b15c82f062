use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use log::info;
use serde_derive::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::messages::Telemetry;
use crate::mqtt::{Transport, sanitize_name};

pub const MANUFACTURER: &str = "ESPresense";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DisplayInfo {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
}

impl DisplayInfo {
    pub fn from_telemetry(room: &str, telemetry: &Telemetry) -> Self {
        DisplayInfo {
            name: room.to_string(),
            manufacturer: MANUFACTURER.to_string(),
            model: or_dash(&telemetry.firm),
            serial_number: or_dash(&telemetry.ip),
        }
    }
}

fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Accessory {
    pub room: String,
    pub display: DisplayInfo,
    /// Telemetry seen when the accessory was first registered.
    pub telemetry: Telemetry,
    #[serde(skip)]
    pub restored: bool,
}

#[async_trait]
pub trait AccessoryRegistry: Send + Sync {
    /// Returns the accessory for `room`, registering a new one if none exists.
    async fn find_or_create(&self, room: &str, telemetry: &Telemetry)
    -> anyhow::Result<Accessory>;

    async fn occupancy_changed(&self, accessory: &Accessory, occupied: bool)
    -> anyhow::Result<()>;
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct AccessoryCache {
    accessories: Vec<Accessory>,
}

#[derive(Serialize, Debug)]
struct OccupancyMqttMessage<'a> {
    room: &'a str,
    occupied: bool,
}

#[derive(Default)]
struct RegistryState {
    accessories: BTreeMap<String, Accessory>,
    /// Rooms whose `info` went out since this process started.
    announced: HashSet<String>,
}

pub struct MqttAccessoryRegistry {
    transport: Arc<dyn Transport>,
    state_topic_path: String,
    cache_path: Option<PathBuf>,
    state: Mutex<RegistryState>,
}

impl MqttAccessoryRegistry {
    /// Creates the registry, restoring accessories from `cache_path` if the
    /// file exists.
    pub async fn load(
        transport: Arc<dyn Transport>,
        state_topic_path: String,
        cache_path: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let mut state = RegistryState::default();

        if let Some(path) = cache_path.as_ref() {
            if tokio::fs::try_exists(path).await? {
                let contents = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading accessory cache {}", path.display()))?;
                let cache: AccessoryCache = serde_json::from_slice(&contents)
                    .with_context(|| format!("parsing accessory cache {}", path.display()))?;

                for mut accessory in cache.accessories {
                    info!("Loading accessory \"{}\" from cache", accessory.display.name);
                    accessory.restored = true;
                    state.accessories.insert(accessory.room.clone(), accessory);
                }
            }
        }

        Ok(MqttAccessoryRegistry {
            transport,
            state_topic_path,
            cache_path,
            state: Mutex::new(state),
        })
    }

    fn room_topic(&self, room: &str, leaf: &str) -> String {
        format!("{}/{}/{}", self.state_topic_path, sanitize_name(room), leaf)
    }

    async fn announce(&self, accessory: &Accessory) -> anyhow::Result<()> {
        self.transport
            .publish(
                &self.room_topic(&accessory.room, "info"),
                &serde_json::to_string(&accessory.display)?,
                true,
            )
            .await
    }

    async fn persist(&self, accessories: &BTreeMap<String, Accessory>) -> anyhow::Result<()> {
        let Some(path) = self.cache_path.as_ref() else {
            return Ok(());
        };

        let cache = AccessoryCache {
            accessories: accessories.values().cloned().collect(),
        };
        tokio::fs::write(path, serde_json::to_vec_pretty(&cache)?)
            .await
            .with_context(|| format!("writing accessory cache {}", path.display()))
    }
}

#[async_trait]
impl AccessoryRegistry for MqttAccessoryRegistry {
    async fn find_or_create(
        &self,
        room: &str,
        telemetry: &Telemetry,
    ) -> anyhow::Result<Accessory> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.accessories.get(room).cloned() {
            if !state.announced.contains(room) {
                self.announce(&existing).await?;
                state.announced.insert(room.to_string());
            }
            return Ok(existing);
        }

        info!("Adding new accessory \"{}\"", room);

        let accessory = Accessory {
            room: room.to_string(),
            display: DisplayInfo::from_telemetry(room, telemetry),
            telemetry: telemetry.clone(),
            restored: false,
        };
        // Only an accessory whose info went out is registered.
        self.announce(&accessory).await?;

        state.accessories.insert(room.to_string(), accessory.clone());
        if let Err(err) = self.persist(&state.accessories).await {
            state.accessories.remove(room);
            return Err(err);
        }
        state.announced.insert(room.to_string());

        Ok(accessory)
    }

    async fn occupancy_changed(
        &self,
        accessory: &Accessory,
        occupied: bool,
    ) -> anyhow::Result<()> {
        let message = OccupancyMqttMessage {
            room: &accessory.room,
            occupied,
        };
        self.transport
            .publish(
                &self.room_topic(&accessory.room, "occupancy"),
                &serde_json::to_string(&message)?,
                true,
            )
            .await
    }
}
