use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::bail;

use async_trait::async_trait;

use crate::messages::{DeviceSighting, Telemetry};
use crate::mqtt::Transport;
use crate::registry::{Accessory, AccessoryRegistry, DisplayInfo};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Publish(String, String),
    Subscribe(String),
}

#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    retained: Mutex<Vec<String>>,
    /// Publishes to topics ending with this suffix never complete.
    stall_suffix: Option<String>,
    /// Number of upcoming publishes that fail.
    failing: AtomicUsize,
}

impl RecordingTransport {
    pub fn stalling(suffix: &str) -> Self {
        RecordingTransport {
            stall_suffix: Some(suffix.to_string()),
            ..Default::default()
        }
    }

    pub fn failing(publishes: usize) -> Self {
        RecordingTransport {
            failing: AtomicUsize::new(publishes),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Publish(topic, payload) => Some((topic, payload)),
                Call::Subscribe(_) => None,
            })
            .collect()
    }

    /// Topics of successful publishes made with the retain flag.
    pub fn retained(&self) -> Vec<String> {
        self.retained.lock().unwrap().clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Subscribe(topic) => Some(topic),
                Call::Publish(..) => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> anyhow::Result<()> {
        if self
            .stall_suffix
            .as_ref()
            .is_some_and(|suffix| topic.ends_with(suffix.as_str()))
        {
            std::future::pending::<()>().await;
        }
        let failed = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            bail!("publish to {} rejected", topic);
        }
        if retain {
            self.retained.lock().unwrap().push(topic.to_string());
        }
        self.calls
            .lock()
            .unwrap()
            .push(Call::Publish(topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Subscribe(topic.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingRegistry {
    created: Mutex<Vec<String>>,
    changes: Mutex<Vec<(String, bool)>>,
    /// Rooms reported as restored from a previous run.
    restored: Vec<String>,
}

impl RecordingRegistry {
    pub fn with_restored(rooms: &[&str]) -> Self {
        RecordingRegistry {
            restored: rooms.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn changes(&self) -> Vec<(String, bool)> {
        self.changes.lock().unwrap().clone()
    }

    pub fn changes_for(&self, room: &str) -> Vec<bool> {
        self.changes()
            .into_iter()
            .filter(|(r, _)| r == room)
            .map(|(_, occupied)| occupied)
            .collect()
    }
}

#[async_trait]
impl AccessoryRegistry for RecordingRegistry {
    async fn find_or_create(
        &self,
        room: &str,
        telemetry: &Telemetry,
    ) -> anyhow::Result<Accessory> {
        let restored = self.restored.iter().any(|r| r == room);
        if !restored {
            self.created.lock().unwrap().push(room.to_string());
        }
        Ok(Accessory {
            room: room.to_string(),
            display: DisplayInfo::from_telemetry(room, telemetry),
            telemetry: telemetry.clone(),
            restored,
        })
    }

    async fn occupancy_changed(
        &self,
        accessory: &Accessory,
        occupied: bool,
    ) -> anyhow::Result<()> {
        self.changes
            .lock()
            .unwrap()
            .push((accessory.room.clone(), occupied));
        Ok(())
    }
}

pub fn telemetry() -> Telemetry {
    Telemetry::decode(
        br#"{"ip":"192.168.1.40","uptime":1234,"firm":"esp32","rssi":-61,"ver":"v3.1.2"}"#,
    )
    .unwrap()
}

pub fn accessory(room: &str) -> Accessory {
    Accessory {
        room: room.to_string(),
        display: DisplayInfo::from_telemetry(room, &telemetry()),
        telemetry: telemetry(),
        restored: false,
    }
}

pub fn sighting(id: &str) -> DeviceSighting {
    DeviceSighting {
        id: id.to_string(),
        rssi: -70.0,
        distance: 1.5,
        mac: "4a1b2c3d4e5f".to_string(),
        name: None,
        disc: None,
        id_type: None,
        rssi_at_1m: None,
        raw: None,
        speed: None,
        interval: None,
    }
}

pub fn sighting_payload(id: &str) -> Vec<u8> {
    format!(r#"{{"id":"{id}","rssi":-70,"distance":1.5,"mac":"4a1b2c3d4e5f"}}"#).into_bytes()
}
