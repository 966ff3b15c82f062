use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

use crate::config::RoomConfig;
use crate::messages::DeviceSighting;
use crate::mqtt::Transport;
use crate::registry::{Accessory, AccessoryRegistry};
use crate::topics::Topics;

/// Quiet period before an occupancy change is committed.
pub const DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct LiveDevice {
    sighting: DeviceSighting,
    expires_at: Instant,
}

pub struct RoomEngine {
    settings: RoomConfig,
    accessory: Accessory,
    topics: Topics,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn AccessoryRegistry>,
    step_timeout: Option<Duration>,
    devices: HashMap<String, LiveDevice>,
    debounce_at: Option<Instant>,
    occupied: bool,
    last_found: Option<Vec<String>>,
}

/// Sending side of a running room.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    tx: mpsc::UnboundedSender<DeviceSighting>,
}

impl RoomHandle {
    /// Returns false once the room task has stopped.
    pub fn send(&self, sighting: DeviceSighting) -> bool {
        self.tx.send(sighting).is_ok()
    }
}

impl RoomEngine {
    pub fn new(
        settings: RoomConfig,
        accessory: Accessory,
        topics: Topics,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn AccessoryRegistry>,
        step_timeout: Option<Duration>,
    ) -> Self {
        RoomEngine {
            settings,
            accessory,
            topics,
            transport,
            registry,
            step_timeout,
            devices: HashMap::new(),
            debounce_at: None,
            occupied: false,
            last_found: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Starts the room task: setup first, then the presence loop.
    pub fn spawn(self) -> RoomHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx));
        RoomHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DeviceSighting>) {
        self.setup().await;

        let mut watched: Vec<&str> = self.settings.devices.iter().map(String::as_str).collect();
        watched.sort_unstable();
        info!(
            "[{}] Listening to presence data. Watched devices: {:?}",
            self.name(),
            watched
        );

        loop {
            tokio::select! {
                biased;
                message = rx.recv() => match message {
                    Some(sighting) => self.on_device_message(sighting),
                    None => break,
                },
                _ = sleep_until_some(self.next_expiry()) => self.expire(Instant::now()),
                _ = sleep_until_some(self.debounce_at) => self.apply_presence().await,
            }
        }

        debug!("[{}] Room stopped", self.name());
    }

    /// Pushes the room's node settings, then subscribes to its sightings.
    ///
    /// Settings that are not configured are skipped without a publish. Each
    /// step completes before the next one starts.
    pub async fn setup(&self) {
        let room = self.name();

        if let Some(active_scan) = self.settings.active_scan {
            let payload = if active_scan { "ON" } else { "OFF" };
            let topic = self.topics.active_scan_set(room);
            if self.step(&topic, self.transport.publish(&topic, payload, false)).await {
                info!("[{}] Turned active_scan {}", room, payload);
            }
        }

        if let Some(absorption) = self.settings.absorption {
            let topic = self.topics.absorption_set(room);
            let payload = absorption.to_string();
            if self.step(&topic, self.transport.publish(&topic, &payload, false)).await {
                info!("[{}] Set absorption to {}", room, payload);
            }
        }

        if let Some(max_distance) = self.settings.max_distance {
            let topic = self.topics.max_distance_set(room);
            let payload = max_distance.to_string();
            if self.step(&topic, self.transport.publish(&topic, &payload, false)).await {
                info!("[{}] Set max_distance to {}", room, payload);
            }
        }

        let topic = self.topics.device_subscription(room);
        if self.step(&topic, self.transport.subscribe(&topic)).await {
            info!(
                "[{}] Subscribed to device topic. Room ready. Device timeout: {}ms",
                room,
                self.settings.device_timeout().as_millis()
            );
        }
    }

    async fn step(&self, topic: &str, op: impl Future<Output = anyhow::Result<()>>) -> bool {
        let result = match self.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, op).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "[{}] No acknowledgment for {} after {:?}, continuing setup",
                        self.name(),
                        topic,
                        limit
                    );
                    return false;
                }
            },
            None => op.await,
        };

        if let Err(err) = result {
            error!("[{}] Setup of {} failed: {:?}", self.name(), topic, err);
            return false;
        }
        true
    }

    /// Records a sighting if the device is watched.
    ///
    /// Presence is re-evaluated for every sighting, watched or not.
    pub fn on_device_message(&mut self, sighting: DeviceSighting) {
        if self.settings.watches(&sighting.id) {
            debug!(
                "[{}] Saw {} at {:.2}m (rssi {})",
                self.name(),
                sighting.id,
                sighting.distance,
                sighting.rssi
            );
            let expires_at = Instant::now() + self.settings.device_timeout();
            self.devices.insert(
                sighting.id.clone(),
                LiveDevice {
                    sighting,
                    expires_at,
                },
            );
        }

        self.handle_presence();
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.devices.values().map(|d| d.expires_at).min()
    }

    /// Drops every device whose deadline is at or before `now`.
    fn expire(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, device)| device.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            self.devices.remove(&id);
            info!("[{}] Device \"{}\" timed out", self.name(), id);
            self.handle_presence();
        }
    }

    fn handle_presence(&mut self) {
        self.debounce_at = Some(Instant::now() + DEBOUNCE);
    }

    async fn apply_presence(&mut self) {
        self.debounce_at = None;

        let presence = self.has_presence();
        if presence == self.occupied {
            return;
        }
        self.occupied = presence;

        if let Err(err) = self
            .registry
            .occupancy_changed(&self.accessory, presence)
            .await
        {
            error!("[{}] Error reporting occupancy: {:?}", self.name(), err);
        }

        info!(
            "[{}] Updated sensor to \"{}\"",
            self.name(),
            if presence { "occupied" } else { "unoccupied" }
        );
    }

    fn has_presence(&mut self) -> bool {
        let mut found: Vec<String> = self.devices.keys().cloned().collect();
        found.sort_unstable();

        if self.last_found.as_ref() != Some(&found) {
            info!("[{}] Found: {:?}", self.name(), found);
            self.last_found = Some(found);
        }

        if let Some(nearest) = self
            .devices
            .values()
            .map(|d| &d.sighting)
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
        {
            debug!(
                "[{}] Nearest device: {} at {:.2}m",
                self.name(),
                nearest.id,
                nearest.distance
            );
        }

        !self.devices.is_empty()
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
