use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::messages::{DeviceSighting, Inbound, Telemetry};
use crate::mqtt::Transport;
use crate::registry::AccessoryRegistry;
use crate::room::{RoomEngine, RoomHandle};
use crate::topics::Topics;

/// Discovers rooms from node telemetry and routes sightings to them.
pub struct Manager {
    config: AppConfig,
    topics: Topics,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn AccessoryRegistry>,
    rooms: HashMap<String, RoomHandle>,
    subscribed: bool,
}

impl Manager {
    pub fn new(
        config: AppConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn AccessoryRegistry>,
    ) -> Self {
        Manager {
            topics: Topics::new(config.topic_path()),
            config,
            transport,
            registry,
            rooms: HashMap::new(),
            subscribed: false,
        }
    }

    /// Processes inbound events until the sender goes away. Transport errors
    /// end the loop.
    pub async fn run_loop(mut self, mut rx: mpsc::UnboundedReceiver<Inbound>) -> anyhow::Result<()> {
        while let Some(inbound) = rx.recv().await {
            self.handle(inbound).await?;
        }
        info!("Exiting manager event loop");
        Ok(())
    }

    pub async fn handle(&mut self, inbound: Inbound) -> anyhow::Result<()> {
        match inbound {
            Inbound::Connected => self.subscribe().await,
            Inbound::Publish { topic, payload } => {
                self.dispatch(&topic, &payload).await;
                Ok(())
            }
        }
    }

    async fn subscribe(&mut self) -> anyhow::Result<()> {
        if self.subscribed {
            return Ok(());
        }

        let topic = self.topics.telemetry_wildcard();
        self.transport.subscribe(&topic).await?;
        self.subscribed = true;
        info!("Subscribed to {}", topic);
        Ok(())
    }

    async fn dispatch(&mut self, topic: &str, payload: &[u8]) {
        if let Some(room) = self.topics.match_telemetry(topic) {
            self.on_telemetry(room, payload).await;
            return;
        }

        for (room, handle) in &self.rooms {
            let Some(device_id) = self.topics.match_device(topic, room) else {
                continue;
            };

            match DeviceSighting::decode(payload) {
                Ok(sighting) => {
                    if !handle.send(sighting) {
                        error!("[{}] Room is not running, dropping sighting of {}", room, device_id);
                    }
                }
                Err(err) => debug!("[{}] Dropping sighting of {}: {}", room, device_id, err),
            }
            return;
        }

        debug!("Ignoring message on topic {}", topic);
    }

    async fn on_telemetry(&mut self, room: &str, payload: &[u8]) {
        if self.rooms.contains_key(room) {
            return;
        }

        let telemetry = match Telemetry::decode(payload) {
            Ok(telemetry) => telemetry,
            Err(err) => {
                debug!("[{}] Dropping telemetry: {}", room, err);
                return;
            }
        };

        let accessory = match self.registry.find_or_create(room, &telemetry).await {
            Ok(accessory) => accessory,
            Err(err) => {
                error!("[{}] Error registering accessory: {:?}", room, err);
                return;
            }
        };

        if accessory.restored {
            info!("[{}] Reattaching restored accessory", room);
        }

        let engine = RoomEngine::new(
            self.config.room(room),
            accessory,
            self.topics.clone(),
            self.transport.clone(),
            self.registry.clone(),
            self.config.step_timeout(),
        );
        info!("Initialized room {}", engine.name());
        self.rooms.insert(room.to_string(), engine.spawn());
    }
}
