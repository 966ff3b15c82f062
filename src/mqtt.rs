use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use rumqttc::{MqttOptions, QoS};
use tokio::sync::mpsc;

use crate::{config, messages::Inbound};

/// Publish/subscribe capability of the bus, as seen by rooms and the registry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> anyhow::Result<()>;

    async fn subscribe(&self, topic: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"presence-rs".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id,
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (MqttClient { client }, eventloop)
    }

    /// Drives the connection and forwards broker traffic to `tx`.
    ///
    /// Any connection error is returned to the caller; there is no reconnect.
    pub async fn event_loop(
        eventloop: &mut rumqttc::EventLoop,
        tx: mpsc::UnboundedSender<Inbound>,
    ) -> anyhow::Result<()> {
        loop {
            match eventloop.poll().await? {
                rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                    debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                    let message = Inbound::Publish {
                        topic: p.topic,
                        payload: p.payload.to_vec(),
                    };
                    if tx.send(message).is_err() {
                        debug!("Inbound receiver closed, stopping MQTT event loop");
                        return Ok(());
                    }
                }
                rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                    debug!("Subscription acknowledged");
                }
                rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                    info!("Connected to MQTT");
                    if tx.send(Inbound::Connected).is_err() {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    /// Sends a disconnect and drives the event loop until it has gone out.
    pub async fn shutdown(&self, eventloop: &mut rumqttc::EventLoop) -> anyhow::Result<()> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await?;

        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(2), flush).await.is_err() {
            debug!("Timed out flushing MQTT disconnect");
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> anyhow::Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, retain, payload.to_string())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.client.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }
}

/// Lowercases a name and replaces anything but alphanumerics with underscores
/// so it can serve as a single topic level.
pub fn sanitize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
