use log::{error, warn};
use serde_derive::Serialize;

use crate::error::SessionError;
use crate::messages::{DeviceEvent, EventKind};
use crate::mqtt::Broker;

/// Home Assistant MQTT discovery payload for a signal-strength sensor.
#[derive(Debug, Serialize)]
struct DiscoveryConfig<'a> {
    name: &'a str,
    unit_of_measurement: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Published,
    /// The broker could not be reached, nothing was sent.
    NotConnected,
    /// The broker was reachable but the publish itself failed.
    Failed,
}

/// Turns tracker events into discovery and state messages.
pub struct PublishSession<B> {
    broker: B,
    prefix: String,
}

impl<B: Broker> PublishSession<B> {
    pub fn new(broker: B, prefix: impl Into<String>) -> Self {
        PublishSession {
            broker,
            prefix: prefix.into(),
        }
    }

    /// Single connection attempt, retrying is up to the caller.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        self.broker.connect().await
    }

    /// Publishes `event` at most once. Failures are logged, never returned.
    pub async fn deliver(&mut self, event: &DeviceEvent) -> Delivery {
        if !self.broker.reconnect().await {
            warn!("Failed to connect, dropping update for {}", event.address);
            return Delivery::NotConnected;
        }

        match self.publish(event).await {
            Ok(()) => Delivery::Published,
            Err(err) => {
                error!("Failed to update MQTT for {}: {}", event.address, err);
                Delivery::Failed
            }
        }
    }

    pub async fn close(&mut self) {
        self.broker.disconnect().await;
    }

    async fn publish(&mut self, event: &DeviceEvent) -> Result<(), SessionError> {
        let addr = normalize_address(&event.address);
        match event.kind {
            EventKind::New => {
                let payload = serde_json::to_vec(&DiscoveryConfig {
                    name: &addr,
                    unit_of_measurement: "dBm",
                })?;
                let topic = self.topic(&addr, "config");
                self.broker.publish(&topic, payload, true).await
            }
            EventKind::Updated | EventKind::Expired => {
                // Truncation toward zero, same as the sensor has always reported.
                let payload = (event.smoothed.trunc() as i64).to_string().into_bytes();
                let topic = self.topic(&addr, "state");
                self.broker.publish(&topic, payload, false).await
            }
        }
    }

    fn topic(&self, addr: &str, leaf: &str) -> String {
        format!("{}/sensor/{}/{}", self.prefix, addr, leaf)
    }

    #[cfg(test)]
    pub fn broker(&self) -> &B {
        &self.broker
    }
}

/// Strips the `:` separators so the address can be used as a topic level.
pub fn normalize_address(address: &str) -> String {
    address.chars().filter(|c| *c != ':').collect()
}
