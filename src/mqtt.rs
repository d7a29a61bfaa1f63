use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config;
use crate::error::SessionError;

const REQUEST_CAPACITY: usize = 10;
const REDIAL_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// The slice of a broker client the publishing side depends on.
pub trait Broker {
    /// Dials the broker and waits for the connection to be acknowledged.
    async fn connect(&mut self) -> Result<(), SessionError>;

    /// Returns `true` once the session is usable, re-establishing it if it
    /// dropped since the last call.
    async fn reconnect(&mut self) -> bool;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), SessionError>;

    async fn disconnect(&mut self);
}

struct Link {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    driver: JoinHandle<()>,
}

/// rumqttc-backed [`Broker`].
///
/// rumqttc only makes progress while its event loop is polled, so after the
/// first successful connect the loop is handed to a background task that
/// keeps the session alive, redials after failures and reports the
/// connection state through a watch channel.
pub struct MqttBroker {
    options: MqttOptions,
    reconnect_timeout: Duration,
    link: Option<Link>,
}

impl MqttBroker {
    pub fn new(config: &config::MqttConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| "beacon-presence".to_string());

        let mut options = MqttOptions::new(
            client_id,
            config.host.clone(),
            config.port.unwrap_or(1883),
        );
        options.set_keep_alive(Duration::from_secs(
            config.keep_alive_seconds.unwrap_or(10).max(1),
        ));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            options.set_credentials(username.clone(), password.clone());
        }

        MqttBroker {
            options,
            reconnect_timeout: config.reconnect_timeout(),
            link: None,
        }
    }

    fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.driver.abort();
        }
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.close_link();
    }
}

impl Broker for MqttBroker {
    async fn connect(&mut self) -> Result<(), SessionError> {
        self.close_link();

        let (host, port) = self.options.broker_address();
        info!("Connecting to MQTT broker at {}:{}", host, port);

        let (client, mut event_loop) =
            AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        loop {
            match event_loop.poll().await? {
                Event::Incoming(Packet::ConnAck(_)) => break,
                other => debug!("Ignoring event while connecting: {:?}", other),
            }
        }

        let (state_tx, connected) = watch::channel(true);
        let driver = tokio::spawn(drive_event_loop(event_loop, state_tx));
        self.link = Some(Link {
            client,
            connected,
            driver,
        });
        Ok(())
    }

    async fn reconnect(&mut self) -> bool {
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        if *link.connected.borrow() {
            return true;
        }

        debug!("Waiting for MQTT session to come back");
        let reconnected = link.connected.wait_for(|up| *up);
        matches!(
            tokio::time::timeout(self.reconnect_timeout, reconnected).await,
            Ok(Ok(_))
        )
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), SessionError> {
        let link = self.link.as_ref().ok_or(SessionError::NotConnected)?;
        // Waits while the request queue is full, the driver drains it.
        link.client
            .publish(topic, QoS::AtMostOnce, retain, payload)
            .await
            .map_err(|source| SessionError::Publish {
                topic: topic.to_string(),
                source,
            })
    }

    async fn disconnect(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        debug!("Disconnecting MQTT client");
        if let Err(err) = link.client.try_disconnect() {
            warn!("Clean disconnect failed: {}", err);
        }
        // The driver exits once DISCONNECT is written.
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, &mut link.driver).await;
        if flushed.is_err() {
            link.driver.abort();
        }
    }
}

async fn drive_event_loop(mut event_loop: EventLoop, state_tx: watch::Sender<bool>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !state_tx.send_replace(true) {
                    info!("Reconnected to MQTT broker");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                state_tx.send_replace(false);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect))
            | Err(ConnectionError::RequestsDone) => {
                debug!("MQTT event loop stopped");
                state_tx.send_replace(false);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                if state_tx.send_replace(false) {
                    warn!("Lost connection to MQTT broker: {}", err);
                } else {
                    debug!("MQTT redial failed: {}", err);
                }
                tokio::time::sleep(REDIAL_DELAY).await;
            }
        }
    }
}
