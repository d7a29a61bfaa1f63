use std::time::Duration;

use anyhow::bail;
use mac_address::MacAddress;
use serde_derive::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    /// Home Assistant discovery prefix, `homeassistant` unless overridden.
    pub discovery_prefix: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    /// How long a delivery waits for a dropped session to come back.
    pub reconnect_timeout_seconds: Option<u64>,
}

impl MqttConfig {
    pub fn discovery_prefix(&self) -> &str {
        self.discovery_prefix.as_deref().unwrap_or("homeassistant")
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_seconds.unwrap_or(5))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    /// Index into the adapter list, `0` being the first (`hci0` on Linux).
    pub adapter_index: Option<usize>,
    pub duration_seconds: Option<u64>,
    pub interval_seconds: Option<u64>,
    pub connect_retry_seconds: Option<u64>,
    /// When set, only these addresses are tracked.
    pub allowed_addresses: Option<Vec<MacAddress>>,
}

impl ScanConfig {
    pub fn adapter_index(&self) -> usize {
        self.adapter_index.unwrap_or(0)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds.unwrap_or(3))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.unwrap_or(30))
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry_seconds.unwrap_or(10))
    }
}

/// Tunables for the presence filter.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// EMA weight of the newest sample.
    pub smoothing: f64,
    pub max_missing: u32,
    pub startup_readings: u32,
    pub no_reception_rssi: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            smoothing: 0.25,
            max_missing: 3,
            startup_readings: 4,
            no_reception_rssi: -200.0,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.tracker.smoothing > 0.0 && self.tracker.smoothing <= 1.0) {
            bail!(
                "tracker.smoothing must be in (0, 1], got {}",
                self.tracker.smoothing
            );
        }
        if self.tracker.max_missing == 0 {
            bail!("tracker.max_missing must be at least 1");
        }
        if self.scan.duration().is_zero() {
            bail!("scan.duration_seconds must be at least 1");
        }
        Ok(())
    }
}
