//! Per-device RSSI smoothing and absence detection.
//!
//! Each scan cycle every known device first gets its missing counter bumped,
//! then the devices heard in the batch are reset and their signal folded into
//! an exponential moving average. A device whose counter lands exactly on
//! `max_missing` is reported as expired once and its signal pinned to the
//! "no reception" value until it shows up again.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::config::TrackerConfig;
use crate::messages::{DeviceEvent, EventKind, Observation};

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceRecord {
    pub smoothed: f64,
    /// Cycles since the device was last heard, 0 if heard this cycle.
    pub missing: u32,
    /// Consecutive sightings since the last reset.
    pub readings: u32,
    expired: bool,
}

impl DeviceRecord {
    fn new() -> Self {
        DeviceRecord {
            smoothed: 0.0,
            missing: 0,
            readings: 0,
            expired: false,
        }
    }

    #[cfg(test)]
    pub fn is_expired(&self) -> bool {
        self.expired
    }
}

pub struct PresenceTracker {
    config: TrackerConfig,
    devices: BTreeMap<String, DeviceRecord>,
}

impl PresenceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        PresenceTracker {
            config,
            devices: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn device(&self, address: &str) -> Option<&DeviceRecord> {
        self.devices.get(address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Runs one scan cycle over `batch` and returns the resulting events:
    /// one `New`/`Updated` per observation in batch order, followed by an
    /// `Expired` for every device that just crossed the absence threshold.
    pub fn apply_observations(&mut self, batch: &[Observation]) -> Vec<DeviceEvent> {
        for record in self.devices.values_mut() {
            record.missing = record.missing.saturating_add(1);
        }

        let mut events = Vec::with_capacity(batch.len());
        for observation in batch {
            events.push(self.observe(observation));
        }

        let max_missing = self.config.max_missing;
        let no_reception = self.config.no_reception_rssi;
        for (address, record) in self
            .devices
            .iter_mut()
            .filter(|(_, record)| record.missing == max_missing)
        {
            debug!("Device {} no longer available", address);
            record.smoothed = no_reception;
            record.expired = true;
            events.push(DeviceEvent {
                address: address.clone(),
                kind: EventKind::Expired,
                smoothed: no_reception,
            });
        }

        events
    }

    fn observe(&mut self, observation: &Observation) -> DeviceEvent {
        let mut is_new = false;
        let record = self
            .devices
            .entry(observation.address.clone())
            .or_insert_with(|| {
                is_new = true;
                DeviceRecord::new()
            });

        record.missing = 0;
        if record.expired {
            // Coming back from expiry starts over exactly like a new device.
            record.expired = false;
            record.smoothed = 0.0;
            record.readings = 0;
        } else {
            record.readings = record.readings.saturating_add(1);
        }

        let raw = f64::from(observation.rssi);
        record.smoothed -= self.config.smoothing * (record.smoothed - raw);

        debug!("Addr: {}, RSSI: {}", observation.address, record.smoothed);
        if record.readings < self.config.startup_readings {
            info!("Device {} still in startup phase", observation.address);
        }

        DeviceEvent {
            address: observation.address.clone(),
            kind: if is_new {
                EventKind::New
            } else {
                EventKind::Updated
            },
            smoothed: record.smoothed,
        }
    }
}
