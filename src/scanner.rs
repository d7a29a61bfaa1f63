use std::fmt::Debug;
use std::time::Duration;

use anyhow::Context as _;
use btleplug::api::{Central as _, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures::StreamExt as _;
use log::debug;
use tokio::runtime::Handle;

use crate::messages::Observation;

/// A radio that can listen for advertisements for a fixed window.
///
/// `scan` blocks for the whole window and is expected to run on a blocking
/// worker thread.
pub trait ScanSource: Send + Sync + 'static {
    fn scan(&self, duration: Duration) -> anyhow::Result<Vec<Observation>>;
}

pub struct BtleScanner {
    adapter: Adapter,
    runtime: Handle,
}

impl BtleScanner {
    pub async fn new(index: usize) -> anyhow::Result<Self> {
        use btleplug::api::Manager as _;

        let manager = btleplug::platform::Manager::new().await?;
        let adapters = manager.adapters().await?;
        let count = adapters.len();
        let adapter = adapters
            .into_iter()
            .nth(index)
            .with_context(|| format!("no bluetooth adapter #{index} ({count} found)"))?;

        debug!("Using adapter: {}", adapter.adapter_info().await?);

        Ok(BtleScanner {
            adapter,
            runtime: Handle::current(),
        })
    }

    /// Collects every peripheral that advertised during the window, then
    /// reads back the RSSI it was last heard at.
    async fn listen(&self, duration: Duration) -> anyhow::Result<Vec<Observation>> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let mut heard: Vec<PeripheralId> = Vec::new();
        let window = tokio::time::sleep(duration);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id)) => {
                        if !heard.contains(&id) {
                            heard.push(id);
                        }
                    }
                    Some(_) => {}
                    None => {
                        debug!("Adapter event stream closed early");
                        break;
                    }
                },
            }
        }
        self.adapter.stop_scan().await?;

        let mut readings = Vec::with_capacity(heard.len());
        for id in heard {
            let reading = self.read_back(&id).await;
            readings.push((id, reading));
        }
        Ok(keep_readable(readings))
    }

    async fn read_back(&self, id: &PeripheralId) -> anyhow::Result<Option<Observation>> {
        let peripheral = self.adapter.peripheral(id).await?;
        let rssi = peripheral.properties().await?.and_then(|p| p.rssi);
        Ok(rssi.map(|rssi| Observation::new(peripheral.address().to_string(), rssi)))
    }
}

/// Drops peripherals that vanished or reported no RSSI before they could be
/// read back. One stale device must not cost the whole batch.
fn keep_readable<I: Debug>(
    readings: Vec<(I, anyhow::Result<Option<Observation>>)>,
) -> Vec<Observation> {
    readings
        .into_iter()
        .filter_map(|(id, reading)| match reading {
            Ok(observation) => observation,
            Err(err) => {
                debug!("Skipping peripheral {:?}: {:#}", id, err);
                None
            }
        })
        .collect()
}

impl ScanSource for BtleScanner {
    fn scan(&self, duration: Duration) -> anyhow::Result<Vec<Observation>> {
        self.runtime
            .block_on(self.listen(duration))
            .context("bluetooth scan failed")
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn test_failed_lookup_skips_only_that_peripheral() {
        let readings = vec![
            ("hci0/dev_AA", Ok(Some(Observation::new("AA:AA:AA:AA:AA:AA", -40)))),
            ("hci0/dev_BB", Err(anyhow!("device removed"))),
            ("hci0/dev_CC", Ok(None)),
            ("hci0/dev_DD", Ok(Some(Observation::new("DD:DD:DD:DD:DD:DD", -75)))),
        ];
        assert_eq!(
            keep_readable(readings),
            vec![
                Observation::new("AA:AA:AA:AA:AA:AA", -40),
                Observation::new("DD:DD:DD:DD:DD:DD", -75),
            ]
        );
    }
}
