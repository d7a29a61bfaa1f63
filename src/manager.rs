use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use log::{debug, error, info};
use mac_address::MacAddress;

use crate::config::ScanConfig;
use crate::messages::Observation;
use crate::mqtt::Broker;
use crate::publisher::{Delivery, PublishSession};
use crate::scanner::ScanSource;
use crate::tracker::PresenceTracker;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub observed: usize,
    pub published: usize,
    pub dropped: usize,
}

/// Drives the scan → track → publish cycle.
pub struct Manager<S, B> {
    scanner: Arc<S>,
    tracker: PresenceTracker,
    session: PublishSession<B>,
    scan_duration: Duration,
    interval: Duration,
    connect_retry: Duration,
    allowed: Option<Vec<MacAddress>>,
}

impl<S: ScanSource, B: Broker> Manager<S, B> {
    pub fn new(
        scanner: S,
        tracker: PresenceTracker,
        session: PublishSession<B>,
        config: &ScanConfig,
    ) -> Self {
        Manager {
            scanner: Arc::new(scanner),
            tracker,
            session,
            scan_duration: config.duration(),
            interval: config.interval(),
            connect_retry: config.connect_retry(),
            allowed: config.allowed_addresses.clone(),
        }
    }

    /// Connects to the broker, retrying forever with a fixed delay.
    pub async fn bootstrap(&mut self) {
        loop {
            info!("Connecting...");
            match self.session.open().await {
                Ok(()) => break,
                Err(err) => {
                    error!("Failed to connect: {}", err);
                    tokio::time::sleep(self.connect_retry).await;
                }
            }
        }
        info!("Connected!");
    }

    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleSummary> {
        let scanner = Arc::clone(&self.scanner);
        let duration = self.scan_duration;
        let observations = tokio::task::spawn_blocking(move || scanner.scan(duration))
            .await
            .context("scan worker did not finish")??;
        let observations = self.filter(observations);

        let mut summary = CycleSummary {
            observed: observations.len(),
            ..CycleSummary::default()
        };
        for event in self.tracker.apply_observations(&observations) {
            match self.session.deliver(&event).await {
                Delivery::Published => summary.published += 1,
                Delivery::NotConnected | Delivery::Failed => summary.dropped += 1,
            }
        }
        Ok(summary)
    }

    /// Never returns; cancel the future to stop.
    pub async fn run_loop(&mut self) {
        self.bootstrap().await;

        loop {
            match self.run_cycle().await {
                Ok(summary) => debug!(
                    "Cycle done: {} observed, {} published, {} dropped ({} tracked)",
                    summary.observed,
                    summary.published,
                    summary.dropped,
                    self.tracker.len()
                ),
                Err(err) => error!("Got exception while scanning: {:#}", err),
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    pub async fn shutdown(&mut self) {
        self.session.close().await;
    }

    fn filter(&self, observations: Vec<Observation>) -> Vec<Observation> {
        let Some(allowed) = &self.allowed else {
            return observations;
        };
        observations
            .into_iter()
            .filter(|o| {
                o.address
                    .parse::<MacAddress>()
                    .is_ok_and(|mac| allowed.contains(&mac))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use tokio::time::Instant;

    use super::*;
    use crate::config::TrackerConfig;
    use crate::publisher::testing::RecordingBroker;

    /// Hands out one pre-recorded batch per scan, then empty batches.
    #[derive(Default)]
    struct ScriptedScanner {
        batches: Mutex<VecDeque<anyhow::Result<Vec<Observation>>>>,
    }

    impl ScriptedScanner {
        fn new(batches: Vec<anyhow::Result<Vec<Observation>>>) -> Self {
            ScriptedScanner {
                batches: Mutex::new(batches.into()),
            }
        }
    }

    impl ScanSource for ScriptedScanner {
        fn scan(&self, _duration: Duration) -> anyhow::Result<Vec<Observation>> {
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn manager(
        scanner: ScriptedScanner,
        broker: RecordingBroker,
        config: ScanConfig,
    ) -> Manager<ScriptedScanner, RecordingBroker> {
        Manager::new(
            scanner,
            PresenceTracker::new(TrackerConfig::default()),
            PublishSession::new(broker, "homeassistant"),
            &config,
        )
    }

    fn beacon(rssi: i16) -> Observation {
        Observation::new("AA:BB:CC:DD:EE:FF", rssi)
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_retries_with_fixed_backoff() {
        let broker = RecordingBroker {
            failing_connects: 3,
            ..RecordingBroker::default()
        };
        let mut manager = manager(ScriptedScanner::default(), broker, ScanConfig::default());

        let started = Instant::now();
        manager.bootstrap().await;
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(manager.session.broker().connect_calls, 4);
    }

    #[tokio::test]
    async fn test_cycles_publish_discovery_then_state() {
        let scanner = ScriptedScanner::new(vec![Ok(vec![beacon(-60)]), Ok(vec![beacon(-60)])]);
        let mut manager = manager(scanner, RecordingBroker::default(), ScanConfig::default());

        let summary = manager.run_cycle().await.unwrap();
        assert_eq!(
            summary,
            CycleSummary {
                observed: 1,
                published: 1,
                dropped: 0
            }
        );
        manager.run_cycle().await.unwrap();
        for _ in 0..3 {
            manager.run_cycle().await.unwrap();
        }

        let published = &manager.session.broker().published;
        let topics: Vec<_> = published
            .iter()
            .map(|p| (p.topic.as_str(), p.payload.as_str(), p.retain))
            .collect();
        assert_eq!(
            topics,
            vec![
                (
                    "homeassistant/sensor/AABBCCDDEEFF/config",
                    r#"{"name":"AABBCCDDEEFF","unit_of_measurement":"dBm"}"#,
                    true
                ),
                ("homeassistant/sensor/AABBCCDDEEFF/state", "-26", false),
                ("homeassistant/sensor/AABBCCDDEEFF/state", "-200", false),
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_error_fails_only_that_cycle() {
        let scanner = ScriptedScanner::new(vec![
            Err(anyhow!("adapter went away")),
            Ok(vec![beacon(-50)]),
        ]);
        let mut manager = manager(scanner, RecordingBroker::default(), ScanConfig::default());

        assert!(manager.run_cycle().await.is_err());
        let summary = manager.run_cycle().await.unwrap();
        assert_eq!(summary.published, 1);
    }

    #[tokio::test]
    async fn test_offline_broker_drops_cycle_events() {
        let scanner = ScriptedScanner::new(vec![Ok(vec![
            beacon(-50),
            Observation::new("11:22:33:44:55:66", -70),
        ])]);
        let broker = RecordingBroker {
            offline: true,
            ..RecordingBroker::default()
        };
        let mut manager = manager(scanner, broker, ScanConfig::default());

        let summary = manager.run_cycle().await.unwrap();
        assert_eq!(summary.dropped, 2);
        assert!(manager.session.broker().published.is_empty());
        // Tracker state still advanced.
        assert_eq!(manager.tracker.len(), 2);
    }

    #[tokio::test]
    async fn test_allow_list_filters_observations() {
        let scanner = ScriptedScanner::new(vec![Ok(vec![
            beacon(-50),
            Observation::new("11:22:33:44:55:66", -70),
            Observation::new("not-a-mac", -70),
        ])]);
        let config = ScanConfig {
            allowed_addresses: Some(vec!["aa:bb:cc:dd:ee:ff".parse().unwrap()]),
            ..ScanConfig::default()
        };
        let mut manager = manager(scanner, RecordingBroker::default(), config);

        let summary = manager.run_cycle().await.unwrap();
        assert_eq!(summary.observed, 1);
        assert!(manager.tracker.device("AA:BB:CC:DD:EE:FF").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_survives_failed_cycles() {
        let scanner = ScriptedScanner::new(vec![
            Err(anyhow!("first scan fails")),
            Ok(vec![beacon(-40)]),
        ]);
        let mut manager = manager(scanner, RecordingBroker::default(), ScanConfig::default());

        let _ = tokio::time::timeout(Duration::from_secs(45), manager.run_loop()).await;
        assert_eq!(manager.session.broker().published.len(), 1);

        manager.shutdown().await;
        assert!(manager.session.broker().disconnected);
    }
}
