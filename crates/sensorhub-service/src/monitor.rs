//! Inactivity monitoring and eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use sensorhub_core::{AliveNotifier, ErrorHandler, MonotonicClock, Task};
use sensorhub_types::{DeviceRecord, Error, Result};

use crate::store::Store;

/// Grants per-device alive notifiers.
pub trait AliveMonitor: Send + Sync {
    /// Return the alive notifier bound to the device URI.
    ///
    /// A device that is never marked alive through its notifier is
    /// eventually considered inactive.
    fn monitor(&self, uri: &str) -> Arc<dyn AliveNotifier>;
}

/// Evicts devices that stay silent for too long.
///
/// Keeps a monotonic last-seen reading per URI. The periodic [`Task::run`]
/// removes, through the wrapped store, every device whose reading is older
/// than the allowed inactivity interval. At construction the monitor
/// reseeds a fresh reading for every device already present in the store,
/// so a hub restart grants quiet devices a full grace period instead of
/// evicting them instantly.
///
/// The tracking map lock is never held across a store call: removing a
/// device waits for its poll worker to exit, and that worker may itself
/// be delivering an alive notification.
pub struct StoreAliveMonitor {
    max_inactive: Duration,
    clock: Arc<dyn MonotonicClock>,
    store: Arc<dyn Store>,
    devices: Mutex<HashMap<String, Duration>>,
}

impl StoreAliveMonitor {
    /// Create the monitor over the store and reseed the devices already
    /// registered in it.
    pub async fn new(
        clock: Arc<dyn MonotonicClock>,
        store: Arc<dyn Store>,
        max_inactive: Duration,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            max_inactive,
            clock,
            store,
            devices: Mutex::new(HashMap::new()),
        });

        monitor.restore_devices().await;

        monitor
    }

    async fn restore_devices(&self) {
        let records = self.store.get_desc().await;

        let mut devices = self.devices.lock().expect("monitor devices lock");
        for record in records {
            devices.insert(record.uri, self.clock.now());
        }
    }

    fn notify_alive(&self, uri: &str) {
        let mut devices = self.devices.lock().expect("monitor devices lock");
        devices.insert(uri.to_string(), self.clock.now());
    }

    #[cfg(test)]
    fn tracked(&self) -> Vec<String> {
        self.devices
            .lock()
            .expect("monitor devices lock")
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for StoreAliveMonitor {
    async fn add(&self, uri: &str, kind: &str, desc: &str) -> Result<()> {
        self.store.add(uri, kind, desc).await?;

        let mut devices = self.devices.lock().expect("monitor devices lock");
        devices.insert(uri.to_string(), self.clock.now());

        Ok(())
    }

    async fn remove(&self, uri: &str) -> Result<()> {
        self.store.remove(uri).await?;

        let mut devices = self.devices.lock().expect("monitor devices lock");
        devices.remove(uri);

        Ok(())
    }

    async fn get_desc(&self) -> Vec<DeviceRecord> {
        self.store.get_desc().await
    }
}

#[async_trait]
impl Task for StoreAliveMonitor {
    async fn run(&self) -> Result<()> {
        let stale: Vec<(String, Duration)> = {
            let devices = self.devices.lock().expect("monitor devices lock");
            let now = self.clock.now();

            devices
                .iter()
                .filter_map(|(uri, last_seen)| {
                    let inactive = now.saturating_sub(*last_seen);
                    (inactive >= self.max_inactive).then(|| (uri.clone(), inactive))
                })
                .collect()
        };

        for (uri, inactive) in stale {
            warn!(
                %uri,
                inactive_secs = inactive.as_secs(),
                max_inactive_secs = self.max_inactive.as_secs(),
                "removing inactive device",
            );

            self.store.remove(&uri).await?;

            let mut devices = self.devices.lock().expect("monitor devices lock");
            devices.remove(&uri);
        }

        Ok(())
    }
}

impl ErrorHandler for StoreAliveMonitor {
    fn handle_error(&self, err: Error) {
        error!(%err, "failed to verify inactive devices");
    }
}

impl AliveMonitor for Arc<StoreAliveMonitor> {
    fn monitor(&self, uri: &str) -> Arc<dyn AliveNotifier> {
        Arc::new(StoreAliveNotifier {
            uri: uri.to_string(),
            monitor: self.clone(),
        })
    }
}

struct StoreAliveNotifier {
    uri: String,
    monitor: Arc<StoreAliveMonitor>,
}

#[async_trait]
impl AliveNotifier for StoreAliveNotifier {
    async fn notify_alive(&self) {
        self.monitor.notify_alive(&self.uri);
    }
}
