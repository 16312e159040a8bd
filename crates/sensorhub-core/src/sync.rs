//! Upward-only clock synchronization between local and device time.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use sensorhub_types::{Error, Result};

use crate::clock::SystemClock;

/// Synchronizes time between local and remote resources.
#[async_trait]
pub trait TimeSynchronizer: Send + Sync {
    /// Synchronize the UNIX time for a device.
    async fn sync_time(&self) -> Result<()>;
}

/// Synchronizes a device clock against the local clock.
///
/// The device clock is only ever moved forward. Device data is persisted
/// keyed by its own timestamps, so rewinding the device clock could
/// overwrite history; refusing the sync and leaving a gap is the safe
/// outcome.
pub struct ClockSynchronizer {
    local: Arc<dyn SystemClock>,
    remote_last: Arc<dyn SystemClock>,
    remote_curr: Arc<dyn SystemClock>,
}

impl ClockSynchronizer {
    /// Create a synchronizer over the three clocks.
    ///
    /// * `local` - UNIX time of the local machine.
    /// * `remote_last` - last known UNIX time observed from the device.
    /// * `remote_curr` - live, writable UNIX time of the device.
    pub fn new(
        local: Arc<dyn SystemClock>,
        remote_last: Arc<dyn SystemClock>,
        remote_curr: Arc<dyn SystemClock>,
    ) -> Self {
        Self {
            local,
            remote_last,
            remote_curr,
        }
    }
}

#[async_trait]
impl TimeSynchronizer for ClockSynchronizer {
    async fn sync_time(&self) -> Result<()> {
        let local = self.local.get_timestamp().await?;

        let remote_last = self.remote_last.get_timestamp().await?;
        if local < remote_last {
            warn!(
                local,
                remote_last, "unable to sync: last known remote time is ahead of local",
            );

            return Err(Error::Failed);
        }

        let remote_curr = self.remote_curr.get_timestamp().await?;
        if local < remote_curr {
            warn!(
                local,
                remote_curr, "unable to sync: current remote time is ahead of local",
            );

            return Err(Error::Failed);
        }

        self.remote_curr.set_timestamp(local).await?;

        info!(local, remote_last, remote_curr, "device time synced");

        Ok(())
    }
}

/// Synchronizer stub used when time synchronization is disabled.
#[derive(Debug, Default)]
pub struct UnsupportedSynchronizer;

#[async_trait]
impl TimeSynchronizer for UnsupportedSynchronizer {
    async fn sync_time(&self) -> Result<()> {
        Err(Error::NotSupported)
    }
}
