//! Device timestamp verification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::error;

use crate::clock::SystemClock;

/// Verifies the UNIX timestamp reported by a device.
#[async_trait]
pub trait TimeVerifier: Send + Sync {
    /// Return true when the provided UNIX timestamp is acceptable.
    async fn verify(&self, timestamp: i64) -> bool;
}

/// Accepts any timestamp greater than zero.
#[derive(Debug, Default)]
pub struct BasicTimeVerifier;

#[async_trait]
impl TimeVerifier for BasicTimeVerifier {
    async fn verify(&self, timestamp: i64) -> bool {
        timestamp > 0
    }
}

/// Bounds the difference between local and device UNIX time.
pub struct DriftTimeVerifier {
    clock: Arc<dyn SystemClock>,
    max_drift: Duration,
}

impl DriftTimeVerifier {
    pub fn new(clock: Arc<dyn SystemClock>, max_drift: Duration) -> Self {
        Self { clock, max_drift }
    }
}

#[async_trait]
impl TimeVerifier for DriftTimeVerifier {
    async fn verify(&self, timestamp: i64) -> bool {
        if timestamp < 0 {
            return false;
        }

        let local = match self.clock.get_timestamp().await {
            Ok(local) => local,
            Err(err) => {
                error!(%err, "failed to read local time");

                return false;
            }
        };

        if timestamp < local {
            return local - timestamp < self.max_drift.as_secs() as i64;
        }

        // A device clock from the future is accepted as-is. The clocks may
        // simply drift apart, and down-syncing the device against data
        // persisted by its own timestamps can corrupt history; an upward
        // gap in storage is the lesser problem.
        true
    }
}

#[cfg(test)]
mod tests {
    use sensorhub_types::{Error, Result};

    use super::*;

    struct FixedClock(Result<i64>);

    #[async_trait]
    impl SystemClock for FixedClock {
        async fn get_timestamp(&self) -> Result<i64> {
            self.0
        }

        async fn set_timestamp(&self, _timestamp: i64) -> Result<()> {
            Err(Error::NotSupported)
        }
    }

    #[tokio::test]
    async fn basic_accepts_positive_only() {
        let verifier = BasicTimeVerifier;

        assert!(verifier.verify(1).await);
        assert!(verifier.verify(1_733_215_816).await);
        assert!(!verifier.verify(0).await);
        assert!(!verifier.verify(-1).await);
    }

    #[tokio::test]
    async fn drift_rejects_negative_timestamp() {
        let verifier = DriftTimeVerifier::new(
            Arc::new(FixedClock(Ok(1000))),
            Duration::from_secs(10),
        );

        assert!(!verifier.verify(-1).await);
    }

    #[tokio::test]
    async fn drift_accepts_device_at_or_ahead_of_local() {
        let verifier = DriftTimeVerifier::new(
            Arc::new(FixedClock(Ok(1000))),
            Duration::from_secs(10),
        );

        assert!(verifier.verify(1000).await);
        assert!(verifier.verify(5000).await);
    }

    #[tokio::test]
    async fn drift_bounds_device_behind_local() {
        let verifier = DriftTimeVerifier::new(
            Arc::new(FixedClock(Ok(1000))),
            Duration::from_secs(10),
        );

        // Inside the window.
        assert!(verifier.verify(991).await);
        // Exactly at the window is rejected.
        assert!(!verifier.verify(990).await);
        // Far behind.
        assert!(!verifier.verify(0).await);
    }

    #[tokio::test]
    async fn drift_rejects_when_local_clock_fails() {
        let verifier = DriftTimeVerifier::new(
            Arc::new(FixedClock(Err(Error::Failed))),
            Duration::from_secs(10),
        );

        assert!(!verifier.verify(1000).await);
    }
}
