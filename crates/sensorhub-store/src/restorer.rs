//! Last-known-good device timestamp restoration.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{error, info};

use sensorhub_core::{ErrorHandler, SystemClock, Task};
use sensorhub_types::{Error, Result};

/// Reads a persisted device timestamp.
#[async_trait]
pub trait ClockReader: Send + Sync {
    /// Read the most recent persisted UNIX timestamp for the device.
    ///
    /// Returns `NoData` when nothing has been persisted yet.
    async fn read_timestamp(&self) -> Result<i64>;
}

#[derive(Debug)]
struct RestorerState {
    restored: bool,
    timestamp: i64,
}

/// Restores the last known device UNIX timestamp from persistent storage.
///
/// The value serves as the "last known remote time" for clock
/// synchronization, so it must become available even when the device has
/// never reported anything: a `NoData` read restores the `-1` sentinel.
/// Whichever fires first wins between the storage read (the periodic
/// [`Task::run`]) and the first live observation
/// ([`SystemClock::set_timestamp`] from the data-handler path).
pub struct ClockRestorer {
    reader: Arc<dyn ClockReader>,
    state: Mutex<RestorerState>,
}

impl ClockRestorer {
    pub fn new(reader: Arc<dyn ClockReader>) -> Self {
        Self {
            reader,
            state: Mutex::new(RestorerState {
                restored: false,
                timestamp: -1,
            }),
        }
    }
}

#[async_trait]
impl SystemClock for ClockRestorer {
    async fn get_timestamp(&self) -> Result<i64> {
        let state = self.state.lock().expect("restorer state lock");

        if !state.restored {
            return Err(Error::InvalidState);
        }

        Ok(state.timestamp)
    }

    async fn set_timestamp(&self, timestamp: i64) -> Result<()> {
        let mut state = self.state.lock().expect("restorer state lock");

        if timestamp > state.timestamp {
            state.timestamp = timestamp;
        }

        if !state.restored {
            state.restored = true;

            info!(timestamp, "live timestamp observed, skipping restore");
        }

        Ok(())
    }
}

#[async_trait]
impl Task for ClockRestorer {
    async fn run(&self) -> Result<()> {
        let timestamp = match self.reader.read_timestamp().await {
            Ok(timestamp) => timestamp,
            // Nothing persisted yet is a successful, empty restore.
            Err(Error::NoData) => -1,
            Err(err) => return Err(err),
        };

        let mut state = self.state.lock().expect("restorer state lock");

        if state.restored {
            info!(
                restored = state.timestamp,
                persisted = timestamp,
                "timestamp already restored, keeping the larger value",
            );

            if timestamp > state.timestamp {
                state.timestamp = timestamp;
            }
        } else {
            state.restored = true;
            state.timestamp = timestamp;

            info!(timestamp, "timestamp restored");
        }

        Ok(())
    }
}

impl ErrorHandler for ClockRestorer {
    fn handle_error(&self, err: Error) {
        if err != Error::NoData {
            error!(%err, "failed to restore timestamp");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptReader(Result<i64>);

    #[async_trait]
    impl ClockReader for ScriptReader {
        async fn read_timestamp(&self) -> Result<i64> {
            self.0
        }
    }

    fn restorer(read: Result<i64>) -> ClockRestorer {
        ClockRestorer::new(Arc::new(ScriptReader(read)))
    }

    #[tokio::test]
    async fn get_before_restore_is_invalid_state() {
        let restorer = restorer(Ok(42));

        assert_eq!(restorer.get_timestamp().await, Err(Error::InvalidState));
    }

    #[tokio::test]
    async fn run_restores_persisted_value() {
        let restorer = restorer(Ok(42));

        restorer.run().await.unwrap();
        assert_eq!(restorer.get_timestamp().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn run_with_no_data_restores_sentinel() {
        let restorer = restorer(Err(Error::NoData));

        restorer.run().await.unwrap();
        assert_eq!(restorer.get_timestamp().await.unwrap(), -1);
    }

    #[tokio::test]
    async fn reader_failure_propagates_and_leaves_state() {
        let restorer = restorer(Err(Error::Failed));

        assert_eq!(restorer.run().await, Err(Error::Failed));
        assert_eq!(restorer.get_timestamp().await, Err(Error::InvalidState));
    }

    #[tokio::test]
    async fn set_flips_restored_and_is_monotonic() {
        let restorer = restorer(Ok(42));

        restorer.set_timestamp(10).await.unwrap();
        assert_eq!(restorer.get_timestamp().await.unwrap(), 10);

        restorer.set_timestamp(5).await.unwrap();
        assert_eq!(restorer.get_timestamp().await.unwrap(), 10);

        restorer.set_timestamp(20).await.unwrap();
        assert_eq!(restorer.get_timestamp().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn run_after_set_keeps_larger_value() {
        // Persisted value is smaller than the live observation.
        let r = restorer(Ok(15));

        r.set_timestamp(30).await.unwrap();
        r.run().await.unwrap();
        assert_eq!(r.get_timestamp().await.unwrap(), 30);

        // And the other way around.
        let r = restorer(Ok(50));
        r.set_timestamp(30).await.unwrap();
        r.run().await.unwrap();
        assert_eq!(r.get_timestamp().await.unwrap(), 50);
    }

    #[test]
    fn error_handler_mutes_no_data() {
        let restorer = restorer(Ok(0));

        // Both paths only log; this pins the calls as non-panicking.
        restorer.handle_error(Error::NoData);
        restorer.handle_error(Error::Failed);
    }
}
