//! Clock ports and their local implementations.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::error;

use sensorhub_types::{Error, Result};

/// UNIX time of a resource, local or remote.
#[async_trait]
pub trait SystemClock: Send + Sync {
    /// Return the UNIX time of the resource in seconds.
    async fn get_timestamp(&self) -> Result<i64>;

    /// Set the UNIX time of the resource in seconds.
    async fn set_timestamp(&self, timestamp: i64) -> Result<()>;
}

/// Monotonic time source, used for inactivity measurement.
///
/// Readings are durations from an arbitrary fixed origin; only differences
/// between readings are meaningful.
pub trait MonotonicClock: Send + Sync {
    /// Return the current monotonic reading.
    fn now(&self) -> Duration;
}

/// System clock of the local machine.
#[derive(Debug, Default)]
pub struct LocalSystemClock;

#[async_trait]
impl SystemClock for LocalSystemClock {
    async fn get_timestamp(&self) -> Result<i64> {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Ok(elapsed.as_secs() as i64),
            Err(err) => {
                error!(%err, "local clock is before the UNIX epoch");

                Err(Error::Failed)
            }
        }
    }

    async fn set_timestamp(&self, timestamp: i64) -> Result<()> {
        #[cfg(unix)]
        {
            let tv = libc::timeval {
                tv_sec: timestamp as libc::time_t,
                tv_usec: 0,
            };

            // settimeofday(2) requires CAP_SYS_TIME.
            let rc = unsafe { libc::settimeofday(&tv, std::ptr::null()) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                error!(%err, timestamp, "failed to set local clock");

                return Err(Error::Failed);
            }

            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = timestamp;

            Err(Error::NotSupported)
        }
    }
}

/// Monotonic clock anchored at its construction instant.
#[derive(Debug)]
pub struct LocalMonotonicClock {
    origin: Instant,
}

impl Default for LocalMonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl MonotonicClock for LocalMonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}
