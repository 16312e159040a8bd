//! Device data acquisition port.

use async_trait::async_trait;

use sensorhub_types::Result;

/// Fetches device data from an arbitrary source.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the raw device data.
    async fn fetch(&self) -> Result<Vec<u8>>;
}
