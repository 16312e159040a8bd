//! Device data handling port.

use async_trait::async_trait;

use sensorhub_types::{Payload, Result};

/// Handles the data types reported by a device.
///
/// The payloads are open JSON objects; the handler projects whichever
/// fields its backend stores.
#[async_trait]
pub trait DataHandler: Send + Sync {
    /// Handle the registration data from the device.
    async fn handle_registration(&self, device_id: &str, payload: &Payload) -> Result<()>;

    /// Handle the telemetry data from the device.
    async fn handle_telemetry(&self, device_id: &str, payload: &Payload) -> Result<()>;
}
