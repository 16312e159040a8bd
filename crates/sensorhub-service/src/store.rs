//! Device inventory management port.

use async_trait::async_trait;

use sensorhub_types::{DeviceRecord, Result};

/// Manages the device registration life-cycle.
///
/// URI examples:
/// - `http://greenhouse.local:12345/api/v1` - mDNS HTTP API.
/// - `http://192.168.4.1:17321` - static IP address.
///
/// The URI is the unique key; adding a known URI reports `Exists`,
/// removing an unknown one reports `NoData`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Register the device.
    ///
    /// * `uri` - how the device can be reached; unique.
    /// * `kind` - device type, to distinguish one device family from
    ///   another (e.g. `greenhouse-sensor`).
    /// * `desc` - human readable description (e.g. `room-plant-zamioculcas`).
    async fn add(&self, uri: &str, kind: &str, desc: &str) -> Result<()>;

    /// Remove the device associated with the URI.
    async fn remove(&self, uri: &str) -> Result<()>;

    /// Return descriptions for all registered devices.
    async fn get_desc(&self) -> Vec<DeviceRecord>;
}
