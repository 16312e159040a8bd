//! Wire-facing records shared between the registry and the admin API.

use serde::{Deserialize, Serialize};

/// Open JSON object reported by a device endpoint.
///
/// Device payloads are deliberately schemaless: the hub extracts the fields
/// it needs (`device_id`, `timestamp`) by name and forwards the full
/// mapping to the data handler, which projects whatever it stores.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Description of a single registered device, as returned by the list API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device URI, the unique key under which the device is registered.
    pub uri: String,
    /// Device type, to distinguish one device family from another.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human readable device description.
    pub desc: String,
    /// Device-reported identifier; empty until the first successful poll.
    pub id: String,
    /// When the device was registered.
    pub created_at: String,
}
