//! Device identifier publication.

use std::sync::RwLock;

/// Holds the device unique identifier.
///
/// Written by the single poll worker, read concurrently by anyone needing
/// the discovered ID (listing, the lazy clock reader). The ID changes very
/// rarely, so reads take the cheap path.
#[derive(Debug, Default)]
pub struct IdHolder {
    id: RwLock<String>,
}

impl IdHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the device identifier; empty until the first successful
    /// registration fetch.
    pub fn get(&self) -> String {
        self.id.read().expect("id lock").clone()
    }

    /// Publish the device identifier.
    pub fn set(&self, device_id: &str) {
        {
            let current = self.id.read().expect("id lock");
            if *current == device_id {
                return;
            }
        }

        *self.id.write().expect("id lock") = device_id.to_string();
    }
}
