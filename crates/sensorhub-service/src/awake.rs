//! Store decorator that accelerates discovery on manual registration.

use std::sync::Arc;

use async_trait::async_trait;

use sensorhub_core::Awakener;
use sensorhub_types::{DeviceRecord, Result};

use crate::store::Store;

/// Pulses an awakener whenever a device is added.
///
/// The awakener is the discovery browse runner: a device registered
/// through the admin API usually sits on the local network too, so an
/// immediate browse round resolves its hostname without waiting for the
/// next scheduled pass.
pub struct AwakeStore {
    awakener: Arc<dyn Awakener>,
    store: Arc<dyn Store>,
}

impl AwakeStore {
    pub fn new(awakener: Arc<dyn Awakener>, store: Arc<dyn Store>) -> Self {
        Self { awakener, store }
    }
}

#[async_trait]
impl Store for AwakeStore {
    async fn add(&self, uri: &str, kind: &str, desc: &str) -> Result<()> {
        self.store.add(uri, kind, desc).await?;
        self.awakener.awake();

        Ok(())
    }

    async fn remove(&self, uri: &str) -> Result<()> {
        self.store.remove(uri).await
    }

    async fn get_desc(&self) -> Vec<DeviceRecord> {
        self.store.get_desc().await
    }
}
