//! Device hub service layer.
//!
//! Ties the engine and the storage together: the [`CacheStore`] registry
//! owns one supervised node per registered device, the
//! [`StoreAliveMonitor`] evicts devices that stay silent, the discovery
//! handlers feed autodiscovered devices and resolved hostnames into the
//! system, and the admin HTTP API exposes the inventory.

pub mod api;
pub mod awake;
pub mod config;
pub mod discovery;
pub mod monitor;
pub mod registry;
pub mod store;
pub mod zeroconf;

pub use awake::AwakeStore;
pub use monitor::{AliveMonitor, StoreAliveMonitor};
pub use registry::{CacheStore, CacheStoreParams};
pub use store::Store;
