//! Persistence for the sensorhub device hub.
//!
//! Three concerns live here, all backed by SQLite:
//!
//! - [`Database`] / [`SqliteDb`] — the key-value registration store that
//!   makes the device inventory survive restarts.
//! - [`SamplePipeline`] — the time-series projection of device payloads,
//!   plus the builders the registry uses to wire per-device handlers and
//!   timestamp readers.
//! - [`ClockRestorer`] — the lazily restored "last known good" device
//!   timestamp that keeps clock synchronization from rewinding device
//!   time after a hub restart.

mod kv;
mod pipeline;
mod restorer;

pub use kv::{Database, DatabaseStopper, SqliteDb};
pub use pipeline::{
    ClockReaderBuilder, DataHandlerBuilder, PipelineParams, SamplePipeline,
};
pub use restorer::{ClockReader, ClockRestorer};
