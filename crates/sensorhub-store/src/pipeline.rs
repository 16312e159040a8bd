//! Time-series projection of device payloads.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{error, info};

use sensorhub_core::{DataHandler, SystemClock};
use sensorhub_types::{Error, Payload, Result};

use crate::restorer::ClockReader;

/// Builds per-device data handlers for the sample backend.
pub trait DataHandlerBuilder: Send + Sync {
    /// Build a handler that additionally feeds each observed timestamp
    /// into the provided clock.
    fn build_handler(&self, clock: Arc<dyn SystemClock>, device_id: &str) -> Box<dyn DataHandler>;
}

/// Builds per-device persisted-timestamp readers.
pub trait ClockReaderBuilder: Send + Sync {
    /// Build a reader for the device's most recent persisted timestamp.
    fn build_reader(&self, device_id: &str) -> Arc<dyn ClockReader>;
}

/// Configuration for the sample pipeline.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    /// Number of days to look back when restoring the latest device
    /// timestamp. Zero means unbounded.
    pub restore_range_days: u32,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            restore_range_days: 30,
        }
    }
}

/// Building blocks for persisting device samples in SQLite.
///
/// One `samples` table holds both registration and telemetry payloads,
/// keyed by device and sample timestamp. The registry asks this pipeline
/// for a [`DataHandler`] and a [`ClockReader`] per device.
pub struct SamplePipeline {
    conn: Arc<Mutex<Connection>>,
    params: PipelineParams,
}

impl SamplePipeline {
    /// Open or create the sample database at the given path.
    pub fn open<P: AsRef<Path>>(path: P, params: PipelineParams) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    error!(%err, path = %parent.display(), "failed to create sample directory");

                    Error::Failed
                })?;
            }
        }

        info!(path = %path.display(), "opening sample database");

        let conn = Connection::open(path).map_err(|err| {
            error!(%err, path = %path.display(), "failed to open sample database");

            Error::Failed
        })?;

        Self::init(conn, params)
    }

    /// Open a transient in-memory pipeline.
    pub fn open_in_memory(params: PipelineParams) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|err| {
            error!(%err, "failed to open in-memory sample database");

            Error::Failed
        })?;

        Self::init(conn, params)
    }

    fn init(conn: Connection, params: PipelineParams) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS samples (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 device_id TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 timestamp INTEGER NOT NULL,
                 payload TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_samples_device_kind_ts
                 ON samples (device_id, kind, timestamp);",
        )
        .map_err(|err| {
            error!(%err, "failed to initialize sample schema");

            Error::Failed
        })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            params,
        })
    }
}

impl DataHandlerBuilder for SamplePipeline {
    fn build_handler(&self, clock: Arc<dyn SystemClock>, _device_id: &str) -> Box<dyn DataHandler> {
        Box::new(SampleWriter {
            conn: self.conn.clone(),
            clock,
        })
    }
}

impl ClockReaderBuilder for SamplePipeline {
    fn build_reader(&self, device_id: &str) -> Arc<dyn ClockReader> {
        Arc::new(SampleClockReader {
            conn: self.conn.clone(),
            device_id: device_id.to_string(),
            restore_range_days: self.params.restore_range_days,
        })
    }
}

/// Persists device payloads as sample rows.
struct SampleWriter {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn SystemClock>,
}

impl SampleWriter {
    async fn handle_sample(&self, kind: &str, device_id: &str, payload: &Payload) -> Result<()> {
        let value = payload.get("timestamp").ok_or_else(|| {
            error!(device_id, kind, "sample is missing the timestamp field");

            Error::Failed
        })?;

        let timestamp = value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
            .ok_or_else(|| {
                error!(device_id, kind, "sample timestamp has an invalid type");

                Error::Failed
            })?;

        if timestamp < 0 {
            error!(device_id, kind, timestamp, "refusing to persist negative timestamp");

            return Err(Error::Failed);
        }

        let body = serde_json::to_string(payload).map_err(|err| {
            error!(%err, device_id, kind, "failed to encode sample payload");

            Error::Failed
        })?;

        {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT INTO samples (device_id, kind, timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![device_id, kind, timestamp, body],
            )
            .map_err(|err| {
                error!(%err, device_id, kind, "failed to persist sample");

                Error::Failed
            })?;
        }

        self.clock.set_timestamp(timestamp).await
    }
}

#[async_trait]
impl DataHandler for SampleWriter {
    async fn handle_registration(&self, device_id: &str, payload: &Payload) -> Result<()> {
        self.handle_sample("registration", device_id, payload).await
    }

    async fn handle_telemetry(&self, device_id: &str, payload: &Payload) -> Result<()> {
        self.handle_sample("telemetry", device_id, payload).await
    }
}

/// Reads the most recent persisted telemetry timestamp for one device.
struct SampleClockReader {
    conn: Arc<Mutex<Connection>>,
    device_id: String,
    restore_range_days: u32,
}

#[async_trait]
impl ClockReader for SampleClockReader {
    async fn read_timestamp(&self) -> Result<i64> {
        let cutoff = if self.restore_range_days == 0 {
            0
        } else {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|_| Error::Failed)?
                .as_secs() as i64;

            now - i64::from(self.restore_range_days) * 86_400
        };

        let conn = self.conn.lock().await;

        let latest: Option<i64> = conn
            .query_row(
                "SELECT MAX(timestamp) FROM samples
                 WHERE device_id = ?1 AND kind = 'telemetry' AND timestamp >= ?2",
                rusqlite::params![self.device_id, cutoff],
                |row| row.get(0),
            )
            .map_err(|err| {
                error!(%err, device_id = %self.device_id, "timestamp lookup failed");

                Error::Failed
            })?;

        match latest {
            Some(timestamp) => {
                info!(
                    device_id = %self.device_id,
                    timestamp, "read latest persisted device timestamp",
                );

                Ok(timestamp)
            }
            None => Err(Error::NoData),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullClock(std::sync::Mutex<Vec<i64>>);

    #[async_trait]
    impl SystemClock for NullClock {
        async fn get_timestamp(&self) -> Result<i64> {
            Err(Error::NotSupported)
        }

        async fn set_timestamp(&self, timestamp: i64) -> Result<()> {
            self.0.lock().unwrap().push(timestamp);

            Ok(())
        }
    }

    fn payload(json: &str) -> Payload {
        serde_json::from_str(json).unwrap()
    }

    fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[tokio::test]
    async fn handler_persists_and_feeds_the_clock() {
        let pipeline = SamplePipeline::open_in_memory(PipelineParams::default()).unwrap();
        let clock = Arc::new(NullClock(std::sync::Mutex::new(Vec::new())));
        let handler = pipeline.build_handler(clock.clone(), "0xABCD");

        let now = now_secs();
        handler
            .handle_telemetry(
                "0xABCD",
                &payload(&format!(r#"{{"timestamp":{now},"temperature":123.222}}"#)),
            )
            .await
            .unwrap();

        assert_eq!(clock.0.lock().unwrap().clone(), vec![now]);

        let reader = pipeline.build_reader("0xABCD");
        assert_eq!(reader.read_timestamp().await.unwrap(), now);
    }

    #[tokio::test]
    async fn reader_reports_no_data_for_unknown_device() {
        let pipeline = SamplePipeline::open_in_memory(PipelineParams::default()).unwrap();

        let reader = pipeline.build_reader("0xABCD");
        assert_eq!(reader.read_timestamp().await, Err(Error::NoData));
    }

    #[tokio::test]
    async fn reader_ignores_registration_samples() {
        let pipeline = SamplePipeline::open_in_memory(PipelineParams::default()).unwrap();
        let clock = Arc::new(NullClock(std::sync::Mutex::new(Vec::new())));
        let handler = pipeline.build_handler(clock, "0xABCD");

        let now = now_secs();
        handler
            .handle_registration("0xABCD", &payload(&format!(r#"{{"timestamp":{now}}}"#)))
            .await
            .unwrap();

        let reader = pipeline.build_reader("0xABCD");
        assert_eq!(reader.read_timestamp().await, Err(Error::NoData));
    }

    #[tokio::test]
    async fn reader_respects_the_restore_range() {
        let pipeline = SamplePipeline::open_in_memory(PipelineParams {
            restore_range_days: 1,
        })
        .unwrap();
        let clock = Arc::new(NullClock(std::sync::Mutex::new(Vec::new())));
        let handler = pipeline.build_handler(clock, "0xABCD");

        // Three days old: outside the one-day range.
        let stale = now_secs() - 3 * 86_400;
        handler
            .handle_telemetry("0xABCD", &payload(&format!(r#"{{"timestamp":{stale}}}"#)))
            .await
            .unwrap();

        let reader = pipeline.build_reader("0xABCD");
        assert_eq!(reader.read_timestamp().await, Err(Error::NoData));
    }

    #[tokio::test]
    async fn reader_keeps_the_latest_timestamp() {
        let pipeline = SamplePipeline::open_in_memory(PipelineParams::default()).unwrap();
        let clock = Arc::new(NullClock(std::sync::Mutex::new(Vec::new())));
        let handler = pipeline.build_handler(clock, "0xABCD");

        let now = now_secs();
        for offset in [0, 10, 5] {
            handler
                .handle_telemetry(
                    "0xABCD",
                    &payload(&format!(r#"{{"timestamp":{}}}"#, now + offset)),
                )
                .await
                .unwrap();
        }

        let reader = pipeline.build_reader("0xABCD");
        assert_eq!(reader.read_timestamp().await.unwrap(), now + 10);
    }

    #[tokio::test]
    async fn handler_rejects_bad_timestamps() {
        let pipeline = SamplePipeline::open_in_memory(PipelineParams::default()).unwrap();
        let clock = Arc::new(NullClock(std::sync::Mutex::new(Vec::new())));
        let handler = pipeline.build_handler(clock.clone(), "0xABCD");

        assert_eq!(
            handler.handle_telemetry("0xABCD", &payload("{}")).await,
            Err(Error::Failed),
        );
        assert_eq!(
            handler
                .handle_telemetry("0xABCD", &payload(r#"{"timestamp":"soon"}"#))
                .await,
            Err(Error::Failed),
        );
        assert_eq!(
            handler
                .handle_telemetry("0xABCD", &payload(r#"{"timestamp":-5}"#))
                .await,
            Err(Error::Failed),
        );

        assert!(clock.0.lock().unwrap().is_empty());
    }
}
