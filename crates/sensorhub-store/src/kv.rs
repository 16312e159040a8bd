//! Key-value registration store.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{error, info};

use sensorhub_core::Stopper;
use sensorhub_types::{Error, Result};

/// Key-value database for arbitrary data.
///
/// Implementations are thread-safe. `read` reports `NoData` for an absent
/// key; `remove` is idempotent.
#[async_trait]
pub trait Database: Send + Sync {
    /// Read the value stored for the key.
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Write the value for the key, replacing any previous value.
    async fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove the key if it exists.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Visit every key-value pair in the database.
    async fn for_each(
        &self,
        visit: &mut (dyn for<'a> FnMut(&'a str, &'a [u8]) -> Result<()> + Send),
    ) -> Result<()>;

    /// Release the database resources.
    async fn close(&self) -> Result<()>;
}

/// SQLite-backed [`Database`] with a single `registry` table.
pub struct SqliteDb {
    conn: Mutex<Option<Connection>>,
}

impl SqliteDb {
    /// Open or create a database at the given path.
    ///
    /// Parent directories are created as needed; WAL mode is enabled for
    /// concurrent read performance.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    error!(%err, path = %parent.display(), "failed to create database directory");

                    Error::Failed
                })?;
            }
        }

        info!(path = %path.display(), "opening registration database");

        let conn = Connection::open(path).map_err(|err| {
            error!(%err, path = %path.display(), "failed to open database");

            Error::Failed
        })?;

        Self::init(conn)
    }

    /// Open a transient in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|err| {
            error!(%err, "failed to open in-memory database");

            Error::Failed
        })?;

        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS registry (
                 uri TEXT PRIMARY KEY,
                 value BLOB NOT NULL
             );",
        )
        .map_err(|err| {
            error!(%err, "failed to initialize database schema");

            Error::Failed
        })?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }
}

#[async_trait]
impl Database for SqliteDb {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(Error::InvalidState)?;

        let value: Option<Vec<u8>> = conn
            .query_row("SELECT value FROM registry WHERE uri = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|err| {
                error!(%err, key, "failed to read record");

                Error::Failed
            })?;

        value.ok_or(Error::NoData)
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(Error::InvalidState)?;

        conn.execute(
            "INSERT INTO registry (uri, value) VALUES (?1, ?2)
             ON CONFLICT (uri) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )
        .map_err(|err| {
            error!(%err, key, "failed to write record");

            Error::Failed
        })?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(Error::InvalidState)?;

        conn.execute("DELETE FROM registry WHERE uri = ?1", [key])
            .map_err(|err| {
                error!(%err, key, "failed to remove record");

                Error::Failed
            })?;

        Ok(())
    }

    async fn for_each(
        &self,
        visit: &mut (dyn for<'a> FnMut(&'a str, &'a [u8]) -> Result<()> + Send),
    ) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(Error::InvalidState)?;

        let mut stmt = conn
            .prepare("SELECT uri, value FROM registry ORDER BY uri")
            .map_err(|err| {
                error!(%err, "failed to prepare iteration");

                Error::Failed
            })?;

        let mut rows = stmt.query([]).map_err(|err| {
            error!(%err, "failed to iterate records");

            Error::Failed
        })?;

        loop {
            let row = match rows.next() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(err) => {
                    error!(%err, "failed to advance record iteration");

                    return Err(Error::Failed);
                }
            };

            let key: String = row.get(0).map_err(|_| Error::Failed)?;
            let value: Vec<u8> = row.get(1).map_err(|_| Error::Failed)?;

            visit(&key, &value)?;
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.lock().await.take();

        if let Some(conn) = conn {
            if let Err((_conn, err)) = conn.close() {
                error!(%err, "failed to close database");

                return Err(Error::Failed);
            }
        }

        Ok(())
    }
}

/// Stopper adapter that closes a database on shutdown.
pub struct DatabaseStopper {
    db: Arc<dyn Database>,
}

impl DatabaseStopper {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Stopper for DatabaseStopper {
    async fn stop(&self) -> Result<()> {
        self.db.close().await
    }
}
