//! Device registry: persistence plus per-device supervision.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use sensorhub_core::{
    AliveTask, BasicTimeVerifier, ClockSynchronizer, DataHandler, DriftTimeVerifier, ErrorHandler,
    FanoutStarter, FanoutStopper, FuncStopper, HttpClient, IdHolder, PollDevice,
    RemoteSystemClock, ResolveStore, Starter, Stopper, SystemClock, Task, TaskRunner,
    TaskRunnerParams, TimeSynchronizer, TimeVerifier, UnsupportedSynchronizer, UrlFetcher,
};
use sensorhub_store::{
    ClockReader, ClockReaderBuilder, ClockRestorer, DataHandlerBuilder, Database,
};
use sensorhub_types::{DeviceRecord, Error, Payload, Result};
use tokio_util::sync::CancellationToken;

use crate::monitor::AliveMonitor;
use crate::store::Store;

/// HTTP polling options for registered devices.
#[derive(Debug, Clone)]
pub struct HttpParams {
    /// How often to fetch data from a device.
    pub fetch_interval: Duration,
    /// How long to wait for a device response.
    pub fetch_timeout: Duration,
}

impl Default for HttpParams {
    fn default() -> Self {
        Self {
            fetch_interval: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

/// Clock verification and synchronization options.
#[derive(Debug, Clone)]
pub struct TimeSyncParams {
    /// Disable automatic device time synchronization. Device timestamps
    /// are still checked.
    pub disable: bool,
    /// Maximum allowed difference between local and device UNIX time.
    /// Zero selects the basic positive-timestamp check.
    pub max_drift_interval: Duration,
    /// How often to retry the timestamp restoring procedure.
    pub restore_interval: Duration,
}

impl Default for TimeSyncParams {
    fn default() -> Self {
        Self {
            disable: false,
            max_drift_interval: Duration::ZERO,
            restore_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration for [`CacheStore`].
#[derive(Debug, Clone, Default)]
pub struct CacheStoreParams {
    pub http: HttpParams,
    pub time_sync: TimeSyncParams,
}

/// Persisted registration record, one per device URI.
#[derive(Debug, Serialize, Deserialize)]
struct StorageRecord {
    desc: String,
    #[serde(rename = "type")]
    kind: String,
    timestamp: i64,
}

/// Registry of devices backed by persistent storage.
///
/// Every registered device gets a supervised node: the poll runner, the
/// timestamp restorer runner, the hostname binding, and a cancellation
/// scope derived from the registry scope. The persistent record set and
/// the live node set move together under one lock; crash-recovery
/// reconstructs the nodes from the records at start-up and purges records
/// that no longer deserialize or carry an unsupported URI.
pub struct CacheStore {
    cancel: CancellationToken,
    local_clock: Arc<dyn SystemClock>,
    reader_builder: Arc<dyn ClockReaderBuilder>,
    handler_builder: Arc<dyn DataHandlerBuilder>,
    db: Arc<dyn Database>,
    resolve_store: Arc<ResolveStore>,
    alive_monitor: Arc<StdMutex<Option<Arc<dyn AliveMonitor>>>>,
    params: CacheStoreParams,
    nodes: Mutex<HashMap<String, Arc<StoreNode>>>,
}

impl CacheStore {
    /// Create the registry and restore nodes persisted by previous runs.
    ///
    /// Restored nodes are constructed but not started; call
    /// [`Starter::start`] to begin polling.
    ///
    /// * `cancel` - parent cancellation scope.
    /// * `local_clock` - local UNIX time source.
    /// * `reader_builder` - builds per-device persisted-timestamp readers.
    /// * `handler_builder` - builds per-device data handlers.
    /// * `db` - persistent registration store.
    /// * `resolve_store` - hostname registration for `.local` devices.
    pub async fn new(
        cancel: CancellationToken,
        local_clock: Arc<dyn SystemClock>,
        reader_builder: Arc<dyn ClockReaderBuilder>,
        handler_builder: Arc<dyn DataHandlerBuilder>,
        db: Arc<dyn Database>,
        resolve_store: Arc<ResolveStore>,
        params: CacheStoreParams,
    ) -> Result<Self> {
        let store = Self {
            cancel,
            local_clock,
            reader_builder,
            handler_builder,
            db,
            resolve_store,
            alive_monitor: Arc::new(StdMutex::new(None)),
            params,
            nodes: Mutex::new(HashMap::new()),
        };

        store.restore_nodes().await?;

        Ok(store)
    }

    /// Attach the device inactivity monitor.
    ///
    /// Nodes resolve the monitor lazily on every successful poll, so a
    /// monitor attached after construction still covers restored nodes.
    pub fn set_alive_monitor(&self, monitor: Arc<dyn AliveMonitor>) {
        *self.alive_monitor.lock().expect("alive monitor lock") = Some(monitor);
    }

    async fn restore_nodes(&self) -> Result<()> {
        let mut entries = Vec::new();
        self.db
            .for_each(&mut |uri, value| {
                entries.push((uri.to_string(), value.to_vec()));

                Ok(())
            })
            .await?;

        let mut unrestored = Vec::new();

        {
            let mut nodes = self.nodes.lock().await;

            for (uri, value) in entries {
                match self.restore_node(&uri, &value) {
                    Ok(node) => {
                        info!(%uri, kind = %node.kind, desc = %node.desc, "device restored");
                        nodes.insert(uri, Arc::new(node));
                    }
                    Err(err) => {
                        error!(%err, %uri, "failed to restore device");
                        unrestored.push(uri);
                    }
                }
            }
        }

        // Purge undecodable or unsupported records; the store heals
        // itself instead of refusing to start.
        for uri in unrestored {
            match self.db.remove(&uri).await {
                Ok(()) => info!(%uri, "unrestored device removed"),
                Err(err) => error!(%err, %uri, "failed to remove unrestored device"),
            }
        }

        Ok(())
    }

    fn restore_node(&self, uri: &str, value: &[u8]) -> Result<StoreNode> {
        let record: StorageRecord = serde_json::from_slice(value).map_err(|err| {
            error!(%err, uri, "failed to decode device record");

            Error::InvalidArg
        })?;

        self.make_node(uri, &record.kind, &record.desc, record.timestamp)
    }

    fn make_node(&self, uri: &str, kind: &str, desc: &str, created_at: i64) -> Result<StoreNode> {
        let url = Url::parse(uri).map_err(|err| {
            error!(%err, uri, "failed to parse device URI");

            Error::InvalidArg
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::NotSupported);
        }

        if url.port().is_none() {
            error!(uri, "device URI must carry an explicit HTTP port");

            return Err(Error::InvalidArg);
        }

        let cancel = self.cancel.child_token();
        let mut starter = FanoutStarter::default();
        let mut stopper = FanoutStopper::default();

        let holder = Arc::new(IdHolder::new());

        let reader = Arc::new(LazyClockReader {
            holder: holder.clone(),
            builder: self.reader_builder.clone(),
            reader: Mutex::new(None),
        });
        let restorer = Arc::new(ClockRestorer::new(reader));

        let restorer_runner = Arc::new(TaskRunner::new(
            cancel.clone(),
            restorer.clone(),
            Some(restorer.clone()),
            TaskRunnerParams {
                update_interval: self.params.time_sync.restore_interval,
                exit_on_success: true,
                ..Default::default()
            },
        ));
        starter.add(restorer_runner.clone());
        stopper.add(format!("{uri}-clock-restorer"), restorer_runner);

        let client = self.make_http_client(&mut stopper, uri, desc, url.host_str());

        let task = self.make_poll_task(&cancel, client, holder.clone(), restorer, uri)?;

        let device_runner = Arc::new(TaskRunner::new(
            cancel.clone(),
            task,
            Some(Arc::new(LogErrorHandler {
                uri: uri.to_string(),
                kind: kind.to_string(),
                desc: desc.to_string(),
            })),
            TaskRunnerParams {
                update_interval: self.params.http.fetch_interval,
                ..Default::default()
            },
        ));
        starter.add(device_runner.clone());
        stopper.add(format!("{uri}-device-http"), device_runner);

        Ok(StoreNode {
            uri: uri.to_string(),
            kind: kind.to_string(),
            desc: desc.to_string(),
            created_at,
            holder,
            cancel,
            starter,
            stopper,
        })
    }

    fn make_poll_task(
        &self,
        cancel: &CancellationToken,
        client: Arc<HttpClient>,
        holder: Arc<IdHolder>,
        restorer: Arc<ClockRestorer>,
        uri: &str,
    ) -> Result<Arc<dyn Task>> {
        let timeout = self.params.http.fetch_timeout;

        let synchronizer: Box<dyn TimeSynchronizer> = if self.params.time_sync.disable {
            Box::new(UnsupportedSynchronizer)
        } else {
            let device_clock = RemoteSystemClock::new(
                cancel.clone(),
                client.clone(),
                parse_endpoint(uri, "system/time")?,
                timeout,
            );

            Box::new(ClockSynchronizer::new(
                self.local_clock.clone(),
                restorer.clone(),
                Arc::new(device_clock),
            ))
        };

        let verifier: Box<dyn TimeVerifier> =
            if self.params.time_sync.max_drift_interval.is_zero() {
                Box::new(BasicTimeVerifier)
            } else {
                Box::new(DriftTimeVerifier::new(
                    self.local_clock.clone(),
                    self.params.time_sync.max_drift_interval,
                ))
            };

        let handler = Box::new(LazyDataHandler {
            clock: restorer,
            builder: self.handler_builder.clone(),
            handler: Mutex::new(None),
        });

        let poll = PollDevice::new(
            Box::new(UrlFetcher::new(
                cancel.clone(),
                client.clone(),
                parse_endpoint(uri, "registration")?,
                timeout,
            )),
            Box::new(UrlFetcher::new(
                cancel.clone(),
                client,
                parse_endpoint(uri, "telemetry")?,
                timeout,
            )),
            holder,
            handler,
            synchronizer,
            verifier,
        );

        // The alive monitor is looked up per run: it may be attached
        // after the registry restored its nodes.
        Ok(Arc::new(AliveTask::new(
            Box::new(poll),
            Arc::new(LazyAliveNotifier {
                uri: uri.to_string(),
                slot: self.alive_monitor.clone(),
            }),
        )))
    }

    fn make_http_client(
        &self,
        stopper: &mut FanoutStopper,
        uri: &str,
        desc: &str,
        hostname: Option<&str>,
    ) -> Arc<HttpClient> {
        let hostname = match hostname {
            Some(hostname) if uri.contains(".local") => hostname.to_string(),
            _ => return Arc::new(HttpClient::new()),
        };

        self.resolve_store.add(&hostname);

        let resolve_store = self.resolve_store.clone();
        let host = hostname.clone();
        stopper.add(
            format!("resolve-store-{desc}"),
            Arc::new(FuncStopper::new(move || {
                resolve_store.remove(&host);

                Ok(())
            })),
        );

        Arc::new(HttpClient::with_resolver(self.resolve_store.clone()))
    }
}

#[async_trait]
impl Store for CacheStore {
    async fn add(&self, uri: &str, kind: &str, desc: &str) -> Result<()> {
        let mut nodes = self.nodes.lock().await;

        if nodes.contains_key(uri) {
            return Err(Error::Exists);
        }

        let now = unix_now()?;
        let node = self.make_node(uri, kind, desc, now)?;

        let record = StorageRecord {
            desc: desc.to_string(),
            kind: kind.to_string(),
            timestamp: now,
        };
        let value = serde_json::to_vec(&record).map_err(|err| {
            error!(%err, uri, "failed to encode device record");

            Error::Failed
        })?;

        self.db.write(uri, &value).await.map_err(|err| {
            error!(%err, uri, "failed to persist device record");

            err
        })?;

        if let Err(err) = node.start().await {
            error!(%err, uri, "failed to start device node");

            // Commit both or neither: undo the write so the DB and the
            // node map stay in step.
            if let Err(remove_err) = self.db.remove(uri).await {
                error!(%remove_err, uri, "failed to roll back device record");
            }

            return Err(err);
        }

        nodes.insert(uri.to_string(), Arc::new(node));

        info!(uri, kind, desc, "device added");

        Ok(())
    }

    async fn remove(&self, uri: &str) -> Result<()> {
        let mut nodes = self.nodes.lock().await;

        let node = nodes.get(uri).cloned().ok_or(Error::NoData)?;

        // DB deletion goes first: a crash in between leaves an orphan
        // runtime record which simply won't be restored.
        self.db.remove(uri).await?;

        if let Err(err) = node.stop().await {
            error!(%err, uri, "failed to stop device");

            return Err(Error::Failed);
        }

        nodes.remove(uri);

        info!(uri, "device removed");

        Ok(())
    }

    async fn get_desc(&self) -> Vec<DeviceRecord> {
        let nodes = self.nodes.lock().await;

        nodes
            .values()
            .map(|node| DeviceRecord {
                uri: node.uri.clone(),
                kind: node.kind.clone(),
                desc: node.desc.clone(),
                id: node.holder.get(),
                created_at: node.created_at.to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl Starter for CacheStore {
    async fn start(&self) -> Result<()> {
        let nodes = self.nodes.lock().await;

        for node in nodes.values() {
            node.start().await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Stopper for CacheStore {
    async fn stop(&self) -> Result<()> {
        let mut nodes = self.nodes.lock().await;

        for (uri, node) in nodes.iter() {
            if let Err(err) = node.stop().await {
                error!(%err, %uri, "failed to stop device");
            }
        }

        nodes.clear();

        Ok(())
    }
}

/// In-memory supervision record for one device.
struct StoreNode {
    uri: String,
    kind: String,
    desc: String,
    created_at: i64,
    holder: Arc<IdHolder>,
    cancel: CancellationToken,
    starter: FanoutStarter,
    stopper: FanoutStopper,
}

impl StoreNode {
    async fn start(&self) -> Result<()> {
        self.starter.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();

        self.stopper.stop().await
    }
}

/// Clock reader built lazily once the device ID is known.
struct LazyClockReader {
    holder: Arc<IdHolder>,
    builder: Arc<dyn ClockReaderBuilder>,
    reader: Mutex<Option<Arc<dyn ClockReader>>>,
}

#[async_trait]
impl ClockReader for LazyClockReader {
    async fn read_timestamp(&self) -> Result<i64> {
        let reader = {
            let mut slot = self.reader.lock().await;

            match &*slot {
                Some(reader) => reader.clone(),
                None => {
                    let device_id = self.holder.get();
                    if device_id.is_empty() {
                        // The first registration fetch hasn't happened
                        // yet; the restorer runner retries on interval.
                        return Err(Error::Failed);
                    }

                    let reader = self.builder.build_reader(&device_id);
                    *slot = Some(reader.clone());

                    reader
                }
            }
        };

        reader.read_timestamp().await
    }
}

/// Data handler built lazily on first use and keyed by the device ID,
/// feeding every observed timestamp into the restorer clock.
struct LazyDataHandler {
    clock: Arc<ClockRestorer>,
    builder: Arc<dyn DataHandlerBuilder>,
    handler: Mutex<Option<Arc<dyn DataHandler>>>,
}

impl LazyDataHandler {
    async fn handler(&self, device_id: &str) -> Arc<dyn DataHandler> {
        let mut slot = self.handler.lock().await;

        match &*slot {
            Some(handler) => handler.clone(),
            None => {
                let handler: Arc<dyn DataHandler> =
                    Arc::from(self.builder.build_handler(self.clock.clone(), device_id));
                *slot = Some(handler.clone());

                handler
            }
        }
    }
}

#[async_trait]
impl DataHandler for LazyDataHandler {
    async fn handle_registration(&self, device_id: &str, payload: &Payload) -> Result<()> {
        self.handler(device_id)
            .await
            .handle_registration(device_id, payload)
            .await
    }

    async fn handle_telemetry(&self, device_id: &str, payload: &Payload) -> Result<()> {
        self.handler(device_id)
            .await
            .handle_telemetry(device_id, payload)
            .await
    }
}

/// Alive notifier that resolves the monitor at notification time.
struct LazyAliveNotifier {
    uri: String,
    slot: Arc<StdMutex<Option<Arc<dyn AliveMonitor>>>>,
}

#[async_trait]
impl sensorhub_core::AliveNotifier for LazyAliveNotifier {
    async fn notify_alive(&self) {
        let notifier = {
            let slot = self.slot.lock().expect("alive monitor lock");
            slot.as_ref().map(|monitor| monitor.monitor(&self.uri))
        };

        if let Some(notifier) = notifier {
            notifier.notify_alive().await;
        }
    }
}

struct LogErrorHandler {
    uri: String,
    kind: String,
    desc: String,
}

impl ErrorHandler for LogErrorHandler {
    fn handle_error(&self, err: Error) {
        error!(
            %err,
            uri = %self.uri,
            kind = %self.kind,
            desc = %self.desc,
            "failed to handle device data",
        );
    }
}

fn parse_endpoint(uri: &str, path: &str) -> Result<Url> {
    Url::parse(&format!("{uri}/{path}")).map_err(|err| {
        error!(%err, uri, path, "failed to build device endpoint URL");

        Error::InvalidArg
    })
}

fn unix_now() -> Result<i64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .map_err(|_| Error::Failed)
}
