//! End-to-end scenarios against a stub HTTP device.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::routing::get;
use tokio_util::sync::CancellationToken;

use sensorhub_core::{MonotonicClock, ResolveHandler, ResolveStore, Starter, Stopper, Task};
use sensorhub_service::StoreAliveMonitor;
use sensorhub_service::registry::{CacheStore, CacheStoreParams, HttpParams, TimeSyncParams};
use sensorhub_service::store::Store;
use sensorhub_store::{
    ClockReaderBuilder, Database, PipelineParams, SamplePipeline, SqliteDb,
};
use sensorhub_types::Error;

/// Mutable stub device state shared with the test body.
#[derive(Clone)]
struct StubDevice {
    device_id: Arc<Mutex<String>>,
    timestamp: Arc<Mutex<i64>>,
}

impl StubDevice {
    fn new(device_id: &str, timestamp: i64) -> Self {
        Self {
            device_id: Arc::new(Mutex::new(device_id.to_string())),
            timestamp: Arc::new(Mutex::new(timestamp)),
        }
    }

    fn set_device_id(&self, device_id: &str) {
        *self.device_id.lock().unwrap() = device_id.to_string();
    }

    fn set_timestamp(&self, timestamp: i64) {
        *self.timestamp.lock().unwrap() = timestamp;
    }

    async fn serve(&self) -> SocketAddr {
        async fn registration(State(device): State<StubDevice>) -> String {
            format!(
                r#"{{"device_id":"{}","timestamp":{}}}"#,
                device.device_id.lock().unwrap(),
                device.timestamp.lock().unwrap(),
            )
        }

        async fn telemetry(State(device): State<StubDevice>) -> String {
            format!(
                r#"{{"timestamp":{},"temperature":123.222}}"#,
                device.timestamp.lock().unwrap(),
            )
        }

        async fn system_time(
            State(device): State<StubDevice>,
            Query(params): Query<std::collections::HashMap<String, String>>,
        ) -> String {
            match params.get("timestamp") {
                Some(raw) => {
                    device.set_timestamp(raw.parse().unwrap());

                    "OK".to_string()
                }
                None => device.timestamp.lock().unwrap().to_string(),
            }
        }

        let router = Router::new()
            .route("/registration", get(registration))
            .route("/telemetry", get(telemetry))
            .route("/system/time", get(system_time))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        addr
    }
}

struct Hub {
    cancel: CancellationToken,
    store: Arc<CacheStore>,
    pipeline: Arc<SamplePipeline>,
    db: Arc<dyn Database>,
    resolve_store: Arc<ResolveStore>,
}

impl Hub {
    async fn start(db: Arc<dyn Database>) -> Self {
        let cancel = CancellationToken::new();
        // Unbounded restore range: the scenarios use small literal
        // timestamps far in the past.
        let pipeline = Arc::new(
            SamplePipeline::open_in_memory(PipelineParams {
                restore_range_days: 0,
            })
            .unwrap(),
        );
        let resolve_store = Arc::new(ResolveStore::new());

        let store = Arc::new(
            CacheStore::new(
                cancel.clone(),
                Arc::new(sensorhub_core::LocalSystemClock),
                pipeline.clone(),
                pipeline.clone(),
                db.clone(),
                resolve_store.clone(),
                CacheStoreParams {
                    http: HttpParams {
                        fetch_interval: Duration::from_millis(50),
                        fetch_timeout: Duration::from_secs(1),
                    },
                    time_sync: TimeSyncParams {
                        disable: true,
                        restore_interval: Duration::from_millis(50),
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap(),
        );

        store.start().await.unwrap();

        Self {
            cancel,
            store,
            pipeline,
            db,
            resolve_store,
        }
    }

    async fn stop(&self) {
        self.cancel.cancel();
        self.store.stop().await.unwrap();
    }

    /// Poll the inventory until the device reports the expected ID.
    async fn wait_for_device_id(&self, uri: &str, expected: &str) {
        for _ in 0..100 {
            let records = self.store.get_desc().await;
            if records
                .iter()
                .any(|record| record.uri == uri && record.id == expected)
            {
                return;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        panic!("device {uri} never reported id {expected:?}");
    }

    /// Poll the sample backend until the device's latest persisted
    /// telemetry timestamp matches.
    async fn wait_for_timestamp(&self, device_id: &str, expected: i64) {
        let reader = self.pipeline.build_reader(device_id);

        for _ in 0..100 {
            if reader.read_timestamp().await == Ok(expected) {
                return;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        panic!("device {device_id} never persisted timestamp {expected}");
    }
}

fn memory_db() -> Arc<dyn Database> {
    Arc::new(SqliteDb::open_in_memory().unwrap())
}

fn fresh_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[tokio::test]
async fn happy_path_polls_and_persists() {
    let device = StubDevice::new("0xABCD", 123);
    let addr = device.serve().await;
    let uri = format!("http://{addr}");

    let hub = Hub::start(memory_db()).await;

    hub.store.add(&uri, "t", "d").await.unwrap();

    hub.wait_for_device_id(&uri, "0xABCD").await;
    hub.wait_for_timestamp("0xABCD", 123).await;

    // Both payload kinds reached the backend.
    let records = hub.store.get_desc().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "0xABCD");
    assert_eq!(records[0].kind, "t");
    assert_eq!(records[0].desc, "d");

    hub.stop().await;
}

#[tokio::test]
async fn restart_restores_the_inventory_and_resumes_polling() {
    let device = StubDevice::new("0xABCD", 123);
    let addr = device.serve().await;
    let uri = format!("http://{addr}");

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("registry.db");

    {
        let db: Arc<dyn Database> = Arc::new(SqliteDb::open(&db_path).unwrap());
        let hub = Hub::start(db).await;

        hub.store.add(&uri, "greenhouse", "plant").await.unwrap();
        hub.wait_for_device_id(&uri, "0xABCD").await;
        hub.stop().await;

        let records = hub.store.get_desc().await;
        assert!(records.is_empty(), "stop clears the runtime inventory");
    }

    // A new hub over the same database restores the descriptor set.
    let db: Arc<dyn Database> = Arc::new(SqliteDb::open(&db_path).unwrap());
    let hub = Hub::start(db).await;

    let records = hub.store.get_desc().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].uri, uri);
    assert_eq!(records[0].kind, "greenhouse");
    assert_eq!(records[0].desc, "plant");

    // Polling resumed: fresh data flows again.
    device.set_timestamp(456);
    hub.wait_for_device_id(&uri, "0xABCD").await;
    hub.wait_for_timestamp("0xABCD", 456).await;

    hub.stop().await;
}

#[tokio::test]
async fn invalid_timestamp_blocks_persistence_until_fixed() {
    let device = StubDevice::new("0xABCD", -1);
    let addr = device.serve().await;
    let uri = format!("http://{addr}");

    let hub = Hub::start(memory_db()).await;
    hub.store.add(&uri, "t", "d").await.unwrap();

    // The device ID parses before the timestamp check, so the inventory
    // learns it even though every iteration fails.
    hub.wait_for_device_id(&uri, "0xABCD").await;

    // Nothing is persisted while the clock is invalid.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let reader = hub.pipeline.build_reader("0xABCD");
    assert_eq!(reader.read_timestamp().await, Err(Error::NoData));

    // Once the device clock recovers, the normal flow resumes.
    device.set_timestamp(13);
    hub.wait_for_timestamp("0xABCD", 13).await;

    hub.stop().await;
}

#[tokio::test]
async fn device_id_mismatch_keeps_the_original_identity() {
    let device = StubDevice::new("0xABCD", 123);
    let addr = device.serve().await;
    let uri = format!("http://{addr}");

    let hub = Hub::start(memory_db()).await;
    hub.store.add(&uri, "t", "d").await.unwrap();

    hub.wait_for_device_id(&uri, "0xABCD").await;
    hub.wait_for_timestamp("0xABCD", 123).await;

    // The device suddenly claims another identity.
    device.set_device_id("0xCBDE");
    device.set_timestamp(777);
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Every following poll fails: the original ID stays and the new
    // timestamp never reaches the backend.
    let records = hub.store.get_desc().await;
    assert_eq!(records[0].id, "0xABCD");

    let reader = hub.pipeline.build_reader("0xABCD");
    assert_eq!(reader.read_timestamp().await, Ok(123));
    assert_eq!(
        hub.pipeline.build_reader("0xCBDE").read_timestamp().await,
        Err(Error::NoData),
    );

    hub.stop().await;
}

#[tokio::test]
async fn add_remove_round_trip_restores_prior_state() {
    let device = StubDevice::new("0xABCD", fresh_timestamp());
    let addr = device.serve().await;
    let uri = format!("http://{addr}");

    let hub = Hub::start(memory_db()).await;

    hub.store.add(&uri, "t", "d").await.unwrap();
    assert_eq!(hub.store.add(&uri, "t", "d").await, Err(Error::Exists));

    hub.store.remove(&uri).await.unwrap();
    assert_eq!(hub.store.remove(&uri).await, Err(Error::NoData));

    assert!(hub.store.get_desc().await.is_empty());
    assert_eq!(hub.db.read(&uri).await, Err(Error::NoData));

    // The URI is free again.
    hub.store.add(&uri, "t", "d").await.unwrap();
    hub.stop().await;
}

#[tokio::test]
async fn inactivity_eviction_removes_the_device_and_its_record() {
    #[derive(Default)]
    struct ManualClock {
        now: Mutex<Duration>,
    }

    impl MonotonicClock for ManualClock {
        fn now(&self) -> Duration {
            *self.now.lock().unwrap()
        }
    }

    const MAX_INACTIVE: Duration = Duration::from_secs(100);

    let hub = Hub::start(memory_db()).await;
    let clock = Arc::new(ManualClock::default());
    let monitor = StoreAliveMonitor::new(
        clock.clone(),
        hub.store.clone(),
        MAX_INACTIVE,
    )
    .await;
    hub.store.set_alive_monitor(Arc::new(monitor.clone()));

    // An unreachable device: registered, but it never polls successfully
    // and therefore never notifies the monitor.
    let uri = "http://127.0.0.1:1";
    monitor.add(uri, "t", "d").await.unwrap();
    assert_eq!(hub.store.get_desc().await.len(), 1);

    *clock.now.lock().unwrap() += MAX_INACTIVE;
    monitor.run().await.unwrap();

    assert!(hub.store.get_desc().await.is_empty());
    assert_eq!(hub.db.read(uri).await, Err(Error::NoData));

    hub.stop().await;
}

#[tokio::test]
async fn local_hostname_polls_through_the_resolver() {
    let device = StubDevice::new("0xF00D", 123);
    let addr = device.serve().await;
    let uri = format!("http://stub-device.local:{}", addr.port());

    let hub = Hub::start(memory_db()).await;
    hub.store.add(&uri, "t", "d").await.unwrap();

    // Polls hang on resolution until the discovery path reports the
    // address.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.store.get_desc().await[0].id, "");

    hub.resolve_store
        .handle_resolve("stub-device.local", addr.ip());

    hub.wait_for_device_id(&uri, "0xF00D").await;
    hub.wait_for_timestamp("0xF00D", 123).await;

    hub.stop().await;
}
