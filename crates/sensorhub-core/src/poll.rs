//! Single-device poll state machine.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use sensorhub_types::{Error, Payload, Result};

use crate::fetch::Fetcher;
use crate::handler::DataHandler;
use crate::identity::IdHolder;
use crate::sync::TimeSynchronizer;
use crate::task::Task;
use crate::verify::TimeVerifier;

/// Actively fetches registration and telemetry data from one device.
///
/// Each [`Task::run`] invocation performs one full poll iteration:
/// registration fetch, device ID reconciliation, timestamp verification,
/// telemetry fetch, and handler dispatch, in that order. Any failure
/// aborts the remaining phases; the periodic runner retries on the next
/// tick. An invalid timestamp additionally fires one synchronization
/// attempt before the iteration fails.
pub struct PollDevice {
    registration: Box<dyn Fetcher>,
    telemetry: Box<dyn Fetcher>,
    holder: Arc<IdHolder>,
    handler: Box<dyn DataHandler>,
    synchronizer: Box<dyn TimeSynchronizer>,
    verifier: Box<dyn TimeVerifier>,
}

impl PollDevice {
    /// Create a poll machine for one device.
    ///
    /// * `registration` - fetches the device registration data.
    /// * `telemetry` - fetches the device telemetry data.
    /// * `holder` - receives the discovered device ID.
    /// * `handler` - consumes fetched payloads.
    /// * `synchronizer` - fired when a device timestamp fails verification.
    /// * `verifier` - validates device timestamps.
    pub fn new(
        registration: Box<dyn Fetcher>,
        telemetry: Box<dyn Fetcher>,
        holder: Arc<IdHolder>,
        handler: Box<dyn DataHandler>,
        synchronizer: Box<dyn TimeSynchronizer>,
        verifier: Box<dyn TimeVerifier>,
    ) -> Self {
        Self {
            registration,
            telemetry,
            holder,
            handler,
            synchronizer,
            verifier,
        }
    }

    async fn fetch_registration(&self) -> Result<Payload> {
        let payload = decode(&self.registration.fetch().await?)?;

        self.reconcile_device_id(&payload)?;
        self.validate_timestamp(&payload).await?;

        Ok(payload)
    }

    async fn fetch_telemetry(&self) -> Result<Payload> {
        let payload = decode(&self.telemetry.fetch().await?)?;

        self.validate_timestamp(&payload).await?;

        Ok(payload)
    }

    /// Adopt or verify the device-reported identifier.
    ///
    /// Once an ID has been observed for this device it is immutable; a
    /// different value from a later poll is a hard mismatch that fails
    /// every iteration until an operator intervenes.
    fn reconcile_device_id(&self, payload: &Payload) -> Result<()> {
        let id = payload.get("device_id").ok_or_else(|| {
            error!("registration is missing the device_id field");

            Error::Failed
        })?;

        let device_id = id.as_str().ok_or_else(|| {
            error!("registration device_id has an invalid type");

            Error::Failed
        })?;

        let known = self.holder.get();
        if !known.is_empty() && known != device_id {
            error!(want = %known, got = device_id, "device ID mismatch");

            return Err(Error::Failed);
        }

        if known.is_empty() {
            info!(device_id, "device ID received");
        }

        self.holder.set(device_id);

        Ok(())
    }

    async fn validate_timestamp(&self, payload: &Payload) -> Result<()> {
        let value = payload.get("timestamp").ok_or_else(|| {
            error!("device payload is missing the timestamp field");

            Error::Failed
        })?;

        let timestamp = value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
            .ok_or_else(|| {
                error!("device payload timestamp has an invalid type");

                Error::Failed
            })?;

        if !self.verifier.verify(timestamp).await {
            info!(
                device_id = %self.holder.get(),
                timestamp, "invalid device timestamp, starting time sync",
            );

            if let Err(err) = self.synchronizer.sync_time().await {
                error!(%err, "failed to sync device time");
            }

            // The next tick re-checks the timestamp; synchronization must
            // not race with data persistence in this iteration.
            return Err(Error::Failed);
        }

        Ok(())
    }
}

#[async_trait]
impl Task for PollDevice {
    async fn run(&self) -> Result<()> {
        let registration = match self.fetch_registration().await {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, "failed to fetch registration");

                return Err(Error::Failed);
            }
        };

        let telemetry = match self.fetch_telemetry().await {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, "failed to fetch telemetry");

                return Err(Error::Failed);
            }
        };

        let device_id = self.holder.get();

        if let Err(err) = self
            .handler
            .handle_registration(&device_id, &registration)
            .await
        {
            error!(%err, %device_id, "failed to handle registration");

            return Err(Error::Failed);
        }

        if let Err(err) = self.handler.handle_telemetry(&device_id, &telemetry).await {
            error!(%err, %device_id, "failed to handle telemetry");

            return Err(Error::Failed);
        }

        Ok(())
    }
}

fn decode(buf: &[u8]) -> Result<Payload> {
    serde_json::from_slice(buf).map_err(|err| {
        error!(%err, "failed to decode device payload");

        Error::Failed
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::sync::UnsupportedSynchronizer;
    use crate::verify::BasicTimeVerifier;

    struct StubFetcher {
        body: Arc<Mutex<Vec<u8>>>,
        fail: bool,
    }

    impl StubFetcher {
        fn json(body: &str) -> Box<Self> {
            Box::new(Self {
                body: Arc::new(Mutex::new(body.as_bytes().to_vec())),
                fail: false,
            })
        }

        /// Stub whose body can be swapped between runs.
        fn swappable(body: &str) -> (Box<Self>, Arc<Mutex<Vec<u8>>>) {
            let shared = Arc::new(Mutex::new(body.as_bytes().to_vec()));
            let fetcher = Box::new(Self {
                body: shared.clone(),
                fail: false,
            });

            (fetcher, shared)
        }

        fn failing() -> Box<Self> {
            Box::new(Self {
                body: Arc::new(Mutex::new(Vec::new())),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self) -> Result<Vec<u8>> {
            if self.fail {
                return Err(Error::Failed);
            }

            Ok(self.body.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        registrations: Mutex<Vec<(String, Payload)>>,
        telemetry: Mutex<Vec<(String, Payload)>>,
    }

    #[async_trait]
    impl DataHandler for RecordingHandler {
        async fn handle_registration(&self, device_id: &str, payload: &Payload) -> Result<()> {
            self.registrations
                .lock()
                .unwrap()
                .push((device_id.to_string(), payload.clone()));

            Ok(())
        }

        async fn handle_telemetry(&self, device_id: &str, payload: &Payload) -> Result<()> {
            self.telemetry
                .lock()
                .unwrap()
                .push((device_id.to_string(), payload.clone()));

            Ok(())
        }
    }

    struct CountingSynchronizer(AtomicUsize);

    #[async_trait]
    impl TimeSynchronizer for CountingSynchronizer {
        async fn sync_time(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);

            Ok(())
        }
    }

    struct SharedHandler(Arc<RecordingHandler>);

    #[async_trait]
    impl DataHandler for SharedHandler {
        async fn handle_registration(&self, device_id: &str, payload: &Payload) -> Result<()> {
            self.0.handle_registration(device_id, payload).await
        }

        async fn handle_telemetry(&self, device_id: &str, payload: &Payload) -> Result<()> {
            self.0.handle_telemetry(device_id, payload).await
        }
    }

    fn poll_device(
        registration: Box<dyn Fetcher>,
        telemetry: Box<dyn Fetcher>,
        holder: Arc<IdHolder>,
        handler: Arc<RecordingHandler>,
    ) -> PollDevice {
        PollDevice::new(
            registration,
            telemetry,
            holder,
            Box::new(SharedHandler(handler)),
            Box::new(UnsupportedSynchronizer),
            Box::new(BasicTimeVerifier),
        )
    }

    #[tokio::test]
    async fn happy_path_dispatches_both_payloads() {
        let holder = Arc::new(IdHolder::new());
        let handler = Arc::new(RecordingHandler::default());

        let device = poll_device(
            StubFetcher::json(r#"{"device_id":"0xABCD","timestamp":123}"#),
            StubFetcher::json(r#"{"timestamp":123,"temperature":123.222}"#),
            holder.clone(),
            handler.clone(),
        );

        device.run().await.unwrap();

        assert_eq!(holder.get(), "0xABCD");

        let registrations = handler.registrations.lock().unwrap();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].0, "0xABCD");

        let telemetry = handler.telemetry.lock().unwrap();
        assert_eq!(telemetry.len(), 1);
        assert_eq!(telemetry[0].0, "0xABCD");
        assert_eq!(
            telemetry[0].1.get("temperature").unwrap().as_f64().unwrap(),
            123.222,
        );
    }

    #[tokio::test]
    async fn transport_failure_aborts_iteration() {
        let holder = Arc::new(IdHolder::new());
        let handler = Arc::new(RecordingHandler::default());

        let device = poll_device(
            StubFetcher::failing(),
            StubFetcher::json(r#"{"timestamp":123}"#),
            holder.clone(),
            handler.clone(),
        );

        assert_eq!(device.run().await, Err(Error::Failed));
        assert_eq!(holder.get(), "");
        assert!(handler.registrations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_device_id_fails_without_caching() {
        let holder = Arc::new(IdHolder::new());
        let handler = Arc::new(RecordingHandler::default());

        let device = poll_device(
            StubFetcher::json(r#"{"timestamp":123}"#),
            StubFetcher::json(r#"{"timestamp":123}"#),
            holder.clone(),
            handler.clone(),
        );

        assert_eq!(device.run().await, Err(Error::Failed));
        assert_eq!(holder.get(), "");
    }

    #[tokio::test]
    async fn wrong_device_id_type_fails() {
        let holder = Arc::new(IdHolder::new());
        let handler = Arc::new(RecordingHandler::default());

        let device = poll_device(
            StubFetcher::json(r#"{"device_id":17,"timestamp":123}"#),
            StubFetcher::json(r#"{"timestamp":123}"#),
            holder.clone(),
            handler,
        );

        assert_eq!(device.run().await, Err(Error::Failed));
        assert_eq!(holder.get(), "");
    }

    #[tokio::test]
    async fn device_id_mismatch_keeps_original() {
        let holder = Arc::new(IdHolder::new());
        let handler = Arc::new(RecordingHandler::default());

        let (registration, registration_body) =
            StubFetcher::swappable(r#"{"device_id":"0xABCD","timestamp":123}"#);

        let device = poll_device(
            registration,
            StubFetcher::json(r#"{"timestamp":123}"#),
            holder.clone(),
            handler.clone(),
        );

        device.run().await.unwrap();
        assert_eq!(holder.get(), "0xABCD");

        // The device starts reporting a different ID.
        *registration_body.lock().unwrap() =
            br#"{"device_id":"0xCBDE","timestamp":123}"#.to_vec();

        assert_eq!(device.run().await, Err(Error::Failed));
        assert_eq!(holder.get(), "0xABCD");
        assert_eq!(handler.registrations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_timestamp_triggers_one_sync_and_fails() {
        let holder = Arc::new(IdHolder::new());
        let handler = Arc::new(RecordingHandler::default());
        let synchronizer = Arc::new(CountingSynchronizer(AtomicUsize::new(0)));

        struct SharedSync(Arc<CountingSynchronizer>);

        #[async_trait]
        impl TimeSynchronizer for SharedSync {
            async fn sync_time(&self) -> Result<()> {
                self.0.sync_time().await
            }
        }

        let device = PollDevice::new(
            StubFetcher::json(r#"{"device_id":"0xABCD","timestamp":-1}"#),
            StubFetcher::json(r#"{"timestamp":-1}"#),
            holder.clone(),
            Box::new(SharedHandler(handler.clone())),
            Box::new(SharedSync(synchronizer.clone())),
            Box::new(BasicTimeVerifier),
        );

        assert_eq!(device.run().await, Err(Error::Failed));

        // The registration phase fired the synchronizer once; telemetry
        // never ran.
        assert_eq!(synchronizer.0.load(Ordering::SeqCst), 1);
        assert!(handler.registrations.lock().unwrap().is_empty());
        // The ID itself parsed fine and is retained for the next attempt.
        assert_eq!(holder.get(), "0xABCD");
    }

    #[tokio::test]
    async fn telemetry_timestamp_is_verified_too() {
        let holder = Arc::new(IdHolder::new());
        let handler = Arc::new(RecordingHandler::default());

        let device = poll_device(
            StubFetcher::json(r#"{"device_id":"0xABCD","timestamp":123}"#),
            StubFetcher::json(r#"{"timestamp":0}"#),
            holder,
            handler.clone(),
        );

        assert_eq!(device.run().await, Err(Error::Failed));
        assert!(handler.telemetry.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn garbage_body_fails_decode() {
        let holder = Arc::new(IdHolder::new());
        let handler = Arc::new(RecordingHandler::default());

        let device = poll_device(
            StubFetcher::json("not json"),
            StubFetcher::json(r#"{"timestamp":123}"#),
            holder,
            handler,
        );

        assert_eq!(device.run().await, Err(Error::Failed));
    }
}
