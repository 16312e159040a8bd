//! Supervised periodic task execution.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use sensorhub_types::{Error, Result};

use crate::task::{Awakener, ErrorHandler, Starter, Stopper, Task};

/// Configuration for [`TaskRunner`].
#[derive(Debug, Clone)]
pub struct TaskRunnerParams {
    /// How often the task should be run. Must be non-zero.
    pub update_interval: Duration,

    /// Stop the worker after the first successful run.
    pub exit_on_success: bool,

    /// Disable the panic fence around each run.
    pub disable_panic_capture: bool,
}

impl Default for TaskRunnerParams {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(60),
            exit_on_success: false,
            disable_panic_capture: false,
        }
    }
}

/// Periodically runs a task in a supervised tokio worker.
///
/// The worker runs the task once immediately on start, then loops over the
/// interval tick, the awake signal, and cancellation. Iterations never
/// overlap: the next trigger is examined only after the current run
/// returns. A panicking run is captured, logged, and treated as a failed
/// iteration; the worker keeps going.
pub struct TaskRunner {
    cancel: CancellationToken,
    awake: Arc<Notify>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    task: std::sync::Mutex<Option<Arc<dyn Task>>>,
    handler: Option<Arc<dyn ErrorHandler>>,
    params: TaskRunnerParams,
}

impl TaskRunner {
    /// Create a runner for the task.
    ///
    /// The worker observes `cancel`: once the token is cancelled the loop
    /// exits at the next trigger and any in-flight consumer of the token
    /// (HTTP fetchers) aborts promptly.
    pub fn new(
        cancel: CancellationToken,
        task: Arc<dyn Task>,
        handler: Option<Arc<dyn ErrorHandler>>,
        params: TaskRunnerParams,
    ) -> Self {
        Self {
            cancel,
            awake: Arc::new(Notify::new()),
            worker: std::sync::Mutex::new(None),
            task: std::sync::Mutex::new(Some(task)),
            handler,
            params,
        }
    }

    async fn run_worker(
        cancel: CancellationToken,
        awake: Arc<Notify>,
        task: Arc<dyn Task>,
        handler: Option<Arc<dyn ErrorHandler>>,
        params: TaskRunnerParams,
    ) {
        let mut ticker = tokio::time::interval(params.update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick completes immediately.
        ticker.tick().await;

        if Self::run_task(&task, &handler, &params).await {
            return;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if Self::run_task(&task, &handler, &params).await {
                        return;
                    }
                }
                _ = awake.notified() => {
                    if Self::run_task(&task, &handler, &params).await {
                        return;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Run one iteration. Returns true when the worker should exit.
    async fn run_task(
        task: &Arc<dyn Task>,
        handler: &Option<Arc<dyn ErrorHandler>>,
        params: &TaskRunnerParams,
    ) -> bool {
        let result = if params.disable_panic_capture {
            task.run().await
        } else {
            match AssertUnwindSafe(task.run()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    error!(
                        panic = panic_message(&panic),
                        backtrace = %std::backtrace::Backtrace::force_capture(),
                        "task panicked",
                    );

                    Err(Error::Failed)
                }
            }
        };

        match result {
            Ok(()) => params.exit_on_success,
            Err(err) => {
                if let Some(handler) = handler {
                    handler.handle_error(err);
                }

                false
            }
        }
    }
}

#[async_trait]
impl Starter for TaskRunner {
    async fn start(&self) -> Result<()> {
        let task = match self.task.lock().expect("runner task lock").take() {
            Some(task) => task,
            None => {
                warn!("task runner already started");

                return Err(Error::InvalidState);
            }
        };

        let handle = tokio::spawn(Self::run_worker(
            self.cancel.clone(),
            self.awake.clone(),
            task,
            self.handler.clone(),
            self.params.clone(),
        ));

        *self.worker.lock().expect("runner worker lock") = Some(handle);

        Ok(())
    }
}

#[async_trait]
impl Stopper for TaskRunner {
    async fn stop(&self) -> Result<()> {
        let handle = self.worker.lock().expect("runner worker lock").take();

        if let Some(handle) = handle {
            if handle.await.is_err() {
                // The worker itself never panics: the fence is inside.
                return Err(Error::Failed);
            }
        }

        Ok(())
    }
}

impl Awakener for TaskRunner {
    fn awake(&self) {
        // Stores a single permit when the worker is busy, so repeated
        // awakes collapse into at most one extra iteration.
        self.awake.notify_one();
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
