//! Task, lifecycle, and notification traits.

use async_trait::async_trait;

use sensorhub_types::{Error, Result};

/// A unit of work driven by a [`TaskRunner`](crate::TaskRunner).
///
/// `run` is invoked once per runner iteration. Returning an error marks the
/// iteration as failed; the runner keeps going and retries on the next tick.
#[async_trait]
pub trait Task: Send + Sync {
    /// Run a single iteration of the task.
    async fn run(&self) -> Result<()>;
}

/// Receives errors from failed task iterations.
pub trait ErrorHandler: Send + Sync {
    /// Handle the error from a `run` call.
    fn handle_error(&self, err: Error);
}

/// Wakes up an execution ahead of its schedule.
pub trait Awakener: Send + Sync {
    /// Wake up the execution. Never blocks; repeated calls coalesce.
    fn awake(&self);
}

/// Capability to reset the inactivity timer for one device.
#[async_trait]
pub trait AliveNotifier: Send + Sync {
    /// Mark the associated device as alive.
    async fn notify_alive(&self);
}

/// Starts an asynchronous activity.
#[async_trait]
pub trait Starter: Send + Sync {
    /// Begin the activity.
    async fn start(&self) -> Result<()>;
}

/// Stops an asynchronous activity.
#[async_trait]
pub trait Stopper: Send + Sync {
    /// End the activity, blocking until it has fully stopped.
    async fn stop(&self) -> Result<()>;
}

/// Task decorator that reports each successful run to an [`AliveNotifier`].
pub struct AliveTask {
    task: Box<dyn Task>,
    notifier: std::sync::Arc<dyn AliveNotifier>,
}

impl AliveTask {
    pub fn new(task: Box<dyn Task>, notifier: std::sync::Arc<dyn AliveNotifier>) -> Self {
        Self { task, notifier }
    }
}

#[async_trait]
impl Task for AliveTask {
    async fn run(&self) -> Result<()> {
        self.task.run().await?;
        self.notifier.notify_alive().await;

        Ok(())
    }
}
