//! Fanout start/stop aggregation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use sensorhub_types::Result;

use crate::task::{Starter, Stopper};

/// Starts a registered collection of starters, failing fast.
#[derive(Default)]
pub struct FanoutStarter {
    starters: Vec<Arc<dyn Starter>>,
}

impl FanoutStarter {
    /// Register a starter to be started on `start`.
    pub fn add(&mut self, starter: Arc<dyn Starter>) {
        self.starters.push(starter);
    }
}

#[async_trait]
impl Starter for FanoutStarter {
    async fn start(&self) -> Result<()> {
        for starter in &self.starters {
            starter.start().await?;
        }

        Ok(())
    }
}

/// Stops a registered collection of stoppers.
///
/// Stoppers are visited in reverse registration order, so the last
/// activity to start is the first to stop. Individual failures are logged
/// and do not interrupt the walk.
#[derive(Default)]
pub struct FanoutStopper {
    nodes: Vec<(String, Arc<dyn Stopper>)>,
}

impl FanoutStopper {
    /// Register a stopper with an identifier used in failure logs.
    pub fn add(&mut self, id: impl Into<String>, stopper: Arc<dyn Stopper>) {
        self.nodes.push((id.into(), stopper));
    }
}

#[async_trait]
impl Stopper for FanoutStopper {
    async fn stop(&self) -> Result<()> {
        for (id, stopper) in self.nodes.iter().rev() {
            if let Err(err) = stopper.stop().await {
                error!(id, %err, "failed to stop");
            }
        }

        Ok(())
    }
}

/// Stopper built from a closure, for one-off teardown actions.
pub struct FuncStopper {
    func: Box<dyn Fn() -> Result<()> + Send + Sync>,
}

impl FuncStopper {
    pub fn new(func: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Stopper for FuncStopper {
    async fn stop(&self) -> Result<()> {
        (self.func)()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use sensorhub_types::Error;

    use super::*;

    struct RecordingStopper {
        id: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Stopper for RecordingStopper {
        async fn stop(&self) -> Result<()> {
            self.order.lock().unwrap().push(self.id);
            if self.fail {
                return Err(Error::Failed);
            }

            Ok(())
        }
    }

    struct FailingStarter;

    #[async_trait]
    impl Starter for FailingStarter {
        async fn start(&self) -> Result<()> {
            Err(Error::Failed)
        }
    }

    struct FlagStarter(Arc<AtomicBool>);

    #[async_trait]
    impl Starter for FlagStarter {
        async fn start(&self) -> Result<()> {
            self.0.store(true, Ordering::SeqCst);

            Ok(())
        }
    }

    #[tokio::test]
    async fn stopper_walks_in_reverse_and_survives_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut fanout = FanoutStopper::default();
        fanout.add(
            "first",
            Arc::new(RecordingStopper {
                id: "first",
                order: order.clone(),
                fail: false,
            }),
        );
        fanout.add(
            "second",
            Arc::new(RecordingStopper {
                id: "second",
                order: order.clone(),
                fail: true,
            }),
        );
        fanout.add(
            "third",
            Arc::new(RecordingStopper {
                id: "third",
                order: order.clone(),
                fail: false,
            }),
        );

        fanout.stop().await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn starter_fails_fast() {
        let started = Arc::new(AtomicBool::new(false));

        let mut fanout = FanoutStarter::default();
        fanout.add(Arc::new(FailingStarter));
        fanout.add(Arc::new(FlagStarter(started.clone())));

        assert_eq!(fanout.start().await, Err(Error::Failed));
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn func_stopper_invokes_closure() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();

        let stopper = FuncStopper::new(move || {
            flag.store(true, Ordering::SeqCst);

            Ok(())
        });

        stopper.stop().await.unwrap();
        assert!(called.load(Ordering::SeqCst));
    }
}
