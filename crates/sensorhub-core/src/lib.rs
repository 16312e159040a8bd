//! Per-device lifecycle engine for the sensorhub device hub.
//!
//! This crate holds the building blocks the registry composes for every
//! registered device:
//!
//! - [`TaskRunner`] — supervised periodic execution with a coalesced awake
//!   signal, panic capture, and a blocking stop.
//! - [`PollDevice`] — the fetch/validate/handle state machine for a single
//!   device poll iteration.
//! - [`ClockSynchronizer`] and the time verifiers — upward-only device
//!   clock synchronization.
//! - [`ResolveStore`] — a hostname cache for `.local` devices with a
//!   wait-for-resolution lookup.
//! - HTTP fetchers and the remote clock endpoint built on `reqwest`.
//!
//! Everything here is transport-agnostic at the seams: tasks, fetchers,
//! handlers, clocks, and resolvers are traits so tests can substitute
//! mocks without touching the network.

mod clock;
mod fetch;
mod handler;
mod http;
mod identity;
mod lifecycle;
mod poll;
mod resolve;
mod runner;
mod sync;
mod task;
mod verify;

pub use clock::{LocalMonotonicClock, LocalSystemClock, MonotonicClock, SystemClock};
pub use fetch::Fetcher;
pub use handler::DataHandler;
pub use http::{HttpClient, RemoteSystemClock, UrlFetcher};
pub use identity::IdHolder;
pub use lifecycle::{FanoutStarter, FanoutStopper, FuncStopper};
pub use poll::PollDevice;
pub use resolve::{ResolveHandler, ResolveStore, Resolver};
pub use runner::{TaskRunner, TaskRunnerParams};
pub use sync::{ClockSynchronizer, TimeSynchronizer, UnsupportedSynchronizer};
pub use task::{AliveNotifier, AliveTask, Awakener, ErrorHandler, Starter, Stopper, Task};
pub use verify::{BasicTimeVerifier, DriftTimeVerifier, TimeVerifier};
