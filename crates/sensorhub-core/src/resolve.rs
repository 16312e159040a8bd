//! Hostname resolution cache with wait-for-resolution lookups.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::info;

use sensorhub_types::Result;

/// Resolves a resource hostname to a network address.
///
/// Examples: `greenhouse.local` -> `192.168.1.4`.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve the hostname, waiting until an address is known.
    ///
    /// Callers bound the wait with a timeout derived from their request
    /// deadline; the resolver itself never gives up.
    async fn resolve(&self, hostname: &str) -> Result<IpAddr>;
}

/// Receives the result of a network address resolution.
pub trait ResolveHandler: Send + Sync {
    /// Handle the resolution of `hostname` to `addr`.
    fn handle_resolve(&self, hostname: &str, addr: IpAddr);
}

#[derive(Default)]
struct ResolveState {
    known_hosts: HashSet<String>,
    resolved: HashMap<String, IpAddr>,
}

/// Caches the results of hostname resolution.
///
/// Hosts are registered by the device nodes that need them; resolution
/// results arrive from the discovery service handler. Lookups for a host
/// without a cached address suspend on the update signal and re-read after
/// every wake. This is the only component that intentionally suspends a
/// caller.
#[derive(Default)]
pub struct ResolveStore {
    update: Notify,
    state: Mutex<ResolveState>,
}

impl ResolveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the hostname as known.
    pub fn add(&self, hostname: &str) {
        let mut state = self.state.lock().expect("resolve state lock");
        state.known_hosts.insert(hostname.to_string());
    }

    /// Forget the hostname and any cached address for it.
    pub fn remove(&self, hostname: &str) {
        let mut state = self.state.lock().expect("resolve state lock");
        state.known_hosts.remove(hostname);
        state.resolved.remove(hostname);
    }

    fn cached(&self, hostname: &str) -> Option<IpAddr> {
        let state = self.state.lock().expect("resolve state lock");

        // An address is only ever reported for hosts still in the known
        // set; remove drops both together.
        state.resolved.get(hostname).copied()
    }
}

impl ResolveHandler for ResolveStore {
    fn handle_resolve(&self, hostname: &str, addr: IpAddr) {
        {
            let mut state = self.state.lock().expect("resolve state lock");

            if !state.known_hosts.contains(hostname) {
                return;
            }

            match state.resolved.get(hostname) {
                None => {
                    info!(hostname, %addr, "addr resolved");
                    state.resolved.insert(hostname.to_string(), addr);
                }
                Some(current) if *current != addr => {
                    info!(hostname, cur = %current, new = %addr, "addr changed");
                    state.resolved.insert(hostname.to_string(), addr);
                }
                Some(_) => {}
            }
        }

        self.update.notify_waiters();
    }
}

#[async_trait]
impl Resolver for ResolveStore {
    async fn resolve(&self, hostname: &str) -> Result<IpAddr> {
        loop {
            // Register for the update signal before the cache check so a
            // concurrent handle_resolve can't slip between them unseen.
            let update = self.update.notified();

            if let Some(addr) = self.cached(hostname) {
                return Ok(addr);
            }

            update.await;
        }
    }
}
