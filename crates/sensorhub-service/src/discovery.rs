//! Local-network discovery contract and handlers.
//!
//! Everything here is transport-independent: the browse transport feeds
//! [`DiscoveredService`] values through the handler chain, and the chain
//! takes care of hostname resolution and device autodiscovery.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::error;

use sensorhub_core::{ResolveHandler, Task};
use sensorhub_types::{Error, Result};

use crate::store::Store;

/// TXT record key announcing the autodiscovery mode.
const TXT_MODE: &str = "autodiscovery_mode";
/// TXT record key carrying the device URI.
const TXT_URI: &str = "autodiscovery_uri";
/// TXT record key carrying the device type.
const TXT_TYPE: &str = "autodiscovery_type";
/// TXT record key carrying the device description.
const TXT_DESC: &str = "autodiscovery_desc";

/// Service discovered on the local network.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredService {
    /// Service instance name, e.g. `Greenhouse Sensor Firmware`.
    pub instance: String,
    /// Service name, e.g. `_http._tcp`.
    pub name: String,
    /// Machine DNS name, e.g. `greenhouse.local.`.
    pub hostname: String,
    /// Service port.
    pub port: u16,
    /// Raw TXT records, e.g. `api_base_path=/api/`.
    pub txt_records: Vec<String>,
    /// IPv4 addresses announced for the service.
    pub ipv4_addrs: Vec<IpAddr>,
    /// IPv6 addresses announced for the service.
    pub ipv6_addrs: Vec<IpAddr>,
}

/// Handles services discovered on the local network.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Handle one discovered service.
    async fn handle_service(&self, service: &DiscoveredService) -> Result<()>;
}

/// Notifies a collection of handlers about each discovered service.
///
/// Individual handler failures are logged and do not affect the others.
#[derive(Default)]
pub struct FanoutServiceHandler {
    handlers: Mutex<Vec<Arc<dyn ServiceHandler>>>,
}

impl FanoutServiceHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for discovered services.
    pub fn add(&self, handler: Arc<dyn ServiceHandler>) {
        self.handlers.lock().expect("handler lock").push(handler);
    }
}

#[async_trait]
impl ServiceHandler for FanoutServiceHandler {
    async fn handle_service(&self, service: &DiscoveredService) -> Result<()> {
        let handlers = self.handlers.lock().expect("handler lock").clone();

        for handler in handlers {
            if let Err(err) = handler.handle_service(service).await {
                error!(%err, hostname = %service.hostname, "failed to handle discovered service");
            }
        }

        Ok(())
    }
}

/// Feeds discovered addresses into a resolve handler.
pub struct ResolveServiceHandler {
    handler: Arc<dyn ResolveHandler>,
}

impl ResolveServiceHandler {
    pub fn new(handler: Arc<dyn ResolveHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl ServiceHandler for ResolveServiceHandler {
    async fn handle_service(&self, service: &DiscoveredService) -> Result<()> {
        let addrs = if service.ipv4_addrs.is_empty() {
            &service.ipv6_addrs
        } else {
            &service.ipv4_addrs
        };

        // A service announcing several addresses is ambiguous; skip it.
        if addrs.len() != 1 {
            return Err(Error::NotSupported);
        }

        self.handler
            .handle_resolve(service.hostname.trim_end_matches('.'), addrs[0]);

        Ok(())
    }
}

/// Registers devices announcing themselves for autodiscovery.
///
/// A device opts in with TXT records: `autodiscovery_mode=1` plus the
/// `autodiscovery_uri`/`autodiscovery_type`/`autodiscovery_desc` triple.
/// Already registered devices are tolerated, so periodic browse rounds
/// stay quiet.
pub struct AutodiscoveryHandler {
    store: Arc<dyn Store>,
}

impl AutodiscoveryHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ServiceHandler for AutodiscoveryHandler {
    async fn handle_service(&self, service: &DiscoveredService) -> Result<()> {
        if ignore_service(service) {
            return Ok(());
        }

        let records = parse_txt_records(&service.txt_records)?;

        let Some(mode) = records.get(TXT_MODE) else {
            return Ok(());
        };
        let mode = parse_autodiscovery_mode(mode)?;

        let (Some(uri), Some(desc), Some(kind)) = (
            records.get(TXT_URI),
            records.get(TXT_DESC),
            records.get(TXT_TYPE),
        ) else {
            return Ok(());
        };

        match mode {
            AutodiscoveryMode::Add => match self.store.add(uri, kind, desc).await {
                Ok(()) | Err(Error::Exists) => Ok(()),
                Err(err) => Err(err),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AutodiscoveryMode {
    Add,
}

fn ignore_service(service: &DiscoveredService) -> bool {
    !service
        .txt_records
        .iter()
        .any(|record| record.contains(TXT_MODE))
}

fn parse_txt_records(records: &[String]) -> Result<HashMap<String, String>> {
    let mut parsed = HashMap::new();

    for record in records {
        if !record.contains('=') {
            continue;
        }

        let tokens: Vec<&str> = record.split('=').collect();
        if tokens.len() != 2 {
            return Err(Error::InvalidArg);
        }

        let (key, value) = (tokens[0], tokens[1]);
        if key.is_empty() || value.is_empty() {
            return Err(Error::InvalidArg);
        }

        parsed.insert(key.to_string(), value.to_string());
    }

    Ok(parsed)
}

fn parse_autodiscovery_mode(raw: &str) -> Result<AutodiscoveryMode> {
    let mode: i64 = raw.parse().map_err(|err| {
        error!(%err, mode = raw, "failed to parse autodiscovery mode");

        Error::InvalidArg
    })?;

    match mode {
        1 => Ok(AutodiscoveryMode::Add),
        _ => Err(Error::InvalidArg),
    }
}

/// Asynchronously browses the local network for services.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Run one browse round and return the services seen.
    async fn browse(&self) -> Result<Vec<DiscoveredService>>;
}

/// Periodic task driving a browser and dispatching its findings.
pub struct BrowseTask {
    browser: Arc<dyn Browser>,
    handler: Arc<dyn ServiceHandler>,
}

impl BrowseTask {
    pub fn new(browser: Arc<dyn Browser>, handler: Arc<dyn ServiceHandler>) -> Self {
        Self { browser, handler }
    }
}

#[async_trait]
impl Task for BrowseTask {
    async fn run(&self) -> Result<()> {
        for service in self.browser.browse().await? {
            self.handler.handle_service(&service).await?;
        }

        Ok(())
    }
}
