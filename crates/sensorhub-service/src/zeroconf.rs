//! mDNS transport adapters.
//!
//! Thin shells around `mdns-sd`: the browser runs one bounded browse
//! round per call and the announcer registers the hub's own HTTP service.
//! All discovery logic lives behind [`Browser`] and the service handler
//! chain in [`crate::discovery`].

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{error, warn};

use sensorhub_core::{Starter, Stopper};
use sensorhub_types::{Error, Result};

use crate::discovery::{Browser, DiscoveredService};

/// mDNS service name browsed and announced by the hub.
pub const SERVICE_NAME: &str = "_http._tcp.local.";

/// Browses the local network for HTTP services.
pub struct ZeroconfBrowser {
    daemon: ServiceDaemon,
    timeout: Duration,
}

impl ZeroconfBrowser {
    /// Create the browser.
    ///
    /// * `timeout` - how long a single browse round listens for
    ///   announcements.
    pub fn new(timeout: Duration) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|err| {
            error!(%err, "failed to create mDNS daemon");

            Error::Failed
        })?;

        Ok(Self { daemon, timeout })
    }
}

#[async_trait]
impl Browser for ZeroconfBrowser {
    async fn browse(&self) -> Result<Vec<DiscoveredService>> {
        let receiver = self.daemon.browse(SERVICE_NAME).map_err(|err| {
            error!(%err, "failed to start mDNS browse");

            Error::Failed
        })?;

        let mut services = Vec::new();

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = receiver.recv_async() => match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        services.push(convert(&info));
                    }
                    Ok(_) => {}
                    Err(_) => break,
                },
            }
        }

        if let Err(err) = self.daemon.stop_browse(SERVICE_NAME) {
            warn!(%err, "failed to stop mDNS browse");
        }

        Ok(services)
    }
}

#[async_trait]
impl Stopper for ZeroconfBrowser {
    async fn stop(&self) -> Result<()> {
        let _ = self.daemon.shutdown();

        Ok(())
    }
}

fn convert(info: &ServiceInfo) -> DiscoveredService {
    let (ipv4_addrs, ipv6_addrs): (Vec<IpAddr>, Vec<IpAddr>) = info
        .get_addresses()
        .iter()
        .copied()
        .partition(|addr| addr.is_ipv4());

    DiscoveredService {
        instance: info.get_fullname().to_string(),
        name: SERVICE_NAME.trim_end_matches(".local.").to_string(),
        hostname: info.get_hostname().to_string(),
        port: info.get_port(),
        txt_records: info
            .get_properties()
            .iter()
            .map(|property| format!("{}={}", property.key(), property.val_str()))
            .collect(),
        ipv4_addrs,
        ipv6_addrs,
    }
}

/// Announces the hub's own HTTP service on the local network.
pub struct ZeroconfAnnouncer {
    daemon: ServiceDaemon,
    fullname: String,
    info: Mutex<Option<ServiceInfo>>,
}

impl ZeroconfAnnouncer {
    /// Create the announcer for the hub API.
    ///
    /// * `hostname` - machine DNS name to announce, e.g. `sensorhub.local`.
    /// * `port` - admin API port.
    pub fn new(hostname: &str, port: u16) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|err| {
            error!(%err, "failed to create mDNS daemon");

            Error::Failed
        })?;

        let host = if hostname.ends_with('.') {
            hostname.to_string()
        } else {
            format!("{hostname}.")
        };

        let info = ServiceInfo::new(
            SERVICE_NAME,
            "Sensorhub HTTP Service",
            &host,
            "",
            port,
            &[("api", "/api/v1")][..],
        )
        .map_err(|err| {
            error!(%err, hostname, "failed to describe mDNS service");

            Error::InvalidArg
        })?
        .enable_addr_auto();

        Ok(Self {
            daemon,
            fullname: info.get_fullname().to_string(),
            info: Mutex::new(Some(info)),
        })
    }
}

#[async_trait]
impl Starter for ZeroconfAnnouncer {
    async fn start(&self) -> Result<()> {
        let info = self
            .info
            .lock()
            .expect("announcer info lock")
            .take()
            .ok_or(Error::InvalidState)?;

        self.daemon.register(info).map_err(|err| {
            error!(%err, "failed to register mDNS service");

            Error::Failed
        })
    }
}

#[async_trait]
impl Stopper for ZeroconfAnnouncer {
    async fn stop(&self) -> Result<()> {
        if let Err(err) = self.daemon.unregister(&self.fullname) {
            warn!(%err, "failed to unregister mDNS service");
        }

        let _ = self.daemon.shutdown();

        Ok(())
    }
}
