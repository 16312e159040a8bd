//! HTTP access to device endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use sensorhub_types::{Error, Result};

use crate::clock::SystemClock;
use crate::fetch::Fetcher;
use crate::resolve::Resolver;

/// HTTP client wrapper that fully reads response bodies.
///
/// With a resolver attached, the request host is resolved through the
/// hub's own cache before the request is sent; this is how `.local`
/// hostnames reach devices without touching system DNS.
pub struct HttpClient {
    client: reqwest::Client,
    resolver: Option<Arc<dyn Resolver>>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// General purpose client using system name resolution.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            resolver: None,
        }
    }

    /// Client that resolves request hosts through the provided resolver.
    pub fn with_resolver(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            client: reqwest::Client::new(),
            resolver: Some(resolver),
        }
    }

    /// Send a GET request and read the whole response body.
    ///
    /// The request is bounded by `timeout` (which also covers the
    /// resolver wait) and aborts promptly when `cancel` fires.
    pub async fn get(
        &self,
        url: &Url,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let request = async {
            let mut url = url.clone();

            if let Some(resolver) = &self.resolver {
                let host = url
                    .host_str()
                    .ok_or_else(|| {
                        error!(%url, "request URL has no host");

                        Error::Failed
                    })?
                    .to_string();

                let addr = resolver.resolve(&host).await?;
                url.set_ip_host(addr).map_err(|_| {
                    error!(%url, %addr, "failed to rewrite request host");

                    Error::Failed
                })?;
            }

            let response = self.client.get(url.clone()).send().await.map_err(|err| {
                error!(%err, %url, "HTTP request failed");

                Error::Failed
            })?;

            let status = response.status();
            let body = response
                .bytes()
                .await
                .map_err(|err| {
                    error!(%err, %url, "failed to read HTTP response body");

                    Error::Failed
                })?
                .to_vec();

            Ok((status, body))
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, request) => {
                result.map_err(|_| Error::Timeout)?
            }
            _ = cancel.cancelled() => {
                debug!(%url, "HTTP request aborted by cancellation");

                Err(Error::Failed)
            }
        }
    }
}

/// Fetches device data from a fixed HTTP endpoint.
pub struct UrlFetcher {
    cancel: CancellationToken,
    client: Arc<HttpClient>,
    url: Url,
    timeout: Duration,
}

impl UrlFetcher {
    /// Create a fetcher for the URL.
    ///
    /// * `cancel` - node scope; aborts in-flight requests on teardown.
    /// * `client` - client to perform the actual HTTP requests.
    /// * `url` - endpoint to fetch.
    /// * `timeout` - per-request deadline.
    pub fn new(
        cancel: CancellationToken,
        client: Arc<HttpClient>,
        url: Url,
        timeout: Duration,
    ) -> Self {
        Self {
            cancel,
            client,
            url,
            timeout,
        }
    }
}

#[async_trait]
impl Fetcher for UrlFetcher {
    async fn fetch(&self) -> Result<Vec<u8>> {
        let (status, body) = self
            .client
            .get(&self.url, self.timeout, &self.cancel)
            .await?;

        if status != StatusCode::OK {
            error!(%status, url = %self.url, "unexpected fetch status");

            return Err(Error::Failed);
        }

        Ok(body)
    }
}

/// UNIX time of an HTTP resource.
///
/// Reads `GET <url>` expecting a decimal-seconds body and writes
/// `GET <url>?timestamp=<n>`.
pub struct RemoteSystemClock {
    cancel: CancellationToken,
    client: Arc<HttpClient>,
    url: Url,
    timeout: Duration,
}

impl RemoteSystemClock {
    pub fn new(
        cancel: CancellationToken,
        client: Arc<HttpClient>,
        url: Url,
        timeout: Duration,
    ) -> Self {
        Self {
            cancel,
            client,
            url,
            timeout,
        }
    }
}

#[async_trait]
impl SystemClock for RemoteSystemClock {
    async fn get_timestamp(&self) -> Result<i64> {
        let (status, body) = self
            .client
            .get(&self.url, self.timeout, &self.cancel)
            .await?;

        if status != StatusCode::OK {
            error!(%status, url = %self.url, "failed to receive remote time");

            return Err(Error::Failed);
        }

        let text = std::str::from_utf8(&body).map_err(|err| {
            error!(%err, url = %self.url, "remote time body isn't UTF-8");

            Error::Failed
        })?;

        text.trim().parse::<i64>().map_err(|err| {
            error!(%err, body = text, url = %self.url, "remote time body isn't a timestamp");

            Error::Failed
        })
    }

    async fn set_timestamp(&self, timestamp: i64) -> Result<()> {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("timestamp", &timestamp.to_string());

        let (status, _body) = self.client.get(&url, self.timeout, &self.cancel).await?;

        if status != StatusCode::OK {
            error!(%status, url = %self.url, "failed to send remote time");

            return Err(Error::Failed);
        }

        Ok(())
    }
}
