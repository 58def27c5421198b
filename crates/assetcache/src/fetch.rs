//! Sources of asset bytes.
//!
//! The cache does not mandate a transport: anything implementing [`Fetcher`] can provide the
//! bytes for a locator, including plain async closures. [`HttpFetcher`] is a ready-made
//! implementation on top of `reqwest`.

use std::fmt;
use std::future::Future;
use std::io;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use url::Url;

use crate::config::FetchConfig;

/// An error returned by a [`Fetcher`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Provides the raw bytes behind a locator.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, locator: &'a Url) -> BoxFuture<'a, Result<Bytes, BoxError>>;
}

impl<F, Fut, E> Fetcher for F
where
    F: Fn(Url) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError>,
{
    fn fetch<'a>(&'a self, locator: &'a Url) -> BoxFuture<'a, Result<Bytes, BoxError>> {
        (self)(locator.clone()).map(|r| r.map_err(Into::into)).boxed()
    }
}

/// The server answered with a non-success status.
#[derive(Debug, Error)]
#[error("{url}: unexpected status {status}")]
pub struct HttpStatusError {
    pub status: StatusCode,
    pub url: Url,
}

/// Downloads assets over HTTP(S).
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher").finish_non_exhaustive()
    }
}

impl HttpFetcher {
    /// Creates a fetcher with the configured timeouts and user agent.
    pub fn new(config: &FetchConfig) -> reqwest::Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .gzip(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn download(&self, locator: &Url) -> Result<Bytes, BoxError> {
        tracing::debug!("Fetching asset from `{}`", locator);

        let response = self
            .client
            .get(locator.clone())
            .header(header::ACCEPT, "*/*")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%status, "Unexpected status fetching `{}`", locator);
            return Err(HttpStatusError {
                status,
                url: locator.clone(),
            }
            .into());
        }

        Ok(response.bytes().await?)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, locator: &'a Url) -> BoxFuture<'a, Result<Bytes, BoxError>> {
        if locator.scheme() == "file" {
            return read_local(locator).map(|r| r.map_err(Into::into)).boxed();
        }
        self.download(locator).boxed()
    }
}

/// Reads the file behind a `file://` locator.
pub async fn read_local(locator: &Url) -> io::Result<Bytes> {
    let path = locator.to_file_path().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a local file: {locator}"),
        )
    })?;
    let contents = tokio::fs::read(&path).await?;
    Ok(contents.into())
}
