//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the cache silently creates the
//!    directory again lazily after it has been deleted. To avoid this, assign it to a variable
//!    in the test function (e.g. `let cache_dir = test::tempdir()`).

#[cfg(test)]
use std::net::SocketAddr;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
#[cfg(test)]
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
/// Initializes logs: The logger only captures logs from the `assetcache` crate and mutes all
/// other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("assetcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[cfg(test)]
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

#[cfg(test)]
impl Server {
    pub fn with_router(router: axum::Router) -> Self {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
            .parse()
            .unwrap()
    }
}

#[cfg(test)]
impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
