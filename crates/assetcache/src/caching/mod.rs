//! # Asset caching
//!
//! The [`AssetCache`] resolves remote (or local) assets to values of a requested shape, like an
//! image, a blob of bytes, or a path to a media file on disk.
//!
//! ## Cache Layers
//!
//! - An in-memory layer holding decoded values, bounded by weight and evicting the least
//!   recently used entries.
//! - A file-system layer that persists the fetched bytes under
//!   `<root>/Assets/<scope>/<file name>`, where the root is the temporary or durable directory
//!   from the [`Config`] and the file name is derived from the [`AssetKey`].
//! - The [`Fetcher`] of the cache or of the individual request, which provides fresh bytes.
//!
//! A request goes through the following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, concurrent requests for the same key are coalesced into one fetch.
//! - The fetch tries to load the file from the file-system.
//! - On miss, it invokes the fetcher and writes the bytes to the file-system, by writing to a
//!   temporary file and renaming it into place.
//! - The bytes are decoded into the requested shape and stored in the in-memory layer.
//!
//! Files behind `file://` locators are read in place and never copied into the file-system layer.
//!
//! ## Failures
//!
//! A failed fetch is reported to every request that was waiting for it. It is not remembered
//! though: the next request for the same asset tries again. Failing to write a fetched asset to
//! disk is logged and reported, but does not fail the request.
//!
//! ### Metrics
//!
//! - `assets.access`: All handles created.
//! - `assets.memory.hit`: Accesses served by the in-memory layer.
//! - `assets.file.hit` / `assets.file.miss`: Lookups in the file-system layer.
//! - `assets.fetch`: Invocations of the fetcher, `assets.fetch.failure` for the failed ones.
//! - `assets.file.write` and `assets.file.size`: Files written to disk, and their sizes.
//! - `assets.memory.evicted`: Entries evicted from the in-memory layer because of its capacity.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::flight::{FlightError, FlightState, KeyedSingleFlightCache, SingleFlightValue};
use crate::utils::futures::{m, measure};

mod asset;
mod error;
mod fs;
mod handle;
mod key;
mod memory;


pub use asset::*;
pub use error::AssetError;
pub use fs::{CleanupStats, Storage};
pub use handle::{AssetHandle, FetchProgress};
pub use key::AssetKey;

use error::FetchFailure;
use fs::DiskTier;
use memory::MemoryTier;

/// The outcome of a fetch, before it is decoded into a particular shape.
#[derive(Debug, Clone)]
struct Fetched {
    /// The fetched contents, `None` if they are on disk and were not read yet.
    bytes: Option<Bytes>,
    /// The file holding the bytes, unless writing it failed.
    path: Option<Arc<Path>>,
}

impl Fetched {
    /// Decodes the outcome, reading only as much of the file as `T` needs.
    async fn decode<T: Asset>(&self) -> Result<T, AssetError> {
        let bytes = match (&self.bytes, &self.path) {
            (Some(bytes), _) => bytes.clone(),
            (None, Some(path)) => {
                let path = Arc::clone(path);
                let contents = T::CONTENTS;
                tokio::task::spawn_blocking(move || fs::read_contents(&path, contents))
                    .await
                    .map_err(AssetError::fetch)??
            }
            (None, None) => return Err(AssetError::NotPersisted),
        };

        T::decode(AssetSource {
            bytes: &bytes,
            path: self.path.as_deref(),
        })
    }
}

struct Inner {
    scope: String,
    disk: DiskTier,
    memory: MemoryTier,
    flights: KeyedSingleFlightCache<AssetKey, Fetched>,
    fetcher: Arc<dyn Fetcher>,
}

/// A two-tier cache for assets, scoped to one directory.
///
/// Cloning the cache is cheap, clones share all state.
#[derive(Clone)]
pub struct AssetCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("scope", &self.inner.scope)
            .field("disk", &self.inner.disk)
            .field("memory", &self.inner.memory)
            .field("flights", &self.inner.flights)
            .finish_non_exhaustive()
    }
}

impl AssetCache {
    /// Creates a cache for `scope` that fetches missing assets with `fetcher`.
    pub fn new(
        config: &Config,
        scope: impl Into<String>,
        storage: Storage,
        fetcher: impl Fetcher,
    ) -> Self {
        let scope = scope.into();
        Self {
            inner: Arc::new(Inner {
                disk: DiskTier::new(config, storage, &scope),
                memory: MemoryTier::new(&scope, config.caches.in_memory_capacity),
                flights: KeyedSingleFlightCache::new(),
                fetcher: Arc::new(fetcher),
                scope,
            }),
        }
    }

    /// Creates a cache for `scope` that downloads missing assets over HTTP.
    pub fn from_config(
        config: &Config,
        scope: impl Into<String>,
        storage: Storage,
    ) -> reqwest::Result<Self> {
        let fetcher = HttpFetcher::new(&config.fetch)?;
        Ok(Self::new(config, scope, storage, fetcher))
    }

    pub fn scope(&self) -> &str {
        &self.inner.scope
    }

    /// The directory holding the files of this cache.
    pub fn directory(&self) -> &Path {
        self.inner.disk.dir()
    }

    /// The path at which the asset is, or would be, stored on disk.
    pub fn local_path(&self, key: &AssetKey) -> PathBuf {
        self.inner.disk.path(&key.file_name())
    }

    /// Returns a handle to the asset identified by `key`.
    pub fn fetch_asset<T: Asset>(&self, key: impl Into<AssetKey>) -> AssetHandle<T> {
        self.handle(key.into(), Arc::clone(&self.inner.fetcher))
    }

    /// Returns a handle to the asset identified by `key`, fetching it with `fetcher` on a miss.
    ///
    /// Requests for the same asset share a single fetch, so a concurrent request for the same
    /// key may end up using the fetcher of another request.
    pub fn fetch_asset_with<T: Asset>(
        &self,
        key: impl Into<AssetKey>,
        fetcher: impl Fetcher,
    ) -> AssetHandle<T> {
        self.handle(key.into(), Arc::new(fetcher))
    }

    pub fn fetch_image_asset(&self, key: impl Into<AssetKey>) -> AssetHandle<ImageAsset> {
        self.fetch_asset(key)
    }

    pub fn fetch_data_asset(&self, key: impl Into<AssetKey>) -> AssetHandle<DataAsset> {
        self.fetch_asset(key)
    }

    /// Returns a handle resolving to the asset's path on disk.
    pub fn fetch_url_asset(&self, key: impl Into<AssetKey>) -> AssetHandle<FileAsset> {
        self.fetch_asset(key)
    }

    pub fn fetch_media_asset(&self, key: impl Into<AssetKey>) -> AssetHandle<MediaAsset> {
        self.fetch_asset(key)
    }

    fn handle<T: Asset>(&self, key: AssetKey, fetcher: Arc<dyn Fetcher>) -> AssetHandle<T> {
        metric!(counter("assets.access") += 1, "kind" => T::KIND);
        let cached = self.cached(&key);
        AssetHandle {
            key,
            cached,
            cache: self.clone(),
            fetcher,
        }
    }

    /// Looks the asset up in memory, then on disk, without fetching it.
    pub fn cached<T: Asset>(&self, key: &AssetKey) -> Option<T> {
        if let Some(value) = self.inner.memory.get::<T>(key) {
            metric!(counter("assets.memory.hit") += 1, "kind" => T::KIND);
            return Some(value);
        }
        if key.is_local() {
            return None;
        }

        let path = self.local_path(key);
        let bytes = match self.inner.disk.lookup(&path, T::CONTENTS) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to read cached asset `{}`",
                    path.display()
                );
                return None;
            }
        };
        metric!(counter("assets.file.hit") += 1, "kind" => T::KIND);

        let source = AssetSource {
            bytes: &bytes,
            path: Some(&path),
        };
        match T::decode(source) {
            Ok(value) => {
                self.inner.memory.insert(key, value.clone());
                Some(value)
            }
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "Cached asset `{}` is not a valid {}",
                    key,
                    T::KIND
                );
                None
            }
        }
    }

    pub(super) async fn resolve<T: Asset>(
        &self,
        key: &AssetKey,
        fetcher: &Arc<dyn Fetcher>,
        token: Option<&CancellationToken>,
    ) -> Result<T, AssetError> {
        if let Some(value) = self.inner.memory.get::<T>(key) {
            metric!(counter("assets.memory.hit") += 1, "kind" => T::KIND);
            return Ok(value);
        }

        let flight = self.flight(key, fetcher);
        let outcome = match token {
            Some(token) => flight.get_or_cancel(token).await,
            None => flight.get().await,
        };

        // Successful fetches live on in the memory and disk tiers, failed ones are retried by
        // the next request.
        if !matches!(outcome, Err(FlightError::Cancelled)) {
            self.inner.flights.remove_if_same(key, &flight);
        }

        let fetched = outcome?;
        let value = fetched.decode::<T>().await?;
        self.inner.memory.insert(key, value.clone());
        Ok(value)
    }

    /// Returns the fetch for `key`, starting a new one if there is none or the last one failed.
    fn flight(&self, key: &AssetKey, fetcher: &Arc<dyn Fetcher>) -> SingleFlightValue<Fetched> {
        let producer = || {
            let disk = self.inner.disk.clone();
            let key = key.clone();
            let fetcher = Arc::clone(fetcher);
            move || load_or_fetch(disk, key, fetcher)
        };

        let flight = self.inner.flights.get_or_insert(key.clone(), producer());
        if flight.state() == FlightState::Failed {
            return self
                .inner
                .flights
                .replace_if_same(key.clone(), &flight, producer());
        }
        flight
    }

    /// Seeds both tiers with a value that was produced without fetching.
    pub fn cache_value<T: Asset>(
        &self,
        value: T,
        key: impl Into<AssetKey>,
    ) -> Result<(), AssetError> {
        let key = key.into();
        let value = if key.is_local() {
            value
        } else {
            let path = self.local_path(&key);
            let bytes = value.encode()?;
            self.inner.disk.persist(&path, &bytes)?;
            // file-backed shapes now refer to the cached copy
            T::decode(AssetSource {
                bytes: &bytes,
                path: Some(&path),
            })?
        };
        self.inner.flights.remove(&key);
        self.inner.memory.insert(&key, value);
        Ok(())
    }

    /// Removes the asset from all tiers.
    pub fn remove(&self, key: &AssetKey) -> io::Result<()> {
        self.inner.memory.remove(key);
        self.inner.flights.remove(key);
        if !key.is_local() {
            self.inner.disk.remove(&self.local_path(key))?;
        }
        Ok(())
    }

    /// Drops all values from the in-memory tier.
    pub fn clear_memory(&self) {
        self.inner.memory.clear();
    }

    /// Drops all values from memory, and removes the cache directory.
    pub fn clear(&self) -> io::Result<()> {
        self.inner.memory.clear();
        self.inner.flights.clear();
        self.inner.disk.clear()
    }

    /// Removes files that were not used for longer than the configured retention.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupStats> {
        self.inner.disk.cleanup(dry_run)
    }

    #[cfg(test)]
    fn run_pending_tasks(&self) {
        self.inner.memory.run_pending_tasks();
    }

    #[cfg(test)]
    fn memory_entry_count(&self) -> u64 {
        self.inner.memory.entry_count()
    }
}

/// Locates the asset on disk, or fetches and persists it.
///
/// Files that are already on disk are not read here, [`Fetched::decode`] reads as much of them
/// as the requested shape needs.
async fn load_or_fetch(
    disk: DiskTier,
    key: AssetKey,
    fetcher: Arc<dyn Fetcher>,
) -> Result<Fetched, AssetError> {
    if key.is_local() {
        let path = key.locator().to_file_path().map_err(|_| {
            AssetError::fetch(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a local file: {}", key.locator()),
            ))
        })?;
        tokio::fs::metadata(&path).await?;
        return Ok(Fetched {
            bytes: None,
            path: Some(path.into()),
        });
    }

    let path = disk.path(&key.file_name());
    let lookup = {
        let disk = disk.clone();
        let path = path.clone();
        tokio::task::spawn_blocking(move || disk.lookup(&path, Contents::PathOnly))
    };
    match lookup.await.map_err(AssetError::fetch)? {
        Ok(Some(_)) => {
            metric!(counter("assets.file.hit") += 1);
            return Ok(Fetched {
                bytes: None,
                path: Some(path.into()),
            });
        }
        Ok(None) => metric!(counter("assets.file.miss") += 1),
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "Failed to read cached asset `{}`",
                path.display()
            );
        }
    }

    tracing::debug!("Fetching asset `{}`", key);
    metric!(counter("assets.fetch") += 1);
    let bytes = measure("assets.fetch", m::result, fetcher.fetch(key.locator()))
        .await
        .map_err(|err| {
            metric!(counter("assets.fetch.failure") += 1);
            tracing::debug!(error = &*err as &dyn std::error::Error, "Failed to fetch `{}`", key);
            AssetError::Fetch(Arc::new(FetchFailure(err)))
        })?;

    let persisted = {
        let path = path.clone();
        let bytes = bytes.clone();
        tokio::task::spawn_blocking(move || disk.persist(&path, &bytes))
            .await
            .unwrap_or_else(|err| Err(io::Error::other(err)))
    };
    let path = match persisted {
        Ok(()) => Some(path.into()),
        Err(err) => {
            sentry::with_scope(
                |scope| scope.set_extra("path", path.display().to_string().into()),
                || {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "Failed to persist asset"
                    )
                },
            );
            metric!(counter("assets.file.write_failure") += 1);
            None
        }
    };

    Ok(Fetched {
        bytes: Some(bytes),
        path,
    })
}
