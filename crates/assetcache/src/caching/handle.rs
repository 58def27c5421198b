use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::broadcast::BroadcastChannel;
use crate::fetch::Fetcher;

use super::{Asset, AssetCache, AssetError, AssetKey};

/// Advisory progress of a [`resolve_with_progress`](AssetHandle::resolve_with_progress) call.
#[derive(Debug, Clone)]
pub enum FetchProgress {
    Started,
    Finished,
    Failed(AssetError),
}

/// A handle to an asset, as returned by the `fetch_*_asset` methods of [`AssetCache`].
///
/// Creating a handle is cheap and does not fetch anything. If the asset was found in the memory
/// or disk tier at creation time, it is available right away through
/// [`cached_value`](Self::cached_value). Otherwise [`resolve`](Self::resolve) fetches it, sharing
/// the fetch with every other handle of the same asset.
///
/// Two handles are equal if they refer to the same source locator.
pub struct AssetHandle<T> {
    pub(super) key: AssetKey,
    pub(super) cached: Option<T>,
    pub(super) cache: AssetCache,
    pub(super) fetcher: Arc<dyn Fetcher>,
}

impl<T: Asset> AssetHandle<T> {
    pub fn source_locator(&self) -> &Url {
        self.key.locator()
    }

    pub fn key(&self) -> &AssetKey {
        &self.key
    }

    /// The value found in the memory or disk tier when this handle was created.
    pub fn cached_value(&self) -> Option<&T> {
        self.cached.as_ref()
    }

    /// Returns the asset, fetching it if it is not cached.
    pub async fn resolve(&self) -> Result<T, AssetError> {
        if let Some(value) = &self.cached {
            return Ok(value.clone());
        }
        self.cache.resolve(&self.key, &self.fetcher, None).await
    }

    /// Like [`resolve`](Self::resolve), but stops waiting once `token` is cancelled.
    ///
    /// Other handles waiting for the same asset are not affected.
    pub async fn resolve_or_cancel(&self, token: &CancellationToken) -> Result<T, AssetError> {
        if let Some(value) = &self.cached {
            return Ok(value.clone());
        }
        self.cache.resolve(&self.key, &self.fetcher, Some(token)).await
    }

    /// Like [`resolve`](Self::resolve), while reporting progress to `progress`.
    ///
    /// The channel is finished once the asset is resolved. The returned result is authoritative,
    /// the progress states are informational only.
    pub async fn resolve_with_progress(
        &self,
        progress: &BroadcastChannel<FetchProgress>,
    ) -> Result<T, AssetError> {
        progress.send(FetchProgress::Started);
        let result = self.resolve().await;
        progress.send(match &result {
            Ok(_) => FetchProgress::Finished,
            Err(err) => FetchProgress::Failed(err.clone()),
        });
        progress.finish();
        result
    }
}

impl<T: Clone> Clone for AssetHandle<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            cached: self.cached.clone(),
            cache: self.cache.clone(),
            fetcher: Arc::clone(&self.fetcher),
        }
    }
}

impl<T> fmt::Debug for AssetHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetHandle")
            .field("key", &self.key)
            .field("cached", &self.cached.is_some())
            .finish_non_exhaustive()
    }
}

impl<T> PartialEq for AssetHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key.locator() == other.key.locator()
    }
}

impl<T> Eq for AssetHandle<T> {}

impl<T> Hash for AssetHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.locator().hash(state);
    }
}
