use std::any::Any;
use std::sync::Arc;

use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;

use super::{Asset, AssetKey};

/// Memory entries are keyed by asset and shape, as one asset may be resolved to several shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoryKey {
    key: AssetKey,
    kind: &'static str,
}

/// An item saved in the in-memory moka cache.
#[derive(Clone)]
struct MemoryItem {
    value: Arc<dyn Any + Send + Sync>,
    weight: u32,
}

type InMemoryCache = moka::sync::Cache<MemoryKey, MemoryItem>;

/// The bounded in-memory tier of an [`AssetCache`](super::AssetCache).
///
/// Entries are evicted in least-recently-used order once the total weight exceeds the capacity.
#[derive(Clone)]
pub(super) struct MemoryTier {
    cache: InMemoryCache,
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("entry_count", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

impl MemoryTier {
    pub fn new(scope: &str, capacity: u64) -> Self {
        let cache = InMemoryCache::builder()
            .max_capacity(capacity)
            .name(scope)
            .eviction_policy(EvictionPolicy::lru())
            // NOTE: we count the bookkeeping structures to the weight as well
            .weigher(|_k, v: &MemoryItem| {
                (std::mem::size_of::<(MemoryKey, MemoryItem)>() as u32).saturating_add(v.weight)
            })
            .eviction_listener(|key: Arc<MemoryKey>, _value, cause| {
                if cause == RemovalCause::Size {
                    tracing::trace!("Evicted `{}` ({}) from memory", key.key, key.kind);
                    metric!(counter("assets.memory.evicted") += 1, "kind" => key.kind);
                }
            })
            .build();

        Self { cache }
    }

    pub fn get<T: Asset>(&self, key: &AssetKey) -> Option<T> {
        let memory_key = MemoryKey {
            key: key.clone(),
            kind: T::KIND,
        };
        let item = self.cache.get(&memory_key)?;
        item.value.downcast_ref::<T>().cloned()
    }

    pub fn insert<T: Asset>(&self, key: &AssetKey, value: T) {
        let weight = value.weight();
        let memory_key = MemoryKey {
            key: key.clone(),
            kind: T::KIND,
        };
        self.cache.insert(
            memory_key,
            MemoryItem {
                value: Arc::new(value),
                weight,
            },
        );
    }

    /// Removes every shape of the asset.
    pub fn remove(&self, key: &AssetKey) {
        let stale: Vec<_> = self
            .cache
            .iter()
            .filter(|(memory_key, _)| memory_key.key == *key)
            .map(|(memory_key, _)| memory_key)
            .collect();
        for memory_key in stale {
            self.cache.invalidate(&*memory_key);
        }
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Applies pending evictions, which moka otherwise performs lazily.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }
}
