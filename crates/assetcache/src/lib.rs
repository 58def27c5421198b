//! Asynchronous memoization primitives and a two-tier asset cache.
//!
//! The building blocks are layered on top of each other:
//!
//! - [`flight::SingleFlightValue`] runs one computation at most once and hands the outcome to
//!   every waiter.
//! - [`flight::KeyedSingleFlightCache`] maps keys to such values, so that concurrent requests
//!   for the same key share one computation.
//! - [`broadcast::BroadcastChannel`] pushes the latest value to any number of consumers.
//! - [`task::LifecycleTask`] ties background work to the lifetime of its handle.
//! - [`debounce::Debouncer`] coalesces bursts of triggers into one delayed execution.
//! - [`caching::AssetCache`] combines the above into a memory + disk cache for remote assets.

#[macro_use]
pub mod metrics;

pub mod broadcast;
pub mod caching;
pub mod config;
pub mod debounce;
pub mod fetch;
pub mod flight;
pub mod logging;
pub mod task;
pub mod utils;

#[cfg(any(feature = "test", test))]
#[allow(unused)]
pub mod test;
