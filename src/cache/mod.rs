//! Shared real-time subscription cache.
//!
//! Observers ask for a collection query or a document and get back an
//! [`Observation`]. Behind it, the cache keeps one entry per key:
//! - one backend subscription per key, however many observers share it
//! - cached data replayed to late joiners, flagged stale until the next emission
//! - errors kept alongside the last good data
//! - teardown deferred by a grace period after the last observer leaves
//!
//! # Example
//!
//! ```ignore
//! let backend = Arc::new(MemoryBackend::new());
//! let cache = SubscriptionCache::new(backend);
//!
//! let clients = Query::collection("clients")?;
//! let observation = cache.observe_collection_with(Some(&clients), |state| {
//!     if let Some(records) = &state.data {
//!         println!("{} clients (stale: {})", records.len(), state.is_stale);
//!     }
//! });
//! ```

mod entry;
mod manager;
mod observation;
mod types;

pub use manager::SubscriptionCache;
pub use observation::Observation;
pub use types::{CacheConfig, CacheStats, ObserverId, DEFAULT_TEARDOWN_GRACE};
