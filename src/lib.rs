//! # Docket Cache
//!
//! The live-data layer of a case-management application: client intake,
//! processes, hearings, financial titles and staff all come from a hosted
//! document store, and many screens watch the same queries at once.
//!
//! ## Core Concepts
//!
//! - **Backend**: the real-time store, reached through the [`Backend`] trait
//! - **Cache key**: canonical identity of a query or document path
//! - **Entry**: per-key state shared by every observer of that key
//! - **Observation**: one consumer's handle; dropping it detaches
//!
//! ## Example
//!
//! ```ignore
//! use docket_cache::{MemoryBackend, Query, SubscriptionCache};
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let cache = SubscriptionCache::new(backend.clone());
//!
//! let open = Query::collection("processes")?
//!     .where_field("status", FilterOp::Eq, "open");
//! let a = cache.observe_collection(Some(&open));
//! let b = cache.observe_collection(Some(&open)); // shares a's subscription
//!
//! backend.set("processes/p1", json!({"status": "open"}))?;
//! assert_eq!(a.data().unwrap().len(), 1);
//! ```

pub mod backend;
pub mod cache;
pub mod error;
pub mod query;
pub mod scheduler;
pub mod types;

// Re-exports
pub use backend::{
    Backend, CancelHandle, DeliveryMode, DocumentSnapshot, MemoryBackend, QuerySnapshot,
    SnapshotDocument, SnapshotSink,
};
pub use cache::{CacheConfig, CacheStats, Observation, ObserverId, SubscriptionCache};
pub use error::{BackendError, CacheError, ErrorCode, PermissionError, Result};
pub use query::{Direction, DocumentRef, Filter, FilterOp, OrderBy, Query};
pub use scheduler::{ManualScheduler, Scheduler, Task, TimerThread};
pub use types::*;
