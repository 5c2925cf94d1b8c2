//! Abstract real-time document store the cache subscribes against.
//!
//! A backend turns a query or document reference into a live stream of
//! snapshots, delivered through a [`SnapshotSink`], and hands back a
//! [`CancelHandle`] that ends the stream. It also owns key derivation, so
//! the cache never needs to look inside a backend's query representation.

pub mod memory;

use crate::error::BackendError;
use crate::query::{DocumentRef, Query};
use crate::types::{CacheKey, Fields, Record};
use std::fmt;

pub use memory::{DeliveryMode, MemoryBackend};

/// One document inside a query snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotDocument {
    pub id: String,
    pub fields: Fields,
}

impl SnapshotDocument {
    pub fn into_record(self) -> Record {
        Record::new(self.id, self.fields)
    }
}

/// Ordered result set of a collection query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuerySnapshot {
    pub documents: Vec<SnapshotDocument>,
}

/// State of a single document. `fields` is `None` when it does not exist.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    pub id: String,
    pub fields: Option<Fields>,
}

impl DocumentSnapshot {
    pub fn exists(&self) -> bool {
        self.fields.is_some()
    }

    pub fn into_record(self) -> Option<Record> {
        let id = self.id;
        self.fields.map(|fields| Record::new(id, fields))
    }
}

/// Receiving end of a backend subscription.
pub struct SnapshotSink<S> {
    on_next: Box<dyn Fn(S) + Send + Sync>,
    on_error: Box<dyn Fn(BackendError) + Send + Sync>,
}

impl<S> SnapshotSink<S> {
    pub fn new(
        on_next: impl Fn(S) + Send + Sync + 'static,
        on_error: impl Fn(BackendError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_next: Box::new(on_next),
            on_error: Box::new(on_error),
        }
    }

    pub fn next(&self, snapshot: S) {
        (self.on_next)(snapshot)
    }

    pub fn error(&self, error: BackendError) {
        (self.on_error)(error)
    }
}

impl<S> fmt::Debug for SnapshotSink<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SnapshotSink")
    }
}

/// Ends a backend subscription when cancelled. Dropping it without calling
/// [`CancelHandle::cancel`] leaves the subscription running.
pub struct CancelHandle(Option<Box<dyn FnOnce() + Send>>);

impl CancelHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        CancelHandle(Some(Box::new(cancel)))
    }

    pub fn noop() -> Self {
        CancelHandle(None)
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelHandle").field(&self.0.is_some()).finish()
    }
}

/// A real-time document store.
pub trait Backend: Send + Sync + 'static {
    /// Key for a collection query. Semantically identical queries must
    /// produce the same key.
    fn collection_key(&self, query: &Query) -> CacheKey {
        query.cache_key()
    }

    /// Key for a single document.
    fn document_key(&self, doc: &DocumentRef) -> CacheKey {
        doc.cache_key()
    }

    /// Start a live subscription to a collection query.
    fn subscribe_collection(&self, query: &Query, sink: SnapshotSink<QuerySnapshot>) -> CancelHandle;

    /// Start a live subscription to a single document.
    fn subscribe_document(&self, doc: &DocumentRef, sink: SnapshotSink<DocumentSnapshot>)
        -> CancelHandle;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_cancel_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = CancelHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_document_has_no_record() {
        let snap = DocumentSnapshot {
            id: "9".into(),
            fields: None,
        };
        assert!(!snap.exists());
        assert!(snap.into_record().is_none());
    }
}
