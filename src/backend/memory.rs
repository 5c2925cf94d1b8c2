//! In-memory backend.
//!
//! Holds documents by path and keeps every live subscription up to date as
//! documents are written. Security rules are modelled as denied path
//! prefixes. In [`DeliveryMode::Manual`] nothing is emitted until
//! [`MemoryBackend::flush`], which lets callers observe the loading and
//! stale states a remote store would expose.
//!
//! Every subscription sees its emissions in write order, including writes
//! made from another thread or from inside a sink.

use super::{
    Backend, CancelHandle, DocumentSnapshot, QuerySnapshot, SnapshotDocument, SnapshotSink,
};
use crate::error::{BackendError, CacheError, ErrorCode, Result};
use crate::query::{DocumentRef, Query};
use crate::types::{CacheKey, Fields};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};

/// When snapshots reach subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Emit synchronously on subscribe and on every write.
    #[default]
    Immediate,
    /// Queue emissions until [`MemoryBackend::flush`].
    Manual,
}

enum Target {
    Collection(Query, Arc<SnapshotSink<QuerySnapshot>>),
    Document(DocumentRef, Arc<SnapshotSink<DocumentSnapshot>>),
}

impl Target {
    fn path(&self) -> &str {
        match self {
            Target::Collection(query, _) => query.path(),
            Target::Document(doc, _) => doc.path(),
        }
    }

    /// Whether a write to `doc_path` can change this target's result.
    fn affected_by(&self, doc_path: &str, parent: &str) -> bool {
        match self {
            Target::Collection(query, _) => query.path() == parent,
            Target::Document(doc, _) => doc.path() == doc_path,
        }
    }
}

struct Watch {
    key: CacheKey,
    target: Target,
}

struct Queued {
    watch: u64,
    error: Option<BackendError>,
}

enum Emission {
    Query(Arc<SnapshotSink<QuerySnapshot>>, QuerySnapshot),
    Document(Arc<SnapshotSink<DocumentSnapshot>>, DocumentSnapshot),
    QueryError(Arc<SnapshotSink<QuerySnapshot>>, BackendError),
    DocumentError(Arc<SnapshotSink<DocumentSnapshot>>, BackendError),
}

/// A ready-to-run emission, built under the lock and sent outside it.
struct Delivery {
    watch: u64,
    emission: Emission,
}

impl Delivery {
    fn send(self) {
        match self.emission {
            Emission::Query(sink, snap) => sink.next(snap),
            Emission::Document(sink, snap) => sink.next(snap),
            Emission::QueryError(sink, err) => sink.error(err),
            Emission::DocumentError(sink, err) => sink.error(err),
        }
    }
}

#[derive(Default)]
struct Inner {
    documents: BTreeMap<String, Fields>,
    watches: HashMap<u64, Watch>,
    denied: Vec<String>,
    queue: Vec<Queued>,
    /// Built emissions waiting to be sent, in the order they were built.
    outbox: VecDeque<Delivery>,
    /// Set while some caller is sending from `outbox`.
    draining: bool,
    next_id: u64,
    subscribe_calls: usize,
    cancel_calls: usize,
}

impl Inner {
    fn is_denied(&self, path: &str) -> bool {
        self.denied.iter().any(|prefix| {
            path == prefix
                || (path.starts_with(prefix.as_str())
                    && path.as_bytes().get(prefix.len()) == Some(&b'/'))
        })
    }

    fn run_query(&self, query: &Query) -> QuerySnapshot {
        let mut matched: Vec<(&str, &Fields)> = self
            .documents
            .iter()
            .filter(|(path, _)| parent_of(path) == query.path())
            .filter(|(_, fields)| query.matches(fields))
            .map(|(path, fields)| (id_of(path), fields))
            .collect();

        matched.sort_by(|a, b| query.compare(*a, *b));
        if let Some(limit) = query.max_results() {
            matched.truncate(limit);
        }

        QuerySnapshot {
            documents: matched
                .into_iter()
                .map(|(id, fields)| SnapshotDocument {
                    id: id.to_string(),
                    fields: fields.clone(),
                })
                .collect(),
        }
    }

    /// Current result (or rule rejection) for a watch.
    fn delivery_for(&self, id: u64, watch: &Watch, error: Option<BackendError>) -> Delivery {
        let error = error.or_else(|| {
            self.is_denied(watch.target.path()).then(|| {
                BackendError::permission_denied(format!(
                    "read of {} rejected by security rules",
                    watch.target.path()
                ))
            })
        });

        let emission = match (&watch.target, error) {
            (Target::Collection(_, sink), Some(err)) => Emission::QueryError(Arc::clone(sink), err),
            (Target::Document(_, sink), Some(err)) => {
                Emission::DocumentError(Arc::clone(sink), err)
            }
            (Target::Collection(query, sink), None) => {
                Emission::Query(Arc::clone(sink), self.run_query(query))
            }
            (Target::Document(doc, sink), None) => Emission::Document(
                Arc::clone(sink),
                DocumentSnapshot {
                    id: doc.id().to_string(),
                    fields: self.documents.get(doc.path()).cloned(),
                },
            ),
        };
        Delivery { watch: id, emission }
    }
}

/// In-process implementation of [`Backend`].
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    mode: DeliveryMode,
}

impl MemoryBackend {
    /// Create a backend that emits synchronously.
    pub fn new() -> Self {
        Self::with_mode(DeliveryMode::Immediate)
    }

    /// Create a backend that queues emissions until [`flush`](Self::flush).
    pub fn manual() -> Self {
        Self::with_mode(DeliveryMode::Manual)
    }

    pub fn with_mode(mode: DeliveryMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            mode,
        }
    }

    /// Create or replace a document.
    pub fn set(&self, path: &str, data: Value) -> Result<()> {
        let doc = DocumentRef::new(path)?;
        let fields = into_fields(data)?;
        self.write(&doc, |documents| {
            documents.insert(doc.path().to_string(), fields);
        });
        Ok(())
    }

    /// Merge top-level fields into a document, creating it if absent.
    pub fn merge(&self, path: &str, data: Value) -> Result<()> {
        let doc = DocumentRef::new(path)?;
        let fields = into_fields(data)?;
        self.write(&doc, |documents| {
            documents
                .entry(doc.path().to_string())
                .or_default()
                .extend(fields);
        });
        Ok(())
    }

    /// Delete a document. Deleting a missing document still notifies.
    pub fn delete(&self, path: &str) -> Result<()> {
        let doc = DocumentRef::new(path)?;
        self.write(&doc, |documents| {
            documents.remove(doc.path());
        });
        Ok(())
    }

    /// Read a document directly, bypassing subscriptions.
    pub fn get(&self, path: &str) -> Option<Fields> {
        self.inner.lock().documents.get(path.trim_matches('/')).cloned()
    }

    /// Reject reads at or below `prefix`. Live subscriptions under it
    /// receive a permission error.
    pub fn deny(&self, prefix: &str) {
        let prefix = prefix.trim_matches('/').to_string();
        self.update_rules(&prefix, |denied| {
            if !denied.contains(&prefix) {
                denied.push(prefix.clone());
            }
        });
    }

    /// Lift a rule added by [`deny`](Self::deny). Affected subscriptions
    /// receive fresh snapshots.
    pub fn allow(&self, prefix: &str) {
        let prefix = prefix.trim_matches('/').to_string();
        self.update_rules(&prefix, |denied| denied.retain(|p| p != &prefix));
    }

    /// Push an error to every live subscription for `key`.
    pub fn fail(&self, key: &CacheKey, error: BackendError) {
        let mut inner = self.inner.lock();
        let ids: Vec<u64> = inner
            .watches
            .iter()
            .filter(|(_, w)| &w.key == key)
            .map(|(id, _)| *id)
            .collect();
        let deliveries = self.emit_or_queue(&mut inner, ids, Some(error));
        self.dispatch(inner, deliveries);
    }

    /// Deliver queued emissions in order. Returns how many were sent.
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock();
        let queue = std::mem::take(&mut inner.queue);
        let deliveries: Vec<Delivery> = queue
            .into_iter()
            .filter_map(|queued| {
                inner
                    .watches
                    .get(&queued.watch)
                    .map(|watch| inner.delivery_for(queued.watch, watch, queued.error))
            })
            .collect();
        let sent = deliveries.len();
        self.dispatch(inner, deliveries);
        sent
    }

    /// Number of subscribe calls received so far.
    pub fn subscribe_calls(&self) -> usize {
        self.inner.lock().subscribe_calls
    }

    /// Number of subscriptions cancelled so far.
    pub fn cancel_calls(&self) -> usize {
        self.inner.lock().cancel_calls
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.lock().watches.len()
    }

    fn write(&self, doc: &DocumentRef, apply: impl FnOnce(&mut BTreeMap<String, Fields>)) {
        let mut inner = self.inner.lock();
        apply(&mut inner.documents);
        let ids: Vec<u64> = inner
            .watches
            .iter()
            .filter(|(_, w)| w.target.affected_by(doc.path(), doc.parent()))
            .map(|(id, _)| *id)
            .collect();
        let deliveries = self.emit_or_queue(&mut inner, ids, None);
        self.dispatch(inner, deliveries);
    }

    fn update_rules(&self, prefix: &str, apply: impl FnOnce(&mut Vec<String>)) {
        let mut inner = self.inner.lock();
        apply(&mut inner.denied);
        let ids: Vec<u64> = inner
            .watches
            .iter()
            .filter(|(_, w)| {
                let path = w.target.path();
                path == prefix || path.starts_with(&format!("{prefix}/"))
            })
            .map(|(id, _)| *id)
            .collect();
        let deliveries = self.emit_or_queue(&mut inner, ids, None);
        self.dispatch(inner, deliveries);
    }

    /// Send emissions in the order they were built.
    ///
    /// One caller drains the outbox at a time, with no lock held while a
    /// sink runs. Emissions raised meanwhile, from another thread or from
    /// inside a sink, join the outbox and go out after the current one.
    fn dispatch(&self, mut inner: MutexGuard<'_, Inner>, deliveries: Vec<Delivery>) {
        inner.outbox.extend(deliveries);
        if inner.draining {
            return;
        }
        inner.draining = true;
        drop(inner);

        loop {
            let next = {
                let mut inner = self.inner.lock();
                loop {
                    match inner.outbox.pop_front() {
                        // Cancelled after the emission was built.
                        Some(delivery) if !inner.watches.contains_key(&delivery.watch) => {}
                        Some(delivery) => break Some(delivery),
                        None => {
                            inner.draining = false;
                            break None;
                        }
                    }
                }
            };
            match next {
                Some(delivery) => delivery.send(),
                None => return,
            }
        }
    }

    fn emit_or_queue(
        &self,
        inner: &mut Inner,
        mut ids: Vec<u64>,
        error: Option<BackendError>,
    ) -> Vec<Delivery> {
        ids.sort_unstable();
        match self.mode {
            DeliveryMode::Immediate => ids
                .into_iter()
                .filter_map(|id| {
                    inner
                        .watches
                        .get(&id)
                        .map(|watch| inner.delivery_for(id, watch, error.clone()))
                })
                .collect(),
            DeliveryMode::Manual => {
                inner.queue.extend(ids.into_iter().map(|watch| Queued {
                    watch,
                    error: error.clone(),
                }));
                Vec::new()
            }
        }
    }

    fn register(&self, key: CacheKey, target: Target) -> CancelHandle {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        inner.subscribe_calls += 1;
        let id = inner.next_id;
        inner.watches.insert(id, Watch { key, target });
        let deliveries = self.emit_or_queue(&mut inner, vec![id], None);
        self.dispatch(inner, deliveries);

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        CancelHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock();
                if inner.watches.remove(&id).is_some() {
                    inner.cancel_calls += 1;
                }
                inner.queue.retain(|queued| queued.watch != id);
            }
        })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn subscribe_collection(&self, query: &Query, sink: SnapshotSink<QuerySnapshot>) -> CancelHandle {
        let key = self.collection_key(query);
        self.register(key, Target::Collection(query.clone(), Arc::new(sink)))
    }

    fn subscribe_document(
        &self,
        doc: &DocumentRef,
        sink: SnapshotSink<DocumentSnapshot>,
    ) -> CancelHandle {
        let key = self.document_key(doc);
        self.register(key, Target::Document(doc.clone(), Arc::new(sink)))
    }
}

fn into_fields(data: Value) -> Result<Fields> {
    match data {
        Value::Object(fields) => Ok(fields),
        other => Err(CacheError::Backend(BackendError::new(
            ErrorCode::InvalidArgument,
            format!("document data must be an object, got {other}"),
        ))),
    }
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn id_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
