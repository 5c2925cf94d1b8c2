//! The subscription cache service.

use super::entry::{Entry, Listener, ObserverSlot, Registry};
use super::observation::{Binding, Observation};
use super::types::{CacheConfig, CacheStats, ObserverId};
use crate::backend::{Backend, CancelHandle, DocumentSnapshot, QuerySnapshot, SnapshotDocument, SnapshotSink};
use crate::error::PermissionError;
use crate::query::{DocumentRef, Query};
use crate::scheduler::{Scheduler, TimerThread};
use crate::types::{CacheKey, CollectionData, DocumentData, ObservedState, Operation};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct Shared {
    pub(crate) backend: Arc<dyn Backend>,
    config: CacheConfig,
    scheduler: Arc<dyn Scheduler>,
    collections: Arc<Registry<CollectionData>>,
    documents: Arc<Registry<DocumentData>>,
    next_observer: AtomicU64,
    opened: AtomicUsize,
    cancelled: AtomicUsize,
    reporter: Sender<PermissionError>,
    reports: Receiver<PermissionError>,
}

impl Shared {
    fn next_observer_id(&self) -> ObserverId {
        ObserverId(self.next_observer.fetch_add(1, Ordering::SeqCst))
    }

    /// Attach `slot` to the entry for `key`, starting the backend
    /// subscription when this creates the entry.
    fn bind<D, F>(
        &self,
        registry: &Arc<Registry<D>>,
        key: CacheKey,
        slot: &Arc<ObserverSlot<D>>,
        subscribe: F,
    ) -> Binding<D>
    where
        D: Clone + Send + Sync + 'static,
        F: FnOnce(&Arc<Entry<D>>) -> CancelHandle,
    {
        let id = self.next_observer_id();
        let mut subscribe = Some(subscribe);

        loop {
            let (entry, created) = registry.get_or_create(&key);
            if !entry.attach(id, slot) {
                // Evicted between lookup and attach; the next lookup
                // creates a fresh entry.
                continue;
            }

            if created {
                if let Some(subscribe) = subscribe.take() {
                    let cancel = subscribe(&entry);
                    self.opened.fetch_add(1, Ordering::SeqCst);
                    entry.install(cancel);
                    tracing::debug!(key = %key, "backend subscription started");
                }
            }

            return Binding { entry, id };
        }
    }

    pub(crate) fn bind_collection(
        &self,
        query: &Query,
        key: CacheKey,
        slot: &Arc<ObserverSlot<CollectionData>>,
    ) -> Binding<CollectionData> {
        let backend = Arc::clone(&self.backend);
        let reporter = self.reporter.clone();

        self.bind(&self.collections, key, slot, |entry| {
            let on_next = Arc::downgrade(entry);
            let on_error = Arc::downgrade(entry);
            backend.subscribe_collection(
                query,
                SnapshotSink::new(
                    move |snapshot: QuerySnapshot| {
                        if let Some(entry) = on_next.upgrade() {
                            let records = snapshot
                                .documents
                                .into_iter()
                                .map(SnapshotDocument::into_record)
                                .collect();
                            entry.apply(Some(Arc::new(records)));
                        }
                    },
                    move |error| {
                        if let Some(entry) = on_error.upgrade() {
                            entry.fail(error, &reporter);
                        }
                    },
                ),
            )
        })
    }

    pub(crate) fn bind_document(
        &self,
        doc: &DocumentRef,
        key: CacheKey,
        slot: &Arc<ObserverSlot<DocumentData>>,
    ) -> Binding<DocumentData> {
        let backend = Arc::clone(&self.backend);
        let reporter = self.reporter.clone();

        self.bind(&self.documents, key, slot, |entry| {
            let on_next = Arc::downgrade(entry);
            let on_error = Arc::downgrade(entry);
            backend.subscribe_document(
                doc,
                SnapshotSink::new(
                    move |snapshot: DocumentSnapshot| {
                        if let Some(entry) = on_next.upgrade() {
                            entry.apply(snapshot.into_record().map(Arc::new));
                        }
                    },
                    move |error| {
                        if let Some(entry) = on_error.upgrade() {
                            entry.fail(error, &reporter);
                        }
                    },
                ),
            )
        })
    }

    /// Detach an observer, scheduling teardown if it was the last one.
    pub(crate) fn release<D>(self: &Arc<Self>, binding: Binding<D>)
    where
        D: Clone + Send + Sync + 'static,
    {
        let Some(epoch) = binding.entry.detach(binding.id) else {
            return;
        };

        let grace = self.config.teardown_grace;
        if grace.is_zero() {
            self.teardown(&binding.entry, epoch);
            return;
        }

        tracing::debug!(key = %binding.entry.key, ?grace, "teardown scheduled");
        let shared: Weak<Shared> = Arc::downgrade(self);
        let entry: Weak<Entry<D>> = Arc::downgrade(&binding.entry);
        self.scheduler.schedule(
            grace,
            Box::new(move || {
                if let (Some(shared), Some(entry)) = (shared.upgrade(), entry.upgrade()) {
                    shared.teardown(&entry, epoch);
                }
            }),
        );
    }

    /// Evict the entry and cancel its backend subscription, unless an
    /// observer arrived since the detach that produced `epoch`.
    fn teardown<D: Clone>(&self, entry: &Arc<Entry<D>>, epoch: u64) {
        let Some(registry) = entry.registry.upgrade() else {
            return;
        };

        match registry.evict_if_idle(entry, epoch) {
            Some(cancel) => {
                if let Some(cancel) = cancel {
                    cancel.cancel();
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                }
                tracing::debug!(key = %entry.key, "cache entry evicted");
            }
            None => tracing::debug!(key = %entry.key, "teardown skipped; entry in use"),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let handles: Vec<CancelHandle> = self
            .collections
            .drain()
            .into_iter()
            .chain(self.documents.drain())
            .collect();
        for cancel in handles {
            cancel.cancel();
        }
    }
}

/// Deduplicating cache of live collection queries and documents.
///
/// Every distinct key has at most one backend subscription no matter how
/// many observers share it. Observers joining a key that already has data
/// get it immediately, flagged stale, and the next emission refreshes all
/// of them together. When the last observer leaves, the subscription lives
/// on for [`CacheConfig::teardown_grace`] before being cancelled.
///
/// Cloning is cheap and shares the same registry.
#[derive(Clone)]
pub struct SubscriptionCache {
    shared: Arc<Shared>,
}

impl SubscriptionCache {
    /// Create a cache with the default configuration and a timer thread.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_config(backend, CacheConfig::default())
    }

    pub fn with_config(backend: Arc<dyn Backend>, config: CacheConfig) -> Self {
        Self::with_scheduler(backend, config, Arc::new(TimerThread::new()))
    }

    /// Create a cache that defers teardown through `scheduler`.
    pub fn with_scheduler(
        backend: Arc<dyn Backend>,
        config: CacheConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let (reporter, reports) = bounded(config.permission_error_buffer);
        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                scheduler,
                collections: Arc::new(Registry::new(Operation::List)),
                documents: Arc::new(Registry::new(Operation::Get)),
                next_observer: AtomicU64::new(1),
                opened: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
                reporter,
                reports,
            }),
        }
    }

    /// Observe a collection query. `None` yields an idle observation that
    /// never touches the cache.
    pub fn observe_collection(&self, query: Option<&Query>) -> Observation<CollectionData> {
        self.observe_collection_inner(query, None)
    }

    /// Like [`observe_collection`](Self::observe_collection), also calling
    /// `listener` on every state the observer receives.
    pub fn observe_collection_with<F>(
        &self,
        query: Option<&Query>,
        listener: F,
    ) -> Observation<CollectionData>
    where
        F: Fn(&ObservedState<CollectionData>) + Send + Sync + 'static,
    {
        self.observe_collection_inner(query, Some(Box::new(listener)))
    }

    /// Observe a single document. `None` yields an idle observation.
    pub fn observe_document(&self, doc: Option<&DocumentRef>) -> Observation<DocumentData> {
        self.observe_document_inner(doc, None)
    }

    pub fn observe_document_with<F>(
        &self,
        doc: Option<&DocumentRef>,
        listener: F,
    ) -> Observation<DocumentData>
    where
        F: Fn(&ObservedState<DocumentData>) + Send + Sync + 'static,
    {
        self.observe_document_inner(doc, Some(Box::new(listener)))
    }

    fn observe_collection_inner(
        &self,
        query: Option<&Query>,
        listener: Option<Listener<CollectionData>>,
    ) -> Observation<CollectionData> {
        let slot = Arc::new(ObserverSlot::new(listener));
        let binding = query.map(|query| {
            let key = self.shared.backend.collection_key(query);
            self.shared.bind_collection(query, key, &slot)
        });
        Observation::new(Arc::clone(&self.shared), slot, binding)
    }

    fn observe_document_inner(
        &self,
        doc: Option<&DocumentRef>,
        listener: Option<Listener<DocumentData>>,
    ) -> Observation<DocumentData> {
        let slot = Arc::new(ObserverSlot::new(listener));
        let binding = doc.map(|doc| {
            let key = self.shared.backend.document_key(doc);
            self.shared.bind_document(doc, key, &slot)
        });
        Observation::new(Arc::clone(&self.shared), slot, binding)
    }

    /// Permission errors seen by any entry, for a central error reporter.
    ///
    /// All receivers share one bounded queue; reports are dropped while it
    /// is full.
    pub fn permission_errors(&self) -> Receiver<PermissionError> {
        self.shared.reports.clone()
    }

    /// Whether an entry (live or in its grace window) exists for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.shared.collections.get(key).is_some() || self.shared.documents.get(key).is_some()
    }

    /// Observers currently attached to `key`.
    pub fn observer_count(&self, key: &CacheKey) -> usize {
        self.shared
            .collections
            .get(key)
            .map(|e| e.observer_count())
            .or_else(|| self.shared.documents.get(key).map(|e| e.observer_count()))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            collections: self.shared.collections.len(),
            documents: self.shared.documents.len(),
            observers: self.shared.collections.observer_total()
                + self.shared.documents.observer_total(),
            subscriptions_opened: self.shared.opened.load(Ordering::SeqCst),
            subscriptions_cancelled: self.shared.cancelled.load(Ordering::SeqCst),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }
}
