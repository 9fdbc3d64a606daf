#![forbid(unsafe_code)]
//! Completion-event plumbing consumed by the dependence engine.
//!
//! The engine never waits on an event; it only observes triggers and
//! registers deferred callbacks to run once an event fires. This crate is
//! the owner-side model of that external subsystem: an [`EventTable`] keyed
//! by opaque [`EventId`] handles, plus the [`PendingRefs`] ledger the
//! garbage-collection contract uses to keep an instance alive while
//! bookkeeping for unfinished operations still references it.
//!
//! Events trigger exactly once and are immutable afterwards. Triggering an
//! already-triggered event is a programmer error and panics.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use weft_types::EventId;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct EventSlot {
    triggered: bool,
    callbacks: Vec<Callback>,
}

#[derive(Default)]
struct TableInner {
    next_id: AtomicU64,
    slots: Mutex<BTreeMap<EventId, EventSlot>>,
}

/// Owner-side table of completion events.
///
/// Cloning the table clones a handle to the same underlying state; the
/// engine, its GC callbacks, and test harnesses all share one table per
/// deployment.
#[derive(Clone, Default)]
pub struct EventTable {
    inner: Arc<TableInner>,
}

impl EventTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh untriggered event.
    #[must_use]
    pub fn create(&self) -> EventId {
        let id = EventId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner.slots.lock().insert(id, EventSlot::default());
        trace!(target: "weft::event", event = "event_create", id = id.0);
        id
    }

    /// Trigger `id`, running every deferred callback registered against it.
    ///
    /// Callbacks run outside the table lock, so they may freely call back
    /// into the table (including triggering further events). Panics if `id`
    /// is unknown or already triggered.
    pub fn trigger(&self, id: EventId) {
        let callbacks = {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .get_mut(&id)
                .unwrap_or_else(|| panic!("trigger of unknown event {id}"));
            assert!(!slot.triggered, "event {id} triggered twice");
            slot.triggered = true;
            std::mem::take(&mut slot.callbacks)
        };
        debug!(
            target: "weft::event",
            event = "event_trigger",
            id = id.0,
            callbacks = callbacks.len()
        );
        for callback in callbacks {
            callback();
        }
    }

    /// True iff `id` has triggered. Panics if `id` is unknown.
    #[must_use]
    pub fn has_triggered(&self, id: EventId) -> bool {
        self.inner
            .slots
            .lock()
            .get(&id)
            .unwrap_or_else(|| panic!("query of unknown event {id}"))
            .triggered
    }

    /// Run `callback` once `id` triggers; immediately if it already has.
    ///
    /// Panics if `id` is unknown.
    pub fn defer(&self, id: EventId, callback: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .get_mut(&id)
                .unwrap_or_else(|| panic!("defer against unknown event {id}"));
            if slot.triggered {
                true
            } else {
                slot.callbacks.push(Box::new(callback));
                return;
            }
        };
        if run_now {
            trace!(target: "weft::event", event = "event_defer_immediate", id = id.0);
            callback();
        }
    }

    /// Event that triggers once every input has.
    ///
    /// Already-triggered inputs are skipped; an empty or fully-triggered
    /// input set yields an already-triggered event.
    #[must_use]
    pub fn merge(&self, inputs: &[EventId]) -> EventId {
        let merged = self.create();
        let pending: Vec<EventId> = {
            let slots = self.inner.slots.lock();
            inputs
                .iter()
                .copied()
                .filter(|id| {
                    !slots
                        .get(id)
                        .unwrap_or_else(|| panic!("merge of unknown event {id}"))
                        .triggered
                })
                .collect()
        };
        debug!(
            target: "weft::event",
            event = "event_merge",
            merged = merged.0,
            inputs = inputs.len(),
            pending = pending.len()
        );
        if pending.is_empty() {
            self.trigger(merged);
            return merged;
        }
        let remaining = Arc::new(AtomicUsize::new(pending.len()));
        for input in pending {
            let table = self.clone();
            let remaining = Arc::clone(&remaining);
            self.defer(input, move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    table.trigger(merged);
                }
            });
        }
        merged
    }
}

/// Per-instance reference ledger for deferred collection.
///
/// The logical owner of an instance takes collection-governing references
/// (one per live event with bookkeeping in the tree); non-owner replicas
/// take resource-only references. Liveness decisions belong solely to the
/// owner, so only the collection count gates reclamation.
#[derive(Debug, Default)]
pub struct PendingRefs {
    collection: AtomicU64,
    resource: AtomicU64,
}

impl PendingRefs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_collection_ref(&self) {
        self.collection.fetch_add(1, Ordering::AcqRel);
    }

    /// Panics on underflow: an unbalanced release is a programmer error.
    pub fn release_collection_ref(&self) {
        let previous = self.collection.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "collection reference released below zero");
    }

    pub fn add_resource_ref(&self) {
        self.resource.fetch_add(1, Ordering::AcqRel);
    }

    /// Panics on underflow.
    pub fn release_resource_ref(&self) {
        let previous = self.resource.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "resource reference released below zero");
    }

    #[must_use]
    pub fn collection_refs(&self) -> u64 {
        self.collection.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn resource_refs(&self) -> u64 {
        self.resource.load(Ordering::Acquire)
    }
}
