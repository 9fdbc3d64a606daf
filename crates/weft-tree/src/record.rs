//! Access records and the per-event field-masked multisets stored in the
//! epoch maps.

use std::collections::BTreeMap;
use std::sync::Arc;
use weft_expr::RowSet;
use weft_types::{EventId, FieldMask, OperationId, RegionUsage, RequirementIndex};

/// Conflict predicate seam between the tree engine and the view kinds.
///
/// The tree walks and bookkeeping are identical for materialized and
/// reduction instances; only the usage-pair conflict test differs, so the
/// view supplies it through this trait instead of subclassing the tree.
pub trait ConflictPolicy: Send + Sync {
    /// True iff `a` and `b` must be ordered when their fields and rows
    /// overlap.
    fn conflicts(&self, a: &RegionUsage, b: &RegionUsage) -> bool;
}

/// Immutable record of one access: usage mode, row subset, and the
/// operation that performed it.
///
/// Shared by `Arc`; an `AccessRecord` is dropped when the last epoch-map
/// entry referencing it is removed.
#[derive(Debug)]
pub struct AccessRecord {
    pub usage: RegionUsage,
    pub expr: RowSet,
    pub op: OperationId,
    pub index: RequirementIndex,
    /// True iff `expr` exactly equals the owning node's domain (by id or by
    /// the volume-equality shortcut), letting queries skip the row-overlap
    /// computation.
    pub covers: bool,
}

impl AccessRecord {
    #[must_use]
    pub fn new(
        usage: RegionUsage,
        expr: RowSet,
        op: OperationId,
        index: RequirementIndex,
        covers: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            usage,
            expr,
            op,
            index,
            covers,
        })
    }
}

/// One conflicting user reported by a read-only `find_last_users` scan.
#[derive(Debug, Clone)]
pub struct LastUser {
    pub event: EventId,
    pub op: OperationId,
    pub index: RequirementIndex,
    pub usage: RegionUsage,
    /// Fields on which the conflict was observed.
    pub fields: FieldMask,
}

/// Field-masked multiset of access records sharing one completion event.
#[derive(Debug)]
pub(crate) struct EventUsers {
    /// Union of the per-record masks; lets scans skip whole events.
    pub valid_fields: FieldMask,
    pub users: Vec<(Arc<AccessRecord>, FieldMask)>,
}

impl EventUsers {
    pub(crate) fn new() -> Self {
        Self {
            valid_fields: FieldMask::EMPTY,
            users: Vec::new(),
        }
    }

    /// Add `mask` worth of `record`. A record already present (same `Arc`)
    /// has its mask extended instead of gaining a second entry, which is
    /// what makes congruent re-insertion idempotent.
    pub(crate) fn add(&mut self, record: Arc<AccessRecord>, mask: FieldMask) {
        self.valid_fields |= mask;
        for (existing, existing_mask) in &mut self.users {
            if Arc::ptr_eq(existing, &record) {
                *existing_mask |= mask;
                return;
            }
        }
        self.users.push((record, mask));
    }

    /// Remove `fields` from `record`'s mask, dropping the record entry when
    /// its mask empties. Returns the fields actually removed (empty when the
    /// record is no longer present with any of them).
    pub(crate) fn remove_record_fields(
        &mut self,
        record: &Arc<AccessRecord>,
        fields: FieldMask,
    ) -> FieldMask {
        let Some(position) = self
            .users
            .iter()
            .position(|(existing, _)| Arc::ptr_eq(existing, record))
        else {
            return FieldMask::EMPTY;
        };
        let removed = self.users[position].1 & fields;
        if removed.is_empty() {
            return FieldMask::EMPTY;
        }
        self.users[position].1 -= removed;
        if self.users[position].1.is_empty() {
            self.users.swap_remove(position);
        }
        self.recompute_valid_fields();
        removed
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    fn recompute_valid_fields(&mut self) {
        let mut valid = FieldMask::EMPTY;
        for (_, mask) in &self.users {
            valid |= *mask;
        }
        self.valid_fields = valid;
    }
}

/// The two-epoch bookkeeping of one tree node.
///
/// `current` holds records not yet known to be fully superseded by a later
/// field-and-domain-covering access; `previous` holds records known
/// superseded but not yet proven complete.
#[derive(Debug, Default)]
pub(crate) struct EpochMaps {
    pub current: BTreeMap<EventId, EventUsers>,
    pub previous: BTreeMap<EventId, EventUsers>,
}

impl EpochMaps {
    /// Union of every valid-field mask across both epochs.
    pub(crate) fn live_fields(&self) -> FieldMask {
        let mut live = FieldMask::EMPTY;
        for users in self.current.values() {
            live |= users.valid_fields;
        }
        for users in self.previous.values() {
            live |= users.valid_fields;
        }
        live
    }
}
