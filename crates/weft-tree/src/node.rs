//! Dependence tree nodes: one node per tracked RowSet domain.
//!
//! A node owns two epoch maps of event-keyed access records plus
//! field-annotated edges to child nodes for strictly smaller domains.
//! Children never hold a reference to their parent, so the `Arc` ownership
//! graph is acyclic even though liveness flows both ways (a parent keeps
//! children alive through edges; a child's live records keep its edge from
//! being pruned).

use crate::record::{AccessRecord, ConflictPolicy, EpochMaps, EventUsers, LastUser};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;
use weft_event::EventTable;
use weft_expr::RowSet;
use weft_types::{EventId, FieldMask, OperationId, RegionUsage, RequirementIndex};

/// Field-annotated, reference-counted edge to a child node.
///
/// The edge is live exactly for the fields in `mask`; queries and
/// insertions for disjoint fields never enter the child through it.
#[derive(Debug)]
pub(crate) struct ChildEdge {
    pub mask: FieldMask,
    pub node: Arc<ExprNode>,
}

/// One tracked domain: epoch maps plus child edges.
#[derive(Debug)]
pub struct ExprNode {
    domain: RowSet,
    volume: u64,
    epochs: RwLock<EpochMaps>,
    children: RwLock<Vec<ChildEdge>>,
    /// Fields for which no access record exists anywhere in this subtree.
    /// Monotonically shrinks between prune passes; prune recomputes it.
    unrecorded: RwLock<FieldMask>,
    /// Fields for which no live edge path from the root reaches this node.
    /// The root is always fully linked.
    unlinked: RwLock<FieldMask>,
    /// Fields whose records in this subtree may lie outside this node's
    /// domain. Volume-congruent folding can land a record at a node whose
    /// domain does not contain the record's rows; queries must descend for
    /// these fields even when their RowSet misses the domain, or a required
    /// precondition would be lost.
    spill: RwLock<FieldMask>,
}

impl ExprNode {
    pub(crate) fn new(domain: RowSet, linked_for: FieldMask) -> Arc<Self> {
        let volume = domain.volume();
        Arc::new(Self {
            domain,
            volume,
            epochs: RwLock::new(EpochMaps::default()),
            children: RwLock::new(Vec::new()),
            unrecorded: RwLock::new(FieldMask::FULL),
            unlinked: RwLock::new(FieldMask::FULL - linked_for),
            spill: RwLock::new(FieldMask::EMPTY),
        })
    }

    #[must_use]
    pub fn domain(&self) -> &RowSet {
        &self.domain
    }

    #[must_use]
    pub fn volume(&self) -> u64 {
        self.volume
    }

    pub(crate) fn note_recorded(&self, mask: FieldMask) {
        *self.unrecorded.write() -= mask;
    }

    pub(crate) fn mark_linked(&self, mask: FieldMask) {
        *self.unlinked.write() -= mask;
    }

    pub(crate) fn note_spill(&self, mask: FieldMask) {
        *self.spill.write() |= mask;
    }

    pub(crate) fn is_linked_for(&self, mask: FieldMask) -> bool {
        !self.unlinked.read().overlaps(&mask)
    }

    /// Insert `record` under `event` into the current epoch.
    pub(crate) fn add_current_user(
        &self,
        record: Arc<AccessRecord>,
        event: EventId,
        mask: FieldMask,
    ) {
        self.note_recorded(mask);
        let mut epochs = self.epochs.write();
        epochs
            .current
            .entry(event)
            .or_insert_with(EventUsers::new)
            .add(record, mask);
        trace!(
            target: "weft::tree",
            event = "user_added",
            completion = event.0,
            fields = %mask,
            domain_volume = self.volume
        );
    }

    /// The precondition query of one node and, recursively, its subtree.
    ///
    /// `expr_covers` is the caller's hint that `expr` dominates this node's
    /// whole domain. Conflicting events are added to `preconditions`; fully
    /// dominated current records are demoted to the previous epoch; previous
    /// records whose event already triggered are purged. The epoch lock is
    /// taken shared for the scan and exclusively only when a mutation is
    /// actually needed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn find_preconditions(
        &self,
        policy: &dyn ConflictPolicy,
        events: &EventTable,
        usage: &RegionUsage,
        expr: &RowSet,
        expr_covers: bool,
        mask: FieldMask,
        exclude: Option<EventId>,
        op: OperationId,
        preconditions: &mut BTreeSet<EventId>,
    ) {
        if expr.is_empty() || mask.is_empty() {
            return;
        }
        let live = mask - *self.unrecorded.read();
        if live.is_empty() {
            return;
        }

        let mut promotions: Vec<(EventId, Vec<(Arc<AccessRecord>, FieldMask)>)> = Vec::new();
        let mut dead_previous: Vec<EventId> = Vec::new();
        {
            let epochs = self.epochs.read();
            for (&event, users) in &epochs.current {
                if Some(event) == exclude || !users.valid_fields.overlaps(&live) {
                    continue;
                }
                let mut demote: Vec<(Arc<AccessRecord>, FieldMask)> = Vec::new();
                for (record, record_mask) in &users.users {
                    let overlap_fields = *record_mask & live;
                    if overlap_fields.is_empty() || record.op == op {
                        continue;
                    }
                    if !policy.conflicts(usage, &record.usage) {
                        continue;
                    }
                    let rows_overlap = record.covers
                        || expr_covers
                        || expr.overlaps(&record.expr);
                    if !rows_overlap {
                        continue;
                    }
                    preconditions.insert(event);
                    let dominated = expr_covers || expr.dominates(&record.expr);
                    if dominated {
                        demote.push((Arc::clone(record), overlap_fields));
                    }
                }
                if !demote.is_empty() {
                    promotions.push((event, demote));
                }
            }
            for (&event, users) in &epochs.previous {
                if Some(event) == exclude || !users.valid_fields.overlaps(&live) {
                    continue;
                }
                if events.has_triggered(event) {
                    // Known complete: dead bookkeeping, purge below.
                    dead_previous.push(event);
                    continue;
                }
                for (record, record_mask) in &users.users {
                    if (*record_mask & live).is_empty() || record.op == op {
                        continue;
                    }
                    if !policy.conflicts(usage, &record.usage) {
                        continue;
                    }
                    if record.covers || expr_covers || expr.overlaps(&record.expr) {
                        preconditions.insert(event);
                    }
                }
            }
        }

        if !promotions.is_empty() || !dead_previous.is_empty() {
            self.apply_epoch_mutations(promotions, dead_previous);
        }

        for (child, child_mask, child_covers) in self.intersecting_children(expr, expr_covers, live)
        {
            child.find_preconditions(
                policy,
                events,
                usage,
                expr,
                child_covers,
                child_mask,
                exclude,
                op,
                preconditions,
            );
        }
    }

    /// Read-only conflict scan for copy aggregation and tracing: no
    /// promotion, no purge, no lock upgrades.
    pub(crate) fn find_last_users(
        &self,
        policy: &dyn ConflictPolicy,
        usage: &RegionUsage,
        expr: &RowSet,
        expr_covers: bool,
        mask: FieldMask,
        out: &mut Vec<LastUser>,
    ) {
        if expr.is_empty() || mask.is_empty() {
            return;
        }
        let live = mask - *self.unrecorded.read();
        if live.is_empty() {
            return;
        }
        {
            let epochs = self.epochs.read();
            let both = epochs.current.iter().chain(epochs.previous.iter());
            for (&event, users) in both {
                if !users.valid_fields.overlaps(&live) {
                    continue;
                }
                for (record, record_mask) in &users.users {
                    let overlap_fields = *record_mask & live;
                    if overlap_fields.is_empty() {
                        continue;
                    }
                    if !policy.conflicts(usage, &record.usage) {
                        continue;
                    }
                    if record.covers || expr_covers || expr.overlaps(&record.expr) {
                        out.push(LastUser {
                            event,
                            op: record.op,
                            index: record.index,
                            usage: record.usage,
                            fields: overlap_fields,
                        });
                    }
                }
            }
        }
        for (child, child_mask, child_covers) in self.intersecting_children(expr, expr_covers, live)
        {
            child.find_last_users(policy, usage, expr, child_covers, child_mask, out);
        }
    }

    /// Record an access whose RowSet matches no tracked domain exactly:
    /// fields fully covered by a child's domain are pushed down and recorded
    /// there; the remainder stays here as an inexact one.
    ///
    /// A pushed-down record keeps `covers = false` unless its RowSet is
    /// congruent to the child's domain. `covers` asserts the record spans
    /// the node's whole domain; setting it for a strict subset would make
    /// row-disjoint queries at that node report a conflict.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_partial_user(
        self: &Arc<Self>,
        usage: RegionUsage,
        expr: &RowSet,
        mask: FieldMask,
        op: OperationId,
        index: RequirementIndex,
        event: EventId,
    ) {
        self.note_recorded(mask);
        if self.domain.congruent(expr) {
            let record = AccessRecord::new(usage, expr.clone(), op, index, true);
            self.add_current_user(record, event, mask);
            return;
        }

        let mut remainder = mask;
        let mut pushed: Vec<(Arc<ExprNode>, FieldMask)> = Vec::new();
        {
            let children = self.children.read();
            for edge in children.iter() {
                let edge_fields = edge.mask & remainder;
                if edge_fields.is_empty() {
                    continue;
                }
                if edge.node.domain.dominates(expr) {
                    pushed.push((Arc::clone(&edge.node), edge_fields));
                    remainder -= edge_fields;
                    if remainder.is_empty() {
                        break;
                    }
                }
            }
        }
        for (child, child_fields) in pushed {
            child.add_partial_user(usage, expr, child_fields, op, index, event);
        }
        if !remainder.is_empty() {
            trace!(
                target: "weft::tree",
                event = "partial_user_remainder",
                completion = event.0,
                fields = %remainder,
                domain_volume = self.volume
            );
            let record = AccessRecord::new(usage, expr.clone(), op, index, false);
            self.add_current_user(record, event, remainder);
        }
    }

    /// Remove every entry keyed by `event` from this subtree's epoch maps.
    /// Returns the number of map entries removed (for logging).
    pub(crate) fn filter_event(&self, event: EventId) -> usize {
        let mut removed = 0_usize;
        {
            let mut epochs = self.epochs.write();
            if epochs.current.remove(&event).is_some() {
                removed += 1;
            }
            if epochs.previous.remove(&event).is_some() {
                removed += 1;
            }
        }
        let children: Vec<Arc<ExprNode>> = self
            .children
            .read()
            .iter()
            .map(|edge| Arc::clone(&edge.node))
            .collect();
        for child in children {
            removed += child.filter_event(event);
        }
        removed
    }

    /// Bottom-up mark-prune: computes the fields with any live epoch entry
    /// in this subtree, trims child edges to those fields, drops edges left
    /// with none, and refreshes the never-recorded, unlinked, and spill
    /// masks. Returns (live fields, spilled fields) for the subtree.
    ///
    /// Called only while insertions are quiesced; holds this node's child
    /// lock across the recursion (strictly parent-then-child order, so no
    /// cycle with other lock users).
    pub(crate) fn mark_prune(&self) -> (FieldMask, FieldMask) {
        let (mut live, mut spill) = {
            let epochs = self.epochs.read();
            let mut spill = FieldMask::EMPTY;
            let both = epochs.current.values().chain(epochs.previous.values());
            for users in both {
                for (record, record_mask) in &users.users {
                    if !self.domain.dominates(&record.expr) {
                        spill |= *record_mask;
                    }
                }
            }
            (epochs.live_fields(), spill)
        };
        let mut children = self.children.write();
        children.retain_mut(|edge| {
            let (child_live, child_spill) = edge.node.mark_prune();
            edge.mask &= child_live;
            *edge.node.unlinked.write() = FieldMask::FULL - edge.mask;
            if edge.mask.is_empty() {
                trace!(
                    target: "weft::tree",
                    event = "edge_pruned",
                    domain_volume = edge.node.volume
                );
                return false;
            }
            live |= child_live;
            spill |= child_spill;
            true
        });
        drop(children);
        *self.unrecorded.write() = FieldMask::FULL - live;
        *self.spill.write() = spill;
        (live, spill)
    }

    /// Walk the surviving tree inserting every node into `cache`.
    pub(crate) fn collect_cache(
        self: &Arc<Self>,
        cache: &mut std::collections::BTreeMap<weft_expr::ExprId, Arc<ExprNode>>,
    ) {
        cache.insert(self.domain.id(), Arc::clone(self));
        for edge in self.children.read().iter() {
            edge.node.collect_cache(cache);
        }
    }

    /// Locked accessors used by the tree-level insertion walk.
    pub(crate) fn children_read(
        &self,
    ) -> parking_lot::RwLockReadGuard<'_, Vec<ChildEdge>> {
        self.children.read()
    }

    pub(crate) fn children_write(
        &self,
    ) -> parking_lot::RwLockWriteGuard<'_, Vec<ChildEdge>> {
        self.children.write()
    }

    /// True iff `event` keys an entry in either epoch map anywhere in this
    /// subtree (tests and diagnostics).
    #[must_use]
    pub fn references_event(&self, event: EventId) -> bool {
        {
            let epochs = self.epochs.read();
            if epochs.current.contains_key(&event) || epochs.previous.contains_key(&event) {
                return true;
            }
        }
        self.children
            .read()
            .iter()
            .any(|edge| edge.node.references_event(event))
    }

    /// Fields currently held in this node's previous epoch for `event`
    /// (test hook for promotion assertions).
    #[must_use]
    pub fn previous_fields_for(&self, event: EventId) -> FieldMask {
        self.epochs
            .read()
            .previous
            .get(&event)
            .map_or(FieldMask::EMPTY, |users| users.valid_fields)
    }

    /// Fields currently held in this node's current epoch for `event`.
    #[must_use]
    pub fn current_fields_for(&self, event: EventId) -> FieldMask {
        self.epochs
            .read()
            .current
            .get(&event)
            .map_or(FieldMask::EMPTY, |users| users.valid_fields)
    }

    fn apply_epoch_mutations(
        &self,
        promotions: Vec<(EventId, Vec<(Arc<AccessRecord>, FieldMask)>)>,
        dead_previous: Vec<EventId>,
    ) {
        let mut epochs = self.epochs.write();
        for event in dead_previous {
            if epochs.previous.remove(&event).is_some() {
                trace!(
                    target: "weft::tree",
                    event = "previous_purged",
                    completion = event.0
                );
            }
        }
        for (event, demote) in promotions {
            // Re-validate against the live map: another query may have
            // promoted or purged these entries between our shared scan and
            // this exclusive section.
            let mut moved: Vec<(Arc<AccessRecord>, FieldMask)> = Vec::new();
            if let Some(users) = epochs.current.get_mut(&event) {
                for (record, fields) in demote {
                    let removed = users.remove_record_fields(&record, fields);
                    if !removed.is_empty() {
                        moved.push((record, removed));
                    }
                }
                if users.is_empty() {
                    epochs.current.remove(&event);
                }
            }
            if !moved.is_empty() {
                let previous = epochs
                    .previous
                    .entry(event)
                    .or_insert_with(EventUsers::new);
                for (record, fields) in moved {
                    previous.add(record, fields);
                }
                trace!(
                    target: "weft::tree",
                    event = "users_demoted",
                    completion = event.0
                );
            }
        }
    }

    /// Children whose edge fields and domain intersect the query; returns
    /// (child, fields, child-covered hint) triples with the lock released.
    fn intersecting_children(
        &self,
        expr: &RowSet,
        expr_covers: bool,
        mask: FieldMask,
    ) -> Vec<(Arc<ExprNode>, FieldMask, bool)> {
        let children = self.children.read();
        let mut out = Vec::new();
        for edge in children.iter() {
            let child_mask = edge.mask & mask;
            if child_mask.is_empty() {
                continue;
            }
            let child = &edge.node;
            if expr_covers {
                // Q dominated this node, so it dominates every child domain.
                out.push((Arc::clone(child), child_mask, true));
                continue;
            }
            if child.domain.same_expr(expr) {
                out.push((Arc::clone(child), child_mask, true));
                continue;
            }
            let overlap = expr.intersect(&child.domain);
            if overlap.is_empty() {
                // A subtree with spilled fields can hold records outside the
                // child's domain; it must still be visited for those fields.
                if child.spill.read().overlaps(&child_mask) {
                    out.push((Arc::clone(child), child_mask, false));
                }
                continue;
            }
            let covers = overlap.volume() == child.volume;
            out.push((Arc::clone(child), child_mask, covers));
        }
        out
    }
}
