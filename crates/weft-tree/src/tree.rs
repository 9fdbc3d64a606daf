//! The per-instance root tracker: owns the dependence tree, the expr-id
//! lookup cache, event registration for deferred garbage collection, and
//! the threshold-driven structural maintenance pass.

use crate::node::{ChildEdge, ExprNode};
use crate::record::{AccessRecord, ConflictPolicy, LastUser};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use weft_event::{EventTable, PendingRefs};
use weft_expr::{ExprId, RowSet};
use weft_types::{EventId, FieldMask, OperationId, RegionUsage, RequirementIndex};

/// Default number of insertions between structural clean passes.
pub const DEFAULT_CLEAN_THRESHOLD: u64 = 32;

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Whether this replica is the instance's logical owner. Only the owner
    /// takes collection-governing references; non-owner copies take
    /// resource-only references.
    pub logical_owner: bool,
    /// Clean pass every this many insertions (once in-flight insertions
    /// drain).
    pub clean_threshold: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            logical_owner: true,
            clean_threshold: DEFAULT_CLEAN_THRESHOLD,
        }
    }
}

/// State shared with deferred GC callbacks through a weak handle, so a
/// registered callback never keeps a dropped tree alive.
struct TreeShared {
    root: Arc<ExprNode>,
    cache: RwLock<BTreeMap<ExprId, Arc<ExprNode>>>,
    registered: Mutex<BTreeSet<EventId>>,
    refs: PendingRefs,
    logical_owner: bool,
}

/// Dependence tracker for one physical instance.
///
/// One tree per instance, shared by many caller threads. Queries take
/// shared locks; record insertion, promotion, and purge take the epoch
/// lock exclusively per node; node linking and pruning take the child-edge
/// locks exclusively. The quiesce lock realizes the outstanding-insertion
/// exclusion: insertions hold it shared, the clean pass runs only when it
/// can take it exclusively, and never blocks waiting.
pub struct ExprTree {
    shared: Arc<TreeShared>,
    events: EventTable,
    policy: Arc<dyn ConflictPolicy>,
    quiesce: RwLock<()>,
    outstanding: AtomicU64,
    since_clean: AtomicU64,
    clean_threshold: u64,
}

impl ExprTree {
    /// Build a tracker whose root covers the whole instance domain.
    ///
    /// Panics if `domain` is empty: an instance without rows has nothing to
    /// track and indicates a caller bug.
    #[must_use]
    pub fn new(
        domain: RowSet,
        policy: Arc<dyn ConflictPolicy>,
        events: EventTable,
        config: TreeConfig,
    ) -> Self {
        assert!(!domain.is_empty(), "instance domain must be non-empty");
        let root = ExprNode::new(domain, FieldMask::FULL);
        Self {
            shared: Arc::new(TreeShared {
                root,
                cache: RwLock::new(BTreeMap::new()),
                registered: Mutex::new(BTreeSet::new()),
                refs: PendingRefs::new(),
                logical_owner: config.logical_owner,
            }),
            events,
            policy,
            quiesce: RwLock::new(()),
            outstanding: AtomicU64::new(0),
            since_clean: AtomicU64::new(0),
            clean_threshold: config.clean_threshold.max(1),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Arc<ExprNode> {
        &self.shared.root
    }

    #[must_use]
    pub fn events(&self) -> &EventTable {
        &self.events
    }

    #[must_use]
    pub fn pending_refs(&self) -> &PendingRefs {
        &self.shared.refs
    }

    #[must_use]
    pub fn outstanding_insertions(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Completion events a `usage` access over `expr`/`mask` must wait on.
    ///
    /// `exclude` names the caller's own completion event (a freshly created
    /// operation must not wait on itself). Empty RowSets and field masks
    /// short-circuit to the empty set without taking any lock.
    #[must_use]
    pub fn find_preconditions(
        &self,
        usage: &RegionUsage,
        expr: &RowSet,
        mask: FieldMask,
        exclude: Option<EventId>,
        op: OperationId,
    ) -> BTreeSet<EventId> {
        let mut preconditions = BTreeSet::new();
        if expr.is_empty() || mask.is_empty() {
            return preconditions;
        }
        let covers = expr.dominates(self.shared.root.domain());
        self.shared.root.find_preconditions(
            self.policy.as_ref(),
            &self.events,
            usage,
            expr,
            covers,
            mask,
            exclude,
            op,
            &mut preconditions,
        );
        preconditions
    }

    /// Read-only scan of conflicting users for copy aggregation and
    /// tracing; performs no promotion and no purge.
    #[must_use]
    pub fn find_last_users(
        &self,
        usage: &RegionUsage,
        expr: &RowSet,
        mask: FieldMask,
    ) -> Vec<LastUser> {
        let mut out = Vec::new();
        if expr.is_empty() || mask.is_empty() {
            return out;
        }
        let covers = expr.dominates(self.shared.root.domain());
        self.shared
            .root
            .find_last_users(self.policy.as_ref(), usage, expr, covers, mask, &mut out);
        out
    }

    /// Record an access at the node congruent to `expr`, creating and
    /// linking that node if it does not exist yet. Never fails; empty
    /// inputs are no-ops.
    pub fn add_user(
        &self,
        usage: RegionUsage,
        expr: &RowSet,
        mask: FieldMask,
        op: OperationId,
        index: RequirementIndex,
        event: EventId,
    ) {
        if expr.is_empty() || mask.is_empty() {
            return;
        }
        {
            let _in_flight = self.quiesce.read();
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            let node = self.place_user(expr, mask);
            // The chosen node is congruent to expr by construction.
            let record = AccessRecord::new(usage, expr.clone(), op, index, true);
            node.add_current_user(record, event, mask);
            self.register_event(event);
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
        self.bump_clean_counter();
    }

    /// Record a copy-style access: exact when `expr` is congruent to the
    /// root domain, otherwise split across the children that fully cover it
    /// with the remainder kept at the deepest visited node as inexact.
    pub fn add_copy_user(
        &self,
        usage: RegionUsage,
        expr: &RowSet,
        mask: FieldMask,
        op: OperationId,
        index: RequirementIndex,
        event: EventId,
    ) {
        if expr.is_empty() || mask.is_empty() {
            return;
        }
        if self.shared.root.domain().congruent(expr) {
            self.add_user(usage, expr, mask, op, index, event);
            return;
        }
        {
            let _in_flight = self.quiesce.read();
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            self.shared
                .root
                .add_partial_user(usage, expr, mask, op, index, event);
            self.register_event(event);
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
        self.bump_clean_counter();
    }

    /// Run the structural clean pass now if no insertion is in flight.
    /// Returns false when deferred.
    pub fn prune(&self) -> bool {
        self.try_clean()
    }

    /// Events with live bookkeeping registered for deferred collection
    /// (test and diagnostic hook).
    #[must_use]
    pub fn registered_events(&self) -> usize {
        self.shared.registered.lock().len()
    }

    /// Locate the node congruent to `expr`, linking it for `mask`;
    /// create and attach one under the smallest dominating node when none
    /// exists. New nodes are constructed outside any lock and linked under
    /// the parent's exclusive child lock, re-checking for a concurrently
    /// created congruent sibling.
    fn place_user(&self, expr: &RowSet, mask: FieldMask) -> Arc<ExprNode> {
        let root = &self.shared.root;
        if root.domain().congruent(expr) {
            return Arc::clone(root);
        }
        if let Some(node) = self.shared.cache.read().get(&expr.id()) {
            // A cached node already linked for these fields needs no walk,
            // provided the node's domain contains the rows (a volume-folded
            // hit must take the walk so spill marks reach its ancestors).
            if node.is_linked_for(mask) && node.domain().dominates(expr) {
                trace!(
                    target: "weft::tree",
                    event = "expr_cache_hit",
                    expr = expr.id().0,
                    fields = %mask
                );
                return Arc::clone(node);
            }
        }

        enum Step {
            Found(Arc<ExprNode>),
            Descend(Arc<ExprNode>),
            Attach,
        }

        let mut path: Vec<Arc<ExprNode>> = Vec::new();
        let mut current = Arc::clone(root);
        loop {
            current.note_recorded(mask);
            path.push(Arc::clone(&current));
            let step = {
                let children = current.children_read();
                let mut congruent: Option<Arc<ExprNode>> = None;
                let mut tightest: Option<Arc<ExprNode>> = None;
                for edge in children.iter() {
                    if edge.node.domain().congruent(expr) {
                        congruent = Some(Arc::clone(&edge.node));
                        break;
                    }
                    if edge.node.domain().dominates(expr) {
                        let better = tightest
                            .as_ref()
                            .map_or(true, |best| edge.node.volume() < best.volume());
                        if better {
                            tightest = Some(Arc::clone(&edge.node));
                        }
                    }
                }
                if let Some(node) = congruent {
                    Step::Found(node)
                } else if let Some(node) = tightest {
                    Step::Descend(node)
                } else {
                    Step::Attach
                }
            };
            match step {
                Step::Found(node) => {
                    self.extend_edge(&current, &node, mask);
                    node.mark_linked(mask);
                    Self::mark_spill_path(&path, &node, expr, mask);
                    self.shared
                        .cache
                        .write()
                        .insert(expr.id(), Arc::clone(&node));
                    return node;
                }
                Step::Descend(node) => {
                    self.extend_edge(&current, &node, mask);
                    node.mark_linked(mask);
                    current = node;
                }
                Step::Attach => {
                    let node = ExprNode::new(expr.clone(), mask);
                    let mut children = current.children_write();
                    // Re-check: a racing insertion may have linked a
                    // congruent node while we built ours.
                    let raced = children
                        .iter()
                        .position(|edge| edge.node.domain().congruent(expr));
                    if let Some(pos) = raced {
                        children[pos].mask |= mask;
                        let winner = Arc::clone(&children[pos].node);
                        drop(children);
                        winner.mark_linked(mask);
                        Self::mark_spill_path(&path, &winner, expr, mask);
                        self.shared
                            .cache
                            .write()
                            .insert(expr.id(), Arc::clone(&winner));
                        return winner;
                    }
                    children.push(ChildEdge {
                        mask,
                        node: Arc::clone(&node),
                    });
                    drop(children);
                    self.shared
                        .cache
                        .write()
                        .insert(expr.id(), Arc::clone(&node));
                    debug!(
                        target: "weft::tree",
                        event = "node_created",
                        expr = expr.id().0,
                        domain_volume = node.volume(),
                        fields = %mask
                    );
                    return node;
                }
            }
        }
    }

    /// A record folded into a volume-congruent node with rows outside its
    /// domain must leave spill marks on the node and the whole placement
    /// path, or domain-gated queries would never reach it.
    fn mark_spill_path(
        path: &[Arc<ExprNode>],
        target: &Arc<ExprNode>,
        expr: &RowSet,
        mask: FieldMask,
    ) {
        if target.domain().dominates(expr) {
            return;
        }
        target.note_spill(mask);
        for node in path {
            node.note_spill(mask);
        }
    }

    /// Make the parent→child edge live for `mask`.
    fn extend_edge(&self, parent: &Arc<ExprNode>, child: &Arc<ExprNode>, mask: FieldMask) {
        {
            let children = parent.children_read();
            if let Some(edge) = children
                .iter()
                .find(|edge| Arc::ptr_eq(&edge.node, child))
            {
                if edge.mask.contains_mask(&mask) {
                    return;
                }
            }
        }
        let mut children = parent.children_write();
        if let Some(edge) = children
            .iter_mut()
            .find(|edge| Arc::ptr_eq(&edge.node, child))
        {
            edge.mask |= mask;
        }
    }

    /// First insertion under `event` registers a tree-wide removal callback
    /// for when it triggers, and takes the collection-governing (owner) or
    /// resource-only (non-owner) reference on the instance.
    fn register_event(&self, event: EventId) {
        {
            let mut registered = self.shared.registered.lock();
            if !registered.insert(event) {
                return;
            }
        }
        if self.shared.logical_owner {
            self.shared.refs.add_collection_ref();
        } else {
            self.shared.refs.add_resource_ref();
        }
        let weak = Arc::downgrade(&self.shared);
        self.events.defer(event, move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            // Deregister before walking. An insertion racing this callback
            // either lands its record before the walk visits its node, or
            // finds the event gone from the set, re-registers, and its own
            // deferred callback runs immediately and re-filters. Removing
            // after the walk would let such an insertion slip a record past
            // the walk with the event still registered, leaking the record
            // forever.
            shared.registered.lock().remove(&event);
            let removed = shared.root.filter_event(event);
            if shared.logical_owner {
                shared.refs.release_collection_ref();
            } else {
                shared.refs.release_resource_ref();
            }
            debug!(
                target: "weft::tree",
                event = "gc_collected",
                completion = event.0,
                entries_removed = removed
            );
        });
    }

    fn bump_clean_counter(&self) {
        let since = self.since_clean.fetch_add(1, Ordering::AcqRel) + 1;
        if since >= self.clean_threshold {
            self.try_clean();
        }
    }

    fn try_clean(&self) -> bool {
        // Exclusive acquisition succeeds only when no insertion holds the
        // shared side; a failed attempt defers to a later insertion's bump.
        let Some(_quiesced) = self.quiesce.try_write() else {
            trace!(target: "weft::tree", event = "clean_deferred");
            return false;
        };
        let (live, _spill) = self.shared.root.mark_prune();
        let mut cache = BTreeMap::new();
        self.shared.root.collect_cache(&mut cache);
        let cached = cache.len();
        *self.shared.cache.write() = cache;
        self.since_clean.store(0, Ordering::Release);
        debug!(
            target: "weft::tree",
            event = "clean_done",
            live_fields = %live,
            cached_nodes = cached
        );
        true
    }
}
