#![forbid(unsafe_code)]
//! Instance views: the public face of the dependence engine.
//!
//! An [`InstanceView`] wraps one physical instance's [`ExprTree`] with the
//! conflict rule for that instance's kind. Materialized instances use the
//! general usage-pair rule; reduction buffers accept commuting applications
//! of their own reduction operator and serialize everything else.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;
use weft_event::EventTable;
use weft_expr::RowSet;
use weft_tree::{ConflictPolicy, ExprTree, LastUser, TreeConfig, DEFAULT_CLEAN_THRESHOLD};
use weft_types::{
    EventId, FieldMask, InstanceId, OperationId, ReductionOpId, RegionUsage, RequirementIndex,
};

/// Conflict rule for a materialized (normal) instance: the general
/// usage-pair test.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaterializedPolicy;

impl ConflictPolicy for MaterializedPolicy {
    fn conflicts(&self, a: &RegionUsage, b: &RegionUsage) -> bool {
        a.conflicts_with(b)
    }
}

/// Conflict rule for a reduction buffer folding `redop`.
///
/// Two applications of the buffer's own operator commute; any other pair of
/// accesses to the buffer must be ordered, including reads against reads,
/// since a read of a reduction buffer observes the fold state.
#[derive(Debug, Clone, Copy)]
pub struct ReductionPolicy {
    pub redop: ReductionOpId,
}

impl ConflictPolicy for ReductionPolicy {
    fn conflicts(&self, a: &RegionUsage, b: &RegionUsage) -> bool {
        let ours = Some(self.redop);
        if a.is_reduce() && b.is_reduce() && a.redop == ours && b.redop == ours {
            return false;
        }
        true
    }
}

/// Which conflict rule the instance carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Materialized,
    Reduction(ReductionOpId),
}

/// View construction knobs.
#[derive(Debug, Clone)]
pub struct ViewConfig {
    /// Whether this replica is the instance's logical owner; governs which
    /// pending reference class insertions take.
    pub logical_owner: bool,
    /// Insertions between structural clean passes.
    pub clean_threshold: u64,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            logical_owner: true,
            clean_threshold: DEFAULT_CLEAN_THRESHOLD,
        }
    }
}

/// Dependence-tracking view over one physical instance.
///
/// Cheap to share behind an `Arc`; every method takes `&self` and the
/// underlying tree carries its own locking.
pub struct InstanceView {
    instance: InstanceId,
    kind: ViewKind,
    tree: ExprTree,
    events: EventTable,
}

impl InstanceView {
    #[must_use]
    pub fn new(
        instance: InstanceId,
        domain: RowSet,
        kind: ViewKind,
        events: EventTable,
        config: ViewConfig,
    ) -> Self {
        let policy: Arc<dyn ConflictPolicy> = match kind {
            ViewKind::Materialized => Arc::new(MaterializedPolicy),
            ViewKind::Reduction(redop) => Arc::new(ReductionPolicy { redop }),
        };
        let tree_config = TreeConfig {
            logical_owner: config.logical_owner,
            clean_threshold: config.clean_threshold,
        };
        let tree = ExprTree::new(domain, policy, events.clone(), tree_config);
        Self {
            instance,
            kind,
            tree,
            events,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    #[must_use]
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    #[must_use]
    pub fn events(&self) -> &EventTable {
        &self.events
    }

    #[must_use]
    pub fn tree(&self) -> &ExprTree {
        &self.tree
    }

    /// Register a task's access: query the events it must wait on
    /// (excluding its own `term_event`), record the access, and return the
    /// merged precondition event.
    pub fn register_user(
        &self,
        usage: RegionUsage,
        mask: FieldMask,
        expr: &RowSet,
        op: OperationId,
        index: RequirementIndex,
        term_event: EventId,
    ) -> EventId {
        let preconditions =
            self.tree
                .find_preconditions(&usage, expr, mask, Some(term_event), op);
        self.tree.add_user(usage, expr, mask, op, index, term_event);
        debug!(
            target: "weft::view",
            event = "user_registered",
            instance = self.instance.0,
            op = op.0,
            index = index.0,
            fields = %mask,
            preconditions = preconditions.len()
        );
        self.merge(&preconditions)
    }

    /// Events a copy in or out of this instance must wait on.
    #[must_use]
    pub fn find_copy_preconditions(
        &self,
        reading: bool,
        mask: FieldMask,
        expr: &RowSet,
    ) -> BTreeSet<EventId> {
        let usage = Self::copy_usage(reading);
        // Copies carry no operation id of their own; a fresh query never
        // matches on same-op and excludes nothing.
        self.tree
            .find_preconditions(&usage, expr, mask, None, OperationId(u64::MAX))
    }

    /// Conflicting users visible to a prospective copy, without any epoch
    /// mutation (diagnostics and copy aggregation).
    #[must_use]
    pub fn find_last_users(
        &self,
        usage: RegionUsage,
        mask: FieldMask,
        expr: &RowSet,
    ) -> Vec<LastUser> {
        self.tree.find_last_users(&usage, expr, mask)
    }

    /// Query-and-record for a copy: returns the merged precondition event
    /// and records the copy's access, splitting across covering children
    /// when `expr` matches no tracked domain exactly.
    pub fn add_copy_user(
        &self,
        reading: bool,
        mask: FieldMask,
        expr: &RowSet,
        op: OperationId,
        index: RequirementIndex,
        term_event: EventId,
    ) -> EventId {
        let usage = Self::copy_usage(reading);
        let preconditions = self
            .tree
            .find_preconditions(&usage, expr, mask, Some(term_event), op);
        self.tree
            .add_copy_user(usage, expr, mask, op, index, term_event);
        debug!(
            target: "weft::view",
            event = "copy_user_added",
            instance = self.instance.0,
            op = op.0,
            reading,
            fields = %mask,
            preconditions = preconditions.len()
        );
        self.merge(&preconditions)
    }

    /// Record a task access whose preconditions were already computed
    /// elsewhere (an operation issued before this view replica saw it).
    pub fn add_internal_task_user(
        &self,
        usage: RegionUsage,
        mask: FieldMask,
        expr: &RowSet,
        op: OperationId,
        index: RequirementIndex,
        term_event: EventId,
    ) {
        self.tree.add_user(usage, expr, mask, op, index, term_event);
    }

    /// Record a copy access whose preconditions were already computed
    /// elsewhere.
    pub fn add_internal_copy_user(
        &self,
        reading: bool,
        mask: FieldMask,
        expr: &RowSet,
        op: OperationId,
        index: RequirementIndex,
        term_event: EventId,
    ) {
        let usage = Self::copy_usage(reading);
        self.tree
            .add_copy_user(usage, expr, mask, op, index, term_event);
    }

    /// Run the structural maintenance pass now if no insertion is in
    /// flight; the same pass the insertion threshold triggers.
    pub fn prune(&self) -> bool {
        self.tree.prune()
    }

    fn copy_usage(reading: bool) -> RegionUsage {
        if reading {
            RegionUsage::read_only()
        } else {
            RegionUsage::read_write()
        }
    }

    fn merge(&self, preconditions: &BTreeSet<EventId>) -> EventId {
        let inputs: Vec<EventId> = preconditions.iter().copied().collect();
        self.events.merge(&inputs)
    }
}
