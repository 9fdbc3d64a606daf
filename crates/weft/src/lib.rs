#![forbid(unsafe_code)]
//! Weft public API facade.
//!
//! Re-exports the view layer and the vocabulary it speaks through a stable
//! external interface. Downstream consumers depend on this crate rather
//! than on the engine crates directly.

pub use weft_event::{EventTable, PendingRefs};
pub use weft_expr::{ExprId, RowSet, RowSetError};
pub use weft_tree::{ConflictPolicy, ExprTree, LastUser, TreeConfig};
pub use weft_types::{
    Coherence, EventId, FieldMask, FieldMaskError, InstanceId, OperationId, Privilege,
    ReductionOpId, RegionUsage, RequirementIndex, MAX_FIELDS,
};
pub use weft_view::{
    InstanceView, MaterializedPolicy, ReductionPolicy, ViewConfig, ViewKind,
};
