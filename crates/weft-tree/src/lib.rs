#![forbid(unsafe_code)]
//! Per-instance dependence tracking for `weft`.
//!
//! One [`ExprTree`] tracks every access made to one physical instance: which
//! rows, which fields, under which usage mode, and which completion event
//! signals the access finished. Queries compute the minimal set of
//! completion events a new access must wait on, with per-field and
//! per-RowSet precision, and aggressively retire bookkeeping as accesses
//! are superseded or complete.
//!
//! Precision over rows is deliberately lossy in one direction only: two
//! RowSets of equal volume are treated as the same domain, which can merge
//! distinct sets and add a wait, never lose one.

mod node;
mod record;
mod tree;

pub use node::ExprNode;
pub use record::{AccessRecord, ConflictPolicy, LastUser};
pub use tree::{ExprTree, TreeConfig, DEFAULT_CLEAN_THRESHOLD};
