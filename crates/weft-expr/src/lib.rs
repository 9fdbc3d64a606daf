#![forbid(unsafe_code)]
//! RowSet algebra: immutable index-space expressions over an instance's
//! row domain.
//!
//! A [`RowSet`] is a normalized list of disjoint, sorted, half-open row
//! ranges with a process-unique expression id and a cached volume. The
//! dependence engine consumes RowSets purely through this algebra:
//! `volume()`, `intersect()`, `is_empty()`, and the identity/volume
//! equality tests used for domination and congruence.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

static NEXT_EXPR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one [`RowSet`] expression.
///
/// Ids are allocation identities, not structural hashes: two separately
/// constructed RowSets with identical ranges get distinct ids. Identity
/// equality is therefore sufficient but not necessary for set equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExprId(pub u64);

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expr{}", self.0)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RowSetError {
    #[error("inverted range: start {start} > end {end}")]
    InvertedRange { start: u64, end: u64 },
}

#[derive(Debug)]
struct RowSetInner {
    id: ExprId,
    /// Disjoint, sorted, non-empty half-open ranges.
    ranges: Vec<Range<u64>>,
    volume: u64,
}

/// Immutable subset of an instance's row domain.
///
/// Cheap to clone (`Arc` inner). The empty set is canonical per clone
/// lineage but not interned: every constructed empty RowSet carries its own
/// id, which is harmless because empty sets short-circuit everywhere.
#[derive(Clone)]
pub struct RowSet {
    inner: Arc<RowSetInner>,
}

impl RowSet {
    /// The empty row set.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_normalized(Vec::new())
    }

    /// A single half-open interval `[start, end)`.
    ///
    /// `start == end` yields the empty set; `start > end` is an error.
    pub fn interval(start: u64, end: u64) -> Result<Self, RowSetError> {
        if start > end {
            return Err(RowSetError::InvertedRange { start, end });
        }
        if start == end {
            return Ok(Self::empty());
        }
        Ok(Self::from_normalized(vec![start..end]))
    }

    /// Build from arbitrary half-open ranges: sorts, drops empties, merges
    /// overlapping and adjacent ranges. Inverted ranges are rejected.
    pub fn from_ranges(ranges: &[Range<u64>]) -> Result<Self, RowSetError> {
        let mut sorted: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
        for range in ranges {
            if range.start > range.end {
                return Err(RowSetError::InvertedRange {
                    start: range.start,
                    end: range.end,
                });
            }
            if range.start < range.end {
                sorted.push(range.clone());
            }
        }
        sorted.sort_by_key(|r| r.start);

        let mut normalized: Vec<Range<u64>> = Vec::with_capacity(sorted.len());
        for range in sorted {
            match normalized.last_mut() {
                Some(last) if range.start <= last.end => {
                    last.end = last.end.max(range.end);
                }
                _ => normalized.push(range),
            }
        }
        Ok(Self::from_normalized(normalized))
    }

    fn from_normalized(ranges: Vec<Range<u64>>) -> Self {
        let volume = ranges.iter().map(|r| r.end - r.start).sum();
        let id = ExprId(NEXT_EXPR_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(RowSetInner { id, ranges, volume }),
        }
    }

    /// Expression identity.
    #[must_use]
    pub fn id(&self) -> ExprId {
        self.inner.id
    }

    /// Number of rows in the set.
    #[must_use]
    pub fn volume(&self) -> u64 {
        self.inner.volume
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.volume == 0
    }

    /// The normalized ranges, for display and tests.
    #[must_use]
    pub fn ranges(&self) -> &[Range<u64>] {
        &self.inner.ranges
    }

    /// True iff the two handles name the same expression allocation.
    #[must_use]
    pub fn same_expr(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }

    /// Set intersection. Linear merge over the two sorted range lists.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        if self.same_expr(other) {
            return self.clone();
        }
        let mut out: Vec<Range<u64>> = Vec::new();
        let (mut i, mut j) = (0_usize, 0_usize);
        let a = &self.inner.ranges;
        let b = &other.inner.ranges;
        while i < a.len() && j < b.len() {
            let start = a[i].start.max(b[j].start);
            let end = a[i].end.min(b[j].end);
            if start < end {
                out.push(start..end);
            }
            if a[i].end <= b[j].end {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self::from_normalized(out)
    }

    /// True iff the two sets share at least one row. Cheaper than
    /// materializing the intersection.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.same_expr(other) {
            return !self.is_empty();
        }
        let (mut i, mut j) = (0_usize, 0_usize);
        let a = &self.inner.ranges;
        let b = &other.inner.ranges;
        while i < a.len() && j < b.len() {
            if a[i].start.max(b[j].start) < a[i].end.min(b[j].end) {
                return true;
            }
            if a[i].end <= b[j].end {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }

    /// Domination test: does `self` fully contain `other`?
    ///
    /// Id-equal expressions trivially dominate; otherwise the test is
    /// intersection-volume equality, `volume(self ∩ other) == other.volume()`.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        if self.same_expr(other) {
            return true;
        }
        self.intersect(other).volume() == other.volume()
    }

    /// Congruence test used for node-domain matching: id equality, or bare
    /// volume equality.
    ///
    /// The volume shortcut deliberately does NOT compare shapes: two
    /// different RowSets of equal volume are treated as the same domain.
    /// This is a lossy approximation the tracker is built around: merging
    /// distinct domains can add a wait, never lose one. It must not be
    /// tightened to a structural comparison.
    #[must_use]
    pub fn congruent(&self, other: &Self) -> bool {
        if self.same_expr(other) {
            return true;
        }
        !self.is_empty() && self.inner.volume == other.inner.volume
    }
}

impl fmt::Debug for RowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowSet[{}; vol={}; ", self.inner.id, self.inner.volume)?;
        for (position, range) in self.inner.ranges.iter().enumerate() {
            if position > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}..{}", range.start, range.end)?;
        }
        write!(f, "]")
    }
}
