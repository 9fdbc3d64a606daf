#![forbid(unsafe_code)]
//! Core value types for Weft: field masks, id newtypes, and the
//! usage/coherence model.
//!
//! Everything in this crate is plain immutable data. The dependence engine
//! (`weft-tree`) and the view layer (`weft-view`) build on these types; this
//! crate depends on nothing else in the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign};
use thiserror::Error;

/// Number of field slots a [`FieldMask`] can address.
pub const MAX_FIELDS: usize = 256;

const MASK_WORDS: usize = MAX_FIELDS / 64;

/// Identity of one asynchronous operation (task, copy, fill, reduction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

/// Opaque completion-event handle. Triggers exactly once, immutable after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// Identity of one physical instance (memory allocation backing a region).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

/// Identity of a reduction operator. Two reductions commute iff their
/// operator ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReductionOpId(pub u32);

/// Index of the region requirement within its operation that produced an
/// access. Carried for diagnostics and tracing, never used for conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequirementIndex(pub u32);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ev{}", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inst{}", self.0)
    }
}

impl fmt::Display for ReductionOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "redop{}", self.0)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FieldMaskError {
    #[error("field index {index} out of range (max {MAX_FIELDS})")]
    IndexOutOfRange { index: usize },
}

/// Fixed-width bitset over field ids.
///
/// One bit per named field of an instance layout. Supports the set algebra
/// the dependence engine needs: intersection (`&`), union (`|`), difference
/// (`-`), emptiness and overlap tests, and iteration over set bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldMask {
    words: [u64; MASK_WORDS],
}

impl FieldMask {
    /// The empty mask.
    pub const EMPTY: Self = Self {
        words: [0; MASK_WORDS],
    };

    /// All `MAX_FIELDS` bits set.
    pub const FULL: Self = Self {
        words: [u64::MAX; MASK_WORDS],
    };

    /// Mask with a single field set.
    ///
    /// Returns `FieldMaskError::IndexOutOfRange` if `index >= MAX_FIELDS`.
    pub fn single(index: usize) -> Result<Self, FieldMaskError> {
        let mut mask = Self::EMPTY;
        mask.set(index)?;
        Ok(mask)
    }

    /// Mask with every listed field set.
    pub fn from_indices(indices: &[usize]) -> Result<Self, FieldMaskError> {
        let mut mask = Self::EMPTY;
        for &index in indices {
            mask.set(index)?;
        }
        Ok(mask)
    }

    /// Set one bit in place.
    pub fn set(&mut self, index: usize) -> Result<(), FieldMaskError> {
        if index >= MAX_FIELDS {
            return Err(FieldMaskError::IndexOutOfRange { index });
        }
        self.words[index / 64] |= 1_u64 << (index % 64);
        Ok(())
    }

    /// True iff no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// True iff `index` is set. Out-of-range indices are never set.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        if index >= MAX_FIELDS {
            return false;
        }
        self.words[index / 64] & (1_u64 << (index % 64)) != 0
    }

    /// True iff the two masks share at least one bit.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// True iff every bit of `other` is also set in `self`.
    #[must_use]
    pub fn contains_mask(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & b == *b)
    }

    /// Number of set bits.
    #[must_use]
    pub fn pop_count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Iterate over the indices of set bits, ascending.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_FIELDS).filter(move |&index| self.contains(index))
    }
}

impl BitAnd for FieldMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        let mut out = self;
        out &= rhs;
        out
    }
}

impl BitAndAssign for FieldMask {
    fn bitand_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a &= b;
        }
    }
}

impl BitOr for FieldMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        let mut out = self;
        out |= rhs;
        out
    }
}

impl BitOrAssign for FieldMask {
    fn bitor_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a |= b;
        }
    }
}

impl Sub for FieldMask {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        let mut out = self;
        out -= rhs;
        out
    }
}

impl SubAssign for FieldMask {
    fn sub_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a &= !b;
        }
    }
}

impl fmt::Debug for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldMask({self})")
    }
}

impl fmt::Display for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Most masks are sparse; print set bits rather than 256 hex digits.
        if self.is_empty() {
            return write!(f, "{{}}");
        }
        if *self == Self::FULL {
            return write!(f, "{{*}}");
        }
        write!(f, "{{")?;
        for (position, index) in self.iter().enumerate() {
            if position > 0 {
                write!(f, ",")?;
            }
            write!(f, "{index}")?;
        }
        write!(f, "}}")
    }
}

/// Access privilege of one region requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Privilege {
    /// Reads only; never mutates the instance.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
    /// Writes without reading prior contents.
    WriteOnly,
    /// Applies a reduction operator; mutates, but commutes with other
    /// applications of the same operator.
    Reduce,
}

/// Coherence annotation of one region requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coherence {
    /// Serialized with respect to all conflicting accesses.
    Exclusive,
    /// May be reordered with other atomic accesses, serialized otherwise.
    Atomic,
    /// Opts out of ordering against other simultaneous accesses; the caller
    /// accepts the race.
    Simultaneous,
}

/// Usage mode of one access: privilege, coherence, and the reduction
/// operator when the privilege is `Reduce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionUsage {
    pub privilege: Privilege,
    pub coherence: Coherence,
    pub redop: Option<ReductionOpId>,
}

impl RegionUsage {
    #[must_use]
    pub fn new(privilege: Privilege, coherence: Coherence) -> Self {
        debug_assert!(
            privilege != Privilege::Reduce,
            "reductions must carry an operator; use RegionUsage::reduce"
        );
        Self {
            privilege,
            coherence,
            redop: None,
        }
    }

    #[must_use]
    pub fn read_only() -> Self {
        Self::new(Privilege::ReadOnly, Coherence::Exclusive)
    }

    #[must_use]
    pub fn read_write() -> Self {
        Self::new(Privilege::ReadWrite, Coherence::Exclusive)
    }

    #[must_use]
    pub fn write_only() -> Self {
        Self::new(Privilege::WriteOnly, Coherence::Exclusive)
    }

    #[must_use]
    pub fn reduce(redop: ReductionOpId) -> Self {
        Self {
            privilege: Privilege::Reduce,
            coherence: Coherence::Exclusive,
            redop: Some(redop),
        }
    }

    /// Same usage with a different coherence annotation.
    #[must_use]
    pub fn with_coherence(mut self, coherence: Coherence) -> Self {
        self.coherence = coherence;
        self
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.privilege == Privilege::ReadOnly
    }

    #[must_use]
    pub fn is_reduce(&self) -> bool {
        self.privilege == Privilege::Reduce
    }

    /// True iff this access mutates the instance.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(
            self.privilege,
            Privilege::ReadWrite | Privilege::WriteOnly | Privilege::Reduce
        )
    }

    /// Baseline conflict test between two usages over overlapping
    /// field+domain cells.
    ///
    /// - Two read-only accesses never conflict.
    /// - Two reductions conflict iff their operators differ.
    /// - Two simultaneous-coherence accesses never conflict; the coherence
    ///   contract puts the ordering burden on the caller.
    /// - Every other combination with at least one writer conflicts.
    #[must_use]
    pub fn conflicts_with(&self, other: &Self) -> bool {
        if self.is_read_only() && other.is_read_only() {
            return false;
        }
        if self.is_reduce() && other.is_reduce() {
            return self.redop != other.redop;
        }
        if self.coherence == Coherence::Simultaneous
            && other.coherence == Coherence::Simultaneous
        {
            return false;
        }
        true
    }
}
