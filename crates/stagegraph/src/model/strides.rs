//! Per-position stride constraints and their monotonic merge rule.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::dims::MAX_DIMS;

/// Stride constraint for one memory-order position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimStride {
    /// No constraint; the allocator picks the compact stride.
    #[default]
    Any,
    /// No padding between this position and the next inner one.
    Compact,
    /// Exact stride in bytes.
    Fixed(u32),
}

impl DimStride {
    /// Returns `true` for `Compact` and `Fixed`.
    pub fn is_concrete(self) -> bool {
        !matches!(self, DimStride::Any)
    }
}

impl fmt::Display for DimStride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimStride::Any => write!(f, "any"),
            DimStride::Compact => write!(f, "compact"),
            DimStride::Fixed(bytes) => write!(f, "fixed({bytes})"),
        }
    }
}

/// Two concrete demands disagree on one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrideConflict {
    pub pos: usize,
    pub existing: DimStride,
    pub demanded: DimStride,
}

/// Stride constraints indexed by position in the tensor's [`DimsOrder`](super::DimsOrder).
///
/// Constraints only tighten: `Any` may become `Compact` or `Fixed`, an equal concrete demand is
/// a no-op, and a different concrete demand is a [`StrideConflict`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StridesRequirement {
    slots: [DimStride; MAX_DIMS],
}

impl StridesRequirement {
    /// Requirement with every position unconstrained.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Requirement with every position compact (dense tensor).
    pub fn compact() -> Self {
        Self {
            slots: [DimStride::Compact; MAX_DIMS],
        }
    }

    /// Builder-style setter.
    pub fn add(mut self, pos: usize, stride: DimStride) -> Self {
        self.set(pos, stride);
        self
    }

    pub fn get(&self, pos: usize) -> DimStride {
        self.slots.get(pos).copied().unwrap_or_default()
    }

    /// Overwrites a position unconditionally; negotiation goes through [`Self::tighten`].
    pub fn set(&mut self, pos: usize, stride: DimStride) {
        if let Some(slot) = self.slots.get_mut(pos) {
            *slot = stride;
        }
    }

    /// Resets every position strictly greater than `pos` to `Any`.
    pub fn clear_above(&mut self, pos: usize) {
        for slot in self.slots.iter_mut().skip(pos + 1) {
            *slot = DimStride::Any;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| !slot.is_concrete())
    }

    /// Concrete positions in increasing order.
    pub fn concrete(&self) -> impl Iterator<Item = (usize, DimStride)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_concrete())
            .map(|(pos, slot)| (pos, *slot))
    }

    /// Merges one demand into `pos`; returns whether the requirement changed.
    pub fn tighten(&mut self, pos: usize, demanded: DimStride) -> Result<bool, StrideConflict> {
        let existing = self.get(pos);
        match (existing, demanded) {
            (_, DimStride::Any) => Ok(false),
            (DimStride::Any, _) => {
                self.set(pos, demanded);
                Ok(pos < MAX_DIMS)
            }
            (existing, demanded) if existing == demanded => Ok(false),
            (existing, demanded) => Err(StrideConflict {
                pos,
                existing,
                demanded,
            }),
        }
    }

    /// Merges every concrete position of `other`; stops at the first conflict.
    pub fn merge(&mut self, other: &StridesRequirement) -> Result<bool, StrideConflict> {
        let mut changed = false;
        for (pos, demanded) in other.concrete() {
            changed |= self.tighten(pos, demanded)?;
        }
        Ok(changed)
    }

    /// Checks a resolved stride against the constraint at `pos`.
    pub fn is_satisfied_by(&self, pos: usize, stride: usize, compact: usize) -> bool {
        match self.get(pos) {
            DimStride::Any => stride >= compact,
            DimStride::Compact => stride == compact,
            DimStride::Fixed(bytes) => stride == bytes as usize,
        }
    }
}

impl fmt::Display for StridesRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, slot) in self.slots.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{slot}")?;
        }
        write!(f, "]")
    }
}
