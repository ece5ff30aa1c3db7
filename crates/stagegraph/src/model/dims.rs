//! Named tensor axes, axis-keyed values and physical memory orders.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on the number of axes a tensor may carry.
pub const MAX_DIMS: usize = 5;

/// Named tensor axis. The declaration order is the canonical innermost-first order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dim {
    W,
    H,
    C,
    N,
    D,
}

impl Dim {
    /// All axes, innermost first.
    pub const ALL: [Dim; MAX_DIMS] = [Dim::W, Dim::H, Dim::C, Dim::N, Dim::D];

    pub fn code(self) -> u8 {
        match self {
            Dim::W => 0,
            Dim::H => 1,
            Dim::C => 2,
            Dim::N => 3,
            Dim::D => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Dim> {
        Dim::ALL.get(code as usize).copied()
    }

    pub fn as_char(self) -> char {
        match self {
            Dim::W => 'W',
            Dim::H => 'H',
            Dim::C => 'C',
            Dim::N => 'N',
            Dim::D => 'D',
        }
    }

    pub fn from_char(c: char) -> Option<Dim> {
        match c.to_ascii_uppercase() {
            'W' => Some(Dim::W),
            'H' => Some(Dim::H),
            'C' => Some(Dim::C),
            'N' => Some(Dim::N),
            'D' => Some(Dim::D),
            _ => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Axis-keyed values (extents, offsets or strides), iterated innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimValues(BTreeMap<Dim, usize>);

impl DimValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dim: Dim) -> Option<usize> {
        self.0.get(&dim).copied()
    }

    pub fn set(&mut self, dim: Dim, value: usize) {
        self.0.insert(dim, value);
    }

    pub fn has(&self, dim: Dim) -> bool {
        self.0.contains_key(&dim)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Dim, usize)> + '_ {
        self.0.iter().map(|(dim, value)| (*dim, *value))
    }

    pub fn dims(&self) -> impl Iterator<Item = Dim> + '_ {
        self.0.keys().copied()
    }

    /// Product of all values; `1` for an empty set.
    pub fn product(&self) -> usize {
        self.0.values().product()
    }
}

impl FromIterator<(Dim, usize)> for DimValues {
    fn from_iter<I: IntoIterator<Item = (Dim, usize)>>(iter: I) -> Self {
        DimValues(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(Dim, usize); N]> for DimValues {
    fn from(pairs: [(Dim, usize); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl fmt::Display for DimValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, (dim, value)) in self.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}:{value}")?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DimsOrderError {
    #[error("dims order must name at least one axis")]
    Empty,
    #[error("dims order names more than five axes")]
    TooManyAxes,
    #[error("axis {0} appears twice in dims order")]
    DuplicateAxis(Dim),
    #[error("unknown axis '{0}'")]
    UnknownAxis(char),
    #[error("invalid dims order code {0:#x}")]
    InvalidCode(u32),
}

/// Physical memory order of a tensor's axes.
///
/// Position 0 is the innermost (fastest varying) axis. The textual form lists axes outermost
/// first, so `"NCHW"` places `W` at position 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimsOrder {
    perm: Vec<Dim>,
}

impl DimsOrder {
    /// Builds an order from axes listed innermost first.
    pub fn from_dims(perm: impl IntoIterator<Item = Dim>) -> Result<Self, DimsOrderError> {
        let perm: Vec<Dim> = perm.into_iter().collect();
        if perm.is_empty() {
            return Err(DimsOrderError::Empty);
        }
        if perm.len() > MAX_DIMS {
            return Err(DimsOrderError::TooManyAxes);
        }
        for (idx, dim) in perm.iter().enumerate() {
            if perm[..idx].contains(dim) {
                return Err(DimsOrderError::DuplicateAxis(*dim));
            }
        }
        Ok(Self { perm })
    }

    /// Planar order over the axes present in `dims` (canonical `W, H, C, N, D` nesting).
    pub fn default_for(dims: &DimValues) -> Self {
        Self {
            perm: dims.dims().collect(),
        }
    }

    pub fn num_dims(&self) -> usize {
        self.perm.len()
    }

    /// Position of `dim`, counted from the innermost axis.
    pub fn dim_ind(&self, dim: Dim) -> Option<usize> {
        self.perm.iter().position(|d| *d == dim)
    }

    pub fn dim_at(&self, pos: usize) -> Option<Dim> {
        self.perm.get(pos).copied()
    }

    /// Axes innermost first.
    pub fn dims(&self) -> &[Dim] {
        &self.perm
    }

    /// Returns `true` when the order names exactly the axes present in `dims`.
    pub fn covers(&self, dims: &DimValues) -> bool {
        self.perm.len() == dims.len() && self.perm.iter().all(|dim| dims.has(*dim))
    }

    /// Packed wire code: one nibble per axis, innermost first, holding `axis code + 1`.
    pub fn code(&self) -> u32 {
        self.perm
            .iter()
            .enumerate()
            .fold(0u32, |acc, (pos, dim)| {
                acc | ((u32::from(dim.code()) + 1) << (4 * pos))
            })
    }

    pub fn from_code(code: u32) -> Result<Self, DimsOrderError> {
        let mut perm = Vec::new();
        let mut rest = code;
        while rest != 0 {
            let nibble = (rest & 0xF) as u8;
            let dim = nibble
                .checked_sub(1)
                .and_then(Dim::from_code)
                .ok_or(DimsOrderError::InvalidCode(code))?;
            perm.push(dim);
            rest >>= 4;
        }
        Self::from_dims(perm).map_err(|_| DimsOrderError::InvalidCode(code))
    }
}

impl FromStr for DimsOrder {
    type Err = DimsOrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut perm = Vec::with_capacity(s.len());
        for c in s.trim().chars().rev() {
            perm.push(Dim::from_char(c).ok_or(DimsOrderError::UnknownAxis(c))?);
        }
        Self::from_dims(perm)
    }
}

impl fmt::Display for DimsOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for dim in self.perm.iter().rev() {
            write!(f, "{dim}")?;
        }
        Ok(())
    }
}
