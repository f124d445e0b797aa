use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::errors::{IndexError, IndexResult};

/// Largest dimensionality an envelope may have; the header stores it in one byte.
pub const MAX_DIMENSIONS: usize = 255;

/// An axis-aligned box in D dimensions, described by its lower and upper corners.
///
/// Boundaries are closed: two boxes that only touch on an edge intersect.
///
/// # Examples
///
/// ```rust
/// use rtree_index::Bounds;
///
/// let a = Bounds::new(vec![0.0, 0.0], vec![10.0, 10.0]).unwrap();
/// let b = Bounds::new(vec![10.0, 10.0], vec![20.0, 20.0]).unwrap();
/// assert!(a.intersects(&b));
/// assert_eq!(a.merge(&b).area(), 400.0);
/// ```
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Bounds {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Eq for Bounds {}

impl Hash for Bounds {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for value in self.lower.iter().chain(self.upper.iter()) {
            value.to_bits().hash(state);
        }
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bounds({:?} .. {:?})", self.lower, self.upper)
    }
}

impl AsRef<Bounds> for Bounds {
    fn as_ref(&self) -> &Bounds {
        self
    }
}

impl Bounds {
    /// Creates a box from its corners.
    ///
    /// Both corners must have the same length between 1 and [`MAX_DIMENSIONS`],
    /// contain no NaN, and satisfy `lower[i] <= upper[i]` on every axis.
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> IndexResult<Self> {
        if lower.len() != upper.len() {
            return Err(IndexError::InvalidEnvelope(format!(
                "corner lengths differ: {} vs {}",
                lower.len(),
                upper.len()
            )));
        }
        if lower.is_empty() || lower.len() > MAX_DIMENSIONS {
            return Err(IndexError::InvalidEnvelope(format!(
                "dimensionality must be between 1 and {}, got {}",
                MAX_DIMENSIONS,
                lower.len()
            )));
        }
        for (axis, (lo, hi)) in lower.iter().zip(upper.iter()).enumerate() {
            if lo.is_nan() || hi.is_nan() {
                return Err(IndexError::InvalidEnvelope(format!(
                    "NaN coordinate on axis {}",
                    axis
                )));
            }
            if lo > hi {
                return Err(IndexError::InvalidEnvelope(format!(
                    "lower bound {} exceeds upper bound {} on axis {}",
                    lo, hi, axis
                )));
            }
        }
        Ok(Self { lower, upper })
    }

    /// A degenerate box covering a single point.
    pub fn point(coords: Vec<f64>) -> IndexResult<Self> {
        Self::new(coords.clone(), coords)
    }

    /// The identity element for [`Bounds::merge`]: it contains nothing and
    /// merging it with any box yields that box.
    pub fn empty(dimensions: usize) -> Self {
        Self {
            lower: vec![f64::INFINITY; dimensions],
            upper: vec![f64::NEG_INFINITY; dimensions],
        }
    }

    /// A box covering all of D-dimensional space.
    pub fn everything(dimensions: usize) -> Self {
        Self {
            lower: vec![f64::NEG_INFINITY; dimensions],
            upper: vec![f64::INFINITY; dimensions],
        }
    }

    /// Smallest box containing every box in `boxes`, or the empty box if there are none.
    pub fn union_of<'a>(dimensions: usize, boxes: impl IntoIterator<Item = &'a Bounds>) -> Self {
        let mut result = Self::empty(dimensions);
        for b in boxes {
            result.expand(b);
        }
        result
    }

    pub fn dimensions(&self) -> usize {
        self.lower.len()
    }

    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    pub fn is_empty(&self) -> bool {
        self.lower.iter().zip(self.upper.iter()).any(|(lo, hi)| lo > hi)
    }

    /// Closed-interval overlap on every axis.
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .zip(other.lower.iter().zip(other.upper.iter()))
            .all(|((lo, hi), (olo, ohi))| lo <= ohi && olo <= hi)
    }

    /// Whether `other` lies entirely inside this box, boundaries included.
    pub fn contains(&self, other: &Bounds) -> bool {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .zip(other.lower.iter().zip(other.upper.iter()))
            .all(|((lo, hi), (olo, ohi))| lo <= olo && ohi <= hi)
    }

    /// Product of the extents. Zero for degenerate boxes, zero for the empty box.
    pub fn area(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.lower
            .iter()
            .zip(self.upper.iter())
            .map(|(lo, hi)| hi - lo)
            .product()
    }

    /// Sum of the extents.
    pub fn margin(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.lower
            .iter()
            .zip(self.upper.iter())
            .map(|(lo, hi)| hi - lo)
            .sum()
    }

    /// How much the area grows when this box is stretched to cover `other`.
    pub fn enlargement(&self, other: &Bounds) -> f64 {
        self.merge(other).area() - self.area()
    }

    pub fn merge(&self, other: &Bounds) -> Bounds {
        let mut merged = self.clone();
        merged.expand(other);
        merged
    }

    pub fn expand(&mut self, other: &Bounds) {
        for (lo, olo) in self.lower.iter_mut().zip(other.lower.iter()) {
            *lo = lo.min(*olo);
        }
        for (hi, ohi) in self.upper.iter_mut().zip(other.upper.iter()) {
            *hi = hi.max(*ohi);
        }
    }
}

/// Identifier of the coordinate reference system an envelope is expressed in.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ReferenceSystem(String);

impl ReferenceSystem {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl Default for ReferenceSystem {
    fn default() -> Self {
        Self::new("EPSG:4326")
    }
}

impl fmt::Display for ReferenceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An envelope tagged with an identifier and a reference system.
///
/// Equality and hashing consider the identifier only, so a set of named
/// envelopes behaves like a map keyed by identifier. Use [`NamedEnvelope::same_as`]
/// to compare every field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamedEnvelope {
    identifier: String,
    bounds: Bounds,
    reference_system: ReferenceSystem,
    duplicate_count: u32,
}

impl NamedEnvelope {
    pub fn new(
        identifier: impl Into<String>,
        bounds: Bounds,
        reference_system: ReferenceSystem,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            bounds,
            reference_system,
            duplicate_count: 1,
        }
    }

    /// Number of source features that collapsed onto this envelope.
    pub fn with_duplicate_count(mut self, duplicate_count: u32) -> Self {
        self.duplicate_count = duplicate_count;
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn reference_system(&self) -> &ReferenceSystem {
        &self.reference_system
    }

    pub fn duplicate_count(&self) -> u32 {
        self.duplicate_count
    }

    pub fn dimensions(&self) -> usize {
        self.bounds.dimensions()
    }

    /// Full structural equality, unlike `==`.
    pub fn same_as(&self, other: &NamedEnvelope) -> bool {
        self.identifier == other.identifier
            && self.bounds == other.bounds
            && self.reference_system == other.reference_system
            && self.duplicate_count == other.duplicate_count
    }
}

impl PartialEq for NamedEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for NamedEnvelope {}

impl Hash for NamedEnvelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl AsRef<Bounds> for NamedEnvelope {
    fn as_ref(&self) -> &Bounds {
        &self.bounds
    }
}

impl fmt::Display for NamedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.identifier, self.bounds, self.reference_system)
    }
}
