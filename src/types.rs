//! Point, axis and box value types shared by every tree operation.
//!
//! The tree only ever looks at three `f32` coordinates of a point, plus an
//! optional application-defined "covered" tag. Anything implementing
//! [`KdPoint`] can be stored.

use serde::{Deserialize, Serialize};

/// Two points are considered identical when every coordinate differs by less
/// than this.
pub const POINT_EPSILON: f32 = 1e-6;

/// A point that can be stored in an [`IkdTree`](crate::IkdTree).
pub trait KdPoint: Copy + Send + Sync + 'static {
    fn x(&self) -> f32;
    fn y(&self) -> f32;
    fn z(&self) -> f32;

    /// Returns a copy of `self` carrying new coordinates.
    ///
    /// Used when downsampling replaces a raw point by its voxel centroid, so
    /// any payload besides the coordinates is preserved from the raw point.
    fn with_coords(&self, x: f32, y: f32, z: f32) -> Self;

    /// Application-defined tag, see [`IkdTree::set_covered_points`](crate::IkdTree::set_covered_points).
    fn covered(&self) -> bool {
        false
    }

    fn set_covered(&mut self, _covered: bool) {}

    #[inline]
    fn coord(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.x(),
            Axis::Y => self.y(),
            Axis::Z => self.z(),
        }
    }

    #[inline]
    fn is_finite(&self) -> bool {
        self.x().is_finite() && self.y().is_finite() && self.z().is_finite()
    }
}

/// The default point type: three coordinates and a covered tag.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default)]
    pub covered: bool,
}

impl Point3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            x,
            y,
            z,
            covered: false,
        }
    }
}

impl KdPoint for Point3 {
    #[inline]
    fn x(&self) -> f32 {
        self.x
    }

    #[inline]
    fn y(&self) -> f32 {
        self.y
    }

    #[inline]
    fn z(&self) -> f32 {
        self.z
    }

    fn with_coords(&self, x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, ..*self }
    }

    fn covered(&self) -> bool {
        self.covered
    }

    fn set_covered(&mut self, covered: bool) {
        self.covered = covered;
    }
}

impl From<[f32; 3]> for Point3 {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self::new(x, y, z)
    }
}

impl From<(f32, f32, f32)> for Point3 {
    fn from((x, y, z): (f32, f32, f32)) -> Self {
        Self::new(x, y, z)
    }
}

/// Coordinate-wise equality within [`POINT_EPSILON`].
#[inline]
pub fn same_point<A: KdPoint, B: KdPoint>(a: &A, b: &B) -> bool {
    (a.x() - b.x()).abs() < POINT_EPSILON
        && (a.y() - b.y()).abs() < POINT_EPSILON
        && (a.z() - b.z()).abs() < POINT_EPSILON
}

#[inline]
pub fn distance_sq<A: KdPoint, B: KdPoint>(a: &A, b: &B) -> f32 {
    let dx = a.x() - b.x();
    let dy = a.y() - b.y();
    let dz = a.z() - b.z();
    dx * dx + dy * dy + dz * dz
}

/// Division axis of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Axis {
    #[default]
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Axis used by a leaf inserted below a node split on `self`.
    pub const fn next(self) -> Axis {
        match self {
            Axis::X => Axis::Y,
            Axis::Y => Axis::Z,
            Axis::Z => Axis::X,
        }
    }
}

/// An axis-aligned 3D box.
///
/// Range queries treat the box as half-open: a point is inside when
/// `min <= p < max` on every axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox3D {
    pub min_x: f32,
    pub min_y: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_y: f32,
    pub max_z: f32,
}

impl Default for BoundingBox3D {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox3D {
    /// Create a box from its minimum and maximum corners.
    ///
    /// ```
    /// use ikdtree::BoundingBox3D;
    ///
    /// let bbox = BoundingBox3D::new(0.0, 0.0, 0.0, 1.0, 2.0, 3.0);
    /// assert_eq!(bbox.volume(), 6.0);
    /// ```
    pub const fn new(
        min_x: f32,
        min_y: f32,
        min_z: f32,
        max_x: f32,
        max_y: f32,
        max_z: f32,
    ) -> Self {
        Self {
            min_x,
            min_y,
            min_z,
            max_x,
            max_y,
            max_z,
        }
    }

    /// The inverted box that contains nothing and is the identity of [`union`](Self::union).
    pub const fn empty() -> Self {
        Self::new(
            f32::INFINITY,
            f32::INFINITY,
            f32::INFINITY,
            f32::NEG_INFINITY,
            f32::NEG_INFINITY,
            f32::NEG_INFINITY,
        )
    }

    pub fn from_point<P: KdPoint>(p: &P) -> Self {
        Self::new(p.x(), p.y(), p.z(), p.x(), p.y(), p.z())
    }

    /// Cube of half-width `half` around `p`.
    pub fn around<P: KdPoint>(p: &P, half: f32) -> Self {
        Self::new(
            p.x() - half,
            p.y() - half,
            p.z() - half,
            p.x() + half,
            p.y() + half,
            p.z() + half,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y || self.min_z > self.max_z
    }

    pub fn center(&self) -> (f32, f32, f32) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
            (self.min_z + self.max_z) / 2.0,
        )
    }

    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }

    pub fn depth(&self) -> f32 {
        self.max_z - self.min_z
    }

    pub fn volume(&self) -> f32 {
        self.width() * self.height() * self.depth()
    }

    /// Half-open containment: `min <= p < max` on every axis.
    pub fn contains_point(&self, x: f32, y: f32, z: f32) -> bool {
        self.min_x <= x
            && x < self.max_x
            && self.min_y <= y
            && y < self.max_y
            && self.min_z <= z
            && z < self.max_z
    }

    #[inline]
    pub fn contains<P: KdPoint>(&self, p: &P) -> bool {
        self.contains_point(p.x(), p.y(), p.z())
    }

    /// Closed-interval overlap test between two boxes.
    pub fn intersects(&self, other: &BoundingBox3D) -> bool {
        !(self.max_x < other.min_x
            || self.min_x > other.max_x
            || self.max_y < other.min_y
            || self.min_y > other.max_y
            || self.max_z < other.min_z
            || self.min_z > other.max_z)
    }

    /// True when no point inside `bounds` can be inside `self`.
    pub(crate) fn excludes(&self, bounds: &BoundingBox3D) -> bool {
        self.max_x <= bounds.min_x
            || self.min_x > bounds.max_x
            || self.max_y <= bounds.min_y
            || self.min_y > bounds.max_y
            || self.max_z <= bounds.min_z
            || self.min_z > bounds.max_z
    }

    /// True when every point inside `bounds` is inside `self`.
    pub(crate) fn covers(&self, bounds: &BoundingBox3D) -> bool {
        self.min_x <= bounds.min_x
            && bounds.max_x < self.max_x
            && self.min_y <= bounds.min_y
            && bounds.max_y < self.max_y
            && self.min_z <= bounds.min_z
            && bounds.max_z < self.max_z
    }

    pub fn expand(&self, amount: f32) -> Self {
        Self::new(
            self.min_x - amount,
            self.min_y - amount,
            self.min_z - amount,
            self.max_x + amount,
            self.max_y + amount,
            self.max_z + amount,
        )
    }

    pub fn union(&self, other: &BoundingBox3D) -> Self {
        Self::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.min_z.min(other.min_z),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
            self.max_z.max(other.max_z),
        )
    }

    pub fn include<P: KdPoint>(&mut self, p: &P) {
        self.min_x = self.min_x.min(p.x());
        self.min_y = self.min_y.min(p.y());
        self.min_z = self.min_z.min(p.z());
        self.max_x = self.max_x.max(p.x());
        self.max_y = self.max_y.max(p.y());
        self.max_z = self.max_z.max(p.z());
    }

    /// Extent along `axis`.
    pub fn span(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.width(),
            Axis::Y => self.height(),
            Axis::Z => self.depth(),
        }
    }

    /// Squared distance from `p` to the closest point of the box, zero inside.
    pub fn distance_sq_to<P: KdPoint>(&self, p: &P) -> f32 {
        fn gap(v: f32, lo: f32, hi: f32) -> f32 {
            if v < lo {
                lo - v
            } else if v > hi {
                v - hi
            } else {
                0.0
            }
        }
        let dx = gap(p.x(), self.min_x, self.max_x);
        let dy = gap(p.y(), self.min_y, self.max_y);
        let dz = gap(p.z(), self.min_z, self.max_z);
        dx * dx + dy * dy + dz * dz
    }

    /// Squared half-diagonal, zero for an empty box.
    pub fn half_diagonal_sq(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let (w, h, d) = (self.width() / 2.0, self.height() / 2.0, self.depth() / 2.0);
        w * w + h * h + d * d
    }
}

/// Integer voxel coordinates of a point, `floor(coord / voxel_size)` per axis.
///
/// Flooring keeps negative coordinates in consistent buckets: `-0.1` and
/// `-0.05` share voxel `-1` at size `0.2`, rather than voxel `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoxelKey {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl VoxelKey {
    /// Voxel of `p`. Indices beyond the `i64` range saturate; use
    /// [`try_of`](Self::try_of) to detect that.
    pub fn of<P: KdPoint>(p: &P, voxel_size: f32) -> Self {
        Self {
            x: (p.x() / voxel_size).floor() as i64,
            y: (p.y() / voxel_size).floor() as i64,
            z: (p.z() / voxel_size).floor() as i64,
        }
    }

    /// Voxel of `p`, or `None` when an index does not fit in an `i64`.
    pub fn try_of<P: KdPoint>(p: &P, voxel_size: f32) -> Option<Self> {
        let index = |v: f32| {
            let k = (v / voxel_size).floor();
            // i64::MAX as f32 rounds up to 2^63, which is itself out of range.
            (k >= i64::MIN as f32 && k < i64::MAX as f32).then_some(k as i64)
        };
        Some(Self {
            x: index(p.x())?,
            y: index(p.y())?,
            z: index(p.z())?,
        })
    }

    /// The half-open box `[key * size, (key + 1) * size)`.
    pub fn bounds(&self, voxel_size: f32) -> BoundingBox3D {
        let at = |k: i64, offset: f64| ((k as f64 + offset) * f64::from(voxel_size)) as f32;
        BoundingBox3D::new(
            at(self.x, 0.0),
            at(self.y, 0.0),
            at(self.z, 0.0),
            at(self.x, 1.0),
            at(self.y, 1.0),
            at(self.z, 1.0),
        )
    }

    pub fn centroid(&self, voxel_size: f32) -> (f32, f32, f32) {
        let mid = |k: i64| ((k as f64 + 0.5) * f64::from(voxel_size)) as f32;
        (mid(self.x), mid(self.y), mid(self.z))
    }
}
