//! Bounding boxes for published objects.
//!
//! [`Aabb`] is the plain axis-aligned box.  [`oriented_bbox`] fits a box
//! that is rotated about the vertical axis only: the dominant horizontal
//! direction of the points is found with a 2-D principal component analysis
//! and the box is aligned to it.  Objects in an indoor scene rest on the
//! ground, so a yaw-only box is tight for most of them.
//!
//! # Example
//!
//! ```rust
//! use gsm_perception::bbox::Aabb;
//! use gsm_types::Point3;
//!
//! let b = Aabb::from_points([Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 1.0, 3.0)]).unwrap();
//! assert_eq!(b.centre(), Point3::new(1.0, 0.5, 1.5));
//! ```

use gsm_types::{BoundingBox, Label, Point3};

use crate::transform::Quaternion;

// ────────────────────────────────────────────────────────────────────────────
// Aabb
// ────────────────────────────────────────────────────────────────────────────

/// An axis-aligned bounding box, defined by its minimum and maximum corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point3,
    pub max: Point3,
}

impl Aabb {
    /// Create a bounding box from its two opposite corners.
    ///
    /// The constructor normalises the corners so that `min ≤ max` per axis.
    pub fn new(a: Point3, b: Point3) -> Self {
        Self {
            min: Point3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Point3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Smallest box containing every point; `None` for an empty input.
    pub fn from_points(points: impl IntoIterator<Item = Point3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        Some(iter.fold(Self::new(first, first), |b, p| b.expanded(p)))
    }

    /// Grow the box so that it contains `p`.
    pub fn expanded(self, p: Point3) -> Self {
        Self {
            min: Point3::new(self.min.x.min(p.x), self.min.y.min(p.y), self.min.z.min(p.z)),
            max: Point3::new(self.max.x.max(p.x), self.max.y.max(p.y), self.max.z.max(p.z)),
        }
    }

    pub fn centre(&self) -> Point3 {
        self.min.add(self.max).scale(0.5)
    }

    /// Edge lengths along x, y, z.
    pub fn extents(&self) -> Point3 {
        self.max.sub(self.min)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Yaw-aligned box
// ────────────────────────────────────────────────────────────────────────────

/// Fit a box rotated about +Z to `points`.
///
/// Returns `None` when `points` is empty.
pub fn oriented_bbox(label: Label, points: &[Point3]) -> Option<BoundingBox> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f32;
    let (mx, my) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (mx, my) = (mx / n, my / n);

    let (sxx, syy, sxy) = points.iter().fold((0.0, 0.0, 0.0), |(a, b, c), p| {
        let (dx, dy) = (p.x - mx, p.y - my);
        (a + dx * dx, b + dy * dy, c + dx * dy)
    });
    let yaw = 0.5 * (2.0 * sxy).atan2(sxx - syy);

    // Express the points in the box frame, fit an AABB there, map back.
    let rotation = Quaternion::from_yaw(yaw);
    let inverse = rotation.conjugate();
    let local = Aabb::from_points(points.iter().map(|p| inverse.rotate(*p)))?;

    Some(BoundingBox {
        label,
        center: rotation.rotate(local.centre()),
        orientation: rotation.to_array(),
        extents: local.extents(),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aabb_normalises_min_max() {
        let b = Aabb::new(Point3::new(2.0, 2.0, 2.0), Point3::new(0.0, 0.0, 0.0));
        assert_eq!(b.min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(b.max, Point3::new(2.0, 2.0, 2.0));
    }

    #[test]
    fn from_points_empty_is_none() {
        assert!(Aabb::from_points(std::iter::empty()).is_none());
        assert!(oriented_bbox(Label(1), &[]).is_none());
    }

    #[test]
    fn axis_aligned_cloud_keeps_identity_orientation() {
        let points = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(4.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 2.0),
            Point3::new(4.0, 1.0, 2.0),
        ];
        let bbox = oriented_bbox(Label(3), &points).unwrap();
        assert_eq!(bbox.label, Label(3));
        assert!((bbox.center.x - 2.0).abs() < 1e-4);
        assert!((bbox.center.y - 0.5).abs() < 1e-4);
        assert!((bbox.center.z - 1.0).abs() < 1e-4);
        assert!((bbox.extents.x - 4.0).abs() < 1e-4);
        assert!((bbox.extents.y - 1.0).abs() < 1e-4);
        assert!((bbox.orientation[0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn diagonal_cloud_is_rotated_45_degrees() {
        let points: Vec<Point3> = (0..10)
            .map(|i| Point3::new(i as f32, i as f32, 0.0))
            .collect();
        let bbox = oriented_bbox(Label(1), &points).unwrap();
        let expected_len = 9.0 * std::f32::consts::SQRT_2;
        assert!((bbox.extents.x - expected_len).abs() < 1e-3, "got {:?}", bbox.extents);
        assert!(bbox.extents.y.abs() < 1e-3);
        assert!((bbox.center.x - 4.5).abs() < 1e-3);
        assert!((bbox.center.y - 4.5).abs() < 1e-3);
    }
}
