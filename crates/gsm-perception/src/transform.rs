//! Transform Frame (TF) Engine.
//!
//! Keeps the latest rigid-body transform between named frames (`world`,
//! `camera`, `sliding_window`, ...) and composes chains of them on lookup.
//! Sensor observations feed the `world → camera` edge; the sliding window
//! queries it to find the current reference pose.
//!
//! # Example
//!
//! ```rust
//! use gsm_perception::transform::{TfEngine, Transform3D, Quaternion};
//! use gsm_types::Point3;
//!
//! let mut tf = TfEngine::new();
//! tf.set_transform("world", "base",
//!     Transform3D::new(Point3::new(1.0, 0.0, 0.0), Quaternion::identity()));
//! tf.set_transform("base", "camera",
//!     Transform3D::new(Point3::new(0.5, 0.0, 0.0), Quaternion::identity()));
//!
//! let t = tf.lookup("world", "camera").unwrap();
//! assert!((t.translation.x - 1.5).abs() < 1e-5);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use gsm_types::{Point3, Pose};

// ────────────────────────────────────────────────────────────────────────────
// Quaternion
// ────────────────────────────────────────────────────────────────────────────

/// A unit quaternion representing a 3-D rotation (w, x, y, z convention).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    /// Create a quaternion.  The caller is responsible for providing a unit
    /// quaternion (|q| = 1).
    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    /// The identity rotation.
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Rotation of `yaw` radians about +Z.
    pub fn from_yaw(yaw: f32) -> Self {
        let half = yaw * 0.5;
        Self::new(half.cos(), 0.0, 0.0, half.sin())
    }

    /// Hamilton product: compose two rotations.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        )
    }

    /// Conjugate (== inverse for a unit quaternion).
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Rotate a vector: p' = q * p * q*.
    pub fn rotate(self, v: Point3) -> Point3 {
        let p = Self::new(0.0, v.x, v.y, v.z);
        let rotated = self.mul(p).mul(self.conjugate());
        Point3::new(rotated.x, rotated.y, rotated.z)
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.w, self.x, self.y, self.z]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transform3D
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body transform: pose of frame B expressed in frame A.
///
/// To map a point from B into A, rotate it by `rotation` then add
/// `translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3D {
    pub translation: Point3,
    pub rotation: Quaternion,
}

impl Transform3D {
    pub fn new(translation: Point3, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Point3::zero(), Quaternion::identity())
    }

    /// Build from a wire [`Pose`].
    pub fn from_pose(pose: &Pose) -> Self {
        let [w, x, y, z] = pose.rotation;
        Self::new(pose.translation, Quaternion::new(w, x, y, z))
    }

    pub fn to_pose(self) -> Pose {
        Pose::new(self.translation, self.rotation.to_array())
    }

    /// Compose two transforms: if `self` = T_A_B and `other` = T_B_C the
    /// result is T_A_C.
    pub fn compose(self, other: Self) -> Self {
        let translated = self.translation.add(self.rotation.rotate(other.translation));
        let rotated = self.rotation.mul(other.rotation);
        Self::new(translated, rotated)
    }

    /// Map a point from the child frame into the parent frame.
    pub fn apply(self, p: Point3) -> Point3 {
        self.translation.add(self.rotation.rotate(p))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TfEngine
// ────────────────────────────────────────────────────────────────────────────

/// Directed graph of named frames and the latest [`Transform3D`] on each
/// edge.  Adding `A → B` does not create the inverse edge.
#[derive(Debug, Default)]
pub struct TfEngine {
    /// `edges[parent][child] = T_parent_child`
    edges: HashMap<String, HashMap<String, Transform3D>>,
}

impl TfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update the transform from `parent_frame` to `child_frame`.
    pub fn set_transform(&mut self, parent_frame: &str, child_frame: &str, transform: Transform3D) {
        self.edges
            .entry(parent_frame.to_string())
            .or_default()
            .insert(child_frame.to_string(), transform);
    }

    /// Compose the transform that maps points in `target_frame` into
    /// `source_frame` (i.e. the pose of `target_frame` in `source_frame`).
    ///
    /// Returns `None` if no path exists.
    pub fn lookup(&self, source_frame: &str, target_frame: &str) -> Option<Transform3D> {
        if source_frame == target_frame {
            return Some(Transform3D::identity());
        }

        // BFS; each queue item carries the transform composed so far.
        let mut queue: VecDeque<(&str, Transform3D)> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();
        queue.push_back((source_frame, Transform3D::identity()));
        visited.insert(source_frame);

        while let Some((current, accumulated)) = queue.pop_front() {
            let Some(neighbours) = self.edges.get(current) else {
                continue;
            };
            for (next, edge_tf) in neighbours {
                if !visited.insert(next.as_str()) {
                    continue;
                }
                let composed = accumulated.compose(*edge_tf);
                if next == target_frame {
                    return Some(composed);
                }
                queue.push_back((next.as_str(), composed));
            }
        }

        None
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
