//! Geometric primitives shared across the workspace.
//!
//! | Type | Role |
//! |------|------|
//! | [`Point3`]     | A 3-D coordinate in the world frame.                   |
//! | [`Pose`]       | Sensor pose: translation plus unit quaternion.         |
//! | [`BlockIndex`] | Integer coordinate of a spatial block of voxels.       |
//! | [`Color`]      | 8-bit RGB colour used by voxels and meshes.            |

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Point3
// ────────────────────────────────────────────────────────────────────────────

/// A point in 3-D space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    /// Create a new point.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// The origin.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    /// Euclidean distance in 3-D.
    pub fn distance(self, other: Self) -> f32 {
        let d = self.sub(other);
        (d.x * d.x + d.y * d.y + d.z * d.z).sqrt()
    }

    /// Euclidean distance on the horizontal (x, y) plane; `z` is ignored.
    ///
    /// The sliding window is ground-relative, so every window test uses
    /// this metric.
    pub fn planar_distance(self, other: Self) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// Pose of the sensor frame in the world frame.
///
/// `rotation` is a unit quaternion in `(w, x, y, z)` order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub translation: Point3,
    #[serde(default = "identity_rotation")]
    pub rotation: [f32; 4],
}

fn identity_rotation() -> [f32; 4] {
    [1.0, 0.0, 0.0, 0.0]
}

impl Pose {
    pub fn new(translation: Point3, rotation: [f32; 4]) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// A pose at `translation` with no rotation.
    pub fn from_translation(translation: Point3) -> Self {
        Self::new(translation, identity_rotation())
    }

    pub fn identity() -> Self {
        Self::from_translation(Point3::zero())
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// BlockIndex
// ────────────────────────────────────────────────────────────────────────────

/// Integer coordinate of a cubic block of voxels.
///
/// Block `i` along an axis spans `[i * block_size, (i + 1) * block_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockIndex {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Index of the block containing `p` for blocks of edge `block_size`.
    pub fn containing(p: Point3, block_size: f32) -> Self {
        let inv = 1.0 / block_size;
        Self::new(
            (p.x * inv).floor() as i32,
            (p.y * inv).floor() as i32,
            (p.z * inv).floor() as i32,
        )
    }

    /// World-frame centre of this block.
    pub fn center(self, block_size: f32) -> Point3 {
        Point3::new(
            (self.x as f32 + 0.5) * block_size,
            (self.y as f32 + 0.5) * block_size,
            (self.z as f32 + 0.5) * block_size,
        )
    }

    /// World-frame minimum corner of this block.
    pub fn origin(self, block_size: f32) -> Point3 {
        Point3::new(
            self.x as f32 * block_size,
            self.y as f32 * block_size,
            self.z as f32 * block_size,
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Color
// ────────────────────────────────────────────────────────────────────────────

/// 8-bit RGB colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const GRAY: Color = Color::new(128, 128, 128);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Deterministic, well-spread colour for an integer id.
    ///
    /// Used to colour meshes by label, semantic class or instance so the same
    /// id always renders the same way.
    pub fn from_id(id: u32) -> Self {
        // Fibonacci hashing spreads consecutive ids across the hue circle.
        let hashed = id.wrapping_mul(0x9E37_79B9);
        let [a, b, c, _] = hashed.to_le_bytes();
        Self::new(a | 0x40, b | 0x40, c | 0x40)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planar_distance_ignores_height() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(3.0, 4.0, 100.0);
        assert!((a.planar_distance(b) - 5.0).abs() < 1e-6);
        assert!(a.distance(b) > 100.0);
    }

    #[test]
    fn block_index_floors_negative_coordinates() {
        let idx = BlockIndex::containing(Point3::new(-0.1, 0.5, 1.5), 1.0);
        assert_eq!(idx, BlockIndex::new(-1, 0, 1));
    }

    #[test]
    fn block_center_is_half_a_block_from_origin() {
        let c = BlockIndex::new(2, -1, 0).center(0.5);
        assert_eq!(c, Point3::new(1.25, -0.25, 0.25));
    }

    #[test]
    fn color_from_id_is_deterministic() {
        assert_eq!(Color::from_id(3), Color::from_id(3));
        assert_ne!(Color::from_id(3), Color::from_id(4));
    }

    #[test]
    fn pose_defaults_to_identity_rotation() {
        let pose: Pose =
            serde_json::from_str(r#"{"translation":{"x":1.0,"y":2.0,"z":0.0}}"#).unwrap();
        assert_eq!(pose.rotation, [1.0, 0.0, 0.0, 0.0]);
    }
}
