//! Voxel records stored in the map layers, plus their wire form.

use serde::{Deserialize, Serialize};

use crate::geometry::{BlockIndex, Color, Point3};
use crate::Label;

/// One voxel of the geometric (truncated signed distance) layer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TsdfVoxel {
    /// Signed distance to the closest observed surface (metres).
    pub distance: f32,
    /// Accumulated observation weight; `0.0` means never observed.
    pub weight: f32,
    pub color: Color,
}

impl TsdfVoxel {
    pub fn is_observed(&self) -> bool {
        self.weight > 0.0
    }
}

/// One voxel of the label layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelVoxel {
    pub label: Label,
    /// Number of consistent observations backing `label`.
    pub confidence: u32,
}

/// A 3-D feature point with its descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature3D {
    pub position: Point3,
    #[serde(default)]
    pub descriptor: Vec<f32>,
}

/// Serialisable copy of the allocated blocks of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSnapshot<V> {
    pub voxel_size: f32,
    pub voxels_per_side: usize,
    pub blocks: Vec<BlockSnapshot<V>>,
}

impl<V> LayerSnapshot<V> {
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// One allocated block in a [`LayerSnapshot`], voxels in x-fastest order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSnapshot<V> {
    pub index: BlockIndex,
    pub voxels: Vec<V>,
}
