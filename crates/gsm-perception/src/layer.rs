//! Block-sparse voxel layers.
//!
//! Space is partitioned into cubic blocks of `voxels_per_side³` voxels.  Only
//! blocks that were touched by an observation are allocated, so memory grows
//! with the observed surface rather than with the bounding volume.
//!
//! # Key types
//!
//! | Type | Role |
//! |------|------|
//! | [`Block`]        | Dense voxel array of one block.                      |
//! | [`Layer`]        | Map from [`BlockIndex`] to [`Block`].                |
//! | [`FeatureLayer`] | Feature points bucketed by block.                    |
//!
//! # Example
//!
//! ```rust
//! use gsm_perception::layer::Layer;
//! use gsm_types::{Point3, TsdfVoxel};
//!
//! let mut layer: Layer<TsdfVoxel> = Layer::new(0.1, 8);
//! layer.voxel_mut_or_allocate(Point3::new(0.05, 0.05, 0.05)).weight = 1.0;
//!
//! assert_eq!(layer.allocated_block_count(), 1);
//! assert!(layer.voxel_at(Point3::new(0.05, 0.05, 0.05)).unwrap().is_observed());
//! ```

use std::collections::HashMap;

use gsm_types::voxel::BlockSnapshot;
use gsm_types::{BlockIndex, Feature3D, LayerSnapshot, Point3};

// ────────────────────────────────────────────────────────────────────────────
// Block
// ────────────────────────────────────────────────────────────────────────────

/// Dense voxel storage of one block, x-fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct Block<V> {
    voxels: Vec<V>,
}

impl<V: Clone + Default> Block<V> {
    fn new(voxel_count: usize) -> Self {
        Self {
            voxels: vec![V::default(); voxel_count],
        }
    }
}

impl<V> Block<V> {
    pub fn voxels(&self) -> &[V] {
        &self.voxels
    }

    pub fn voxels_mut(&mut self) -> &mut [V] {
        &mut self.voxels
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Layer
// ────────────────────────────────────────────────────────────────────────────

/// A block-sparse voxel grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer<V> {
    voxel_size: f32,
    voxels_per_side: usize,
    blocks: HashMap<BlockIndex, Block<V>>,
}

impl<V: Clone + Default> Layer<V> {
    /// Create an empty layer.
    pub fn new(voxel_size: f32, voxels_per_side: usize) -> Self {
        Self {
            voxel_size,
            voxels_per_side,
            blocks: HashMap::new(),
        }
    }

    /// Empty layer with the same geometry as `self`.
    pub fn empty_like(&self) -> Self {
        Self::new(self.voxel_size, self.voxels_per_side)
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    pub fn voxels_per_side(&self) -> usize {
        self.voxels_per_side
    }

    /// Edge length of one block.
    pub fn block_size(&self) -> f32 {
        self.voxel_size * self.voxels_per_side as f32
    }

    pub fn voxels_per_block(&self) -> usize {
        self.voxels_per_side * self.voxels_per_side * self.voxels_per_side
    }

    pub fn allocated_block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Indices of all allocated blocks, sorted for deterministic iteration.
    pub fn block_indices(&self) -> Vec<BlockIndex> {
        let mut indices: Vec<BlockIndex> = self.blocks.keys().copied().collect();
        indices.sort();
        indices
    }

    pub fn block(&self, index: BlockIndex) -> Option<&Block<V>> {
        self.blocks.get(&index)
    }

    pub fn block_mut(&mut self, index: BlockIndex) -> Option<&mut Block<V>> {
        self.blocks.get_mut(&index)
    }

    /// Return the block at `index`, allocating it with default voxels first
    /// when needed.
    pub fn allocate_block(&mut self, index: BlockIndex) -> &mut Block<V> {
        let count = self.voxels_per_block();
        self.blocks.entry(index).or_insert_with(|| Block::new(count))
    }

    /// Drop the block at `index`.  Returns `true` when it existed.
    pub fn remove_block(&mut self, index: BlockIndex) -> bool {
        self.blocks.remove(&index).is_some()
    }

    pub fn has_block(&self, index: BlockIndex) -> bool {
        self.blocks.contains_key(&index)
    }

    /// Block index and linear voxel index of the voxel containing `p`.
    pub fn locate(&self, p: Point3) -> (BlockIndex, usize) {
        let block_size = self.block_size();
        let index = BlockIndex::containing(p, block_size);
        let local = p.sub(index.origin(block_size));
        let last = self.voxels_per_side as i64 - 1;
        let cell = |v: f32| ((v / self.voxel_size).floor() as i64).clamp(0, last) as usize;
        let (cx, cy, cz) = (cell(local.x), cell(local.y), cell(local.z));
        let n = self.voxels_per_side;
        (index, cx + n * (cy + n * cz))
    }

    /// World-frame centre of voxel `linear` in block `index`.
    pub fn voxel_center(&self, index: BlockIndex, linear: usize) -> Point3 {
        let n = self.voxels_per_side;
        let (cx, cy, cz) = (linear % n, (linear / n) % n, linear / (n * n));
        let origin = index.origin(self.block_size());
        Point3::new(
            origin.x + (cx as f32 + 0.5) * self.voxel_size,
            origin.y + (cy as f32 + 0.5) * self.voxel_size,
            origin.z + (cz as f32 + 0.5) * self.voxel_size,
        )
    }

    /// The voxel containing `p`, if its block is allocated.
    pub fn voxel_at(&self, p: Point3) -> Option<&V> {
        let (index, linear) = self.locate(p);
        self.blocks.get(&index).and_then(|b| b.voxels.get(linear))
    }

    /// Mutable access to the voxel containing `p`, allocating its block.
    pub fn voxel_mut_or_allocate(&mut self, p: Point3) -> &mut V {
        let (index, linear) = self.locate(p);
        &mut self.allocate_block(index).voxels[linear]
    }

    /// Copy `block` in at `index`, replacing any existing block.
    pub fn insert_block(&mut self, index: BlockIndex, block: Block<V>) {
        self.blocks.insert(index, block);
    }

    /// Serialisable copy of every allocated block.
    pub fn snapshot(&self) -> LayerSnapshot<V> {
        LayerSnapshot {
            voxel_size: self.voxel_size,
            voxels_per_side: self.voxels_per_side,
            blocks: self
                .block_indices()
                .into_iter()
                .filter_map(|index| {
                    self.blocks.get(&index).map(|b| BlockSnapshot {
                        index,
                        voxels: b.voxels.clone(),
                    })
                })
                .collect(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FeatureLayer
// ────────────────────────────────────────────────────────────────────────────

/// Feature points bucketed by the block that contains them.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureLayer {
    block_size: f32,
    blocks: HashMap<BlockIndex, Vec<Feature3D>>,
}

impl FeatureLayer {
    pub fn new(block_size: f32) -> Self {
        Self {
            block_size,
            blocks: HashMap::new(),
        }
    }

    pub fn empty_like(&self) -> Self {
        Self::new(self.block_size)
    }

    pub fn insert(&mut self, feature: Feature3D) {
        let index = BlockIndex::containing(feature.position, self.block_size);
        self.blocks.entry(index).or_default().push(feature);
    }

    pub fn features_in(&self, index: BlockIndex) -> &[Feature3D] {
        self.blocks.get(&index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn remove_block(&mut self, index: BlockIndex) -> bool {
        self.blocks.remove(&index).is_some()
    }

    /// Total number of features across all blocks.
    pub fn len(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every feature, ordered by block index.
    pub fn all_features(&self) -> Vec<Feature3D> {
        let mut indices: Vec<&BlockIndex> = self.blocks.keys().collect();
        indices.sort();
        indices
            .into_iter()
            .flat_map(|i| self.blocks[i].iter().cloned())
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
