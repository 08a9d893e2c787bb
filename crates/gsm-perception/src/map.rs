//! The global segment map.
//!
//! [`GlobalMap`] is the single owned map-state object.  It holds the
//! geometric (TSDF), label and feature layers plus the bookkeeping the
//! pipeline needs around them:
//!
//! - the set of live [`Label`]s and the monotonic label counter,
//! - a revision counter per label, bumped whenever voxels of that label are
//!   written, so publishers can tell an unchanged object from a changed one,
//! - per-label semantic class tallies and instance ids,
//! - the set of blocks touched since the last mesh pass.
//!
//! Components never keep a private copy of the map; they receive `&GlobalMap`
//! or `&mut GlobalMap` per operation.

use std::collections::{BTreeSet, HashMap, HashSet};

use gsm_types::{BlockIndex, InstanceLabel, Label, LabelVoxel, SemanticLabel, TsdfVoxel};
use tracing::debug;

use crate::layer::{FeatureLayer, Layer};

/// Geometry of the map layers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapConfig {
    /// Voxel edge length in metres.
    pub voxel_size: f32,
    /// Voxels per block edge.
    pub voxels_per_side: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.05,
            voxels_per_side: 8,
        }
    }
}

/// The persistent 3-D semantic map.
#[derive(Debug, Clone)]
pub struct GlobalMap {
    tsdf: Layer<TsdfVoxel>,
    labels: Layer<LabelVoxel>,
    features: FeatureLayer,
    label_set: BTreeSet<Label>,
    next_label: u32,
    revisions: HashMap<Label, u64>,
    semantic_counts: HashMap<Label, HashMap<SemanticLabel, u32>>,
    instances: HashMap<Label, InstanceLabel>,
    touched: HashSet<BlockIndex>,
}

impl GlobalMap {
    pub fn new(config: MapConfig) -> Self {
        let tsdf = Layer::new(config.voxel_size, config.voxels_per_side);
        let block_size = tsdf.block_size();
        Self {
            labels: Layer::new(config.voxel_size, config.voxels_per_side),
            features: FeatureLayer::new(block_size),
            tsdf,
            label_set: BTreeSet::new(),
            next_label: 1,
            revisions: HashMap::new(),
            semantic_counts: HashMap::new(),
            instances: HashMap::new(),
            touched: HashSet::new(),
        }
    }

    // ── Layers ──────────────────────────────────────────────────────────────

    pub fn tsdf(&self) -> &Layer<TsdfVoxel> {
        &self.tsdf
    }

    pub fn labels(&self) -> &Layer<LabelVoxel> {
        &self.labels
    }

    pub fn features(&self) -> &FeatureLayer {
        &self.features
    }

    /// Mutable access to the geometric and label layers together.
    ///
    /// Writers must report the blocks they modify through
    /// [`mark_touched`][Self::mark_touched] and the labels they write through
    /// [`bump_revision`][Self::bump_revision].
    pub fn layers_mut(&mut self) -> (&mut Layer<TsdfVoxel>, &mut Layer<LabelVoxel>) {
        (&mut self.tsdf, &mut self.labels)
    }

    pub fn features_mut(&mut self) -> &mut FeatureLayer {
        &mut self.features
    }

    pub fn block_size(&self) -> f32 {
        self.tsdf.block_size()
    }

    pub fn is_empty(&self) -> bool {
        self.label_set.is_empty() && self.tsdf.is_empty()
    }

    // ── Labels ──────────────────────────────────────────────────────────────

    /// Allocate a fresh label and add it to the label set.
    pub fn allocate_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        self.label_set.insert(label);
        label
    }

    /// Add an externally allocated label, keeping the counter ahead of it.
    pub fn register_label(&mut self, label: Label) {
        if !label.is_assigned() {
            return;
        }
        self.next_label = self.next_label.max(label.0 + 1);
        self.label_set.insert(label);
    }

    pub fn contains_label(&self, label: Label) -> bool {
        self.label_set.contains(&label)
    }

    /// All live labels in ascending order.
    pub fn labels_list(&self) -> Vec<Label> {
        self.label_set.iter().copied().collect()
    }

    pub fn label_count(&self) -> usize {
        self.label_set.len()
    }

    /// Remove `label` and its bookkeeping.  Voxels are not touched.
    pub fn forget_label(&mut self, label: Label) {
        self.label_set.remove(&label);
        self.revisions.remove(&label);
        self.semantic_counts.remove(&label);
        self.instances.remove(&label);
    }

    pub fn revision(&self, label: Label) -> u64 {
        self.revisions.get(&label).copied().unwrap_or(0)
    }

    pub fn bump_revision(&mut self, label: Label) {
        *self.revisions.entry(label).or_insert(0) += 1;
    }

    // ── Semantics ───────────────────────────────────────────────────────────

    pub fn record_semantic(&mut self, label: Label, class: SemanticLabel) {
        *self
            .semantic_counts
            .entry(label)
            .or_default()
            .entry(class)
            .or_insert(0) += 1;
    }

    /// Most frequently observed class of `label`; ties go to the lowest id.
    pub fn dominant_semantic(&self, label: Label) -> Option<SemanticLabel> {
        self.semantic_counts.get(&label).and_then(|counts| {
            counts
                .iter()
                .max_by(|(ca, na), (cb, nb)| na.cmp(nb).then(cb.cmp(ca)))
                .map(|(class, _)| *class)
        })
    }

    pub fn record_instance(&mut self, label: Label, instance: InstanceLabel) {
        self.instances.insert(label, instance);
    }

    pub fn instance_of(&self, label: Label) -> Option<InstanceLabel> {
        self.instances.get(&label).copied()
    }

    // ── Blocks ──────────────────────────────────────────────────────────────

    pub fn mark_touched(&mut self, index: BlockIndex) {
        self.touched.insert(index);
    }

    /// Drain the blocks touched since the previous call, sorted.
    pub fn take_touched(&mut self) -> Vec<BlockIndex> {
        let mut blocks: Vec<BlockIndex> = self.touched.drain().collect();
        blocks.sort();
        blocks
    }

    pub fn clear_touched(&mut self) {
        self.touched.clear();
    }

    /// Remove a block from the geometric and label layers.
    pub fn remove_block(&mut self, index: BlockIndex) {
        let removed_tsdf = self.tsdf.remove_block(index);
        let removed_label = self.labels.remove_block(index);
        if removed_tsdf || removed_label {
            self.touched.insert(index);
        }
    }

    /// Blocks that hold at least one voxel of `label`, sorted.
    pub fn blocks_of_label(&self, label: Label) -> Vec<BlockIndex> {
        self.labels
            .block_indices()
            .into_iter()
            .filter(|index| {
                self.labels
                    .block(*index)
                    .is_some_and(|b| b.voxels().iter().any(|v| v.label == label))
            })
            .collect()
    }

    /// Rewrite every voxel of `from` to `into`, fold `from`'s semantic
    /// tallies into `into` and forget `from`.
    pub fn relabel(&mut self, from: Label, into: Label) {
        if from == into {
            return;
        }
        let blocks = self.blocks_of_label(from);
        debug!(from = %from, into = %into, blocks = blocks.len(), "relabelling voxels");
        for index in blocks {
            if let Some(block) = self.labels.block_mut(index) {
                for voxel in block.voxels_mut().iter_mut().filter(|v| v.label == from) {
                    voxel.label = into;
                }
            }
            self.touched.insert(index);
        }
        if let Some(counts) = self.semantic_counts.remove(&from) {
            let target = self.semantic_counts.entry(into).or_default();
            for (class, n) in counts {
                *target.entry(class).or_insert(0) += n;
            }
        }
        self.forget_label(from);
        self.bump_revision(into);
    }
}

impl Default for GlobalMap {
    fn default() -> Self {
        Self::new(MapConfig::default())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
