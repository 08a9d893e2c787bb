//! Per-label sub-layer extraction.
//!
//! A [`LayerTriple`] is the geometric, label and feature content of one label
//! copied out of the [`GlobalMap`].  It is a snapshot: the moment the map
//! changes it may be stale.
//!
//! Two strategies implement [`LabelLayerExtractor`]:
//!
//! | Strategy | Behaviour |
//! |---|---|
//! | [`FreshExtractor`] | Scans the map on every call. |
//! | [`CachingExtractor`] | Reuses earlier results for labels whose revision has not moved, until the next eviction or complete pass. |

use std::collections::{BTreeMap, HashMap};

use gsm_perception::{FeatureLayer, GlobalMap, Layer};
use gsm_types::{BlockIndex, Label, LabelVoxel, Point3, TsdfVoxel};
use serde::{Deserialize, Serialize};
use tracing::trace;

// ─────────────────────────────────────────────────────────────────────────────
// LayerTriple
// ─────────────────────────────────────────────────────────────────────────────

/// Geometric, label and feature layers of one label.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerTriple {
    pub label: Label,
    pub tsdf: Layer<TsdfVoxel>,
    pub labels: Layer<LabelVoxel>,
    pub features: FeatureLayer,
}

impl LayerTriple {
    fn empty_for(map: &GlobalMap, label: Label) -> Self {
        Self {
            label,
            tsdf: map.tsdf().empty_like(),
            labels: map.labels().empty_like(),
            features: map.features().empty_like(),
        }
    }

    /// Number of blocks holding at least one voxel of the label.
    pub fn allocated_blocks(&self) -> usize {
        self.labels.allocated_block_count()
    }

    pub fn has_min_blocks(&self, min: usize) -> bool {
        self.allocated_blocks() >= min
    }

    pub fn block_indices(&self) -> Vec<BlockIndex> {
        self.labels.block_indices()
    }

    /// Centres of every voxel carrying the label.
    pub fn voxel_centers(&self) -> Vec<Point3> {
        self.labels
            .block_indices()
            .into_iter()
            .flat_map(|index| {
                self.labels
                    .block(index)
                    .map(|b| b.voxels())
                    .unwrap_or(&[])
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| v.label == self.label)
                    .map(move |(linear, _)| self.labels.voxel_center(index, linear))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Copy every voxel and feature of `label` out of `map`.
pub fn extract_label(map: &GlobalMap, label: Label) -> LayerTriple {
    let mut triple = LayerTriple::empty_for(map, label);
    for index in map.labels().block_indices() {
        let Some(label_block) = map.labels().block(index) else {
            continue;
        };
        if !label_block.voxels().iter().any(|v| v.label == label) {
            continue;
        }
        let tsdf_block = map.tsdf().block(index);
        let out_labels = triple.labels.allocate_block(index).voxels_mut();
        let mut owned = Vec::new();
        for (linear, voxel) in label_block.voxels().iter().enumerate() {
            if voxel.label == label {
                out_labels[linear] = *voxel;
                owned.push(linear);
            }
        }
        let out_tsdf = triple.tsdf.allocate_block(index).voxels_mut();
        if let Some(src) = tsdf_block {
            for linear in owned {
                out_tsdf[linear] = src.voxels()[linear];
            }
        }
        for feature in map.features().features_in(index) {
            if map
                .labels()
                .voxel_at(feature.position)
                .is_some_and(|v| v.label == label)
            {
                triple.features.insert(feature.clone());
            }
        }
    }
    triple
}

// ─────────────────────────────────────────────────────────────────────────────
// Strategies
// ─────────────────────────────────────────────────────────────────────────────

/// Builds per-label sub-layers from the global map.
pub trait LabelLayerExtractor: Send {
    /// Extract `labels`.  `complete` signals that `labels` is the whole label
    /// set and forces a fresh scan.  An empty request yields an empty map.
    fn extract(&mut self, map: &GlobalMap, labels: &[Label], complete: bool) -> BTreeMap<Label, LayerTriple>;

    /// Drop any cached results.
    fn invalidate(&mut self) {}

    /// Labels served from the cache so far.
    fn cache_hits(&self) -> u64 {
        0
    }
}

/// Which [`LabelLayerExtractor`] the pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStrategy {
    #[default]
    Fresh,
    Caching,
}

impl ExtractionStrategy {
    pub fn build(self) -> Box<dyn LabelLayerExtractor> {
        match self {
            ExtractionStrategy::Fresh => Box::new(FreshExtractor),
            ExtractionStrategy::Caching => Box::new(CachingExtractor::default()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FreshExtractor;

impl LabelLayerExtractor for FreshExtractor {
    fn extract(&mut self, map: &GlobalMap, labels: &[Label], _complete: bool) -> BTreeMap<Label, LayerTriple> {
        labels.iter().map(|&l| (l, extract_label(map, l))).collect()
    }
}

/// Keeps the last extraction per label together with the label revision it
/// was taken at.
#[derive(Debug, Default)]
pub struct CachingExtractor {
    cache: HashMap<Label, (u64, LayerTriple)>,
    hits: u64,
}

impl CachingExtractor {
    pub fn cached_labels(&self) -> usize {
        self.cache.len()
    }
}

impl LabelLayerExtractor for CachingExtractor {
    fn extract(&mut self, map: &GlobalMap, labels: &[Label], complete: bool) -> BTreeMap<Label, LayerTriple> {
        if complete {
            self.cache.clear();
        }
        let mut out = BTreeMap::new();
        for &label in labels {
            let revision = map.revision(label);
            let triple = match self.cache.get(&label) {
                Some((cached_at, triple)) if *cached_at == revision => {
                    trace!(label = %label, "extraction cache hit");
                    self.hits += 1;
                    triple.clone()
                }
                _ => {
                    let triple = extract_label(map, label);
                    self.cache.insert(label, (revision, triple.clone()));
                    triple
                }
            };
            out.insert(label, triple);
        }
        out
    }

    fn invalidate(&mut self) {
        self.cache.clear();
    }

    fn cache_hits(&self) -> u64 {
        self.hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsm_perception::MapConfig;
    use gsm_types::Feature3D;

    fn paint(map: &mut GlobalMap, p: Point3, label: Label) {
        let (tsdf, labels) = map.layers_mut();
        tsdf.voxel_mut_or_allocate(p).weight = 1.0;
        labels.voxel_mut_or_allocate(p).label = label;
        map.bump_revision(label);
    }

    fn two_label_map() -> (GlobalMap, Label, Label) {
        let mut m = GlobalMap::new(MapConfig {
            voxel_size: 0.5,
            voxels_per_side: 2,
        });
        let a = m.allocate_label();
        let b = m.allocate_label();
        paint(&mut m, Point3::new(0.1, 0.1, 0.1), a);
        paint(&mut m, Point3::new(0.6, 0.1, 0.1), b);
        paint(&mut m, Point3::new(3.1, 0.1, 0.1), a);
        m.features_mut().insert(Feature3D {
            position: Point3::new(0.2, 0.2, 0.2),
            descriptor: vec![],
        });
        m.features_mut().insert(Feature3D {
            position: Point3::new(0.7, 0.2, 0.2),
            descriptor: vec![],
        });
        (m, a, b)
    }

    #[test]
    fn extract_copies_only_matching_voxels_and_features() {
        let (m, a, b) = two_label_map();
        let triple = extract_label(&m, a);
        assert_eq!(triple.allocated_blocks(), 2);
        assert_eq!(triple.features.len(), 1);
        assert_eq!(triple.voxel_centers().len(), 2);
        assert!(
            triple
                .labels
                .block(BlockIndex::new(0, 0, 0))
                .is_some_and(|blk| blk.voxels().iter().all(|v| v.label != b))
        );
    }

    #[test]
    fn empty_request_is_empty() {
        let (m, _, _) = two_label_map();
        assert!(FreshExtractor.extract(&m, &[], true).is_empty());
        assert!(CachingExtractor::default().extract(&m, &[], false).is_empty());
    }

    #[test]
    fn complete_extraction_is_idempotent() {
        let (m, a, b) = two_label_map();
        for strategy in [ExtractionStrategy::Fresh, ExtractionStrategy::Caching] {
            let mut extractor = strategy.build();
            let first = extractor.extract(&m, &[a, b], true);
            let second = extractor.extract(&m, &[a, b], true);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn cache_refreshes_changed_labels() {
        let (mut m, a, _) = two_label_map();
        let mut extractor = CachingExtractor::default();
        assert_eq!(extractor.extract(&m, &[a], false)[&a].allocated_blocks(), 2);
        assert_eq!(extractor.cached_labels(), 1);

        extractor.extract(&m, &[a], false);
        assert_eq!(extractor.cache_hits(), 1);

        paint(&mut m, Point3::new(6.1, 0.1, 0.1), a);
        assert_eq!(extractor.extract(&m, &[a], false)[&a].allocated_blocks(), 3);
        assert_eq!(extractor.cache_hits(), 1);

        extractor.invalidate();
        assert_eq!(extractor.cached_labels(), 0);
    }
}
