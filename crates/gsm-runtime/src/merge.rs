//! [`MergeCandidateTracker`] – per-frame segment-to-label association.
//!
//! Every segment of a frame is compared with the existing map before any of
//! them is integrated.  The tracker tallies `(label, segment) → vote` and
//! resolves, per segment, the ordered list of labels the segment should be
//! merged into.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use gsm_perception::GlobalMap;
use gsm_types::{Label, SegmentId};
use tracing::debug;

/// Label → (segment → vote).
pub type MergeCandidateMap = BTreeMap<Label, BTreeMap<SegmentId, u32>>;

/// Segment → target labels, best first.
pub type MergeResolutionMap = BTreeMap<SegmentId, Vec<Label>>;

#[derive(Debug, Clone)]
pub struct MergeCandidateTracker {
    threshold: f32,
    candidates: MergeCandidateMap,
    point_counts: HashMap<SegmentId, usize>,
}

impl MergeCandidateTracker {
    /// `threshold` is the fraction of a segment's points that must overlap a
    /// label for the label to qualify.
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            candidates: BTreeMap::new(),
            point_counts: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Forget the previous frame.
    pub fn begin_frame(&mut self) {
        self.candidates.clear();
        self.point_counts.clear();
    }

    pub fn record_segment(&mut self, segment: SegmentId, point_count: usize) {
        self.point_counts.insert(segment, point_count);
    }

    /// Accumulate `vote` for the pair.
    pub fn add_vote(&mut self, label: Label, segment: SegmentId, vote: u32) {
        *self
            .candidates
            .entry(label)
            .or_default()
            .entry(segment)
            .or_insert(0) += vote;
    }

    pub fn candidates(&self) -> &MergeCandidateMap {
        &self.candidates
    }

    /// Resolve every segment against the labels present in `map`.
    ///
    /// A label qualifies when `vote / point_count` is strictly above the
    /// threshold.  Targets are ordered by descending vote, then ascending
    /// label.  Segments without a qualifying label are absent from the
    /// result.
    pub fn resolve(&self, map: &GlobalMap) -> MergeResolutionMap {
        let mut per_segment: BTreeMap<SegmentId, Vec<(Label, u32)>> = BTreeMap::new();
        for (&label, segments) in &self.candidates {
            if !map.contains_label(label) {
                debug!(label = %label, "dropping merge candidate no longer in the map");
                continue;
            }
            for (&segment, &vote) in segments {
                let points = self.point_counts.get(&segment).copied().unwrap_or(0);
                if points == 0 {
                    continue;
                }
                if vote as f32 / points as f32 > self.threshold {
                    per_segment.entry(segment).or_default().push((label, vote));
                }
            }
        }
        per_segment
            .into_iter()
            .map(|(segment, mut targets)| {
                targets.sort_by_key(|&(label, vote)| (Reverse(vote), label));
                (segment, targets.into_iter().map(|(label, _)| label).collect())
            })
            .collect()
    }
}
