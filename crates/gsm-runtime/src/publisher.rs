//! [`UpdatePublisher`] – decides which objects go downstream and when.
//!
//! The publisher remembers, per label, the revision it last sent (the
//! published set) and the labels merged into it since then (pending merges).
//! A label is republished only when it changed, carries pending merges, or
//! the publish is forced by a scene-level request.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use gsm_middleware::MapBus;
use gsm_perception::GlobalMap;
use gsm_perception::bbox::oriented_bbox;
use gsm_types::{EventPayload, GsmUpdate, Label, ObjectUpdate, Point3};
use tracing::{debug, info};

use crate::extraction::{LabelLayerExtractor, LayerTriple};

const SOURCE: &str = "gsm-runtime::publisher";

/// Label → labels merged into it, awaiting publication.
pub type PendingMergesMap = BTreeMap<Label, BTreeSet<Label>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherConfig {
    pub min_blocks: usize,
    pub publish_bboxes: bool,
}

pub struct UpdatePublisher {
    bus: MapBus,
    config: PublisherConfig,
    published: HashMap<Label, u64>,
    pending: PendingMergesMap,
    window_reference: Option<Point3>,
}

impl UpdatePublisher {
    pub fn new(bus: MapBus, config: PublisherConfig) -> Self {
        Self {
            bus,
            config,
            published: HashMap::new(),
            pending: BTreeMap::new(),
            window_reference: None,
        }
    }

    /// Point stamped on every outgoing update; `None` for an unbounded map.
    pub fn set_window_reference(&mut self, reference: Option<Point3>) {
        self.window_reference = reference;
    }

    pub fn window_reference(&self) -> Option<Point3> {
        self.window_reference
    }

    pub fn is_published(&self, label: Label) -> bool {
        self.published.contains_key(&label)
    }

    pub fn published_count(&self) -> usize {
        self.published.len()
    }

    pub fn pending_merges(&self) -> &PendingMergesMap {
        &self.pending
    }

    /// Record that `from` was merged into `into`.  Anything already pending
    /// on `from` moves with it.
    pub fn record_merge(&mut self, into: Label, from: Label) {
        let mut carried = self.pending.remove(&from).unwrap_or_default();
        carried.insert(from);
        self.pending.entry(into).or_default().extend(carried);
        self.published.remove(&from);
    }

    /// Drop every trace of `label`.
    pub fn forget(&mut self, label: Label) {
        self.published.remove(&label);
        self.pending.remove(&label);
    }

    fn needs_publish(&self, map: &GlobalMap, label: Label) -> bool {
        self.published.get(&label) != Some(&map.revision(label)) || self.pending.contains_key(&label)
    }

    fn object_update(&self, map: &GlobalMap, triple: &LayerTriple) -> ObjectUpdate {
        let label = triple.label;
        ObjectUpdate {
            label,
            merged_labels: self
                .pending
                .get(&label)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default(),
            semantic: map.dominant_semantic(label),
            instance: map.instance_of(label),
            tsdf: triple.tsdf.snapshot(),
            labels: triple.labels.snapshot(),
            features: triple.features.all_features(),
            bbox: if self.config.publish_bboxes {
                oriented_bbox(label, &triple.voxel_centers())
            } else {
                None
            },
        }
    }

    fn mark_published(&mut self, map: &GlobalMap, label: Label) {
        self.published.insert(label, map.revision(label));
        self.pending.remove(&label);
    }

    /// Publish each of `labels` that meets the block minimum and changed
    /// since it was last sent.  Returns the labels actually published.
    pub fn publish(
        &mut self,
        map: &GlobalMap,
        extractor: &mut dyn LabelLayerExtractor,
        labels: &[Label],
    ) -> Vec<Label> {
        let wanted: Vec<Label> = labels
            .iter()
            .copied()
            .filter(|&l| map.contains_label(l) && self.needs_publish(map, l))
            .collect();
        if wanted.is_empty() {
            return Vec::new();
        }
        let triples = extractor.extract(map, &wanted, false);
        let mut sent = Vec::new();
        for (label, triple) in &triples {
            if !triple.has_min_blocks(self.config.min_blocks) {
                debug!(label = %label, blocks = triple.allocated_blocks(), "below publish minimum");
                continue;
            }
            let object = self.object_update(map, triple);
            if let Some(bbox) = object.bbox {
                self.bus.emit(SOURCE, EventPayload::BoundingBox(bbox));
            }
            self.bus.emit(
                SOURCE,
                EventPayload::SegmentUpdate(GsmUpdate {
                    objects: vec![object],
                    is_scene: false,
                    window_reference: self.window_reference,
                }),
            );
            self.mark_published(map, *label);
            sent.push(*label);
        }
        sent
    }

    /// Publish every label that meets the block minimum as one scene update,
    /// regardless of what was sent before.  Returns the number of objects.
    pub fn publish_scene(&mut self, map: &GlobalMap, extractor: &mut dyn LabelLayerExtractor) -> usize {
        let labels = map.labels_list();
        let triples = extractor.extract(map, &labels, true);
        let mut objects = Vec::new();
        for triple in triples.values() {
            if !triple.has_min_blocks(self.config.min_blocks) {
                continue;
            }
            let object = self.object_update(map, triple);
            if let Some(bbox) = object.bbox {
                self.bus.emit(SOURCE, EventPayload::BoundingBox(bbox));
            }
            objects.push(object);
        }
        for object in &objects {
            self.mark_published(map, object.label);
        }
        let count = objects.len();
        info!(objects = count, window = self.window_reference.is_some(), "publishing scene");
        self.bus.emit(
            SOURCE,
            EventPayload::SceneUpdate(GsmUpdate {
                objects,
                is_scene: true,
                window_reference: self.window_reference,
            }),
        );
        count
    }
}
