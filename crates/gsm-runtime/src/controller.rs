//! [`Controller`] – the segment map pipeline.
//!
//! Owns the [`GlobalMap`] and drives every component against it:
//!
//! 1. **Associate** – every segment of a frame is compared with the map
//!    through the [`Integrator`]; votes go to the [`MergeCandidateTracker`].
//! 2. **Resolve** – each segment gets its best qualifying label (other
//!    qualifying labels are merged into it) or a fresh one.
//! 3. **Integrate** – segments are fused under their final labels and the
//!    mesh dirty flags are raised.
//! 4. **Publish** – changed objects go out through the [`UpdatePublisher`].
//!
//! The [`ControllerVariant::SlidingWindow`] variant adds a
//! [`SlidingWindowTrigger`]: when the reference frame moves beyond the window
//! radius, objects outside the window around the recorded centre are
//! evicted, the scene is republished with the new window reference and the
//! new window pose is broadcast.
//!
//! # Control surface
//!
//! | Operation | Method |
//! |---|---|
//! | Force scene publish | [`Controller::publish_scene`] |
//! | Validate merged object | [`Controller::validate_merged_object`] |
//! | Generate mesh to storage | [`Controller::generate_mesh`] |
//! | Save segments as meshes | [`Controller::save_segments_as_mesh`] |
//! | Extract instances | [`Controller::extract_instances`] |

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gsm_kernel::{IdleStatus, IdleWatchdog, MeshDirtyFlags};
use gsm_middleware::MapBus;
use gsm_perception::bbox::oriented_bbox;
use gsm_perception::{GlobalMap, Layer, MapConfig, Transform3D};
use gsm_types::{
    BlockIndex, BoundingBox, ColorScheme, EventPayload, FeatureBlock, FeatureBlockUpdate,
    FeatureObservation, GsmError, InstanceLabel, Label, LayerSnapshot, Observation, Point3,
    SegmentObservation, SemanticLabel, TsdfVoxel, WindowPose,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::collaborators::{FeatureIntegrator, Integrator, MeshIntegrator, TransformService};
use crate::export::{MeshDocument, segment_mesh_path, write_mesh};
use crate::extraction::{ExtractionStrategy, LabelLayerExtractor, LayerTriple};
use crate::integrators::{BlockFeatureIntegrator, PointVoxelIntegrator, SurfaceMesher};
use crate::merge::MergeCandidateTracker;
use crate::mesh::{MeshPass, MeshUpdateController};
use crate::publisher::{PublisherConfig, UpdatePublisher};
use crate::sliding_window::SlidingWindowTrigger;
use crate::window::SpatialWindowManager;

const SOURCE: &str = "gsm-runtime::controller";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Unbounded map or a map bounded by a window that follows the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerVariant {
    #[default]
    Unbounded,
    SlidingWindow,
}

/// Everything the pipeline reads once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub variant: ControllerVariant,
    pub map: MapConfig,
    pub world_frame: String,
    pub camera_frame: String,
    /// Child frame name of the broadcast window pose.
    pub window_frame: String,
    pub window_radius: f32,
    pub window_check_period: Duration,
    /// Bounded wait for the reference pose.
    pub pose_wait: Duration,
    /// Zero disables the idle shutdown.
    pub no_update_timeout: Duration,
    pub min_blocks_to_publish: usize,
    pub association_threshold: f32,
    pub color_scheme: ColorScheme,
    pub mesh_period: Duration,
    pub mesh_file: Option<PathBuf>,
    pub export_dir: PathBuf,
    pub publish_segment_updates: bool,
    pub publish_segment_mesh: bool,
    pub publish_bboxes: bool,
    pub publish_scene_mesh: bool,
    /// Emit the feature blocks touched by each feature frame.
    pub publish_feature_blocks: bool,
    /// Associate segments with existing labels.  When off every segment gets
    /// a fresh label and nothing is merged.
    pub use_label_propagation: bool,
    /// Record the semantic class and instance id carried by segments.
    pub enable_semantic_instance_segmentation: bool,
    /// `None` picks the variant's strategy.
    pub extraction: Option<ExtractionStrategy>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            variant: ControllerVariant::Unbounded,
            map: MapConfig::default(),
            world_frame: "world".to_string(),
            camera_frame: "camera".to_string(),
            window_frame: "sliding_window".to_string(),
            window_radius: 10.0,
            window_check_period: Duration::from_secs(1),
            pose_wait: Duration::from_secs(30),
            no_update_timeout: Duration::ZERO,
            min_blocks_to_publish: 10,
            association_threshold: 0.5,
            color_scheme: ColorScheme::Label,
            mesh_period: Duration::from_secs(1),
            mesh_file: None,
            export_dir: PathBuf::from("gsm_segments"),
            publish_segment_updates: true,
            publish_segment_mesh: false,
            publish_bboxes: false,
            publish_scene_mesh: true,
            publish_feature_blocks: false,
            use_label_propagation: true,
            enable_semantic_instance_segmentation: true,
            extraction: None,
        }
    }
}

impl ControllerConfig {
    /// The configured extraction strategy, or the variant's own: the sliding
    /// window reuses extractions between evictions, the unbounded map scans
    /// fresh.
    pub fn extraction_strategy(&self) -> ExtractionStrategy {
        self.extraction.unwrap_or(match self.variant {
            ControllerVariant::Unbounded => ExtractionStrategy::Fresh,
            ControllerVariant::SlidingWindow => ExtractionStrategy::Caching,
        })
    }

    /// Reject configurations the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// [`GsmError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), GsmError> {
        let invalid = |msg: String| Err(GsmError::InvalidConfig(msg));
        if !(self.map.voxel_size.is_finite() && self.map.voxel_size > 0.0) {
            return invalid(format!("voxel_size must be > 0, got {}", self.map.voxel_size));
        }
        if self.map.voxels_per_side == 0 {
            return invalid("voxels_per_side must be > 0".to_string());
        }
        if !(0.0..1.0).contains(&self.association_threshold) {
            return invalid(format!(
                "association_threshold must be in [0, 1), got {}",
                self.association_threshold
            ));
        }
        if self.mesh_period.is_zero() {
            return invalid("mesh_period must be > 0".to_string());
        }
        if self.world_frame.is_empty() || self.camera_frame.is_empty() {
            return invalid("world_frame and camera_frame must be set".to_string());
        }
        if self.variant == ControllerVariant::SlidingWindow {
            if !(self.window_radius.is_finite() && self.window_radius > 0.0) {
                return invalid(format!("window_radius must be > 0, got {}", self.window_radius));
            }
            if self.window_check_period.is_zero() {
                return invalid("window_check_period must be > 0".to_string());
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one segment frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// Final label of every integrated segment, deduplicated and sorted.
    pub labels: Vec<Label>,
    /// `(from, into)` merges applied this frame.
    pub merges: Vec<(Label, Label)>,
    /// Labels sent downstream.
    pub published: Vec<Label>,
}

/// Outcome of a window move.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowCycle {
    /// Centre the eviction ran around: the one recorded before the move.
    pub previous_center: Point3,
    /// Pose the window moved to.
    pub center: Point3,
    pub evicted: Vec<Label>,
    pub published: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeValidation {
    pub valid: bool,
    pub unknown_labels: Vec<Label>,
    /// Fraction of the proposal's observed voxels that fall on one of the
    /// candidate labels in the map.
    pub overlap_ratio: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub instance: InstanceLabel,
    pub labels: Vec<Label>,
    pub semantic: Option<SemanticLabel>,
    pub bbox: Option<BoundingBox>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

pub struct Controller {
    config: ControllerConfig,
    map: GlobalMap,
    bus: MapBus,
    integrator: Box<dyn Integrator>,
    feature_integrator: Box<dyn FeatureIntegrator>,
    extractor: Box<dyn LabelLayerExtractor>,
    tracker: MergeCandidateTracker,
    window: SpatialWindowManager,
    publisher: UpdatePublisher,
    mesh: MeshUpdateController,
    trigger: Option<SlidingWindowTrigger>,
    watchdog: Option<IdleWatchdog>,
    frames_integrated: u64,
}

impl Controller {
    /// Build the pipeline with the reference collaborators.
    ///
    /// # Errors
    ///
    /// [`GsmError::InvalidConfig`] when `config` does not validate.
    pub fn new(
        config: ControllerConfig,
        bus: MapBus,
        flags: Arc<MeshDirtyFlags>,
        transforms: Arc<dyn TransformService>,
    ) -> Result<Self, GsmError> {
        config.validate()?;

        let mut publisher = UpdatePublisher::new(
            bus.clone(),
            PublisherConfig {
                min_blocks: config.min_blocks_to_publish,
                publish_bboxes: config.publish_bboxes,
            },
        );
        let trigger = match config.variant {
            ControllerVariant::Unbounded => None,
            ControllerVariant::SlidingWindow => {
                let trigger = SlidingWindowTrigger::new(
                    config.window_radius,
                    config.world_frame.clone(),
                    config.camera_frame.clone(),
                    config.pose_wait,
                    transforms,
                );
                publisher.set_window_reference(Some(trigger.center()));
                Some(trigger)
            }
        };
        let mesh = MeshUpdateController::new(
            flags,
            Box::new(SurfaceMesher::new()),
            config.color_scheme,
            config.publish_segment_mesh,
            bus.clone(),
        )
        .with_scene_mesh(config.publish_scene_mesh);
        let watchdog = (!config.no_update_timeout.is_zero())
            .then(|| IdleWatchdog::new(config.no_update_timeout));

        info!(
            variant = ?config.variant,
            voxel_size = config.map.voxel_size,
            voxels_per_side = config.map.voxels_per_side,
            min_blocks = config.min_blocks_to_publish,
            extraction = ?config.extraction_strategy(),
            "segment map controller ready"
        );

        Ok(Self {
            map: GlobalMap::new(config.map),
            integrator: Box::new(PointVoxelIntegrator::new()),
            feature_integrator: Box::new(BlockFeatureIntegrator::new()),
            extractor: config.extraction_strategy().build(),
            tracker: MergeCandidateTracker::new(config.association_threshold),
            window: SpatialWindowManager::new(config.min_blocks_to_publish),
            publisher,
            mesh,
            trigger,
            watchdog,
            frames_integrated: 0,
            bus,
            config,
        })
    }

    pub fn with_integrator(mut self, integrator: Box<dyn Integrator>) -> Self {
        self.integrator = integrator;
        self
    }

    pub fn with_feature_integrator(mut self, integrator: Box<dyn FeatureIntegrator>) -> Self {
        self.feature_integrator = integrator;
        self
    }

    pub fn with_mesh_integrator(mut self, mesher: Box<dyn MeshIntegrator>) -> Self {
        self.mesh = MeshUpdateController::new(
            Arc::clone(self.mesh.flags()),
            mesher,
            self.config.color_scheme,
            self.config.publish_segment_mesh,
            self.bus.clone(),
        );
        self
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn map(&self) -> &GlobalMap {
        &self.map
    }

    pub fn publisher(&self) -> &UpdatePublisher {
        &self.publisher
    }

    pub fn flags(&self) -> &Arc<MeshDirtyFlags> {
        self.mesh.flags()
    }

    pub fn window_center(&self) -> Option<Point3> {
        self.trigger.as_ref().map(SlidingWindowTrigger::center)
    }

    pub fn frames_integrated(&self) -> u64 {
        self.frames_integrated
    }

    pub fn is_windowed(&self) -> bool {
        self.trigger.is_some()
    }

    /// Labels the extractor served from its cache so far.
    pub fn extraction_cache_hits(&self) -> u64 {
        self.extractor.cache_hits()
    }

    // ── Observations ─────────────────────────────────────────────────────────

    pub fn handle_observation(&mut self, observation: &Observation) -> FrameReport {
        match observation {
            Observation::Segments(frame) => self.handle_segments(frame),
            Observation::Features(frame) => {
                self.handle_features(frame);
                FrameReport::default()
            }
        }
    }

    /// Associate, merge, integrate and publish one segment frame.
    #[instrument(skip_all, fields(segments = frame.segments.len()))]
    pub fn handle_segments(&mut self, frame: &SegmentObservation) -> FrameReport {
        if let Some(watchdog) = self.watchdog.as_mut() {
            watchdog.record();
        }
        self.frames_integrated += 1;

        let segments: Vec<_> = frame.segments.iter().filter(|s| !s.points.is_empty()).collect();

        self.tracker.begin_frame();
        if self.config.use_label_propagation {
            for segment in &segments {
                self.tracker.record_segment(segment.id, segment.points.len());
                for (label, vote) in self.integrator.overlaps(&self.map, segment, &frame.pose) {
                    self.tracker.add_vote(label, segment.id, vote);
                }
            }
        }
        let resolution = self.tracker.resolve(&self.map);

        let mut report = FrameReport::default();
        let mut redirect: HashMap<Label, Label> = HashMap::new();
        let mut labels = BTreeSet::new();
        let mut touched_any = false;

        for segment in &segments {
            let targets: Vec<Label> = resolution
                .get(&segment.id)
                .map(|targets| {
                    let mut seen = BTreeSet::new();
                    targets
                        .iter()
                        .map(|&t| follow(&redirect, t))
                        .filter(|l| self.map.contains_label(*l) && seen.insert(*l))
                        .collect()
                })
                .unwrap_or_default();

            let label = match targets.split_first() {
                Some((&first, rest)) => {
                    for &other in rest {
                        info!(from = %other, into = %first, segment = segment.id.0, "merging labels");
                        self.integrator.merge_labels(&mut self.map, other, first);
                        self.publisher.record_merge(first, other);
                        redirect.insert(other, first);
                        report.merges.push((other, first));
                    }
                    first
                }
                None => self.integrator.allocate_label(&mut self.map),
            };

            let touched = self.integrator.integrate(&mut self.map, segment, &frame.pose, label);
            touched_any |= !touched.is_empty();
            if self.config.enable_semantic_instance_segmentation {
                if let Some(class) = segment.semantic {
                    self.map.record_semantic(label, class);
                }
                if let Some(instance) = segment.instance {
                    self.map.record_instance(label, instance);
                }
            }
            labels.insert(label);
        }

        if touched_any || !report.merges.is_empty() {
            self.mesh.flags().mark_updated();
        }
        // A label merged later in the frame is no longer a target of its own.
        report.labels = labels
            .into_iter()
            .map(|l| follow(&redirect, l))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        debug!(labels = report.labels.len(), merges = report.merges.len(), "frame integrated");

        if self.config.publish_segment_updates {
            report.published = self
                .publisher
                .publish(&self.map, self.extractor.as_mut(), &report.labels);
        }
        report
    }

    pub fn handle_features(&mut self, frame: &FeatureObservation) -> usize {
        let inserted = self.feature_integrator.integrate_features(&mut self.map, frame);
        debug!(inserted, "features integrated");
        if self.config.publish_feature_blocks && inserted > 0 {
            self.publish_feature_blocks(frame);
        }
        inserted
    }

    /// Emit the current contents of every feature block `frame` landed in.
    fn publish_feature_blocks(&self, frame: &FeatureObservation) {
        let to_world = Transform3D::from_pose(&frame.pose);
        let block_size = self.map.block_size();
        let indices: BTreeSet<BlockIndex> = frame
            .features
            .iter()
            .map(|f| BlockIndex::containing(to_world.apply(f.position), block_size))
            .collect();
        let blocks: Vec<FeatureBlock> = indices
            .into_iter()
            .map(|index| FeatureBlock {
                index,
                features: self.map.features().features_in(index).to_vec(),
            })
            .filter(|b| !b.features.is_empty())
            .collect();
        debug!(blocks = blocks.len(), "publishing feature blocks");
        self.bus
            .emit(SOURCE, EventPayload::FeatureBlocks(FeatureBlockUpdate { blocks }));
    }

    // ── Window ───────────────────────────────────────────────────────────────

    /// Evict every eligible label with no block within `radius` of `center`
    /// and notify downstream once per evicted label.
    pub fn evict(&mut self, radius: f32, center: Point3) -> Vec<Label> {
        let notices = self.window.evict(&mut self.map, radius, center);
        for notice in &notices {
            self.publisher.forget(notice.label);
            self.bus.emit(SOURCE, EventPayload::Eviction(*notice));
        }
        self.extractor.invalidate();
        if !notices.is_empty() {
            self.mesh.flags().mark_updated();
        }
        notices.into_iter().map(|n| n.label).collect()
    }

    /// Run one sliding-window check.  `Ok(None)` when the map is unbounded
    /// or the window did not move.
    ///
    /// Eviction uses the centre recorded before the move; the new pose only
    /// becomes the window centre once the cycle has completed.
    ///
    /// # Errors
    ///
    /// [`GsmError::TransformUnavailable`] when the reference pose cannot be
    /// resolved within the configured wait.
    pub async fn check_window(&mut self) -> Result<Option<WindowCycle>, GsmError> {
        let Some(trigger) = self.trigger.as_mut() else {
            return Ok(None);
        };
        let Some(center) = trigger.check().await? else {
            return Ok(None);
        };
        let radius = trigger.radius();
        let previous_center = trigger.center();

        let evicted = self.evict(radius, previous_center);
        self.publisher.set_window_reference(Some(center));
        let published = self.publish_scene();
        self.bus.emit(
            SOURCE,
            EventPayload::WindowPose(WindowPose {
                parent_frame: self.config.world_frame.clone(),
                child_frame: self.config.window_frame.clone(),
                position: center,
            }),
        );
        if let Some(trigger) = self.trigger.as_mut() {
            trigger.commit(center);
        }
        info!(
            from_x = previous_center.x,
            from_y = previous_center.y,
            center_x = center.x,
            center_y = center.y,
            evicted = evicted.len(),
            published,
            "window moved"
        );
        Ok(Some(WindowCycle {
            previous_center,
            center,
            evicted,
            published,
        }))
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    pub fn mesh_tick(&mut self) -> MeshPass {
        self.mesh.tick(&mut self.map)
    }

    /// Idle watchdog check; [`IdleStatus::WaitingForFirstObservation`]
    /// forever when the watchdog is disabled.
    pub fn check_idle(&mut self) -> IdleStatus {
        match self.watchdog.as_mut() {
            Some(watchdog) => watchdog.check(),
            None => IdleStatus::WaitingForFirstObservation,
        }
    }

    pub fn idle_shutdown_enabled(&self) -> bool {
        self.watchdog.is_some()
    }

    /// Final publish before exit: the scene, and the mesh file when one is
    /// configured.
    pub fn shutdown(&mut self) -> Result<(), GsmError> {
        let objects = self.publish_scene();
        let mesh = self.generate_mesh(None)?;
        info!(
            objects,
            mesh = ?mesh,
            frames = self.frames_integrated,
            "segment map shut down"
        );
        Ok(())
    }

    // ── Control surface ──────────────────────────────────────────────────────

    /// Publish every publishable object as one scene update.
    pub fn publish_scene(&mut self) -> usize {
        self.publisher.publish_scene(&self.map, self.extractor.as_mut())
    }

    /// Check a proposed merged object against the map.
    ///
    /// # Errors
    ///
    /// [`GsmError::InvalidConfig`] when the proposal's layer geometry is
    /// unusable.
    pub fn validate_merged_object(
        &self,
        labels: &[Label],
        proposed: &LayerSnapshot<TsdfVoxel>,
    ) -> Result<MergeValidation, GsmError> {
        if !(proposed.voxel_size.is_finite() && proposed.voxel_size > 0.0) || proposed.voxels_per_side == 0 {
            return Err(GsmError::InvalidConfig(
                "proposed layer has no valid voxel geometry".to_string(),
            ));
        }
        let unknown_labels: Vec<Label> = labels
            .iter()
            .copied()
            .filter(|l| !self.map.contains_label(*l))
            .collect();

        let geometry: Layer<TsdfVoxel> = Layer::new(proposed.voxel_size, proposed.voxels_per_side);
        let (mut observed, mut matching) = (0usize, 0usize);
        for block in &proposed.blocks {
            for (linear, voxel) in block.voxels.iter().enumerate() {
                if !voxel.is_observed() {
                    continue;
                }
                observed += 1;
                let center = geometry.voxel_center(block.index, linear);
                if self
                    .map
                    .labels()
                    .voxel_at(center)
                    .is_some_and(|v| labels.contains(&v.label))
                {
                    matching += 1;
                }
            }
        }
        let overlap_ratio = if observed == 0 {
            0.0
        } else {
            matching as f32 / observed as f32
        };
        let valid = !labels.is_empty()
            && unknown_labels.is_empty()
            && overlap_ratio > self.config.association_threshold;
        debug!(valid, overlap_ratio, unknown = unknown_labels.len(), "merged object validated");
        Ok(MergeValidation {
            valid,
            unknown_labels,
            overlap_ratio,
        })
    }

    /// Rebuild every mesh view and write the configured view to `path`, or
    /// to the configured mesh file.  Returns the file written, if any.
    pub fn generate_mesh(&mut self, path: Option<PathBuf>) -> Result<Option<PathBuf>, GsmError> {
        self.mesh.regenerate(&mut self.map);
        let Some(path) = path.or_else(|| self.config.mesh_file.clone()) else {
            return Ok(None);
        };
        let scheme = self.mesh.color_scheme();
        write_mesh(&path, &MeshDocument::new(None, scheme, self.mesh.view(scheme)))?;
        Ok(Some(path))
    }

    /// Write one mesh file per publishable object into `dir`, or into the
    /// configured export directory.
    pub fn save_segments_as_mesh(&mut self, dir: Option<PathBuf>) -> Result<Vec<PathBuf>, GsmError> {
        let dir = dir.unwrap_or_else(|| self.config.export_dir.clone());
        let mut written = Vec::new();
        for label in self.map.labels_list() {
            if self.map.blocks_of_label(label).len() < self.config.min_blocks_to_publish {
                continue;
            }
            let blocks = self.mesh.label_mesh(&self.map, label);
            if blocks.is_empty() {
                continue;
            }
            let path = segment_mesh_path(&dir, label);
            write_mesh(
                &path,
                &MeshDocument::new(Some(label), self.mesh.color_scheme(), blocks),
            )?;
            written.push(path);
        }
        info!(files = written.len(), dir = %dir.display(), "segments saved as meshes");
        Ok(written)
    }

    /// Group objects by instance id.
    pub fn extract_instances(&mut self) -> Vec<InstanceSummary> {
        let mut groups: BTreeMap<InstanceLabel, Vec<Label>> = BTreeMap::new();
        for label in self.map.labels_list() {
            if let Some(instance) = self.map.instance_of(label) {
                groups.entry(instance).or_default().push(label);
            }
        }
        let members: Vec<Label> = groups.values().flatten().copied().collect();
        let triples = self.extractor.extract(&self.map, &members, false);
        groups
            .into_iter()
            .map(|(instance, labels)| {
                let points: Vec<Point3> = labels
                    .iter()
                    .filter_map(|l| triples.get(l))
                    .flat_map(LayerTriple::voxel_centers)
                    .collect();
                InstanceSummary {
                    instance,
                    semantic: labels.iter().find_map(|&l| self.map.dominant_semantic(l)),
                    bbox: oriented_bbox(labels[0], &points),
                    labels,
                }
            })
            .collect()
    }
}

/// Follow merge redirects to the surviving label.
fn follow(redirect: &HashMap<Label, Label>, mut label: Label) -> Label {
    while let Some(&next) = redirect.get(&label) {
        label = next;
    }
    label
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::TfTransformService;
    use gsm_middleware::Topic;
    use gsm_types::voxel::BlockSnapshot;
    use gsm_types::{Pose, SegmentCloud, SegmentId};

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            map: MapConfig {
                voxel_size: 0.5,
                voxels_per_side: 2,
            },
            min_blocks_to_publish: 1,
            association_threshold: 0.4,
            pose_wait: Duration::from_millis(20),
            ..ControllerConfig::default()
        }
    }

    fn controller(config: ControllerConfig) -> (MapBus, Arc<TfTransformService>, Controller) {
        let bus = MapBus::default();
        let tf = TfTransformService::shared();
        let c = Controller::new(
            config,
            bus.clone(),
            Arc::new(MeshDirtyFlags::new()),
            Arc::clone(&tf) as Arc<dyn TransformService>,
        )
        .expect("valid test config");
        (bus, tf, c)
    }

    fn segment(id: u64, points: &[(f32, f32, f32)]) -> SegmentCloud {
        SegmentCloud::from_points(
            SegmentId(id),
            points.iter().map(|&(x, y, z)| Point3::new(x, y, z)).collect(),
        )
    }

    fn frame(segments: Vec<SegmentCloud>) -> SegmentObservation {
        SegmentObservation {
            timestamp: chrono::Utc::now(),
            pose: Pose::identity(),
            segments,
        }
    }

    /// A row of `n` blocks starting at (x, y).
    fn row(x: f32, y: f32, n: usize) -> Vec<(f32, f32, f32)> {
        (0..n).map(|i| (x + i as f32 + 0.1, y + 0.1, 0.1)).collect()
    }

    #[test]
    fn config_validation_rejects_bad_radius() {
        let config = ControllerConfig {
            variant: ControllerVariant::SlidingWindow,
            window_radius: 0.0,
            ..ControllerConfig::default()
        };
        assert!(matches!(config.validate(), Err(GsmError::InvalidConfig(_))));
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn new_segments_get_fresh_labels_and_are_published() {
        let (bus, _tf, mut c) = controller(test_config());
        let mut updates = bus.subscribe_to(Topic::SegmentUpdates);

        let report = c.handle_segments(&frame(vec![
            segment(1, &[(0.1, 0.1, 0.1)]),
            segment(2, &[(5.1, 0.1, 0.1)]),
        ]));

        assert_eq!(report.labels, vec![Label(1), Label(2)]);
        assert_eq!(report.published, vec![Label(1), Label(2)]);
        assert_eq!(updates.drain().len(), 2);
        assert!(c.flags().snapshot().updated);
    }

    #[test]
    fn overlapping_segment_reuses_existing_label() {
        let (_bus, _tf, mut c) = controller(test_config());
        c.handle_segments(&frame(vec![segment(1, &[(0.1, 0.1, 0.1), (0.6, 0.1, 0.1)])]));
        let report = c.handle_segments(&frame(vec![segment(9, &[(0.2, 0.2, 0.2), (0.7, 0.2, 0.2)])]));
        assert_eq!(report.labels, vec![Label(1)]);
        assert_eq!(c.map().label_count(), 1);
    }

    #[test]
    fn segment_spanning_two_objects_merges_them() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, _tf, mut c) = controller(test_config());
        c.handle_segments(&frame(vec![
            segment(1, &[(0.1, 0.1, 0.1)]),
            segment(2, &[(0.6, 0.1, 0.1)]),
        ]));
        let mut updates = bus.subscribe_to(Topic::SegmentUpdates);

        let report = c.handle_segments(&frame(vec![segment(3, &[(0.1, 0.1, 0.1), (0.6, 0.1, 0.1)])]));

        assert_eq!(report.merges, vec![(Label(2), Label(1))]);
        assert_eq!(report.labels, vec![Label(1)]);
        assert_eq!(c.map().labels_list(), vec![Label(1)]);

        let event = updates.try_recv()?;
        let EventPayload::SegmentUpdate(update) = event.payload else {
            panic!("expected a segment update");
        };
        assert_eq!(update.objects[0].merged_labels, vec![Label(2)]);
        Ok(())
    }

    #[test]
    fn semantic_and_instance_tallies_follow_segments() {
        let (_bus, _tf, mut c) = controller(test_config());
        let mut seg = segment(1, &[(0.1, 0.1, 0.1)]);
        seg.semantic = Some(SemanticLabel(4));
        seg.instance = Some(InstanceLabel(2));
        c.handle_segments(&frame(vec![seg]));

        assert_eq!(c.map().dominant_semantic(Label(1)), Some(SemanticLabel(4)));
        let instances = c.extract_instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].labels, vec![Label(1)]);
        assert!(instances[0].bbox.is_some());
    }

    #[test]
    fn eviction_notifies_once_per_label_and_forgets_it() {
        let (bus, _tf, mut c) = controller(test_config());
        c.handle_segments(&frame(vec![
            segment(1, &row(0.0, 0.0, 5)),
            segment(2, &row(100.0, 0.0, 5)),
            segment(3, &row(0.0, 100.0, 5)),
        ]));
        let mut evictions = bus.subscribe_to(Topic::Evictions);

        let evicted = c.evict(10.0, Point3::zero());

        assert_eq!(evicted, vec![Label(2), Label(3)]);
        assert_eq!(evictions.drain().len(), 2);
        assert!(!c.publisher().is_published(Label(2)));
        assert!(c.publisher().is_published(Label(1)));
        assert_eq!(c.map().labels_list(), vec![Label(1)]);
    }

    #[tokio::test]
    async fn unbounded_controller_never_moves_a_window() -> Result<(), Box<dyn std::error::Error>> {
        let (_bus, _tf, mut c) = controller(test_config());
        assert_eq!(c.check_window().await?, None);
        assert_eq!(c.window_center(), None);
        Ok(())
    }

    #[tokio::test]
    async fn window_move_evicts_republishes_and_broadcasts() -> Result<(), Box<dyn std::error::Error>> {
        let config = ControllerConfig {
            variant: ControllerVariant::SlidingWindow,
            window_radius: 10.0,
            ..test_config()
        };
        let (bus, tf, mut c) = controller(config);
        c.handle_segments(&frame(vec![
            segment(1, &row(0.0, 0.0, 3)),
            segment(2, &row(50.0, 0.0, 3)),
        ]));
        let mut scenes = bus.subscribe_to(Topic::SceneUpdates);
        let mut poses = bus.subscribe_to(Topic::WindowPose);
        let mut evictions = bus.subscribe_to(Topic::Evictions);

        tf.set_transform(
            "world",
            "camera",
            Transform3D::from_pose(&Pose::from_translation(Point3::new(50.0, 0.0, 0.0))),
        );
        let cycle = c.check_window().await?.expect("window should move");

        // Evicted around the recorded centre (the origin), not the new pose.
        assert_eq!(cycle.previous_center, Point3::zero());
        assert_eq!(cycle.center, Point3::new(50.0, 0.0, 0.0));
        assert_eq!(cycle.evicted, vec![Label(2)]);
        assert_eq!(cycle.published, 1);
        assert_eq!(evictions.drain().len(), 1);
        assert_eq!(poses.drain().len(), 1);
        let scene = scenes.drain();
        assert_eq!(scene.len(), 1);
        let EventPayload::SceneUpdate(update) = &scene[0].payload else {
            panic!("expected a scene update");
        };
        assert_eq!(update.window_reference, Some(Point3::new(50.0, 0.0, 0.0)));
        assert_eq!(c.window_center(), Some(Point3::new(50.0, 0.0, 0.0)));
        assert_eq!(c.map().labels_list(), vec![Label(1)]);

        // Same pose again: nothing to do.
        assert_eq!(c.check_window().await?, None);

        // The next move evicts around (50, 0), where label 1 is out of reach.
        tf.set_transform(
            "world",
            "camera",
            Transform3D::from_pose(&Pose::from_translation(Point3::new(80.0, 0.0, 0.0))),
        );
        let cycle = c.check_window().await?.expect("window should move again");
        assert_eq!(cycle.previous_center, Point3::new(50.0, 0.0, 0.0));
        assert_eq!(cycle.evicted, vec![Label(1)]);
        Ok(())
    }

    #[tokio::test]
    async fn window_cycle_keeps_objects_near_the_recorded_centre() -> Result<(), Box<dyn std::error::Error>> {
        let config = ControllerConfig {
            variant: ControllerVariant::SlidingWindow,
            window_radius: 10.0,
            ..test_config()
        };
        let (_bus, tf, mut c) = controller(config);
        c.handle_segments(&frame(vec![segment(1, &row(0.0, 0.0, 1))]));
        tf.set_transform(
            "world",
            "camera",
            Transform3D::from_pose(&Pose::from_translation(Point3::new(30.0, 0.0, 0.0))),
        );

        let cycle = c.check_window().await?.expect("window should move");

        assert!(cycle.evicted.is_empty());
        assert_eq!(c.map().labels_list(), vec![Label(1)]);
        Ok(())
    }

    #[tokio::test]
    async fn window_move_without_evictions_still_republishes() -> Result<(), Box<dyn std::error::Error>> {
        let config = ControllerConfig {
            variant: ControllerVariant::SlidingWindow,
            window_radius: 10.0,
            ..test_config()
        };
        let (bus, tf, mut c) = controller(config);
        c.handle_segments(&frame(vec![segment(1, &row(5.0, 0.0, 3))]));
        let mut scenes = bus.subscribe_to(Topic::SceneUpdates);
        tf.set_transform(
            "world",
            "camera",
            Transform3D::from_pose(&Pose::from_translation(Point3::new(11.0, 0.0, 0.0))),
        );
        let cycle = c.check_window().await?.expect("window should move");
        assert!(cycle.evicted.is_empty());
        assert_eq!(scenes.drain().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_pose_fails_the_window_check() {
        let config = ControllerConfig {
            variant: ControllerVariant::SlidingWindow,
            ..test_config()
        };
        let (_bus, _tf, mut c) = controller(config);
        assert!(matches!(
            c.check_window().await,
            Err(GsmError::TransformUnavailable { .. })
        ));
    }

    #[test]
    fn control_operations_on_empty_map_succeed_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let (_bus, _tf, mut c) = controller(test_config());
        assert_eq!(c.publish_scene(), 0);
        assert!(c.extract_instances().is_empty());
        assert!(c.save_segments_as_mesh(Some(dir.path().to_path_buf()))?.is_empty());
        assert_eq!(c.generate_mesh(None)?, None);
        let report = c.validate_merged_object(
            &[],
            &LayerSnapshot {
                voxel_size: 0.5,
                voxels_per_side: 2,
                blocks: vec![],
            },
        )?;
        assert!(!report.valid);
        assert_eq!(report.overlap_ratio, 0.0);
        Ok(())
    }

    #[test]
    fn validate_merged_object_measures_overlap() -> Result<(), Box<dyn std::error::Error>> {
        let (_bus, _tf, mut c) = controller(test_config());
        c.handle_segments(&frame(vec![
            segment(1, &[(0.1, 0.1, 0.1)]),
            segment(2, &[(0.6, 0.1, 0.1)]),
        ]));
        let observed = TsdfVoxel {
            distance: 0.0,
            weight: 1.0,
            color: Default::default(),
        };
        let mut voxels = vec![TsdfVoxel::default(); 8];
        voxels[0] = observed;
        voxels[1] = observed;
        let proposed = LayerSnapshot {
            voxel_size: 0.5,
            voxels_per_side: 2,
            blocks: vec![BlockSnapshot {
                index: BlockIndex::new(0, 0, 0),
                voxels,
            }],
        };

        let both = c.validate_merged_object(&[Label(1), Label(2)], &proposed)?;
        assert!(both.valid);
        assert_eq!(both.overlap_ratio, 1.0);

        let with_unknown = c.validate_merged_object(&[Label(1), Label(77)], &proposed)?;
        assert!(!with_unknown.valid);
        assert_eq!(with_unknown.unknown_labels, vec![Label(77)]);
        assert_eq!(with_unknown.overlap_ratio, 0.5);
        Ok(())
    }

    #[test]
    fn mesh_files_are_written_on_demand() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let config = ControllerConfig {
            mesh_file: Some(dir.path().join("scene.json")),
            ..test_config()
        };
        let (_bus, _tf, mut c) = controller(config);
        c.handle_segments(&frame(vec![
            segment(1, &[(0.1, 0.1, 0.1)]),
            segment(2, &[(5.1, 0.1, 0.1)]),
        ]));

        let scene = c.generate_mesh(None)?;
        assert_eq!(scene, Some(dir.path().join("scene.json")));
        assert!(dir.path().join("scene.json").exists());

        let files = c.save_segments_as_mesh(Some(dir.path().join("segments")))?;
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.exists()));
        Ok(())
    }

    #[test]
    fn shutdown_publishes_final_scene() {
        let (bus, _tf, mut c) = controller(test_config());
        c.handle_segments(&frame(vec![segment(1, &[(0.1, 0.1, 0.1)])]));
        let mut scenes = bus.subscribe_to(Topic::SceneUpdates);
        assert!(c.shutdown().is_ok());
        assert_eq!(scenes.drain().len(), 1);
    }

    fn with_instance(id: u64, points: &[(f32, f32, f32)], instance: u32) -> SegmentCloud {
        let mut seg = segment(id, points);
        seg.instance = Some(InstanceLabel(instance));
        seg
    }

    #[test]
    fn sliding_window_reuses_extractions_until_eviction() {
        let config = ControllerConfig {
            variant: ControllerVariant::SlidingWindow,
            ..test_config()
        };
        assert_eq!(config.extraction_strategy(), ExtractionStrategy::Caching);
        let (_bus, _tf, mut c) = controller(config);
        c.handle_segments(&frame(vec![
            with_instance(1, &row(0.0, 0.0, 2), 1),
            with_instance(2, &row(100.0, 0.0, 2), 2),
        ]));
        assert_eq!(c.extraction_cache_hits(), 0);

        assert_eq!(c.extract_instances().len(), 2);
        assert_eq!(c.extraction_cache_hits(), 2);

        assert_eq!(c.evict(10.0, Point3::zero()), vec![Label(2)]);
        assert_eq!(c.extract_instances().len(), 1);
        assert_eq!(c.extraction_cache_hits(), 2, "eviction must drop the cache");
        c.extract_instances();
        assert_eq!(c.extraction_cache_hits(), 3);
    }

    #[test]
    fn unbounded_map_scans_fresh_unless_told_otherwise() {
        assert_eq!(test_config().extraction_strategy(), ExtractionStrategy::Fresh);
        let (_bus, _tf, mut c) = controller(test_config());
        c.handle_segments(&frame(vec![with_instance(1, &row(0.0, 0.0, 2), 1)]));
        c.extract_instances();
        assert_eq!(c.extraction_cache_hits(), 0);

        let windowed_fresh = ControllerConfig {
            variant: ControllerVariant::SlidingWindow,
            extraction: Some(ExtractionStrategy::Fresh),
            ..test_config()
        };
        assert_eq!(windowed_fresh.extraction_strategy(), ExtractionStrategy::Fresh);
    }

    fn features_at(points: &[(f32, f32, f32)]) -> FeatureObservation {
        FeatureObservation {
            timestamp: chrono::Utc::now(),
            pose: Pose::identity(),
            features: points
                .iter()
                .map(|&(x, y, z)| gsm_types::Feature3D {
                    position: Point3::new(x, y, z),
                    descriptor: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn feature_frames_publish_touched_feature_blocks() -> Result<(), Box<dyn std::error::Error>> {
        let config = ControllerConfig {
            publish_feature_blocks: true,
            ..test_config()
        };
        let (bus, _tf, mut c) = controller(config);
        let mut blocks = bus.subscribe_to(Topic::FeatureBlocks);

        let inserted = c.handle_features(&features_at(&[(0.2, 0.2, 0.2), (0.3, 0.3, 0.3), (5.2, 0.2, 0.2)]));

        assert_eq!(inserted, 3);
        let event = blocks.try_recv()?;
        let EventPayload::FeatureBlocks(update) = event.payload else {
            panic!("expected feature blocks");
        };
        assert_eq!(update.blocks.len(), 2);
        assert_eq!(update.blocks[0].index, BlockIndex::new(0, 0, 0));
        assert_eq!(update.blocks[0].features.len(), 2);
        assert_eq!(update.blocks[1].index, BlockIndex::new(5, 0, 0));
        Ok(())
    }

    #[test]
    fn feature_blocks_are_quiet_by_default() {
        let (bus, _tf, mut c) = controller(test_config());
        let mut blocks = bus.subscribe_to(Topic::FeatureBlocks);
        c.handle_features(&features_at(&[(0.2, 0.2, 0.2)]));
        assert!(blocks.drain().is_empty());
    }

    #[test]
    fn without_label_propagation_every_segment_is_new() {
        let config = ControllerConfig {
            use_label_propagation: false,
            ..test_config()
        };
        let (_bus, _tf, mut c) = controller(config);
        c.handle_segments(&frame(vec![segment(1, &[(0.1, 0.1, 0.1)])]));
        let report = c.handle_segments(&frame(vec![segment(2, &[(0.1, 0.1, 0.1)])]));
        assert_eq!(report.labels, vec![Label(2)]);
        assert!(report.merges.is_empty());
    }

    #[test]
    fn semantic_instance_tallies_can_be_disabled() {
        let config = ControllerConfig {
            enable_semantic_instance_segmentation: false,
            ..test_config()
        };
        let (_bus, _tf, mut c) = controller(config);
        let mut seg = with_instance(1, &[(0.1, 0.1, 0.1)], 2);
        seg.semantic = Some(SemanticLabel(4));
        c.handle_segments(&frame(vec![seg]));

        assert_eq!(c.map().dominant_semantic(Label(1)), None);
        assert!(c.extract_instances().is_empty());
    }
}
