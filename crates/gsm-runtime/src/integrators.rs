//! Reference collaborators.
//!
//! Minimal implementations of the boundary traits so the node runs end to
//! end without an external fusion stack:
//!
//! - [`PointVoxelIntegrator`] marks the voxel under every segment point as
//!   surface and votes its label with a saturating confidence counter.
//! - [`BlockFeatureIntegrator`] buckets world-frame features by block.
//! - [`SurfaceMesher`] emits one vertex per observed surface voxel.
//!
//! None of them ray-cast, weight by distance, or triangulate.

use std::collections::{BTreeMap, BTreeSet};

use gsm_perception::{GlobalMap, Transform3D};
use gsm_types::{
    BlockIndex, Color, ColorScheme, FeatureObservation, Label, MeshBlock, Pose, SegmentCloud,
};

use crate::collaborators::{FeatureIntegrator, Integrator, MeshIntegrator};

// ─────────────────────────────────────────────────────────────────────────────
// PointVoxelIntegrator
// ─────────────────────────────────────────────────────────────────────────────

/// Confidence ceiling of a label voxel.
const MAX_CONFIDENCE: u32 = 64;

#[derive(Debug, Default, Clone)]
pub struct PointVoxelIntegrator;

impl PointVoxelIntegrator {
    pub fn new() -> Self {
        Self
    }
}

impl Integrator for PointVoxelIntegrator {
    fn overlaps(&self, map: &GlobalMap, segment: &SegmentCloud, pose: &Pose) -> Vec<(Label, u32)> {
        let to_world = Transform3D::from_pose(pose);
        let mut votes: BTreeMap<Label, u32> = BTreeMap::new();
        for p in &segment.points {
            if let Some(voxel) = map.labels().voxel_at(to_world.apply(*p)) {
                if voxel.label.is_assigned() {
                    *votes.entry(voxel.label).or_insert(0) += 1;
                }
            }
        }
        votes.into_iter().collect()
    }

    fn integrate(
        &mut self,
        map: &mut GlobalMap,
        segment: &SegmentCloud,
        pose: &Pose,
        label: Label,
    ) -> Vec<BlockIndex> {
        let to_world = Transform3D::from_pose(pose);
        let mut touched = BTreeSet::new();
        let mut displaced = BTreeSet::new();
        {
            let (tsdf, labels) = map.layers_mut();
            for (i, p) in segment.points.iter().enumerate() {
                let world = to_world.apply(*p);
                let (index, _) = tsdf.locate(world);
                touched.insert(index);

                let voxel = tsdf.voxel_mut_or_allocate(world);
                let weight = voxel.weight + 1.0;
                voxel.color = blend(voxel.color, segment.color_at(i), voxel.weight, weight);
                voxel.distance = 0.0;
                voxel.weight = weight;

                let lv = labels.voxel_mut_or_allocate(world);
                if lv.label == label {
                    lv.confidence = (lv.confidence + 1).min(MAX_CONFIDENCE);
                } else if lv.confidence <= 1 {
                    if lv.label.is_assigned() {
                        displaced.insert(lv.label);
                    }
                    lv.label = label;
                    lv.confidence = 1;
                } else {
                    lv.confidence -= 1;
                }
            }
        }
        for index in &touched {
            map.mark_touched(*index);
        }
        map.bump_revision(label);
        for other in displaced {
            map.bump_revision(other);
        }
        touched.into_iter().collect()
    }
}

fn blend(old: Color, new: Color, old_weight: f32, total: f32) -> Color {
    let mix = |a: u8, b: u8| ((a as f32 * old_weight + b as f32) / total).round() as u8;
    Color::new(mix(old.r, new.r), mix(old.g, new.g), mix(old.b, new.b))
}

// ─────────────────────────────────────────────────────────────────────────────
// BlockFeatureIntegrator
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct BlockFeatureIntegrator;

impl BlockFeatureIntegrator {
    pub fn new() -> Self {
        Self
    }
}

impl FeatureIntegrator for BlockFeatureIntegrator {
    fn integrate_features(&mut self, map: &mut GlobalMap, observation: &FeatureObservation) -> usize {
        let to_world = Transform3D::from_pose(&observation.pose);
        let mut owners = BTreeSet::new();
        for feature in &observation.features {
            let mut feature = feature.clone();
            feature.position = to_world.apply(feature.position);
            if let Some(voxel) = map.labels().voxel_at(feature.position) {
                if voxel.label.is_assigned() {
                    owners.insert(voxel.label);
                }
            }
            map.features_mut().insert(feature);
        }
        // A feature changes the extracted layers of the label it sits on.
        for label in owners {
            map.bump_revision(label);
        }
        observation.features.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SurfaceMesher
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct SurfaceMesher;

impl SurfaceMesher {
    pub fn new() -> Self {
        Self
    }

    fn color_for(map: &GlobalMap, label: Label, geometry: Color, scheme: ColorScheme) -> Color {
        if !label.is_assigned() {
            return match scheme {
                ColorScheme::Merged => geometry,
                _ => Color::GRAY,
            };
        }
        match scheme {
            ColorScheme::Label => Color::from_id(label.0),
            ColorScheme::Semantic => map
                .dominant_semantic(label)
                .map_or(Color::GRAY, |s| Color::from_id(s.0)),
            ColorScheme::Instance => map
                .instance_of(label)
                .map_or(Color::GRAY, |i| Color::from_id(i.0)),
            ColorScheme::Merged => geometry,
        }
    }
}

impl MeshIntegrator for SurfaceMesher {
    fn mesh_block(
        &self,
        map: &GlobalMap,
        index: BlockIndex,
        scheme: ColorScheme,
        only: Option<Label>,
    ) -> Option<MeshBlock> {
        let tsdf = map.tsdf().block(index)?;
        let labels = map.labels().block(index);
        let surface_band = map.tsdf().voxel_size();

        let mut mesh = MeshBlock {
            index,
            vertices: Vec::new(),
            colors: Vec::new(),
        };
        for (linear, voxel) in tsdf.voxels().iter().enumerate() {
            if !voxel.is_observed() || voxel.distance.abs() > surface_band {
                continue;
            }
            let label = labels
                .and_then(|b| b.voxels().get(linear))
                .map_or(Label::UNASSIGNED, |v| v.label);
            if only.is_some_and(|wanted| wanted != label) {
                continue;
            }
            mesh.vertices.push(map.tsdf().voxel_center(index, linear));
            mesh.colors.push(Self::color_for(map, label, voxel.color, scheme));
        }
        Some(mesh)
    }
}
