//! [`MeshUpdateController`] – incremental and full mesh regeneration.
//!
//! Four mesh views are kept side by side, one per [`ColorScheme`].  A periodic
//! tick consults the shared [`MeshDirtyFlags`]:
//!
//! | Flags | Pass |
//! |---|---|
//! | `need_full_remesh` | Rebuild every view from every block, publish a full scene mesh. |
//! | `updated` only | Regenerate the blocks touched since the last tick, publish the delta. |
//! | neither | Nothing. |
//!
//! The flags are claimed (read and cleared) in one short lock section before
//! the pass starts; the mesh work itself runs without holding the lock, and a
//! request raised meanwhile stays pending for the next tick.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use gsm_kernel::MeshDirtyFlags;
use gsm_middleware::MapBus;
use gsm_perception::GlobalMap;
use gsm_types::{BlockIndex, ColorScheme, EventPayload, Label, MeshBlock, MeshMessage};
use tracing::{debug, info};

use crate::collaborators::MeshIntegrator;

const SOURCE: &str = "gsm-runtime::mesh";

/// What a [`MeshUpdateController::tick`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshPass {
    Idle,
    Full { blocks: usize },
    Incremental { updated: usize, removed: usize },
}

pub struct MeshUpdateController {
    flags: Arc<MeshDirtyFlags>,
    mesher: Box<dyn MeshIntegrator>,
    views: BTreeMap<ColorScheme, BTreeMap<BlockIndex, MeshBlock>>,
    scheme: ColorScheme,
    publish_segment_mesh: bool,
    publish_scene_mesh: bool,
    bus: MapBus,
}

impl MeshUpdateController {
    pub fn new(
        flags: Arc<MeshDirtyFlags>,
        mesher: Box<dyn MeshIntegrator>,
        scheme: ColorScheme,
        publish_segment_mesh: bool,
        bus: MapBus,
    ) -> Self {
        Self {
            flags,
            mesher,
            views: ColorScheme::ALL.into_iter().map(|s| (s, BTreeMap::new())).collect(),
            scheme,
            publish_segment_mesh,
            publish_scene_mesh: true,
            bus,
        }
    }

    /// Keep the views up to date but stop emitting scene meshes.
    pub fn with_scene_mesh(mut self, publish: bool) -> Self {
        self.publish_scene_mesh = publish;
        self
    }

    pub fn flags(&self) -> &Arc<MeshDirtyFlags> {
        &self.flags
    }

    pub fn color_scheme(&self) -> ColorScheme {
        self.scheme
    }

    /// Current mesh of one view, ordered by block.
    pub fn view(&self, scheme: ColorScheme) -> Vec<MeshBlock> {
        self.views
            .get(&scheme)
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Mesh of a single label in the configured colour scheme.
    pub fn label_mesh(&self, map: &GlobalMap, label: Label) -> Vec<MeshBlock> {
        map.blocks_of_label(label)
            .into_iter()
            .filter_map(|index| self.mesher.mesh_block(map, index, self.scheme, Some(label)))
            .filter(|b| !b.is_empty())
            .collect()
    }

    /// Run one pass according to the dirty flags.
    pub fn tick(&mut self, map: &mut GlobalMap) -> MeshPass {
        let state = self.flags.take();
        if state.need_full_remesh {
            MeshPass::Full {
                blocks: self.full_pass(map),
            }
        } else if state.updated {
            let touched = map.take_touched();
            self.incremental_pass(map, &touched)
        } else {
            MeshPass::Idle
        }
    }

    /// Force a full pass now, whatever the flags say.
    pub fn regenerate(&mut self, map: &mut GlobalMap) -> usize {
        self.flags.request_full_remesh();
        match self.tick(map) {
            MeshPass::Full { blocks } => blocks,
            _ => 0,
        }
    }

    fn full_pass(&mut self, map: &mut GlobalMap) -> usize {
        let indices = map.tsdf().block_indices();
        for (scheme, view) in self.views.iter_mut() {
            view.clear();
            for &index in &indices {
                if let Some(mesh) = self.mesher.mesh_block(map, index, *scheme, None) {
                    view.insert(index, mesh);
                }
            }
        }
        map.clear_touched();

        let blocks = self.view(self.scheme);
        let count = blocks.len();
        info!(blocks = count, scheme = %self.scheme, "full remesh");
        self.emit_scene_mesh(MeshMessage {
            label: None,
            full: true,
            color_scheme: self.scheme,
            blocks,
            removed_blocks: Vec::new(),
        });
        if self.publish_segment_mesh {
            self.publish_segment_meshes(map, map.labels_list());
        }
        count
    }

    fn incremental_pass(&mut self, map: &GlobalMap, touched: &[BlockIndex]) -> MeshPass {
        if touched.is_empty() {
            return MeshPass::Incremental { updated: 0, removed: 0 };
        }
        let mut updated = Vec::new();
        let mut removed = Vec::new();
        for &index in touched {
            let mut exists = false;
            for (scheme, view) in self.views.iter_mut() {
                match self.mesher.mesh_block(map, index, *scheme, None) {
                    Some(mesh) => {
                        exists = true;
                        view.insert(index, mesh);
                    }
                    None => {
                        view.remove(&index);
                    }
                }
            }
            if exists {
                updated.push(index);
            } else {
                removed.push(index);
            }
        }

        let view = &self.views[&self.scheme];
        let blocks: Vec<MeshBlock> = updated.iter().filter_map(|i| view.get(i).cloned()).collect();
        debug!(updated = updated.len(), removed = removed.len(), "incremental remesh");
        let pass = MeshPass::Incremental {
            updated: updated.len(),
            removed: removed.len(),
        };
        self.emit_scene_mesh(MeshMessage {
            label: None,
            full: false,
            color_scheme: self.scheme,
            blocks,
            removed_blocks: removed,
        });

        if self.publish_segment_mesh {
            let labels: BTreeSet<Label> = updated
                .iter()
                .filter_map(|&i| map.labels().block(i))
                .flat_map(|b| b.voxels().iter().map(|v| v.label))
                .filter(|l| l.is_assigned() && map.contains_label(*l))
                .collect();
            self.publish_segment_meshes(map, labels.into_iter().collect());
        }
        pass
    }

    fn emit_scene_mesh(&self, message: MeshMessage) {
        if self.publish_scene_mesh {
            self.bus.emit(SOURCE, EventPayload::SceneMesh(message));
        }
    }

    fn publish_segment_meshes(&self, map: &GlobalMap, labels: Vec<Label>) {
        for label in labels {
            let blocks = self.label_mesh(map, label);
            if blocks.is_empty() {
                continue;
            }
            self.bus.emit(
                SOURCE,
                EventPayload::SegmentMesh(MeshMessage {
                    label: Some(label),
                    full: true,
                    color_scheme: self.scheme,
                    blocks,
                    removed_blocks: Vec::new(),
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Integrator;
    use crate::integrators::{PointVoxelIntegrator, SurfaceMesher};
    use gsm_middleware::Topic;
    use gsm_perception::MapConfig;
    use gsm_types::{Point3, Pose, SegmentCloud, SegmentId};

    fn setup(segment_mesh: bool) -> (MapBus, MeshUpdateController, GlobalMap) {
        let bus = MapBus::default();
        let controller = MeshUpdateController::new(
            Arc::new(MeshDirtyFlags::new()),
            Box::new(SurfaceMesher::new()),
            ColorScheme::Label,
            segment_mesh,
            bus.clone(),
        );
        let map = GlobalMap::new(MapConfig {
            voxel_size: 0.5,
            voxels_per_side: 2,
        });
        (bus, controller, map)
    }

    fn integrate(map: &mut GlobalMap, points: &[(f32, f32, f32)]) -> Label {
        let label = map.allocate_label();
        let cloud = SegmentCloud::from_points(
            SegmentId(label.0 as u64),
            points.iter().map(|&(x, y, z)| Point3::new(x, y, z)).collect(),
        );
        PointVoxelIntegrator::new().integrate(map, &cloud, &Pose::identity(), label);
        label
    }

    #[test]
    fn full_request_produces_one_full_mesh_and_clears_flags() {
        let (bus, mut mesh, mut map) = setup(false);
        let mut scene = bus.subscribe_to(Topic::SceneMeshes);
        integrate(&mut map, &[(0.1, 0.1, 0.1), (3.1, 0.1, 0.1)]);
        mesh.flags().request_full_remesh();

        assert_eq!(mesh.tick(&mut map), MeshPass::Full { blocks: 2 });

        assert!(mesh.flags().snapshot().is_clean());
        let events = scene.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0].payload, EventPayload::SceneMesh(m) if m.full));
        for scheme in ColorScheme::ALL {
            assert_eq!(mesh.view(scheme).len(), 2);
        }
    }

    #[test]
    fn incremental_pass_only_touches_changed_blocks() {
        let (bus, mut mesh, mut map) = setup(false);
        integrate(&mut map, &[(0.1, 0.1, 0.1)]);
        mesh.regenerate(&mut map);
        let mut scene = bus.subscribe_to(Topic::SceneMeshes);

        integrate(&mut map, &[(5.1, 0.1, 0.1)]);
        mesh.flags().mark_updated();
        assert_eq!(mesh.tick(&mut map), MeshPass::Incremental { updated: 1, removed: 0 });

        let events = scene.drain();
        let EventPayload::SceneMesh(msg) = &events[0].payload else {
            panic!("expected scene mesh");
        };
        assert!(!msg.full);
        assert_eq!(msg.blocks.len(), 1);
        assert_eq!(msg.blocks[0].index, BlockIndex::new(5, 0, 0));
        assert!(mesh.flags().snapshot().is_clean());
    }

    #[test]
    fn removed_blocks_drop_their_mesh() {
        let (_bus, mut mesh, mut map) = setup(false);
        integrate(&mut map, &[(0.1, 0.1, 0.1), (5.1, 0.1, 0.1)]);
        mesh.regenerate(&mut map);

        map.remove_block(BlockIndex::new(5, 0, 0));
        mesh.flags().mark_updated();
        assert_eq!(mesh.tick(&mut map), MeshPass::Incremental { updated: 0, removed: 1 });
        assert_eq!(mesh.view(ColorScheme::Merged).len(), 1);
    }

    #[test]
    fn clean_flags_do_nothing() {
        let (bus, mut mesh, mut map) = setup(false);
        let mut scene = bus.subscribe_to(Topic::SceneMeshes);
        assert_eq!(mesh.tick(&mut map), MeshPass::Idle);
        assert!(scene.drain().is_empty());
    }

    /// Raises a full-remesh request from inside the pass, the way the
    /// visualization worker can while a tick is running.
    struct RequestingMesher {
        inner: SurfaceMesher,
        flags: Arc<MeshDirtyFlags>,
    }

    impl MeshIntegrator for RequestingMesher {
        fn mesh_block(
            &self,
            map: &GlobalMap,
            index: BlockIndex,
            scheme: ColorScheme,
            only: Option<Label>,
        ) -> Option<MeshBlock> {
            self.flags.request_full_remesh();
            self.inner.mesh_block(map, index, scheme, only)
        }
    }

    #[test]
    fn full_remesh_requested_during_a_pass_is_kept() {
        let flags = Arc::new(MeshDirtyFlags::new());
        let mut mesh = MeshUpdateController::new(
            Arc::clone(&flags),
            Box::new(RequestingMesher {
                inner: SurfaceMesher::new(),
                flags: Arc::clone(&flags),
            }),
            ColorScheme::Label,
            false,
            MapBus::default(),
        );
        let mut map = GlobalMap::new(MapConfig {
            voxel_size: 0.5,
            voxels_per_side: 2,
        });
        integrate(&mut map, &[(0.1, 0.1, 0.1)]);
        flags.request_full_remesh();

        assert_eq!(mesh.tick(&mut map), MeshPass::Full { blocks: 1 });
        let pending = flags.snapshot();
        assert!(pending.need_full_remesh);
        assert!(pending.updated);
    }

    #[test]
    fn scene_mesh_can_be_muted() {
        let (bus, mesh, mut map) = setup(false);
        let mut mesh = mesh.with_scene_mesh(false);
        let mut scene = bus.subscribe_to(Topic::SceneMeshes);
        integrate(&mut map, &[(0.1, 0.1, 0.1)]);

        assert_eq!(mesh.regenerate(&mut map), 1);
        assert!(scene.drain().is_empty());
        assert_eq!(mesh.view(ColorScheme::Label).len(), 1);
    }

    #[test]
    fn segment_meshes_follow_touched_labels() {
        let (bus, mut mesh, mut map) = setup(true);
        let mut segments = bus.subscribe_to(Topic::SegmentMeshes);
        let a = integrate(&mut map, &[(0.1, 0.1, 0.1)]);
        mesh.flags().mark_updated();
        mesh.tick(&mut map);

        let events = segments.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0].payload, EventPayload::SegmentMesh(m) if m.label == Some(a)));
        assert_eq!(mesh.label_mesh(&map, a).len(), 1);
    }
}
