//! Spatial window: which objects stay in memory.
//!
//! [`SpatialWindowManager::evict`] drops every sufficiently large object that
//! has no block within a planar radius of the window centre.  Small objects
//! (fewer blocks than the publish minimum) are never evicted here.

use std::time::Instant;

use gsm_perception::GlobalMap;
use gsm_types::{EvictionNotice, Point3};
use tracing::{debug, info};

/// Current window geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowState {
    pub center: Point3,
    pub radius: f32,
    pub last_check: Option<Instant>,
}

impl WindowState {
    /// Window centred at the origin.
    pub fn new(radius: f32) -> Self {
        Self {
            center: Point3::zero(),
            radius,
            last_check: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpatialWindowManager {
    min_blocks: usize,
}

impl SpatialWindowManager {
    pub fn new(min_blocks: usize) -> Self {
        Self { min_blocks }
    }

    pub fn min_blocks(&self) -> usize {
        self.min_blocks
    }

    /// Remove every eligible label with no block centre strictly closer than
    /// `radius` (x/y only) to `center`.  The label's blocks are removed from
    /// the geometric and label layers and the label is forgotten.  Returns one
    /// notice per evicted label.
    pub fn evict(&self, map: &mut GlobalMap, radius: f32, center: Point3) -> Vec<EvictionNotice> {
        let block_size = map.block_size();
        let mut notices = Vec::new();
        for label in map.labels_list() {
            let blocks = map.blocks_of_label(label);
            if blocks.len() < self.min_blocks {
                continue;
            }
            let inside = blocks
                .iter()
                .any(|b| b.center(block_size).planar_distance(center) < radius);
            if inside {
                continue;
            }
            debug!(label = %label, blocks = blocks.len(), "evicting label outside window");
            for index in blocks {
                map.remove_block(index);
            }
            map.forget_label(label);
            notices.push(EvictionNotice { label });
        }
        if !notices.is_empty() {
            info!(
                evicted = notices.len(),
                radius,
                center_x = center.x,
                center_y = center.y,
                "window eviction"
            );
        }
        notices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsm_perception::MapConfig;
    use gsm_types::Label;

    /// 1 m blocks.
    fn map() -> GlobalMap {
        GlobalMap::new(MapConfig {
            voxel_size: 0.5,
            voxels_per_side: 2,
        })
    }

    /// Paint `count` blocks of `label` in a row starting at block (bx, by).
    fn paint_blocks(map: &mut GlobalMap, label: Label, bx: i32, by: i32, count: i32) {
        for i in 0..count {
            let p = Point3::new((bx + i) as f32 + 0.1, by as f32 + 0.1, 0.1);
            let (tsdf, labels) = map.layers_mut();
            tsdf.voxel_mut_or_allocate(p).weight = 1.0;
            labels.voxel_mut_or_allocate(p).label = label;
        }
        map.register_label(label);
    }

    #[test]
    fn far_objects_are_evicted_near_ones_kept() {
        let mut m = map();
        paint_blocks(&mut m, Label(1), 0, 0, 5);
        paint_blocks(&mut m, Label(2), 100, 0, 5);
        paint_blocks(&mut m, Label(3), 0, 100, 5);

        let notices = SpatialWindowManager::new(3).evict(&mut m, 10.0, Point3::zero());

        let evicted: Vec<Label> = notices.iter().map(|n| n.label).collect();
        assert_eq!(evicted, vec![Label(2), Label(3)]);
        assert!(m.contains_label(Label(1)));
        assert!(!m.contains_label(Label(2)));
        assert!(m.blocks_of_label(Label(2)).is_empty());
        assert_eq!(m.blocks_of_label(Label(1)).len(), 5);
    }

    #[test]
    fn one_block_inside_keeps_the_whole_label() {
        let mut m = map();
        paint_blocks(&mut m, Label(1), 8, 0, 10);
        let notices = SpatialWindowManager::new(3).evict(&mut m, 10.0, Point3::zero());
        assert!(notices.is_empty());
        assert_eq!(m.blocks_of_label(Label(1)).len(), 10);
    }

    #[test]
    fn distance_equal_to_radius_is_outside() {
        let mut m = map();
        // Block centres at x = 10.5, 11.5, 12.5.
        paint_blocks(&mut m, Label(1), 10, -1, 3);
        let center = Point3::new(0.5, -0.5, 0.0);
        let notices = SpatialWindowManager::new(3).evict(&mut m, 10.0, center);
        assert_eq!(notices.len(), 1);
    }

    #[test]
    fn small_objects_are_never_evicted() {
        let mut m = map();
        paint_blocks(&mut m, Label(1), 100, 100, 2);
        let notices = SpatialWindowManager::new(3).evict(&mut m, 1.0, Point3::zero());
        assert!(notices.is_empty());
        assert!(m.contains_label(Label(1)));
    }

    #[test]
    fn height_is_ignored() {
        let mut m = map();
        for i in 0..3 {
            let p = Point3::new(i as f32 + 0.1, 0.1, 500.0);
            let (tsdf, labels) = m.layers_mut();
            tsdf.voxel_mut_or_allocate(p).weight = 1.0;
            labels.voxel_mut_or_allocate(p).label = Label(1);
        }
        m.register_label(Label(1));
        assert!(SpatialWindowManager::new(3).evict(&mut m, 5.0, Point3::zero()).is_empty());
    }

    #[test]
    fn empty_map_is_a_no_op() {
        let mut m = map();
        assert!(SpatialWindowManager::new(1).evict(&mut m, 1.0, Point3::zero()).is_empty());
    }
}
