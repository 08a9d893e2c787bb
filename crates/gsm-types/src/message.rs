//! Outbound messages and the [`Event`] envelope routed over the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::{BlockIndex, Color, Point3};
use crate::voxel::{Feature3D, LabelVoxel, LayerSnapshot, TsdfVoxel};
use crate::{InstanceLabel, Label, SemanticLabel};

// ────────────────────────────────────────────────────────────────────────────
// Map updates
// ────────────────────────────────────────────────────────────────────────────

/// The layers of one object as sent downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub label: Label,
    /// Labels merged into `label` since it was last published.
    pub merged_labels: Vec<Label>,
    pub semantic: Option<SemanticLabel>,
    pub instance: Option<InstanceLabel>,
    pub tsdf: LayerSnapshot<TsdfVoxel>,
    pub labels: LayerSnapshot<LabelVoxel>,
    pub features: Vec<Feature3D>,
    pub bbox: Option<BoundingBox>,
}

/// A map update carrying one or more objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GsmUpdate {
    pub objects: Vec<ObjectUpdate>,
    /// `true` for a full snapshot of every publishable object.
    pub is_scene: bool,
    /// Centre of the sliding window when the node runs windowed.
    pub window_reference: Option<Point3>,
}

// ────────────────────────────────────────────────────────────────────────────
// Meshes
// ────────────────────────────────────────────────────────────────────────────

/// Which attribute colours a generated mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorScheme {
    /// One colour per object label.
    #[default]
    Label,
    /// One colour per dominant semantic class.
    Semantic,
    /// One colour per instance id.
    Instance,
    /// Observed surface colour, all objects merged.
    Merged,
}

impl ColorScheme {
    pub const ALL: [ColorScheme; 4] = [
        ColorScheme::Label,
        ColorScheme::Semantic,
        ColorScheme::Instance,
        ColorScheme::Merged,
    ];
}

impl std::fmt::Display for ColorScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColorScheme::Label => write!(f, "label"),
            ColorScheme::Semantic => write!(f, "semantic"),
            ColorScheme::Instance => write!(f, "instance"),
            ColorScheme::Merged => write!(f, "merged"),
        }
    }
}

/// Surface geometry of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshBlock {
    pub index: BlockIndex,
    pub vertices: Vec<Point3>,
    pub colors: Vec<Color>,
}

impl MeshBlock {
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

/// A mesh message: either a full scene or the blocks changed since the last
/// one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    /// Set for per-segment meshes.
    pub label: Option<Label>,
    /// `true` when `blocks` is the complete scene.
    pub full: bool,
    pub color_scheme: ColorScheme,
    pub blocks: Vec<MeshBlock>,
    /// Blocks whose mesh must be dropped by the consumer.
    pub removed_blocks: Vec<BlockIndex>,
}

// ────────────────────────────────────────────────────────────────────────────
// Misc outbound
// ────────────────────────────────────────────────────────────────────────────

/// Oriented bounding box of one object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub label: Label,
    pub center: Point3,
    /// Unit quaternion `(w, x, y, z)`.
    pub orientation: [f32; 4],
    /// Full edge lengths along the box axes.
    pub extents: Point3,
}

/// Features held by one block of the feature layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBlock {
    pub index: BlockIndex,
    pub features: Vec<Feature3D>,
}

/// Feature blocks touched by one feature frame, with their full contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBlockUpdate {
    pub blocks: Vec<FeatureBlock>,
}

/// Emitted once per label removed by the sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionNotice {
    pub label: Label,
}

/// Broadcast of the new window reference frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowPose {
    pub parent_frame: String,
    pub child_frame: String,
    pub position: Point3,
}

// ────────────────────────────────────────────────────────────────────────────
// Event envelope
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the outbound bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "gsm-runtime::publisher"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` with a fresh id and the current time.
    pub fn new(source: &str, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.to_string(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    SegmentUpdate(GsmUpdate),
    SceneUpdate(GsmUpdate),
    SegmentMesh(MeshMessage),
    SceneMesh(MeshMessage),
    Eviction(EvictionNotice),
    BoundingBox(BoundingBox),
    WindowPose(WindowPose),
    FeatureBlocks(FeatureBlockUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_scheme_parses_lowercase() {
        let scheme: ColorScheme = serde_json::from_str("\"semantic\"").unwrap();
        assert_eq!(scheme, ColorScheme::Semantic);
        assert_eq!(ColorScheme::default(), ColorScheme::Label);
    }

    #[test]
    fn event_carries_tagged_payload() {
        let event = Event::new(
            "gsm-runtime::window",
            EventPayload::Eviction(EvictionNotice { label: Label(9) }),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"eviction\""));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert!(matches!(
            back.payload,
            EventPayload::Eviction(EvictionNotice { label: Label(9) })
        ));
    }
}
