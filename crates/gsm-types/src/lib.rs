//! `gsm-types` – shared vocabulary of the Global Segment Map node.
//!
//! Every other crate in the workspace speaks in these types: identifiers
//! ([`Label`], [`SegmentId`], ...), voxel primitives, inbound observations,
//! outbound messages and the unified [`GsmError`].
//!
//! # Modules
//!
//! - [`geometry`] – [`Point3`], [`Pose`], [`BlockIndex`] and [`Color`].
//! - [`voxel`] – the per-voxel records stored in the map layers and the
//!   serialisable [`LayerSnapshot`][voxel::LayerSnapshot] used in messages.
//! - [`observation`] – inbound segment clouds and feature detections.
//! - [`message`] – outbound map updates, meshes, eviction notices and the
//!   [`Event`] envelope routed over the bus.

pub mod geometry;
pub mod message;
pub mod observation;
pub mod voxel;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use geometry::{BlockIndex, Color, Point3, Pose};
pub use message::{
    BoundingBox, ColorScheme, Event, EventPayload, EvictionNotice, FeatureBlock,
    FeatureBlockUpdate, GsmUpdate, MeshBlock, MeshMessage, ObjectUpdate, WindowPose,
};
pub use observation::{FeatureObservation, Observation, SegmentCloud, SegmentObservation};
pub use voxel::{Feature3D, LabelVoxel, LayerSnapshot, TsdfVoxel};

// ────────────────────────────────────────────────────────────────────────────
// Identifiers
// ────────────────────────────────────────────────────────────────────────────

/// Persistent identifier of a mapped object.
///
/// Labels are allocated monotonically starting at 1; [`Label::UNASSIGNED`]
/// marks voxels that do not belong to any object yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(pub u32);

impl Label {
    pub const UNASSIGNED: Label = Label(0);

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provisional id of a segment within a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Semantic class reported by the upstream segmenter (e.g. "chair" = 56).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SemanticLabel(pub u32);

/// Instance id reported by the upstream segmenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceLabel(pub u32);

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type spanning pose lookups, configuration, export and
/// transport failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GsmError {
    #[error("Transform from {source_frame} to {target_frame} unavailable: {reason}")]
    TransformUnavailable {
        source_frame: String,
        target_frame: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Mesh export failed: {0}")]
    Export(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
