//! Inbound observations.
//!
//! The node consumes two streams: segment point clouds (one frame of
//! provisionally-labelled clusters) and feature detections.  Both carry the
//! sensor pose at acquisition time so the node can anchor them in the world
//! frame.
//!
//! On the wire an [`Observation`] is tagged by `kind`:
//!
//! ```json
//! {"kind":"segments","pose":{"translation":{"x":0,"y":0,"z":0}},"segments":[]}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::{Color, Point3, Pose};
use crate::voxel::Feature3D;
use crate::{InstanceLabel, SegmentId, SemanticLabel};

/// Any inbound observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    Segments(SegmentObservation),
    Features(FeatureObservation),
}

/// One frame of segment point clouds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentObservation {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Pose of the sensor frame in the world frame.
    pub pose: Pose,
    pub segments: Vec<SegmentCloud>,
}

/// An oriented point set observed in one frame, expressed in the sensor
/// frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentCloud {
    pub id: SegmentId,
    pub points: Vec<Point3>,
    /// Optional per-point normals; empty when not provided.
    #[serde(default)]
    pub normals: Vec<Point3>,
    /// Optional per-point colours; empty when not provided.
    #[serde(default)]
    pub colors: Vec<Color>,
    #[serde(default)]
    pub semantic: Option<SemanticLabel>,
    #[serde(default)]
    pub instance: Option<InstanceLabel>,
}

impl SegmentCloud {
    /// Build a bare segment from points only.
    pub fn from_points(id: SegmentId, points: Vec<Point3>) -> Self {
        Self {
            id,
            points,
            normals: Vec::new(),
            colors: Vec::new(),
            semantic: None,
            instance: None,
        }
    }

    /// Colour of point `i`, falling back to gray.
    pub fn color_at(&self, i: usize) -> Color {
        self.colors.get(i).copied().unwrap_or(Color::GRAY)
    }
}

/// A batch of feature detections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureObservation {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub pose: Pose,
    pub features: Vec<Feature3D>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_observation_parses_from_tagged_json() {
        let raw = r#"{
            "kind": "segments",
            "pose": {"translation": {"x": 1.0, "y": 0.0, "z": 0.0}},
            "segments": [
                {"id": 3, "points": [{"x": 0.1, "y": 0.2, "z": 0.3}], "semantic": 56}
            ]
        }"#;
        let obs: Observation = serde_json::from_str(raw).unwrap();
        match obs {
            Observation::Segments(frame) => {
                assert_eq!(frame.segments.len(), 1);
                assert_eq!(frame.segments[0].id, SegmentId(3));
                assert_eq!(frame.segments[0].semantic, Some(SemanticLabel(56)));
                assert!(frame.segments[0].normals.is_empty());
            }
            Observation::Features(_) => panic!("unexpected variant"),
        }
    }

    #[test]
    fn features_observation_parses_from_tagged_json() {
        let raw = r#"{
            "kind": "features",
            "pose": {"translation": {"x": 0.0, "y": 0.0, "z": 0.0}},
            "features": [{"position": {"x": 1.0, "y": 1.0, "z": 1.0}, "descriptor": [0.5, 0.25]}]
        }"#;
        let obs: Observation = serde_json::from_str(raw).unwrap();
        assert!(matches!(obs, Observation::Features(ref f) if f.features.len() == 1));
    }

    #[test]
    fn missing_color_falls_back_to_gray() {
        let seg = SegmentCloud::from_points(SegmentId(1), vec![Point3::zero()]);
        assert_eq!(seg.color_at(0), Color::GRAY);
    }
}
