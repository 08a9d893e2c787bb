//! Boundary traits for the collaborators the pipeline drives but does not
//! own the numerics of.
//!
//! | Trait | Responsibility |
//! |---|---|
//! | [`Integrator`] | Fuse a segment into the map, report overlap votes, allocate and merge labels. |
//! | [`FeatureIntegrator`] | Fuse feature detections into the feature layer. |
//! | [`MeshIntegrator`] | Turn one block of the map into surface geometry. |
//! | [`TransformService`] | Resolve the pose of one frame in another, waiting a bounded time. |
//!
//! The reference implementations live in [`crate::integrators`] and, for
//! transforms, in [`TfTransformService`] below.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use gsm_perception::{GlobalMap, TfEngine, Transform3D};
use gsm_types::{
    BlockIndex, ColorScheme, FeatureObservation, GsmError, Label, MeshBlock, Pose, SegmentCloud,
};
use tokio::sync::watch;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Integrators
// ─────────────────────────────────────────────────────────────────────────────

/// Fuses segments into the global map.
///
/// `overlaps` must not mutate the map; it is called for every segment of a
/// frame before any of them is integrated, so votes always refer to the map
/// as it was at the start of the frame.
pub trait Integrator: Send {
    /// Overlap votes of `segment` with labels already in the map.  One entry
    /// per label; the vote is the number of segment points that fall on a
    /// voxel of that label.
    fn overlaps(&self, map: &GlobalMap, segment: &SegmentCloud, pose: &Pose) -> Vec<(Label, u32)>;

    /// Write `segment` into the map under `label`.  Returns the blocks that
    /// were modified.
    fn integrate(
        &mut self,
        map: &mut GlobalMap,
        segment: &SegmentCloud,
        pose: &Pose,
        label: Label,
    ) -> Vec<BlockIndex>;

    /// Allocate a fresh label for a segment that matched nothing.
    fn allocate_label(&mut self, map: &mut GlobalMap) -> Label {
        map.allocate_label()
    }

    /// Rewrite every voxel of `from` to `into` and drop `from`.
    fn merge_labels(&mut self, map: &mut GlobalMap, from: Label, into: Label) {
        map.relabel(from, into);
    }
}

/// Fuses feature detections into the feature layer.
pub trait FeatureIntegrator: Send {
    /// Returns the number of features inserted.
    fn integrate_features(&mut self, map: &mut GlobalMap, observation: &FeatureObservation) -> usize;
}

/// Extracts surface geometry from the map one block at a time.
pub trait MeshIntegrator: Send {
    /// Mesh of block `index` coloured with `scheme`.  When `only` is set,
    /// voxels of other labels are left out.  `None` when the block no longer
    /// exists in the map.
    fn mesh_block(
        &self,
        map: &GlobalMap,
        index: BlockIndex,
        scheme: ColorScheme,
        only: Option<Label>,
    ) -> Option<MeshBlock>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Transform service
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves frame poses.
#[async_trait]
pub trait TransformService: Send + Sync {
    /// Pose of `child_frame` expressed in `parent_frame`, waiting at most
    /// `wait` for the transform to become available.
    ///
    /// # Errors
    ///
    /// [`GsmError::TransformUnavailable`] when no transform arrives in time.
    async fn lookup(&self, parent_frame: &str, child_frame: &str, wait: Duration) -> Result<Pose, GsmError>;
}

/// [`TransformService`] backed by an in-process [`TfEngine`].
///
/// Writers call [`set_transform`][Self::set_transform]; waiting lookups are
/// woken through a version counter on a [`watch`] channel.
#[derive(Debug)]
pub struct TfTransformService {
    engine: RwLock<TfEngine>,
    version: watch::Sender<u64>,
}

impl TfTransformService {
    pub fn new() -> Self {
        Self {
            engine: RwLock::new(TfEngine::new()),
            version: watch::channel(0).0,
        }
    }

    /// Shared handle, the form the pipeline and the service both hold.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register or update `parent_frame → child_frame` and wake waiters.
    pub fn set_transform(&self, parent_frame: &str, child_frame: &str, transform: Transform3D) {
        self.engine
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_transform(parent_frame, child_frame, transform);
        self.version.send_modify(|v| *v += 1);
    }

    fn try_lookup(&self, parent_frame: &str, child_frame: &str) -> Option<Pose> {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(parent_frame, child_frame)
            .map(Transform3D::to_pose)
    }
}

impl Default for TfTransformService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransformService for TfTransformService {
    async fn lookup(&self, parent_frame: &str, child_frame: &str, wait: Duration) -> Result<Pose, GsmError> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut changes = self.version.subscribe();
        loop {
            if let Some(pose) = self.try_lookup(parent_frame, child_frame) {
                return Ok(pose);
            }
            debug!(parent_frame, child_frame, "waiting for transform");
            let unavailable = |reason: &str| GsmError::TransformUnavailable {
                source_frame: parent_frame.to_string(),
                target_frame: child_frame.to_string(),
                reason: reason.to_string(),
            };
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(unavailable("transform source closed")),
                Err(_) => {
                    return Err(unavailable(&format!(
                        "no transform within {:.1}s",
                        wait.as_secs_f64()
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsm_types::Point3;

    #[tokio::test]
    async fn lookup_returns_known_transform_immediately() -> Result<(), Box<dyn std::error::Error>> {
        let tf = TfTransformService::new();
        tf.set_transform(
            "world",
            "camera",
            Transform3D::from_pose(&Pose::from_translation(Point3::new(1.0, 2.0, 3.0))),
        );
        let pose = tf.lookup("world", "camera", Duration::from_millis(10)).await?;
        assert_eq!(pose.translation, Point3::new(1.0, 2.0, 3.0));
        Ok(())
    }

    #[tokio::test]
    async fn lookup_times_out_when_frame_is_missing() {
        let tf = TfTransformService::new();
        let result = tf.lookup("world", "camera", Duration::from_millis(20)).await;
        assert!(matches!(
            result,
            Err(GsmError::TransformUnavailable { ref source_frame, .. }) if source_frame == "world"
        ));
    }

    #[tokio::test]
    async fn lookup_wakes_when_transform_arrives() -> Result<(), Box<dyn std::error::Error>> {
        let tf = TfTransformService::shared();
        let writer = Arc::clone(&tf);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set_transform(
                "world",
                "camera",
                Transform3D::from_pose(&Pose::from_translation(Point3::new(4.0, 0.0, 0.0))),
            );
        });
        let pose = tf.lookup("world", "camera", Duration::from_secs(5)).await?;
        assert_eq!(pose.translation.x, 4.0);
        Ok(())
    }
}
