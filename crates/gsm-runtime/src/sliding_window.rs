//! [`SlidingWindowTrigger`] – decides when the window must move.
//!
//! Each check resolves the reference pose through the [`TransformService`]
//! and compares its planar distance to the last committed window centre.
//! The trigger only decides; the caller runs the eviction and publish cycle
//! and then [`commit`][SlidingWindowTrigger::commit]s the new centre.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gsm_types::{GsmError, Point3};
use tracing::debug;

use crate::collaborators::TransformService;
use crate::window::WindowState;

pub struct SlidingWindowTrigger {
    state: WindowState,
    parent_frame: String,
    reference_frame: String,
    pose_wait: Duration,
    transforms: Arc<dyn TransformService>,
}

impl SlidingWindowTrigger {
    pub fn new(
        radius: f32,
        parent_frame: impl Into<String>,
        reference_frame: impl Into<String>,
        pose_wait: Duration,
        transforms: Arc<dyn TransformService>,
    ) -> Self {
        Self {
            state: WindowState::new(radius),
            parent_frame: parent_frame.into(),
            reference_frame: reference_frame.into(),
            pose_wait,
            transforms,
        }
    }

    pub fn state(&self) -> &WindowState {
        &self.state
    }

    pub fn radius(&self) -> f32 {
        self.state.radius
    }

    pub fn center(&self) -> Point3 {
        self.state.center
    }

    /// Resolve the reference pose.  Returns the new centre when the pose has
    /// moved strictly more than the radius away from the current one.
    ///
    /// # Errors
    ///
    /// Propagates [`GsmError::TransformUnavailable`]; the window cannot be
    /// maintained without a pose.
    pub async fn check(&mut self) -> Result<Option<Point3>, GsmError> {
        let pose = self
            .transforms
            .lookup(&self.parent_frame, &self.reference_frame, self.pose_wait)
            .await?;
        self.state.last_check = Some(Instant::now());
        let position = pose.translation;
        let distance = position.planar_distance(self.state.center);
        debug!(distance, radius = self.state.radius, "window check");
        Ok((distance > self.state.radius).then_some(position))
    }

    pub fn commit(&mut self, center: Point3) {
        self.state.center = center;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::TfTransformService;
    use gsm_perception::Transform3D;
    use gsm_types::Pose;

    fn trigger(tf: &Arc<TfTransformService>) -> SlidingWindowTrigger {
        SlidingWindowTrigger::new(
            5.0,
            "world",
            "camera",
            Duration::from_millis(20),
            Arc::clone(tf) as Arc<dyn TransformService>,
        )
    }

    fn move_camera(tf: &TfTransformService, x: f32, y: f32) {
        tf.set_transform(
            "world",
            "camera",
            Transform3D::from_pose(&Pose::from_translation(Point3::new(x, y, 0.0))),
        );
    }

    #[tokio::test]
    async fn stays_put_within_radius() -> Result<(), Box<dyn std::error::Error>> {
        let tf = TfTransformService::shared();
        let mut t = trigger(&tf);
        move_camera(&tf, 3.0, 4.0);
        assert_eq!(t.check().await?, None);
        assert!(t.state().last_check.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn moves_beyond_radius_and_recentres_after_commit() -> Result<(), Box<dyn std::error::Error>> {
        let tf = TfTransformService::shared();
        let mut t = trigger(&tf);
        move_camera(&tf, 6.0, 0.0);
        let center = t.check().await?;
        assert_eq!(center, Some(Point3::new(6.0, 0.0, 0.0)));

        // Not committed yet: the same pose still triggers.
        assert!(t.check().await?.is_some());
        t.commit(Point3::new(6.0, 0.0, 0.0));
        assert_eq!(t.check().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn missing_pose_is_an_error() {
        let tf = TfTransformService::shared();
        let mut t = trigger(&tf);
        assert!(matches!(
            t.check().await,
            Err(GsmError::TransformUnavailable { .. })
        ));
    }
}
