//! [`NodeService`] – the running node.
//!
//! One task owns the [`Controller`] and serialises everything that touches
//! the map through a single `tokio::select!` loop:
//!
//! | Branch | Action |
//! |---|---|
//! | observation | Anchor the sensor frame in the transform tree, then integrate. |
//! | control request | Answer through the request's oneshot reply. |
//! | mesh timer | Run one mesh pass against the dirty flags. |
//! | window timer | Sliding-window check; armed once the first segment frame has arrived. |
//! | idle timer | Shut down when no observation arrived within the timeout. |
//!
//! Producers hold an [`ObservationFeed`]; once every feed is dropped the input
//! is closed.  Control requests travel through a cloneable [`ServiceHandle`].
//!
//! [`VisualizationWorker`] is the dedicated OS thread that consumes the scene
//! mesh topic and asks for a full remesh whenever it falls behind.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::StreamExt;
use gsm_kernel::{IdleStatus, MeshDirtyFlags};
use gsm_middleware::{MapBus, ObservationSource, TopicReceiver};
use gsm_perception::Transform3D;
use gsm_types::{
    BlockIndex, EventPayload, GsmError, Label, LayerSnapshot, Observation, TsdfVoxel,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::collaborators::{TfTransformService, TransformService};
use crate::controller::{Controller, ControllerConfig, InstanceSummary, MergeValidation};

const OBSERVATION_QUEUE: usize = 64;
const CONTROL_QUEUE: usize = 16;

// ─────────────────────────────────────────────────────────────────────────────
// Requests and handles
// ─────────────────────────────────────────────────────────────────────────────

pub enum ControlRequest {
    PublishScene {
        reply: oneshot::Sender<usize>,
    },
    ValidateMergedObject {
        labels: Vec<Label>,
        proposed: LayerSnapshot<TsdfVoxel>,
        reply: oneshot::Sender<Result<MergeValidation, GsmError>>,
    },
    GenerateMesh {
        path: Option<PathBuf>,
        reply: oneshot::Sender<Result<Option<PathBuf>, GsmError>>,
    },
    SaveSegmentsAsMesh {
        dir: Option<PathBuf>,
        reply: oneshot::Sender<Result<Vec<PathBuf>, GsmError>>,
    },
    ExtractInstances {
        reply: oneshot::Sender<Vec<InstanceSummary>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable control surface of a running [`NodeService`].
#[derive(Clone, Debug)]
pub struct ServiceHandle {
    control: mpsc::Sender<ControlRequest>,
}

impl ServiceHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlRequest,
    ) -> Result<T, GsmError> {
        let (reply, response) = oneshot::channel();
        self.control
            .send(build(reply))
            .await
            .map_err(|_| GsmError::Channel("node service is not running".to_string()))?;
        response
            .await
            .map_err(|_| GsmError::Channel("node service dropped the request".to_string()))
    }

    pub async fn publish_scene(&self) -> Result<usize, GsmError> {
        self.request(|reply| ControlRequest::PublishScene { reply }).await
    }

    pub async fn validate_merged_object(
        &self,
        labels: Vec<Label>,
        proposed: LayerSnapshot<TsdfVoxel>,
    ) -> Result<MergeValidation, GsmError> {
        self.request(|reply| ControlRequest::ValidateMergedObject {
            labels,
            proposed,
            reply,
        })
        .await?
    }

    pub async fn generate_mesh(&self, path: Option<PathBuf>) -> Result<Option<PathBuf>, GsmError> {
        self.request(|reply| ControlRequest::GenerateMesh { path, reply }).await?
    }

    pub async fn save_segments_as_mesh(&self, dir: Option<PathBuf>) -> Result<Vec<PathBuf>, GsmError> {
        self.request(|reply| ControlRequest::SaveSegmentsAsMesh { dir, reply })
            .await?
    }

    pub async fn extract_instances(&self) -> Result<Vec<InstanceSummary>, GsmError> {
        self.request(|reply| ControlRequest::ExtractInstances { reply }).await
    }

    /// Ask the service to publish its final state and stop.
    pub async fn shutdown(&self) -> Result<(), GsmError> {
        self.request(|reply| ControlRequest::Shutdown { reply }).await
    }

    /// Fire-and-forget shutdown for contexts that cannot await, such as a
    /// signal handler.
    pub fn try_shutdown(&self) -> bool {
        let (reply, _) = oneshot::channel();
        self.control.try_send(ControlRequest::Shutdown { reply }).is_ok()
    }
}

/// Producer side of the observation queue.
#[derive(Clone, Debug)]
pub struct ObservationFeed {
    sender: mpsc::Sender<Observation>,
}

impl ObservationFeed {
    pub async fn submit(&self, observation: Observation) -> Result<(), GsmError> {
        self.sender
            .send(observation)
            .await
            .map_err(|_| GsmError::Channel("node service is not running".to_string()))
    }

    /// Forward every observation of `source` until it ends.  Returns the
    /// number forwarded.
    pub async fn pump(self, source: &dyn ObservationSource) -> Result<u64, GsmError> {
        let mut stream = source.observation_stream().await;
        let mut forwarded = 0;
        while let Some(observation) = stream.next().await {
            self.submit(observation).await?;
            forwarded += 1;
        }
        info!(forwarded, "observation source exhausted");
        Ok(forwarded)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// No observation within the configured timeout.
    IdleTimeout,
    /// A [`ServiceHandle::shutdown`] request.
    Requested,
    /// Every [`ObservationFeed`] was dropped and idle shutdown is disabled.
    InputClosed,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::IdleTimeout => write!(f, "no new observations"),
            ShutdownReason::Requested => write!(f, "shutdown requested"),
            ShutdownReason::InputClosed => write!(f, "observation input closed"),
        }
    }
}

pub struct NodeService {
    controller: Controller,
    transforms: Arc<TfTransformService>,
    observations: mpsc::Receiver<Observation>,
    control: mpsc::Receiver<ControlRequest>,
}

impl NodeService {
    /// Build the service around a fresh [`Controller`].
    ///
    /// # Errors
    ///
    /// [`GsmError::InvalidConfig`] when `config` does not validate.
    pub fn new(
        config: ControllerConfig,
        bus: MapBus,
        flags: Arc<MeshDirtyFlags>,
    ) -> Result<(Self, ServiceHandle, ObservationFeed), GsmError> {
        let transforms = TfTransformService::shared();
        let controller = Controller::new(
            config,
            bus,
            flags,
            Arc::clone(&transforms) as Arc<dyn TransformService>,
        )?;
        Ok(Self::with_controller(controller, transforms))
    }

    /// Wrap an already-built controller.  `transforms` must be the service
    /// the controller resolves its window pose through.
    pub fn with_controller(
        controller: Controller,
        transforms: Arc<TfTransformService>,
    ) -> (Self, ServiceHandle, ObservationFeed) {
        let (obs_tx, obs_rx) = mpsc::channel(OBSERVATION_QUEUE);
        let (ctl_tx, ctl_rx) = mpsc::channel(CONTROL_QUEUE);
        (
            Self {
                controller,
                transforms,
                observations: obs_rx,
                control: ctl_rx,
            },
            ServiceHandle { control: ctl_tx },
            ObservationFeed { sender: obs_tx },
        )
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Run until shutdown.
    ///
    /// # Errors
    ///
    /// A window check that cannot resolve the reference pose is fatal, as is
    /// a failed final mesh export.
    pub async fn run(mut self) -> Result<ShutdownReason, GsmError> {
        let config = self.controller.config().clone();

        let mut mesh_timer = interval(config.mesh_period);
        mesh_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut window_timer = interval(non_zero(config.window_check_period));
        window_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut idle_timer = interval(idle_poll_period(config.no_update_timeout));
        idle_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let windowed = self.controller.is_windowed();
        let idle_enabled = self.controller.idle_shutdown_enabled();
        let mut input_open = true;
        let mut control_open = true;

        info!(windowed, idle_enabled, "node service running");

        loop {
            tokio::select! {
                // ── Control ───────────────────────────────────────────────
                request = self.control.recv(), if control_open => match request {
                    Some(ControlRequest::Shutdown { reply }) => {
                        self.drain_observations();
                        self.controller.shutdown()?;
                        let _ = reply.send(());
                        return Ok(ShutdownReason::Requested);
                    }
                    Some(request) => {
                        self.drain_observations();
                        self.answer(request);
                    }
                    None => {
                        debug!("all control handles dropped");
                        control_open = false;
                    }
                },

                // ── Observations ──────────────────────────────────────────
                observation = self.observations.recv(), if input_open => match observation {
                    Some(observation) => self.ingest(observation),
                    None => {
                        input_open = false;
                        info!("observation input closed");
                        if !idle_enabled {
                            self.controller.shutdown()?;
                            return Ok(ShutdownReason::InputClosed);
                        }
                    }
                },

                // ── Timers ────────────────────────────────────────────────
                _ = mesh_timer.tick() => {
                    self.controller.mesh_tick();
                }
                _ = window_timer.tick(), if windowed && self.controller.frames_integrated() > 0 => {
                    if let Err(e) = self.controller.check_window().await {
                        error!(error = %e, "cannot maintain the sliding window");
                        return Err(e);
                    }
                }
                _ = idle_timer.tick(), if idle_enabled => {
                    if self.controller.check_idle() == IdleStatus::Expired {
                        warn!(
                            timeout_s = config.no_update_timeout.as_secs_f64(),
                            "no new observations, shutting down"
                        );
                        self.controller.shutdown()?;
                        return Ok(ShutdownReason::IdleTimeout);
                    }
                }
            }
        }
    }

    fn ingest(&mut self, observation: Observation) {
        if let Observation::Segments(frame) = &observation {
            let config = self.controller.config();
            self.transforms.set_transform(
                &config.world_frame,
                &config.camera_frame,
                Transform3D::from_pose(&frame.pose),
            );
        }
        self.controller.handle_observation(&observation);
    }

    /// Ingest everything already queued, so a control request sees every
    /// observation submitted before it.
    fn drain_observations(&mut self) {
        while let Ok(observation) = self.observations.try_recv() {
            self.ingest(observation);
        }
    }

    fn answer(&mut self, request: ControlRequest) {
        // A dropped reply means the caller gave up; nothing to do about it.
        match request {
            ControlRequest::PublishScene { reply } => {
                let _ = reply.send(self.controller.publish_scene());
            }
            ControlRequest::ValidateMergedObject {
                labels,
                proposed,
                reply,
            } => {
                let _ = reply.send(self.controller.validate_merged_object(&labels, &proposed));
            }
            ControlRequest::GenerateMesh { path, reply } => {
                let _ = reply.send(self.controller.generate_mesh(path));
            }
            ControlRequest::SaveSegmentsAsMesh { dir, reply } => {
                let _ = reply.send(self.controller.save_segments_as_mesh(dir));
            }
            ControlRequest::ExtractInstances { reply } => {
                let _ = reply.send(self.controller.extract_instances());
            }
            ControlRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

fn non_zero(period: Duration) -> Duration {
    period.max(Duration::from_millis(1))
}

fn idle_poll_period(timeout: Duration) -> Duration {
    (timeout / 4).clamp(Duration::from_millis(5), Duration::from_secs(1))
}

// ─────────────────────────────────────────────────────────────────────────────
// Visualization worker
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisualizationStats {
    pub messages: u64,
    pub full_meshes: u64,
    /// Blocks in the visualised scene when the worker stopped.
    pub blocks: usize,
    pub full_remesh_requests: u64,
}

/// Dedicated thread mirroring the scene mesh topic into a local scene.
pub struct VisualizationWorker {
    handle: JoinHandle<VisualizationStats>,
}

impl VisualizationWorker {
    /// Start consuming `receiver` on a thread named `gsm-visualization`.
    ///
    /// # Errors
    ///
    /// [`GsmError::Channel`] when the thread cannot be spawned.
    pub fn spawn(receiver: TopicReceiver, flags: Arc<MeshDirtyFlags>) -> Result<Self, GsmError> {
        let handle = thread::Builder::new()
            .name("gsm-visualization".to_string())
            .spawn(move || visualize(receiver, &flags))
            .map_err(|e| GsmError::Channel(format!("cannot spawn visualization thread: {e}")))?;
        Ok(Self { handle })
    }

    /// Wait for the thread to finish; it ends once the bus is dropped.
    pub fn join(self) -> Result<VisualizationStats, GsmError> {
        self.handle
            .join()
            .map_err(|_| GsmError::Channel("visualization thread panicked".to_string()))
    }
}

fn visualize(mut receiver: TopicReceiver, flags: &MeshDirtyFlags) -> VisualizationStats {
    let mut stats = VisualizationStats::default();
    let mut scene: BTreeMap<BlockIndex, usize> = BTreeMap::new();
    loop {
        match receiver.blocking_recv() {
            Ok(event) => {
                let EventPayload::SceneMesh(mesh) = event.payload else {
                    continue;
                };
                stats.messages += 1;
                if mesh.full {
                    stats.full_meshes += 1;
                    scene.clear();
                }
                for index in &mesh.removed_blocks {
                    scene.remove(index);
                }
                for block in &mesh.blocks {
                    scene.insert(block.index, block.vertices.len());
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(lagged_by = n, "visualization fell behind, requesting full remesh");
                flags.request_full_remesh();
                stats.full_remesh_requests += 1;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    stats.blocks = scene.len();
    debug!(?stats, "visualization stopped");
    stats
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerVariant;
    use gsm_middleware::Topic;
    use gsm_perception::MapConfig;
    use gsm_types::{
        ColorScheme, InstanceLabel, MeshBlock, MeshMessage, Point3, Pose, SegmentCloud, SegmentId,
        SegmentObservation,
    };
    use tokio::time::timeout;

    fn config() -> ControllerConfig {
        ControllerConfig {
            map: MapConfig {
                voxel_size: 0.5,
                voxels_per_side: 2,
            },
            min_blocks_to_publish: 1,
            mesh_period: Duration::from_millis(10),
            window_check_period: Duration::from_millis(10),
            pose_wait: Duration::from_millis(50),
            ..ControllerConfig::default()
        }
    }

    fn frame_at(x: f32) -> Observation {
        let mut segment = SegmentCloud::from_points(SegmentId(1), vec![Point3::new(0.1, 0.1, 0.1)]);
        segment.instance = Some(InstanceLabel(3));
        Observation::Segments(SegmentObservation {
            timestamp: chrono::Utc::now(),
            pose: Pose::from_translation(Point3::new(x, 0.0, 0.0)),
            segments: vec![segment],
        })
    }

    fn start(
        config: ControllerConfig,
    ) -> Result<(MapBus, ServiceHandle, ObservationFeed, tokio::task::JoinHandle<Result<ShutdownReason, GsmError>>), GsmError> {
        let bus = MapBus::default();
        let (service, handle, feed) =
            NodeService::new(config, bus.clone(), Arc::new(MeshDirtyFlags::new()))?;
        Ok((bus, handle, feed, tokio::spawn(service.run())))
    }

    #[tokio::test]
    async fn control_requests_are_answered_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let (_bus, handle, feed, task) = start(config())?;
        feed.submit(frame_at(0.0)).await?;

        assert_eq!(handle.publish_scene().await?, 1);
        let instances = handle.extract_instances().await?;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance, InstanceLabel(3));

        handle.shutdown().await?;
        assert_eq!(task.await??, ShutdownReason::Requested);
        assert!(handle.publish_scene().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn closed_input_stops_the_service() -> Result<(), Box<dyn std::error::Error>> {
        let (_bus, _handle, feed, task) = start(config())?;
        feed.submit(frame_at(0.0)).await?;
        drop(feed);
        let reason = timeout(Duration::from_secs(2), task).await???;
        assert_eq!(reason, ShutdownReason::InputClosed);
        Ok(())
    }

    #[tokio::test]
    async fn idle_timeout_shuts_down_after_first_observation() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, _handle, feed, task) = start(ControllerConfig {
            no_update_timeout: Duration::from_millis(50),
            ..config()
        })?;
        let mut scenes = bus.subscribe_to(Topic::SceneUpdates);
        feed.submit(frame_at(0.0)).await?;

        let reason = timeout(Duration::from_secs(2), task).await???;
        assert_eq!(reason, ShutdownReason::IdleTimeout);
        assert_eq!(scenes.drain().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn window_follows_the_sensor_pose() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, handle, feed, task) = start(ControllerConfig {
            variant: ControllerVariant::SlidingWindow,
            window_radius: 2.0,
            ..config()
        })?;
        let mut poses = bus.subscribe_to(Topic::WindowPose);
        let mut evictions = bus.subscribe_to(Topic::Evictions);

        feed.submit(frame_at(0.0)).await?;
        feed.submit(frame_at(20.0)).await?;

        let event = timeout(Duration::from_secs(2), poses.recv())
            .await?
            .ok_or("bus closed")?;
        let EventPayload::WindowPose(pose) = event.payload else {
            panic!("expected a window pose");
        };
        assert_eq!(pose.position, Point3::new(20.0, 0.0, 0.0));
        assert_eq!(pose.child_frame, "sliding_window");

        // The cycle evicts around the previous centre: the object seen from
        // x = 20 goes, the one at the origin stays until the next move.
        let eviction = timeout(Duration::from_secs(2), evictions.recv())
            .await?
            .ok_or("bus closed")?;
        assert!(matches!(eviction.payload, EventPayload::Eviction(n) if n.label == Label(2)));

        handle.shutdown().await?;
        assert_eq!(task.await??, ShutdownReason::Requested);
        Ok(())
    }

    #[tokio::test]
    async fn feed_pumps_a_json_lines_source() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, _handle, feed, task) = start(config())?;
        let mut updates = bus.subscribe_to(Topic::SegmentUpdates);
        let input = concat!(
            r#"{"kind":"segments","pose":{"translation":{"x":0,"y":0,"z":0}},"segments":[{"id":1,"points":[{"x":0.1,"y":0.1,"z":0.1}]}]}"#,
            "\n",
            "not json\n",
        );
        let source = gsm_middleware::JsonLinesSource::from_reader(std::io::Cursor::new(input.as_bytes().to_vec()));

        assert_eq!(feed.pump(&source).await?, 1);
        assert_eq!(timeout(Duration::from_secs(2), task).await???, ShutdownReason::InputClosed);
        assert_eq!(updates.drain().len(), 1);
        Ok(())
    }

    fn scene_mesh(full: bool, blocks: &[BlockIndex]) -> EventPayload {
        EventPayload::SceneMesh(MeshMessage {
            label: None,
            full,
            color_scheme: ColorScheme::Label,
            blocks: blocks
                .iter()
                .map(|&index| MeshBlock {
                    index,
                    vertices: vec![Point3::zero()],
                    colors: vec![],
                })
                .collect(),
            removed_blocks: vec![],
        })
    }

    #[test]
    fn visualization_mirrors_scene_meshes() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MapBus::default();
        let flags = Arc::new(MeshDirtyFlags::new());
        let receiver = bus.subscribe_to(Topic::SceneMeshes);
        bus.emit("test", scene_mesh(true, &[BlockIndex::new(0, 0, 0), BlockIndex::new(1, 0, 0)]));
        bus.emit("test", scene_mesh(false, &[BlockIndex::new(2, 0, 0)]));
        let worker = VisualizationWorker::spawn(receiver, Arc::clone(&flags))?;
        drop(bus);

        let stats = worker.join()?;
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.full_meshes, 1);
        assert_eq!(stats.blocks, 3);
        assert_eq!(stats.full_remesh_requests, 0);
        Ok(())
    }

    #[test]
    fn lagging_visualization_requests_full_remesh() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MapBus::new(2);
        let flags = Arc::new(MeshDirtyFlags::new());
        let receiver = bus.subscribe_to(Topic::SceneMeshes);
        for i in 0..5 {
            bus.emit("test", scene_mesh(false, &[BlockIndex::new(i, 0, 0)]));
        }
        let worker = VisualizationWorker::spawn(receiver, Arc::clone(&flags))?;
        drop(bus);

        let stats = worker.join()?;
        assert_eq!(stats.full_remesh_requests, 1);
        assert_eq!(stats.messages, 2);
        assert!(flags.snapshot().need_full_remesh);
        Ok(())
    }
}
