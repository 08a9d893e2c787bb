//! `gsm-runtime` – the segment map pipeline and the node that runs it.
//!
//! # Modules
//!
//! - [`collaborators`] – the seams: [`Integrator`], [`FeatureIntegrator`],
//!   [`MeshIntegrator`] and [`TransformService`], plus the in-process
//!   [`TfTransformService`].
//! - [`integrators`] – reference point-to-voxel integration, feature
//!   integration and surface meshing.
//! - [`extraction`] – per-label layer extraction, fresh or revision-cached.
//! - [`merge`] – [`MergeCandidateTracker`]: overlap votes and merge
//!   resolution for one frame.
//! - [`window`] – [`SpatialWindowManager`]: eviction of objects outside the
//!   window.
//! - [`sliding_window`] – [`SlidingWindowTrigger`]: decides when the window
//!   moves.
//! - [`publisher`] – [`UpdatePublisher`]: change-driven object updates and
//!   scene snapshots.
//! - [`mesh`] – [`MeshUpdateController`]: incremental and full remeshing.
//! - [`export`] – mesh documents on disk.
//! - [`controller`] – [`Controller`]: the pipeline and its control surface.
//! - [`service`] – [`NodeService`]: the async node loop, its handles and the
//!   visualization thread.
//! - [`telemetry`] – [`init_tracing`]: log and span export setup.

pub mod collaborators;
pub mod controller;
pub mod export;
pub mod extraction;
pub mod integrators;
pub mod merge;
pub mod mesh;
pub mod publisher;
pub mod service;
pub mod sliding_window;
pub mod telemetry;
pub mod window;

pub use collaborators::{FeatureIntegrator, Integrator, MeshIntegrator, TfTransformService, TransformService};
pub use controller::{
    Controller, ControllerConfig, ControllerVariant, FrameReport, InstanceSummary, MergeValidation,
    WindowCycle,
};
pub use extraction::{ExtractionStrategy, LabelLayerExtractor, LayerTriple};
pub use merge::MergeCandidateTracker;
pub use mesh::{MeshPass, MeshUpdateController};
pub use publisher::{PublisherConfig, UpdatePublisher};
pub use service::{
    ControlRequest, NodeService, ObservationFeed, ServiceHandle, ShutdownReason, VisualizationStats,
    VisualizationWorker,
};
pub use sliding_window::SlidingWindowTrigger;
pub use telemetry::{LogFormat, TelemetryConfig, TracerProviderGuard, init_tracing};
pub use window::{SpatialWindowManager, WindowState};
