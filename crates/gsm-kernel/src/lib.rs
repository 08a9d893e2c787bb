//! `gsm-kernel` – supervision primitives.
//!
//! Small, dependency-free building blocks that regulate the node rather than
//! model the world.
//!
//! # Modules
//!
//! - [`dirty_flags`] – [`MeshDirtyFlags`][dirty_flags::MeshDirtyFlags]:
//!   the lock-guarded `{updated, need_full_remesh}` record shared between the
//!   service task and the visualization worker, with the merge rule
//!   `need_full_remesh ⇒ updated` enforced on every write.
//! - [`watchdog`] – [`IdleWatchdog`][watchdog::IdleWatchdog]:
//!   fires exactly once when no observation has arrived for the configured
//!   timeout, so the service can shut down in an orderly way.

pub mod dirty_flags;
pub mod watchdog;

pub use dirty_flags::{DirtyState, MeshDirtyFlags};
pub use watchdog::{IdleStatus, IdleWatchdog};
