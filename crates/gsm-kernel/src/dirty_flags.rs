//! [`MeshDirtyFlags`] – the only state shared between the service task and
//! the visualization worker.
//!
//! The record holds two booleans:
//!
//! | Flag | Meaning |
//! |------|---------|
//! | `updated` | Some blocks changed since the last mesh pass. |
//! | `need_full_remesh` | Every mesh view must be rebuilt from scratch. |
//!
//! Every write goes through one lock and re-applies the merge rule
//! `need_full_remesh ⇒ updated`, so no reader can ever observe a full-remesh
//! request without the dirty bit.  The lock is held only for the duration of
//! the read-and-clear or set itself.
//!
//! A mesh pass claims the flags with [`MeshDirtyFlags::take`] before it starts
//! working, so anything raised while the pass runs is left for the next one.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Snapshot of the dirty-flag pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyState {
    pub updated: bool,
    pub need_full_remesh: bool,
}

impl DirtyState {
    fn normalized(self) -> Self {
        Self {
            updated: self.updated || self.need_full_remesh,
            need_full_remesh: self.need_full_remesh,
        }
    }

    pub fn is_clean(&self) -> bool {
        !self.updated && !self.need_full_remesh
    }
}

/// Lock-guarded dirty-flag record.
///
/// Share it with `Arc<MeshDirtyFlags>`.
///
/// # Example
///
/// ```
/// use gsm_kernel::dirty_flags::MeshDirtyFlags;
///
/// let flags = MeshDirtyFlags::new();
/// flags.request_full_remesh();
///
/// let state = flags.snapshot();
/// assert!(state.need_full_remesh);
/// assert!(state.updated);
/// ```
#[derive(Debug, Default)]
pub struct MeshDirtyFlags {
    state: Mutex<DirtyState>,
}

impl MeshDirtyFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DirtyState> {
        // A panicking writer cannot leave the two booleans half-written, so a
        // poisoned lock still holds a usable value.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, f: impl FnOnce(&mut DirtyState)) -> DirtyState {
        let mut guard = self.lock();
        f(&mut guard);
        *guard = guard.normalized();
        *guard
    }

    /// Raise `updated`.
    pub fn mark_updated(&self) {
        self.write(|s| s.updated = true);
    }

    /// Raise `need_full_remesh` (and with it `updated`).
    pub fn request_full_remesh(&self) {
        self.write(|s| s.need_full_remesh = true);
    }

    pub fn snapshot(&self) -> DirtyState {
        *self.lock()
    }

    /// Read and clear both flags in one lock section.
    pub fn take(&self) -> DirtyState {
        std::mem::take(&mut *self.lock())
    }
}
