//! In-process registries: live worker loops, runtime handles of running
//! attempts, and per-project GC locks.
//!
//! Each registry is an explicit object shared through `Arc` and guarded by a
//! `std::sync::Mutex`. Critical sections never await.

use factory_core::Id;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- Worker registry ---

/// Handle of a live worker loop.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub project_id: Id,
    pub run_id: Id,
    pub max_parallel: usize,
    /// Cooperative stop flag, checked once per iteration.
    pub stop: CancellationToken,
}

impl WorkerHandle {
    pub fn new(project_id: Id, run_id: Id, max_parallel: usize) -> Self {
        Self {
            project_id,
            run_id,
            max_parallel,
            stop: CancellationToken::new(),
        }
    }
}

/// At most one worker loop per project.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Mutex<HashMap<Id, WorkerHandle>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` unless its project already has a live worker.
    pub fn try_register(&self, handle: WorkerHandle) -> bool {
        let mut workers = lock(&self.workers);
        if workers.contains_key(&handle.project_id) {
            return false;
        }
        workers.insert(handle.project_id.clone(), handle);
        true
    }

    pub fn get(&self, project_id: &Id) -> Option<WorkerHandle> {
        lock(&self.workers).get(project_id).cloned()
    }

    pub fn is_live(&self, project_id: &Id) -> bool {
        lock(&self.workers).contains_key(project_id)
    }

    /// True if some live worker drives `run_id`.
    pub fn drives_run(&self, run_id: &Id) -> bool {
        lock(&self.workers).values().any(|h| &h.run_id == run_id)
    }

    /// Flag the project's worker to stop. Returns false if none is live.
    pub fn request_stop(&self, project_id: &Id) -> bool {
        match lock(&self.workers).get(project_id) {
            Some(handle) => {
                handle.stop.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the project's entry only if it still belongs to `run_id`.
    pub fn remove_if_run(&self, project_id: &Id, run_id: &Id) -> bool {
        let mut workers = lock(&self.workers);
        match workers.get(project_id) {
            Some(handle) if &handle.run_id == run_id => {
                workers.remove(project_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.workers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.workers).clear();
    }
}

/// Deregisters a worker when dropped, including on panic.
#[derive(Debug)]
pub struct WorkerGuard {
    registry: Arc<WorkerRegistry>,
    project_id: Id,
    run_id: Id,
}

impl WorkerGuard {
    pub fn new(registry: Arc<WorkerRegistry>, project_id: Id, run_id: Id) -> Self {
        Self {
            registry,
            project_id,
            run_id,
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.registry.remove_if_run(&self.project_id, &self.run_id);
    }
}

// --- Runtime handles ---

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StopError(pub String);

/// Ability to force-stop one running attempt.
pub trait RuntimeHandle: Send + Sync + std::fmt::Debug {
    fn stop(&self) -> Result<(), StopError>;
}

/// Runtime handle backed by the attempt's cancellation token. The runner
/// kills the agent process when the token fires.
#[derive(Debug, Clone)]
pub struct TokenHandle {
    token: CancellationToken,
}

impl TokenHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl RuntimeHandle for TokenHandle {
    fn stop(&self) -> Result<(), StopError> {
        self.token.cancel();
        Ok(())
    }
}

/// Runtime handles keyed by attempt id.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: Mutex<HashMap<Id, Arc<dyn RuntimeHandle>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, attempt_id: Id, handle: Arc<dyn RuntimeHandle>) {
        lock(&self.handles).insert(attempt_id, handle);
    }

    pub fn get(&self, attempt_id: &Id) -> Option<Arc<dyn RuntimeHandle>> {
        lock(&self.handles).get(attempt_id).cloned()
    }

    pub fn unregister(&self, attempt_id: &Id) -> Option<Arc<dyn RuntimeHandle>> {
        lock(&self.handles).remove(attempt_id)
    }

    pub fn contains(&self, attempt_id: &Id) -> bool {
        lock(&self.handles).contains_key(attempt_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.handles).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.handles).clear();
    }
}

// --- GC locks ---

/// Projects with a guarded GC pass in flight.
#[derive(Debug, Default)]
pub struct GcLocks {
    held: Mutex<HashSet<Id>>,
}

impl GcLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the project's lock, or `None` if a pass is already running.
    pub fn try_acquire(self: &Arc<Self>, project_id: &Id) -> Option<GcLockGuard> {
        if !lock(&self.held).insert(project_id.clone()) {
            return None;
        }
        Some(GcLockGuard {
            locks: Arc::clone(self),
            project_id: project_id.clone(),
        })
    }

    pub fn is_held(&self, project_id: &Id) -> bool {
        lock(&self.held).contains(project_id)
    }

    pub fn clear(&self) {
        lock(&self.held).clear();
    }
}

/// Releases a project's GC lock when dropped.
#[derive(Debug)]
pub struct GcLockGuard {
    locks: Arc<GcLocks>,
    project_id: Id,
}

impl Drop for GcLockGuard {
    fn drop(&mut self) {
        lock(&self.locks.held).remove(&self.project_id);
    }
}
