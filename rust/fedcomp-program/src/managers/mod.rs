//! Interfaces of the collaborators of a training program, and reference implementations.
//!
//! Managers are the boundary to the outside world: persisting program state, releasing values
//! like checkpoints and metrics, and evaluating models. Their failures are reported as
//! [`ManagerError`]s and are never retried by the training program.

pub mod file;
pub mod logging;
pub mod memory;

use async_trait::async_trait;
use futures::future::BoxFuture;

pub use self::{
    file::FileProgramStateManager,
    logging::LoggingReleaseManager,
    memory::{MemoryProgramStateManager, MemoryReleaseManager},
};

/// The error type of managers.
pub type ManagerError = anyhow::Error;

#[async_trait]
/// Persists and restores versions of a program state.
pub trait ProgramStateManager<T>: Send + Sync
where
    T: Send + Sync,
{
    /// Loads the latest saved state and its version.
    ///
    /// `structure` is a state of the expected shape, for managers that need one to restore a
    /// state. If nothing was saved yet, `(None, 0)` is returned.
    async fn load_latest(&self, structure: &T) -> Result<(Option<T>, u64), ManagerError>;

    /// Saves `state` as `version`.
    async fn save(&self, state: &T, version: u64) -> Result<(), ManagerError>;
}

#[async_trait]
/// Releases values, e.g. to storage or to a dashboard.
pub trait ReleaseManager<V, K>: Send + Sync
where
    V: Send + Sync,
    K: Send + Sync,
{
    async fn release(&self, value: &V, key: &K) -> Result<(), ManagerError>;
}

/// An evaluation running in the background.
pub type EvaluationTask = BoxFuture<'static, anyhow::Result<()>>;

#[async_trait]
/// Evaluates snapshots of a model while training continues.
pub trait EvaluationManager<W>: Send + Sync
where
    W: Send + 'static,
{
    /// Reconciles evaluations of a previous run, e.g. restarts the ones that didn't finish.
    async fn resume_from_previous_state(&self) -> Result<(), ManagerError>;

    /// Creates the evaluation of the model weights after `round`, finished at `timestamp` (in
    /// seconds since the epoch). The returned task is run in the background by the caller.
    async fn start_evaluation(
        &self,
        round: u64,
        timestamp: i64,
        model_weights: W,
    ) -> Result<EvaluationTask, ManagerError>;

    /// Waits until all evaluations are recorded as finished.
    async fn wait_for_evaluations_to_finish(&self) -> Result<(), ManagerError>;
}
