//! An evaluation manager running an evaluation computation.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

use fedcomp_core::{Computation, ExecutionContext, Value};

use crate::{
    data_source::FederatedDataSourceIterator,
    learning::to_json,
    managers::{
        EvaluationManager,
        EvaluationTask,
        ManagerError,
        ProgramStateManager,
        ReleaseManager,
    },
    task_manager::TaskManager,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// An evaluation that was started but didn't finish yet.
pub struct PendingEvaluation {
    /// The time the evaluated round finished at, in seconds since the epoch.
    pub timestamp: i64,
    pub model_weights: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
/// The unfinished evaluations by round.
pub struct PendingEvaluations(pub BTreeMap<u64, PendingEvaluation>);

/// Persists the pending evaluations. Every change is saved as a new version.
struct Store {
    manager: Arc<dyn ProgramStateManager<PendingEvaluations>>,
    version: AsyncMutex<u64>,
}

struct Inner<I> {
    context: Arc<dyn ExecutionContext>,
    evaluation: Computation,
    data_iterator: AsyncMutex<I>,
    clients_per_evaluation: usize,
    metrics_manager: Arc<dyn ReleaseManager<serde_json::Value, u64>>,
    store: Option<Store>,
    pending: Mutex<PendingEvaluations>,
    finished: Notify,
    resumed_tasks: TaskManager,
}

impl<I> Inner<I> {
    fn pending(&self) -> MutexGuard<'_, PendingEvaluations> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Saves the current pending evaluations, if a store is configured.
    async fn persist(&self) -> Result<(), ManagerError> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };
        // holding the version lock orders the snapshots and their saves
        let mut version = store.version.lock().await;
        let snapshot = self.pending().clone();
        store.manager.save(&snapshot, *version + 1).await?;
        *version += 1;
        Ok(())
    }

    async fn finish(&self, round: u64) {
        self.pending().0.remove(&round);
        if let Err(err) = self.persist().await {
            warn!("failed to save the finished evaluation of round {}: {:#}", round, err);
        }
        self.finished.notify_waiters();
    }
}

/// Evaluates model weights with a computation taking `<weights@SERVER, data@CLIENTS>` and
/// returning server placed metrics, which are released with the round as key.
///
/// Without a state manager evaluations are tracked in memory only. With one, every started and
/// finished evaluation is saved, and [`resume_from_previous_state`] restarts the evaluations a
/// previous run didn't finish.
///
/// [`resume_from_previous_state`]: EvaluationManager::resume_from_previous_state
pub struct ComputationEvaluationManager<I> {
    inner: Arc<Inner<I>>,
}

impl<I> ComputationEvaluationManager<I>
where
    I: FederatedDataSourceIterator<Data = Value> + 'static,
{
    pub fn new(
        context: Arc<dyn ExecutionContext>,
        evaluation: Computation,
        data_iterator: I,
        clients_per_evaluation: usize,
        metrics_manager: Arc<dyn ReleaseManager<serde_json::Value, u64>>,
    ) -> Self {
        Self::with_store(
            context,
            evaluation,
            data_iterator,
            clients_per_evaluation,
            metrics_manager,
            None,
        )
    }

    /// Creates a manager saving its pending evaluations with `state_manager`.
    pub fn persistent(
        context: Arc<dyn ExecutionContext>,
        evaluation: Computation,
        data_iterator: I,
        clients_per_evaluation: usize,
        metrics_manager: Arc<dyn ReleaseManager<serde_json::Value, u64>>,
        state_manager: Arc<dyn ProgramStateManager<PendingEvaluations>>,
    ) -> Self {
        let store = Store {
            manager: state_manager,
            version: AsyncMutex::new(0),
        };
        Self::with_store(
            context,
            evaluation,
            data_iterator,
            clients_per_evaluation,
            metrics_manager,
            Some(store),
        )
    }

    fn with_store(
        context: Arc<dyn ExecutionContext>,
        evaluation: Computation,
        data_iterator: I,
        clients_per_evaluation: usize,
        metrics_manager: Arc<dyn ReleaseManager<serde_json::Value, u64>>,
        store: Option<Store>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                context,
                evaluation,
                data_iterator: AsyncMutex::new(data_iterator),
                clients_per_evaluation,
                metrics_manager,
                store,
                pending: Mutex::new(PendingEvaluations::default()),
                finished: Notify::new(),
                resumed_tasks: TaskManager::new(),
            }),
        }
    }

    /// Gets the rounds whose evaluation didn't finish yet.
    pub fn pending_evaluations(&self) -> Vec<u64> {
        self.inner.pending().0.keys().copied().collect()
    }

    fn task(&self, round: u64, model_weights: Value) -> EvaluationTask {
        let inner = self.inner.clone();
        async move {
            let result = evaluate(&inner, round, model_weights).await;
            inner.finish(round).await;
            result
        }
        .boxed()
    }
}

async fn evaluate<I>(inner: &Inner<I>, round: u64, model_weights: Value) -> anyhow::Result<()>
where
    I: FederatedDataSourceIterator<Data = Value>,
{
    let data = inner
        .data_iterator
        .lock()
        .await
        .select(inner.clients_per_evaluation)?;
    let argument = Value::tuple(vec![Value::at_server(model_weights), data]);
    let metrics = inner.context.invoke(&inner.evaluation, Some(argument)).await?;
    inner.metrics_manager.release(&to_json(&metrics), &round).await?;
    info!("evaluation of round {} finished", round);
    Ok(())
}

#[async_trait]
impl<I> EvaluationManager<Value> for ComputationEvaluationManager<I>
where
    I: FederatedDataSourceIterator<Data = Value> + 'static,
{
    async fn resume_from_previous_state(&self) -> Result<(), ManagerError> {
        let store = match &self.inner.store {
            Some(store) => store,
            None => {
                debug!("no evaluations to resume");
                return Ok(());
            }
        };
        let (loaded, version) = store
            .manager
            .load_latest(&PendingEvaluations::default())
            .await?;
        *store.version.lock().await = version;
        let loaded = loaded.unwrap_or_default();
        if loaded.0.is_empty() {
            debug!("no evaluations to resume");
            return Ok(());
        }

        self.inner.pending().0.extend(loaded.0.clone());
        for (round, evaluation) in loaded.0 {
            info!(
                "restarting the evaluation of round {} finished at {}",
                round, evaluation.timestamp
            );
            self.inner.resumed_tasks.add_task(
                format!("resumed evaluation of round {}", round),
                self.task(round, evaluation.model_weights),
            );
        }
        Ok(())
    }

    async fn start_evaluation(
        &self,
        round: u64,
        timestamp: i64,
        model_weights: Value,
    ) -> Result<EvaluationTask, ManagerError> {
        {
            let mut pending = self.inner.pending();
            if pending.0.contains_key(&round) {
                return Err(anyhow!("the evaluation of round {} is already running", round));
            }
            let evaluation = PendingEvaluation {
                timestamp,
                model_weights: model_weights.clone(),
            };
            pending.0.insert(round, evaluation);
        }
        if let Err(err) = self.inner.persist().await {
            self.inner.pending().0.remove(&round);
            return Err(err.context(format!("failed to save the evaluation of round {}", round)));
        }
        debug!("evaluating round {} finished at {}", round, timestamp);
        Ok(self.task(round, model_weights))
    }

    async fn wait_for_evaluations_to_finish(&self) -> Result<(), ManagerError> {
        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending().0.is_empty() {
                return Ok(());
            }
            notified.await;
        }
    }
}
