//! The training program logic.
//!
//! A training program runs the rounds of a [`LearningProcess`] on the data of a
//! [`FederatedDataSource`]. After every round the program state is saved, so a program that is
//! restarted continues after the last saved round with the same state, data iterator and
//! evaluation schedule.
//!
//! ```text
//! load or init
//!   -> [ run round -> maybe evaluate -> save -> release metrics -> maybe release model ]*
//!   -> finalize
//! ```

#[cfg(test)]
mod tests;

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    clock::{Clock, SystemClock},
    data_source::{DataSourceError, FederatedDataSource, FederatedDataSourceIterator},
    learning::{LearningProcess, LearningProcessOutput},
    managers::{EvaluationManager, ManagerError, ProgramStateManager, ReleaseManager},
    program_state::ProgramState,
    task_manager::TaskManager,
};

/// The default number of rounds between two model releases.
pub const DEFAULT_MODEL_OUTPUT_INTERVAL: u64 = 10;

#[derive(Debug, Error)]
/// Errors of a training program.
pub enum TrainingError {
    #[error("the learning process failed: {0:#}")]
    Process(anyhow::Error),
    #[error("failed to select the training data: {0}")]
    DataSource(#[from] DataSourceError),
    #[error("failed to load or save the program state: {0:#}")]
    ProgramState(ManagerError),
    #[error("failed to release a value: {0:#}")]
    Release(ManagerError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// How often the model is evaluated while training.
pub enum EvaluationPeriod {
    /// After every round whose number is a multiple of the period.
    Rounds(u64),
    /// After the first round finishing past the evaluation deadline. The deadline then moves to
    /// the finish time of that round plus the period.
    Duration(Duration),
}

#[derive(Clone, Debug, PartialEq)]
/// The settings of a training program.
pub struct TrainingSettings {
    /// The number of clients selected per round.
    pub train_per_round_clients: usize,
    /// The total number of rounds, counted from the first round of the first run.
    pub train_total_rounds: u64,
    pub evaluation_period: EvaluationPeriod,
    /// The number of rounds between two model releases. `0` only releases the initial and the
    /// final model.
    pub model_output_interval: u64,
}

impl TrainingSettings {
    pub fn new(
        train_per_round_clients: usize,
        train_total_rounds: u64,
        evaluation_period: EvaluationPeriod,
    ) -> Self {
        Self {
            train_per_round_clients,
            train_total_rounds,
            evaluation_period,
            model_output_interval: DEFAULT_MODEL_OUTPUT_INTERVAL,
        }
    }
}

type ShouldRetryRound<S> = dyn Fn(&LearningProcessOutput<S>) -> bool + Send + Sync;

type ProgramStateOf<P, D> =
    ProgramState<<P as LearningProcess>::State, <D as FederatedDataSource>::Iterator>;

/// The key under which the model after `round` is released.
pub fn checkpoint_key(round: u64) -> String {
    format!("training_checkpoint_round_{}", round)
}

/// Assembles the metrics released after a round: the metrics of the learning process, the
/// training metrics of the clients as `model_metrics` and the `program_metrics` of the round.
pub fn round_metrics(process_metrics: serde_json::Value, num_retries: u64) -> serde_json::Value {
    let model_metrics = process_metrics
        .pointer("/client_work/train")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let mut metrics = match process_metrics {
        serde_json::Value::Object(metrics) => metrics,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut metrics = serde_json::Map::new();
            metrics.insert("process".into(), other);
            metrics
        }
    };
    metrics.insert("model_metrics".into(), model_metrics);
    metrics.insert("program_metrics".into(), json!({ "num_retries": num_retries }));
    serde_json::Value::Object(metrics)
}

/// A resumable training program.
pub struct TrainingProgramLogic<P, D>
where
    P: LearningProcess,
    D: FederatedDataSource,
{
    process: P,
    data_source: D,
    program_state_manager: Arc<dyn ProgramStateManager<ProgramStateOf<P, D>>>,
    model_output_manager: Arc<dyn ReleaseManager<P::State, String>>,
    train_metrics_manager: Arc<dyn ReleaseManager<serde_json::Value, u64>>,
    evaluation_manager: Option<Arc<dyn EvaluationManager<P::ModelWeights>>>,
    initial_state: Option<P::State>,
    should_retry_round: Box<ShouldRetryRound<P::State>>,
    clock: Arc<dyn Clock>,
    settings: TrainingSettings,
    task_manager: TaskManager,
}

impl<P, D> TrainingProgramLogic<P, D>
where
    P: LearningProcess,
    D: FederatedDataSource,
    D::Iterator: FederatedDataSourceIterator<Data = P::Data>,
{
    pub fn new(
        process: P,
        data_source: D,
        program_state_manager: Arc<dyn ProgramStateManager<ProgramStateOf<P, D>>>,
        model_output_manager: Arc<dyn ReleaseManager<P::State, String>>,
        train_metrics_manager: Arc<dyn ReleaseManager<serde_json::Value, u64>>,
        settings: TrainingSettings,
    ) -> Self {
        Self {
            process,
            data_source,
            program_state_manager,
            model_output_manager,
            train_metrics_manager,
            evaluation_manager: None,
            initial_state: None,
            should_retry_round: Box::new(|_| false),
            clock: Arc::new(SystemClock),
            settings,
            task_manager: TaskManager::new(),
        }
    }

    /// Starts from `state` instead of the state created by the learning process.
    pub fn with_initial_state(mut self, state: P::State) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Evaluates the model according to the evaluation period and after the last round.
    pub fn with_evaluation_manager(
        mut self,
        manager: Arc<dyn EvaluationManager<P::ModelWeights>>,
    ) -> Self {
        self.evaluation_manager = Some(manager);
        self
    }

    /// Reruns a round on freshly selected data as long as `should_retry_round` holds for its
    /// output.
    pub fn with_should_retry_round<F>(mut self, should_retry_round: F) -> Self
    where
        F: Fn(&LearningProcessOutput<P::State>) -> bool + Send + Sync + 'static,
    {
        self.should_retry_round = Box::new(should_retry_round);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Trains until the total number of rounds is reached.
    ///
    /// # Errors
    /// Fails as soon as the learning process, the data source, the program state manager or a
    /// release manager fails. Nothing is retried and the state of the failing round is not saved.
    /// Evaluation failures never stop training, they are logged only.
    pub async fn train_model(&self) -> Result<(), TrainingError> {
        let mut program_state = self.load_or_initialize().await?;
        if let Some(manager) = &self.evaluation_manager {
            if let Err(err) = manager.resume_from_previous_state().await {
                error!("failed to resume the evaluations: {:#}", err);
            }
        }

        while program_state.round_number < self.settings.train_total_rounds {
            let round = program_state.round_number + 1;
            self.run_round(&mut program_state, round)
                .instrument(info_span!("train_round", round))
                .await?;
        }

        self.task_manager.wait_for_all_tasks().await;
        if let Some(manager) = &self.evaluation_manager {
            if let Err(err) = manager.wait_for_evaluations_to_finish().await {
                error!("failed to wait for the evaluations: {:#}", err);
            }
        }
        info!("training finished after round {}", program_state.round_number);
        Ok(())
    }

    async fn load_or_initialize(&self) -> Result<ProgramStateOf<P, D>, TrainingError> {
        let state = match &self.initial_state {
            Some(state) => state.clone(),
            None => self.process.initialize().await.map_err(TrainingError::Process)?,
        };
        let baseline = ProgramState::new(state, self.data_source.iterator());
        let (loaded, version) = self
            .program_state_manager
            .load_latest(&baseline)
            .await
            .map_err(TrainingError::ProgramState)?;

        if let Some(program_state) = loaded {
            info!(
                "resuming from program state version {} after round {}",
                version, program_state.round_number
            );
            return Ok(program_state);
        }

        info!("no saved program state found, starting from round 0");
        self.model_output_manager
            .release(&baseline.state, &checkpoint_key(0))
            .await
            .map_err(TrainingError::Release)?;
        let baseline = ProgramState {
            next_evaluation_timestamp_seconds: None,
            ..baseline
        };
        self.program_state_manager
            .save(&baseline, 0)
            .await
            .map_err(TrainingError::ProgramState)?;
        Ok(baseline)
    }

    async fn run_round(
        &self,
        program_state: &mut ProgramStateOf<P, D>,
        round: u64,
    ) -> Result<(), TrainingError> {
        let mut num_retries = 0;
        let output = loop {
            let data = program_state
                .data_iterator
                .select(self.settings.train_per_round_clients)?;
            let output = self
                .process
                .next(program_state.state.clone(), data)
                .await
                .map_err(TrainingError::Process)?;
            if !(self.should_retry_round)(&output) {
                break output;
            }
            num_retries += 1;
            warn!("train round {} is retried, retry {}", round, num_retries);
        };
        info!("Finished train round {} with {} retries.", round, num_retries);

        let LearningProcessOutput { state, metrics } = output;
        program_state.state = state;
        program_state.round_number = round;

        self.maybe_evaluate(program_state, round).await;

        self.program_state_manager
            .save(program_state, round)
            .await
            .map_err(TrainingError::ProgramState)?;
        self.train_metrics_manager
            .release(&round_metrics(metrics, num_retries), &round)
            .await
            .map_err(TrainingError::Release)?;

        let interval = self.settings.model_output_interval;
        if self.is_last_round(round) || (interval > 0 && round % interval == 0) {
            self.model_output_manager
                .release(&program_state.state, &checkpoint_key(round))
                .await
                .map_err(TrainingError::Release)?;
        }
        Ok(())
    }

    fn is_last_round(&self, round: u64) -> bool {
        round == self.settings.train_total_rounds
    }

    /// Starts an evaluation of the model after `round` if one is due. A time based schedule moves
    /// its deadline in `program_state`, even if the evaluation fails to start.
    async fn maybe_evaluate(&self, program_state: &mut ProgramStateOf<P, D>, round: u64) {
        let manager = match &self.evaluation_manager {
            Some(manager) => manager,
            None => return,
        };

        let now = self.clock.now();
        let due = self.is_last_round(round)
            || match self.settings.evaluation_period {
                EvaluationPeriod::Rounds(period) => period > 0 && round % period == 0,
                EvaluationPeriod::Duration(period) => {
                    match program_state.next_evaluation_timestamp_seconds {
                        Some(deadline) if deadline >= now => false,
                        _ => {
                            program_state.next_evaluation_timestamp_seconds =
                                Some(now + period.num_seconds());
                            true
                        }
                    }
                }
            };
        if !due {
            return;
        }

        let model_weights = match self.process.get_model_weights(&program_state.state) {
            Ok(model_weights) => model_weights,
            Err(err) => {
                error!("failed to get the model weights of round {}: {:#}", round, err);
                return;
            }
        };
        match manager.start_evaluation(round, now, model_weights).await {
            Ok(task) => {
                info!("started the evaluation of round {}", round);
                self.task_manager
                    .add_task(format!("evaluation of round {}", round), task);
            }
            Err(err) => error!("failed to start the evaluation of round {}: {:#}", round, err),
        }
    }
}
