mod utils;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::Duration;
use serde_json::json;

use self::utils::{
    enable_logging,
    CountingProcess,
    FakeClock,
    RecordingEvaluationManager,
    SequentialDataSource,
    SequentialIterator,
};
use super::*;
use crate::managers::{MemoryProgramStateManager, MemoryReleaseManager};

type StateManager = MemoryProgramStateManager<ProgramState<i64, SequentialIterator>>;

struct Harness {
    program_state_manager: Arc<StateManager>,
    model_output_manager: Arc<MemoryReleaseManager<i64, String>>,
    train_metrics_manager: Arc<MemoryReleaseManager<serde_json::Value, u64>>,
    evaluation_manager: Arc<RecordingEvaluationManager>,
}

impl Harness {
    fn new() -> Self {
        Self::with_evaluation_manager(RecordingEvaluationManager::new())
    }

    fn with_evaluation_manager(evaluation_manager: RecordingEvaluationManager) -> Self {
        Self {
            program_state_manager: Arc::new(MemoryProgramStateManager::new()),
            model_output_manager: Arc::new(MemoryReleaseManager::new()),
            train_metrics_manager: Arc::new(MemoryReleaseManager::new()),
            evaluation_manager: Arc::new(evaluation_manager),
        }
    }

    fn program(
        &self,
        process: CountingProcess,
        settings: TrainingSettings,
    ) -> TrainingProgramLogic<CountingProcess, SequentialDataSource> {
        TrainingProgramLogic::new(
            process,
            SequentialDataSource::new(),
            self.program_state_manager.clone(),
            self.model_output_manager.clone(),
            self.train_metrics_manager.clone(),
            settings,
        )
        .with_evaluation_manager(self.evaluation_manager.clone())
    }

    async fn saved_rounds(&self) -> Vec<u64> {
        self.program_state_manager
            .saved()
            .await
            .into_iter()
            .map(|(version, _)| version)
            .collect()
    }

    async fn released_models(&self) -> Vec<(String, i64)> {
        self.model_output_manager.released().await
    }

    async fn released_metrics(&self) -> Vec<(u64, serde_json::Value)> {
        self.train_metrics_manager.released().await
    }
}

fn settings(total_rounds: u64, evaluation_period: EvaluationPeriod) -> TrainingSettings {
    TrainingSettings::new(2, total_rounds, evaluation_period)
}

#[tokio::test]
async fn test_evaluation_and_release_by_rounds() {
    enable_logging();
    let harness = Harness::new();
    let program = harness.program(
        CountingProcess::new(),
        settings(11, EvaluationPeriod::Rounds(5)),
    );
    program.train_model().await.unwrap();

    assert_eq!(harness.saved_rounds().await, (0..=11).collect::<Vec<_>>());
    assert_eq!(
        harness.released_models().await,
        vec![
            (checkpoint_key(0), 0),
            (checkpoint_key(10), 10),
            (checkpoint_key(11), 11),
        ]
    );
    let metrics = harness.released_metrics().await;
    assert_eq!(
        metrics.iter().map(|(round, _)| *round).collect::<Vec<_>>(),
        (1..=11).collect::<Vec<_>>()
    );
    assert_eq!(
        metrics[1].1,
        json!({
            "client_work": { "train": { "loss": 0.5 } },
            "state": 2,
            "model_metrics": { "loss": 0.5 },
            "program_metrics": { "num_retries": 0 },
        })
    );

    let evaluations = &harness.evaluation_manager;
    assert_eq!(evaluations.rounds(), vec![5, 10, 11]);
    assert_eq!(
        evaluations.started().into_iter().map(|(_, _, weights)| weights).collect::<Vec<_>>(),
        vec![50, 100, 110]
    );
    // background evaluations are joined before training returns
    assert_eq!(evaluations.finished(), vec![5, 10, 11]);
    assert_eq!(evaluations.resumed(), 1);
    assert_eq!(evaluations.waited(), 1);
}

#[tokio::test]
async fn test_evaluation_by_duration() {
    let harness = Harness::new();
    let clock = Arc::new(FakeClock::new(vec![0, 20, 40, 60, 80]));
    let program = harness
        .program(
            CountingProcess::new(),
            settings(5, EvaluationPeriod::Duration(Duration::seconds(25))),
        )
        .with_clock(clock);
    program.train_model().await.unwrap();

    assert_eq!(
        harness.evaluation_manager.started(),
        vec![(1, 0, 10), (3, 40, 30), (5, 80, 50)]
    );
    let deadlines = harness
        .program_state_manager
        .saved()
        .await
        .into_iter()
        .map(|(_, state)| state.next_evaluation_timestamp_seconds)
        .collect::<Vec<_>>();
    assert_eq!(
        deadlines,
        vec![None, Some(25), Some(25), Some(65), Some(65), Some(65)]
    );
}

#[tokio::test]
async fn test_resume_after_saved_round() {
    let harness = Harness::new();
    harness
        .program(CountingProcess::new(), settings(3, EvaluationPeriod::Rounds(2)))
        .train_model()
        .await
        .unwrap();

    let process = CountingProcess::new();
    let program = harness.program(process, settings(5, EvaluationPeriod::Rounds(2)));
    program.train_model().await.unwrap();

    // the second run continues with the saved state and the saved position of the iterator
    assert_eq!(program.process.calls(), vec![(3, vec![6, 7]), (4, vec![8, 9])]);
    assert_eq!(harness.saved_rounds().await, (0..=5).collect::<Vec<_>>());
    assert_eq!(
        harness.released_models().await,
        vec![(checkpoint_key(0), 0), (checkpoint_key(3), 3), (checkpoint_key(5), 5)]
    );
    assert_eq!(harness.evaluation_manager.rounds(), vec![2, 3, 4, 5]);
    assert_eq!(harness.evaluation_manager.resumed(), 2);
    assert_eq!(harness.evaluation_manager.waited(), 2);
}

#[tokio::test]
async fn test_resume_of_finished_program_is_a_no_op() {
    let harness = Harness::new();
    harness
        .program(CountingProcess::new(), settings(3, EvaluationPeriod::Rounds(1)))
        .train_model()
        .await
        .unwrap();
    let released = harness.released_metrics().await.len();

    let program = harness.program(CountingProcess::new(), settings(3, EvaluationPeriod::Rounds(1)));
    program.train_model().await.unwrap();

    assert!(program.process.calls().is_empty());
    assert_eq!(harness.released_metrics().await.len(), released);
    assert_eq!(harness.saved_rounds().await, vec![0, 1, 2, 3]);
    assert_eq!(harness.evaluation_manager.rounds(), vec![1, 2, 3]);
    assert_eq!(harness.evaluation_manager.resumed(), 2);
    assert_eq!(harness.evaluation_manager.waited(), 2);
}

#[tokio::test]
async fn test_retried_rounds_select_new_data() {
    let harness = Harness::new();
    let retries = Arc::new(AtomicU64::new(0));
    let counter = retries.clone();
    let program = harness
        .program(CountingProcess::new(), settings(3, EvaluationPeriod::Rounds(10)))
        .with_should_retry_round(move |output| {
            output.state == 2 && counter.fetch_add(1, Ordering::SeqCst) < 2
        });
    program.train_model().await.unwrap();

    assert_eq!(
        program.process.calls(),
        vec![
            (0, vec![0, 1]),
            (1, vec![2, 3]),
            (1, vec![4, 5]),
            (1, vec![6, 7]),
            (2, vec![8, 9]),
        ]
    );
    let retries = harness
        .released_metrics()
        .await
        .into_iter()
        .map(|(_, metrics)| metrics["program_metrics"]["num_retries"].clone())
        .collect::<Vec<_>>();
    assert_eq!(retries, vec![json!(0), json!(2), json!(0)]);
}

#[tokio::test]
async fn test_failed_evaluations_do_not_stop_training() {
    let harness =
        Harness::with_evaluation_manager(RecordingEvaluationManager::with_failing_tasks());
    let program = harness.program(CountingProcess::new(), settings(4, EvaluationPeriod::Rounds(2)));
    program.train_model().await.unwrap();

    assert_eq!(harness.evaluation_manager.rounds(), vec![2, 4]);
    assert!(harness.evaluation_manager.finished().is_empty());
    assert_eq!(harness.saved_rounds().await, (0..=4).collect::<Vec<_>>());
    assert_eq!(harness.evaluation_manager.waited(), 1);
}

#[tokio::test]
async fn test_unavailable_evaluation_manager_does_not_stop_training() {
    let harness = Harness::with_evaluation_manager(RecordingEvaluationManager::unavailable());
    let program = harness.program(CountingProcess::new(), settings(3, EvaluationPeriod::Rounds(1)));
    program.train_model().await.unwrap();

    // every round is saved and released although no evaluation could be started
    assert_eq!(harness.evaluation_manager.rounds(), vec![1, 2, 3]);
    assert!(harness.evaluation_manager.finished().is_empty());
    assert_eq!(harness.saved_rounds().await, vec![0, 1, 2, 3]);
    assert_eq!(harness.released_metrics().await.len(), 3);
    assert_eq!(
        harness.released_models().await,
        vec![(checkpoint_key(0), 0), (checkpoint_key(3), 3)]
    );
    assert_eq!(harness.evaluation_manager.resumed(), 1);
    assert_eq!(harness.evaluation_manager.waited(), 1);
}

#[tokio::test]
async fn test_failed_round_aborts_without_saving() {
    let harness = Harness::new();
    let program = harness.program(
        CountingProcess::failing_on(2),
        settings(5, EvaluationPeriod::Rounds(1)),
    );
    let err = program.train_model().await.unwrap_err();

    assert!(matches!(err, TrainingError::Process(_)));
    assert_eq!(harness.saved_rounds().await, vec![0, 1, 2]);
    assert_eq!(harness.evaluation_manager.waited(), 0);
}

#[tokio::test]
async fn test_initial_state_and_no_evaluation_manager() {
    let program_state_manager = Arc::new(StateManager::new());
    let model_output_manager = Arc::new(MemoryReleaseManager::new());
    let mut settings = settings(2, EvaluationPeriod::Rounds(1));
    settings.model_output_interval = 0;
    let program = TrainingProgramLogic::new(
        CountingProcess::new(),
        SequentialDataSource::new(),
        program_state_manager.clone(),
        model_output_manager.clone(),
        Arc::new(MemoryReleaseManager::new()),
        settings,
    )
    .with_initial_state(100);
    program.train_model().await.unwrap();

    assert_eq!(
        model_output_manager.released().await,
        vec![(checkpoint_key(0), 100), (checkpoint_key(2), 102)]
    );
    let (latest, version) = program_state_manager
        .load_latest(&ProgramState::new(0, SequentialDataSource::new().iterator()))
        .await
        .unwrap();
    let latest = latest.unwrap();
    assert_eq!(version, 2);
    assert_eq!(latest.state, 102);
    assert_eq!(latest.data_iterator.next_client, 4);
    assert_eq!(latest.next_evaluation_timestamp_seconds, None);
}

#[test]
fn test_round_metrics() {
    assert_eq!(
        round_metrics(json!({ "client_work": { "train": { "loss": 0.1 } } }), 1),
        json!({
            "client_work": { "train": { "loss": 0.1 } },
            "model_metrics": { "loss": 0.1 },
            "program_metrics": { "num_retries": 1 },
        })
    );
    assert_eq!(
        round_metrics(serde_json::Value::Null, 0),
        json!({ "model_metrics": {}, "program_metrics": { "num_retries": 0 } })
    );
    assert_eq!(round_metrics(json!(1.5), 0)["process"], json!(1.5));
}
