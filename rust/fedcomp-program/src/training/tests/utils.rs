use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use tracing_subscriber::*;

use fedcomp_core::{types::DType, Type};

use crate::{
    clock::Clock,
    data_source::{DataSourceError, FederatedDataSource, FederatedDataSourceIterator},
    learning::{LearningProcess, LearningProcessOutput},
    managers::{EvaluationManager, EvaluationTask, ManagerError},
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

fn client_ids() -> Type {
    Type::at_clients(Type::scalar(DType::I64))
}

/// A learning process counting its rounds. The state is the number of completed rounds.
#[derive(Default)]
pub struct CountingProcess {
    /// Fails `next` when called on this state.
    pub fail_on: Option<i64>,
    calls: Mutex<Vec<(i64, Vec<u64>)>>,
}

impl CountingProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(state: i64) -> Self {
        Self {
            fail_on: Some(state),
            ..Self::default()
        }
    }

    /// Gets the state and data of every call of `next`.
    pub fn calls(&self) -> Vec<(i64, Vec<u64>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LearningProcess for CountingProcess {
    type State = i64;
    type Data = Vec<u64>;
    type ModelWeights = i64;

    async fn initialize(&self) -> anyhow::Result<i64> {
        Ok(0)
    }

    async fn next(&self, state: i64, data: Vec<u64>) -> anyhow::Result<LearningProcessOutput<i64>> {
        self.calls.lock().unwrap().push((state, data));
        if self.fail_on == Some(state) {
            return Err(anyhow!("round on state {} failed", state));
        }
        Ok(LearningProcessOutput {
            state: state + 1,
            metrics: json!({
                "client_work": { "train": { "loss": 1.0 / (state + 1) as f64 } },
                "state": state + 1,
            }),
        })
    }

    fn get_model_weights(&self, state: &i64) -> anyhow::Result<i64> {
        Ok(*state * 10)
    }
}

/// A data source handing out consecutive client ids.
pub struct SequentialDataSource {
    federated_type: Type,
}

impl SequentialDataSource {
    pub fn new() -> Self {
        Self {
            federated_type: client_ids(),
        }
    }
}

impl FederatedDataSource for SequentialDataSource {
    type Iterator = SequentialIterator;

    fn federated_type(&self) -> &Type {
        &self.federated_type
    }

    fn iterator(&self) -> SequentialIterator {
        SequentialIterator {
            next_client: 0,
            federated_type: client_ids(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SequentialIterator {
    pub next_client: u64,
    federated_type: Type,
}

impl FederatedDataSourceIterator for SequentialIterator {
    type Data = Vec<u64>;

    fn select(&mut self, k: usize) -> Result<Vec<u64>, DataSourceError> {
        let start = self.next_client;
        self.next_client += k as u64;
        Ok((start..self.next_client).collect())
    }

    fn to_bytes(&self) -> Result<Vec<u8>, DataSourceError> {
        Ok(bincode::serialize(&self.next_client)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, DataSourceError> {
        Ok(Self {
            next_client: bincode::deserialize(bytes)?,
            federated_type: client_ids(),
        })
    }

    fn federated_type(&self) -> &Type {
        &self.federated_type
    }
}

/// A clock returning the given times in order, repeating the last one.
pub struct FakeClock {
    times: Mutex<VecDeque<i64>>,
}

impl FakeClock {
    pub fn new(times: impl IntoIterator<Item = i64>) -> Self {
        Self {
            times: Mutex::new(times.into_iter().collect()),
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> i64 {
        let mut times = self.times.lock().unwrap();
        if times.len() > 1 {
            times.pop_front().unwrap()
        } else {
            times.front().copied().unwrap_or_default()
        }
    }
}

#[derive(Default)]
/// Records the calls of the training program and runs evaluations that finish immediately.
pub struct RecordingEvaluationManager {
    /// Makes every evaluation task fail.
    pub fail_tasks: bool,
    /// Makes every call of the manager fail after recording it.
    pub unavailable: bool,
    resumed: AtomicUsize,
    waited: AtomicUsize,
    started: Mutex<Vec<(u64, i64, i64)>>,
    finished: std::sync::Arc<Mutex<Vec<u64>>>,
}

impl RecordingEvaluationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing_tasks() -> Self {
        Self {
            fail_tasks: true,
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    fn check_available(&self, call: &str) -> Result<(), ManagerError> {
        if self.unavailable {
            Err(anyhow!("evaluation backend unavailable in {}", call))
        } else {
            Ok(())
        }
    }

    pub fn resumed(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }

    pub fn waited(&self) -> usize {
        self.waited.load(Ordering::SeqCst)
    }

    /// Gets the round, timestamp and model weights of every started evaluation.
    pub fn started(&self) -> Vec<(u64, i64, i64)> {
        self.started.lock().unwrap().clone()
    }

    /// Gets the rounds of the evaluations which finished successfully.
    pub fn finished(&self) -> Vec<u64> {
        let mut finished = self.finished.lock().unwrap().clone();
        finished.sort_unstable();
        finished
    }

    /// Gets the rounds of the started evaluations.
    pub fn rounds(&self) -> Vec<u64> {
        self.started().into_iter().map(|(round, _, _)| round).collect()
    }
}

#[async_trait]
impl EvaluationManager<i64> for RecordingEvaluationManager {
    async fn resume_from_previous_state(&self) -> Result<(), ManagerError> {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        self.check_available("resume_from_previous_state")
    }

    async fn start_evaluation(
        &self,
        round: u64,
        timestamp: i64,
        model_weights: i64,
    ) -> Result<EvaluationTask, ManagerError> {
        self.started.lock().unwrap().push((round, timestamp, model_weights));
        self.check_available("start_evaluation")?;
        let finished = self.finished.clone();
        let fail = self.fail_tasks;
        Ok(async move {
            if fail {
                return Err(anyhow!("evaluation of round {} failed", round));
            }
            finished.lock().unwrap().push(round);
            Ok(())
        }
        .boxed())
    }

    async fn wait_for_evaluations_to_finish(&self) -> Result<(), ManagerError> {
        self.waited.fetch_add(1, Ordering::SeqCst);
        self.check_available("wait_for_evaluations_to_finish")
    }
}
