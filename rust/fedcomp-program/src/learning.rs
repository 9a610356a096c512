//! Learning processes and their adapter over computations.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{Map, Number};

use fedcomp_core::{
    templates::AggregationProcess,
    value::{FederatedValue, StructValue},
    Computation,
    ExecutionContext,
    Placement,
    Value,
};
use fedcomp_runtime::{MergeableArgument, MergeableCompExecutionContext};

#[derive(Clone, Debug, PartialEq)]
/// The output of a round of a learning process.
pub struct LearningProcessOutput<S> {
    pub state: S,
    /// Structured metrics of the round, e.g. `{"client_work": {"train": {"loss": 0.1}}}`.
    pub metrics: serde_json::Value,
}

#[async_trait]
/// An iterative learning process, e.g. federated averaging.
pub trait LearningProcess: Send + Sync {
    type State: Clone + Send + Sync;
    type Data: Send;
    type ModelWeights: Send + 'static;

    /// Creates the state before the first round.
    async fn initialize(&self) -> anyhow::Result<Self::State>;

    /// Runs a round on the data of the selected clients.
    async fn next(
        &self,
        state: Self::State,
        data: Self::Data,
    ) -> anyhow::Result<LearningProcessOutput<Self::State>>;

    /// Extracts the model weights from a state.
    fn get_model_weights(&self, state: &Self::State) -> anyhow::Result<Self::ModelWeights>;
}

/// A learning process whose rounds are computations of an aggregation process.
///
/// `next` is invoked on `<state, data>` and must return `state` and `measurements`; the
/// measurements are converted into the round metrics. The model weights are the server member
/// of the state.
pub struct ComputationLearningProcess {
    runner: Runner,
    process: AggregationProcess,
}

enum Runner {
    Whole(Arc<dyn ExecutionContext>),
    Partitioned(Arc<MergeableCompExecutionContext>),
}

impl ComputationLearningProcess {
    /// Runs the process on a single execution context.
    pub fn new(context: Arc<dyn ExecutionContext>, process: AggregationProcess) -> Self {
        Self {
            runner: Runner::Whole(context),
            process,
        }
    }

    /// Runs the process on a mergeable context, splitting the clients of a round evenly across
    /// its inner contexts.
    pub fn partitioned(
        context: Arc<MergeableCompExecutionContext>,
        process: AggregationProcess,
    ) -> Self {
        Self {
            runner: Runner::Partitioned(context),
            process,
        }
    }

    async fn invoke(
        &self,
        computation: &Computation,
        argument: Option<Value>,
    ) -> anyhow::Result<Value> {
        let result = match (&self.runner, argument) {
            (Runner::Whole(context), argument) => context.invoke(computation, argument).await?,
            (Runner::Partitioned(context), None) => {
                context
                    .invoke_partitioned(computation, MergeableArgument::Whole(None))
                    .await?
            }
            (Runner::Partitioned(context), Some(argument)) => {
                let partitions = partition_clients(&argument, context.num_contexts())?;
                context
                    .invoke_partitioned(
                        computation,
                        MergeableArgument::Partitioned(partitions.into_iter().map(Some).collect()),
                    )
                    .await?
            }
        };
        Ok(result)
    }
}

#[async_trait]
impl LearningProcess for ComputationLearningProcess {
    type State = Value;
    type Data = Value;
    type ModelWeights = Value;

    async fn initialize(&self) -> anyhow::Result<Value> {
        self.invoke(self.process.initialize(), None).await
    }

    async fn next(
        &self,
        state: Value,
        data: Value,
    ) -> anyhow::Result<LearningProcessOutput<Value>> {
        let output = self
            .invoke(self.process.next(), Some(Value::tuple(vec![state, data])))
            .await?;
        let output = output
            .as_struct()
            .ok_or_else(|| anyhow!("`next` returned {}", output))?;
        let state = output.get_named("state").context("`next` returned no `state`")?.clone();
        let measurements = output
            .get_named("measurements")
            .context("`next` returned no `measurements`")?;
        Ok(LearningProcessOutput {
            state,
            metrics: to_json(measurements),
        })
    }

    fn get_model_weights(&self, state: &Value) -> anyhow::Result<Value> {
        state
            .server_member()
            .cloned()
            .ok_or_else(|| anyhow!("expected a server placed state, found {}", state))
    }
}

/// Splits the clients placed parts of `value` into `n` partitions of nearly equal size. Server
/// placed and unplaced parts are repeated in every partition.
pub fn partition_clients(value: &Value, n: usize) -> anyhow::Result<Vec<Value>> {
    if n == 0 {
        return Err(anyhow!("cannot partition into zero parts"));
    }
    match value {
        Value::Federated(federated)
            if federated.placement() == Placement::Clients && !federated.is_all_equal() =>
        {
            let members = federated.members();
            let (size, rest) = (members.len() / n, members.len() % n);
            let mut start = 0;
            (0..n)
                .map(|part| -> anyhow::Result<Value> {
                    let end = start + size + usize::from(part < rest);
                    let chunk = members[start..end].to_vec();
                    start = end;
                    Ok(Value::Federated(FederatedValue::new(Placement::Clients, false, chunk)?))
                })
                .collect()
        }
        Value::Struct(structure) => {
            let mut parts: Vec<Vec<(Option<String>, Value)>> = vec![Vec::new(); n];
            for (name, element) in structure.iter() {
                for (part, element) in parts.iter_mut().zip(partition_clients(element, n)?) {
                    part.push((name.clone(), element));
                }
            }
            Ok(parts
                .into_iter()
                .map(|elements| {
                    Value::Struct(StructValue::new(elements, structure.container()))
                })
                .collect())
        }
        other => Ok(vec![other.clone(); n]),
    }
}

/// Converts a value into JSON for reporting. Server placed values are unwrapped, named structs
/// become objects and tensors become numbers or arrays of numbers.
pub fn to_json(value: &Value) -> serde_json::Value {
    fn number(x: f64) -> serde_json::Value {
        Number::from_f64(x).map_or(serde_json::Value::Null, serde_json::Value::Number)
    }

    match value {
        Value::Tensor(tensor) => {
            let elements = tensor.to_f64_vec();
            if tensor.shape().is_empty() && elements.len() == 1 {
                number(elements[0])
            } else {
                serde_json::Value::Array(elements.into_iter().map(number).collect())
            }
        }
        Value::Struct(structure)
            if structure.iter().all(|(name, _)| name.is_some()) && !structure.is_empty() =>
        {
            let mut map = Map::new();
            for (name, element) in structure.iter() {
                map.insert(name.clone().unwrap_or_default(), to_json(element));
            }
            serde_json::Value::Object(map)
        }
        Value::Struct(structure) => serde_json::Value::Array(
            structure.iter().map(|(_, element)| to_json(element)).collect(),
        ),
        Value::Federated(federated) if federated.is_all_equal() => federated
            .members()
            .first()
            .map_or(serde_json::Value::Null, to_json),
        Value::Federated(federated) => {
            serde_json::Value::Array(federated.members().iter().map(to_json).collect())
        }
        Value::Sequence(elements) => {
            serde_json::Value::Array(elements.iter().map(to_json).collect())
        }
    }
}
