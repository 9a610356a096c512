use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::sleep;

use fedcomp_core::{
    building_blocks::{federated_apply, federated_sum, federated_zip_at_server, BuildingBlock},
    local::LocalComputation,
    testutils::*,
    types::Type,
    Computation,
    ExecutionContext,
    ExecutionError,
    LocalExecutionContext,
    Value,
};
use fedcomp_runtime::{
    compile_to_mergeable_comp_form,
    MergeableArgument,
    MergeableCompExecutionContext,
    MergeableCompForm,
};

fn local_contexts(n: usize) -> Vec<Arc<dyn ExecutionContext>> {
    (0..n)
        .map(|_| Arc::new(LocalExecutionContext::new()) as Arc<dyn ExecutionContext>)
        .collect()
}

fn pair(x: i32, y: i32) -> Value {
    Value::tuple(vec![Value::from(x), Value::from(y)])
}

/// Splits the clients of `<server, clients>` into `n` partitions, repeating the server value.
fn partition(server: Value, clients: Vec<Value>, n: usize) -> MergeableArgument {
    let size = (clients.len() + n - 1) / n;
    let mut chunks: Vec<Vec<Value>> = clients.chunks(size.max(1)).map(<[Value]>::to_vec).collect();
    chunks.resize(n, Vec::new());
    MergeableArgument::Partitioned(
        chunks
            .into_iter()
            .map(|chunk| Some(Value::tuple(vec![server.clone(), Value::at_clients(chunk)])))
            .collect(),
    )
}

#[tokio::test]
async fn test_aggregation_and_after() {
    let computation = aggregation_and_after();
    let argument = Value::tuple(vec![
        Value::at_server(Value::from(100)),
        Value::at_clients((0..100).map(Value::from).collect()),
    ]);

    let reference = LocalExecutionContext::new()
        .invoke(&computation, Some(argument.clone()))
        .await
        .unwrap();
    let context = MergeableCompExecutionContext::new(local_contexts(1)).unwrap();
    let result = context.invoke(&computation, Some(argument)).await.unwrap();

    assert_eq!(result, Value::at_server(Value::from(5050)));
    assert_eq!(result, reference);
}

#[tokio::test]
async fn test_aggregation_and_after_partitioned() {
    let context = MergeableCompExecutionContext::new(local_contexts(3)).unwrap();
    let argument = partition(
        Value::at_server(Value::from(100)),
        (0..100).map(Value::from).collect(),
        3,
    );
    let result = context
        .invoke_partitioned(&aggregation_and_after(), argument)
        .await
        .unwrap();
    assert_eq!(result, Value::at_server(Value::from(5050)));
}

#[tokio::test]
async fn test_before_aggregation_work() {
    let clients: Vec<Value> = (0..100).map(|x| pair(x, x)).collect();
    for num_contexts in 1..=4 {
        let context = MergeableCompExecutionContext::new(local_contexts(num_contexts)).unwrap();
        let argument = partition(Value::at_server(Value::from(100)), clients.clone(), num_contexts);
        let result = context
            .invoke_partitioned(&before_aggregation_work(), argument)
            .await
            .unwrap();
        assert_eq!(result, Value::at_server(Value::from(99 * 100 + 100)));
    }
}

#[tokio::test]
async fn test_false_aggregation_dependence() {
    let context = MergeableCompExecutionContext::new(local_contexts(2)).unwrap();
    let clients: Vec<Value> = (0..10).map(|x| pair(x, 1)).collect();
    let argument = partition(Value::at_server(Value::from(5)), clients, 2);
    let result = context
        .invoke_partitioned(&false_aggregation_dependence(), argument)
        .await
        .unwrap();
    assert_eq!(result, Value::at_server(Value::from(5 + 45 + 10)));
}

#[tokio::test]
async fn test_unplaced_computations() {
    let context = MergeableCompExecutionContext::new(local_contexts(2)).unwrap();
    for (x, y, expected) in [(1, 0, 0), (1, 2, 2), (2, 3, 6)] {
        let result = context
            .invoke(&tf_multiply_int(), Some(pair(x, y)))
            .await
            .unwrap();
        assert_eq!(result, Value::from(expected));

        let result = context
            .invoke(&server_placed_mult(), Some(Value::at_server(pair(x, y))))
            .await
            .unwrap();
        assert_eq!(result, Value::at_server(Value::from(expected)));
    }
}

#[tokio::test]
async fn test_computation_without_argument() {
    let context = MergeableCompExecutionContext::new(local_contexts(2)).unwrap();
    let result = context.invoke(&return_server_value(), None).await.unwrap();
    assert_eq!(result, Value::at_server(Value::from(0)));
}

#[tokio::test]
async fn test_result_container_is_preserved() {
    let context = MergeableCompExecutionContext::new(local_contexts(1)).unwrap();
    let result = context.invoke(&return_list(), Some(pair(1, 2))).await.unwrap();
    assert_eq!(result, Value::list(vec![Value::from(1), Value::from(2)]));
}

#[tokio::test]
async fn test_empty_partition() {
    let context = MergeableCompExecutionContext::new(local_contexts(3)).unwrap();
    let argument = MergeableArgument::Partitioned(vec![
        Some(Value::tuple(vec![
            Value::at_server(Value::from(1)),
            Value::at_clients(vec![]),
        ])),
        Some(Value::tuple(vec![
            Value::at_server(Value::from(1)),
            Value::at_clients(vec![Value::from(2), Value::from(3)]),
        ])),
        Some(Value::tuple(vec![
            Value::at_server(Value::from(1)),
            Value::at_clients(vec![]),
        ])),
    ]);
    let result = context
        .invoke_partitioned(&aggregation_and_after(), argument)
        .await
        .unwrap();
    assert_eq!(result, Value::at_server(Value::from(6)));
}

#[tokio::test]
async fn test_recompiled_forms_compute_the_same() {
    let context = MergeableCompExecutionContext::new(local_contexts(2)).unwrap();
    let computation = before_aggregation_work();
    let first = compile_to_mergeable_comp_form(&computation).unwrap();
    let second = compile_to_mergeable_comp_form(&computation).unwrap();

    let clients: Vec<Value> = (0..10).map(|x| pair(x, 2 * x)).collect();
    let server = Value::at_server(Value::from(7));
    let first_result = context
        .invoke_form(&first, partition(server.clone(), clients.clone(), 2))
        .await
        .unwrap();
    let second_result = context
        .invoke_form(&second, partition(server, clients, 2))
        .await
        .unwrap();

    assert_eq!(first_result, Value::at_server(Value::from(7 + 3 * 45)));
    assert_eq!(first_result, second_result);
}

#[tokio::test]
async fn test_integer_sum_wraps_on_overflow() {
    let sum = Computation::from_fn("sum", Some(Type::at_clients(int32())), |arg| {
        federated_sum(arg.unwrap())
    })
    .unwrap();
    let context = MergeableCompExecutionContext::new(local_contexts(2)).unwrap();
    let argument = MergeableArgument::Partitioned(vec![
        Some(Value::at_clients(vec![Value::from(i32::MAX)])),
        Some(Value::at_clients(vec![Value::from(1)])),
    ]);
    let result = context.invoke_partitioned(&sum, argument).await.unwrap();
    assert_eq!(result, Value::at_server(Value::from(i32::MIN)));
}

#[tokio::test]
async fn test_partition_count() {
    let context = MergeableCompExecutionContext::new(local_contexts(2)).unwrap();
    let argument = Value::tuple(vec![
        Value::at_server(Value::from(1)),
        Value::at_clients(vec![Value::from(2)]),
    ]);
    assert!(matches!(
        context.invoke(&aggregation_and_after(), Some(argument.clone())).await,
        Err(ExecutionError::PartitionCount {
            expected: 2,
            actual: 1
        })
    ));
    assert!(matches!(
        context
            .invoke_partitioned(
                &aggregation_and_after(),
                MergeableArgument::Partitioned(vec![Some(argument.clone()); 3])
            )
            .await,
        Err(ExecutionError::PartitionCount {
            expected: 2,
            actual: 3
        })
    ));
}

#[test]
fn test_no_inner_context() {
    assert!(matches!(
        MergeableCompExecutionContext::new(Vec::new()),
        Err(ExecutionError::NoInnerContext)
    ));
}

#[tokio::test]
async fn test_compilation_error() {
    let context = MergeableCompExecutionContext::new(local_contexts(1)).unwrap();
    let error = context
        .invoke(&dependent_aggregates(), Some(Value::at_server(Value::from(1))))
        .await
        .unwrap_err();
    assert!(matches!(error, ExecutionError::Compilation(_)));
    assert!(error.to_string().contains("one aggregate dependent on another"));
}

fn counting_context(count: Arc<AtomicUsize>) -> MergeableCompExecutionContext {
    MergeableCompExecutionContext::new(local_contexts(2))
        .unwrap()
        .with_compiler(move |computation| {
            count.fetch_add(1, Ordering::SeqCst);
            compile_to_mergeable_comp_form(computation)
        })
}

#[tokio::test]
async fn test_computation_is_compiled_once() {
    let count = Arc::new(AtomicUsize::new(0));
    let context = counting_context(count.clone());
    let computation = tf_multiply_int();

    let (first, second) = futures::join!(
        context.invoke(&computation, Some(pair(2, 3))),
        context.invoke(&computation, Some(pair(3, 4))),
    );
    assert_eq!(first.unwrap(), Value::from(6));
    assert_eq!(second.unwrap(), Value::from(12));
    context.invoke(&computation, Some(pair(1, 1))).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    context.invoke(&tf_multiply_int(), Some(pair(1, 1))).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_compilation_is_not_cached() {
    let count = Arc::new(AtomicUsize::new(0));
    let context = counting_context(count.clone());
    let computation = dependent_aggregates();
    for _ in 0..2 {
        assert!(context
            .invoke(&computation, Some(Value::at_server(Value::from(1))))
            .await
            .is_err());
    }
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

/// Delays every invocation, so the partial results complete out of order.
struct DelayedContext {
    delay: Duration,
    inner: LocalExecutionContext,
}

#[async_trait]
impl ExecutionContext for DelayedContext {
    async fn invoke(
        &self,
        computation: &Computation,
        argument: Option<Value>,
    ) -> Result<Value, ExecutionError> {
        sleep(self.delay).await;
        self.inner.invoke(computation, argument).await
    }
}

/// A form whose merge subtracts the second partial sum from the first one.
fn subtracting_form() -> MergeableCompForm {
    let partial = Type::tuple(vec![Type::at_server(int32())]);
    let up_to_merge = Computation::from_fn("up_to_merge", Some(Type::at_clients(int32())), |arg| {
        Ok(BuildingBlock::tuple(vec![federated_sum(arg.unwrap())?]))
    })
    .unwrap();
    let merge = Computation::from_fn(
        "merge",
        Some(Type::tuple(vec![partial.clone(), partial.clone()])),
        |arg| {
            let arg = arg.unwrap();
            let lhs = BuildingBlock::selection(BuildingBlock::selection(arg.clone(), 0)?, 0)?;
            let rhs = BuildingBlock::selection(BuildingBlock::selection(arg, 1)?, 0)?;
            let difference = federated_apply(
                LocalComputation::subtract(int32())?.into(),
                federated_zip_at_server(BuildingBlock::tuple(vec![lhs, rhs]))?,
            )?;
            Ok(BuildingBlock::tuple(vec![difference]))
        },
    )
    .unwrap();
    let after_merge = Computation::from_fn(
        "after_merge",
        Some(Type::tuple(vec![Type::at_clients(int32()), partial])),
        |arg| BuildingBlock::selection(BuildingBlock::selection(arg.unwrap(), 1)?, 0),
    )
    .unwrap();
    MergeableCompForm::new(up_to_merge, merge, after_merge).unwrap()
}

#[tokio::test]
async fn test_partials_are_merged_in_context_order() {
    let contexts: Vec<Arc<dyn ExecutionContext>> = [30, 20, 10, 0]
        .iter()
        .map(|millis| {
            Arc::new(DelayedContext {
                delay: Duration::from_millis(*millis),
                inner: LocalExecutionContext::new(),
            }) as Arc<dyn ExecutionContext>
        })
        .collect();
    let context = MergeableCompExecutionContext::new(contexts).unwrap();
    let argument = MergeableArgument::Partitioned(
        [vec![10, 10], vec![5], vec![3], vec![1]]
            .iter()
            .map(|members| {
                Some(Value::at_clients(members.iter().copied().map(Value::from).collect()))
            })
            .collect(),
    );
    let result = context.invoke_form(&subtracting_form(), argument).await.unwrap();
    assert_eq!(result, Value::at_server(Value::from(20 - 5 - 3 - 1)));
}
