//! Execution contexts.

use async_trait::async_trait;
use tracing::debug;

use crate::{
    computation::Computation,
    executor::{infer_num_clients, Evaluator, ExecutionError},
    value::Value,
};

#[async_trait]
/// A context that invokes computations.
pub trait ExecutionContext: Send + Sync {
    /// Invokes `computation` on `argument`.
    ///
    /// # Behavior
    ///
    /// - The argument is checked against the parameter type before anything runs.
    /// - The result has the declared result type, struct containers included.
    async fn invoke(
        &self,
        computation: &Computation,
        argument: Option<Value>,
    ) -> Result<Value, ExecutionError>;
}

/// Checks that `argument` fits the parameter of `computation`.
pub fn check_argument(
    computation: &Computation,
    argument: Option<&Value>,
) -> Result<(), ExecutionError> {
    match (computation.parameter_type(), argument) {
        (Some(parameter), Some(argument)) => parameter
            .check_value(argument)
            .map_err(ExecutionError::ArgumentType),
        (None, None) => Ok(()),
        (Some(parameter), None) => Err(ExecutionError::MissingArgument(parameter.clone())),
        (None, Some(_)) => Err(ExecutionError::UnexpectedArgument),
    }
}

/// Checks the result of `computation` and reshapes its structs into the declared containers.
pub fn conform_result(computation: &Computation, result: Value) -> Result<Value, ExecutionError> {
    let ty = computation.result_type();
    ty.check_value(&result).map_err(ExecutionError::ResultType)?;
    Ok(result.with_containers_of(ty))
}

#[derive(Clone, Copy, Debug, Default)]
/// An execution context that evaluates computations in-process.
pub struct LocalExecutionContext {
    default_num_clients: Option<usize>,
}

impl LocalExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of clients assumed when an argument has no clients placed data.
    pub fn with_default_num_clients(mut self, num_clients: usize) -> Self {
        self.default_num_clients = Some(num_clients);
        self
    }
}

#[async_trait]
impl ExecutionContext for LocalExecutionContext {
    async fn invoke(
        &self,
        computation: &Computation,
        argument: Option<Value>,
    ) -> Result<Value, ExecutionError> {
        check_argument(computation, argument.as_ref())?;
        let num_clients = match &argument {
            Some(argument) => infer_num_clients(argument)?,
            None => None,
        }
        .or(self.default_num_clients);
        debug!(
            "invoking {} `{}` with {:?} clients",
            computation.type_signature(),
            computation.name(),
            num_clients
        );
        let result = Evaluator::new(num_clients).evaluate_computation(computation, argument)?;
        conform_result(computation, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        building_blocks::{federated_broadcast, federated_sum, BuildingBlock},
        local::LocalComputation,
        types::{DType, Type},
    };

    fn int32() -> Type {
        Type::scalar(DType::I32)
    }

    #[tokio::test]
    async fn test_rejects_mismatched_argument() {
        let comp = Computation::from_fn("sum", Some(Type::at_clients(int32())), |arg| {
            federated_sum(arg.unwrap())
        })
        .unwrap();
        let context = LocalExecutionContext::new();
        assert!(matches!(
            context.invoke(&comp, Some(Value::at_server(Value::from(1)))).await,
            Err(ExecutionError::ArgumentType(_))
        ));
        assert!(matches!(
            context.invoke(&comp, None).await,
            Err(ExecutionError::MissingArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_result_keeps_declared_container() {
        let comp = Computation::from_fn(
            "return_list",
            Some(Type::tuple(vec![int32(), int32()])),
            |arg| {
                let arg = arg.unwrap();
                Ok(BuildingBlock::list(vec![
                    BuildingBlock::selection(arg.clone(), 0)?,
                    BuildingBlock::selection(arg, 1)?,
                ]))
            },
        )
        .unwrap();
        let result = LocalExecutionContext::new()
            .invoke(&comp, Some(Value::tuple(vec![Value::from(1), Value::from(2)])))
            .await
            .unwrap();
        assert_eq!(result, Value::list(vec![Value::from(1), Value::from(2)]));
    }

    #[tokio::test]
    async fn test_default_num_clients() {
        let comp = Computation::from_fn("broadcast_sum", Some(Type::at_server(int32())), |arg| {
            federated_sum(federated_broadcast(arg.unwrap())?)
        })
        .unwrap();
        let result = LocalExecutionContext::new()
            .with_default_num_clients(4)
            .invoke(&comp, Some(Value::at_server(Value::from(3))))
            .await
            .unwrap();
        assert_eq!(result, Value::at_server(Value::from(12)));
    }

    #[tokio::test]
    async fn test_local_computation() {
        let comp = Computation::local(LocalComputation::multiply(int32()).unwrap());
        let result = LocalExecutionContext::new()
            .invoke(&comp, Some(Value::tuple(vec![Value::from(1), Value::from(2)])))
            .await
            .unwrap();
        assert_eq!(result, Value::from(2));
    }
}
