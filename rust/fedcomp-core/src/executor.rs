//! A reference-resolving evaluator for building blocks.
//!
//! The evaluator walks the building block tree directly, resolving references through a chain
//! of scopes. Functions are first-class during evaluation (lambdas close over their scope) but
//! never escape it: the result of a computation must be a plain [`Value`].

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::{
    building_blocks::BuildingBlock,
    computation::Computation,
    intrinsics::{AggregationFunctions, Intrinsic},
    local::LocalComputation,
    types::{Container, Placement, Type, TypeError},
    value::{FederatedValue, StructValue, Value, ValueError},
};

#[derive(Debug, Error)]
/// Errors that occur while invoking a computation.
pub enum ExecutionError {
    #[error("argument does not match the parameter type: {0}")]
    ArgumentType(#[source] TypeError),
    #[error("missing argument for parameter of type {0}")]
    MissingArgument(Type),
    #[error("unexpected argument for a computation without parameter")]
    UnexpectedArgument,
    #[error("result does not match the result type: {0}")]
    ResultType(#[source] TypeError),
    #[error("unbound reference `{0}`")]
    UnboundReference(String),
    #[error("expected a {expected}, found a {found}")]
    UnexpectedValue {
        expected: &'static str,
        found: &'static str,
    },
    #[error("selection of element {index} from a struct of {len} elements")]
    SelectionOutOfRange { index: usize, len: usize },
    #[error("the number of clients is unknown")]
    UnknownNumClients,
    #[error("inconsistent number of clients: {0} and {1}")]
    InconsistentNumClients(usize, usize),
    #[error("invalid type: {0}")]
    Type(#[from] TypeError),
    #[error("invalid value: {0}")]
    Value(#[from] ValueError),
    #[error("local computation `{name}` failed: {source}")]
    Local {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("compilation failed: {0}")]
    Compilation(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("no inner execution context available")]
    NoInnerContext,
    #[error("expected {expected} partitioned arguments, got {actual}")]
    PartitionCount { expected: usize, actual: usize },
}

#[derive(Clone)]
enum Evaluated {
    Value(Value),
    Struct(Vec<(Option<String>, Evaluated)>, Container),
    Function(Function),
}

impl Evaluated {
    fn kind(&self) -> &'static str {
        match self {
            Evaluated::Value(value) => value.kind(),
            Evaluated::Struct(..) => "struct",
            Evaluated::Function(_) => "function",
        }
    }

    fn into_value(self) -> Result<Value, ExecutionError> {
        match self {
            Evaluated::Value(value) => Ok(value),
            Evaluated::Struct(elements, container) => {
                let elements = elements
                    .into_iter()
                    .map(|(name, element)| Ok((name, element.into_value()?)))
                    .collect::<Result<_, ExecutionError>>()?;
                Ok(Value::Struct(StructValue::new(elements, container)))
            }
            Evaluated::Function(_) => Err(ExecutionError::UnexpectedValue {
                expected: "value",
                found: "function",
            }),
        }
    }

    fn into_function(self) -> Result<Function, ExecutionError> {
        match self {
            Evaluated::Function(function) => Ok(function),
            other => Err(ExecutionError::UnexpectedValue {
                expected: "function",
                found: other.kind(),
            }),
        }
    }

    fn into_elements(self) -> Result<Vec<Evaluated>, ExecutionError> {
        match self {
            Evaluated::Struct(elements, _) => {
                Ok(elements.into_iter().map(|(_, element)| element).collect())
            }
            Evaluated::Value(Value::Struct(value)) => Ok(value
                .into_elements()
                .into_iter()
                .map(|(_, element)| Evaluated::Value(element))
                .collect()),
            other => Err(ExecutionError::UnexpectedValue {
                expected: "struct",
                found: other.kind(),
            }),
        }
    }

    fn select(self, index: usize) -> Result<Evaluated, ExecutionError> {
        let mut elements = self.into_elements()?;
        let len = elements.len();
        if index >= len {
            return Err(ExecutionError::SelectionOutOfRange { index, len });
        }
        Ok(elements.swap_remove(index))
    }
}

#[derive(Clone)]
enum Function {
    Lambda {
        parameter: Option<String>,
        body: Arc<BuildingBlock>,
        scope: Scope,
    },
    Intrinsic { intrinsic: Intrinsic, ty: Type },
    Local(LocalComputation),
}

#[derive(Clone, Default)]
struct Scope(Option<Arc<Binding>>);

struct Binding {
    name: String,
    value: Evaluated,
    parent: Scope,
}

impl Scope {
    fn bind(&self, name: &str, value: Evaluated) -> Scope {
        Scope(Some(Arc::new(Binding {
            name: name.to_string(),
            value,
            parent: self.clone(),
        })))
    }

    fn lookup(&self, name: &str) -> Option<&Evaluated> {
        let mut scope = self;
        while let Some(binding) = &scope.0 {
            if binding.name == name {
                return Some(&binding.value);
            }
            scope = &binding.parent;
        }
        None
    }
}

/// Evaluates computations on a single machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct Evaluator {
    num_clients: Option<usize>,
}

impl Evaluator {
    /// Creates an evaluator. `num_clients` is the number of clients an all equal clients placed
    /// value stands for.
    pub fn new(num_clients: Option<usize>) -> Self {
        Self { num_clients }
    }

    /// Applies `computation` to `argument`.
    pub fn evaluate_computation(
        &self,
        computation: &Computation,
        argument: Option<Value>,
    ) -> Result<Value, ExecutionError> {
        let function = self
            .evaluate(computation.building_block(), &Scope::default())?
            .into_function()?;
        self.apply(&function, argument.map(Evaluated::Value))?
            .into_value()
    }

    fn evaluate(
        &self,
        building_block: &BuildingBlock,
        scope: &Scope,
    ) -> Result<Evaluated, ExecutionError> {
        match building_block {
            BuildingBlock::Reference { name, .. } => scope
                .lookup(name)
                .cloned()
                .ok_or_else(|| ExecutionError::UnboundReference(name.clone())),
            BuildingBlock::Selection { source, index, .. } => {
                self.evaluate(source, scope)?.select(*index)
            }
            BuildingBlock::Struct { elements, ty } => {
                let container = ty.as_struct().map(|ty| ty.container).unwrap_or_default();
                let elements = elements
                    .iter()
                    .map(|(name, element)| Ok((name.clone(), self.evaluate(element, scope)?)))
                    .collect::<Result<_, ExecutionError>>()?;
                Ok(Evaluated::Struct(elements, container))
            }
            BuildingBlock::Call {
                function, argument, ..
            } => {
                let function = self.evaluate(function, scope)?.into_function()?;
                let argument = argument
                    .as_ref()
                    .map(|argument| self.evaluate(argument, scope))
                    .transpose()?;
                self.apply(&function, argument)
            }
            BuildingBlock::Lambda {
                parameter, result, ..
            } => Ok(Evaluated::Function(Function::Lambda {
                parameter: parameter.as_ref().map(|(name, _)| name.clone()),
                body: result.clone(),
                scope: scope.clone(),
            })),
            BuildingBlock::Block { locals, result } => {
                let mut scope = scope.clone();
                for (name, local) in locals {
                    let value = self.evaluate(local, &scope)?;
                    scope = scope.bind(name, value);
                }
                self.evaluate(result, &scope)
            }
            BuildingBlock::Intrinsic { intrinsic, ty } => {
                Ok(Evaluated::Function(Function::Intrinsic {
                    intrinsic: *intrinsic,
                    ty: ty.clone(),
                }))
            }
            BuildingBlock::Data { value, .. } => Ok(Evaluated::Value(value.clone())),
            BuildingBlock::Local(local) => Ok(Evaluated::Function(Function::Local(local.clone()))),
        }
    }

    fn apply(
        &self,
        function: &Function,
        argument: Option<Evaluated>,
    ) -> Result<Evaluated, ExecutionError> {
        match function {
            Function::Lambda {
                parameter,
                body,
                scope,
            } => {
                let scope = match (parameter, argument) {
                    (Some(name), Some(argument)) => scope.bind(name, argument),
                    (None, None) => scope.clone(),
                    (Some(_), None) => return Err(ExecutionError::MissingArgument(Type::empty())),
                    (None, Some(_)) => return Err(ExecutionError::UnexpectedArgument),
                };
                self.evaluate(body, &scope)
            }
            Function::Local(local) => {
                let argument = argument.map(Evaluated::into_value).transpose()?;
                trace!("calling local computation `{}`", local.name());
                local
                    .call(argument)
                    .map(Evaluated::Value)
                    .map_err(|source| ExecutionError::Local {
                        name: local.name().to_string(),
                        source,
                    })
            }
            Function::Intrinsic { intrinsic, ty } => {
                let argument = argument.ok_or_else(|| {
                    ExecutionError::MissingArgument(
                        ty.as_function()
                            .and_then(|ty| ty.parameter())
                            .cloned()
                            .unwrap_or_else(Type::empty),
                    )
                })?;
                self.apply_intrinsic(*intrinsic, ty, argument)
                    .map(Evaluated::Value)
            }
        }
    }

    fn apply_intrinsic(
        &self,
        intrinsic: Intrinsic,
        ty: &Type,
        argument: Evaluated,
    ) -> Result<Value, ExecutionError> {
        match intrinsic {
            Intrinsic::FederatedBroadcast => {
                let member = single_member(federated(argument.into_value()?, Placement::Server)?)?;
                Ok(Value::at_clients_all_equal(member))
            }
            Intrinsic::FederatedValueAtServer => Ok(Value::at_server(argument.into_value()?)),
            Intrinsic::FederatedValueAtClients => {
                Ok(Value::at_clients_all_equal(argument.into_value()?))
            }
            Intrinsic::FederatedMap | Intrinsic::FederatedApply => {
                let placement = if intrinsic == Intrinsic::FederatedMap {
                    Placement::Clients
                } else {
                    Placement::Server
                };
                let mut elements = argument.into_elements()?.into_iter();
                let (function, value) = match (elements.next(), elements.next()) {
                    (Some(function), Some(value)) => {
                        (function.into_function()?, value.into_value()?)
                    }
                    _ => {
                        return Err(ExecutionError::UnexpectedValue {
                            expected: "pair of function and value",
                            found: "struct",
                        })
                    }
                };
                let value = federated(value, placement)?;
                let all_equal = value.is_all_equal();
                let members = value
                    .into_members()
                    .into_iter()
                    .map(|member| {
                        self.apply(&function, Some(Evaluated::Value(member)))?
                            .into_value()
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Federated(FederatedValue::new(placement, all_equal, members)?))
            }
            Intrinsic::FederatedZipAtServer => {
                let (elements, container) = named_elements(argument)?;
                let members = elements
                    .into_iter()
                    .map(|(name, element)| {
                        let member =
                            single_member(federated(element.into_value()?, Placement::Server)?)?;
                        Ok((name, member))
                    })
                    .collect::<Result<_, ExecutionError>>()?;
                Ok(Value::at_server(Value::Struct(StructValue::new(members, container))))
            }
            Intrinsic::FederatedZipAtClients => self.zip_at_clients(argument),
            Intrinsic::FederatedSum | Intrinsic::FederatedMean => {
                let member = ty
                    .as_function()
                    .and_then(|ty| ty.parameter())
                    .and_then(|ty| ty.as_federated())
                    .map(|ty| ty.member.as_ref().clone())
                    .ok_or_else(|| ExecutionError::UnexpectedValue {
                        expected: "clients placed parameter",
                        found: "intrinsic",
                    })?;
                let functions = AggregationFunctions::canonical(intrinsic, &member)?;
                let root = Scope::default();
                let zero = self.evaluate(&functions.zero, &root)?.into_value()?;
                let accumulate = self.evaluate(&functions.accumulate, &root)?.into_function()?;
                let report = self.evaluate(&functions.report, &root)?.into_function()?;
                self.aggregate(argument.into_value()?, zero, &accumulate, &report)
            }
            Intrinsic::FederatedAggregate => {
                let mut elements = argument.into_elements()?.into_iter();
                match (
                    elements.next(),
                    elements.next(),
                    elements.next(),
                    elements.next(),
                    elements.next(),
                ) {
                    (Some(value), Some(zero), Some(accumulate), Some(_merge), Some(report)) => {
                        self.aggregate(
                            value.into_value()?,
                            zero.into_value()?,
                            &accumulate.into_function()?,
                            &report.into_function()?,
                        )
                    }
                    _ => Err(ExecutionError::UnexpectedValue {
                        expected: "struct of five elements",
                        found: "struct",
                    }),
                }
            }
        }
    }

    fn aggregate(
        &self,
        value: Value,
        zero: Value,
        accumulate: &Function,
        report: &Function,
    ) -> Result<Value, ExecutionError> {
        let members = self.client_members(federated(value, Placement::Clients)?)?;
        let mut accumulator = zero;
        for member in members {
            accumulator = self
                .apply(
                    accumulate,
                    Some(Evaluated::Value(Value::tuple(vec![accumulator, member]))),
                )?
                .into_value()?;
        }
        let result = self
            .apply(report, Some(Evaluated::Value(accumulator)))?
            .into_value()?;
        Ok(Value::at_server(result))
    }

    fn zip_at_clients(&self, argument: Evaluated) -> Result<Value, ExecutionError> {
        let (elements, container) = named_elements(argument)?;
        let elements = elements
            .into_iter()
            .map(|(name, element)| {
                Ok((name, federated(element.into_value()?, Placement::Clients)?))
            })
            .collect::<Result<Vec<_>, ExecutionError>>()?;

        if elements.iter().all(|(_, element)| element.is_all_equal()) {
            let members = elements
                .into_iter()
                .map(|(name, element)| Ok((name, single_member(element)?)))
                .collect::<Result<_, ExecutionError>>()?;
            return Ok(Value::at_clients_all_equal(Value::Struct(StructValue::new(
                members, container,
            ))));
        }

        let mut num_clients = None;
        for (_, element) in elements.iter().filter(|(_, element)| !element.is_all_equal()) {
            let len = element.members().len();
            match num_clients {
                Some(expected) if expected != len => {
                    return Err(ExecutionError::InconsistentNumClients(expected, len))
                }
                _ => num_clients = Some(len),
            }
        }
        let num_clients = num_clients.unwrap_or_default();
        let members = (0..num_clients)
            .map(|client| {
                let member = elements
                    .iter()
                    .map(|(name, element)| {
                        let index = if element.is_all_equal() { 0 } else { client };
                        (name.clone(), element.members()[index].clone())
                    })
                    .collect();
                Value::Struct(StructValue::new(member, container))
            })
            .collect();
        Ok(Value::at_clients(members))
    }

    fn client_members(&self, value: FederatedValue) -> Result<Vec<Value>, ExecutionError> {
        if value.is_all_equal() {
            let num_clients = self.num_clients.ok_or(ExecutionError::UnknownNumClients)?;
            let member = single_member(value)?;
            Ok(vec![member; num_clients])
        } else {
            Ok(value.into_members())
        }
    }
}

fn federated(value: Value, placement: Placement) -> Result<FederatedValue, ExecutionError> {
    match value {
        Value::Federated(value) if value.placement() == placement => Ok(value),
        other => Err(ExecutionError::UnexpectedValue {
            expected: match placement {
                Placement::Server => "server placed value",
                Placement::Clients => "clients placed value",
            },
            found: other.kind(),
        }),
    }
}

fn single_member(value: FederatedValue) -> Result<Value, ExecutionError> {
    let mut members = value.into_members();
    if members.len() != 1 {
        return Err(ExecutionError::UnexpectedValue {
            expected: "single member",
            found: "multiple members",
        });
    }
    Ok(members.swap_remove(0))
}

fn named_elements(
    argument: Evaluated,
) -> Result<(Vec<(Option<String>, Evaluated)>, Container), ExecutionError> {
    match argument {
        Evaluated::Struct(elements, container) => Ok((elements, container)),
        Evaluated::Value(Value::Struct(value)) => {
            let container = value.container();
            Ok((
                value
                    .into_elements()
                    .into_iter()
                    .map(|(name, element)| (name, Evaluated::Value(element)))
                    .collect(),
                container,
            ))
        }
        other => Err(ExecutionError::UnexpectedValue {
            expected: "struct",
            found: other.kind(),
        }),
    }
}

/// Infers the number of clients from the clients placed parts of a value.
///
/// All equal values don't count. Returns `None` if the value has no clients placed part which
/// isn't all equal.
pub fn infer_num_clients(value: &Value) -> Result<Option<usize>, ExecutionError> {
    fn visit(value: &Value, num_clients: &mut Option<usize>) -> Result<(), ExecutionError> {
        match value {
            Value::Federated(value) => {
                if value.placement() == Placement::Clients && !value.is_all_equal() {
                    let len = value.members().len();
                    match *num_clients {
                        Some(expected) if expected != len => {
                            return Err(ExecutionError::InconsistentNumClients(expected, len))
                        }
                        _ => *num_clients = Some(len),
                    }
                }
                Ok(())
            }
            Value::Struct(value) => value
                .iter()
                .try_for_each(|(_, element)| visit(element, num_clients)),
            Value::Tensor(_) | Value::Sequence(_) => Ok(()),
        }
    }
    let mut num_clients = None;
    visit(value, &mut num_clients)?;
    Ok(num_clients)
}
