//! The intermediate representation of federated computations.
//!
//! A computation body is a tree of [`BuildingBlock`]s. Every node knows its type, which is
//! checked when the node is built through one of the constructors below. The constructors are
//! the intended way to build trees; building variants by hand skips the type checks.

use std::{collections::BTreeSet, fmt, sync::Arc};

use crate::{
    intrinsics::Intrinsic,
    local::LocalComputation,
    types::{Container, Placement, Type, TypeError},
    value::Value,
};

#[derive(Clone, Debug, PartialEq)]
/// A node of the intermediate representation.
pub enum BuildingBlock {
    /// A name bound by an enclosing lambda or block.
    Reference { name: String, ty: Type },
    /// The element at `index` of a struct.
    Selection {
        source: Arc<BuildingBlock>,
        index: usize,
        ty: Type,
    },
    /// A struct of building blocks.
    Struct {
        elements: Vec<(Option<String>, Arc<BuildingBlock>)>,
        ty: Type,
    },
    /// The application of a function to an optional argument.
    Call {
        function: Arc<BuildingBlock>,
        argument: Option<Arc<BuildingBlock>>,
        ty: Type,
    },
    Lambda {
        parameter: Option<(String, Type)>,
        result: Arc<BuildingBlock>,
        ty: Type,
    },
    /// Sequential let-bindings followed by a result.
    Block {
        locals: Vec<(String, Arc<BuildingBlock>)>,
        result: Arc<BuildingBlock>,
    },
    Intrinsic { intrinsic: Intrinsic, ty: Type },
    /// A literal value.
    Data { value: Value, ty: Type },
    Local(LocalComputation),
}

impl BuildingBlock {
    pub fn reference(name: impl Into<String>, ty: Type) -> Self {
        BuildingBlock::Reference {
            name: name.into(),
            ty,
        }
    }

    /// Selects the element at `index` of a struct valued building block.
    pub fn selection(
        source: impl Into<Arc<BuildingBlock>>,
        index: usize,
    ) -> Result<Self, TypeError> {
        let source = source.into();
        let ty = source.type_signature().element(index)?.clone();
        Ok(BuildingBlock::Selection { source, index, ty })
    }

    /// Selects the element named `name` of a struct valued building block.
    pub fn selection_by_name(
        source: impl Into<Arc<BuildingBlock>>,
        name: &str,
    ) -> Result<Self, TypeError> {
        let source = source.into();
        let index = source
            .type_signature()
            .as_struct()
            .and_then(|ty| ty.position(name))
            .ok_or_else(|| {
                TypeError::Unsupported(format!(
                    "{} has no element named `{}`",
                    source.type_signature(),
                    name
                ))
            })?;
        Self::selection(source, index)
    }

    pub fn structure(
        elements: Vec<(Option<String>, Arc<BuildingBlock>)>,
        container: Container,
    ) -> Self {
        let ty = Type::structure(
            elements
                .iter()
                .map(|(name, element)| (name.clone(), element.type_signature().clone()))
                .collect(),
            container,
        );
        BuildingBlock::Struct { elements, ty }
    }

    /// A struct of unnamed elements.
    pub fn tuple(elements: impl IntoIterator<Item = BuildingBlock>) -> Self {
        Self::structure(
            elements
                .into_iter()
                .map(|element| (None, Arc::new(element)))
                .collect(),
            Container::Tuple,
        )
    }

    /// A struct of unnamed elements which is handed back as a list.
    pub fn list(elements: impl IntoIterator<Item = BuildingBlock>) -> Self {
        Self::structure(
            elements
                .into_iter()
                .map(|element| (None, Arc::new(element)))
                .collect(),
            Container::List,
        )
    }

    /// A struct of named elements.
    pub fn named<S: Into<String>>(elements: impl IntoIterator<Item = (S, BuildingBlock)>) -> Self {
        Self::structure(
            elements
                .into_iter()
                .map(|(name, element)| (Some(name.into()), Arc::new(element)))
                .collect(),
            Container::Map,
        )
    }

    /// Calls a function valued building block.
    pub fn call(
        function: impl Into<Arc<BuildingBlock>>,
        argument: Option<BuildingBlock>,
    ) -> Result<Self, TypeError> {
        let function = function.into();
        let function_type = function
            .type_signature()
            .as_function()
            .ok_or_else(|| TypeError::Kind {
                expected: "function",
                found: function.type_signature().clone(),
            })?;
        match (function_type.parameter(), &argument) {
            (Some(parameter), Some(argument)) => {
                parameter.check_assignable_from(argument.type_signature())?
            }
            (None, None) => {}
            (Some(parameter), None) => {
                return Err(TypeError::Unsupported(format!(
                    "missing argument of type {}",
                    parameter
                )))
            }
            (None, Some(argument)) => {
                return Err(TypeError::Unsupported(format!(
                    "unexpected argument of type {}",
                    argument.type_signature()
                )))
            }
        }
        let ty = function_type.result().clone();
        Ok(BuildingBlock::Call {
            function,
            argument: argument.map(Arc::new),
            ty,
        })
    }

    pub fn lambda(
        parameter: Option<(String, Type)>,
        result: impl Into<Arc<BuildingBlock>>,
    ) -> Self {
        let result = result.into();
        let ty = Type::function(
            parameter.as_ref().map(|(_, ty)| ty.clone()),
            result.type_signature().clone(),
        );
        BuildingBlock::Lambda {
            parameter,
            result,
            ty,
        }
    }

    pub fn block(
        locals: Vec<(String, Arc<BuildingBlock>)>,
        result: impl Into<Arc<BuildingBlock>>,
    ) -> Self {
        BuildingBlock::Block {
            locals,
            result: result.into(),
        }
    }

    /// Creates a literal.
    pub fn data(value: Value, ty: Type) -> Result<Self, TypeError> {
        ty.check_value(&value)?;
        Ok(BuildingBlock::Data { value, ty })
    }

    /// Creates a literal whose type is inferred from the value.
    pub fn literal(value: Value) -> Result<Self, TypeError> {
        let ty = value
            .infer_type()
            .map_err(|error| TypeError::Unsupported(error.to_string()))?;
        Ok(BuildingBlock::Data { value, ty })
    }

    /// Creates the intrinsic node for a call with an argument of type `argument`.
    pub fn intrinsic(intrinsic: Intrinsic, argument: &Type) -> Result<Self, TypeError> {
        let ty = Type::Function(intrinsic.infer_type(argument)?);
        Ok(BuildingBlock::Intrinsic { intrinsic, ty })
    }

    /// Gets the type of the node.
    pub fn type_signature(&self) -> &Type {
        match self {
            BuildingBlock::Reference { ty, .. }
            | BuildingBlock::Selection { ty, .. }
            | BuildingBlock::Struct { ty, .. }
            | BuildingBlock::Call { ty, .. }
            | BuildingBlock::Lambda { ty, .. }
            | BuildingBlock::Intrinsic { ty, .. }
            | BuildingBlock::Data { ty, .. } => ty,
            BuildingBlock::Block { result, .. } => result.type_signature(),
            BuildingBlock::Local(local) => local.function_type(),
        }
    }

    /// Collects the names referenced but not bound inside the node.
    pub fn free_variables(&self) -> BTreeSet<String> {
        let mut free = BTreeSet::new();
        self.collect_free_variables(&mut Vec::new(), &mut free);
        free
    }

    fn collect_free_variables<'a>(&'a self, bound: &mut Vec<&'a str>, free: &mut BTreeSet<String>) {
        match self {
            BuildingBlock::Reference { name, .. } => {
                if !bound.contains(&name.as_str()) {
                    free.insert(name.clone());
                }
            }
            BuildingBlock::Selection { source, .. } => source.collect_free_variables(bound, free),
            BuildingBlock::Struct { elements, .. } => elements
                .iter()
                .for_each(|(_, element)| element.collect_free_variables(bound, free)),
            BuildingBlock::Call {
                function, argument, ..
            } => {
                function.collect_free_variables(bound, free);
                if let Some(argument) = argument {
                    argument.collect_free_variables(bound, free);
                }
            }
            BuildingBlock::Lambda {
                parameter, result, ..
            } => {
                let depth = bound.len();
                if let Some((name, _)) = parameter {
                    bound.push(name);
                }
                result.collect_free_variables(bound, free);
                bound.truncate(depth);
            }
            BuildingBlock::Block { locals, result } => {
                let depth = bound.len();
                for (name, local) in locals {
                    local.collect_free_variables(bound, free);
                    bound.push(name);
                }
                result.collect_free_variables(bound, free);
                bound.truncate(depth);
            }
            BuildingBlock::Intrinsic { .. }
            | BuildingBlock::Data { .. }
            | BuildingBlock::Local(_) => {}
        }
    }
}

impl From<LocalComputation> for BuildingBlock {
    fn from(local: LocalComputation) -> Self {
        BuildingBlock::Local(local)
    }
}

fn call_intrinsic(
    intrinsic: Intrinsic,
    argument: BuildingBlock,
) -> Result<BuildingBlock, TypeError> {
    let function = BuildingBlock::intrinsic(intrinsic, argument.type_signature())?;
    BuildingBlock::call(function, Some(argument))
}

/// `federated_broadcast(T@SERVER) -> T@CLIENTS`
pub fn federated_broadcast(value: BuildingBlock) -> Result<BuildingBlock, TypeError> {
    call_intrinsic(Intrinsic::FederatedBroadcast, value)
}

/// `federated_map(<(T -> U), T@CLIENTS>) -> U@CLIENTS`
pub fn federated_map(
    function: BuildingBlock,
    value: BuildingBlock,
) -> Result<BuildingBlock, TypeError> {
    call_intrinsic(Intrinsic::FederatedMap, BuildingBlock::tuple(vec![function, value]))
}

/// `federated_apply(<(T -> U), T@SERVER>) -> U@SERVER`
pub fn federated_apply(
    function: BuildingBlock,
    value: BuildingBlock,
) -> Result<BuildingBlock, TypeError> {
    call_intrinsic(Intrinsic::FederatedApply, BuildingBlock::tuple(vec![function, value]))
}

/// `federated_value(T) -> T@placement`
pub fn federated_value(
    value: BuildingBlock,
    placement: Placement,
) -> Result<BuildingBlock, TypeError> {
    let intrinsic = match placement {
        Placement::Server => Intrinsic::FederatedValueAtServer,
        Placement::Clients => Intrinsic::FederatedValueAtClients,
    };
    call_intrinsic(intrinsic, value)
}

/// `federated_zip_at_server(<T1@SERVER, ..>) -> <T1, ..>@SERVER`
pub fn federated_zip_at_server(value: BuildingBlock) -> Result<BuildingBlock, TypeError> {
    call_intrinsic(Intrinsic::FederatedZipAtServer, value)
}

/// `federated_zip_at_clients(<{T1}@CLIENTS, ..>) -> {<T1, ..>}@CLIENTS`
pub fn federated_zip_at_clients(value: BuildingBlock) -> Result<BuildingBlock, TypeError> {
    call_intrinsic(Intrinsic::FederatedZipAtClients, value)
}

/// `federated_sum({T}@CLIENTS) -> T@SERVER`
pub fn federated_sum(value: BuildingBlock) -> Result<BuildingBlock, TypeError> {
    call_intrinsic(Intrinsic::FederatedSum, value)
}

/// `federated_mean({T}@CLIENTS) -> T@SERVER`
pub fn federated_mean(value: BuildingBlock) -> Result<BuildingBlock, TypeError> {
    call_intrinsic(Intrinsic::FederatedMean, value)
}

/// `federated_aggregate(<{T}@CLIENTS, A, (<A,T> -> A), (<A,A> -> A), (A -> R)>) -> R@SERVER`
pub fn federated_aggregate(
    value: BuildingBlock,
    zero: BuildingBlock,
    accumulate: BuildingBlock,
    merge: BuildingBlock,
    report: BuildingBlock,
) -> Result<BuildingBlock, TypeError> {
    call_intrinsic(
        Intrinsic::FederatedAggregate,
        BuildingBlock::tuple(vec![value, zero, accumulate, merge, report]),
    )
}

impl fmt::Display for BuildingBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildingBlock::Reference { name, .. } => write!(f, "{}", name),
            BuildingBlock::Selection { source, index, .. } => write!(f, "{}[{}]", source, index),
            BuildingBlock::Struct { elements, .. } => {
                write!(f, "<")?;
                for (position, (name, element)) in elements.iter().enumerate() {
                    if position > 0 {
                        write!(f, ",")?;
                    }
                    if let Some(name) = name {
                        write!(f, "{}=", name)?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, ">")
            }
            BuildingBlock::Call {
                function, argument, ..
            } => match argument {
                Some(argument) => write!(f, "{}({})", function, argument),
                None => write!(f, "{}()", function),
            },
            BuildingBlock::Lambda {
                parameter, result, ..
            } => match parameter {
                Some((name, _)) => write!(f, "({} -> {})", name, result),
                None => write!(f, "( -> {})", result),
            },
            BuildingBlock::Block { locals, result } => {
                write!(f, "(let ")?;
                for (position, (name, local)) in locals.iter().enumerate() {
                    if position > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}={}", name, local)?;
                }
                write!(f, " in {})", result)
            }
            BuildingBlock::Intrinsic { intrinsic, .. } => write!(f, "{}", intrinsic),
            BuildingBlock::Data { value, .. } => match value.as_tensor() {
                Some(tensor) => write!(f, "{:?}", tensor.to_f64_vec()),
                None => write!(f, "data"),
            },
            BuildingBlock::Local(local) => write!(f, "local:{}", local.name()),
        }
    }
}
