//! Rendering a partitioned dataflow graph back into the building blocks of a mergeable form.

use std::sync::Arc;

use fedcomp_core::{
    building_blocks::{federated_aggregate, federated_apply, federated_zip_at_server, BuildingBlock},
    intrinsics::{AggregationFunctions, Intrinsic},
    local::LocalComputation,
    types::{Type, TypeError},
};

use super::{
    dataflow::{DataflowGraph, FunctionSym, Node, NodeId, Sym},
    partition::Partition,
    MergeableFormError,
};

const ARG: &str = "_arg";
const MERGE_ARG: &str = "_merge_arg";

fn binding_name(id: NodeId) -> String {
    format!("_var{}", id)
}

/// The decomposition of one aggregation node.
struct Aggregation {
    id: NodeId,
    value: Sym,
    functions: AggregationFunctions,
}

impl Aggregation {
    fn new(graph: &DataflowGraph, id: NodeId) -> Result<Self, MergeableFormError> {
        let node = &graph.nodes[id];
        let argument = node
            .argument
            .clone()
            .ok_or_else(|| {
                MergeableFormError::Unsupported("aggregation without an argument".into())
            })?;
        match node.intrinsic() {
            Some(intrinsic @ (Intrinsic::FederatedSum | Intrinsic::FederatedMean)) => {
                let ty = argument.ty();
                let member = &ty
                    .as_federated()
                    .ok_or_else(|| TypeError::Kind {
                        expected: "federated",
                        found: ty.clone(),
                    })?
                    .member;
                let functions = AggregationFunctions::canonical(intrinsic, member)?;
                Ok(Self {
                    id,
                    value: argument,
                    functions,
                })
            }
            Some(Intrinsic::FederatedAggregate) => {
                let elements = match argument {
                    Sym::Struct { elements, .. } if elements.len() == 5 => elements,
                    other => {
                        return Err(MergeableFormError::Unsupported(format!(
                            "federated_aggregate on a packed argument of type {}",
                            other.ty()
                        )))
                    }
                };
                let mut elements = elements.into_iter().map(|(_, element)| element);
                let mut next = || {
                    elements
                        .next()
                        .ok_or_else(|| {
                            MergeableFormError::Unsupported("truncated aggregation".into())
                        })
                };
                let value = next()?;
                let zero = Arc::new(render_closed(&next()?)?);
                let accumulate = Arc::new(render_closed(&next()?)?);
                let merge = Arc::new(render_closed(&next()?)?);
                let report = Arc::new(render_closed(&next()?)?);
                Ok(Self {
                    id,
                    value,
                    functions: AggregationFunctions {
                        zero,
                        accumulate,
                        merge,
                        report,
                    },
                })
            }
            _ => Err(MergeableFormError::Unsupported(format!(
                "{} is not an aggregation",
                node.function
            ))),
        }
    }

    fn accumulator_type(&self) -> Type {
        Type::at_server(self.functions.accumulator_type().clone())
    }
}

/// Renders the building blocks of the symbolic values of a graph.
struct Renderer<'g> {
    graph: &'g DataflowGraph,
    parameter: Option<BuildingBlock>,
}

impl<'g> Renderer<'g> {
    fn render(&self, sym: &Sym) -> Result<BuildingBlock, MergeableFormError> {
        match sym {
            Sym::Param { path, .. } => {
                let mut building_block = self
                    .parameter
                    .clone()
                    .ok_or_else(|| {
                        MergeableFormError::Unsupported(
                            "parameter of a computation without one".into(),
                        )
                    })?;
                for index in path {
                    building_block = BuildingBlock::selection(building_block, *index)?;
                }
                Ok(building_block)
            }
            Sym::Output { node, path, .. } => {
                let ty = self.graph.nodes[*node].ty.clone();
                let mut building_block = BuildingBlock::reference(binding_name(*node), ty);
                for index in path {
                    building_block = BuildingBlock::selection(building_block, *index)?;
                }
                Ok(building_block)
            }
            Sym::Struct {
                elements,
                container,
            } => Ok(BuildingBlock::structure(
                elements
                    .iter()
                    .map(|(name, element)| Ok((name.clone(), Arc::new(self.render(element)?))))
                    .collect::<Result<_, MergeableFormError>>()?,
                *container,
            )),
            leaf => render_closed(leaf),
        }
    }

    fn bind(&self, node: &Node) -> Result<BuildingBlock, MergeableFormError> {
        let argument = node
            .argument
            .as_ref()
            .map(|argument| self.render(argument))
            .transpose()?;
        Ok(BuildingBlock::call(node.function.clone(), argument)?)
    }

    fn bindings<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a NodeId>,
    ) -> Result<Vec<(String, Arc<BuildingBlock>)>, MergeableFormError> {
        ids.into_iter()
            .map(|id| Ok((binding_name(*id), Arc::new(self.bind(&self.graph.nodes[*id])?))))
            .collect()
    }
}

/// Renders a symbolic value which doesn't refer to the parameter or to nodes.
fn render_closed(sym: &Sym) -> Result<BuildingBlock, MergeableFormError> {
    match sym {
        Sym::Literal { value, ty } => Ok(BuildingBlock::data(value.clone(), ty.clone())?),
        Sym::Function(FunctionSym::Lambda { building_block, .. })
        | Sym::Function(FunctionSym::Opaque(building_block)) => Ok(building_block.as_ref().clone()),
        Sym::Struct {
            elements,
            container,
        } => Ok(BuildingBlock::structure(
            elements
                .iter()
                .map(|(name, element)| Ok((name.clone(), Arc::new(render_closed(element)?))))
                .collect::<Result<_, MergeableFormError>>()?,
            *container,
        )),
        Sym::Param { .. } | Sym::Output { .. } => Err(MergeableFormError::Unsupported(
            "aggregation functions computed inside the computation".into(),
        )),
    }
}

fn with_bindings(
    locals: Vec<(String, Arc<BuildingBlock>)>,
    result: BuildingBlock,
) -> BuildingBlock {
    if locals.is_empty() {
        result
    } else {
        BuildingBlock::block(locals, result)
    }
}

/// The three building blocks of a mergeable form.
pub(crate) struct Emitted {
    pub up_to_merge: BuildingBlock,
    pub merge: BuildingBlock,
    pub after_merge: BuildingBlock,
}

pub(crate) fn emit(
    graph: &DataflowGraph,
    partition: &Partition,
) -> Result<Emitted, MergeableFormError> {
    let aggregations = partition
        .aggregations
        .iter()
        .map(|id| Aggregation::new(graph, *id))
        .collect::<Result<Vec<_>, _>>()?;
    let accumulators = Type::tuple(aggregations.iter().map(Aggregation::accumulator_type));
    let parameter = graph.parameter.clone();

    // up_to_merge: the client work, then every aggregation up to its accumulator
    let renderer = Renderer {
        graph,
        parameter: parameter
            .as_ref()
            .map(|ty| BuildingBlock::reference(ARG, ty.clone())),
    };
    let partials = aggregations
        .iter()
        .map(|aggregation| {
            let accumulator = aggregation.functions.accumulator_type().clone();
            Ok(federated_aggregate(
                renderer.render(&aggregation.value)?,
                aggregation.functions.zero.as_ref().clone(),
                aggregation.functions.accumulate.as_ref().clone(),
                aggregation.functions.merge.as_ref().clone(),
                BuildingBlock::Local(LocalComputation::identity(accumulator)?),
            )?)
        })
        .collect::<Result<Vec<_>, MergeableFormError>>()?;
    let up_to_merge = BuildingBlock::lambda(
        parameter.clone().map(|ty| (ARG.to_string(), ty)),
        with_bindings(renderer.bindings(&partition.before)?, BuildingBlock::tuple(partials)),
    );

    // merge: combines two accumulator structs element by element
    let merge_parameter = Type::tuple(vec![accumulators.clone(), accumulators.clone()]);
    let merge_arg = BuildingBlock::reference(MERGE_ARG, merge_parameter.clone());
    let merged = aggregations
        .iter()
        .enumerate()
        .map(|(index, aggregation)| {
            let lhs =
                BuildingBlock::selection(BuildingBlock::selection(merge_arg.clone(), 0)?, index)?;
            let rhs =
                BuildingBlock::selection(BuildingBlock::selection(merge_arg.clone(), 1)?, index)?;
            let zipped = federated_zip_at_server(BuildingBlock::tuple(vec![lhs, rhs]))?;
            federated_apply(aggregation.functions.merge.as_ref().clone(), zipped)
        })
        .collect::<Result<Vec<_>, TypeError>>()?;
    let merge = BuildingBlock::lambda(
        Some((MERGE_ARG.to_string(), merge_parameter)),
        BuildingBlock::tuple(merged),
    );

    // after_merge: reports the merged accumulators, then the server work on the original argument
    let after_parameter =
        Type::tuple(vec![parameter.clone().unwrap_or_else(Type::empty), accumulators]);
    let after_arg = BuildingBlock::reference(ARG, after_parameter.clone());
    let renderer = Renderer {
        graph,
        parameter: Some(BuildingBlock::selection(after_arg.clone(), 0)?),
    };
    let mut locals = aggregations
        .iter()
        .enumerate()
        .map(|(index, aggregation)| {
            let accumulator =
                BuildingBlock::selection(BuildingBlock::selection(after_arg.clone(), 1)?, index)?;
            let report =
                federated_apply(aggregation.functions.report.as_ref().clone(), accumulator)?;
            Ok((binding_name(aggregation.id), Arc::new(report)))
        })
        .collect::<Result<Vec<_>, MergeableFormError>>()?;
    locals.extend(renderer.bindings(&partition.after)?);
    let after_merge = BuildingBlock::lambda(
        Some((ARG.to_string(), after_parameter)),
        with_bindings(locals, renderer.render(&graph.result)?),
    );

    Ok(Emitted {
        up_to_merge,
        merge,
        after_merge,
    })
}
