//! Splitting a dataflow graph around its aggregations.

use std::collections::BTreeSet;

use fedcomp_core::types::Placement;

use super::{
    dataflow::{DataflowGraph, NodeId, Sym},
    MergeableFormError,
};

#[derive(Debug, PartialEq)]
/// The nodes of a graph, split at the merge point.
pub(crate) struct Partition {
    /// The aggregations, in the order their results are packed into the accumulator struct.
    pub aggregations: Vec<NodeId>,
    /// The nodes computed before the aggregations, by every inner context.
    pub before: BTreeSet<NodeId>,
    /// The nodes computed after the merge, by the primary context only.
    pub after: BTreeSet<NodeId>,
}

impl Partition {
    /// Partitions the live part of `graph`.
    ///
    /// All aggregations are merged at a single point, so none may consume the result of
    /// another. Aggregations are ordered by their position in the graph.
    ///
    /// # Errors
    /// Fails if an aggregation depends on another one or if a clients placed value is needed
    /// after the merge.
    pub(crate) fn new(graph: &DataflowGraph) -> Result<Self, MergeableFormError> {
        let live = live_nodes(graph);
        check_aggregation_dependencies(graph, &live)?;

        let aggregations: Vec<NodeId> = live
            .iter()
            .copied()
            .filter(|id| graph.nodes[*id].is_aggregation())
            .collect();

        let mut before = BTreeSet::new();
        for aggregation in &aggregations {
            collect_ancestors(graph, graph.nodes[*aggregation].inputs(), &mut before, |_| true);
        }

        let mut after = BTreeSet::new();
        collect_ancestors(graph, graph.result.inputs(), &mut after, |id| {
            !graph.nodes[id].is_aggregation()
        });

        let partition = Self {
            aggregations,
            before,
            after,
        };
        partition.check_after_merge_is_unplaced_or_at_server(graph)?;
        Ok(partition)
    }

    fn check_after_merge_is_unplaced_or_at_server(
        &self,
        graph: &DataflowGraph,
    ) -> Result<(), MergeableFormError> {
        for id in &self.after {
            let node = &graph.nodes[*id];
            if node.ty.contains_placement(Placement::Clients) {
                return Err(MergeableFormError::ClientsPlacedAfterMerge(node.ty.clone()));
            }
            if let Some(argument) = &node.argument {
                check_no_client_leaves(argument)?;
            }
        }
        check_no_client_leaves(&graph.result)
    }
}

fn check_no_client_leaves(sym: &Sym) -> Result<(), MergeableFormError> {
    let mut found = None;
    sym.for_each_leaf(&mut |leaf| match leaf {
        Sym::Param { ty, .. } | Sym::Literal { ty, .. } | Sym::Output { ty, .. }
            if found.is_none() && ty.contains_placement(Placement::Clients) =>
        {
            found = Some(ty.clone())
        }
        _ => {}
    });
    match found {
        Some(ty) => Err(MergeableFormError::ClientsPlacedAfterMerge(ty)),
        None => Ok(()),
    }
}

/// Gets the nodes the result depends on.
fn live_nodes(graph: &DataflowGraph) -> BTreeSet<NodeId> {
    let mut live = BTreeSet::new();
    collect_ancestors(graph, graph.result.inputs(), &mut live, |_| true);
    live
}

/// Collects `roots` and their transitive inputs, not descending into nodes rejected by `descend`.
/// Rejected nodes are not collected either.
fn collect_ancestors(
    graph: &DataflowGraph,
    roots: Vec<NodeId>,
    collected: &mut BTreeSet<NodeId>,
    descend: impl Fn(NodeId) -> bool,
) {
    let mut stack = roots;
    while let Some(id) = stack.pop() {
        if !descend(id) || !collected.insert(id) {
            continue;
        }
        stack.extend(graph.nodes[id].inputs());
    }
}

fn check_aggregation_dependencies(
    graph: &DataflowGraph,
    live: &BTreeSet<NodeId>,
) -> Result<(), MergeableFormError> {
    // for every node, the aggregations it transitively consumes
    let mut upstream: Vec<BTreeSet<NodeId>> = Vec::with_capacity(graph.nodes.len());
    for (id, node) in graph.nodes.iter().enumerate() {
        let mut aggregations = BTreeSet::new();
        for input in node.inputs() {
            aggregations.extend(upstream[input].iter().copied());
            if graph.nodes[input].is_aggregation() {
                aggregations.insert(input);
            }
        }
        if node.is_aggregation() && live.contains(&id) {
            if let Some(dependency) = aggregations.iter().next() {
                return Err(MergeableFormError::DependentAggregates {
                    dependent: describe(graph, id),
                    dependency: describe(graph, *dependency),
                });
            }
        }
        upstream.push(aggregations);
    }
    Ok(())
}

fn describe(graph: &DataflowGraph, id: NodeId) -> String {
    let node = &graph.nodes[id];
    match node.intrinsic() {
        Some(intrinsic) => format!("{} #{} -> {}", intrinsic, id, node.ty),
        None => format!("#{} -> {}", id, node.ty),
    }
}
