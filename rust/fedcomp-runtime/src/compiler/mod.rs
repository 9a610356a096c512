//! Compilation of computations into mergeable forms.
//!
//! The compiler proceeds in three passes:
//!
//! 1. [`dataflow`] normalizes the body of the computation into a graph of intrinsic and local
//!    computation calls.
//! 2. [`partition`] checks that the aggregations of the graph are independent of each other and
//!    splits the graph into the work before the aggregations and the work after the merge.
//! 3. [`emit`] renders `up_to_merge`, `merge` and `after_merge`.
//!
//! Computations without federated types at all pass through the same pipeline: they have no
//! aggregation, so everything ends up in `after_merge`.

mod dataflow;
mod emit;
mod partition;

use derive_more::Display;
use thiserror::Error;
use tracing::debug;

use fedcomp_core::{
    types::{Type, TypeError},
    Computation,
};

use self::{dataflow::DataflowGraph, emit::emit, partition::Partition};
use crate::form::MergeableCompForm;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum SignatureSide {
    #[display(fmt = "parameter")]
    Parameter,
    #[display(fmt = "result")]
    Result,
}

#[derive(Debug, Error)]
/// Errors of the mergeable form compiler.
pub enum MergeableFormError {
    #[error(
        "expected a computation without one aggregate dependent on another, \
         found {dependent} consuming {dependency}"
    )]
    DependentAggregates { dependent: String, dependency: String },
    #[error("every {side} leaf of a federated computation must be federated, found {ty}")]
    NonFederatedLeaf { side: SignatureSide, ty: Type },
    #[error("clients placed value of type {0} is needed after the merge")]
    ClientsPlacedAfterMerge(Type),
    #[error("functions passed to intrinsics must not capture names, found captures of {0:?}")]
    UnsupportedFunctionArgument(Vec<String>),
    #[error("unsupported construct: {0}")]
    Unsupported(String),
    #[error("invalid mergeable form: {0}")]
    InvalidForm(String),
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Compiles `computation` into an equivalent mergeable form.
///
/// All aggregations of the computation are merged at a single point, in the order they appear
/// in the computation. `after_merge` receives the original argument next to the merged
/// accumulators, so server placed work after the merge may read the argument again.
///
/// # Errors
/// Fails if the computation mixes federated and unplaced leaves in its signature, has an
/// aggregation depending on another, or needs clients placed values after the merge.
pub fn compile_to_mergeable_comp_form(
    computation: &Computation,
) -> Result<MergeableCompForm, MergeableFormError> {
    check_signature(computation)?;
    let graph = DataflowGraph::build(computation)?;
    let partition = Partition::new(&graph)?;
    debug!(
        "compiling `{}`: {} nodes before and {} after {} aggregations",
        computation.name(),
        partition.before.len(),
        partition.after.len(),
        partition.aggregations.len(),
    );
    let emitted = emit(&graph, &partition)?;

    let name = computation.name();
    let form = MergeableCompForm::new(
        Computation::new(format!("{}/up_to_merge", name), emitted.up_to_merge)?,
        Computation::new(format!("{}/merge", name), emitted.merge)?,
        Computation::new(format!("{}/after_merge", name), emitted.after_merge)?,
    )?;
    if form.after_merge().result_type() != computation.result_type() {
        return Err(MergeableFormError::InvalidForm(format!(
            "`after_merge` returns {} instead of {}",
            form.after_merge().result_type(),
            computation.result_type()
        )));
    }
    Ok(form)
}

fn check_signature(computation: &Computation) -> Result<(), MergeableFormError> {
    let parameter = computation.parameter_type();
    let result = computation.result_type();
    let federated =
        parameter.map_or(false, Type::contains_federated) || result.contains_federated();
    if !federated {
        return Ok(());
    }
    let sides = parameter
        .into_iter()
        .map(|ty| (SignatureSide::Parameter, ty))
        .chain(Some((SignatureSide::Result, result)));
    for (side, ty) in sides {
        if let Some(leaf) = ty.leaves().into_iter().find(|leaf| leaf.as_federated().is_none()) {
            return Err(MergeableFormError::NonFederatedLeaf {
                side,
                ty: leaf.clone(),
            });
        }
    }
    Ok(())
}
