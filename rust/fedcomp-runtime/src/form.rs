//! Mergeable computation forms.

use derive_more::{Display, From};
use uuid::Uuid;

use fedcomp_core::{
    types::{Placement, Type},
    Computation,
};

use crate::compiler::MergeableFormError;

#[derive(Clone, Copy, Debug, Display, Eq, From, Hash, PartialEq)]
/// The identifier of a mergeable form, used to tell forms apart in logs.
pub struct FormId(Uuid);

impl FormId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Clone, Debug)]
/// A computation split around its aggregation.
///
/// Invoking the form on an argument partitioned into `arg_1..arg_n` computes
///
/// ```text
/// after_merge(<arg, merge(..merge(up_to_merge(arg_1), up_to_merge(arg_2)).., up_to_merge(arg_n))>)
/// ```
///
/// where `arg` is the unpartitioned argument (or its first partition).
pub struct MergeableCompForm {
    id: FormId,
    up_to_merge: Computation,
    merge: Computation,
    after_merge: Computation,
}

impl MergeableCompForm {
    /// Creates a form from its three computations.
    ///
    /// # Errors
    /// Fails if the signatures don't line up:
    /// - `merge` must combine two results of `up_to_merge` into another one.
    /// - `after_merge` must take the argument of `up_to_merge` (or `<>` if there is none) and a
    ///   merged result.
    pub fn new(
        up_to_merge: Computation,
        merge: Computation,
        after_merge: Computation,
    ) -> Result<Self, MergeableFormError> {
        let partial = up_to_merge.result_type();

        let pair = Type::tuple(vec![partial.clone(), partial.clone()]);
        match merge.parameter_type() {
            Some(parameter) if parameter.is_assignable_from(&pair) => {}
            parameter => {
                return Err(MergeableFormError::InvalidForm(format!(
                    "`merge` must accept {}, found {:?}",
                    pair, parameter
                )))
            }
        }
        if !partial.is_assignable_from(merge.result_type()) {
            return Err(MergeableFormError::InvalidForm(format!(
                "`merge` must return {}, found {}",
                partial,
                merge.result_type()
            )));
        }

        let original = up_to_merge.parameter_type().cloned().unwrap_or_else(Type::empty);
        let expected = Type::tuple(vec![original, partial.clone()]);
        match after_merge.parameter_type() {
            Some(parameter) if parameter.is_assignable_from(&expected) => {}
            parameter => {
                return Err(MergeableFormError::InvalidForm(format!(
                    "`after_merge` must accept {}, found {:?}",
                    expected, parameter
                )))
            }
        }

        Ok(Self {
            id: FormId::new(),
            up_to_merge,
            merge,
            after_merge,
        })
    }

    pub fn id(&self) -> FormId {
        self.id
    }

    /// Gets the computation run by every inner context on its part of the argument.
    pub fn up_to_merge(&self) -> &Computation {
        &self.up_to_merge
    }

    /// Gets the computation combining two partial results.
    pub fn merge(&self) -> &Computation {
        &self.merge
    }

    /// Gets the computation producing the result from the original argument and the merged
    /// partial results.
    pub fn after_merge(&self) -> &Computation {
        &self.after_merge
    }

    /// Checks whether the argument holds clients placed data, i.e. whether it may be partitioned.
    pub fn has_clients_parameter(&self) -> bool {
        self.up_to_merge
            .parameter_type()
            .map_or(false, |ty| ty.contains_placement(Placement::Clients))
    }
}
