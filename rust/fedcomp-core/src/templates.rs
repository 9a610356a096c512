//! Validation of process templates.
//!
//! An aggregation process is a pair of computations: `initialize` creates the server state and
//! `next` consumes the state and a clients placed value to produce a new state, the aggregate and
//! measurements. The checks here make sure both computations fit that shape before they are
//! handed to an execution context.

use thiserror::Error;

use crate::{
    computation::Computation,
    types::{Placement, Type},
};

#[derive(Debug, Error, PartialEq)]
/// Errors of template validation.
pub enum TemplateError {
    #[error("`initialize` must not take an argument, found {0}")]
    InitializeHasParameter(Type),
    #[error("all parameters and results of `{function}` must be federated, found {ty}")]
    AggregationNotFederated { function: &'static str, ty: Type },
    #[error("{what} must be placed at {expected}, found {found}")]
    AggregationPlacement {
        what: &'static str,
        expected: Placement,
        found: Type,
    },
    #[error("`next` must take at least two parameters, found {0}")]
    NextFnNumArgs(usize),
    #[error("`next` must return a struct with `state`, `result` and `measurements`, found {0}")]
    NextResultShape(Type),
    #[error("the state of `next` is not assignable from {initialize}, found {next}")]
    StateNotAssignable { initialize: Type, next: Type },
    #[error("expected a clients placed structure of sequences, found {0}")]
    ClientSequenceType(Type),
}

#[derive(Clone, Debug)]
/// A validated aggregation process.
pub struct AggregationProcess {
    initialize: Computation,
    next: Computation,
}

impl AggregationProcess {
    /// Validates and wraps a pair of computations.
    ///
    /// # Errors
    /// Fails when:
    /// - `initialize` takes an argument or its result is not a server placed value.
    /// - A parameter or result leaf of `next` is not federated.
    /// - `next` takes less than two parameters or its second parameter is not clients placed.
    /// - `next` doesn't return server placed `state`, `result` and `measurements`.
    /// - The state types of the two computations don't line up.
    pub fn new(initialize: Computation, next: Computation) -> Result<Self, TemplateError> {
        if let Some(parameter) = initialize.parameter_type() {
            return Err(TemplateError::InitializeHasParameter(parameter.clone()));
        }
        let state = initialize.result_type();
        check_placement("the result of `initialize`", state, Placement::Server)?;

        let parameter = next.parameter_type().cloned().unwrap_or_else(Type::empty);
        let result = next.result_type();
        for ty in parameter.leaves().into_iter().chain(result.leaves()) {
            if ty.as_federated().is_none() {
                return Err(TemplateError::AggregationNotFederated {
                    function: "next",
                    ty: ty.clone(),
                });
            }
        }

        let parameters = parameter.as_struct().map_or(0, |ty| ty.elements.len());
        if parameters < 2 {
            return Err(TemplateError::NextFnNumArgs(parameters));
        }
        let next_state = parameter.as_struct().map(|ty| &ty.elements[0].1);
        let value = parameter.as_struct().map(|ty| &ty.elements[1].1);
        if let Some(value) = value {
            check_placement("the second parameter of `next`", value, Placement::Clients)?;
        }

        let output = result
            .as_struct()
            .ok_or_else(|| TemplateError::NextResultShape(result.clone()))?;
        let (output_state, output_result, measurements) = match (
            output.get("state"),
            output.get("result"),
            output.get("measurements"),
        ) {
            (Some(state), Some(result), Some(measurements)) => (state, result, measurements),
            _ => return Err(TemplateError::NextResultShape(result.clone())),
        };
        check_placement("the `state` result of `next`", output_state, Placement::Server)?;
        check_placement("the `result` of `next`", output_result, Placement::Server)?;
        check_placement("the `measurements` of `next`", measurements, Placement::Server)?;

        if let Some(next_state) = next_state {
            if !next_state.is_assignable_from(state)
                || !next_state.is_assignable_from(output_state)
            {
                return Err(TemplateError::StateNotAssignable {
                    initialize: state.clone(),
                    next: next_state.clone(),
                });
            }
        }

        Ok(Self { initialize, next })
    }

    pub fn initialize(&self) -> &Computation {
        &self.initialize
    }

    pub fn next(&self) -> &Computation {
        &self.next
    }
}

fn check_placement(
    what: &'static str,
    ty: &Type,
    expected: Placement,
) -> Result<(), TemplateError> {
    match ty.placement() {
        Some(placement) if placement == expected => Ok(()),
        _ => Err(TemplateError::AggregationPlacement {
            what,
            expected,
            found: ty.clone(),
        }),
    }
}

/// Checks that `ty` is a clients placed sequence, or a clients placed struct whose leaves are all
/// sequences.
pub fn check_is_client_placed_structure_of_sequences(ty: &Type) -> Result<(), TemplateError> {
    let member = match ty.as_federated() {
        Some(federated) if federated.placement == Placement::Clients => &federated.member,
        _ => return Err(TemplateError::ClientSequenceType(ty.clone())),
    };
    if member
        .leaves()
        .iter()
        .all(|leaf| matches!(leaf, Type::Sequence(_)))
    {
        Ok(())
    } else {
        Err(TemplateError::ClientSequenceType(ty.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        building_blocks::{federated_sum, federated_value, BuildingBlock},
        types::DType,
        value::Value,
    };

    fn int32() -> Type {
        Type::scalar(DType::I32)
    }

    fn initialize() -> Computation {
        Computation::from_fn("initialize", None, |_| {
            federated_value(BuildingBlock::literal(Value::from(0))?, Placement::Server)
        })
        .unwrap()
    }

    fn next(value: Type) -> Computation {
        let parameter = Type::tuple(vec![Type::at_server(int32()), value]);
        Computation::from_fn("next", Some(parameter), |arg| {
            let arg = arg.unwrap();
            let state = BuildingBlock::selection(arg.clone(), 0)?;
            let sum = federated_sum(BuildingBlock::selection(arg, 1)?)?;
            Ok(BuildingBlock::named(vec![
                ("state", state.clone()),
                ("result", sum),
                ("measurements", state),
            ]))
        })
        .unwrap()
    }

    #[test]
    fn test_valid_process() {
        assert!(AggregationProcess::new(initialize(), next(Type::at_clients(int32()))).is_ok());
    }

    #[test]
    fn test_initialize_must_be_server_placed() {
        let initialize = Computation::from_fn("initialize", None, |_| {
            federated_value(BuildingBlock::literal(Value::from(0))?, Placement::Clients)
        })
        .unwrap();
        assert!(matches!(
            AggregationProcess::new(initialize, next(Type::at_clients(int32()))),
            Err(TemplateError::AggregationPlacement { .. })
        ));
    }

    #[test]
    fn test_next_must_be_federated() {
        let next = Computation::from_fn(
            "next",
            Some(Type::tuple(vec![Type::at_server(int32()), int32()])),
            |arg| BuildingBlock::selection(arg.unwrap(), 0),
        )
        .unwrap();
        assert_eq!(
            AggregationProcess::new(initialize(), next).unwrap_err(),
            TemplateError::AggregationNotFederated {
                function: "next",
                ty: int32()
            }
        );
    }

    #[test]
    fn test_next_needs_two_parameters() {
        let parameter = Type::tuple(vec![Type::at_server(int32())]);
        let next = Computation::from_fn("next", Some(parameter), |arg| {
            let state = BuildingBlock::selection(arg.unwrap(), 0)?;
            Ok(BuildingBlock::named(vec![
                ("state", state.clone()),
                ("result", state.clone()),
                ("measurements", state),
            ]))
        })
        .unwrap();
        assert_eq!(
            AggregationProcess::new(initialize(), next).unwrap_err(),
            TemplateError::NextFnNumArgs(1)
        );
    }

    #[test]
    fn test_second_parameter_must_be_clients_placed() {
        let next = Computation::from_fn(
            "next",
            Some(Type::tuple(vec![Type::at_server(int32()), Type::at_server(int32())])),
            |arg| {
                let state = BuildingBlock::selection(arg.unwrap(), 0)?;
                Ok(BuildingBlock::named(vec![
                    ("state", state.clone()),
                    ("result", state.clone()),
                    ("measurements", state),
                ]))
            },
        )
        .unwrap();
        assert!(matches!(
            AggregationProcess::new(initialize(), next),
            Err(TemplateError::AggregationPlacement {
                expected: Placement::Clients,
                ..
            })
        ));
    }

    #[test]
    fn test_client_placed_structure_of_sequences() {
        let sequence = Type::sequence(int32());
        assert!(
            check_is_client_placed_structure_of_sequences(&Type::at_clients(sequence.clone()))
                .is_ok()
        );
        assert!(check_is_client_placed_structure_of_sequences(&Type::at_clients(Type::named(vec![
            ("x", sequence.clone()),
            ("y", sequence.clone()),
        ])))
        .is_ok());
        assert!(
            check_is_client_placed_structure_of_sequences(&Type::at_server(sequence.clone()))
                .is_err()
        );
        assert!(check_is_client_placed_structure_of_sequences(&Type::at_clients(Type::tuple(vec![
            sequence,
            int32(),
        ])))
        .is_err());
    }
}
