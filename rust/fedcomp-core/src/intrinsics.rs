//! Federated intrinsics.
//!
//! Intrinsics are the only building blocks that move values between placements. The aggregation
//! intrinsics all decompose into the same four functions (see [`AggregationFunctions`]) which is
//! what makes them splittable into a pre-merge, a merge and a post-merge part.

use std::sync::Arc;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    building_blocks::BuildingBlock,
    local::{pair, LocalComputation},
    types::{DType, FunctionType, Placement, Type, TypeError},
    value::Value,
};

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// A federated intrinsic.
pub enum Intrinsic {
    #[display(fmt = "federated_broadcast")]
    FederatedBroadcast,
    #[display(fmt = "federated_map")]
    FederatedMap,
    #[display(fmt = "federated_apply")]
    FederatedApply,
    #[display(fmt = "federated_value_at_server")]
    FederatedValueAtServer,
    #[display(fmt = "federated_value_at_clients")]
    FederatedValueAtClients,
    #[display(fmt = "federated_zip_at_server")]
    FederatedZipAtServer,
    #[display(fmt = "federated_zip_at_clients")]
    FederatedZipAtClients,
    #[display(fmt = "federated_sum")]
    FederatedSum,
    #[display(fmt = "federated_mean")]
    FederatedMean,
    #[display(fmt = "federated_aggregate")]
    FederatedAggregate,
}

impl Intrinsic {
    /// Checks whether the intrinsic aggregates clients placed values at the server.
    pub fn is_aggregation(self) -> bool {
        matches!(
            self,
            Intrinsic::FederatedSum | Intrinsic::FederatedMean | Intrinsic::FederatedAggregate
        )
    }

    /// Infers the function type of the intrinsic when called with an argument of type `argument`.
    pub fn infer_type(self, argument: &Type) -> Result<FunctionType, TypeError> {
        let result = match self {
            Intrinsic::FederatedBroadcast => {
                let member = federated_member(argument, Placement::Server)?;
                Type::federated(member.clone(), Placement::Clients, true)
            }
            Intrinsic::FederatedMap | Intrinsic::FederatedApply => {
                let placement = if self == Intrinsic::FederatedMap {
                    Placement::Clients
                } else {
                    Placement::Server
                };
                let function = argument.element(0)?;
                let value = argument.element(1)?;
                let function = function.as_function().ok_or_else(|| TypeError::Kind {
                    expected: "function",
                    found: function.clone(),
                })?;
                let member = federated_member(value, placement)?;
                check_parameter(function, member)?;
                let all_equal = value.as_federated().map_or(true, |ty| ty.all_equal);
                Type::federated(function.result().clone(), placement, all_equal)
            }
            Intrinsic::FederatedValueAtServer | Intrinsic::FederatedValueAtClients => {
                if argument.contains_federated() {
                    return Err(TypeError::Kind {
                        expected: "unplaced",
                        found: argument.clone(),
                    });
                }
                let placement = if self == Intrinsic::FederatedValueAtServer {
                    Placement::Server
                } else {
                    Placement::Clients
                };
                Type::federated(argument.clone(), placement, true)
            }
            Intrinsic::FederatedZipAtServer | Intrinsic::FederatedZipAtClients => {
                let placement = if self == Intrinsic::FederatedZipAtServer {
                    Placement::Server
                } else {
                    Placement::Clients
                };
                let elements = argument.as_struct().ok_or_else(|| TypeError::Kind {
                    expected: "struct",
                    found: argument.clone(),
                })?;
                let mut all_equal = true;
                let members = elements
                    .elements
                    .iter()
                    .map(|(name, ty)| {
                        let member = federated_member(ty, placement)?;
                        all_equal &= ty.as_federated().map_or(true, |ty| ty.all_equal);
                        Ok((name.clone(), member.clone()))
                    })
                    .collect::<Result<_, TypeError>>()?;
                Type::federated(
                    Type::structure(members, elements.container),
                    placement,
                    all_equal,
                )
            }
            Intrinsic::FederatedSum | Intrinsic::FederatedMean => {
                let member = federated_member(argument, Placement::Clients)?;
                check_numeric(member, self == Intrinsic::FederatedMean)?;
                Type::at_server(member.clone())
            }
            Intrinsic::FederatedAggregate => {
                let value = argument.element(0)?;
                let zero = argument.element(1)?;
                let member = federated_member(value, Placement::Clients)?;
                let accumulate = function_type(argument.element(2)?)?;
                let merge = function_type(argument.element(3)?)?;
                let report = function_type(argument.element(4)?)?;
                check_parameter(accumulate, &Type::tuple(vec![zero.clone(), member.clone()]))?;
                zero.check_assignable_from(accumulate.result())?;
                check_parameter(merge, &Type::tuple(vec![zero.clone(), zero.clone()]))?;
                zero.check_assignable_from(merge.result())?;
                check_parameter(report, zero)?;
                Type::at_server(report.result().clone())
            }
        };
        Ok(FunctionType::new(Some(argument.clone()), result))
    }
}

fn federated_member(ty: &Type, placement: Placement) -> Result<&Type, TypeError> {
    match ty.as_federated() {
        Some(federated) if federated.placement == placement => Ok(&federated.member),
        _ => Err(TypeError::Kind {
            expected: match placement {
                Placement::Server => "server placed",
                Placement::Clients => "clients placed",
            },
            found: ty.clone(),
        }),
    }
}

fn function_type(ty: &Type) -> Result<&FunctionType, TypeError> {
    ty.as_function().ok_or_else(|| TypeError::Kind {
        expected: "function",
        found: ty.clone(),
    })
}

fn check_parameter(function: &FunctionType, argument: &Type) -> Result<(), TypeError> {
    match function.parameter() {
        Some(parameter) => parameter.check_assignable_from(argument),
        None => Err(TypeError::Unsupported(format!(
            "function {} takes no argument",
            function
        ))),
    }
}

fn check_numeric(ty: &Type, floating: bool) -> Result<(), TypeError> {
    for leaf in ty.leaves() {
        let supported = match leaf.as_tensor() {
            Some(tensor) if floating => tensor.dtype.is_floating(),
            Some(tensor) => tensor.dtype.is_numeric(),
            None => false,
        };
        if !supported {
            return Err(TypeError::Kind {
                expected: if floating { "floating point" } else { "numeric" },
                found: leaf.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
/// The decomposition of an aggregation.
///
/// Aggregating `v1..vn` computes `report(accumulate(..accumulate(zero, v1).., vn))`. Partial
/// accumulators of disjoint client sets are combined with `merge`.
pub struct AggregationFunctions {
    pub zero: Arc<BuildingBlock>,
    pub accumulate: Arc<BuildingBlock>,
    pub merge: Arc<BuildingBlock>,
    pub report: Arc<BuildingBlock>,
}

impl AggregationFunctions {
    /// Gets the type of the accumulator.
    pub fn accumulator_type(&self) -> &Type {
        self.zero.type_signature()
    }

    /// Gets the canonical decomposition of `federated_sum` and `federated_mean` for a member type.
    pub fn canonical(intrinsic: Intrinsic, member: &Type) -> Result<Self, TypeError> {
        match intrinsic {
            Intrinsic::FederatedSum => {
                check_numeric(member, false)?;
                let add = Arc::new(BuildingBlock::Local(LocalComputation::add(member.clone())?));
                Ok(Self {
                    zero: Arc::new(BuildingBlock::data(zeros(member)?, member.clone())?),
                    accumulate: add.clone(),
                    merge: add,
                    report: Arc::new(BuildingBlock::Local(LocalComputation::identity(
                        member.clone(),
                    )?)),
                })
            }
            Intrinsic::FederatedMean => {
                check_numeric(member, true)?;
                let count = Type::scalar(DType::I64);
                let accumulator = Type::tuple(vec![member.clone(), count]);
                let zero = Value::tuple(vec![zeros(member)?, Value::from(0_i64)]);
                Ok(Self {
                    zero: Arc::new(BuildingBlock::data(zero, accumulator.clone())?),
                    accumulate: Arc::new(BuildingBlock::Local(mean_accumulate(
                        member.clone(),
                        accumulator.clone(),
                    )?)),
                    merge: Arc::new(BuildingBlock::Local(LocalComputation::add(
                        accumulator.clone(),
                    )?)),
                    report: Arc::new(BuildingBlock::Local(mean_report(
                        member.clone(),
                        accumulator,
                    )?)),
                })
            }
            intrinsic => Err(TypeError::Unsupported(format!(
                "{} has no canonical decomposition",
                intrinsic
            ))),
        }
    }
}

fn zeros(ty: &Type) -> Result<Value, TypeError> {
    Value::zeros(ty).map_err(|error| TypeError::Unsupported(error.to_string()))
}

/// `<<T,int64>,T> -> <T,int64>`
fn mean_accumulate(member: Type, accumulator: Type) -> Result<LocalComputation, TypeError> {
    LocalComputation::new(
        "mean_accumulate",
        FunctionType::new(
            Some(Type::tuple(vec![accumulator.clone(), member])),
            accumulator,
        ),
        |argument| {
            let (accumulator, value) = pair(argument)?;
            let (sum, count) = pair(Some(accumulator))?;
            Ok(Value::tuple(vec![
                sum.add(&value)?,
                count.add(&Value::from(1_i64))?,
            ]))
        },
    )
}

/// `<T,int64> -> T`
fn mean_report(member: Type, accumulator: Type) -> Result<LocalComputation, TypeError> {
    LocalComputation::new(
        "mean_report",
        FunctionType::new(Some(accumulator), member),
        |argument| {
            let (sum, count) = pair(argument)?;
            let count = match count.as_tensor().map(|tensor| tensor.data()) {
                Some(crate::value::TensorData::I64(count)) if count.len() == 1 => count[0],
                _ => anyhow::bail!("expected a scalar int64 count"),
            };
            if count == 0 {
                anyhow::bail!("mean over zero clients");
            }
            Ok(sum.divide_by(count)?)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int32() -> Type {
        Type::scalar(DType::I32)
    }

    #[test]
    fn test_broadcast_type() {
        let ty = Intrinsic::FederatedBroadcast
            .infer_type(&Type::at_server(int32()))
            .unwrap();
        assert_eq!(
            ty.result(),
            &Type::federated(int32(), Placement::Clients, true)
        );
        assert!(Intrinsic::FederatedBroadcast
            .infer_type(&Type::at_clients(int32()))
            .is_err());
    }

    #[test]
    fn test_map_type_preserves_all_equal() {
        let function = Type::function(Some(int32()), Type::scalar(DType::F32));
        let argument = Type::tuple(vec![function, Type::at_clients(int32())]);
        let ty = Intrinsic::FederatedMap.infer_type(&argument).unwrap();
        assert_eq!(ty.result(), &Type::at_clients(Type::scalar(DType::F32)));
    }

    #[test]
    fn test_mean_needs_floating_point_members() {
        assert!(Intrinsic::FederatedMean
            .infer_type(&Type::at_clients(int32()))
            .is_err());
        assert!(Intrinsic::FederatedMean
            .infer_type(&Type::at_clients(Type::scalar(DType::F32)))
            .is_ok());
    }

    #[test]
    fn test_zip_at_server_keeps_names() {
        let argument = Type::named(vec![
            ("a", Type::at_server(int32())),
            ("b", Type::at_server(Type::scalar(DType::F32))),
        ]);
        let ty = Intrinsic::FederatedZipAtServer.infer_type(&argument).unwrap();
        assert_eq!(
            ty.result(),
            &Type::at_server(Type::named(vec![
                ("a", int32()),
                ("b", Type::scalar(DType::F32))
            ]))
        );
    }

    #[test]
    fn test_canonical_mean() {
        let member = Type::scalar(DType::F64);
        let functions = AggregationFunctions::canonical(Intrinsic::FederatedMean, &member).unwrap();
        assert_eq!(
            functions.accumulator_type(),
            &Type::tuple(vec![member, Type::scalar(DType::I64)])
        );
        let report = match functions.report.as_ref() {
            BuildingBlock::Local(report) => report.clone(),
            other => panic!("unexpected report {:?}", other),
        };
        let mean = report
            .call(Some(Value::tuple(vec![Value::from(6.0_f64), Value::from(4_i64)])))
            .unwrap();
        assert_eq!(mean, Value::from(1.5_f64));
    }
}
