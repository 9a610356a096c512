//! Computations shared by the tests of this crate and its dependents.
//!
//! Every builder panics on type errors, they are only meant for tests.

use crate::{
    building_blocks::{
        federated_apply,
        federated_broadcast,
        federated_map,
        federated_sum,
        federated_value,
        federated_zip_at_server,
        BuildingBlock,
    },
    local::LocalComputation,
    types::{DType, Placement, Type, TypeError},
    value::Value,
    Computation,
};

pub fn int32() -> Type {
    Type::scalar(DType::I32)
}

/// `<int32,int32> -> int32`
pub fn tf_multiply_int() -> Computation {
    Computation::local(LocalComputation::multiply(int32()).unwrap())
}

/// `<int32,int32> -> int32`, the first element plus the second.
pub fn compute_sum() -> LocalComputation {
    LocalComputation::add(int32()).unwrap()
}

/// `(<int32,int32> -> [int32,int32])`, an unplaced computation returning a list.
pub fn return_list() -> Computation {
    Computation::from_fn("return_list", Some(Type::tuple(vec![int32(), int32()])), |arg| {
        let arg = arg.unwrap();
        Ok(BuildingBlock::list(vec![
            BuildingBlock::selection(arg.clone(), 0)?,
            BuildingBlock::selection(arg, 1)?,
        ]))
    })
    .unwrap()
}

/// `( -> int32@SERVER)`
pub fn return_server_value() -> Computation {
    Computation::from_fn("return_server_value", None, |_| {
        federated_value(BuildingBlock::literal(Value::from(0))?, Placement::Server)
    })
    .unwrap()
}

/// `(<int32,int32>@SERVER -> int32@SERVER)`
pub fn server_placed_mult() -> Computation {
    Computation::from_fn(
        "server_placed_mult",
        Some(Type::at_server(Type::tuple(vec![int32(), int32()]))),
        |arg| federated_apply(tf_multiply_int().building_block().as_ref().clone(), arg.unwrap()),
    )
    .unwrap()
}

/// `(<int32@SERVER,{int32}@CLIENTS> -> int32@SERVER)`: the server value plus the sum of the client
/// values.
pub fn aggregation_and_after() -> Computation {
    let parameter = Type::tuple(vec![Type::at_server(int32()), Type::at_clients(int32())]);
    Computation::from_fn("aggregation_and_after", Some(parameter), |arg| {
        let arg = arg.unwrap();
        let server_arg = BuildingBlock::selection(arg.clone(), 0)?;
        let summed = federated_sum(BuildingBlock::selection(arg, 1)?)?;
        add_at_server(server_arg, summed)
    })
    .unwrap()
}

/// `(<int32@SERVER,{<int32,int32>}@CLIENTS> -> int32@SERVER)`: the server value plus the sum of
/// all client pairs, summed on the clients first.
pub fn before_aggregation_work() -> Computation {
    let parameter = Type::tuple(vec![
        Type::at_server(int32()),
        Type::at_clients(Type::tuple(vec![int32(), int32()])),
    ]);
    Computation::from_fn("before_aggregation_work", Some(parameter), |arg| {
        let arg = arg.unwrap();
        let server_arg = BuildingBlock::selection(arg.clone(), 0)?;
        let client_sums = federated_map(compute_sum().into(), BuildingBlock::selection(arg, 1)?)?;
        let summed = federated_sum(client_sums)?;
        add_at_server(server_arg, summed)
    })
    .unwrap()
}

/// Like [`before_aggregation_work`], but the second aggregation only seems to depend on the
/// first one: the rebroadcast sum is packed next to the client sums by a function call and
/// selected away again.
pub fn false_aggregation_dependence() -> Computation {
    let parameter = Type::tuple(vec![
        Type::at_server(int32()),
        Type::at_clients(Type::tuple(vec![int32(), int32()])),
    ]);
    Computation::from_fn("false_aggregation_dependence", Some(parameter), |arg| {
        let arg = arg.unwrap();
        let server_arg = BuildingBlock::selection(arg.clone(), 0)?;
        let client_sums_value =
            federated_map(compute_sum().into(), BuildingBlock::selection(arg, 1)?)?;
        let client_sums_ty = client_sums_value.type_signature().clone();
        let client_sums = BuildingBlock::reference("client_sums", client_sums_ty.clone());
        let broadcast_sum = federated_broadcast(federated_sum(client_sums.clone())?)?;

        let package = package_args_as_tuple(client_sums_ty, broadcast_sum.type_signature().clone());
        let client_tuple = BuildingBlock::call(
            package,
            Some(BuildingBlock::tuple(vec![client_sums, broadcast_sum])),
        )?;
        let summed = federated_sum(BuildingBlock::selection(client_tuple, 0)?)?;
        let result = add_at_server(server_arg, summed)?;
        Ok(BuildingBlock::block(
            vec![("client_sums".into(), client_sums_value.into())],
            result,
        ))
    })
    .unwrap()
}

/// `(int32@SERVER -> int32@SERVER)`, summing a value which depends on an earlier sum.
pub fn dependent_aggregates() -> Computation {
    Computation::from_fn("dependent_aggregates", Some(Type::at_server(int32())), |arg| {
        let arg_at_clients = federated_broadcast(arg.unwrap())?;
        let sum_result = federated_sum(arg_at_clients)?;
        let rebroadcast_sum = federated_broadcast(sum_result)?;
        federated_sum(rebroadcast_sum)
    })
    .unwrap()
}

/// `(<x,y> -> [x,y])`
fn package_args_as_tuple(x: Type, y: Type) -> BuildingBlock {
    let parameter = Type::tuple(vec![x, y]);
    let arg = BuildingBlock::reference("args", parameter.clone());
    let list = BuildingBlock::list(vec![
        BuildingBlock::selection(arg.clone(), 0).unwrap(),
        BuildingBlock::selection(arg, 1).unwrap(),
    ]);
    BuildingBlock::lambda(Some(("args".into(), parameter)), list)
}

/// `federated_apply(compute_sum, federated_zip_at_server(<lhs, rhs>))`
fn add_at_server(lhs: BuildingBlock, rhs: BuildingBlock) -> Result<BuildingBlock, TypeError> {
    let zipped = federated_zip_at_server(BuildingBlock::tuple(vec![lhs, rhs]))?;
    federated_apply(compute_sum().into(), zipped)
}
