//! A small federated mean estimation process, used by the `fedcomp-train` binary.
//!
//! The server state is an estimate `w`. In every round the clients receive `w` and report the
//! difference to their own value; the server moves `w` by the mean difference and reports the
//! mean squared error as `client_work.train.loss`.

use anyhow::Context;

use fedcomp_core::{
    building_blocks::{
        federated_apply,
        federated_broadcast,
        federated_map,
        federated_mean,
        federated_value,
        federated_zip_at_clients,
        federated_zip_at_server,
        BuildingBlock,
    },
    local::LocalComputation,
    templates::AggregationProcess,
    types::{DType, FunctionType, TypeError},
    Computation,
    Placement,
    Type,
    Value,
};

use crate::data_source::{ClientDataSource, DataSourceError};

fn float32() -> Type {
    Type::scalar(DType::F32)
}

/// Builds the mean estimation process, starting from the estimate `0`.
pub fn mean_estimation_process() -> Result<AggregationProcess, anyhow::Error> {
    let initialize = Computation::from_fn("mean_estimation/initialize", None, |_| {
        federated_value(BuildingBlock::literal(Value::from(0.0_f32))?, Placement::Server)
    })?;

    let parameter = Type::tuple(vec![Type::at_server(float32()), Type::at_clients(float32())]);
    let next = Computation::from_fn("mean_estimation/next", Some(parameter), |arg| {
        let arg = arg.ok_or_else(|| TypeError::Unsupported("`next` takes an argument".into()))?;
        let estimate = BuildingBlock::selection(arg.clone(), 0)?;
        let data = BuildingBlock::selection(arg, 1)?;

        let zipped_value = federated_zip_at_clients(BuildingBlock::tuple(vec![
            federated_broadcast(estimate.clone())?,
            data,
        ]))?;
        let zipped = BuildingBlock::reference("zipped", zipped_value.type_signature().clone());
        // `w - x` per client
        let difference = federated_mean(federated_map(
            LocalComputation::subtract(float32())?.into(),
            zipped.clone(),
        )?)?;
        let difference_ref =
            BuildingBlock::reference("difference", difference.type_signature().clone());
        let loss = federated_mean(federated_map(squared_error()?.into(), zipped)?)?;

        let state = federated_apply(
            LocalComputation::subtract(float32())?.into(),
            federated_zip_at_server(BuildingBlock::tuple(vec![estimate, difference_ref.clone()]))?,
        )?;
        let measurements = federated_apply(train_metrics()?.into(), loss)?;
        Ok(BuildingBlock::block(
            vec![
                ("zipped".into(), zipped_value.into()),
                ("difference".into(), difference.into()),
            ],
            BuildingBlock::named(vec![
                ("state", state),
                ("result", difference_ref),
                ("measurements", measurements),
            ]),
        ))
    })?;

    AggregationProcess::new(initialize, next).context("invalid mean estimation process")
}

/// Builds the evaluation of an estimate, `(<f32@SERVER,{f32}@CLIENTS> -> <loss=f32>@SERVER)`.
pub fn mean_estimation_evaluation() -> Result<Computation, TypeError> {
    let parameter = Type::tuple(vec![Type::at_server(float32()), Type::at_clients(float32())]);
    Computation::from_fn("mean_estimation/evaluate", Some(parameter), |arg| {
        let arg = arg
            .ok_or_else(|| TypeError::Unsupported("the evaluation takes an argument".into()))?;
        let zipped = federated_zip_at_clients(BuildingBlock::tuple(vec![
            federated_broadcast(BuildingBlock::selection(arg.clone(), 0)?)?,
            BuildingBlock::selection(arg, 1)?,
        ]))?;
        let loss = federated_mean(federated_map(squared_error()?.into(), zipped)?)?;
        let named_loss = LocalComputation::new(
            "named_loss",
            FunctionType::new(Some(float32()), Type::named(vec![("loss", float32())])),
            |loss| Ok(Value::named(vec![("loss", loss.context("missing argument")?)])),
        )?;
        federated_apply(named_loss.into(), loss)
    })
}

/// `<f32,f32> -> f32`
fn squared_error() -> Result<LocalComputation, TypeError> {
    LocalComputation::new(
        "squared_error",
        FunctionType::new(Some(Type::tuple(vec![float32(), float32()])), float32()),
        |argument| {
            let argument = argument.context("missing argument")?;
            let (estimate, value) = argument
                .element(0)
                .zip(argument.element(1))
                .context("expected a pair")?;
            let difference = estimate.subtract(value)?;
            Ok(difference.multiply(&difference)?)
        },
    )
}

/// `f32 -> <client_work=<train=<loss=f32>>>`
fn train_metrics() -> Result<LocalComputation, TypeError> {
    let ty = Type::named(vec![(
        "client_work",
        Type::named(vec![("train", Type::named(vec![("loss", float32())]))]),
    )]);
    LocalComputation::new(
        "train_metrics",
        FunctionType::new(Some(float32()), ty),
        |loss| {
            let loss = loss.context("missing argument")?;
            Ok(Value::named(vec![(
                "client_work",
                Value::named(vec![("train", Value::named(vec![("loss", loss)]))]),
            )]))
        },
    )
}

/// Creates a data source of `num_clients` clients, client `i` holding the value `i`.
pub fn client_data_source(
    num_clients: usize,
    seed: u64,
) -> Result<ClientDataSource, DataSourceError> {
    let datasets = (0..num_clients).map(|client| Value::from(client as f32)).collect();
    ClientDataSource::new(datasets, float32(), seed)
}
