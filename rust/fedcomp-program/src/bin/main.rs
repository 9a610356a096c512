use std::{path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::*;

use fedcomp_core::{ExecutionContext, LocalExecutionContext, Value};
use fedcomp_program::{
    data_source::{ClientDataSourceIterator, FederatedDataSource},
    demo::{client_data_source, mean_estimation_evaluation, mean_estimation_process},
    evaluation::{ComputationEvaluationManager, PendingEvaluations},
    learning::ComputationLearningProcess,
    managers::{FileProgramStateManager, LoggingReleaseManager},
    settings::Settings,
    ProgramState,
    TrainingProgramLogic,
};
use fedcomp_runtime::MergeableCompExecutionContext;

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "fedcomp-train")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let training_settings = settings.training_settings();
    let Settings {
        evaluation: evaluation_settings,
        data: data_settings,
        execution: execution_settings,
        storage: storage_settings,
        log: log_settings,
        ..
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let contexts = (0..execution_settings.num_contexts)
        .map(|_| Arc::new(LocalExecutionContext::new()) as Arc<dyn ExecutionContext>)
        .collect();
    let context = MergeableCompExecutionContext::new(contexts).unwrap_or_else(|err| {
        error!("failed to create the execution context: {}", err);
        process::exit(1);
    });
    let learning_process = mean_estimation_process().unwrap_or_else(|err| {
        error!("failed to build the learning process: {:#}", err);
        process::exit(1);
    });
    let evaluation = mean_estimation_evaluation().unwrap_or_else(|err| {
        error!("failed to build the evaluation: {}", err);
        process::exit(1);
    });
    let data_source = client_data_source(data_settings.num_clients, data_settings.seed)
        .unwrap_or_else(|err| {
            error!("failed to create the data source: {}", err);
            process::exit(1);
        });

    let pending_evaluations_manager = FileProgramStateManager::<PendingEvaluations>::new(
        storage_settings.root_dir.join("evaluations"),
        storage_settings.keep_total,
    );
    let evaluation_manager = ComputationEvaluationManager::persistent(
        Arc::new(LocalExecutionContext::new()),
        evaluation,
        data_source.iterator(),
        evaluation_settings.clients,
        Arc::new(LoggingReleaseManager::<serde_json::Value, u64>::new(
            "evaluation metrics",
        )),
        Arc::new(pending_evaluations_manager),
    );
    let program_state_manager =
        FileProgramStateManager::<ProgramState<Value, ClientDataSourceIterator>>::new(
            storage_settings.root_dir,
            storage_settings.keep_total,
        );
    let program = TrainingProgramLogic::new(
        ComputationLearningProcess::partitioned(Arc::new(context), learning_process),
        data_source,
        Arc::new(program_state_manager),
        Arc::new(LoggingReleaseManager::<Value, String>::new("model")),
        Arc::new(LoggingReleaseManager::<serde_json::Value, u64>::new("train metrics")),
        training_settings,
    )
    .with_evaluation_manager(Arc::new(evaluation_manager));

    tokio::select! {
        result = program.train_model() => {
            if let Err(err) = result {
                error!("training failed: {}", err);
                process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted, training resumes from the last saved round");
        }
    }
}
