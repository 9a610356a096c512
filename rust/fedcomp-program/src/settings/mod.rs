//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables, e.g.
//! `FEDCOMP__TRAINING__TOTAL_ROUNDS=20`. An example configuration file can be found in the
//! `configs/` directory located in the repository root.


use std::{
    fmt,
    path::{Path, PathBuf},
};

use chrono::Duration;
use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::training::{EvaluationPeriod, TrainingSettings, DEFAULT_MODEL_OUTPUT_INTERVAL};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_clients"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub training: TrainSettings,
    #[validate]
    pub evaluation: EvaluationSettings,
    #[validate]
    pub data: DataSettings,
    #[validate]
    pub execution: ExecutionSettings,
    pub storage: StorageSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(config::File::from(path.as_ref()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn load<S>(source: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        Config::builder()
            .add_source(source)
            .add_source(
                Environment::with_prefix("fedcomp")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// Gets the settings of the training program.
    pub fn training_settings(&self) -> TrainingSettings {
        TrainingSettings {
            train_per_round_clients: self.training.per_round_clients,
            train_total_rounds: self.training.total_rounds,
            evaluation_period: self.evaluation.period(),
            model_output_interval: self.training.model_output_interval,
        }
    }
}

fn validate_clients(s: &Settings) -> Result<(), ValidationError> {
    let num_clients = s.data.num_clients;
    if s.training.per_round_clients <= num_clients && s.evaluation.clients <= num_clients {
        Ok(())
    } else {
        Err(ValidationError::new("more clients selected than available"))
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Training settings.
pub struct TrainSettings {
    /// The number of clients selected per round. Must be at least `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// per_round_clients = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOMP__TRAINING__PER_ROUND_CLIENTS=10
    /// ```
    #[validate(range(min = 1))]
    pub per_round_clients: usize,

    /// The total number of rounds.
    pub total_rounds: u64,

    /// The number of rounds between two model releases. `0` only releases the initial and the
    /// final model. Defaults to `10`.
    #[serde(default = "default_model_output_interval")]
    pub model_output_interval: u64,
}

fn default_model_output_interval() -> u64 {
    DEFAULT_MODEL_OUTPUT_INTERVAL
}

#[derive(Debug, Validate, Deserialize, Clone, Copy, PartialEq, Eq)]
#[validate(schema(function = "validate_evaluation"))]
/// Evaluation settings. Exactly one of the periods must be set.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [evaluation]
/// period_rounds = 5
/// clients = 10
/// ```
///
/// **Environment variable**
/// ```text
/// FEDCOMP__EVALUATION__PERIOD_SECONDS=600
/// ```
pub struct EvaluationSettings {
    /// Evaluates after every `period_rounds` rounds.
    pub period_rounds: Option<u64>,
    /// Evaluates once at least `period_seconds` seconds passed since the last evaluation.
    pub period_seconds: Option<u64>,
    /// The number of clients selected per evaluation.
    #[validate(range(min = 1))]
    pub clients: usize,
}

impl EvaluationSettings {
    fn validate_evaluation(&self) -> Result<(), ValidationError> {
        match (self.period_rounds, self.period_seconds) {
            (Some(rounds), None) if rounds > 0 => Ok(()),
            (None, Some(seconds)) if seconds > 0 && i64::try_from(seconds).is_ok() => Ok(()),
            _ => Err(ValidationError::new("invalid evaluation period")),
        }
    }

    /// Gets the evaluation period. Must only be called on validated settings.
    pub fn period(&self) -> EvaluationPeriod {
        match (self.period_rounds, self.period_seconds) {
            (_, Some(seconds)) => EvaluationPeriod::Duration(Duration::seconds(seconds as i64)),
            (rounds, None) => EvaluationPeriod::Rounds(rounds.unwrap_or(1)),
        }
    }
}

fn validate_evaluation(s: &EvaluationSettings) -> Result<(), ValidationError> {
    s.validate_evaluation()
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Settings of the generated client data.
pub struct DataSettings {
    /// The number of clients. Must be at least the number of clients selected per round.
    #[validate(range(min = 1))]
    pub num_clients: usize,
    /// The seed of the client selection.
    pub seed: u64,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Execution settings.
pub struct ExecutionSettings {
    /// The number of execution contexts the clients of a round are split across.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [execution]
    /// num_contexts = 4
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOMP__EXECUTION__NUM_CONTEXTS=4
    /// ```
    #[validate(range(min = 1))]
    pub num_contexts: usize,
}

#[derive(Debug, Deserialize, Clone)]
/// Storage settings.
pub struct StorageSettings {
    /// The directory the program states are saved to. Unfinished evaluations are saved to its
    /// `evaluations` subdirectory.
    pub root_dir: PathBuf,
    /// The number of program states kept, `0` keeps all of them. Defaults to `0`.
    #[serde(default)]
    pub keep_total: usize,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCOMP__LOG__FILTER=info
    /// ```
    ///
    /// [here]: tracing_subscriber::filter::EnvFilter#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(
                formatter,
                "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/\
                 tracing_subscriber/filter/struct.EnvFilter.html#directives"
            )
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
