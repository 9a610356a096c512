#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedcomp program
//!
//! Resumable training programs on top of federated computations.
//!
//! A [`training::TrainingProgramLogic`] drives the rounds of a [`learning::LearningProcess`].
//! Everything it talks to is behind an interface:
//!
//! - [`data_source`]: where the clients of a round come from.
//! - [`managers`]: where program states are saved, where models and metrics are released and how
//!   models are evaluated.
//! - [`clock`]: the time evaluations are scheduled by.
//!
//! Evaluations run in the background on a [`task_manager::TaskManager`] while training continues.
//! [`learning::ComputationLearningProcess`] runs the computations of an aggregation process on an
//! execution context, optionally split across the inner contexts of a
//! [`MergeableCompExecutionContext`](fedcomp_runtime::MergeableCompExecutionContext).

pub mod clock;
pub mod data_source;
pub mod demo;
pub mod evaluation;
pub mod learning;
pub mod managers;
pub mod program_state;
pub mod settings;
pub mod task_manager;
pub mod training;

pub use self::{
    program_state::ProgramState,
    task_manager::TaskManager,
    training::{EvaluationPeriod, TrainingError, TrainingProgramLogic, TrainingSettings},
};
