#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedcomp core
//!
//! The building blocks of federated computations: computations that run across a server and
//! many clients, with explicit placements on every value.
//!
//! - [`types`] describes the structural types, including federated types placed at
//!   [`SERVER`](types::Placement::Server) or [`CLIENTS`](types::Placement::Clients).
//! - [`value`] holds the runtime values flowing through computations.
//! - [`building_blocks`] is the intermediate representation computations are made of, with
//!   [`intrinsics`] being the only nodes that move values between placements and [`local`]
//!   computations being opaque per-participant functions.
//! - [`Computation`] wraps a typed building block, [`context::ExecutionContext`] invokes it. The
//!   [`context::LocalExecutionContext`] evaluates computations in-process with the reference
//!   [`executor`].
//! - [`templates`] validates the shape of aggregation processes.
//!
//! Splitting a computation around its aggregation and running it across several execution
//! contexts is the business of the `fedcomp-runtime` crate.

pub mod building_blocks;
pub mod computation;
pub mod context;
pub mod executor;
pub mod intrinsics;
pub mod local;
pub mod templates;
#[cfg(any(test, feature = "testutils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testutils")))]
pub mod testutils;
pub mod types;
pub mod value;

pub use self::{
    computation::{Computation, ComputationId},
    context::{ExecutionContext, LocalExecutionContext},
    executor::ExecutionError,
    types::{Placement, Type},
    value::Value,
};
