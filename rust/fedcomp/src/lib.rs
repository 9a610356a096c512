#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedcomp: federated computations in Rust
//!
//! A federated computation runs across a server and a population of clients. Every value it
//! touches carries its placement, and values only change placement through a small set of
//! intrinsics: broadcasts, maps, zips and aggregations.
//!
//! This crate bundles the parts of the project behind features:
//!
//! - [`core`]: types, values, building blocks, computations and the local execution context.
//! - `runtime`: compiles computations into a mergeable form and runs them across several
//!   execution contexts, each processing a part of the clients.
//! - `program`: resumable training programs on top of learning processes, with program state
//!   checkpoints, background evaluations and released models and metrics.
//!
//! `full` enables everything.
pub use fedcomp_core as core;

#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub use fedcomp_runtime as runtime;

#[cfg(feature = "program")]
#[cfg_attr(docsrs, doc(cfg(feature = "program")))]
pub use fedcomp_program as program;
