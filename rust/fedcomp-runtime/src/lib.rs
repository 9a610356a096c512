#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedcomp runtime
//!
//! Runs federated computations across several execution contexts. A computation is compiled
//! into a [`MergeableCompForm`], three computations that
//!
//! 1. process a part of the clients up to their aggregations (`up_to_merge`),
//! 2. combine the partial aggregates of two parts (`merge`) and
//! 3. finish the computation on the merged aggregates (`after_merge`).
//!
//! The [`MergeableCompExecutionContext`] runs `up_to_merge` on every inner context
//! concurrently and everything else on the first one.
//!
//! ```
//! # use std::sync::Arc;
//! # use fedcomp_core::{
//! #     building_blocks::federated_sum,
//! #     types::{DType, Type},
//! #     Computation,
//! #     ExecutionContext,
//! #     LocalExecutionContext,
//! #     Value,
//! # };
//! # use fedcomp_runtime::{MergeableArgument, MergeableCompExecutionContext};
//! # tokio_test::block_on(async {
//! let sum = Computation::from_fn(
//!     "sum",
//!     Some(Type::at_clients(Type::scalar(DType::I32))),
//!     |arg| federated_sum(arg.unwrap()),
//! )
//! .unwrap();
//! let contexts: Vec<Arc<dyn ExecutionContext>> =
//!     vec![Arc::new(LocalExecutionContext::new()), Arc::new(LocalExecutionContext::new())];
//! let context = MergeableCompExecutionContext::new(contexts).unwrap();
//! let argument = MergeableArgument::Partitioned(vec![
//!     Some(Value::at_clients(vec![Value::from(1), Value::from(2)])),
//!     Some(Value::at_clients(vec![Value::from(3)])),
//! ]);
//! let result = context.invoke_partitioned(&sum, argument).await.unwrap();
//! assert_eq!(result, Value::at_server(Value::from(6)));
//! # });
//! ```

pub mod compiler;
pub mod context;
pub mod form;

pub use self::{
    compiler::{compile_to_mergeable_comp_form, MergeableFormError},
    context::{MergeableArgument, MergeableCompExecutionContext},
    form::{FormId, MergeableCompForm},
};
