//! The execution context for mergeable computations.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, debug_span, Instrument};

use fedcomp_core::{
    context::check_argument,
    Computation,
    ComputationId,
    ExecutionContext,
    ExecutionError,
    Value,
};

use crate::{
    compiler::{compile_to_mergeable_comp_form, MergeableFormError},
    form::MergeableCompForm,
};

/// The compiler used by a [`MergeableCompExecutionContext`].
pub type Compiler =
    dyn Fn(&Computation) -> Result<MergeableCompForm, MergeableFormError> + Send + Sync;

#[derive(Clone, Debug, PartialEq)]
/// The argument of a mergeable form invocation.
pub enum MergeableArgument {
    /// One argument, run by the primary context only.
    Whole(Option<Value>),
    /// One argument per inner context, in the order of the contexts.
    Partitioned(Vec<Option<Value>>),
}

impl From<Value> for MergeableArgument {
    fn from(value: Value) -> Self {
        Self::Whole(Some(value))
    }
}

impl From<Option<Value>> for MergeableArgument {
    fn from(value: Option<Value>) -> Self {
        Self::Whole(value)
    }
}

#[derive(Default)]
/// Compiled forms by computation. A computation is compiled once even if several invocations
/// ask for it at the same time. Failed compilations are not cached.
struct CompilationCache {
    forms: Mutex<HashMap<ComputationId, Arc<OnceCell<Arc<MergeableCompForm>>>>>,
}

impl CompilationCache {
    async fn get_or_compile(
        &self,
        computation: &Computation,
        compiler: &Compiler,
    ) -> Result<Arc<MergeableCompForm>, MergeableFormError> {
        let cell = self
            .forms
            .lock()
            .await
            .entry(computation.id())
            .or_default()
            .clone();
        let form = cell
            .get_or_try_init(|| async {
                debug!("compiling `{}` ({})", computation.name(), computation.id());
                compiler(computation).map(Arc::new)
            })
            .await?;
        Ok(form.clone())
    }
}

/// An execution context that runs computations as mergeable forms across several inner
/// contexts.
///
/// The first inner context is the primary one: it merges the partial results, in the order of
/// the contexts, and computes the part after the merge.
pub struct MergeableCompExecutionContext {
    contexts: Vec<Arc<dyn ExecutionContext>>,
    compiler: Arc<Compiler>,
    cache: CompilationCache,
}

impl fmt::Debug for MergeableCompExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeableCompExecutionContext")
            .field("contexts", &self.contexts.len())
            .finish()
    }
}

impl MergeableCompExecutionContext {
    /// Creates a context over `contexts`.
    ///
    /// # Errors
    /// Fails if `contexts` is empty.
    pub fn new(contexts: Vec<Arc<dyn ExecutionContext>>) -> Result<Self, ExecutionError> {
        if contexts.is_empty() {
            return Err(ExecutionError::NoInnerContext);
        }
        Ok(Self {
            contexts,
            compiler: Arc::new(compile_to_mergeable_comp_form),
            cache: CompilationCache::default(),
        })
    }

    /// Replaces the compiler turning computations into mergeable forms.
    pub fn with_compiler<F>(mut self, compiler: F) -> Self
    where
        F: Fn(&Computation) -> Result<MergeableCompForm, MergeableFormError>
            + Send
            + Sync
            + 'static,
    {
        self.compiler = Arc::new(compiler);
        self
    }

    pub fn num_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// Gets the mergeable form of `computation`, compiling it on first use.
    pub async fn compile(
        &self,
        computation: &Computation,
    ) -> Result<Arc<MergeableCompForm>, ExecutionError> {
        self.cache
            .get_or_compile(computation, self.compiler.as_ref())
            .await
            .map_err(|error| ExecutionError::Compilation(Box::new(error)))
    }

    /// Invokes `computation` on an argument that may be partitioned across the inner contexts.
    pub async fn invoke_partitioned(
        &self,
        computation: &Computation,
        argument: MergeableArgument,
    ) -> Result<Value, ExecutionError> {
        let form = self.compile(computation).await?;
        self.invoke_form(&form, argument).await
    }

    /// Invokes a mergeable form.
    ///
    /// # Behavior
    ///
    /// - A [`MergeableArgument::Partitioned`] argument must have one part per inner context.
    ///   The parts are taken as they are, there is no repartitioning.
    /// - A [`MergeableArgument::Whole`] argument is run by the primary context alone. With more
    ///   than one inner context this is only allowed if the argument holds no clients placed data.
    /// - `up_to_merge` runs concurrently on all inner contexts. The partial results are merged
    ///   in the order of the contexts, independent of the order they complete in.
    /// - `after_merge` receives the argument of the primary context next to the merged result.
    pub async fn invoke_form(
        &self,
        form: &MergeableCompForm,
        argument: impl Into<MergeableArgument>,
    ) -> Result<Value, ExecutionError> {
        let arguments = match argument.into() {
            MergeableArgument::Whole(argument) => {
                if self.contexts.len() > 1 && form.has_clients_parameter() {
                    return Err(ExecutionError::PartitionCount {
                        expected: self.contexts.len(),
                        actual: 1,
                    });
                }
                vec![argument]
            }
            MergeableArgument::Partitioned(arguments) => {
                if arguments.len() != self.contexts.len() {
                    return Err(ExecutionError::PartitionCount {
                        expected: self.contexts.len(),
                        actual: arguments.len(),
                    });
                }
                arguments
            }
        };
        for argument in &arguments {
            check_argument(form.up_to_merge(), argument.as_ref())?;
        }

        let span = debug_span!("invoke_form", form = %form.id(), partitions = arguments.len());
        async move {
            let partials = try_join_all(
                self.contexts
                    .iter()
                    .zip(arguments.iter())
                    .map(|(context, argument)| {
                        context.invoke(form.up_to_merge(), argument.clone())
                    }),
            )
            .await?;

            let primary = &self.contexts[0];
            let mut partials = partials.into_iter();
            let mut merged = partials.next().ok_or(ExecutionError::NoInnerContext)?;
            for partial in partials {
                merged = primary
                    .invoke(form.merge(), Some(Value::tuple(vec![merged, partial])))
                    .await?;
            }

            let original = arguments.into_iter().next().flatten().unwrap_or_else(Value::empty);
            debug!("merged {} partial results", self.contexts.len());
            primary
                .invoke(form.after_merge(), Some(Value::tuple(vec![original, merged])))
                .await
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl ExecutionContext for MergeableCompExecutionContext {
    async fn invoke(
        &self,
        computation: &Computation,
        argument: Option<Value>,
    ) -> Result<Value, ExecutionError> {
        self.invoke_partitioned(computation, MergeableArgument::Whole(argument))
            .await
    }
}
