//! Typed, immutable computations.

use std::{fmt, sync::Arc};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    building_blocks::BuildingBlock,
    local::LocalComputation,
    types::{FunctionType, Type, TypeError},
};

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[display(fmt = "{}", _0)]
/// The identity of a computation. Clones of a computation share it.
pub struct ComputationId(Uuid);

impl ComputationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// The name of the parameter of computations built with [`Computation::from_fn`].
pub const PARAMETER_NAME: &str = "arg";

struct Inner {
    id: ComputationId,
    name: String,
    building_block: Arc<BuildingBlock>,
    type_signature: FunctionType,
}

#[derive(Clone)]
/// A typed callable made of a building block.
pub struct Computation {
    inner: Arc<Inner>,
}

impl Computation {
    /// Wraps a function valued building block.
    ///
    /// # Errors
    /// Fails if the building block is not a function or refers to unbound names.
    pub fn new(name: impl Into<String>, building_block: BuildingBlock) -> Result<Self, TypeError> {
        let type_signature = building_block
            .type_signature()
            .as_function()
            .cloned()
            .ok_or_else(|| TypeError::Kind {
                expected: "function",
                found: building_block.type_signature().clone(),
            })?;
        let free = building_block.free_variables();
        if !free.is_empty() {
            return Err(TypeError::Unsupported(format!(
                "computation refers to unbound names {:?}",
                free
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                id: ComputationId::new(),
                name: name.into(),
                building_block: Arc::new(building_block),
                type_signature,
            }),
        })
    }

    /// Builds a computation from a closure that receives a reference to the parameter.
    ///
    /// # Examples
    ///
    /// ```
    /// # use fedcomp_core::{building_blocks::federated_sum, types::{DType, Type}, Computation};
    /// let sum = Computation::from_fn(
    ///     "sum",
    ///     Some(Type::at_clients(Type::scalar(DType::I32))),
    ///     |arg| federated_sum(arg.unwrap()),
    /// )
    /// .unwrap();
    /// assert_eq!(sum.result_type(), &Type::at_server(Type::scalar(DType::I32)));
    /// ```
    pub fn from_fn<F>(
        name: impl Into<String>,
        parameter: Option<Type>,
        body: F,
    ) -> Result<Self, TypeError>
    where
        F: FnOnce(Option<BuildingBlock>) -> Result<BuildingBlock, TypeError>,
    {
        let reference = parameter
            .as_ref()
            .map(|ty| BuildingBlock::reference(PARAMETER_NAME, ty.clone()));
        let result = body(reference)?;
        let lambda = BuildingBlock::lambda(
            parameter.map(|ty| (PARAMETER_NAME.to_string(), ty)),
            result,
        );
        Self::new(name, lambda)
    }

    /// Wraps a local computation.
    pub fn local(local: LocalComputation) -> Self {
        let type_signature = local.type_signature().clone();
        Self {
            inner: Arc::new(Inner {
                id: ComputationId::new(),
                name: local.name().to_string(),
                building_block: Arc::new(BuildingBlock::Local(local)),
                type_signature,
            }),
        }
    }

    pub fn id(&self) -> ComputationId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn building_block(&self) -> &Arc<BuildingBlock> {
        &self.inner.building_block
    }

    pub fn type_signature(&self) -> &FunctionType {
        &self.inner.type_signature
    }

    pub fn parameter_type(&self) -> Option<&Type> {
        self.inner.type_signature.parameter()
    }

    pub fn result_type(&self) -> &Type {
        self.inner.type_signature.result()
    }
}

impl fmt::Debug for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computation")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("type_signature", &self.inner.type_signature.to_string())
            .finish()
    }
}
