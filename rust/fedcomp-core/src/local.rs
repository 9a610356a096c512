//! Opaque local computations.
//!
//! A [`LocalComputation`] is a typed function over non-federated values whose body is not
//! visible to the compiler. It is the unit of work that runs on a single participant, e.g. a
//! model update on one client or the merge of two partial aggregates on the server.

use std::{fmt, sync::Arc};

use crate::{
    types::{FunctionType, Type, TypeError},
    value::Value,
};

type LocalFn = dyn Fn(Option<Value>) -> anyhow::Result<Value> + Send + Sync;

#[derive(Clone)]
/// A named, typed function over non-federated values.
///
/// Two local computations are equal if they share name and type signature.
pub struct LocalComputation {
    name: Arc<str>,
    type_signature: FunctionType,
    ty: Type,
    body: Arc<LocalFn>,
}

impl LocalComputation {
    /// Creates a local computation.
    ///
    /// # Errors
    /// Fails if the signature mentions a federated type.
    pub fn new<F>(name: &str, type_signature: FunctionType, body: F) -> Result<Self, TypeError>
    where
        F: Fn(Option<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let ty = Type::Function(type_signature.clone());
        if ty.contains_federated() {
            return Err(TypeError::Unsupported(format!(
                "local computation `{}` must not have a federated signature, found {}",
                name, type_signature
            )));
        }
        Ok(Self {
            name: name.into(),
            type_signature,
            ty,
            body: Arc::new(body),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_signature(&self) -> &FunctionType {
        &self.type_signature
    }

    /// Gets the signature as a [`Type::Function`].
    pub fn function_type(&self) -> &Type {
        &self.ty
    }

    /// Runs the body on `argument`.
    pub fn call(&self, argument: Option<Value>) -> anyhow::Result<Value> {
        (self.body)(argument)
    }

    /// `T -> T`
    pub fn identity(ty: Type) -> Result<Self, TypeError> {
        Self::new(
            "identity",
            FunctionType::new(Some(ty.clone()), ty),
            |argument| argument.ok_or_else(|| anyhow::anyhow!("missing argument")),
        )
    }

    /// `<T,T> -> T`, element-wise addition.
    pub fn add(ty: Type) -> Result<Self, TypeError> {
        Self::binary("add", ty, Value::add)
    }

    /// `<T,T> -> T`, element-wise multiplication.
    pub fn multiply(ty: Type) -> Result<Self, TypeError> {
        Self::binary("multiply", ty, Value::multiply)
    }

    /// `<T,T> -> T`, element-wise subtraction.
    pub fn subtract(ty: Type) -> Result<Self, TypeError> {
        Self::binary("subtract", ty, Value::subtract)
    }

    fn binary(
        name: &str,
        ty: Type,
        op: fn(&Value, &Value) -> Result<Value, crate::value::ValueError>,
    ) -> Result<Self, TypeError> {
        Self::new(
            name,
            FunctionType::new(Some(Type::tuple(vec![ty.clone(), ty.clone()])), ty),
            move |argument| {
                let (lhs, rhs) = pair(argument)?;
                Ok(op(&lhs, &rhs)?)
            },
        )
    }

    /// `( -> T)`, a constant.
    pub fn constant(value: Value, ty: Type) -> Result<Self, TypeError> {
        ty.check_value(&value)?;
        Self::new("constant", FunctionType::new(None, ty), move |_| {
            Ok(value.clone())
        })
    }
}

/// Splits the argument of a binary local computation.
pub(crate) fn pair(argument: Option<Value>) -> anyhow::Result<(Value, Value)> {
    let argument = argument
        .and_then(|argument| match argument {
            Value::Struct(value) if value.len() == 2 => Some(value),
            _ => None,
        })
        .ok_or_else(|| anyhow::anyhow!("expected a struct of two elements"))?;
    let mut elements = argument.into_elements().into_iter().map(|(_, value)| value);
    match (elements.next(), elements.next()) {
        (Some(lhs), Some(rhs)) => Ok((lhs, rhs)),
        _ => Err(anyhow::anyhow!("expected a struct of two elements")),
    }
}

impl PartialEq for LocalComputation {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.type_signature == other.type_signature
    }
}

impl fmt::Debug for LocalComputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComputation")
            .field("name", &self.name)
            .field("type_signature", &self.type_signature.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DType, Placement};

    #[test]
    fn test_add() {
        let add = LocalComputation::add(Type::scalar(DType::I32)).unwrap();
        let sum = add
            .call(Some(Value::tuple(vec![Value::from(1), Value::from(2)])))
            .unwrap();
        assert_eq!(sum, Value::from(3));
        assert!(add.call(Some(Value::from(1))).is_err());
    }

    #[test]
    fn test_rejects_federated_signature() {
        let ty = Type::federated(Type::scalar(DType::I32), Placement::Server, true);
        assert!(LocalComputation::identity(ty).is_err());
    }

    #[test]
    fn test_equality_is_structural() {
        let ty = Type::scalar(DType::F32);
        assert_eq!(
            LocalComputation::add(ty.clone()).unwrap(),
            LocalComputation::add(ty.clone()).unwrap()
        );
        assert_ne!(
            LocalComputation::add(ty.clone()).unwrap(),
            LocalComputation::multiply(ty).unwrap()
        );
    }
}
