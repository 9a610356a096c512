//! Structural types of federated computations.
//!
//! A [`Type`] is a tree whose leaves are tensors, sequences and functions and whose inner nodes
//! are structs and federated wrappers. Federated types carry a [`Placement`] which tells whether
//! the value lives on the server or is spread across the participating clients.

use std::fmt;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// The element type of a tensor.
pub enum DType {
    #[display(fmt = "bool")]
    Bool,
    #[display(fmt = "int32")]
    I32,
    #[display(fmt = "int64")]
    I64,
    #[display(fmt = "float32")]
    F32,
    #[display(fmt = "float64")]
    F64,
}

impl DType {
    /// Checks whether the element type is a floating point type.
    pub fn is_floating(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Checks whether the element type supports addition.
    pub fn is_numeric(self) -> bool {
        !matches!(self, DType::Bool)
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// The location of a federated value.
pub enum Placement {
    #[display(fmt = "SERVER")]
    Server,
    #[display(fmt = "CLIENTS")]
    Clients,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// The caller-level container a struct was built from.
///
/// Containers do not take part in assignability, they only make sure that a struct handed back
/// to the caller has the same shape as the one that was declared.
pub enum Container {
    #[default]
    Tuple,
    List,
    Map,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// The type of a dense tensor. An empty shape denotes a scalar.
pub struct TensorType {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorType {
    pub fn scalar(dtype: DType) -> Self {
        Self {
            dtype,
            shape: Vec::new(),
        }
    }

    /// Gets the number of elements of a tensor of this type.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// The type of an ordered struct with optionally named elements.
pub struct StructType {
    pub elements: Vec<(Option<String>, Type)>,
    pub container: Container,
}

impl StructType {
    /// Gets the position of the element with the given name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.elements
            .iter()
            .position(|(element, _)| element.as_deref() == Some(name))
    }

    /// Gets the type of the element with the given name.
    pub fn get(&self, name: &str) -> Option<&Type> {
        self.position(name).map(|index| &self.elements[index].1)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// The type of a value placed at the server or at the clients.
pub struct FederatedType {
    pub member: Box<Type>,
    pub placement: Placement,
    /// Whether all members are known to be equal. Server placed values are always all equal.
    pub all_equal: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// The type of a function.
pub struct FunctionType {
    pub parameter: Option<Box<Type>>,
    pub result: Box<Type>,
}

impl FunctionType {
    pub fn new(parameter: Option<Type>, result: Type) -> Self {
        Self {
            parameter: parameter.map(Box::new),
            result: Box::new(result),
        }
    }

    pub fn parameter(&self) -> Option<&Type> {
        self.parameter.as_deref()
    }

    pub fn result(&self) -> &Type {
        &self.result
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// A structural type.
pub enum Type {
    Tensor(TensorType),
    Struct(StructType),
    Federated(FederatedType),
    Sequence(Box<Type>),
    Function(FunctionType),
}

impl Type {
    /// Creates a scalar tensor type.
    pub fn scalar(dtype: DType) -> Self {
        Type::Tensor(TensorType::scalar(dtype))
    }

    /// Creates a tensor type with a fully known shape.
    pub fn tensor(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Type::Tensor(TensorType {
            dtype,
            shape: shape.into(),
        })
    }

    /// Creates a struct of unnamed elements.
    pub fn tuple(elements: impl IntoIterator<Item = Type>) -> Self {
        Self::structure(
            elements.into_iter().map(|ty| (None, ty)).collect(),
            Container::Tuple,
        )
    }

    /// Creates a struct of unnamed elements which is handed back as a list.
    pub fn list(elements: impl IntoIterator<Item = Type>) -> Self {
        Self::structure(
            elements.into_iter().map(|ty| (None, ty)).collect(),
            Container::List,
        )
    }

    /// Creates a struct of named elements.
    pub fn named<S: Into<String>>(elements: impl IntoIterator<Item = (S, Type)>) -> Self {
        Self::structure(
            elements
                .into_iter()
                .map(|(name, ty)| (Some(name.into()), ty))
                .collect(),
            Container::Map,
        )
    }

    pub fn structure(elements: Vec<(Option<String>, Type)>, container: Container) -> Self {
        Type::Struct(StructType {
            elements,
            container,
        })
    }

    /// Creates the empty struct type `<>`.
    pub fn empty() -> Self {
        Self::tuple(Vec::new())
    }

    pub fn federated(member: Type, placement: Placement, all_equal: bool) -> Self {
        Type::Federated(FederatedType {
            member: Box::new(member),
            placement,
            all_equal,
        })
    }

    /// Creates the type `T@SERVER`.
    pub fn at_server(member: Type) -> Self {
        Self::federated(member, Placement::Server, true)
    }

    /// Creates the type `{T}@CLIENTS`.
    pub fn at_clients(member: Type) -> Self {
        Self::federated(member, Placement::Clients, false)
    }

    pub fn sequence(element: Type) -> Self {
        Type::Sequence(Box::new(element))
    }

    pub fn function(parameter: Option<Type>, result: Type) -> Self {
        Type::Function(FunctionType::new(parameter, result))
    }

    pub fn as_struct(&self) -> Option<&StructType> {
        match self {
            Type::Struct(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn as_federated(&self) -> Option<&FederatedType> {
        match self {
            Type::Federated(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionType> {
        match self {
            Type::Function(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(ty) => Some(ty),
            _ => None,
        }
    }

    /// Gets the placement of a federated type.
    pub fn placement(&self) -> Option<Placement> {
        self.as_federated().map(|ty| ty.placement)
    }

    /// Gets the type of the element at `index` of a struct type.
    pub fn element(&self, index: usize) -> Result<&Type, TypeError> {
        let ty = self.as_struct().ok_or_else(|| TypeError::Kind {
            expected: "struct",
            found: self.clone(),
        })?;
        ty.elements
            .get(index)
            .map(|(_, ty)| ty)
            .ok_or(TypeError::IndexOutOfRange {
                index,
                len: ty.elements.len(),
            })
    }

    /// Flattens the type through its structs.
    pub fn leaves(&self) -> Vec<&Type> {
        fn collect<'a>(ty: &'a Type, leaves: &mut Vec<&'a Type>) {
            match ty {
                Type::Struct(ty) => ty.elements.iter().for_each(|(_, ty)| collect(ty, leaves)),
                _ => leaves.push(ty),
            }
        }
        let mut leaves = Vec::new();
        collect(self, &mut leaves);
        leaves
    }

    /// Checks whether a federated type occurs anywhere in the type.
    pub fn contains_federated(&self) -> bool {
        self.contains(&|ty| matches!(ty, Type::Federated(_)))
    }

    /// Checks whether a federated type with the given placement occurs anywhere in the type.
    pub fn contains_placement(&self, placement: Placement) -> bool {
        self.contains(&|ty| ty.placement() == Some(placement))
    }

    fn contains(&self, predicate: &dyn Fn(&Type) -> bool) -> bool {
        if predicate(self) {
            return true;
        }
        match self {
            Type::Tensor(_) => false,
            Type::Struct(ty) => ty.elements.iter().any(|(_, ty)| ty.contains(predicate)),
            Type::Federated(ty) => ty.member.contains(predicate),
            Type::Sequence(element) => element.contains(predicate),
            Type::Function(ty) => {
                ty.parameter().map_or(false, |ty| ty.contains(predicate))
                    || ty.result.contains(predicate)
            }
        }
    }

    /// Checks whether a value of type `other` can be used where a value of this type is expected.
    ///
    /// # Behavior
    ///
    /// - Struct containers are ignored, names must agree where both sides name an element.
    /// - An all equal federated value may stand in for a federated value that is not all equal.
    pub fn is_assignable_from(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Tensor(lhs), Type::Tensor(rhs)) => lhs == rhs,
            (Type::Struct(lhs), Type::Struct(rhs)) => {
                lhs.elements.len() == rhs.elements.len()
                    && lhs.elements.iter().zip(&rhs.elements).all(
                        |((lhs_name, lhs), (rhs_name, rhs))| {
                            let names_agree = match (lhs_name, rhs_name) {
                                (Some(lhs), Some(rhs)) => lhs == rhs,
                                _ => true,
                            };
                            names_agree && lhs.is_assignable_from(rhs)
                        },
                    )
            }
            (Type::Federated(lhs), Type::Federated(rhs)) => {
                lhs.placement == rhs.placement
                    && (!lhs.all_equal || rhs.all_equal)
                    && lhs.member.is_assignable_from(&rhs.member)
            }
            (Type::Sequence(lhs), Type::Sequence(rhs)) => lhs.is_assignable_from(rhs),
            (Type::Function(lhs), Type::Function(rhs)) => {
                let parameters_agree = match (lhs.parameter(), rhs.parameter()) {
                    (None, None) => true,
                    (Some(lhs), Some(rhs)) => rhs.is_assignable_from(lhs),
                    _ => false,
                };
                parameters_agree && lhs.result.is_assignable_from(&rhs.result)
            }
            _ => false,
        }
    }

    /// Checks that `other` is assignable to this type.
    pub fn check_assignable_from(&self, other: &Type) -> Result<(), TypeError> {
        if self.is_assignable_from(other) {
            Ok(())
        } else {
            Err(TypeError::Mismatch {
                expected: self.clone(),
                found: other.clone(),
            })
        }
    }

    /// Checks that a value conforms to this type.
    pub fn check_value(&self, value: &Value) -> Result<(), TypeError> {
        let mismatch = |reason: String| TypeError::Value {
            ty: self.clone(),
            reason,
        };
        match (self, value) {
            (Type::Tensor(ty), Value::Tensor(tensor)) => {
                if tensor.dtype() != ty.dtype || tensor.shape() != ty.shape.as_slice() {
                    return Err(mismatch(format!("found tensor {}", tensor.tensor_type())));
                }
                Ok(())
            }
            (Type::Struct(ty), Value::Struct(value)) => {
                if ty.elements.len() != value.len() {
                    return Err(mismatch(format!("found struct of {} elements", value.len())));
                }
                for ((name, ty), (value_name, value)) in ty.elements.iter().zip(value.iter()) {
                    if let (Some(name), Some(value_name)) = (name, value_name) {
                        if name != value_name {
                            return Err(mismatch(format!(
                                "expected element `{}`, found `{}`",
                                name, value_name
                            )));
                        }
                    }
                    ty.check_value(value)?;
                }
                Ok(())
            }
            (Type::Federated(ty), Value::Federated(value)) => {
                if ty.placement != value.placement() {
                    return Err(mismatch(format!(
                        "found a value placed at {}",
                        value.placement()
                    )));
                }
                if (ty.all_equal || ty.placement == Placement::Server) && !value.is_all_equal() {
                    return Err(mismatch("found members that are not all equal".into()));
                }
                value
                    .members()
                    .iter()
                    .try_for_each(|member| ty.member.check_value(member))
            }
            (Type::Sequence(element), Value::Sequence(values)) => {
                values.iter().try_for_each(|value| element.check_value(value))
            }
            (_, value) => Err(mismatch(format!("found a {} value", value.kind()))),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Tensor(ty) => write!(f, "{}", ty),
            Type::Struct(ty) => {
                write!(f, "<")?;
                for (position, (name, ty)) in ty.elements.iter().enumerate() {
                    if position > 0 {
                        write!(f, ",")?;
                    }
                    match name {
                        Some(name) => write!(f, "{}={}", name, ty)?,
                        None => write!(f, "{}", ty)?,
                    }
                }
                write!(f, ">")
            }
            Type::Federated(ty) if ty.all_equal => write!(f, "{}@{}", ty.member, ty.placement),
            Type::Federated(ty) => write!(f, "{{{}}}@{}", ty.member, ty.placement),
            Type::Sequence(element) => write!(f, "{}*", element),
            Type::Function(ty) => write!(f, "{}", ty),
        }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dtype)?;
        if !self.shape.is_empty() {
            let dims: Vec<String> = self.shape.iter().map(ToString::to_string).collect();
            write!(f, "[{}]", dims.join(","))?;
        }
        Ok(())
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parameter() {
            Some(parameter) => write!(f, "({} -> {})", parameter, self.result),
            None => write!(f, "( -> {})", self.result),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
/// Errors of type construction and type checking.
pub enum TypeError {
    #[error("expected type {expected}, found {found}")]
    Mismatch { expected: Type, found: Type },
    #[error("expected a {expected} type, found {found}")]
    Kind { expected: &'static str, found: Type },
    #[error("struct of {len} elements has no element {index}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("value does not conform to {ty}: {reason}")]
    Value { ty: Type, reason: String },
    #[error("{0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int32() -> Type {
        Type::scalar(DType::I32)
    }

    #[test]
    fn test_display() {
        let ty = Type::function(
            Some(Type::tuple(vec![Type::at_server(int32()), Type::at_clients(int32())])),
            Type::named(vec![("sum", Type::at_server(Type::tensor(DType::F32, [3])))]),
        );
        assert_eq!(
            ty.to_string(),
            "(<int32@SERVER,{int32}@CLIENTS> -> <sum=float32[3]@SERVER>)"
        );
        assert_eq!(Type::sequence(int32()).to_string(), "int32*");
        assert_eq!(Type::function(None, int32()).to_string(), "( -> int32)");
    }

    #[test]
    fn test_leaves_flatten_nested_structs() {
        let ty = Type::tuple(vec![
            Type::at_server(int32()),
            Type::named(vec![("a", Type::at_clients(int32())), ("b", int32())]),
        ]);
        assert_eq!(
            ty.leaves(),
            vec![&Type::at_server(int32()), &Type::at_clients(int32()), &int32()]
        );
    }

    #[test]
    fn test_contains_placement() {
        let ty = Type::tuple(vec![int32(), Type::at_clients(int32())]);
        assert!(ty.contains_federated());
        assert!(ty.contains_placement(Placement::Clients));
        assert!(!ty.contains_placement(Placement::Server));
        assert!(!Type::list(vec![int32(), int32()]).contains_federated());
    }

    #[test]
    fn test_assignability_ignores_containers() {
        let list = Type::list(vec![int32(), int32()]);
        let tuple = Type::tuple(vec![int32(), int32()]);
        assert!(list.is_assignable_from(&tuple));
        assert_ne!(list, tuple);
    }

    #[test]
    fn test_all_equal_assignability() {
        let all_equal = Type::federated(int32(), Placement::Clients, true);
        let distinct = Type::at_clients(int32());
        assert!(distinct.is_assignable_from(&all_equal));
        assert!(!all_equal.is_assignable_from(&distinct));
        assert!(!Type::at_server(int32()).is_assignable_from(&distinct));
    }

    #[test]
    fn test_element_out_of_range() {
        let ty = Type::tuple(vec![int32()]);
        assert_eq!(ty.element(0), Ok(&int32()));
        assert_eq!(
            ty.element(1),
            Err(TypeError::IndexOutOfRange { index: 1, len: 1 })
        );
        assert!(matches!(int32().element(0), Err(TypeError::Kind { .. })));
    }

    #[test]
    fn test_check_value() {
        let ty = Type::tuple(vec![Type::at_server(int32()), Type::at_clients(int32())]);
        let value = Value::tuple(vec![
            Value::at_server(Value::from(1)),
            Value::at_clients(vec![Value::from(2), Value::from(3)]),
        ]);
        assert!(ty.check_value(&value).is_ok());

        let wrong_placement = Value::tuple(vec![
            Value::at_clients(vec![Value::from(1)]),
            Value::at_clients(vec![Value::from(2)]),
        ]);
        assert!(ty.check_value(&wrong_placement).is_err());
        assert!(int32().check_value(&Value::from(1.0_f32)).is_err());
    }
}
