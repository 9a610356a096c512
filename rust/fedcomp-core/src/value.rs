//! Runtime values of federated computations.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Container, DType, Placement, TensorType, Type};

#[derive(Clone, Debug, Error, PartialEq)]
/// Errors of value construction and arithmetic.
pub enum ValueError {
    #[error("tensor of shape {shape:?} needs {expected} elements, got {actual}")]
    ElementCount {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("incompatible operands: {0}")]
    Incompatible(String),
    #[error("operation `{operation}` is not supported for {kind}")]
    Unsupported {
        operation: &'static str,
        kind: String,
    },
    #[error("cannot infer the type of {0}")]
    Uninferable(&'static str),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// The flat, row-major element buffer of a tensor.
pub enum TensorData {
    Bool(Vec<bool>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::Bool(_) => DType::Bool,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Bool(data) => data.len(),
            TensorData::I32(data) => data.len(),
            TensorData::I64(data) => data.len(),
            TensorData::F32(data) => data.len(),
            TensorData::F64(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Bool => TensorData::Bool(vec![false; len]),
            DType::I32 => TensorData::I32(vec![0; len]),
            DType::I64 => TensorData::I64(vec![0; len]),
            DType::F32 => TensorData::F32(vec![0.0; len]),
            DType::F64 => TensorData::F64(vec![0.0; len]),
        }
    }
}

/// Applies a binary operation element-wise to two numeric buffers of the same element type.
///
/// Integer elements use the `$wrapping` method, so overflows wrap around like fixed width tensor
/// arithmetic does.
macro_rules! zip_numeric {
    (
        $operation:literal,
        $lhs:expr,
        $rhs:expr,
        $wrapping:ident,
        |$x:ident, $y:ident| $body:expr
    ) => {
        match ($lhs, $rhs) {
            (TensorData::I32(lhs), TensorData::I32(rhs)) => Ok(TensorData::I32(
                lhs.iter().zip(rhs).map(|(&$x, &$y)| $x.$wrapping($y)).collect(),
            )),
            (TensorData::I64(lhs), TensorData::I64(rhs)) => Ok(TensorData::I64(
                lhs.iter().zip(rhs).map(|(&$x, &$y)| $x.$wrapping($y)).collect(),
            )),
            (TensorData::F32(lhs), TensorData::F32(rhs)) => Ok(TensorData::F32(
                lhs.iter().zip(rhs).map(|(&$x, &$y)| $body).collect(),
            )),
            (TensorData::F64(lhs), TensorData::F64(rhs)) => Ok(TensorData::F64(
                lhs.iter().zip(rhs).map(|(&$x, &$y)| $body).collect(),
            )),
            (lhs, rhs) if lhs.dtype() == rhs.dtype() => Err(ValueError::Unsupported {
                operation: $operation,
                kind: lhs.dtype().to_string(),
            }),
            (lhs, rhs) => Err(ValueError::Incompatible(format!(
                "{} and {}",
                lhs.dtype(),
                rhs.dtype()
            ))),
        }
    };
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// A dense tensor.
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Creates a tensor from a shape and a row-major buffer.
    ///
    /// # Errors
    /// Fails if the number of elements doesn't match the shape.
    pub fn new(shape: impl Into<Vec<usize>>, data: TensorData) -> Result<Self, ValueError> {
        let shape = shape.into();
        let expected = shape.iter().product();
        if data.len() != expected {
            return Err(ValueError::ElementCount {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Creates a tensor of the given type with all elements set to zero.
    pub fn zeros(ty: &TensorType) -> Self {
        Self {
            shape: ty.shape.clone(),
            data: TensorData::zeros(ty.dtype, ty.num_elements()),
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn tensor_type(&self) -> TensorType {
        TensorType {
            dtype: self.dtype(),
            shape: self.shape.clone(),
        }
    }

    fn check_shape(&self, other: &Tensor) -> Result<(), ValueError> {
        if self.shape != other.shape {
            return Err(ValueError::Incompatible(format!(
                "shapes {:?} and {:?}",
                self.shape, other.shape
            )));
        }
        Ok(())
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, ValueError> {
        self.check_shape(other)?;
        let data = zip_numeric!("add", &self.data, &other.data, wrapping_add, |x, y| x + y)?;
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }

    pub fn multiply(&self, other: &Tensor) -> Result<Tensor, ValueError> {
        self.check_shape(other)?;
        let data = zip_numeric!("multiply", &self.data, &other.data, wrapping_mul, |x, y| x * y)?;
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }

    pub fn subtract(&self, other: &Tensor) -> Result<Tensor, ValueError> {
        self.check_shape(other)?;
        let data = zip_numeric!("subtract", &self.data, &other.data, wrapping_sub, |x, y| x - y)?;
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Divides every element by `count`. Only defined for floating point tensors.
    pub fn divide_by(&self, count: i64) -> Result<Tensor, ValueError> {
        let data = match &self.data {
            TensorData::F32(data) => {
                TensorData::F32(data.iter().map(|x| x / count as f32).collect())
            }
            TensorData::F64(data) => {
                TensorData::F64(data.iter().map(|x| x / count as f64).collect())
            }
            data => {
                return Err(ValueError::Unsupported {
                    operation: "divide",
                    kind: data.dtype().to_string(),
                })
            }
        };
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Converts the elements to `f64`, for reporting.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match &self.data {
            TensorData::Bool(data) => data.iter().map(|&x| f64::from(u8::from(x))).collect(),
            TensorData::I32(data) => data.iter().map(|&x| f64::from(x)).collect(),
            TensorData::I64(data) => data.iter().map(|&x| x as f64).collect(),
            TensorData::F32(data) => data.iter().map(|&x| f64::from(x)).collect(),
            TensorData::F64(data) => data.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
/// An ordered struct of optionally named values.
pub struct StructValue {
    elements: Vec<(Option<String>, Value)>,
    container: Container,
}

impl StructValue {
    pub fn new(elements: Vec<(Option<String>, Value)>, container: Container) -> Self {
        Self {
            elements,
            container,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn container(&self) -> Container {
        self.container
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Option<String>, &Value)> {
        self.elements.iter().map(|(name, value)| (name, value))
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.elements.get(index).map(|(_, value)| value)
    }

    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.elements
            .iter()
            .find(|(element, _)| element.as_deref() == Some(name))
            .map(|(_, value)| value)
    }

    pub fn into_elements(self) -> Vec<(Option<String>, Value)> {
        self.elements
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// A value placed at the server or at the clients.
///
/// An all equal value holds a single member standing in for every participant.
pub struct FederatedValue {
    placement: Placement,
    all_equal: bool,
    members: Vec<Value>,
}

impl FederatedValue {
    /// Creates a federated value.
    ///
    /// # Errors
    /// Fails if the value is all equal but doesn't hold exactly one member.
    pub fn new(
        placement: Placement,
        all_equal: bool,
        members: Vec<Value>,
    ) -> Result<Self, ValueError> {
        if all_equal && members.len() != 1 {
            return Err(ValueError::Incompatible(format!(
                "an all equal value needs exactly one member, got {}",
                members.len()
            )));
        }
        Ok(Self {
            placement,
            all_equal,
            members,
        })
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn is_all_equal(&self) -> bool {
        self.all_equal
    }

    pub fn members(&self) -> &[Value] {
        &self.members
    }

    pub fn into_members(self) -> Vec<Value> {
        self.members
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// A runtime value.
pub enum Value {
    Tensor(Tensor),
    Struct(StructValue),
    Federated(FederatedValue),
    Sequence(Vec<Value>),
}

impl Value {
    pub fn tuple(elements: impl IntoIterator<Item = Value>) -> Self {
        Value::Struct(StructValue::new(
            elements.into_iter().map(|value| (None, value)).collect(),
            Container::Tuple,
        ))
    }

    pub fn list(elements: impl IntoIterator<Item = Value>) -> Self {
        Value::Struct(StructValue::new(
            elements.into_iter().map(|value| (None, value)).collect(),
            Container::List,
        ))
    }

    pub fn named<S: Into<String>>(elements: impl IntoIterator<Item = (S, Value)>) -> Self {
        Value::Struct(StructValue::new(
            elements
                .into_iter()
                .map(|(name, value)| (Some(name.into()), value))
                .collect(),
            Container::Map,
        ))
    }

    /// The empty struct `<>`.
    pub fn empty() -> Self {
        Self::tuple(Vec::new())
    }

    pub fn at_server(member: Value) -> Self {
        Value::Federated(FederatedValue {
            placement: Placement::Server,
            all_equal: true,
            members: vec![member],
        })
    }

    /// Creates a clients placed value with one member per client.
    pub fn at_clients(members: Vec<Value>) -> Self {
        Value::Federated(FederatedValue {
            placement: Placement::Clients,
            all_equal: false,
            members,
        })
    }

    /// Creates a clients placed value which is equal on every client.
    pub fn at_clients_all_equal(member: Value) -> Self {
        Value::Federated(FederatedValue {
            placement: Placement::Clients,
            all_equal: true,
            members: vec![member],
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::Struct(_) => "struct",
            Value::Federated(_) => "federated",
            Value::Sequence(_) => "sequence",
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Value::Struct(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_federated(&self) -> Option<&FederatedValue> {
        match self {
            Value::Federated(value) => Some(value),
            _ => None,
        }
    }

    /// Gets the element at `index` of a struct value.
    pub fn element(&self, index: usize) -> Option<&Value> {
        self.as_struct().and_then(|value| value.get(index))
    }

    /// Gets the single member of a server placed value.
    pub fn server_member(&self) -> Option<&Value> {
        self.as_federated()
            .filter(|value| value.placement == Placement::Server)
            .and_then(|value| value.members.first())
    }

    /// Creates the zero value of a type made of tensors and structs.
    pub fn zeros(ty: &Type) -> Result<Value, ValueError> {
        match ty {
            Type::Tensor(ty) => Ok(Value::Tensor(Tensor::zeros(ty))),
            Type::Struct(ty) => {
                let elements = ty
                    .elements
                    .iter()
                    .map(|(name, ty)| Ok((name.clone(), Value::zeros(ty)?)))
                    .collect::<Result<_, ValueError>>()?;
                Ok(Value::Struct(StructValue::new(elements, ty.container)))
            }
            ty => Err(ValueError::Unsupported {
                operation: "zeros",
                kind: ty.to_string(),
            }),
        }
    }

    /// Adds two values of the same structure element-wise.
    pub fn add(&self, other: &Value) -> Result<Value, ValueError> {
        self.zip_with(other, "add", &Tensor::add)
    }

    /// Multiplies two values of the same structure element-wise.
    pub fn multiply(&self, other: &Value) -> Result<Value, ValueError> {
        self.zip_with(other, "multiply", &Tensor::multiply)
    }

    /// Subtracts two values of the same structure element-wise.
    pub fn subtract(&self, other: &Value) -> Result<Value, ValueError> {
        self.zip_with(other, "subtract", &Tensor::subtract)
    }

    fn zip_with(
        &self,
        other: &Value,
        operation: &'static str,
        op: &dyn Fn(&Tensor, &Tensor) -> Result<Tensor, ValueError>,
    ) -> Result<Value, ValueError> {
        match (self, other) {
            (Value::Tensor(lhs), Value::Tensor(rhs)) => op(lhs, rhs).map(Value::Tensor),
            (Value::Struct(lhs), Value::Struct(rhs)) if lhs.len() == rhs.len() => {
                let elements = lhs
                    .elements
                    .iter()
                    .zip(&rhs.elements)
                    .map(|((name, lhs), (_, rhs))| {
                        Ok((name.clone(), lhs.zip_with(rhs, operation, op)?))
                    })
                    .collect::<Result<_, ValueError>>()?;
                Ok(Value::Struct(StructValue::new(elements, lhs.container)))
            }
            (lhs, rhs) => Err(ValueError::Incompatible(format!(
                "cannot {} a {} and a {}",
                operation,
                lhs.kind(),
                rhs.kind()
            ))),
        }
    }

    /// Divides every tensor of the value by `count`.
    pub fn divide_by(&self, count: i64) -> Result<Value, ValueError> {
        match self {
            Value::Tensor(tensor) => tensor.divide_by(count).map(Value::Tensor),
            Value::Struct(value) => {
                let elements = value
                    .elements
                    .iter()
                    .map(|(name, value)| Ok((name.clone(), value.divide_by(count)?)))
                    .collect::<Result<_, ValueError>>()?;
                Ok(Value::Struct(StructValue::new(elements, value.container)))
            }
            value => Err(ValueError::Unsupported {
                operation: "divide",
                kind: value.kind().to_string(),
            }),
        }
    }

    /// Infers the type of the value.
    ///
    /// Federated values and sequences need at least one member to infer their member type.
    pub fn infer_type(&self) -> Result<Type, ValueError> {
        match self {
            Value::Tensor(tensor) => Ok(Type::Tensor(tensor.tensor_type())),
            Value::Struct(value) => {
                let elements = value
                    .elements
                    .iter()
                    .map(|(name, value)| Ok((name.clone(), value.infer_type()?)))
                    .collect::<Result<_, ValueError>>()?;
                Ok(Type::structure(elements, value.container))
            }
            Value::Federated(value) => {
                let member = value
                    .members
                    .first()
                    .ok_or(ValueError::Uninferable("a federated value without members"))?;
                Ok(Type::federated(
                    member.infer_type()?,
                    value.placement,
                    value.all_equal,
                ))
            }
            Value::Sequence(elements) => {
                let element = elements
                    .first()
                    .ok_or(ValueError::Uninferable("an empty sequence"))?;
                Ok(Type::sequence(element.infer_type()?))
            }
        }
    }

    /// Rebuilds the value with the struct containers declared by `ty`.
    ///
    /// Parts of the value that don't line up with `ty` are left untouched.
    pub fn with_containers_of(self, ty: &Type) -> Value {
        match (self, ty) {
            (Value::Struct(value), Type::Struct(ty)) if value.len() == ty.elements.len() => {
                let elements = value
                    .elements
                    .into_iter()
                    .zip(&ty.elements)
                    .map(|((name, value), (_, ty))| (name, value.with_containers_of(ty)))
                    .collect();
                Value::Struct(StructValue::new(elements, ty.container))
            }
            (Value::Federated(value), Type::Federated(ty)) => Value::Federated(FederatedValue {
                members: value
                    .members
                    .into_iter()
                    .map(|member| member.with_containers_of(&ty.member))
                    .collect(),
                ..value
            }),
            (Value::Sequence(elements), Type::Sequence(ty)) => Value::Sequence(
                elements
                    .into_iter()
                    .map(|element| element.with_containers_of(ty))
                    .collect(),
            ),
            (value, _) => value,
        }
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elements = self.to_f64_vec();
        if self.shape.is_empty() {
            if let Some(element) = elements.first() {
                return write!(f, "{}", element);
            }
        }
        write!(f, "{:?}", elements)
    }
}

/// Values are displayed like their types, e.g. `<a=1,b=[1.5, 2.0]>@SERVER`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<'a>(
            f: &mut fmt::Formatter<'_>,
            values: impl Iterator<Item = &'a Value>,
        ) -> fmt::Result {
            for (position, value) in values.enumerate() {
                if position > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", value)?;
            }
            Ok(())
        }

        match self {
            Value::Tensor(tensor) => write!(f, "{}", tensor),
            Value::Struct(value) => {
                write!(f, "<")?;
                for (position, (name, element)) in value.iter().enumerate() {
                    if position > 0 {
                        write!(f, ",")?;
                    }
                    match name {
                        Some(name) => write!(f, "{}={}", name, element)?,
                        None => write!(f, "{}", element)?,
                    }
                }
                write!(f, ">")
            }
            Value::Federated(value) => match value.placement {
                Placement::Clients if !value.all_equal => {
                    write!(f, "{{")?;
                    list(f, value.members.iter())?;
                    write!(f, "}}@{}", value.placement)
                }
                placement => {
                    list(f, value.members.iter())?;
                    write!(f, "@{}", placement)
                }
            },
            Value::Sequence(elements) => {
                write!(f, "[")?;
                list(f, elements.iter())?;
                write!(f, "]*")
            }
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl From<$ty> for Value {
                fn from(scalar: $ty) -> Self {
                    Value::Tensor(Tensor {
                        shape: Vec::new(),
                        data: TensorData::$variant(vec![scalar]),
                    })
                }
            }

            impl From<Vec<$ty>> for Value {
                fn from(elements: Vec<$ty>) -> Self {
                    Value::Tensor(Tensor {
                        shape: vec![elements.len()],
                        data: TensorData::$variant(elements),
                    })
                }
            }
        )*
    };
}

impl_from_scalar!(bool => Bool, i32 => I32, i64 => I64, f32 => F32, f64 => F64);

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::Tensor(tensor)
    }
}
