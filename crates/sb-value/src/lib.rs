#![forbid(unsafe_code)]

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use sb_tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    None,
    Tensor,
    Double,
    Int,
    Bool,
    String,
    IntList,
    DoubleList,
    TensorList,
}

impl Tag {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Tag::None => "None",
            Tag::Tensor => "Tensor",
            Tag::Double => "Double",
            Tag::Int => "Int",
            Tag::Bool => "Bool",
            Tag::String => "String",
            Tag::IntList => "IntList",
            Tag::DoubleList => "DoubleList",
            Tag::TensorList => "TensorList",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    TypeMismatch { expected: Tag, got: Tag },
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch { expected, got } => {
                write!(f, "type mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for ValueError {}

/// Tagged union carrying any kernel argument or result.
///
/// Cloning deep-copies string and list payloads; tensor payloads stay shared
/// through their `Arc`. Doubles compare bit-exactly and tensors compare by
/// reference identity.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Tensor(Tensor),
    Double(f64),
    Int(i64),
    Bool(bool),
    String(String),
    IntList(Vec<i64>),
    DoubleList(Vec<f64>),
    TensorList(Vec<Tensor>),
}

impl Value {
    #[must_use]
    pub fn tag(&self) -> Tag {
        match self {
            Value::None => Tag::None,
            Value::Tensor(_) => Tag::Tensor,
            Value::Double(_) => Tag::Double,
            Value::Int(_) => Tag::Int,
            Value::Bool(_) => Tag::Bool,
            Value::String(_) => Tag::String,
            Value::IntList(_) => Tag::IntList,
            Value::DoubleList(_) => Tag::DoubleList,
            Value::TensorList(_) => Tag::TensorList,
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.tag() == Tag::None
    }

    #[must_use]
    pub fn is_tensor(&self) -> bool {
        self.tag() == Tag::Tensor
    }

    #[must_use]
    pub fn is_double(&self) -> bool {
        self.tag() == Tag::Double
    }

    #[must_use]
    pub fn is_int(&self) -> bool {
        self.tag() == Tag::Int
    }

    #[must_use]
    pub fn is_bool(&self) -> bool {
        self.tag() == Tag::Bool
    }

    #[must_use]
    pub fn is_string(&self) -> bool {
        self.tag() == Tag::String
    }

    #[must_use]
    pub fn is_int_list(&self) -> bool {
        self.tag() == Tag::IntList
    }

    #[must_use]
    pub fn is_double_list(&self) -> bool {
        self.tag() == Tag::DoubleList
    }

    #[must_use]
    pub fn is_tensor_list(&self) -> bool {
        self.tag() == Tag::TensorList
    }

    fn mismatch(&self, expected: Tag) -> ValueError {
        ValueError::TypeMismatch {
            expected,
            got: self.tag(),
        }
    }

    pub fn to_tensor(&self) -> Result<Tensor, ValueError> {
        match self {
            Value::Tensor(tensor) => Ok(tensor.clone()),
            other => Err(other.mismatch(Tag::Tensor)),
        }
    }

    pub fn to_double(&self) -> Result<f64, ValueError> {
        match self {
            Value::Double(value) => Ok(*value),
            other => Err(other.mismatch(Tag::Double)),
        }
    }

    pub fn to_int(&self) -> Result<i64, ValueError> {
        match self {
            Value::Int(value) => Ok(*value),
            other => Err(other.mismatch(Tag::Int)),
        }
    }

    pub fn to_bool(&self) -> Result<bool, ValueError> {
        match self {
            Value::Bool(value) => Ok(*value),
            other => Err(other.mismatch(Tag::Bool)),
        }
    }

    pub fn to_text(&self) -> Result<String, ValueError> {
        match self {
            Value::String(value) => Ok(value.clone()),
            other => Err(other.mismatch(Tag::String)),
        }
    }

    pub fn to_int_list(&self) -> Result<Vec<i64>, ValueError> {
        match self {
            Value::IntList(values) => Ok(values.clone()),
            other => Err(other.mismatch(Tag::IntList)),
        }
    }

    pub fn to_double_list(&self) -> Result<Vec<f64>, ValueError> {
        match self {
            Value::DoubleList(values) => Ok(values.clone()),
            other => Err(other.mismatch(Tag::DoubleList)),
        }
    }

    pub fn to_tensor_list(&self) -> Result<Vec<Tensor>, ValueError> {
        match self {
            Value::TensorList(tensors) => Ok(tensors.clone()),
            other => Err(other.mismatch(Tag::TensorList)),
        }
    }

    #[must_use]
    pub fn debug_string(&self) -> String {
        match self {
            Value::None => String::from("None"),
            Value::Tensor(tensor) => format!("Tensor({})", tensor.debug_string()),
            Value::Double(value) => format!("Double({value})"),
            Value::Int(value) => format!("Int({value})"),
            Value::Bool(value) => format!("Bool({value})"),
            Value::String(value) => format!("String(\"{value}\")"),
            Value::IntList(values) => {
                let mut out = String::from("IntList([");
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{value}");
                }
                out.push_str("])");
                out
            }
            Value::DoubleList(values) => {
                let mut out = String::from("DoubleList([");
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{value}");
                }
                out.push_str("])");
                out
            }
            Value::TensorList(tensors) => {
                let mut out = String::from("TensorList([");
                for (idx, tensor) in tensors.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&tensor.debug_string());
                }
                out.push_str("])");
                out
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Tensor(lhs), Value::Tensor(rhs)) => Arc::ptr_eq(lhs, rhs),
            // NaN-safe bit equality.
            (Value::Double(lhs), Value::Double(rhs)) => lhs.to_bits() == rhs.to_bits(),
            (Value::Int(lhs), Value::Int(rhs)) => lhs == rhs,
            (Value::Bool(lhs), Value::Bool(rhs)) => lhs == rhs,
            (Value::String(lhs), Value::String(rhs)) => lhs == rhs,
            (Value::IntList(lhs), Value::IntList(rhs)) => lhs == rhs,
            (Value::DoubleList(lhs), Value::DoubleList(rhs)) => {
                lhs.len() == rhs.len()
                    && lhs
                        .iter()
                        .zip(rhs.iter())
                        .all(|(a, b)| a.to_bits() == b.to_bits())
            }
            (Value::TensorList(lhs), Value::TensorList(rhs)) => {
                lhs.len() == rhs.len()
                    && lhs.iter().zip(rhs.iter()).all(|(a, b)| Arc::ptr_eq(a, b))
            }
            _ => false,
        }
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::Tensor(tensor)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Vec<i64>> for Value {
    fn from(values: Vec<i64>) -> Self {
        Value::IntList(values)
    }
}

impl From<Vec<f64>> for Value {
    fn from(values: Vec<f64>) -> Self {
        Value::DoubleList(values)
    }
}

impl From<Vec<Tensor>> for Value {
    fn from(tensors: Vec<Tensor>) -> Self {
        Value::TensorList(tensors)
    }
}

/// Typed extraction out of a [`Value`], one impl per payload type.
///
/// This is the argument half of the boxing adapter's type-to-variant
/// mapping; `EXPECTED` names the variant a mismatch is reported against.
pub trait FromValue: Sized {
    const EXPECTED: Tag;

    fn from_value(value: &Value) -> Result<Self, ValueError>;
}

/// Wrapping a typed payload back into a [`Value`]; the result half of the
/// boxing adapter's mapping.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl FromValue for Tensor {
    const EXPECTED: Tag = Tag::Tensor;

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.to_tensor()
    }
}

impl FromValue for f64 {
    const EXPECTED: Tag = Tag::Double;

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.to_double()
    }
}

impl FromValue for i64 {
    const EXPECTED: Tag = Tag::Int;

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.to_int()
    }
}

impl FromValue for bool {
    const EXPECTED: Tag = Tag::Bool;

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.to_bool()
    }
}

impl FromValue for String {
    const EXPECTED: Tag = Tag::String;

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.to_text()
    }
}

impl FromValue for Vec<i64> {
    const EXPECTED: Tag = Tag::IntList;

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.to_int_list()
    }
}

impl FromValue for Vec<f64> {
    const EXPECTED: Tag = Tag::DoubleList;

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.to_double_list()
    }
}

impl FromValue for Vec<Tensor> {
    const EXPECTED: Tag = Tag::TensorList;

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value.to_tensor_list()
    }
}

impl IntoValue for Tensor {
    fn into_value(self) -> Value {
        Value::Tensor(self)
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::Double(self)
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Value {
        Value::Int(self)
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::String(self)
    }
}

impl IntoValue for Vec<i64> {
    fn into_value(self) -> Value {
        Value::IntList(self)
    }
}

impl IntoValue for Vec<f64> {
    fn into_value(self) -> Value {
        Value::DoubleList(self)
    }
}

impl IntoValue for Vec<Tensor> {
    fn into_value(self) -> Value {
        Value::TensorList(self)
    }
}
