//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Typed device values and binary payload codecs."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, Primitive};
use crate::ValueError;

/// Dynamic value carried by device members and configuration fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceValue {
    /// Boolean flag.
    Boolean(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Arbitrary JSON document.
    Structured(serde_json::Value),
}

impl fmt::Display for DeviceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceValue::Boolean(v) => write!(f, "{v}"),
            DeviceValue::Integer(v) => write!(f, "{v}"),
            DeviceValue::Float(v) => write!(f, "{v}"),
            DeviceValue::Text(v) => write!(f, "{v:?}"),
            DeviceValue::Structured(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for DeviceValue {
    fn from(value: bool) -> Self {
        DeviceValue::Boolean(value)
    }
}

impl From<i64> for DeviceValue {
    fn from(value: i64) -> Self {
        DeviceValue::Integer(value)
    }
}

impl From<f64> for DeviceValue {
    fn from(value: f64) -> Self {
        DeviceValue::Float(value)
    }
}

impl From<&str> for DeviceValue {
    fn from(value: &str) -> Self {
        DeviceValue::Text(value.to_owned())
    }
}

impl From<String> for DeviceValue {
    fn from(value: String) -> Self {
        DeviceValue::Text(value)
    }
}

impl From<serde_json::Value> for DeviceValue {
    fn from(value: serde_json::Value) -> Self {
        DeviceValue::Structured(value)
    }
}

/// Errors raised when constructing a value type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    /// Lower bound exceeds the upper bound.
    #[error("range[{min};{max}] has min greater than max")]
    InvertedRange {
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },
    /// No 32-bit primitive can hold the range.
    #[error("range[{min};{max}] does not fit any 32-bit primitive")]
    RangeTooWide {
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },
    /// Enumeration without literals.
    #[error("enumeration must declare at least one value")]
    EmptyEnum,
}

/// A value did not satisfy its declared type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("value {value} does not satisfy {expected}")]
pub struct TypeValidationError {
    /// Offending value.
    pub value: DeviceValue,
    /// Canonical type string, e.g. `range[1;2]`.
    pub expected: String,
}

/// Bounded integer type with a precomputed wire primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeType {
    min: i64,
    max: i64,
    primitive: Primitive,
}

impl RangeType {
    /// Build a range, picking the narrowest primitive able to carry every value.
    pub fn new(min: i64, max: i64) -> Result<Self, TypeError> {
        if min > max {
            return Err(TypeError::InvertedRange { min, max });
        }
        let primitive = if min >= 0 && max <= i64::from(u8::MAX) {
            Primitive::Uint8
        } else if min >= 0 && max <= i64::from(u32::MAX) {
            Primitive::Uint32
        } else if min >= i64::from(i8::MIN) && max <= i64::from(i8::MAX) {
            Primitive::Int8
        } else if min >= i64::from(i32::MIN) && max <= i64::from(i32::MAX) {
            Primitive::Int32
        } else {
            return Err(TypeError::RangeTooWide { min, max });
        };
        Ok(Self {
            min,
            max,
            primitive,
        })
    }

    /// Inclusive lower bound.
    pub fn min(&self) -> i64 {
        self.min
    }

    /// Inclusive upper bound.
    pub fn max(&self) -> i64 {
        self.max
    }

    /// Wire primitive selected for the bounds.
    pub fn primitive(&self) -> Primitive {
        self.primitive
    }

    /// Whether `value` lies within the bounds.
    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Declared type of a member or configuration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ValueTypeRepr", into = "ValueTypeRepr")]
pub enum ValueType {
    /// Bounded integer.
    Range(RangeType),
    /// Free text.
    Text,
    /// Floating point number.
    Float,
    /// Boolean flag.
    Boolean,
    /// Text restricted to a literal set.
    Enumeration(Vec<String>),
    /// Any JSON document.
    Complex,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ValueTypeRepr {
    Range { min: i64, max: i64 },
    Text,
    Float,
    Boolean,
    Enum { values: Vec<String> },
    Complex,
}

impl TryFrom<ValueTypeRepr> for ValueType {
    type Error = TypeError;

    fn try_from(repr: ValueTypeRepr) -> Result<Self, Self::Error> {
        match repr {
            ValueTypeRepr::Range { min, max } => ValueType::range(min, max),
            ValueTypeRepr::Text => Ok(ValueType::Text),
            ValueTypeRepr::Float => Ok(ValueType::Float),
            ValueTypeRepr::Boolean => Ok(ValueType::Boolean),
            ValueTypeRepr::Enum { values } => ValueType::enumeration(values),
            ValueTypeRepr::Complex => Ok(ValueType::Complex),
        }
    }
}

impl From<ValueType> for ValueTypeRepr {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::Range(range) => ValueTypeRepr::Range {
                min: range.min,
                max: range.max,
            },
            ValueType::Text => ValueTypeRepr::Text,
            ValueType::Float => ValueTypeRepr::Float,
            ValueType::Boolean => ValueTypeRepr::Boolean,
            ValueType::Enumeration(values) => ValueTypeRepr::Enum { values },
            ValueType::Complex => ValueTypeRepr::Complex,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Range(range) => write!(f, "range[{};{}]", range.min, range.max),
            ValueType::Text => f.write_str("text"),
            ValueType::Float => f.write_str("float"),
            ValueType::Boolean => f.write_str("boolean"),
            ValueType::Enumeration(values) => write!(f, "enum{{{}}}", values.join(",")),
            ValueType::Complex => f.write_str("complex"),
        }
    }
}

impl ValueType {
    /// Bounded integer type.
    pub fn range(min: i64, max: i64) -> Result<Self, TypeError> {
        RangeType::new(min, max).map(ValueType::Range)
    }

    /// Enumeration over the given literals.
    pub fn enumeration<I, S>(values: I) -> Result<Self, TypeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(TypeError::EmptyEnum);
        }
        Ok(ValueType::Enumeration(values))
    }

    /// Wire primitive used for this type.
    pub fn primitive(&self) -> Primitive {
        match self {
            ValueType::Range(range) => range.primitive,
            ValueType::Text | ValueType::Enumeration(_) => Primitive::Text,
            ValueType::Float => Primitive::Float,
            ValueType::Boolean => Primitive::Boolean,
            ValueType::Complex => Primitive::Json,
        }
    }

    /// Check a value against the declared type.
    pub fn validate(&self, value: &DeviceValue) -> Result<(), TypeValidationError> {
        let valid = match (self, value) {
            (ValueType::Range(range), DeviceValue::Integer(v)) => range.contains(*v),
            (ValueType::Text, DeviceValue::Text(_)) => true,
            (ValueType::Float, DeviceValue::Integer(_)) => true,
            (ValueType::Float, DeviceValue::Float(v)) => {
                v.is_finite() && v.abs() <= f64::from(f32::MAX)
            }
            (ValueType::Boolean, DeviceValue::Boolean(_)) => true,
            (ValueType::Enumeration(values), DeviceValue::Text(v)) => values.contains(v),
            (ValueType::Complex, _) => true,
            _ => false,
        };
        if valid {
            Ok(())
        } else {
            Err(TypeValidationError {
                value: value.clone(),
                expected: self.to_string(),
            })
        }
    }

    /// Validate then encode with the type's primitive.
    pub fn encode(&self, value: &DeviceValue) -> Result<Bytes, ValueError> {
        self.validate(value)?;
        Ok(self.primitive().encode(value)?)
    }

    /// Decode a payload with the type's primitive.
    pub fn decode(&self, payload: &[u8]) -> Result<DeviceValue, CodecError> {
        self.primitive().decode(payload)
    }
}
