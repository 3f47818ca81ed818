//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Typed device values and binary payload codecs."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
//! Binary payload codecs.
//!
//! ```text
//! boolean  1 byte   0x00 / 0x01 (any nonzero decodes true)
//! uint8    1 byte
//! int8     1 byte   two's complement
//! uint32   4 bytes  little endian
//! int32    4 bytes  little endian
//! float    4 bytes  IEEE-754 binary32, little endian
//! text     N bytes  raw UTF-8, no length prefix
//! json     N bytes  UTF-8 JSON text
//! ```
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::value::DeviceValue;

/// Wire-level encoding a value kind maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    /// Single byte flag.
    Boolean,
    /// Unsigned 8-bit integer.
    Uint8,
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Signed 32-bit integer.
    Int32,
    /// 32-bit float.
    Float,
    /// Raw UTF-8 string.
    Text,
    /// Structured JSON document.
    Json,
}

/// Errors raised while encoding or decoding payloads.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// The value variant cannot be represented by the primitive.
    #[error("{primitive} cannot encode {value}")]
    UnsupportedValue {
        /// Target primitive.
        primitive: Primitive,
        /// Rendered offending value.
        value: String,
    },
    /// Integer does not fit the primitive width.
    #[error("{value} does not fit {primitive}")]
    OutOfBounds {
        /// Target primitive.
        primitive: Primitive,
        /// Offending integer.
        value: i64,
    },
    /// Fixed-width payload of the wrong size.
    #[error("{primitive} expects {expected} byte(s), received {actual}")]
    Length {
        /// Decoding primitive.
        primitive: Primitive,
        /// Required width.
        expected: usize,
        /// Received width.
        actual: usize,
    },
    /// Text payload is not UTF-8.
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    /// JSON payload could not be parsed or produced.
    #[error("invalid json payload: {0}")]
    Json(String),
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Primitive {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Primitive::Boolean => "boolean",
            Primitive::Uint8 => "uint8",
            Primitive::Int8 => "int8",
            Primitive::Uint32 => "uint32",
            Primitive::Int32 => "int32",
            Primitive::Float => "float",
            Primitive::Text => "text",
            Primitive::Json => "json",
        }
    }

    /// Encode a value into its wire representation.
    pub fn encode(self, value: &DeviceValue) -> Result<Bytes, CodecError> {
        match (self, value) {
            (Primitive::Boolean, DeviceValue::Boolean(flag)) => {
                Ok(Bytes::copy_from_slice(&[u8::from(*flag)]))
            }
            (Primitive::Uint8, DeviceValue::Integer(v)) => {
                let narrowed = u8::try_from(*v).map_err(|_| self.out_of_bounds(*v))?;
                Ok(Bytes::copy_from_slice(&narrowed.to_le_bytes()))
            }
            (Primitive::Int8, DeviceValue::Integer(v)) => {
                let narrowed = i8::try_from(*v).map_err(|_| self.out_of_bounds(*v))?;
                Ok(Bytes::copy_from_slice(&narrowed.to_le_bytes()))
            }
            (Primitive::Uint32, DeviceValue::Integer(v)) => {
                let narrowed = u32::try_from(*v).map_err(|_| self.out_of_bounds(*v))?;
                Ok(Bytes::copy_from_slice(&narrowed.to_le_bytes()))
            }
            (Primitive::Int32, DeviceValue::Integer(v)) => {
                let narrowed = i32::try_from(*v).map_err(|_| self.out_of_bounds(*v))?;
                Ok(Bytes::copy_from_slice(&narrowed.to_le_bytes()))
            }
            (Primitive::Float, DeviceValue::Float(v)) => {
                Ok(Bytes::copy_from_slice(&(*v as f32).to_le_bytes()))
            }
            (Primitive::Float, DeviceValue::Integer(v)) => {
                Ok(Bytes::copy_from_slice(&(*v as f32).to_le_bytes()))
            }
            (Primitive::Text, DeviceValue::Text(text)) => {
                Ok(Bytes::copy_from_slice(text.as_bytes()))
            }
            (Primitive::Json, value) => encode_json(value),
            (primitive, value) => Err(CodecError::UnsupportedValue {
                primitive,
                value: value.to_string(),
            }),
        }
    }

    /// Decode a wire payload. Never panics on arbitrary input.
    pub fn decode(self, payload: &[u8]) -> Result<DeviceValue, CodecError> {
        match self {
            Primitive::Boolean => {
                let [byte] = fixed::<1>(self, payload)?;
                Ok(DeviceValue::Boolean(byte != 0))
            }
            Primitive::Uint8 => {
                let raw = fixed::<1>(self, payload)?;
                Ok(DeviceValue::Integer(i64::from(u8::from_le_bytes(raw))))
            }
            Primitive::Int8 => {
                let raw = fixed::<1>(self, payload)?;
                Ok(DeviceValue::Integer(i64::from(i8::from_le_bytes(raw))))
            }
            Primitive::Uint32 => {
                let raw = fixed::<4>(self, payload)?;
                Ok(DeviceValue::Integer(i64::from(u32::from_le_bytes(raw))))
            }
            Primitive::Int32 => {
                let raw = fixed::<4>(self, payload)?;
                Ok(DeviceValue::Integer(i64::from(i32::from_le_bytes(raw))))
            }
            Primitive::Float => {
                let raw = fixed::<4>(self, payload)?;
                Ok(DeviceValue::Float(f64::from(f32::from_le_bytes(raw))))
            }
            Primitive::Text => Ok(DeviceValue::Text(std::str::from_utf8(payload)?.to_owned())),
            Primitive::Json => decode_json(payload).map(DeviceValue::Structured),
        }
    }

    fn out_of_bounds(self, value: i64) -> CodecError {
        CodecError::OutOfBounds {
            primitive: self,
            value,
        }
    }
}

fn fixed<const N: usize>(primitive: Primitive, payload: &[u8]) -> Result<[u8; N], CodecError> {
    payload.try_into().map_err(|_| CodecError::Length {
        primitive,
        expected: N,
        actual: payload.len(),
    })
}

/// Serialize any value as UTF-8 JSON bytes.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| CodecError::Json(err.to_string()))
}

/// Parse UTF-8 JSON bytes into any deserializable value.
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(payload).map_err(|err| CodecError::Json(err.to_string()))
}
