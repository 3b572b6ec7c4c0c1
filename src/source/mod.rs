/*
Copyright 2023 Jakub Lewandowski

This file is part of gribcdm.

gribcdm is a free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 3 of the License, or
(at your option) any later version.

gribcdm is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with gribcdm. If not, see https://www.gnu.org/licenses/.
*/

//! Module defining the seam between the crate and the GRIB
//! decoder backends, and the backends shipped with the crate.
//!
//! The byte-level decoder is an external collaborator. Everything
//! above it (streams, indexes, datasets) talks to the traits in
//! this module and never to a concrete backend.

pub mod memory;

#[cfg(feature = "eccodes")]
pub mod eccodes;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;

use crate::errors::DecodeError;

/// Read type that can be forced on a key access,
/// spelled `key:int`, `key:float` or `key:str`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum KeyKind {
    Int,
    Float,
    Str,
    Bytes,
}

/// Value of a single GRIB key in its native type.
///
/// Scalar and array flavours are unified here; the [`Message`](crate::message::Message)
/// wrapper collapses singleton arrays to scalars on read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KeyValue {
    Int(i64),
    Float(f64),
    Str(String),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    Bytes(Vec<u8>),
}

impl KeyValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            KeyValue::Int(_) => "int",
            KeyValue::Float(_) => "float",
            KeyValue::Str(_) => "str",
            KeyValue::IntArray(_) => "int array",
            KeyValue::FloatArray(_) => "float array",
            KeyValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            KeyValue::Int(v) => Some(*v),
            KeyValue::IntArray(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            KeyValue::Float(v) => Some(*v),
            KeyValue::Int(v) => Some(*v as f64),
            KeyValue::FloatArray(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Answers the value as a vector of doubles, accepting both
    /// scalar and array flavours of numeric keys.
    pub fn to_float_vec(&self) -> Option<Vec<f64>> {
        match self {
            KeyValue::Float(v) => Some(vec![*v]),
            KeyValue::Int(v) => Some(vec![*v as f64]),
            KeyValue::FloatArray(v) => Some(v.clone()),
            KeyValue::IntArray(v) => Some(v.iter().map(|&e| e as f64).collect()),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            KeyValue::IntArray(_) | KeyValue::FloatArray(_) | KeyValue::Bytes(_)
        )
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Float(v) => write!(f, "{}", v),
            KeyValue::Str(v) => write!(f, "{}", v),
            KeyValue::IntArray(v) => write!(f, "{:?}", v),
            KeyValue::FloatArray(v) => write!(f, "{:?}", v),
            KeyValue::Bytes(v) => write!(f, "{} bytes", v.len()),
        }
    }
}

/// Coerces a natively read value to the forced read type.
///
/// Integer to float is exact, float to integer truncates, scalars
/// format to strings and strings parse to numbers. A failing parse
/// is a type mismatch, as is any array to string coercion.
pub(crate) fn coerce_value(
    key: &str,
    value: KeyValue,
    kind: KeyKind,
) -> Result<KeyValue, DecodeError> {
    let mismatch = |found: &'static str, expected: &'static str| DecodeError::TypeMismatch {
        key: key.to_owned(),
        expected,
        found,
    };

    let coerced = match (kind, value) {
        (KeyKind::Int, KeyValue::Int(v)) => KeyValue::Int(v),
        (KeyKind::Int, KeyValue::Float(v)) => KeyValue::Int(v as i64),
        (KeyKind::Int, KeyValue::Str(v)) => KeyValue::Int(
            v.trim()
                .parse()
                .map_err(|_| mismatch("str", "int"))?,
        ),
        (KeyKind::Int, KeyValue::IntArray(v)) => KeyValue::IntArray(v),
        (KeyKind::Int, KeyValue::FloatArray(v)) => {
            KeyValue::IntArray(v.into_iter().map(|e| e as i64).collect())
        }

        (KeyKind::Float, KeyValue::Float(v)) => KeyValue::Float(v),
        (KeyKind::Float, KeyValue::Int(v)) => KeyValue::Float(v as f64),
        (KeyKind::Float, KeyValue::Str(v)) => KeyValue::Float(
            v.trim()
                .parse()
                .map_err(|_| mismatch("str", "float"))?,
        ),
        (KeyKind::Float, KeyValue::FloatArray(v)) => KeyValue::FloatArray(v),
        (KeyKind::Float, KeyValue::IntArray(v)) => {
            KeyValue::FloatArray(v.into_iter().map(|e| e as f64).collect())
        }

        (KeyKind::Str, KeyValue::Str(v)) => KeyValue::Str(v),
        (KeyKind::Str, KeyValue::Int(v)) => KeyValue::Str(v.to_string()),
        (KeyKind::Str, KeyValue::Float(v)) => KeyValue::Str(v.to_string()),

        (KeyKind::Bytes, KeyValue::Bytes(v)) => KeyValue::Bytes(v),
        (KeyKind::Bytes, KeyValue::Str(v)) => KeyValue::Bytes(v.into_bytes()),

        (_, value) => {
            return Err(mismatch(
                value.kind_name(),
                match kind {
                    KeyKind::Int => "int",
                    KeyKind::Float => "float",
                    KeyKind::Str => "str",
                    KeyKind::Bytes => "bytes",
                },
            ))
        }
    };

    Ok(coerced)
}

/// Position of a message within a GRIB file.
///
/// Multi-field messages share the byte offset of their envelope;
/// sub-fields past the first are addressed by `field > 0` and
/// require the decoder to skip that many fields after seeking.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct Offset {
    pub byte: u64,
    pub field: u32,
}

impl Offset {
    pub fn new(byte: u64) -> Self {
        Offset { byte, field: 0 }
    }

    pub fn with_field(byte: u64, field: u32) -> Self {
        Offset { byte, field }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field == 0 {
            write!(f, "{}", self.byte)
        } else {
            write!(f, "{}#{}", self.byte, self.field)
        }
    }
}

/// View over one decoded GRIB message held by a backend.
pub trait MessageHandle: fmt::Debug {
    /// Reads the value of a key in its native type.
    fn get(&self, key: &str) -> Result<KeyValue, DecodeError>;

    /// Writes a scalar or array value under a key.
    fn set(&mut self, key: &str, value: KeyValue) -> Result<(), DecodeError>;

    /// Names of the keys carried by the message, optionally
    /// scoped to a namespace.
    fn keys(&self, namespace: Option<&str>) -> Result<Vec<String>, DecodeError>;

    /// New independent message with the same contents.
    fn clone_handle(&self) -> Result<Box<dyn MessageHandle>, DecodeError>;

    /// Emits the encoded message bytes to a binary sink.
    fn write_to(&self, sink: &mut dyn Write) -> Result<(), DecodeError>;
}

/// One decoding pass over a GRIB file.
///
/// A session is pinned to the descriptor it was opened on and must
/// not be shared between threads.
pub trait DecodeSession {
    /// Positions the session so that the next message decoded is the
    /// first one starting at or after `byte`.
    fn seek(&mut self, byte: u64) -> Result<(), DecodeError>;

    /// Enables or disables multi-field support for this session.
    ///
    /// With support disabled only the first field of a multi-field
    /// message is decoded, which keeps random access deterministic.
    fn set_multi_field(&mut self, enabled: bool) -> Result<(), DecodeError>;

    /// Decodes the next message, or answers `None` at end of file.
    fn next_message(&mut self) -> Result<Option<Box<dyn MessageHandle>>, DecodeError>;
}

/// A GRIB decoder backend able to open decoding sessions on files.
pub trait GribDecoder: fmt::Debug + Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn DecodeSession>, DecodeError>;

    /// Builds a template message from a named sample.
    fn from_sample(&self, _name: &str) -> Result<Box<dyn MessageHandle>, DecodeError> {
        Err(DecodeError::Unsupported("sample messages"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercion_between_numeric_kinds() {
        let v = coerce_value("level", KeyValue::Int(500), KeyKind::Float).unwrap();
        assert_eq!(v, KeyValue::Float(500.0));

        let v = coerce_value("level", KeyValue::Float(500.9), KeyKind::Int).unwrap();
        assert_eq!(v, KeyValue::Int(500));

        let v = coerce_value("step", KeyValue::Str("12".to_owned()), KeyKind::Int).unwrap();
        assert_eq!(v, KeyValue::Int(12));
    }

    #[test]
    fn coercion_to_str_formats_scalars() {
        let v = coerce_value("paramId", KeyValue::Int(130), KeyKind::Str).unwrap();
        assert_eq!(v, KeyValue::Str("130".to_owned()));
    }

    #[test]
    fn coercion_rejects_array_to_str() {
        let err = coerce_value("values", KeyValue::FloatArray(vec![1.0]), KeyKind::Str);
        assert!(matches!(err, Err(DecodeError::TypeMismatch { .. })));
    }

    #[test]
    fn offset_display() {
        assert_eq!(Offset::new(14760).to_string(), "14760");
        assert_eq!(Offset::with_field(14760, 2).to_string(), "14760#2");
    }
}
