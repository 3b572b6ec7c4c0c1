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

//! Module with error definitions for all
//! structs and functions in the crate.

use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::index::HeaderValue;

/// Policy applied when a recoverable error is met while scanning
/// messages, building variables or translating coordinates.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub enum ErrorPolicy {
    /// Swallow the error and continue.
    Ignore,
    /// Log a warning and continue.
    #[default]
    Warn,
    /// Abort the whole operation.
    Raise,
}

/// Errors reported by a GRIB decoder backend while
/// reading or writing a single message.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("key {0:?} not found in message")]
    KeyNotFound(String),

    #[error("key {0:?} is read-only")]
    ReadOnly(String),

    #[error("key {key:?} has type {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("key type suffix {0:?} is not supported")]
    UnknownKeyType(String),

    #[error("provided buffer is too small for key {0:?}")]
    BufferTooSmall(String),

    #[error("end of file reached")]
    EndOfFile,

    #[error("end of index reached")]
    EndOfIndex,

    #[error("invalid packed date or time value: {0}")]
    InvalidDate(i64),

    #[error("stepUnits code {0} is reserved and not supported")]
    UnsupportedStepUnit(i64),

    #[error("operation not supported by this decoder: {0}")]
    Unsupported(&'static str),

    #[error("error while handling the file: {0}")]
    FileHandling(#[from] std::io::Error),

    #[cfg(feature = "eccodes")]
    #[error("error while reading the GRIB file: {0}")]
    CannotReadGrib(#[from] eccodes::errors::CodesError),
}

/// Errors related to enumerating the messages of one GRIB file.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("no valid GRIB message found in {0:?}")]
    EmptyFile(PathBuf),

    #[error("error while decoding a message: {0}")]
    Decode(#[from] DecodeError),
}

/// Errors related to building and querying a message index.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("key {0:?} is not part of the index")]
    UnknownKey(String),

    #[error("expected a single value for key {key:?}, found {count}")]
    NotUnique { key: String, count: usize },

    #[error("index has no message")]
    Empty,

    #[error("error while scanning the GRIB stream: {0}")]
    Stream(#[from] StreamError),

    #[error("error while decoding a message: {0}")]
    Decode(#[from] DecodeError),
}

/// Errors related to assembling CDM datasets from an index.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("multiple values for unique key {key:?}, retry with one of the candidate filters")]
    AmbiguousVariable {
        key: String,
        candidates: Vec<BTreeMap<String, HeaderValue>>,
    },

    #[error("time dimensions {0:?} are not a subset of the supported reference-time keys")]
    IllegalTimeDims(Vec<String>),

    #[error(
        "{coord:?} cannot be indexed by dimension {dim:?}: \
         found two distinct values ({first}, {second}) for {at}"
    )]
    InconsistentExtraCoord {
        coord: String,
        dim: String,
        first: HeaderValue,
        second: HeaderValue,
        at: HeaderValue,
    },

    #[error("key {key:?} present with a different value")]
    MergeConflict { key: String },

    #[error("expected {expected} indexes, got {got}")]
    IndexRank { expected: usize, got: usize },

    #[error("index {index} out of bounds for axis {axis} of size {size}")]
    IndexOutOfBounds {
        index: usize,
        axis: usize,
        size: usize,
    },

    #[error("values array shape mismatch in GRIB message: {0}")]
    ValuesShape(#[from] ndarray::ShapeError),

    #[error("error while querying the index: {0}")]
    Index(#[from] IndexError),

    #[error("error while scanning the GRIB stream: {0}")]
    Stream(#[from] StreamError),

    #[error("error while decoding a message: {0}")]
    Decode(#[from] DecodeError),
}

/// Errors related to renaming coordinates to a target data model.
#[derive(Error, Debug)]
pub enum TranslationError {
    #[error("found more than one coordinate matching CF type {0:?}")]
    AmbiguousCoord(String),

    #[error("found a non CF compliant coordinate named {0:?}")]
    NameCollision(String),

    #[error("unknown stored direction {0:?}")]
    InvalidDirection(String),

    #[error("error while converting units: {0}")]
    Conversion(#[from] ConversionError),
}

/// Errors related to converting values between units.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("cannot convert from {from:?} to {to:?}")]
    Incompatible { from: String, to: String },
}
