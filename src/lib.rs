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

//! gribcdm maps WMO GRIB edition-1 and edition-2 files into lazy,
//! self-describing datasets following the NetCDF Common Data Model
//! and the CF metadata conventions.
//!
//! A GRIB file is a concatenation of messages, each carrying one
//! 2-D field plus metadata. The crate scans a file once into a
//! persistent header [`index`], recovers the hypercube every
//! parameter spans from the index alone, and defers decoding of
//! field values to the moment an array is actually read.
//!
//! ```no_run
//! # #[cfg(feature = "eccodes")]
//! # fn run() -> Result<(), gribcdm::BuildError> {
//! let dataset = gribcdm::open_file("era5-levels.grib", &gribcdm::ReadOptions::default())?;
//! for (name, variable) in &dataset.variables {
//!     println!("{} {:?}", name, variable.data.shape());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The byte-level GRIB decoder is pluggable through the
//! [`source::GribDecoder`] trait; an ecCodes-backed implementation
//! is available behind the `eccodes` cargo feature.

pub mod cdm;
pub mod cfkeys;
pub mod constants;
pub mod dataset;
pub mod errors;
pub mod index;
pub mod message;
pub mod source;
pub mod stream;

#[cfg(test)]
mod super_tests;

pub use crate::cdm::{cds_model, ecmwf_model, translate_coords, CoordModel, CoordSpec, Direction};
pub use crate::dataset::{
    open_datasets_with, open_file_with, open_fileindex, ArrayData, ArrayIndex, AttrValue,
    Dataset, EncodeCf, Encoding, OnDiskArray, ReadOptions, Variable,
};
pub use crate::errors::{
    BuildError, ConversionError, DecodeError, ErrorPolicy, IndexError, StreamError,
    TranslationError,
};
pub use crate::index::{FileIndex, HeaderValue};
pub use crate::message::Message;
pub use crate::source::{GribDecoder, KeyKind, KeyValue, MessageHandle, Offset};
pub use crate::stream::FileStream;

/// Opens a GRIB file as a single dataset through ecCodes.
#[cfg(feature = "eccodes")]
pub fn open_file<P: AsRef<std::path::Path>>(
    path: P,
    options: &ReadOptions,
) -> Result<Dataset, BuildError> {
    let decoder = std::sync::Arc::new(source::eccodes::EccodesDecoder::new());
    open_file_with(decoder, path, options)
}

/// Opens a GRIB file as every dataset it resolves into through
/// ecCodes, splitting on ambiguous variables.
#[cfg(feature = "eccodes")]
pub fn open_datasets<P: AsRef<std::path::Path>>(
    path: P,
    options: &ReadOptions,
) -> Result<Vec<Dataset>, BuildError> {
    let decoder = std::sync::Arc::new(source::eccodes::EccodesDecoder::new());
    open_datasets_with(decoder, path, options)
}
