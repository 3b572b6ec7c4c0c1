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

//! Module assembling CDM datasets out of a message index.
//!
//! Each distinct `paramId` becomes one variable. The variable's
//! dimensions are the index keys that actually vary across its
//! messages, each coordinate taking the sorted set of observed
//! values, plus the geography dimensions of the grid.

pub mod ondisk;

use chrono::Utc;
use log::{debug, warn};
use ndarray::{ArrayD, IxDyn};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cfkeys;
use crate::constants::{
    coord_attrs, grid_type_keys, ALL_REF_TIME_KEYS, DATA_ATTRIBUTES_KEYS, DATA_TIME_KEYS,
    DEFAULT_MISSING_VALUE, ENSEMBLE_KEYS, EXTRA_DATA_ATTRIBUTES_KEYS, GLOBAL_ATTRIBUTES_KEYS,
    GRID_TYPES_2D_NON_DIMENSION_COORDS, GRID_TYPES_DIMENSION_COORDS, INDEX_KEYS, SPECTRA_KEYS,
    VERTICAL_KEYS,
};
use crate::errors::{BuildError, ErrorPolicy};
use crate::index::{FileIndex, HeaderValue, DEFAULT_INDEXPATH};
use crate::message::Message;
use crate::source::{GribDecoder, KeyValue, Offset};
use crate::stream::FileStream;

pub use ondisk::{ArrayIndex, OnDiskArray};

/// Scalar attribute value of a variable or a dataset.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v),
            AttrValue::Str(_) => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<HeaderValue> for AttrValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::Int(v) => AttrValue::Int(v),
            HeaderValue::Float(v) => AttrValue::Float(v),
            HeaderValue::Str(v) => AttrValue::Str(v),
            HeaderValue::Undef => AttrValue::Str("undef".to_owned()),
        }
    }
}

/// Array payload of a variable: either a dense in-memory array or
/// a lazy view over messages on disk.
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayData {
    Dense(ArrayD<f64>),
    Lazy(OnDiskArray),
}

impl ArrayData {
    pub fn shape(&self) -> &[usize] {
        match self {
            ArrayData::Dense(array) => array.shape(),
            ArrayData::Lazy(array) => array.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn size(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn as_dense(&self) -> Option<&ArrayD<f64>> {
        match self {
            ArrayData::Dense(array) => Some(array),
            ArrayData::Lazy(_) => None,
        }
    }

    /// Materialises the whole array.
    pub fn build_array(&self) -> Result<ArrayD<f64>, BuildError> {
        match self {
            ArrayData::Dense(array) => Ok(array.clone()),
            ArrayData::Lazy(array) => array.build_array(),
        }
    }

    /// Basic indexing with one index per axis.
    pub fn index(&self, item: &[ArrayIndex]) -> Result<ArrayD<f64>, BuildError> {
        match self {
            ArrayData::Dense(array) => index_dense(array, item),
            ArrayData::Lazy(array) => array.index(item),
        }
    }

    /// Flips the array along one axis.
    pub fn reverse_axis(&mut self, axis: usize) {
        match self {
            ArrayData::Dense(array) => array.invert_axis(ndarray::Axis(axis)),
            ArrayData::Lazy(array) => array.reverse_axis(axis),
        }
    }
}

fn index_dense(array: &ArrayD<f64>, item: &[ArrayIndex]) -> Result<ArrayD<f64>, BuildError> {
    if item.len() != array.ndim() {
        return Err(BuildError::IndexRank {
            expected: array.ndim(),
            got: item.len(),
        });
    }
    let mut out = array.clone();
    for (axis, index) in item.iter().enumerate() {
        if matches!(
            index,
            ArrayIndex::Slice {
                start: None,
                stop: None,
                step: 1
            }
        ) {
            continue;
        }
        let positions = index.positions(array.shape()[axis], axis)?;
        out = out.select(ndarray::Axis(axis), &positions);
    }
    for axis in (0..item.len()).rev() {
        if matches!(item[axis], ArrayIndex::Int(_)) {
            out = out.index_axis_move(ndarray::Axis(axis), 0);
        }
    }
    Ok(out)
}

/// One variable of a dataset: named dimensions, data and
/// attributes. Two variables are equal iff all three agree.
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub dimensions: Vec<String>,
    pub data: ArrayData,
    pub attributes: BTreeMap<String, AttrValue>,
}

/// CF encoding aspects the builder may apply.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum EncodeCf {
    Parameter,
    Time,
    Geography,
    Vertical,
}

/// Provenance of a dataset: where it came from and how it was
/// decoded.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Encoding {
    pub source: PathBuf,
    pub filter_by_keys: BTreeMap<String, HeaderValue>,
    pub encode_cf: Vec<EncodeCf>,
}

/// Options controlling how a GRIB file is opened as a dataset.
#[derive(Clone, Debug)]
pub struct ReadOptions {
    pub errors: ErrorPolicy,
    pub encode_cf: Vec<EncodeCf>,
    pub squeeze: bool,
    /// Sidecar path template; empty disables index persistence.
    pub indexpath: String,
    pub filter_by_keys: BTreeMap<String, HeaderValue>,
    /// Extra attribute keys read from the first message of each
    /// variable.
    pub read_keys: Vec<String>,
    /// Reference-time coordinates to emit, in dimension order.
    pub time_dims: Vec<String>,
    /// Additional scalar coordinates, each a function of the named
    /// dimension.
    pub extra_coords: BTreeMap<String, String>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            errors: ErrorPolicy::default(),
            encode_cf: vec![
                EncodeCf::Parameter,
                EncodeCf::Time,
                EncodeCf::Geography,
                EncodeCf::Vertical,
            ],
            squeeze: true,
            indexpath: DEFAULT_INDEXPATH.to_owned(),
            filter_by_keys: BTreeMap::new(),
            read_keys: Vec::new(),
            time_dims: vec!["time".to_owned(), "step".to_owned()],
            extra_coords: BTreeMap::new(),
        }
    }
}

/// A GRIB file mapped to the NetCDF Common Data Model with CF
/// conventions.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    pub dimensions: BTreeMap<String, usize>,
    pub variables: BTreeMap<String, Variable>,
    pub attributes: BTreeMap<String, AttrValue>,
    pub encoding: Encoding,
}

impl Dataset {
    /// Names of the coordinate variables: everything listed in a
    /// `coordinates` attribute plus the dimension coordinates.
    pub fn coordinate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for variable in self.variables.values() {
            if let Some(AttrValue::Str(list)) = variable.attributes.get("coordinates") {
                for token in list.split_whitespace() {
                    if !names.iter().any(|n| n == token) {
                        names.push(token.to_owned());
                    }
                }
            }
        }
        for (name, variable) in &self.variables {
            if variable.dimensions.iter().any(|d| d == name)
                && !names.iter().any(|n| n == name)
            {
                names.push(name.clone());
            }
        }
        names
    }

    /// Renames a coordinate everywhere: the variable itself, the
    /// dimension registry, dimension lists and `coordinates`
    /// attributes.
    pub fn rename(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        if let Some(variable) = self.variables.remove(from) {
            self.variables.insert(to.to_owned(), variable);
        }
        if let Some(size) = self.dimensions.remove(from) {
            self.dimensions.insert(to.to_owned(), size);
        }
        for variable in self.variables.values_mut() {
            for dim in &mut variable.dimensions {
                if dim == from {
                    *dim = to.to_owned();
                }
            }
            if let Some(AttrValue::Str(list)) = variable.attributes.get_mut("coordinates") {
                *list = list
                    .split_whitespace()
                    .map(|token| if token == from { to } else { token })
                    .collect::<Vec<_>>()
                    .join(" ");
            }
        }
    }

    /// Reverses every variable along the named dimension.
    pub fn reverse_dim(&mut self, dim: &str) {
        for variable in self.variables.values_mut() {
            if let Some(axis) = variable.dimensions.iter().position(|d| d == dim) {
                variable.data.reverse_axis(axis);
            }
        }
    }
}

fn coord_attr_map(coord_name: &str) -> BTreeMap<String, AttrValue> {
    coord_attrs(coord_name)
        .iter()
        .map(|&(k, v)| (k.to_owned(), AttrValue::from(v)))
        .collect()
}

fn is_unset(value: &HeaderValue) -> bool {
    value.is_undef() || matches!(value.as_str(), Some("undef") | Some("unknown"))
}

/// Reads the unique value of each key off the index into `GRIB_`
/// prefixed attributes; a key with several values across the
/// projection aborts with the candidate filters that split it.
fn enforce_unique_attributes(
    index: &FileIndex,
    attributes_keys: &[&str],
    filter_by_keys: &BTreeMap<String, HeaderValue>,
) -> Result<BTreeMap<String, AttrValue>, BuildError> {
    let mut attributes = BTreeMap::new();
    for &key in attributes_keys {
        let values = index.values(key)?;
        if values.len() > 1 {
            let candidates = values
                .into_iter()
                .map(|value| {
                    let mut fbk = filter_by_keys.clone();
                    fbk.insert(key.to_owned(), value);
                    fbk
                })
                .collect();
            return Err(BuildError::AmbiguousVariable {
                key: key.to_owned(),
                candidates,
            });
        }
        if let Some(value) = values.into_iter().next() {
            if !is_unset(&value) {
                attributes.insert(format!("GRIB_{}", key), AttrValue::from(value));
            }
        }
    }
    Ok(attributes)
}

/// Reads descriptive attributes best-effort from the first message
/// of a variable. Array-valued keys are not attributes and are
/// skipped.
fn read_data_var_attrs(
    first: &Message,
    extra_keys: &[String],
) -> BTreeMap<String, AttrValue> {
    let mut attributes = BTreeMap::new();
    for key in extra_keys {
        if let Ok(value) = first.get(key) {
            if value.is_array() {
                continue;
            }
            let value = match value {
                KeyValue::Int(v) => AttrValue::Int(v),
                KeyValue::Float(v) => AttrValue::Float(v),
                KeyValue::Str(v) => AttrValue::Str(v),
                _ => continue,
            };
            attributes.insert(format!("GRIB_{}", key), value);
        }
    }
    attributes
}

/// Decides the coordinate keys of a variable and settles its CF
/// parameter attributes.
fn encode_cf_first(
    data_var_attrs: &mut BTreeMap<String, AttrValue>,
    encode_cf: &[EncodeCf],
    time_dims: &[String],
) -> Result<Vec<String>, BuildError> {
    let mut coords_map: Vec<String> = ENSEMBLE_KEYS.iter().map(|&k| k.to_owned()).collect();

    let param_id = data_var_attrs
        .get("GRIB_paramId")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "undef".to_owned());
    data_var_attrs.insert(
        "long_name".to_owned(),
        AttrValue::Str(format!("original GRIB paramId: {}", param_id)),
    );
    data_var_attrs.insert("units".to_owned(), AttrValue::from("1"));

    if encode_cf.contains(&EncodeCf::Parameter) {
        if let Some(cf_name) = data_var_attrs.get("GRIB_cfName").cloned() {
            data_var_attrs.insert("standard_name".to_owned(), cf_name);
        }
        if let Some(name) = data_var_attrs.get("GRIB_name").cloned() {
            data_var_attrs.insert("long_name".to_owned(), name);
        }
        if let Some(units) = data_var_attrs.get("GRIB_units").cloned() {
            data_var_attrs.insert("units".to_owned(), units);
        }
    }

    if encode_cf.contains(&EncodeCf::Time) {
        if time_dims.iter().all(|d| ALL_REF_TIME_KEYS.contains(&d.as_str())) {
            coords_map.extend(time_dims.iter().cloned());
        } else {
            return Err(BuildError::IllegalTimeDims(time_dims.to_vec()));
        }
    } else {
        coords_map.extend(DATA_TIME_KEYS.iter().map(|&k| k.to_owned()));
    }

    coords_map.extend(VERTICAL_KEYS.iter().map(|&k| k.to_owned()));
    coords_map.extend(SPECTRA_KEYS.iter().map(|&k| k.to_owned()));
    Ok(coords_map)
}

/// Builds the geography dimensions, shape and coordinate variables
/// from the grid of the first message.
fn build_geography_coordinates(
    first: &Message,
    encode_cf: &[EncodeCf],
    errors: ErrorPolicy,
) -> Result<(Vec<String>, Vec<usize>, Vec<(String, Variable)>), BuildError> {
    let grid_type = first.get_str("gridType")?;
    let geography = encode_cf.contains(&EncodeCf::Geography);
    let mut geo_coord_vars: Vec<(String, Variable)> = Vec::new();

    if geography && GRID_TYPES_DIMENSION_COORDS.contains(&grid_type.as_str()) {
        let ny = first.get_int("Ny")? as usize;
        let nx = first.get_int("Nx")? as usize;

        let latitudes = first.get_float_array("distinctLatitudes")?;
        let mut lat_attrs = coord_attr_map("latitude");
        if latitudes.len() > 1 && latitudes[0] > latitudes[latitudes.len() - 1] {
            lat_attrs.insert("stored_direction".to_owned(), AttrValue::from("decreasing"));
        }
        geo_coord_vars.push((
            "latitude".to_owned(),
            Variable {
                dimensions: vec!["latitude".to_owned()],
                data: ArrayData::Dense(ArrayD::from_shape_vec(
                    IxDyn(&[latitudes.len()]),
                    latitudes,
                )?),
                attributes: lat_attrs,
            },
        ));

        let longitudes = first.get_float_array("distinctLongitudes")?;
        geo_coord_vars.push((
            "longitude".to_owned(),
            Variable {
                dimensions: vec!["longitude".to_owned()],
                data: ArrayData::Dense(ArrayD::from_shape_vec(
                    IxDyn(&[longitudes.len()]),
                    longitudes,
                )?),
                attributes: coord_attr_map("longitude"),
            },
        ));

        return Ok((
            vec!["latitude".to_owned(), "longitude".to_owned()],
            vec![ny, nx],
            geo_coord_vars,
        ));
    }

    if geography && GRID_TYPES_2D_NON_DIMENSION_COORDS.contains(&grid_type.as_str()) {
        let ny = first.get_int("Ny")? as usize;
        let nx = first.get_int("Nx")? as usize;

        match (
            first.get_float_array("latitudes"),
            first.get_float_array("longitudes"),
        ) {
            (Ok(latitudes), Ok(longitudes)) => {
                geo_coord_vars.push((
                    "latitude".to_owned(),
                    Variable {
                        dimensions: vec!["y".to_owned(), "x".to_owned()],
                        data: ArrayData::Dense(ArrayD::from_shape_vec(
                            IxDyn(&[ny, nx]),
                            latitudes,
                        )?),
                        attributes: coord_attr_map("latitude"),
                    },
                ));
                geo_coord_vars.push((
                    "longitude".to_owned(),
                    Variable {
                        dimensions: vec!["y".to_owned(), "x".to_owned()],
                        data: ArrayData::Dense(ArrayD::from_shape_vec(
                            IxDyn(&[ny, nx]),
                            longitudes,
                        )?),
                        attributes: coord_attr_map("longitude"),
                    },
                ));
            }
            _ if errors != ErrorPolicy::Ignore => {
                warn!(
                    "decoder provides no latitudes/longitudes for gridType={:?}",
                    grid_type
                );
            }
            _ => {}
        }

        return Ok((vec!["y".to_owned(), "x".to_owned()], vec![ny, nx], geo_coord_vars));
    }

    // Unstructured or unknown grids keep a flat point list, with
    // auxiliary point coordinates when the decoder provides them.
    let points = first.get_int("numberOfPoints")? as usize;
    match (
        first.get_float_array("latitudes"),
        first.get_float_array("longitudes"),
    ) {
        (Ok(latitudes), Ok(longitudes)) => {
            geo_coord_vars.push((
                "latitude".to_owned(),
                Variable {
                    dimensions: vec!["values".to_owned()],
                    data: ArrayData::Dense(ArrayD::from_shape_vec(
                        IxDyn(&[latitudes.len()]),
                        latitudes,
                    )?),
                    attributes: coord_attr_map("latitude"),
                },
            ));
            geo_coord_vars.push((
                "longitude".to_owned(),
                Variable {
                    dimensions: vec!["values".to_owned()],
                    data: ArrayData::Dense(ArrayD::from_shape_vec(
                        IxDyn(&[longitudes.len()]),
                        longitudes,
                    )?),
                    attributes: coord_attr_map("longitude"),
                },
            ));
        }
        _ if errors != ErrorPolicy::Ignore => {
            warn!(
                "decoder provides no latitudes/longitudes for gridType={:?}",
                grid_type
            );
        }
        _ => {}
    }

    Ok((vec!["values".to_owned()], vec![points], geo_coord_vars))
}

/// Builds the dimension registry, the data variable and the
/// coordinate variables of one parameter out of its projection of
/// the index.
#[allow(clippy::too_many_arguments)]
pub fn build_variable_components(
    index: &FileIndex,
    encode_cf: &[EncodeCf],
    filter_by_keys: &BTreeMap<String, HeaderValue>,
    errors: ErrorPolicy,
    squeeze: bool,
    read_keys: &[String],
    time_dims: &[String],
    extra_coords: &BTreeMap<String, String>,
) -> Result<(BTreeMap<String, usize>, Variable, Vec<(String, Variable)>), BuildError> {
    let mut data_var_attrs =
        enforce_unique_attributes(index, &DATA_ATTRIBUTES_KEYS, filter_by_keys)?;

    let grid_keys = match index.getone("gridType") {
        Ok(HeaderValue::Str(grid_type)) => grid_type_keys(&grid_type),
        _ => &[],
    };
    let mut extra_keys: Vec<String> = read_keys
        .iter()
        .cloned()
        .chain(EXTRA_DATA_ATTRIBUTES_KEYS.iter().map(|&k| k.to_owned()))
        .chain(grid_keys.iter().map(|&k| k.to_owned()))
        .collect();
    extra_keys.sort_unstable();
    extra_keys.dedup();

    let first = index.first()?;
    let extra_attrs = read_data_var_attrs(&first, &extra_keys);
    data_var_attrs.extend(extra_attrs);

    let coords_map = encode_cf_first(&mut data_var_attrs, encode_cf, time_dims)?;

    // Header coordinates: sorted observed values per coordinate key.
    let mut coord_vars: Vec<(String, Variable)> = Vec::new();
    let mut coord_name_key_map: BTreeMap<String, String> = BTreeMap::new();
    let mut coord_values: BTreeMap<String, Vec<HeaderValue>> = BTreeMap::new();

    for coord_key in &coords_map {
        let mut values = index.values(coord_key)?;
        values.retain(|v| !v.is_undef());
        if values.is_empty() {
            debug!("missing from GRIB stream: {:?}", coord_key);
            continue;
        }

        let orig_name = coord_key.split(':').next().expect("key has a name");
        let mut coord_name = orig_name.to_owned();
        if encode_cf.contains(&EncodeCf::Vertical) && coord_name == "level" {
            if let Some(AttrValue::Str(type_of_level)) = data_var_attrs.get("GRIB_typeOfLevel")
            {
                coord_name = type_of_level.clone();
            }
        }
        coord_name_key_map.insert(coord_name.clone(), coord_key.clone());

        let mut attributes = BTreeMap::new();
        attributes.insert(
            "long_name".to_owned(),
            AttrValue::Str(format!(
                "original GRIB coordinate for key: {}({})",
                orig_name, coord_name
            )),
        );
        attributes.insert("units".to_owned(), AttrValue::from("1"));
        attributes.extend(coord_attr_map(&coord_name));

        let decreasing = attributes.get("stored_direction").and_then(AttrValue::as_str)
            == Some("decreasing");
        values.sort();
        if decreasing {
            values.reverse();
        }

        let numeric: Vec<f64> = values
            .iter()
            .map(|v| v.as_f64().unwrap_or(f64::NAN))
            .collect();
        let data = if squeeze && numeric.len() == 1 {
            Variable {
                dimensions: vec![],
                data: ArrayData::Dense(ArrayD::from_elem(IxDyn(&[]), numeric[0])),
                attributes,
            }
        } else {
            Variable {
                dimensions: vec![coord_name.clone()],
                data: ArrayData::Dense(ArrayD::from_shape_vec(
                    IxDyn(&[numeric.len()]),
                    numeric,
                )?),
                attributes,
            }
        };
        coord_values.insert(coord_name.clone(), values);
        coord_vars.push((coord_name, data));
    }

    let header_dimensions: Vec<String> = coord_vars
        .iter()
        .filter(|(_, variable)| !squeeze || variable.data.size() > 1)
        .map(|(name, _)| name.clone())
        .collect();
    let header_shape: Vec<usize> = header_dimensions
        .iter()
        .map(|name| coord_values[name].len())
        .collect();

    let (geo_dims, geo_shape, geo_coord_vars) =
        build_geography_coordinates(&first, encode_cf, errors)?;

    let mut dimensions = header_dimensions.clone();
    dimensions.extend(geo_dims.iter().cloned());
    let mut shape = header_shape;
    shape.extend(geo_shape.iter().copied());
    coord_vars.extend(geo_coord_vars);

    // Map every message to the positions of its header values.
    let mut value_positions: BTreeMap<&str, FxHashMap<HeaderValue, usize>> = BTreeMap::new();
    for dim in &header_dimensions {
        value_positions.insert(
            dim,
            coord_values[dim]
                .iter()
                .enumerate()
                .map(|(at, value)| (value.clone(), at))
                .collect(),
        );
    }

    let mut offsets: FxHashMap<Vec<usize>, Offset> = FxHashMap::default();
    let mut extra_coords_data: BTreeMap<&str, FxHashMap<HeaderValue, HeaderValue>> =
        extra_coords.keys().map(|name| (name.as_str(), FxHashMap::default())).collect();

    'entries: for (header_values, entry_offsets) in index.entries() {
        let mut header_indexes: Vec<usize> = Vec::with_capacity(header_dimensions.len());
        for dim in &header_dimensions {
            let key = coord_name_key_map
                .get(dim)
                .map(String::as_str)
                .unwrap_or(dim);
            let value = &header_values[index.key_position(key)?];
            match value_positions[dim.as_str()].get(value) {
                Some(&at) => header_indexes.push(at),
                None => continue 'entries,
            }

            for (coord_name, coord_dim) in extra_coords {
                if coord_dim != dim {
                    continue;
                }
                let coord_key = coord_name_key_map
                    .get(coord_name)
                    .map(String::as_str)
                    .unwrap_or(coord_name);
                let coord_value = header_values[index.key_position(coord_key)?].clone();
                let saved = extra_coords_data
                    .get_mut(coord_name.as_str())
                    .expect("extra coord is registered")
                    .entry(value.clone())
                    .or_insert_with(|| coord_value.clone());
                if *saved != coord_value {
                    return Err(BuildError::InconsistentExtraCoord {
                        coord: coord_name.clone(),
                        dim: coord_dim.clone(),
                        first: saved.clone(),
                        second: coord_value,
                        at: value.clone(),
                    });
                }
            }
        }
        if let Some(offset) = entry_offsets.first() {
            offsets.insert(header_indexes, *offset);
        }
    }

    let missing_value = match data_var_attrs.get("GRIB_missingValue") {
        Some(value) => value.as_f64().unwrap_or(DEFAULT_MISSING_VALUE),
        None => {
            warn!(
                "missingValue attribute not found, defaulting to {}",
                DEFAULT_MISSING_VALUE
            );
            DEFAULT_MISSING_VALUE
        }
    };

    let data = OnDiskArray::new(
        index.stream().clone(),
        shape.clone(),
        offsets.into_iter().collect(),
        missing_value,
        geo_dims.len(),
    );

    // Secondary valid_time coordinate from time and step.
    let time_data = coord_vars
        .iter()
        .find(|(name, _)| name == "time")
        .and_then(|(_, v)| v.data.as_dense().cloned());
    let step_data = coord_vars
        .iter()
        .find(|(name, _)| name == "step")
        .and_then(|(_, v)| v.data.as_dense().cloned());
    if let (Some(time), Some(step)) = (time_data, step_data) {
        if !coord_vars.iter().any(|(name, _)| name == "valid_time") {
            let (vt_dims, vt_data) = cfkeys::build_valid_time(&time, &step);
            coord_vars.push((
                "valid_time".to_owned(),
                Variable {
                    dimensions: vt_dims.into_iter().map(|d| d.to_owned()).collect(),
                    data: ArrayData::Dense(vt_data),
                    attributes: coord_attr_map("valid_time"),
                },
            ));
        }
    }

    // Extra scalar coordinates along their dimension.
    for (coord_name, coord_dim) in extra_coords {
        let dim_values = match coord_values.get(coord_dim) {
            Some(values) if header_dimensions.contains(coord_dim) => values,
            _ => {
                debug!("extra coordinate {:?} has no dimension to follow", coord_name);
                continue;
            }
        };
        let collected = &extra_coords_data[coord_name.as_str()];
        let numeric: Vec<f64> = dim_values
            .iter()
            .map(|value| {
                collected
                    .get(value)
                    .and_then(HeaderValue::as_f64)
                    .unwrap_or(f64::NAN)
            })
            .collect();
        coord_vars.push((
            coord_name.clone(),
            Variable {
                dimensions: vec![coord_dim.clone()],
                data: ArrayData::Dense(ArrayD::from_shape_vec(
                    IxDyn(&[numeric.len()]),
                    numeric,
                )?),
                attributes: BTreeMap::new(),
            },
        ));
    }

    let coordinates = coord_vars
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    data_var_attrs.insert("coordinates".to_owned(), AttrValue::Str(coordinates));

    let data_var = Variable {
        dimensions: dimensions.clone(),
        data: ArrayData::Lazy(data),
        attributes: data_var_attrs,
    };
    let dims: BTreeMap<String, usize> = dimensions.into_iter().zip(shape).collect();
    Ok((dims, data_var, coord_vars))
}

/// Inserts every entry into the master map, failing on a key
/// already present with a different value.
fn dict_merge<V: PartialEq>(
    master: &mut BTreeMap<String, V>,
    update: Vec<(String, V)>,
) -> Result<(), BuildError> {
    for (key, value) in update {
        match master.get(&key) {
            None => {
                master.insert(key, value);
            }
            Some(existing) if *existing == value => {}
            Some(_) => return Err(BuildError::MergeConflict { key }),
        }
    }
    Ok(())
}

fn build_dataset_attributes(
    index: &FileIndex,
    filter_by_keys: &BTreeMap<String, HeaderValue>,
    encoding: &Encoding,
) -> Result<BTreeMap<String, AttrValue>, BuildError> {
    let mut attributes = enforce_unique_attributes(index, &GLOBAL_ATTRIBUTES_KEYS, filter_by_keys)?;
    attributes.insert("Conventions".to_owned(), AttrValue::from("CF-1.7"));
    if let Some(description) = attributes.get("GRIB_centreDescription").cloned() {
        attributes.insert("institution".to_owned(), description);
    }
    let history = format!(
        "{} GRIB to CDM+CF via gribcdm-{} with {:?}",
        Utc::now().format("%Y-%m-%dT%H:%M"),
        env!("CARGO_PKG_VERSION"),
        encoding,
    );
    attributes.insert("history".to_owned(), AttrValue::Str(history));
    Ok(attributes)
}

/// Assembles the whole dataset: one variable per `paramId`, merged
/// dimensions and coordinates, global attributes and provenance.
pub fn build_dataset_components(
    index: &FileIndex,
    options: &ReadOptions,
) -> Result<Dataset, BuildError> {
    let mut dimensions: BTreeMap<String, usize> = BTreeMap::new();
    let mut variables: BTreeMap<String, Variable> = BTreeMap::new();
    let filter_by_keys = index.filter_by_keys().clone();

    for param_id in index.values("paramId")? {
        let var_index = index.subindex_one("paramId", param_id.clone())?;
        let built = build_variable_components(
            &var_index,
            &options.encode_cf,
            &filter_by_keys,
            options.errors,
            options.squeeze,
            &options.read_keys,
            &options.time_dims,
            &options.extra_coords,
        );
        let (dims, data_var, coord_vars) = match built {
            Ok(components) => components,
            Err(BuildError::AmbiguousVariable { key, .. }) => {
                // A retried open has to split on every value present
                // in the file, not only the ones of this variable.
                let candidates = index
                    .values(&key)?
                    .into_iter()
                    .map(|value| {
                        let mut fbk = filter_by_keys.clone();
                        fbk.insert(key.clone(), value);
                        fbk
                    })
                    .collect();
                return Err(BuildError::AmbiguousVariable { key, candidates });
            }
            Err(err) => return Err(err),
        };

        let mut var_name = data_var
            .attributes
            .get("GRIB_shortName")
            .and_then(AttrValue::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("paramId_{}", param_id));
        if options.encode_cf.contains(&EncodeCf::Parameter) {
            if let Some(cf_var_name) = data_var
                .attributes
                .get("GRIB_cfVarName")
                .and_then(AttrValue::as_str)
            {
                if cf_var_name != "undef" && cf_var_name != "unknown" {
                    var_name = cf_var_name.to_owned();
                }
            }
        }

        // The merges commit together or not at all.
        let mut staged_variables = variables.clone();
        let mut staged_dimensions = dimensions.clone();
        let merged = dict_merge(&mut staged_variables, coord_vars)
            .and_then(|_| {
                dict_merge(&mut staged_variables, vec![(var_name.clone(), data_var)])
            })
            .and_then(|_| dict_merge(&mut staged_dimensions, dims.into_iter().collect()));
        match merged {
            Ok(()) => {
                variables = staged_variables;
                dimensions = staged_dimensions;
            }
            Err(err) => match options.errors {
                ErrorPolicy::Raise => return Err(err),
                ErrorPolicy::Ignore => {}
                ErrorPolicy::Warn => warn!(
                    "skipping variable: paramId=={} shortName={:?}: {}",
                    param_id, var_name, err
                ),
            },
        }
    }

    let encoding = Encoding {
        source: index.source_path().to_path_buf(),
        filter_by_keys: filter_by_keys.clone(),
        encode_cf: options.encode_cf.clone(),
    };
    let attributes = build_dataset_attributes(index, &filter_by_keys, &encoding)?;

    Ok(Dataset {
        dimensions,
        variables,
        attributes,
        encoding,
    })
}

/// Builds (or loads) the index of a file with the keys the dataset
/// builder needs, restricted to the caller's filters.
pub fn open_fileindex(
    decoder: Arc<dyn GribDecoder>,
    path: &Path,
    options: &ReadOptions,
) -> Result<FileIndex, BuildError> {
    let mut index_keys: Vec<String> = INDEX_KEYS.iter().map(|&k| k.to_owned()).collect();
    let requested = options
        .time_dims
        .iter()
        .chain(options.filter_by_keys.keys())
        .chain(options.extra_coords.keys());
    for key in requested {
        if !index_keys.iter().any(|k| k == key) {
            index_keys.push(key.clone());
        }
    }

    let stream = FileStream::new(decoder, path, options.errors);
    let index = stream.index(index_keys, &options.indexpath)?;
    Ok(index.subindex(&options.filter_by_keys)?)
}

/// Opens a GRIB file as a single dataset through the given decoder
/// backend.
pub fn open_file_with<P: AsRef<Path>>(
    decoder: Arc<dyn GribDecoder>,
    path: P,
    options: &ReadOptions,
) -> Result<Dataset, BuildError> {
    let index = open_fileindex(decoder, path.as_ref(), options)?;
    build_dataset_components(&index, options)
}

/// Opens a GRIB file as every dataset it resolves into: a
/// heterogeneous file is split along the candidate filters carried
/// by the ambiguity errors.
pub fn open_datasets_with<P: AsRef<Path>>(
    decoder: Arc<dyn GribDecoder>,
    path: P,
    options: &ReadOptions,
) -> Result<Vec<Dataset>, BuildError> {
    match open_file_with(Arc::clone(&decoder), path.as_ref(), options) {
        Ok(dataset) => Ok(vec![dataset]),
        Err(BuildError::AmbiguousVariable { candidates, .. }) => {
            let mut datasets = Vec::new();
            for filter_by_keys in candidates {
                let mut branch = options.clone();
                branch.filter_by_keys = filter_by_keys;
                datasets.extend(open_datasets_with(
                    Arc::clone(&decoder),
                    path.as_ref(),
                    &branch,
                )?);
            }
            Ok(datasets)
        }
        Err(err) => Err(err),
    }
}
