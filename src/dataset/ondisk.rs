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

//! Module with the lazy N-D array backed by messages on disk.
//!
//! The array knows, for each combination of header coordinate
//! positions, the offset of the message holding that field. An
//! indexing call decodes only the messages the selection needs and
//! assembles them into a dense array, filling the holes with NaN.

use ndarray::{ArrayD, Axis, IxDyn, SliceInfoElem};
use rustc_hash::FxHashMap;

use crate::errors::BuildError;
use crate::source::Offset;
use crate::stream::{FileStream, StreamReader};

/// Basic index over one array axis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArrayIndex {
    /// A single position; the axis is collapsed in the result.
    Int(usize),
    /// A slice with the usual start/stop/step defaults.
    Slice {
        start: Option<usize>,
        stop: Option<usize>,
        step: usize,
    },
    /// An explicit list of positions.
    List(Vec<usize>),
}

impl ArrayIndex {
    /// The whole axis.
    pub fn all() -> Self {
        ArrayIndex::Slice {
            start: None,
            stop: None,
            step: 1,
        }
    }

    /// Normalises the index to the list of selected positions along
    /// an axis of the given size.
    pub(crate) fn positions(&self, size: usize, axis: usize) -> Result<Vec<usize>, BuildError> {
        let check = |index: usize| {
            if index < size {
                Ok(index)
            } else {
                Err(BuildError::IndexOutOfBounds { index, axis, size })
            }
        };

        match self {
            ArrayIndex::Int(index) => Ok(vec![check(*index)?]),
            ArrayIndex::Slice { start, stop, step } => {
                let start = start.unwrap_or(0);
                let stop = stop.unwrap_or(size).min(size);
                let step = (*step).max(1);
                Ok((start..stop).step_by(step).collect())
            }
            ArrayIndex::List(indexes) => {
                indexes.iter().map(|&index| check(index)).collect()
            }
        }
    }
}

impl From<usize> for ArrayIndex {
    fn from(index: usize) -> Self {
        ArrayIndex::Int(index)
    }
}

impl From<std::ops::Range<usize>> for ArrayIndex {
    fn from(range: std::ops::Range<usize>) -> Self {
        ArrayIndex::Slice {
            start: Some(range.start),
            stop: Some(range.end),
            step: 1,
        }
    }
}

impl From<Vec<usize>> for ArrayIndex {
    fn from(indexes: Vec<usize>) -> Self {
        ArrayIndex::List(indexes)
    }
}

/// Lazy array of one variable, shaped as the header coordinate
/// sizes followed by the geography shape.
///
/// Header combinations with no message decode as NaN subarrays, and
/// in-field values equal to `missing_value` decode as NaN.
#[derive(Clone, Debug)]
pub struct OnDiskArray {
    stream: FileStream,
    shape: Vec<usize>,
    offsets: Vec<(Vec<usize>, Offset)>,
    missing_value: f64,
    geo_ndim: usize,
    geo_flip: Vec<bool>,
}

impl PartialEq for OnDiskArray {
    fn eq(&self, other: &Self) -> bool {
        self.stream.path() == other.stream.path()
            && self.shape == other.shape
            && self.offsets == other.offsets
            && self.missing_value == other.missing_value
            && self.geo_ndim == other.geo_ndim
            && self.geo_flip == other.geo_flip
    }
}

impl OnDiskArray {
    pub fn new(
        stream: FileStream,
        shape: Vec<usize>,
        mut offsets: Vec<(Vec<usize>, Offset)>,
        missing_value: f64,
        geo_ndim: usize,
    ) -> Self {
        offsets.sort();
        let geo_flip = vec![false; geo_ndim];
        OnDiskArray {
            stream,
            shape,
            offsets,
            missing_value,
            geo_ndim,
            geo_flip,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn geo_ndim(&self) -> usize {
        self.geo_ndim
    }

    pub fn header_ndim(&self) -> usize {
        self.shape.len() - self.geo_ndim
    }

    pub fn missing_value(&self) -> f64 {
        self.missing_value
    }

    fn geo_shape(&self) -> &[usize] {
        &self.shape[self.header_ndim()..]
    }

    /// Decodes the field of one message and orients it along the
    /// current axis directions.
    fn decode_field(
        &self,
        reader: &mut StreamReader,
        offset: Offset,
    ) -> Result<ArrayD<f64>, BuildError> {
        let message = reader.get(Some(offset))?;
        let values = message.get_float_array("values")?;
        let mut field = ArrayD::from_shape_vec(IxDyn(self.geo_shape()), values)?;
        for (axis, flip) in self.geo_flip.iter().enumerate() {
            if *flip {
                field.invert_axis(Axis(axis));
            }
        }
        Ok(field)
    }

    fn substitute_missing(&self, array: &mut ArrayD<f64>) {
        let missing = self.missing_value;
        array.mapv_inplace(|v| if v == missing { f64::NAN } else { v });
    }

    /// Materialises the whole array. One descriptor spans the whole
    /// fetch.
    pub fn build_array(&self) -> Result<ArrayD<f64>, BuildError> {
        let mut array = ArrayD::from_elem(IxDyn(&self.shape), f64::NAN);
        let mut reader = self.stream.reader()?;

        for (header_indexes, offset) in &self.offsets {
            let field = self.decode_field(&mut reader, *offset)?;
            let mut info: Vec<SliceInfoElem> = header_indexes
                .iter()
                .map(|&at| SliceInfoElem::Index(at as isize))
                .collect();
            info.extend((0..self.geo_ndim).map(|_| SliceInfoElem::Slice {
                start: 0,
                end: None,
                step: 1,
            }));
            array.slice_mut(info.as_slice()).assign(&field);
        }

        self.substitute_missing(&mut array);
        Ok(array)
    }

    /// Basic indexing with one index per axis.
    ///
    /// Output axes follow the input axis order; axes indexed by a
    /// single integer are collapsed. Decoding order is an
    /// implementation detail.
    pub fn index(&self, item: &[ArrayIndex]) -> Result<ArrayD<f64>, BuildError> {
        if item.len() != self.shape.len() {
            return Err(BuildError::IndexRank {
                expected: self.shape.len(),
                got: item.len(),
            });
        }
        let header_ndim = self.header_ndim();

        let mut lookups: Vec<FxHashMap<usize, usize>> = Vec::with_capacity(header_ndim);
        let mut slab_shape: Vec<usize> = Vec::with_capacity(self.shape.len());
        for (axis, index) in item[..header_ndim].iter().enumerate() {
            let positions = index.positions(self.shape[axis], axis)?;
            slab_shape.push(positions.len());
            lookups.push(
                positions
                    .iter()
                    .enumerate()
                    .map(|(out, &at)| (at, out))
                    .collect(),
            );
        }
        slab_shape.extend_from_slice(self.geo_shape());

        let mut slab = ArrayD::from_elem(IxDyn(&slab_shape), f64::NAN);
        {
            let mut reader = self.stream.reader()?;
            'messages: for (header_indexes, offset) in &self.offsets {
                let mut info: Vec<SliceInfoElem> = Vec::with_capacity(self.shape.len());
                for (lookup, &at) in lookups.iter().zip(header_indexes) {
                    match lookup.get(&at) {
                        Some(&out) => info.push(SliceInfoElem::Index(out as isize)),
                        None => continue 'messages,
                    }
                }
                info.extend((0..self.geo_ndim).map(|_| SliceInfoElem::Slice {
                    start: 0,
                    end: None,
                    step: 1,
                }));

                let field = self.decode_field(&mut reader, *offset)?;
                slab.slice_mut(info.as_slice()).assign(&field);
            }
        }
        self.substitute_missing(&mut slab);

        // Subselect within the geography axes.
        let mut array = slab;
        for (at, index) in item[header_ndim..].iter().enumerate() {
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
            let axis = header_ndim + at;
            let positions = index.positions(self.geo_shape()[at], axis)?;
            array = array.select(Axis(axis), &positions);
        }

        // Integer indexes collapse their axis after assembly.
        for axis in (0..item.len()).rev() {
            if matches!(item[axis], ArrayIndex::Int(_)) {
                array = array.index_axis_move(Axis(axis), 0);
            }
        }

        Ok(array)
    }

    /// Flips the array along one axis, remapping header positions
    /// or the in-field orientation as appropriate.
    pub fn reverse_axis(&mut self, axis: usize) {
        let header_ndim = self.header_ndim();
        if axis < header_ndim {
            let size = self.shape[axis];
            for (header_indexes, _) in &mut self.offsets {
                header_indexes[axis] = size - 1 - header_indexes[axis];
            }
            self.offsets.sort();
        } else {
            self.geo_flip[axis - header_ndim] = !self.geo_flip[axis - header_ndim];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorPolicy;
    use crate::source::memory::{MemoryDecoder, MemoryMessage};
    use crate::source::KeyValue;
    use std::sync::Arc;

    /// Two isobaric levels of a 2x2 grid, one message each.
    fn two_level_array(missing_value: f64) -> OnDiskArray {
        let decoder = MemoryDecoder::new();
        decoder.add_file(
            "/synthetic/levels.grib",
            vec![
                MemoryMessage::new()
                    .with("values", KeyValue::FloatArray(vec![1.0, 2.0, 3.0, 4.0])),
                MemoryMessage::new()
                    .with("values", KeyValue::FloatArray(vec![5.0, 6.0, 7.0, 9999.0])),
            ],
        );
        let stream = FileStream::new(
            Arc::new(decoder),
            "/synthetic/levels.grib",
            ErrorPolicy::Raise,
        );
        OnDiskArray::new(
            stream,
            vec![2, 2, 2],
            vec![
                (vec![0], Offset::new(0)),
                (vec![1], Offset::new(512)),
            ],
            missing_value,
            2,
        )
    }

    fn approx_eq(left: &ArrayD<f64>, right: &ArrayD<f64>) -> bool {
        left.shape() == right.shape()
            && left
                .iter()
                .zip(right.iter())
                .all(|(a, b)| (a.is_nan() && b.is_nan()) || a == b)
    }

    #[test]
    fn build_array_matches_full_selection() {
        let array = two_level_array(-9.0);
        let full = array.build_array().unwrap();
        assert_eq!(full.shape(), &[2, 2, 2]);
        assert_eq!(full[[0, 0, 1]], 2.0);
        assert_eq!(full[[1, 1, 0]], 7.0);

        let selected = array
            .index(&[ArrayIndex::all(), ArrayIndex::all(), ArrayIndex::all()])
            .unwrap();
        assert!(approx_eq(&full, &selected));
    }

    #[test]
    fn integer_indexes_collapse_their_axis() {
        let array = two_level_array(-9.0);
        let level = array
            .index(&[ArrayIndex::Int(1), ArrayIndex::all(), ArrayIndex::all()])
            .unwrap();
        assert_eq!(level.shape(), &[2, 2]);
        assert_eq!(level[[0, 0]], 5.0);

        let point = array
            .index(&[ArrayIndex::Int(0), ArrayIndex::Int(1), ArrayIndex::Int(0)])
            .unwrap();
        assert_eq!(point.ndim(), 0);
        assert_eq!(point.iter().next().copied().unwrap(), 3.0);
    }

    #[test]
    fn list_indexes_reorder_positions() {
        let array = two_level_array(-9.0);
        let swapped = array
            .index(&[
                ArrayIndex::List(vec![1, 0]),
                ArrayIndex::all(),
                ArrayIndex::all(),
            ])
            .unwrap();
        assert_eq!(swapped[[0, 0, 0]], 5.0);
        assert_eq!(swapped[[1, 0, 0]], 1.0);
    }

    #[test]
    fn missing_value_cells_decode_as_nan() {
        let array = two_level_array(9999.0);
        let full = array.build_array().unwrap();
        assert!(full[[1, 1, 1]].is_nan());
        assert_eq!(full[[1, 1, 0]], 7.0);
    }

    #[test]
    fn absent_header_combinations_stay_nan() {
        let decoder = MemoryDecoder::new();
        decoder.add_file(
            "/synthetic/sparse.grib",
            vec![MemoryMessage::new()
                .with("values", KeyValue::FloatArray(vec![1.0, 2.0, 3.0, 4.0]))],
        );
        let stream = FileStream::new(
            Arc::new(decoder),
            "/synthetic/sparse.grib",
            ErrorPolicy::Raise,
        );
        let array = OnDiskArray::new(
            stream,
            vec![2, 2, 2],
            vec![(vec![0], Offset::new(0))],
            -9.0,
            2,
        );

        let full = array.build_array().unwrap();
        assert_eq!(full[[0, 1, 1]], 4.0);
        assert!(full.slice(ndarray::s![1, .., ..]).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn out_of_bounds_and_rank_errors() {
        let array = two_level_array(-9.0);
        assert!(matches!(
            array.index(&[ArrayIndex::Int(2), ArrayIndex::all(), ArrayIndex::all()]),
            Err(BuildError::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            array.index(&[ArrayIndex::all()]),
            Err(BuildError::IndexRank { .. })
        ));
    }

    #[test]
    fn reversing_axes_flips_header_and_geography() {
        let mut array = two_level_array(-9.0);
        array.reverse_axis(0);
        let full = array.build_array().unwrap();
        assert_eq!(full[[0, 0, 0]], 5.0);
        assert_eq!(full[[1, 0, 0]], 1.0);

        array.reverse_axis(1);
        let full = array.build_array().unwrap();
        // Rows of each field now run south to north.
        assert_eq!(full[[1, 0, 0]], 3.0);
        assert_eq!(full[[1, 1, 0]], 1.0);
    }
}
