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

//! Module translating the CF coordinates of a dataset to a target
//! coordinate data model.
//!
//! Each well-known coordinate is detected by a predicate on its
//! attributes, renamed, converted to the model's units and
//! reordered to the model's stored direction. A failing translator
//! leaves the dataset untouched for that coordinate.

pub mod units;

use log::warn;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::dataset::{ArrayData, AttrValue, Dataset, Variable};
use crate::errors::{ErrorPolicy, TranslationError};

pub const VALID_LAT_UNITS: [&str; 6] = [
    "degrees_north",
    "degree_north",
    "degree_N",
    "degrees_N",
    "degreeN",
    "degreesN",
];

pub const VALID_LON_UNITS: [&str; 6] = [
    "degrees_east",
    "degree_east",
    "degree_E",
    "degrees_E",
    "degreeE",
    "degreesE",
];

const TIME_CF_UNITS: &str = "seconds since 1970-01-01T00:00:00";

/// Ordering policy of a coordinate axis.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Direction {
    Increasing,
    Decreasing,
}

impl FromStr for Direction {
    type Err = TranslationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "increasing" => Ok(Direction::Increasing),
            "decreasing" => Ok(Direction::Decreasing),
            other => Err(TranslationError::InvalidDirection(other.to_owned())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Increasing => write!(f, "increasing"),
            Direction::Decreasing => write!(f, "decreasing"),
        }
    }
}

/// Target settings of one coordinate in a data model; unset fields
/// fall back to the translator defaults.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoordSpec {
    pub out_name: Option<String>,
    pub units: Option<String>,
    pub stored_direction: Option<Direction>,
}

impl CoordSpec {
    fn named(out_name: &str) -> Self {
        CoordSpec {
            out_name: Some(out_name.to_owned()),
            ..CoordSpec::default()
        }
    }

    fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_owned());
        self
    }

    fn with_direction(mut self, direction: Direction) -> Self {
        self.stored_direction = Some(direction);
        self
    }
}

/// A coordinate data model: CF coordinate type to target settings.
pub type CoordModel = BTreeMap<String, CoordSpec>;

/// The Climate Data Store flavour.
pub fn cds_model() -> CoordModel {
    BTreeMap::from([
        // geography
        (
            "latitude".to_owned(),
            CoordSpec::named("lat").with_direction(Direction::Increasing),
        ),
        (
            "longitude".to_owned(),
            CoordSpec::named("lon").with_direction(Direction::Increasing),
        ),
        // vertical
        (
            "depthBelowLand".to_owned(),
            CoordSpec::named("depth")
                .with_units("m")
                .with_direction(Direction::Increasing),
        ),
        (
            "isobaricInhPa".to_owned(),
            CoordSpec::named("plev")
                .with_units("Pa")
                .with_direction(Direction::Decreasing),
        ),
        // ensemble
        (
            "number".to_owned(),
            CoordSpec::named("realization").with_direction(Direction::Increasing),
        ),
        // time
        (
            "time".to_owned(),
            CoordSpec::named("forecast_reference_time")
                .with_direction(Direction::Increasing),
        ),
        (
            "valid_time".to_owned(),
            CoordSpec::named("time").with_direction(Direction::Increasing),
        ),
        (
            "step".to_owned(),
            CoordSpec::named("leadtime").with_direction(Direction::Increasing),
        ),
        (
            "forecastMonth".to_owned(),
            CoordSpec::named("leadtime_month").with_direction(Direction::Increasing),
        ),
    ])
}

/// The ECMWF flavour: vertical coordinates collapse onto `level`.
pub fn ecmwf_model() -> CoordModel {
    BTreeMap::from([
        (
            "depthBelowLand".to_owned(),
            CoordSpec::named("level")
                .with_units("m")
                .with_direction(Direction::Increasing),
        ),
        (
            "isobaricInhPa".to_owned(),
            CoordSpec::named("level")
                .with_units("hPa")
                .with_direction(Direction::Decreasing),
        ),
        (
            "isobaricInPa".to_owned(),
            CoordSpec::named("level")
                .with_units("hPa")
                .with_direction(Direction::Decreasing),
        ),
        (
            "hybrid".to_owned(),
            CoordSpec::named("level").with_direction(Direction::Increasing),
        ),
    ])
}

fn attr<'a>(variable: &'a Variable, name: &str) -> Option<&'a str> {
    variable.attributes.get(name).and_then(AttrValue::as_str)
}

struct CoordTranslator {
    cf_type: &'static str,
    out_name: &'static str,
    units: &'static str,
    direction: Direction,
    matches: fn(&str, &Variable) -> bool,
}

/// Translator table. The run order matters: the reference time is
/// renamed away before `valid_time` may take the plain `time` name.
const COORD_TRANSLATORS: [CoordTranslator; 11] = [
    CoordTranslator {
        cf_type: "latitude",
        out_name: "latitude",
        units: "degrees_north",
        direction: Direction::Decreasing,
        matches: |_, variable| {
            attr(variable, "units").map_or(false, |u| VALID_LAT_UNITS.contains(&u))
        },
    },
    CoordTranslator {
        cf_type: "longitude",
        out_name: "longitude",
        units: "degrees_east",
        direction: Direction::Increasing,
        matches: |_, variable| {
            attr(variable, "units").map_or(false, |u| VALID_LON_UNITS.contains(&u))
        },
    },
    CoordTranslator {
        cf_type: "time",
        out_name: "time",
        units: TIME_CF_UNITS,
        direction: Direction::Increasing,
        matches: |_, variable| {
            attr(variable, "standard_name") == Some("forecast_reference_time")
                && attr(variable, "long_name") != Some("nominal initial time of forecast")
        },
    },
    CoordTranslator {
        cf_type: "indexing_time",
        out_name: "indexing_time",
        units: TIME_CF_UNITS,
        direction: Direction::Increasing,
        matches: |_, variable| {
            attr(variable, "standard_name") == Some("forecast_reference_time")
                && attr(variable, "long_name") == Some("nominal initial time of forecast")
        },
    },
    CoordTranslator {
        cf_type: "step",
        out_name: "step",
        units: "hours",
        direction: Direction::Increasing,
        matches: |_, variable| attr(variable, "standard_name") == Some("forecast_period"),
    },
    CoordTranslator {
        cf_type: "valid_time",
        out_name: "valid_time",
        units: TIME_CF_UNITS,
        direction: Direction::Increasing,
        matches: |name, variable| {
            attr(variable, "standard_name") == Some("time") && name != "verifying_time"
        },
    },
    CoordTranslator {
        cf_type: "verifying_time",
        out_name: "verifying_time",
        units: TIME_CF_UNITS,
        direction: Direction::Increasing,
        matches: |name, variable| {
            attr(variable, "standard_name") == Some("time") && name == "verifying_time"
        },
    },
    CoordTranslator {
        cf_type: "depthBelowLand",
        out_name: "depthBelowLand",
        units: "m",
        direction: Direction::Decreasing,
        matches: |_, variable| attr(variable, "standard_name") == Some("depth"),
    },
    CoordTranslator {
        cf_type: "isobaricInhPa",
        out_name: "isobaricInhPa",
        units: "hPa",
        direction: Direction::Decreasing,
        matches: |_, variable| {
            attr(variable, "units").map_or(false, |u| units::are_convertible(u, "Pa"))
        },
    },
    CoordTranslator {
        cf_type: "number",
        out_name: "number",
        units: "1",
        direction: Direction::Increasing,
        matches: |_, variable| attr(variable, "standard_name") == Some("realization"),
    },
    CoordTranslator {
        cf_type: "forecastMonth",
        out_name: "forecastMonth",
        units: "1",
        direction: Direction::Increasing,
        matches: |_, variable| {
            attr(variable, "long_name") == Some("months since forecast_reference_time")
        },
    },
];

impl CoordTranslator {
    /// Applies one translation to a copy of the dataset; the caller
    /// keeps the original when anything fails.
    fn apply(&self, mut data: Dataset, coord_model: &CoordModel) -> Result<Dataset, TranslationError> {
        let spec = coord_model.get(self.cf_type);
        let out_name = spec
            .and_then(|s| s.out_name.as_deref())
            .unwrap_or(self.out_name);
        let target_units = spec.and_then(|s| s.units.as_deref()).unwrap_or(self.units);
        let direction = spec
            .and_then(|s| s.stored_direction)
            .unwrap_or(self.direction);

        let coords = data.coordinate_names();
        let matched: Vec<&String> = coords
            .iter()
            .filter(|name| {
                data.variables
                    .get(name.as_str())
                    .map_or(false, |variable| (self.matches)(name, variable))
            })
            .collect();
        if matched.len() > 1 {
            return Err(TranslationError::AmbiguousCoord(self.cf_type.to_owned()));
        }
        let matched = match matched.first() {
            Some(name) => (*name).clone(),
            None => return Ok(data),
        };

        for name in &coords {
            if name == out_name && *name != matched {
                return Err(TranslationError::NameCollision(name.clone()));
            }
        }

        data.rename(&matched, out_name);

        if let Some(variable) = data.variables.get_mut(out_name) {
            if let Some(source_units) = attr(variable, "units").map(str::to_owned) {
                let factor = units::conversion_factor(&source_units, target_units)?;
                if factor != 1.0 {
                    if let ArrayData::Dense(values) = &mut variable.data {
                        values.mapv_inplace(|v| v * factor);
                    }
                }
                variable
                    .attributes
                    .insert("units".to_owned(), AttrValue::from(target_units));
            }
        }

        if data.dimensions.contains_key(out_name) {
            translate_coord_direction(&mut data, out_name, direction);
        }

        Ok(data)
    }
}

/// Reverses the whole dataset along a coordinate's dimension when
/// its first and last values disagree with the target direction.
fn translate_coord_direction(data: &mut Dataset, coord_name: &str, direction: Direction) {
    let values = match data
        .variables
        .get(coord_name)
        .and_then(|variable| variable.data.as_dense())
    {
        Some(values) if values.ndim() > 0 && values.len() > 1 => values,
        _ => return,
    };
    let first = values[[0]];
    let last = values[[values.len() - 1]];

    let reverse = (first < last && direction == Direction::Decreasing)
        || (first > last && direction == Direction::Increasing);
    if reverse {
        data.reverse_dim(coord_name);
    }
}

/// Translates every well-known coordinate of the dataset to the
/// target model. Per-coordinate failures follow the error policy.
pub fn translate_coords(
    data: Dataset,
    coord_model: &CoordModel,
    errors: ErrorPolicy,
) -> Result<Dataset, TranslationError> {
    let mut data = data;
    for translator in &COORD_TRANSLATORS {
        match translator.apply(data.clone(), coord_model) {
            Ok(translated) => data = translated,
            Err(err) => match errors {
                ErrorPolicy::Raise => return Err(err),
                ErrorPolicy::Ignore => {}
                ErrorPolicy::Warn => warn!(
                    "error while translating coordinate {:?}: {}",
                    translator.cf_type, err
                ),
            },
        }
    }
    Ok(data)
}
