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

//! Module containing the GRIB key tables and CF attribute tables
//! used when indexing files and assembling datasets.
//!
//! The edition-independent keys live in ecCodes namespaces, see
//! <https://software.ecmwf.int/wiki/display/ECC/GRIB%3A+Namespaces>.

/// Keys expected to be constant across a whole file.
pub const GLOBAL_ATTRIBUTES_KEYS: [&str; 3] = ["centre", "centreDescription", "subCentre"];

/// Keys expected to be constant across all messages of one variable.
pub const DATA_ATTRIBUTES_KEYS: [&str; 7] = [
    "paramId",
    "dataType",
    "numberOfPoints",
    "typeOfLevel",
    "stepUnits",
    "stepType",
    "gridType",
];

/// Descriptive keys read best-effort from the first message of a
/// variable.
pub const EXTRA_DATA_ATTRIBUTES_KEYS: [&str; 11] = [
    "shortName",
    "units",
    "name",
    "cfName",
    "cfVarName",
    "missingValue",
    "totalNumber",
    "numberOfDirections",
    "numberOfFrequencies",
    "NV",
    "gridDefinitionDescription",
];

pub const ENSEMBLE_KEYS: [&str; 1] = ["number"];
pub const VERTICAL_KEYS: [&str; 1] = ["level:float"];

/// Raw GRIB time keys, used when CF time encoding is off.
pub const DATA_TIME_KEYS: [&str; 3] = ["dataDate", "dataTime", "endStep"];

/// Reference-time coordinate keys a caller may request as time
/// dimensions.
pub const ALL_REF_TIME_KEYS: [&str; 6] = [
    "time",
    "step",
    "valid_time",
    "verifying_time",
    "forecastMonth",
    "indexing_time",
];

pub const SPECTRA_KEYS: [&str; 2] = ["directionNumber", "frequencyNumber"];

/// Default index keys: the sorted union of the global, data,
/// raw-time and header-dimension keys.
pub const INDEX_KEYS: [&str; 17] = [
    "centre",
    "centreDescription",
    "dataDate",
    "dataTime",
    "dataType",
    "directionNumber",
    "endStep",
    "frequencyNumber",
    "gridType",
    "level:float",
    "number",
    "numberOfPoints",
    "paramId",
    "stepType",
    "stepUnits",
    "subCentre",
    "typeOfLevel",
];

/// Grid types whose latitudes and longitudes are 1-D dimension
/// coordinates.
pub const GRID_TYPES_DIMENSION_COORDS: [&str; 2] = ["regular_ll", "regular_gg"];

/// Grid types whose latitudes and longitudes are 2-D auxiliary
/// coordinates over `(y, x)`.
pub const GRID_TYPES_2D_NON_DIMENSION_COORDS: [&str; 6] = [
    "rotated_ll",
    "rotated_gg",
    "lambert",
    "lambert_azimuthal_equal_area",
    "albers",
    "polar_stereographic",
];

/// Grid geometry keys per grid type, attached as `GRIB_` attributes.
pub fn grid_type_keys(grid_type: &str) -> &'static [&'static str] {
    match grid_type {
        "regular_ll" => &[
            "Nx",
            "iDirectionIncrementInDegrees",
            "iScansNegatively",
            "longitudeOfFirstGridPointInDegrees",
            "longitudeOfLastGridPointInDegrees",
            "Ny",
            "jDirectionIncrementInDegrees",
            "jPointsAreConsecutive",
            "jScansPositively",
            "latitudeOfFirstGridPointInDegrees",
            "latitudeOfLastGridPointInDegrees",
        ],
        "rotated_ll" => &[
            "Nx",
            "Ny",
            "angleOfRotationInDegrees",
            "iDirectionIncrementInDegrees",
            "iScansNegatively",
            "jDirectionIncrementInDegrees",
            "jPointsAreConsecutive",
            "jScansPositively",
            "latitudeOfFirstGridPointInDegrees",
            "latitudeOfLastGridPointInDegrees",
            "latitudeOfSouthernPoleInDegrees",
            "longitudeOfFirstGridPointInDegrees",
            "longitudeOfLastGridPointInDegrees",
            "longitudeOfSouthernPoleInDegrees",
        ],
        "reduced_ll" => &[
            "Ny",
            "jDirectionIncrementInDegrees",
            "jPointsAreConsecutive",
            "jScansPositively",
            "latitudeOfFirstGridPointInDegrees",
            "latitudeOfLastGridPointInDegrees",
        ],
        "regular_gg" => &[
            "Nx",
            "iDirectionIncrementInDegrees",
            "iScansNegatively",
            "longitudeOfFirstGridPointInDegrees",
            "longitudeOfLastGridPointInDegrees",
            "N",
            "Ny",
        ],
        "rotated_gg" => &[
            "Nx",
            "Ny",
            "angleOfRotationInDegrees",
            "iDirectionIncrementInDegrees",
            "iScansNegatively",
            "jPointsAreConsecutive",
            "jScansPositively",
            "latitudeOfFirstGridPointInDegrees",
            "latitudeOfLastGridPointInDegrees",
            "latitudeOfSouthernPoleInDegrees",
            "longitudeOfFirstGridPointInDegrees",
            "longitudeOfLastGridPointInDegrees",
            "longitudeOfSouthernPoleInDegrees",
            "N",
        ],
        "lambert" => &[
            "LaDInDegrees",
            "LoVInDegrees",
            "iScansNegatively",
            "jPointsAreConsecutive",
            "jScansPositively",
            "latitudeOfFirstGridPointInDegrees",
            "latitudeOfSouthernPoleInDegrees",
            "longitudeOfFirstGridPointInDegrees",
            "longitudeOfSouthernPoleInDegrees",
            "DyInMetres",
            "DxInMetres",
            "Latin2InDegrees",
            "Latin1InDegrees",
            "Ny",
            "Nx",
        ],
        "reduced_gg" => &["N", "pl"],
        "sh" => &["M", "K", "J"],
        _ => &[],
    }
}

/// CF attributes of the well-known coordinates, including the
/// stored direction where one is conventional.
pub fn coord_attrs(coord_name: &str) -> &'static [(&'static str, &'static str)] {
    match coord_name {
        // geography
        "latitude" => &[
            ("units", "degrees_north"),
            ("standard_name", "latitude"),
            ("long_name", "latitude"),
        ],
        "longitude" => &[
            ("units", "degrees_east"),
            ("standard_name", "longitude"),
            ("long_name", "longitude"),
        ],
        // vertical
        "depthBelowLand" | "depthBelowLandLayer" => &[
            ("units", "m"),
            ("positive", "down"),
            ("long_name", "soil depth"),
            ("standard_name", "depth"),
        ],
        "hybrid" => &[
            ("units", "1"),
            ("positive", "down"),
            ("long_name", "hybrid level"),
            ("standard_name", "atmosphere_hybrid_sigma_pressure_coordinate"),
        ],
        "heightAboveGround" => &[
            ("units", "m"),
            ("positive", "up"),
            ("long_name", "height above the surface"),
            ("standard_name", "height"),
        ],
        "isobaricInhPa" => &[
            ("units", "hPa"),
            ("positive", "down"),
            ("stored_direction", "decreasing"),
            ("standard_name", "air_pressure"),
            ("long_name", "pressure"),
        ],
        "isobaricInPa" => &[
            ("units", "Pa"),
            ("positive", "down"),
            ("stored_direction", "decreasing"),
            ("standard_name", "air_pressure"),
            ("long_name", "pressure"),
        ],
        "isobaricLayer" => &[
            ("units", "Pa"),
            ("positive", "down"),
            ("standard_name", "air_pressure"),
            ("long_name", "pressure"),
        ],
        // ensemble
        "number" => &[
            ("units", "1"),
            ("standard_name", "realization"),
            ("long_name", "ensemble member numerical id"),
        ],
        // time
        "step" => &[
            ("units", "hours"),
            ("standard_name", "forecast_period"),
            ("long_name", "time since forecast_reference_time"),
        ],
        "time" => &[
            ("units", "seconds since 1970-01-01T00:00:00"),
            ("calendar", "proleptic_gregorian"),
            ("standard_name", "forecast_reference_time"),
            ("long_name", "initial time of forecast"),
        ],
        "indexing_time" => &[
            ("units", "seconds since 1970-01-01T00:00:00"),
            ("calendar", "proleptic_gregorian"),
            ("standard_name", "forecast_reference_time"),
            ("long_name", "nominal initial time of forecast"),
        ],
        "valid_time" => &[
            ("units", "seconds since 1970-01-01T00:00:00"),
            ("calendar", "proleptic_gregorian"),
            ("standard_name", "time"),
            ("long_name", "time"),
        ],
        "verifying_time" => &[
            ("units", "seconds since 1970-01-01T00:00:00"),
            ("calendar", "proleptic_gregorian"),
            ("standard_name", "time"),
            ("long_name", "time"),
        ],
        "forecastMonth" => &[
            ("units", "1"),
            ("long_name", "months since forecast_reference_time"),
        ],
        _ => &[],
    }
}

/// Sentinel the decoder answers for missing double values.
pub const MISSING_DOUBLE: f64 = -1e100;

/// Sentinel the decoder answers for missing long values.
pub const MISSING_LONG: i64 = 2_147_483_647;

/// Historical fallback for the in-field missing value when the
/// `missingValue` attribute is absent.
pub const DEFAULT_MISSING_VALUE: f64 = 9999.0;
