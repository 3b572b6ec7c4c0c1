//! This is a module for integration tests of the crate, but with
//! access to private fields and methods.
//!
//! Most crate methods need a whole GRIB file behind them, so these
//! tests assemble synthetic files on the in-memory decoder backend
//! and walk the full path from stream to translated dataset.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::ArrayD;

use crate::cdm::{cds_model, translate_coords};
use crate::dataset::{
    open_datasets_with, open_file_with, ArrayIndex, AttrValue, Dataset, ReadOptions,
};
use crate::errors::{BuildError, ErrorPolicy};
use crate::index::HeaderValue;
use crate::source::memory::{MemoryDecoder, MemoryMessage};
use crate::source::KeyValue;

/// Seconds since the epoch at 2023-01-01T00:00:00.
const T0: f64 = 1_672_531_200.0;

/// A temperature message on a regular 2x2 lat-lon grid.
fn t_message(level: i64, values: Vec<f64>) -> MemoryMessage {
    MemoryMessage::new()
        .with("centre", KeyValue::Str("ecmf".to_owned()))
        .with(
            "centreDescription",
            KeyValue::Str("European Centre for Medium-Range Weather Forecasts".to_owned()),
        )
        .with("subCentre", KeyValue::Int(0))
        .with("paramId", KeyValue::Int(130))
        .with("shortName", KeyValue::Str("t".to_owned()))
        .with("cfVarName", KeyValue::Str("t".to_owned()))
        .with("cfName", KeyValue::Str("air_temperature".to_owned()))
        .with("name", KeyValue::Str("Temperature".to_owned()))
        .with("units", KeyValue::Str("K".to_owned()))
        .with("dataType", KeyValue::Str("an".to_owned()))
        .with("numberOfPoints", KeyValue::Int(4))
        .with("typeOfLevel", KeyValue::Str("isobaricInhPa".to_owned()))
        .with("stepUnits", KeyValue::Int(1))
        .with("stepType", KeyValue::Str("instant".to_owned()))
        .with("gridType", KeyValue::Str("regular_ll".to_owned()))
        .with("missingValue", KeyValue::Int(9999))
        .with("dataDate", KeyValue::Int(20230101))
        .with("dataTime", KeyValue::Int(0))
        .with("endStep", KeyValue::Int(0))
        .with("Ny", KeyValue::Int(2))
        .with("Nx", KeyValue::Int(2))
        .with("distinctLatitudes", KeyValue::FloatArray(vec![10.0, 0.0]))
        .with("distinctLongitudes", KeyValue::FloatArray(vec![0.0, 10.0]))
        .with("level", KeyValue::Int(level))
        .with("values", KeyValue::FloatArray(values))
}

fn open_synthetic(messages: Vec<MemoryMessage>, options: &ReadOptions) -> Dataset {
    try_open_synthetic(messages, options).expect("dataset builds")
}

fn try_open_synthetic(
    messages: Vec<MemoryMessage>,
    options: &ReadOptions,
) -> Result<Dataset, BuildError> {
    let decoder = MemoryDecoder::new();
    decoder.add_file("/synthetic/test.grib", messages);
    open_file_with(Arc::new(decoder), "/synthetic/test.grib", options)
}

fn memory_options() -> ReadOptions {
    ReadOptions {
        indexpath: String::new(),
        errors: ErrorPolicy::Raise,
        ..ReadOptions::default()
    }
}

fn field(dataset: &Dataset, name: &str, item: &[ArrayIndex]) -> ArrayD<f64> {
    dataset.variables[name]
        .data
        .index(item)
        .expect("selection decodes")
}

#[test]
fn two_levels_make_one_vertical_dimension() {
    let dataset = open_synthetic(
        vec![
            t_message(500, vec![1.0, 2.0, 3.0, 4.0]),
            t_message(1000, vec![5.0, 6.0, 7.0, 8.0]),
        ],
        &memory_options(),
    );

    assert_eq!(
        dataset.dimensions,
        BTreeMap::from([
            ("isobaricInhPa".to_owned(), 2),
            ("latitude".to_owned(), 2),
            ("longitude".to_owned(), 2),
        ])
    );

    let t = &dataset.variables["t"];
    assert_eq!(t.dimensions, vec!["isobaricInhPa", "latitude", "longitude"]);
    assert_eq!(t.data.shape(), &[2, 2, 2]);

    // Pressure levels are stored in decreasing order.
    let isobaric = dataset.variables["isobaricInhPa"].data.as_dense().unwrap();
    assert_eq!(isobaric.as_slice().unwrap(), &[1000.0, 500.0]);

    // The first level therefore holds the level=1000 field.
    let top = field(
        &dataset,
        "t",
        &[ArrayIndex::Int(0), ArrayIndex::all(), ArrayIndex::all()],
    );
    assert_eq!(top.as_slice().unwrap(), &[5.0, 6.0, 7.0, 8.0]);

    // Squeezed header coordinates survive as scalar coordinates.
    assert_eq!(dataset.variables["time"].data.ndim(), 0);
    assert_eq!(dataset.variables["step"].data.ndim(), 0);
    assert!(!dataset.variables.contains_key("number"));

    // CF parameter attributes come from the GRIB attributes.
    assert_eq!(
        t.attributes.get("standard_name"),
        Some(&AttrValue::from("air_temperature"))
    );
    assert_eq!(t.attributes.get("units"), Some(&AttrValue::from("K")));

    // Global attributes.
    assert_eq!(
        dataset.attributes.get("Conventions"),
        Some(&AttrValue::from("CF-1.7"))
    );
    assert_eq!(
        dataset.attributes.get("institution"),
        Some(&AttrValue::from(
            "European Centre for Medium-Range Weather Forecasts"
        ))
    );
}

#[test]
fn a_single_message_squeezes_all_header_dimensions() {
    let dataset = open_synthetic(
        vec![t_message(500, vec![1.0, 2.0, 3.0, 4.0])],
        &memory_options(),
    );
    assert_eq!(
        dataset.dimensions,
        BTreeMap::from([("latitude".to_owned(), 2), ("longitude".to_owned(), 2)])
    );
    assert_eq!(dataset.variables["isobaricInhPa"].data.ndim(), 0);

    let unsqueezed = open_synthetic(
        vec![t_message(500, vec![1.0, 2.0, 3.0, 4.0])],
        &ReadOptions {
            squeeze: false,
            ..memory_options()
        },
    );
    assert_eq!(unsqueezed.dimensions.get("isobaricInhPa"), Some(&1));
    assert_eq!(unsqueezed.dimensions.get("time"), Some(&1));
    assert_eq!(
        unsqueezed.variables["t"].dimensions,
        vec!["time", "step", "isobaricInhPa", "latitude", "longitude"]
    );
}

#[test]
fn conflicting_step_types_split_into_datasets() {
    let messages = vec![
        t_message(500, vec![1.0, 2.0, 3.0, 4.0]),
        t_message(500, vec![5.0, 6.0, 7.0, 8.0])
            .with("stepType", KeyValue::Str("accum".to_owned())),
    ];

    let err = try_open_synthetic(messages.clone(), &memory_options()).unwrap_err();
    match err {
        BuildError::AmbiguousVariable { key, candidates } => {
            assert_eq!(key, "stepType");
            let values: Vec<_> = candidates
                .iter()
                .map(|fbk| fbk.get("stepType").cloned().unwrap())
                .collect();
            assert_eq!(
                values,
                vec![HeaderValue::from("instant"), HeaderValue::from("accum")]
            );
        }
        other => panic!("expected an ambiguity, got {:?}", other),
    }

    let decoder = MemoryDecoder::new();
    decoder.add_file("/synthetic/test.grib", messages);
    let datasets = open_datasets_with(
        Arc::new(decoder),
        "/synthetic/test.grib",
        &memory_options(),
    )
    .unwrap();
    assert_eq!(datasets.len(), 2);
    for dataset in &datasets {
        assert!(dataset.variables.contains_key("t"));
        assert!(dataset.encoding.filter_by_keys.contains_key("stepType"));
    }
}

#[test]
fn valid_time_broadcasts_over_time_and_step() {
    let mut messages = Vec::new();
    for (date, base) in [(20230101, 0.0), (20230102, 10.0)] {
        for (step, bump) in [(0, 0.0), (12, 1.0)] {
            messages.push(
                t_message(500, vec![base + bump; 4])
                    .with("dataDate", KeyValue::Int(date))
                    .with("endStep", KeyValue::Int(step)),
            );
        }
    }
    let dataset = open_synthetic(messages, &memory_options());

    let t = &dataset.variables["t"];
    assert_eq!(t.dimensions, vec!["time", "step", "latitude", "longitude"]);

    let valid_time = &dataset.variables["valid_time"];
    assert_eq!(valid_time.dimensions, vec!["time", "step"]);
    let values = valid_time.data.as_dense().unwrap();
    assert_eq!(values[[0, 0]], T0);
    assert_eq!(values[[0, 1]], T0 + 43_200.0);
    assert_eq!(values[[1, 0]], T0 + 86_400.0);
    assert_eq!(values[[1, 1]], T0 + 129_600.0);

    // The hypercube decodes back to the per-message fields.
    let slab = field(
        &dataset,
        "t",
        &[
            ArrayIndex::Int(1),
            ArrayIndex::Int(1),
            ArrayIndex::all(),
            ArrayIndex::all(),
        ],
    );
    assert_eq!(slab.as_slice().unwrap(), &[11.0, 11.0, 11.0, 11.0]);
}

#[test]
fn missing_value_cells_materialise_as_nan() {
    let dataset = open_synthetic(
        vec![t_message(500, vec![1.0, 9999.0, 3.0, 4.0])],
        &memory_options(),
    );
    let values = field(&dataset, "t", &[ArrayIndex::all(), ArrayIndex::all()]);
    assert_eq!(values[[0, 0]], 1.0);
    assert!(values[[0, 1]].is_nan());
}

#[test]
fn caller_filters_are_kept_in_the_encoding() {
    let options = ReadOptions {
        filter_by_keys: BTreeMap::from([("paramId".to_owned(), HeaderValue::Int(130))]),
        ..memory_options()
    };
    let dataset = open_synthetic(vec![t_message(500, vec![1.0, 2.0, 3.0, 4.0])], &options);

    assert_eq!(
        dataset.encoding.filter_by_keys.get("paramId"),
        Some(&HeaderValue::Int(130))
    );
    assert_eq!(
        dataset.encoding.source,
        std::path::Path::new("/synthetic/test.grib")
    );
}

#[test]
fn cds_translation_reverses_latitude_and_the_lazy_data_with_it() {
    let dataset = open_synthetic(
        vec![
            t_message(500, vec![1.0, 2.0, 3.0, 4.0]),
            t_message(1000, vec![5.0, 6.0, 7.0, 8.0]),
        ],
        &memory_options(),
    );

    let translated = translate_coords(dataset, &cds_model(), ErrorPolicy::Raise).unwrap();

    assert!(translated.variables.contains_key("lat"));
    assert!(translated.variables.contains_key("plev"));
    let lat = translated.variables["lat"].data.as_dense().unwrap();
    assert_eq!(lat.iter().copied().collect::<Vec<_>>(), vec![0.0, 10.0]);

    // The lazy data array follows the axis reversal: the first
    // latitude row now holds the southern gridpoints.
    let t = &translated.variables["t"];
    assert_eq!(t.dimensions, vec!["plev", "lat", "longitude"]);
    let values = t.data.build_array().unwrap();
    assert_eq!(values[[0, 0, 0]], 7.0);
    assert_eq!(values[[0, 1, 0]], 5.0);

    // Pressure is in pascals, decreasing.
    let plev = translated.variables["plev"].data.as_dense().unwrap();
    assert_eq!(plev.as_slice().unwrap(), &[100_000.0, 50_000.0]);

    // Translating a second time changes nothing.
    let again = translate_coords(translated.clone(), &cds_model(), ErrorPolicy::Raise).unwrap();
    assert_eq!(translated, again);
}

#[test]
fn time_dims_outside_the_reference_set_are_refused() {
    let err = try_open_synthetic(
        vec![t_message(500, vec![1.0, 2.0, 3.0, 4.0])],
        &ReadOptions {
            time_dims: vec!["time".to_owned(), "weekday".to_owned()],
            ..memory_options()
        },
    )
    .unwrap_err();
    assert!(matches!(err, BuildError::IllegalTimeDims(_)));
}

#[test]
fn extra_coordinates_follow_their_dimension() {
    let messages = vec![
        t_message(500, vec![1.0; 4]).with("experimentVersionNumber", KeyValue::Int(1)),
        t_message(1000, vec![2.0; 4]).with("experimentVersionNumber", KeyValue::Int(1)),
    ];
    let options = ReadOptions {
        extra_coords: BTreeMap::from([(
            "experimentVersionNumber".to_owned(),
            "isobaricInhPa".to_owned(),
        )]),
        ..memory_options()
    };
    let dataset = open_synthetic(messages, &options);
    let extra = &dataset.variables["experimentVersionNumber"];
    assert_eq!(extra.dimensions, vec!["isobaricInhPa"]);
    assert_eq!(
        extra.data.as_dense().unwrap().as_slice().unwrap(),
        &[1.0, 1.0]
    );
}

#[test]
fn inconsistent_extra_coordinates_are_refused() {
    let messages = vec![
        t_message(500, vec![1.0; 4]).with("experimentVersionNumber", KeyValue::Int(1)),
        t_message(500, vec![2.0; 4])
            .with("dataDate", KeyValue::Int(20230102))
            .with("experimentVersionNumber", KeyValue::Int(2)),
    ];
    let options = ReadOptions {
        extra_coords: BTreeMap::from([(
            "experimentVersionNumber".to_owned(),
            "time".to_owned(),
        )]),
        ..memory_options()
    };
    // The extra coordinate is constant per time value here, so it passes.
    let dataset = try_open_synthetic(messages, &options).unwrap();
    assert_eq!(
        dataset.variables["experimentVersionNumber"]
            .data
            .as_dense()
            .unwrap()
            .as_slice()
            .unwrap(),
        &[1.0, 2.0]
    );

    let conflicting = vec![
        t_message(500, vec![1.0; 4]).with("experimentVersionNumber", KeyValue::Int(1)),
        t_message(500, vec![2.0; 4])
            .with("dataDate", KeyValue::Int(20230102))
            .with("experimentVersionNumber", KeyValue::Int(2)),
        t_message(1000, vec![3.0; 4]).with("experimentVersionNumber", KeyValue::Int(3)),
    ];
    let options = ReadOptions {
        extra_coords: BTreeMap::from([(
            "experimentVersionNumber".to_owned(),
            "time".to_owned(),
        )]),
        ..memory_options()
    };
    let err = try_open_synthetic(conflicting, &options).unwrap_err();
    assert!(matches!(err, BuildError::InconsistentExtraCoord { .. }));
}

#[test]
fn generic_grids_keep_a_flat_point_dimension() {
    let messages = vec![t_message(500, vec![1.0, 2.0, 3.0, 4.0])
        .with("gridType", KeyValue::Str("reduced_gg".to_owned()))
        .with(
            "latitudes",
            KeyValue::FloatArray(vec![10.0, 10.0, 0.0, 0.0]),
        )
        .with(
            "longitudes",
            KeyValue::FloatArray(vec![0.0, 10.0, 0.0, 10.0]),
        )];
    let dataset = open_synthetic(messages, &memory_options());

    assert_eq!(dataset.dimensions.get("values"), Some(&4));
    assert_eq!(dataset.variables["t"].dimensions, vec!["values"]);
    assert_eq!(dataset.variables["latitude"].dimensions, vec!["values"]);
}
