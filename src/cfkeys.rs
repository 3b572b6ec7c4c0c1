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

//! Module with the CF-level computed keys layered over raw GRIB
//! messages, and the date/time and step codecs behind them.
//!
//! Computed keys are virtual message attributes derived from other
//! keys. Times are expressed in seconds since 1970-01-01T00:00:00
//! and steps in hours.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use ndarray::{ArrayD, IxDyn};

use crate::errors::DecodeError;
use crate::message::Message;
use crate::source::KeyValue;

/// Seconds per step unit, indexed by the GRIB `stepUnits` code.
/// Codes 3..=9 are reserved in the WMO table and unsupported.
pub const GRIB_STEP_UNITS_TO_SECONDS: [Option<i64>; 16] = [
    Some(60),
    Some(3600),
    Some(86400),
    None,
    None,
    None,
    None,
    None,
    None,
    None,
    Some(10800),
    Some(21600),
    Some(43200),
    Some(1),
    Some(900),
    Some(1800),
];

pub type ComputedGetter = fn(&Message) -> Result<KeyValue, DecodeError>;
pub type ComputedSetter = fn(&mut Message, &KeyValue) -> Result<(), DecodeError>;

/// Names of the computed keys, in iteration order.
pub const COMPUTED_KEYS: [&str; 5] = [
    "time",
    "step",
    "valid_time",
    "verifying_time",
    "indexing_time",
];

pub fn is_computed(key: &str) -> bool {
    COMPUTED_KEYS.contains(&key)
}

pub fn computed_getter(key: &str) -> Option<ComputedGetter> {
    match key {
        "time" => Some(|message| {
            from_grib_date_time(message, "dataDate", "dataTime").map(KeyValue::Int)
        }),
        "step" => Some(|message| from_grib_step(message).map(KeyValue::Float)),
        "valid_time" => Some(|message| {
            from_grib_date_time(message, "validityDate", "validityTime").map(KeyValue::Int)
        }),
        "verifying_time" => Some(|message| {
            from_grib_month(message, "verifyingMonth").map(KeyValue::Int)
        }),
        "indexing_time" => Some(|message| {
            from_grib_date_time(message, "indexingDate", "indexingTime").map(KeyValue::Int)
        }),
        _ => None,
    }
}

pub fn computed_setter(key: &str) -> Option<ComputedSetter> {
    match key {
        "time" => Some(|message, value| {
            to_grib_date_time(message, seconds_of(key_num(value)?), "dataDate", "dataTime")
        }),
        "step" => Some(|message, value| to_grib_step(message, key_num(value)?)),
        "valid_time" => Some(|message, value| {
            to_grib_date_time(
                message,
                seconds_of(key_num(value)?),
                "validityDate",
                "validityTime",
            )
        }),
        "indexing_time" => Some(|message, value| {
            to_grib_date_time(
                message,
                seconds_of(key_num(value)?),
                "indexingDate",
                "indexingTime",
            )
        }),
        _ => None,
    }
}

fn key_num(value: &KeyValue) -> Result<f64, DecodeError> {
    value.as_float().ok_or(DecodeError::TypeMismatch {
        key: String::new(),
        expected: "float",
        found: value.kind_name(),
    })
}

fn seconds_of(value: f64) -> i64 {
    value as i64
}

fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("Unix epoch is a valid datetime")
}

/// Decodes the packed `YYYYMMDD` and `HHMM` integers under the two
/// given keys into seconds since the Unix epoch.
pub fn from_grib_date_time(
    message: &Message,
    date_key: &str,
    time_key: &str,
) -> Result<i64, DecodeError> {
    let date = message.get_int(date_key)?;
    let time = message.get_int(time_key)?;
    decode_date_time(date, time)
}

fn decode_date_time(date: i64, time: i64) -> Result<i64, DecodeError> {
    if date < 0 || time < 0 {
        return Err(DecodeError::InvalidDate(date));
    }
    let hour = time / 100;
    let minute = time % 100;
    let year = date / 10000;
    let month = date / 100 % 100;
    let day = date % 100;

    let datetime = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|d| d.and_hms_opt(hour as u32, minute as u32, 0))
        .ok_or(DecodeError::InvalidDate(date))?;

    Ok(datetime.signed_duration_since(epoch()).num_seconds())
}

/// Writes seconds since the Unix epoch back as packed `YYYYMMDD`
/// and `HHMM` integers under the two given keys.
pub fn to_grib_date_time(
    message: &mut Message,
    seconds: i64,
    date_key: &str,
    time_key: &str,
) -> Result<(), DecodeError> {
    let datetime = epoch() + Duration::seconds(seconds);
    let date = datetime.year() as i64 * 10000
        + i64::from(datetime.month()) * 100
        + i64::from(datetime.day());
    let time = i64::from(datetime.hour()) * 100 + i64::from(datetime.minute());

    message.set(date_key, KeyValue::Int(date))?;
    message.set(time_key, KeyValue::Int(time))?;
    Ok(())
}

/// Seconds per unit for a `stepUnits` code.
pub fn step_unit_seconds(code: i64) -> Result<i64, DecodeError> {
    usize::try_from(code)
        .ok()
        .and_then(|i| GRIB_STEP_UNITS_TO_SECONDS.get(i).copied())
        .flatten()
        .ok_or(DecodeError::UnsupportedStepUnit(code))
}

/// Decodes `endStep` scaled by `stepUnits` into hours.
pub fn from_grib_step(message: &Message) -> Result<f64, DecodeError> {
    let to_seconds = step_unit_seconds(message.get_int("stepUnits")?)?;
    let step = message.get_int("endStep")?;
    Ok(step as f64 * to_seconds as f64 / 3600.0)
}

/// Writes a step in hours back as `endStep` with `stepUnits` set
/// to the hour code.
pub fn to_grib_step(message: &mut Message, hours: f64) -> Result<(), DecodeError> {
    message.set("endStep", KeyValue::Int(hours.round() as i64))?;
    message.set("stepUnits", KeyValue::Int(1))?;
    Ok(())
}

/// Decodes a packed `YYYYMM` month key into seconds since the Unix
/// epoch at the first of that month.
pub fn from_grib_month(message: &Message, month_key: &str) -> Result<i64, DecodeError> {
    let date = message.get_int(month_key)?;
    if date < 0 {
        return Err(DecodeError::InvalidDate(date));
    }
    let year = date / 100;
    let month = date % 100;

    let datetime = NaiveDate::from_ymd_opt(year as i32, month as u32, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or(DecodeError::InvalidDate(date))?;

    Ok(datetime.signed_duration_since(epoch()).num_seconds())
}

/// Dimensions and data of the `valid_time` coordinate derived from
/// a reference time coordinate (seconds) and a step coordinate
/// (hours) by broadcast addition.
pub fn build_valid_time(
    time: &ArrayD<f64>,
    step: &ArrayD<f64>,
) -> (Vec<&'static str>, ArrayD<f64>) {
    let first = |array: &ArrayD<f64>| array.iter().next().copied().unwrap_or(f64::NAN);

    match (time.ndim(), step.ndim()) {
        (0, 0) => {
            let data = ArrayD::from_elem(IxDyn(&[]), first(time) + first(step) * 3600.0);
            (vec![], data)
        }
        (_, 0) => {
            let step_s = first(step) * 3600.0;
            (vec!["time"], time.mapv(|t| t + step_s))
        }
        (0, _) => {
            let time_s = first(time);
            (vec!["step"], step.mapv(|s| time_s + s * 3600.0))
        }
        (_, _) => {
            let times: Vec<f64> = time.iter().copied().collect();
            let steps: Vec<f64> = step.iter().copied().collect();
            let data = ArrayD::from_shape_fn(IxDyn(&[times.len(), steps.len()]), |idx| {
                times[idx[0]] + steps[idx[1]] * 3600.0
            });
            (vec!["time", "step"], data)
        }
    }
}
