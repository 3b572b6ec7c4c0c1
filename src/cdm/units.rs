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

//! Module with pure conversions between commensurable units.
//!
//! Two equivalence classes are known: pressure and length. Equal
//! unit spellings always convert with factor one, whatever the
//! class.

use crate::errors::ConversionError;

const PRESSURE_CONVERSION_RULES: [(&[&str], f64); 5] = [
    (&["Pa", "pascal", "pascals"], 1.0),
    (
        &[
            "hPa",
            "hectopascal",
            "hectopascals",
            "hpascal",
            "millibar",
            "millibars",
            "mbar",
        ],
        100.0,
    ),
    (&["decibar", "dbar"], 10_000.0),
    (&["bar", "bars"], 100_000.0),
    (&["atmosphere", "atmospheres", "atm"], 101_325.0),
];

const LENGTH_CONVERSION_RULES: [(&[&str], f64); 3] = [
    (&["m", "meter", "meters"], 1.0),
    (&["cm", "centimeter", "centimeters"], 0.01),
    (&["km", "kilometer", "kilometers"], 1000.0),
];

fn class_factor(units: &str, rules: &[(&[&str], f64)]) -> Option<f64> {
    rules
        .iter()
        .find(|(spellings, _)| spellings.contains(&units))
        .map(|&(_, factor)| factor)
}

/// Multiplier taking a value from `from` units to `to` units.
pub fn conversion_factor(from: &str, to: &str) -> Result<f64, ConversionError> {
    if from == to {
        return Ok(1.0);
    }
    for rules in [
        &PRESSURE_CONVERSION_RULES[..],
        &LENGTH_CONVERSION_RULES[..],
    ] {
        if let (Some(from_factor), Some(to_factor)) =
            (class_factor(from, rules), class_factor(to, rules))
        {
            return Ok(from_factor / to_factor);
        }
    }
    Err(ConversionError::Incompatible {
        from: from.to_owned(),
        to: to.to_owned(),
    })
}

/// Converts a value between commensurable units.
pub fn convert(value: f64, from: &str, to: &str) -> Result<f64, ConversionError> {
    Ok(value * conversion_factor(from, to)?)
}

/// Whether a conversion between the two units would succeed.
pub fn are_convertible(from: &str, to: &str) -> bool {
    conversion_factor(from, to).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn pressure_conversions() {
        assert_eq!(convert(1.0, "hPa", "Pa").unwrap(), 100.0);
        assert_eq!(convert(1.0, "mbar", "hPa").unwrap(), 1.0);
        assert_approx_eq!(f64, convert(1.0, "atm", "Pa").unwrap(), 101_325.0);
    }

    #[test]
    fn length_conversions() {
        assert_eq!(convert(1.0, "km", "cm").unwrap(), 100_000.0);
        assert_eq!(convert(250.0, "cm", "m").unwrap(), 2.5);
    }

    #[test]
    fn disjoint_classes_are_incompatible() {
        assert!(matches!(
            convert(1.0, "Pa", "km"),
            Err(ConversionError::Incompatible { .. })
        ));
        assert!(!are_convertible("hPa", "m"));
        assert!(are_convertible("hPa", "bar"));
    }

    #[test]
    fn equal_spellings_always_convert() {
        assert_eq!(convert(42.0, "hours", "hours").unwrap(), 42.0);
    }

    #[test]
    fn conversions_round_trip() {
        for (from, to) in [("hPa", "Pa"), ("bar", "atm"), ("km", "cm")] {
            let there = convert(3.0, from, to).unwrap();
            assert_approx_eq!(f64, convert(there, to, from).unwrap(), 3.0, ulps = 2);
        }
    }
}
