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

//! Module with the read-mostly view over one GRIB message.
//!
//! The wrapper adds three things over a raw decoder handle: typed
//! access with `:int`, `:float` and `:str` key suffixes, the
//! computed-keys overlay from [`cfkeys`](crate::cfkeys), and the
//! error policy for key writes.

use log::warn;
use std::io::Write;

use crate::cfkeys;
use crate::errors::{DecodeError, ErrorPolicy};
use crate::source::{coerce_value, GribDecoder, KeyKind, KeyValue, MessageHandle};

/// Dictionary-like interface to the headers of one GRIB message.
#[derive(Debug)]
pub struct Message {
    handle: Box<dyn MessageHandle>,
    errors: ErrorPolicy,
}

/// Splits an optional forced-type suffix off a key name.
fn split_key(key: &str) -> Result<(&str, Option<KeyKind>), DecodeError> {
    match key.split_once(':') {
        None => Ok((key, None)),
        Some((base, "int")) => Ok((base, Some(KeyKind::Int))),
        Some((base, "float")) => Ok((base, Some(KeyKind::Float))),
        Some((base, "str")) => Ok((base, Some(KeyKind::Str))),
        Some((base, "bytes")) => Ok((base, Some(KeyKind::Bytes))),
        Some((_, suffix)) => Err(DecodeError::UnknownKeyType(suffix.to_owned())),
    }
}

/// Collapses singleton arrays to their only element, the way the
/// decoder presents scalar-valued keys.
fn collapse_singleton(value: KeyValue) -> KeyValue {
    match value {
        KeyValue::IntArray(v) if v.len() == 1 => KeyValue::Int(v[0]),
        KeyValue::FloatArray(v) if v.len() == 1 => KeyValue::Float(v[0]),
        value => value,
    }
}

impl Message {
    pub fn new(handle: Box<dyn MessageHandle>, errors: ErrorPolicy) -> Self {
        Message { handle, errors }
    }

    /// Builds a message from a decoder sample template.
    pub fn from_sample(
        decoder: &dyn GribDecoder,
        name: &str,
        errors: ErrorPolicy,
    ) -> Result<Self, DecodeError> {
        Ok(Message::new(decoder.from_sample(name)?, errors))
    }

    pub fn errors(&self) -> ErrorPolicy {
        self.errors
    }

    /// Value of a key as its native or forced type.
    ///
    /// Computed keys are looked up first, by their full name; the
    /// type suffix applies to raw decoder keys only.
    pub fn get(&self, key: &str) -> Result<KeyValue, DecodeError> {
        if let Some(getter) = cfkeys::computed_getter(key) {
            return getter(self);
        }
        let (base, kind) = split_key(key)?;
        let value = collapse_singleton(self.handle.get(base)?);
        match kind {
            Some(kind) => coerce_value(base, value, kind),
            None => Ok(value),
        }
    }

    /// Like [`get`](Message::get) but answers `default` when the
    /// key is absent from the message.
    pub fn get_or(&self, key: &str, default: KeyValue) -> Result<KeyValue, DecodeError> {
        match self.get(key) {
            Err(DecodeError::KeyNotFound(_)) => Ok(default),
            other => other,
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64, DecodeError> {
        let (base, _) = split_key(key)?;
        match coerce_value(base, self.get(key)?, KeyKind::Int)? {
            KeyValue::Int(v) => Ok(v),
            value => Err(DecodeError::TypeMismatch {
                key: key.to_owned(),
                expected: "int",
                found: value.kind_name(),
            }),
        }
    }

    pub fn get_float(&self, key: &str) -> Result<f64, DecodeError> {
        let (base, _) = split_key(key)?;
        match coerce_value(base, self.get(key)?, KeyKind::Float)? {
            KeyValue::Float(v) => Ok(v),
            value => Err(DecodeError::TypeMismatch {
                key: key.to_owned(),
                expected: "float",
                found: value.kind_name(),
            }),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<String, DecodeError> {
        let (base, _) = split_key(key)?;
        match coerce_value(base, self.get(key)?, KeyKind::Str)? {
            KeyValue::Str(v) => Ok(v),
            value => Err(DecodeError::TypeMismatch {
                key: key.to_owned(),
                expected: "str",
                found: value.kind_name(),
            }),
        }
    }

    /// Value of an array key as doubles; scalar keys answer a
    /// one-element vector.
    pub fn get_float_array(&self, key: &str) -> Result<Vec<f64>, DecodeError> {
        let (base, _) = split_key(key)?;
        let value = if cfkeys::is_computed(key) {
            self.get(key)?
        } else {
            self.handle.get(base)?
        };
        value.to_float_vec().ok_or(DecodeError::TypeMismatch {
            key: key.to_owned(),
            expected: "float array",
            found: "str",
        })
    }

    /// Byte offset of the message within its file.
    pub fn offset(&self) -> Result<u64, DecodeError> {
        let offset = self.get_int("offset")?;
        u64::try_from(offset).map_err(|_| DecodeError::TypeMismatch {
            key: "offset".to_owned(),
            expected: "non-negative int",
            found: "int",
        })
    }

    /// Writes a scalar or array value under a key, routing computed
    /// keys through their setters and applying the error policy.
    pub fn set(&mut self, key: &str, value: KeyValue) -> Result<(), DecodeError> {
        let result = match cfkeys::computed_setter(key) {
            Some(setter) => setter(self, &value),
            None if cfkeys::is_computed(key) => Err(DecodeError::ReadOnly(key.to_owned())),
            None => self.handle.set(key, value),
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) => match self.errors {
                ErrorPolicy::Raise => Err(err),
                ErrorPolicy::Ignore => Ok(()),
                ErrorPolicy::Warn => {
                    // Trying to set computed keys is very noisy when
                    // round-tripping messages, so read-only failures
                    // stay silent.
                    if !matches!(err, DecodeError::ReadOnly(_)) {
                        warn!("failed to set key {:?}: {}", key, err);
                    }
                    Ok(())
                }
            },
        }
    }

    /// Names of all keys of the message: the decoder keys followed
    /// by the computed keys not shadowing them.
    pub fn keys(&self, namespace: Option<&str>) -> Result<Vec<String>, DecodeError> {
        let mut keys = self.grib_keys(namespace)?;
        for computed in cfkeys::COMPUTED_KEYS {
            if !keys.iter().any(|k| k == computed) {
                keys.push(computed.to_owned());
            }
        }
        Ok(keys)
    }

    /// Names of the raw decoder keys, excluding computed keys.
    pub fn grib_keys(&self, namespace: Option<&str>) -> Result<Vec<String>, DecodeError> {
        self.handle.keys(namespace)
    }

    /// New independent message with the same contents.
    pub fn try_clone(&self) -> Result<Message, DecodeError> {
        Ok(Message {
            handle: self.handle.clone_handle()?,
            errors: self.errors,
        })
    }

    /// Emits the encoded message bytes to a binary sink.
    pub fn write_to(&self, sink: &mut dyn Write) -> Result<(), DecodeError> {
        self.handle.write_to(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::{MemoryDecoder, MemoryMessage};
    use crate::source::GribDecoder;
    use std::path::Path;

    fn sample_message(errors: ErrorPolicy) -> Message {
        let decoder = MemoryDecoder::new();
        decoder.add_file(
            "/synthetic/msg.grib",
            vec![MemoryMessage::new()
                .with("paramId", KeyValue::Int(130))
                .with("shortName", KeyValue::Str("t".to_owned()))
                .with("dataDate", KeyValue::Int(20160706))
                .with("dataTime", KeyValue::Int(1944))
                .with("endStep", KeyValue::Int(12))
                .with("stepUnits", KeyValue::Int(1))
                .with("values", KeyValue::FloatArray(vec![1.0, 2.0, 3.0, 4.0]))
                .with("centre", KeyValue::Str("ecmf".to_owned()))
                .with_read_only("centre")],
        );
        let mut session = decoder.open(Path::new("/synthetic/msg.grib")).unwrap();
        Message::new(session.next_message().unwrap().unwrap(), errors)
    }

    #[test]
    fn native_and_forced_reads() {
        let message = sample_message(ErrorPolicy::default());

        assert_eq!(message.get("paramId").unwrap(), KeyValue::Int(130));
        assert_eq!(
            message.get("paramId:float").unwrap(),
            KeyValue::Float(130.0)
        );
        assert_eq!(
            message.get("paramId:str").unwrap(),
            KeyValue::Str("130".to_owned())
        );
        assert_eq!(message.get_str("shortName").unwrap(), "t");
        assert_eq!(
            message.get_float_array("values").unwrap(),
            vec![1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn unknown_type_suffix_is_rejected() {
        let message = sample_message(ErrorPolicy::default());
        assert!(matches!(
            message.get("paramId:double"),
            Err(DecodeError::UnknownKeyType(_))
        ));
    }

    #[test]
    fn computed_keys_derive_from_raw_keys() {
        let message = sample_message(ErrorPolicy::default());

        assert_eq!(message.get("time").unwrap(), KeyValue::Int(1_467_834_240));
        assert_eq!(message.get("step").unwrap(), KeyValue::Float(12.0));
    }

    #[test]
    fn computed_setter_writes_raw_keys_back() {
        let mut message = sample_message(ErrorPolicy::Raise);

        message.set("time", KeyValue::Int(0)).unwrap();
        assert_eq!(message.get("dataDate").unwrap(), KeyValue::Int(19700101));
        assert_eq!(message.get("dataTime").unwrap(), KeyValue::Int(0));
    }

    #[test]
    fn missing_key_honours_default() {
        let message = sample_message(ErrorPolicy::default());

        assert!(matches!(
            message.get("level"),
            Err(DecodeError::KeyNotFound(_))
        ));
        assert_eq!(
            message
                .get_or("level", KeyValue::Str("undef".to_owned()))
                .unwrap(),
            KeyValue::Str("undef".to_owned())
        );
    }

    #[test]
    fn set_policy_three_ways() {
        let mut message = sample_message(ErrorPolicy::Raise);
        assert!(matches!(
            message.set("centre", KeyValue::Str("kwbc".to_owned())),
            Err(DecodeError::ReadOnly(_))
        ));

        let mut message = sample_message(ErrorPolicy::Warn);
        assert!(message
            .set("centre", KeyValue::Str("kwbc".to_owned()))
            .is_ok());

        let mut message = sample_message(ErrorPolicy::Ignore);
        assert!(message
            .set("centre", KeyValue::Str("kwbc".to_owned()))
            .is_ok());
    }

    #[test]
    fn key_iteration_appends_computed_keys() {
        let message = sample_message(ErrorPolicy::default());

        let raw = message.grib_keys(None).unwrap();
        let all = message.keys(None).unwrap();
        assert!(raw.iter().all(|k| k != "valid_time"));
        assert!(all.iter().any(|k| k == "valid_time"));
        assert_eq!(all.len(), raw.len() + cfkeys::COMPUTED_KEYS.len());
    }

    #[test]
    fn write_back_emits_bytes() {
        let message = sample_message(ErrorPolicy::default());
        let mut sink: Vec<u8> = Vec::new();
        message.write_to(&mut sink).unwrap();
        assert!(!sink.is_empty());
    }

    #[test]
    fn sample_templates_open_as_messages() {
        let decoder = MemoryDecoder::new();
        decoder.add_sample(
            "regular_ll_sfc_grib2",
            MemoryMessage::new().with("gridType", KeyValue::Str("regular_ll".to_owned())),
        );

        let message =
            Message::from_sample(&decoder, "regular_ll_sfc_grib2", ErrorPolicy::default())
                .unwrap();
        assert_eq!(message.get_str("gridType").unwrap(), "regular_ll");
        assert!(Message::from_sample(&decoder, "missing", ErrorPolicy::default()).is_err());
    }

    #[test]
    fn clone_is_independent() {
        let message = sample_message(ErrorPolicy::Raise);
        let mut copy = message.try_clone().unwrap();

        copy.set("paramId", KeyValue::Int(131)).unwrap();
        assert_eq!(message.get("paramId").unwrap(), KeyValue::Int(130));
        assert_eq!(copy.get("paramId").unwrap(), KeyValue::Int(131));
    }
}
