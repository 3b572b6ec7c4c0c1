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

//! In-memory decoder backend holding synthetic messages.
//!
//! This backend implements the full decoder contract, including
//! multi-field messages and sample templates, without touching the
//! filesystem. It is the reference implementation of the trait
//! family in [`source`](crate::source) and the backend the test
//! suite runs against.

use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::errors::DecodeError;
use crate::source::{DecodeSession, GribDecoder, KeyValue, MessageHandle};

/// Nominal encoded size of a synthetic message, used to lay the
/// messages of a file out at distinct byte offsets.
const NOMINAL_MESSAGE_SIZE: u64 = 512;

/// One synthetic GRIB field: a plain key-value mapping with an
/// optional set of read-only keys and a corruption flag.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryMessage {
    keys: BTreeMap<String, KeyValue>,
    read_only: BTreeSet<String>,
    corrupt: bool,
}

impl MemoryMessage {
    pub fn new() -> Self {
        MemoryMessage::default()
    }

    /// Builder-style key insertion.
    pub fn with<K: Into<String>>(mut self, key: K, value: KeyValue) -> Self {
        self.keys.insert(key.into(), value);
        self
    }

    /// Marks a key as read-only; writing it reports [`DecodeError::ReadOnly`].
    pub fn with_read_only<K: Into<String>>(mut self, key: K) -> Self {
        self.read_only.insert(key.into());
        self
    }

    /// Marks the whole message as corrupted; decoding it fails.
    pub fn corrupted(mut self) -> Self {
        self.corrupt = true;
        self
    }

    pub fn insert<K: Into<String>>(&mut self, key: K, value: KeyValue) {
        self.keys.insert(key.into(), value);
    }
}

#[derive(Debug)]
struct StoredField {
    byte: u64,
    field: u32,
    message: MemoryMessage,
}

#[derive(Debug, Default)]
struct MemoryFile {
    fields: Vec<StoredField>,
}

/// Decoder backend over synthetic files registered in memory.
///
/// Paths are plain lookup keys here; registering a path does not
/// require a file to exist on disk, although tests that exercise
/// the sidecar index pair a registered path with a real file.
#[derive(Debug, Default)]
pub struct MemoryDecoder {
    files: Mutex<FxHashMap<PathBuf, Arc<MemoryFile>>>,
    samples: Mutex<FxHashMap<String, MemoryMessage>>,
}

impl MemoryDecoder {
    pub fn new() -> Self {
        MemoryDecoder::default()
    }

    /// Registers a file of single-field messages.
    pub fn add_file<P: AsRef<Path>>(&self, path: P, messages: Vec<MemoryMessage>) {
        self.add_multi_field_file(path, messages.into_iter().map(|m| vec![m]).collect());
    }

    /// Registers a file where each entry is the list of fields of
    /// one (possibly multi-field) message.
    pub fn add_multi_field_file<P: AsRef<Path>>(
        &self,
        path: P,
        messages: Vec<Vec<MemoryMessage>>,
    ) {
        let mut fields = Vec::new();
        for (ordinal, message_fields) in messages.into_iter().enumerate() {
            let byte = ordinal as u64 * NOMINAL_MESSAGE_SIZE;
            for (field, mut message) in message_fields.into_iter().enumerate() {
                message.insert("offset", KeyValue::Int(byte as i64));
                fields.push(StoredField {
                    byte,
                    field: field as u32,
                    message,
                });
            }
        }
        self.files
            .lock()
            .expect("memory decoder file table lock poisoned")
            .insert(path.as_ref().to_path_buf(), Arc::new(MemoryFile { fields }));
    }

    /// Registers a template message under a sample name.
    pub fn add_sample<N: Into<String>>(&self, name: N, message: MemoryMessage) {
        self.samples
            .lock()
            .expect("memory decoder sample table lock poisoned")
            .insert(name.into(), message);
    }
}

impl GribDecoder for MemoryDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn DecodeSession>, DecodeError> {
        let file = self
            .files
            .lock()
            .expect("memory decoder file table lock poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| {
                DecodeError::FileHandling(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("no such synthetic file: {}", path.display()),
                ))
            })?;

        Ok(Box::new(MemorySession {
            file,
            position: 0,
            multi_field: false,
        }))
    }

    fn from_sample(&self, name: &str) -> Result<Box<dyn MessageHandle>, DecodeError> {
        let message = self
            .samples
            .lock()
            .expect("memory decoder sample table lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| DecodeError::KeyNotFound(name.to_owned()))?;

        Ok(Box::new(MemoryHandle { message }))
    }
}

struct MemorySession {
    file: Arc<MemoryFile>,
    position: usize,
    multi_field: bool,
}

impl DecodeSession for MemorySession {
    fn seek(&mut self, byte: u64) -> Result<(), DecodeError> {
        self.position = self
            .file
            .fields
            .iter()
            .position(|f| f.byte >= byte && f.field == 0)
            .unwrap_or(self.file.fields.len());
        Ok(())
    }

    fn set_multi_field(&mut self, enabled: bool) -> Result<(), DecodeError> {
        self.multi_field = enabled;
        Ok(())
    }

    fn next_message(&mut self) -> Result<Option<Box<dyn MessageHandle>>, DecodeError> {
        while self.position < self.file.fields.len() {
            let stored = &self.file.fields[self.position];
            self.position += 1;

            if !self.multi_field && stored.field > 0 {
                continue;
            }
            if stored.message.corrupt {
                return Err(DecodeError::FileHandling(std::io::Error::new(
                    ErrorKind::InvalidData,
                    "corrupted message",
                )));
            }

            return Ok(Some(Box::new(MemoryHandle {
                message: stored.message.clone(),
            })));
        }

        Ok(None)
    }
}

#[derive(Clone, Debug)]
struct MemoryHandle {
    message: MemoryMessage,
}

impl MessageHandle for MemoryHandle {
    fn get(&self, key: &str) -> Result<KeyValue, DecodeError> {
        self.message
            .keys
            .get(key)
            .cloned()
            .ok_or_else(|| DecodeError::KeyNotFound(key.to_owned()))
    }

    fn set(&mut self, key: &str, value: KeyValue) -> Result<(), DecodeError> {
        if self.message.read_only.contains(key) {
            return Err(DecodeError::ReadOnly(key.to_owned()));
        }
        self.message.keys.insert(key.to_owned(), value);
        Ok(())
    }

    // Synthetic messages carry no namespace information, so a
    // namespace filter answers the whole key set.
    fn keys(&self, _namespace: Option<&str>) -> Result<Vec<String>, DecodeError> {
        Ok(self.message.keys.keys().cloned().collect())
    }

    fn clone_handle(&self) -> Result<Box<dyn MessageHandle>, DecodeError> {
        Ok(Box::new(self.clone()))
    }

    fn write_to(&self, sink: &mut dyn Write) -> Result<(), DecodeError> {
        serde_json::to_writer(&mut *sink, &self.message.keys)
            .map_err(|err| DecodeError::FileHandling(err.into()))?;
        sink.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_message_file() -> MemoryDecoder {
        let decoder = MemoryDecoder::new();
        decoder.add_file(
            "/synthetic/t.grib",
            vec![
                MemoryMessage::new().with("paramId", KeyValue::Int(130)),
                MemoryMessage::new().with("paramId", KeyValue::Int(131)),
            ],
        );
        decoder
    }

    #[test]
    fn sequential_read_assigns_distinct_offsets() {
        let decoder = two_message_file();
        let mut session = decoder.open(Path::new("/synthetic/t.grib")).unwrap();

        let first = session.next_message().unwrap().unwrap();
        let second = session.next_message().unwrap().unwrap();
        assert_eq!(first.get("offset").unwrap(), KeyValue::Int(0));
        assert_eq!(second.get("offset").unwrap(), KeyValue::Int(512));
        assert!(session.next_message().unwrap().is_none());
    }

    #[test]
    fn seek_lands_on_the_first_message_at_or_after_byte() {
        let decoder = two_message_file();
        let mut session = decoder.open(Path::new("/synthetic/t.grib")).unwrap();

        session.seek(1).unwrap();
        let message = session.next_message().unwrap().unwrap();
        assert_eq!(message.get("paramId").unwrap(), KeyValue::Int(131));
    }

    #[test]
    fn multi_field_messages_are_hidden_unless_enabled() {
        let decoder = MemoryDecoder::new();
        decoder.add_multi_field_file(
            "/synthetic/multi.grib",
            vec![vec![
                MemoryMessage::new().with("paramId", KeyValue::Int(1)),
                MemoryMessage::new().with("paramId", KeyValue::Int(2)),
            ]],
        );

        let mut session = decoder.open(Path::new("/synthetic/multi.grib")).unwrap();
        assert!(session.next_message().unwrap().is_some());
        assert!(session.next_message().unwrap().is_none());

        let mut session = decoder.open(Path::new("/synthetic/multi.grib")).unwrap();
        session.set_multi_field(true).unwrap();
        let first = session.next_message().unwrap().unwrap();
        let second = session.next_message().unwrap().unwrap();
        assert_eq!(first.get("offset").unwrap(), second.get("offset").unwrap());
        assert_eq!(second.get("paramId").unwrap(), KeyValue::Int(2));
    }

    #[test]
    fn unknown_path_reports_missing_file() {
        let decoder = MemoryDecoder::new();
        assert!(matches!(
            decoder.open(Path::new("/nowhere.grib")).err(),
            Some(DecodeError::FileHandling(_))
        ));
    }

    #[test]
    fn read_only_keys_refuse_writes() {
        let mut handle = MemoryHandle {
            message: MemoryMessage::new()
                .with("centre", KeyValue::Str("ecmf".to_owned()))
                .with_read_only("centre"),
        };
        assert!(matches!(
            handle.set("centre", KeyValue::Str("kwbc".to_owned())),
            Err(DecodeError::ReadOnly(_))
        ));
    }
}
