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

//! Module building and persisting the header index of a GRIB file.
//!
//! The index records, for every message, the tuple of values of a
//! chosen set of keys together with the message offset. It is built
//! in a single scan, can be projected by equality filters, and is
//! persisted to a sidecar file next to the GRIB file.

use itertools::Itertools;
use log::warn;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::errors::{IndexError, StreamError};
use crate::message::Message;
use crate::source::{KeyValue, Offset};
use crate::stream::FileStream;

/// Version stamp of the sidecar record layout. A sidecar written
/// with a different version is discarded and the index rebuilt.
pub const INDEX_PROTOCOL_VERSION: &str = "1";

/// Default sidecar path template. `{path}` expands to the source
/// path, `{short_hash}` to the first five hex digits of the MD5 of
/// the index keys and `{hash}` to the full digest.
pub const DEFAULT_INDEXPATH: &str = "{path}.{short_hash}.idx";

/// One element of a header tuple: the value of an index key in a
/// message, or `Undef` when the key is absent there.
///
/// Integers compare as integers, floats as floats (with the IEEE
/// total order, so equal hashes imply equality even around NaN),
/// strings as byte strings. `Undef` sorts before everything.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HeaderValue {
    Undef,
    Int(i64),
    Float(f64),
    Str(String),
}

impl HeaderValue {
    pub fn is_undef(&self) -> bool {
        matches!(self, HeaderValue::Undef)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Int(v) => Some(*v as f64),
            HeaderValue::Float(v) => Some(*v),
            HeaderValue::Str(v) => v.trim().parse().ok(),
            HeaderValue::Undef => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(v) => Some(v),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            HeaderValue::Undef => 0,
            HeaderValue::Int(_) | HeaderValue::Float(_) => 1,
            HeaderValue::Str(_) => 2,
        }
    }
}

impl From<KeyValue> for HeaderValue {
    fn from(value: KeyValue) -> Self {
        match value {
            KeyValue::Int(v) => HeaderValue::Int(v),
            KeyValue::Float(v) => HeaderValue::Float(v),
            KeyValue::Str(v) => HeaderValue::Str(v),
            // Array-valued keys are not usable as header dimensions.
            KeyValue::IntArray(_) | KeyValue::FloatArray(_) | KeyValue::Bytes(_) => {
                HeaderValue::Undef
            }
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_owned())
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Undef => write!(f, "undef"),
            HeaderValue::Int(v) => write!(f, "{}", v),
            HeaderValue::Float(v) => write!(f, "{}", v),
            HeaderValue::Str(v) => write!(f, "{}", v),
        }
    }
}

impl Ord for HeaderValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (HeaderValue::Int(a), HeaderValue::Int(b)) => a.cmp(b),
            (HeaderValue::Float(a), HeaderValue::Float(b)) => a.total_cmp(b),
            (HeaderValue::Int(a), HeaderValue::Float(b)) => (*a as f64).total_cmp(b),
            (HeaderValue::Float(a), HeaderValue::Int(b)) => a.total_cmp(&(*b as f64)),
            (HeaderValue::Str(a), HeaderValue::Str(b)) => a.as_bytes().cmp(b.as_bytes()),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for HeaderValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeaderValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeaderValue {}

impl Hash for HeaderValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.rank());
        match self {
            HeaderValue::Undef => {}
            // Numeric values hash through f64 bits so that an
            // integer and the float it equals hash alike.
            HeaderValue::Int(v) => state.write_u64((*v as f64).to_bits()),
            HeaderValue::Float(v) => state.write_u64(v.to_bits()),
            HeaderValue::Str(v) => state.write(v.as_bytes()),
        }
    }
}

/// Reads one index key off a message, answering `Undef` for keys
/// that are absent or unreadable.
fn header_value(message: &Message, key: &str) -> HeaderValue {
    match message.get(key) {
        Ok(value) => HeaderValue::from(value),
        Err(_) => HeaderValue::Undef,
    }
}

/// Header index of one GRIB file over a fixed sequence of keys.
///
/// The entry order reflects first appearance in the file, which
/// keeps dimension ordering reproducible before coordinate values
/// are sorted. The index is immutable once built; projections
/// answer fresh instances.
#[derive(Clone, Debug)]
pub struct FileIndex {
    stream: FileStream,
    index_keys: Vec<String>,
    entries: Vec<(Vec<HeaderValue>, Vec<Offset>)>,
    filter_by_keys: BTreeMap<String, HeaderValue>,
}

impl PartialEq for FileIndex {
    fn eq(&self, other: &Self) -> bool {
        self.stream.path() == other.stream.path()
            && self.index_keys == other.index_keys
            && self.entries == other.entries
            && self.filter_by_keys == other.filter_by_keys
    }
}

impl FileIndex {
    /// Builds the index by scanning the stream exactly once.
    pub fn from_stream(
        stream: &FileStream,
        index_keys: Vec<String>,
    ) -> Result<Self, StreamError> {
        let mut entries: Vec<(Vec<HeaderValue>, Vec<Offset>)> = Vec::new();
        let mut positions: FxHashMap<Vec<HeaderValue>, usize> = FxHashMap::default();

        for item in stream.scan()? {
            let (offset, message) = item?;
            let tuple: Vec<HeaderValue> = index_keys
                .iter()
                .map(|key| header_value(&message, key))
                .collect();

            match positions.get(&tuple) {
                Some(&at) => entries[at].1.push(offset),
                None => {
                    positions.insert(tuple.clone(), entries.len());
                    entries.push((tuple, vec![offset]));
                }
            }
        }

        Ok(FileIndex {
            stream: stream.clone(),
            index_keys,
            entries,
            filter_by_keys: BTreeMap::new(),
        })
    }

    /// Loads the index from its sidecar when the sidecar is fresh
    /// and compatible, and rebuilds it from the stream otherwise.
    ///
    /// An empty `indexpath` template disables persistence entirely.
    /// Sidecar I/O failures are never fatal.
    pub fn from_indexpath_or_stream(
        stream: &FileStream,
        index_keys: Vec<String>,
        indexpath: &str,
    ) -> Result<Self, StreamError> {
        if indexpath.is_empty() {
            return Self::from_stream(stream, index_keys);
        }

        let indexpath = indexpath_for(indexpath, stream.path(), &index_keys);

        // Exclusive creation elects a single writer among concurrent
        // builders; everyone else falls through to reading.
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&indexpath)
        {
            Ok(file) => {
                let index = Self::from_stream(stream, index_keys)?;
                if let Err(err) = index.dump(file) {
                    warn!("can't write index file {:?}: {}", indexpath, err);
                    let _ = fs::remove_file(&indexpath);
                }
                return Ok(index);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                warn!("can't create index file {:?}: {}", indexpath, err);
                return Self::from_stream(stream, index_keys);
            }
        }

        match Self::from_indexpath(&indexpath, stream, &index_keys) {
            Ok(index) => Ok(index),
            Err(err) => {
                warn!("ignoring index file {:?}: {}", indexpath, err);
                Self::from_stream(stream, index_keys)
            }
        }
    }

    fn from_indexpath(
        indexpath: &Path,
        stream: &FileStream,
        index_keys: &[String],
    ) -> Result<Self, SidecarError> {
        let index_mtime = fs::metadata(indexpath)?.modified()?;
        let source_meta = fs::metadata(stream.path())?;
        if index_mtime < source_meta.modified()? {
            return Err(SidecarError::Stale);
        }

        let record: IndexRecord =
            serde_json::from_reader(BufReader::new(File::open(indexpath)?))?;
        if record.index_protocol_version != INDEX_PROTOCOL_VERSION
            || record.index_keys != index_keys
            || record.source_path != stream.path()
            || record.source_len != source_meta.len()
        {
            return Err(SidecarError::Incompatible);
        }

        Ok(FileIndex {
            stream: stream.clone(),
            index_keys: record.index_keys,
            entries: record.entries,
            filter_by_keys: record.filter_by_keys,
        })
    }

    fn dump(&self, file: File) -> Result<(), SidecarError> {
        let source_meta = fs::metadata(self.stream.path())?;
        let record = IndexRecord {
            index_protocol_version: INDEX_PROTOCOL_VERSION.to_owned(),
            source_path: self.stream.path().to_path_buf(),
            source_len: source_meta.len(),
            index_keys: self.index_keys.clone(),
            filter_by_keys: self.filter_by_keys.clone(),
            entries: self.entries.clone(),
        };
        serde_json::to_writer(BufWriter::new(file), &record)?;
        Ok(())
    }

    pub fn index_keys(&self) -> &[String] {
        &self.index_keys
    }

    pub fn filter_by_keys(&self) -> &BTreeMap<String, HeaderValue> {
        &self.filter_by_keys
    }

    pub fn source_path(&self) -> &Path {
        self.stream.path()
    }

    pub fn stream(&self) -> &FileStream {
        &self.stream
    }

    /// Header tuples with their offsets, in first-appearance order.
    pub fn entries(&self) -> &[(Vec<HeaderValue>, Vec<Offset>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of a key within the header tuples.
    pub fn key_position(&self, key: &str) -> Result<usize, IndexError> {
        self.index_keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| IndexError::UnknownKey(key.to_owned()))
    }

    /// Distinct values seen for a key across the current projection,
    /// in first-appearance order.
    pub fn values(&self, key: &str) -> Result<Vec<HeaderValue>, IndexError> {
        let at = self.key_position(key)?;
        Ok(self
            .entries
            .iter()
            .map(|(tuple, _)| tuple[at].clone())
            .unique()
            .collect())
    }

    /// The single value of a key, failing when it is not unique.
    pub fn getone(&self, key: &str) -> Result<HeaderValue, IndexError> {
        let values = self.values(key)?;
        if values.len() != 1 {
            return Err(IndexError::NotUnique {
                key: key.to_owned(),
                count: values.len(),
            });
        }
        Ok(values.into_iter().next().expect("one value is present"))
    }

    /// Projection of the index onto the header tuples matching all
    /// the given equality filters. Conflicting filters yield an
    /// empty projection.
    pub fn subindex(
        &self,
        query: &BTreeMap<String, HeaderValue>,
    ) -> Result<FileIndex, IndexError> {
        let raw_query: Vec<(usize, &HeaderValue)> = query
            .iter()
            .map(|(key, value)| Ok((self.key_position(key)?, value)))
            .collect::<Result<_, IndexError>>()?;

        let entries: Vec<(Vec<HeaderValue>, Vec<Offset>)> = self
            .entries
            .iter()
            .filter(|(tuple, _)| raw_query.iter().all(|&(at, value)| &tuple[at] == value))
            .cloned()
            .collect();

        let mut filter_by_keys = self.filter_by_keys.clone();
        filter_by_keys.extend(query.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(FileIndex {
            stream: self.stream.clone(),
            index_keys: self.index_keys.clone(),
            entries,
            filter_by_keys,
        })
    }

    /// Projection by a single equality filter.
    pub fn subindex_one<V: Into<HeaderValue>>(
        &self,
        key: &str,
        value: V,
    ) -> Result<FileIndex, IndexError> {
        let mut query = BTreeMap::new();
        query.insert(key.to_owned(), value.into());
        self.subindex(&query)
    }

    /// First message of the current projection.
    pub fn first(&self) -> Result<Message, IndexError> {
        let (_, offsets) = self.entries.first().ok_or(IndexError::Empty)?;
        Ok(self.stream.get(offsets.first().copied())?)
    }
}

#[derive(Serialize, Deserialize)]
struct IndexRecord {
    index_protocol_version: String,
    source_path: PathBuf,
    source_len: u64,
    index_keys: Vec<String>,
    filter_by_keys: BTreeMap<String, HeaderValue>,
    entries: Vec<(Vec<HeaderValue>, Vec<Offset>)>,
}

/// Reasons a sidecar is rejected; all of them are recovered from by
/// rebuilding the index in memory.
#[derive(Error, Debug)]
enum SidecarError {
    #[error("sidecar is older than the GRIB file")]
    Stale,

    #[error("sidecar does not match the GRIB file or index keys")]
    Incompatible,

    #[error("can't read sidecar: {0}")]
    Io(#[from] std::io::Error),

    #[error("can't decode sidecar: {0}")]
    Decode(#[from] serde_json::Error),
}

fn indexpath_for(template: &str, path: &Path, index_keys: &[String]) -> PathBuf {
    let canonical =
        serde_json::to_string(index_keys).expect("index keys serialize to JSON");
    let digest = format!("{:x}", md5::compute(canonical.as_bytes()));
    PathBuf::from(
        template
            .replace("{path}", &path.to_string_lossy())
            .replace("{short_hash}", &digest[..5])
            .replace("{hash}", &digest),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorPolicy;
    use crate::source::memory::{MemoryDecoder, MemoryMessage};
    use std::sync::Arc;

    fn level_message(param_id: i64, level: i64) -> MemoryMessage {
        MemoryMessage::new()
            .with("paramId", KeyValue::Int(param_id))
            .with("typeOfLevel", KeyValue::Str("isobaricInhPa".to_owned()))
            .with("level", KeyValue::Int(level))
    }

    fn sample_stream(path: &str) -> FileStream {
        let decoder = MemoryDecoder::new();
        decoder.add_file(
            path,
            vec![
                level_message(130, 500),
                level_message(130, 1000),
                level_message(131, 500),
            ],
        );
        FileStream::new(Arc::new(decoder), path, ErrorPolicy::Raise)
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|&n| n.to_owned()).collect()
    }

    #[test]
    fn values_preserve_first_appearance_order() {
        let stream = sample_stream("/synthetic/levels.grib");
        let index =
            FileIndex::from_stream(&stream, keys(&["paramId", "level", "number"])).unwrap();

        assert_eq!(
            index.values("paramId").unwrap(),
            vec![HeaderValue::Int(130), HeaderValue::Int(131)]
        );
        assert_eq!(
            index.values("level").unwrap(),
            vec![HeaderValue::Int(500), HeaderValue::Int(1000)]
        );
        // A key absent from every message indexes as a single undef.
        assert_eq!(index.values("number").unwrap(), vec![HeaderValue::Undef]);
        assert!(index.values("missing").is_err());
    }

    #[test]
    fn getone_rejects_multiple_values() {
        let stream = sample_stream("/synthetic/levels.grib");
        let index = FileIndex::from_stream(&stream, keys(&["paramId", "typeOfLevel"])).unwrap();

        assert_eq!(
            index.getone("typeOfLevel").unwrap(),
            HeaderValue::from("isobaricInhPa")
        );
        assert!(matches!(
            index.getone("paramId"),
            Err(IndexError::NotUnique { .. })
        ));
    }

    #[test]
    fn subindex_restricts_and_merges_filters() {
        let stream = sample_stream("/synthetic/levels.grib");
        let index = FileIndex::from_stream(&stream, keys(&["paramId", "level"])).unwrap();

        let by_param = index.subindex_one("paramId", 130).unwrap();
        assert_eq!(by_param.len(), 2);
        assert_eq!(
            by_param.filter_by_keys().get("paramId"),
            Some(&HeaderValue::Int(130))
        );

        let by_both = by_param.subindex_one("level", 500).unwrap();
        assert_eq!(by_both.len(), 1);

        // Composition equals a single projection by the union.
        let mut query = BTreeMap::new();
        query.insert("paramId".to_owned(), HeaderValue::Int(130));
        query.insert("level".to_owned(), HeaderValue::Int(500));
        assert_eq!(by_both, index.subindex(&query).unwrap());

        // A conflicting refinement projects to nothing.
        let conflicting = by_param.subindex_one("paramId", 131).unwrap();
        assert!(conflicting.is_empty());
    }

    #[test]
    fn first_decodes_the_first_projected_message() {
        let stream = sample_stream("/synthetic/levels.grib");
        let index = FileIndex::from_stream(&stream, keys(&["paramId", "level"])).unwrap();

        let first = index.subindex_one("paramId", 131).unwrap().first().unwrap();
        assert_eq!(first.get("level").unwrap(), KeyValue::Int(500));
        assert!(matches!(
            index.subindex_one("paramId", 999).unwrap().first(),
            Err(IndexError::Empty)
        ));
    }

    #[test]
    fn numeric_header_values_compare_across_types() {
        assert_eq!(HeaderValue::Int(500), HeaderValue::Float(500.0));
        assert!(HeaderValue::Int(500) < HeaderValue::Float(500.5));
        assert!(HeaderValue::Undef < HeaderValue::Int(i64::MIN));
        assert!(HeaderValue::Int(0) < HeaderValue::Str(String::new()));
    }

    #[test]
    fn sidecar_round_trip_yields_an_equal_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.grib");
        std::fs::write(&path, b"GRIB synthetic payload").unwrap();

        let decoder = MemoryDecoder::new();
        decoder.add_file(&path, vec![level_message(130, 500), level_message(130, 850)]);
        let stream = FileStream::new(Arc::new(decoder), &path, ErrorPolicy::Raise);

        let built = FileIndex::from_indexpath_or_stream(
            &stream,
            keys(&["paramId", "level"]),
            DEFAULT_INDEXPATH,
        )
        .unwrap();

        let sidecar = indexpath_for(DEFAULT_INDEXPATH, &path, built.index_keys());
        assert!(sidecar.exists());

        let loaded = FileIndex::from_indexpath_or_stream(
            &stream,
            keys(&["paramId", "level"]),
            DEFAULT_INDEXPATH,
        )
        .unwrap();
        assert_eq!(built, loaded);
    }

    #[test]
    fn incompatible_sidecar_is_rebuilt_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.grib");
        std::fs::write(&path, b"GRIB synthetic payload").unwrap();

        let decoder = MemoryDecoder::new();
        decoder.add_file(&path, vec![level_message(130, 500)]);
        let stream = FileStream::new(Arc::new(decoder), &path, ErrorPolicy::Raise);

        let sidecar = indexpath_for(DEFAULT_INDEXPATH, &path, &keys(&["paramId"]));
        std::fs::write(&sidecar, b"not a sidecar").unwrap();

        let index =
            FileIndex::from_indexpath_or_stream(&stream, keys(&["paramId"]), DEFAULT_INDEXPATH)
                .unwrap();
        assert_eq!(index.len(), 1);
        // The broken sidecar is left alone, not overwritten.
        assert_eq!(std::fs::read(&sidecar).unwrap(), b"not a sidecar");
    }

    #[test]
    fn empty_indexpath_disables_persistence() {
        let stream = sample_stream("/synthetic/levels.grib");
        let index =
            FileIndex::from_indexpath_or_stream(&stream, keys(&["paramId"]), "").unwrap();
        assert_eq!(index.len(), 2);
    }
}
