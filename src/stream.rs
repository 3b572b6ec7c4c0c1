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

//! Module with sequential and random access to the messages of
//! one GRIB file.
//!
//! Multi-field support is enabled for the duration of a sequential
//! scan and disabled again on every exit path, so that random
//! access afterwards observes a deterministic decoder state.

use log::warn;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{DecodeError, ErrorPolicy, StreamError};
use crate::index::FileIndex;
use crate::message::Message;
use crate::source::{DecodeSession, GribDecoder, Offset};

/// Access to the messages of one GRIB file through a decoder
/// backend. The stream is a transient view over the path; it holds
/// no descriptor itself and can be cloned freely.
#[derive(Clone, Debug)]
pub struct FileStream {
    path: PathBuf,
    decoder: Arc<dyn GribDecoder>,
    errors: ErrorPolicy,
}

impl FileStream {
    pub fn new<P: Into<PathBuf>>(
        decoder: Arc<dyn GribDecoder>,
        path: P,
        errors: ErrorPolicy,
    ) -> Self {
        FileStream {
            path: path.into(),
            decoder,
            errors,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn errors(&self) -> ErrorPolicy {
        self.errors
    }

    pub fn decoder(&self) -> &Arc<dyn GribDecoder> {
        &self.decoder
    }

    /// Starts a sequential scan yielding `(offset, message)` pairs
    /// in file order, with multi-field support enabled.
    pub fn scan(&self) -> Result<MessageScan, StreamError> {
        let mut session = self.decoder.open(&self.path).map_err(StreamError::Decode)?;
        session.set_multi_field(true)?;
        Ok(MessageScan {
            session,
            path: self.path.clone(),
            errors: self.errors,
            last_byte: None,
            repeat: 0,
            found_valid: false,
            done: false,
        })
    }

    /// First message of the file.
    pub fn first(&self) -> Result<Message, StreamError> {
        match self.scan()?.next() {
            Some(Ok((_, message))) => Ok(message),
            Some(Err(err)) => Err(err),
            None => Err(StreamError::EmptyFile(self.path.clone())),
        }
    }

    /// Opens a random-access reader whose descriptor lives for as
    /// long as the reader itself.
    pub fn reader(&self) -> Result<StreamReader, StreamError> {
        let session = self.decoder.open(&self.path).map_err(StreamError::Decode)?;
        Ok(StreamReader {
            session,
            errors: self.errors,
        })
    }

    /// Seeks and decodes one message. A `None` offset answers the
    /// first message of the file.
    pub fn get(&self, offset: Option<Offset>) -> Result<Message, StreamError> {
        self.reader()?.get(offset)
    }

    /// Builds (or loads from its sidecar) the index of this stream
    /// over the given keys.
    pub fn index(
        &self,
        index_keys: Vec<String>,
        indexpath: &str,
    ) -> Result<FileIndex, StreamError> {
        FileIndex::from_indexpath_or_stream(self, index_keys, indexpath)
    }
}

/// Sequential iterator over the messages of a file.
///
/// Messages that fail to decode mid-scan are skipped or reported
/// according to the stream's error policy; a file that ends before
/// one valid message was read yields [`StreamError::EmptyFile`].
pub struct MessageScan {
    session: Box<dyn DecodeSession>,
    path: PathBuf,
    errors: ErrorPolicy,
    last_byte: Option<u64>,
    repeat: u32,
    found_valid: bool,
    done: bool,
}

impl MessageScan {
    fn finish(&mut self) {
        self.done = true;
        let _ = self.session.set_multi_field(false);
    }
}

impl Iterator for MessageScan {
    type Item = Result<(Offset, Message), StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.session.next_message() {
                Ok(Some(handle)) => {
                    let message = Message::new(handle, self.errors);
                    let byte = match message.offset() {
                        Ok(byte) => byte,
                        Err(err) => match self.errors {
                            ErrorPolicy::Raise => {
                                self.finish();
                                return Some(Err(err.into()));
                            }
                            ErrorPolicy::Ignore => continue,
                            ErrorPolicy::Warn => {
                                warn!(
                                    "skipping message without offset in {:?}: {}",
                                    self.path, err
                                );
                                continue;
                            }
                        },
                    };
                    self.found_valid = true;

                    // Consecutive fields of a multi-field message repeat
                    // the envelope offset; they are told apart by the
                    // field counter.
                    let offset = if Some(byte) == self.last_byte {
                        self.repeat += 1;
                        Offset::with_field(byte, self.repeat)
                    } else {
                        self.last_byte = Some(byte);
                        self.repeat = 0;
                        Offset::new(byte)
                    };
                    return Some(Ok((offset, message)));
                }
                Ok(None) => {
                    let empty = !self.found_valid;
                    self.finish();
                    if empty {
                        return Some(Err(StreamError::EmptyFile(self.path.clone())));
                    }
                    return None;
                }
                Err(err) => match self.errors {
                    ErrorPolicy::Raise => {
                        self.finish();
                        return Some(Err(err.into()));
                    }
                    ErrorPolicy::Ignore => continue,
                    ErrorPolicy::Warn => {
                        warn!("skipping corrupted message in {:?}: {}", self.path, err);
                        continue;
                    }
                },
            }
        }
    }
}

impl Drop for MessageScan {
    fn drop(&mut self) {
        let _ = self.session.set_multi_field(false);
    }
}

/// Random access over one decoding session.
///
/// One reader spans one descriptor lifetime; fetching many messages
/// through a single reader avoids reopening the file per message.
pub struct StreamReader {
    session: Box<dyn DecodeSession>,
    errors: ErrorPolicy,
}

impl StreamReader {
    pub fn get(&mut self, offset: Option<Offset>) -> Result<Message, StreamError> {
        match offset {
            None => {
                self.session.set_multi_field(false)?;
                self.session.seek(0)?;
                self.next_or_eof()
            }
            Some(offset) if offset.field == 0 => {
                self.session.set_multi_field(false)?;
                self.session.seek(offset.byte)?;
                self.next_or_eof()
            }
            Some(offset) => {
                // Multi-field support is re-enabled only while the
                // sub-fields are skipped over, and restored even when
                // the fetch fails.
                self.session.set_multi_field(true)?;
                let result = self.get_sub_field(offset);
                let restore = self.session.set_multi_field(false);
                let message = result?;
                restore?;
                Ok(message)
            }
        }
    }

    fn get_sub_field(&mut self, offset: Offset) -> Result<Message, StreamError> {
        self.session.seek(offset.byte)?;
        for _ in 0..offset.field {
            if self.session.next_message()?.is_none() {
                return Err(StreamError::Decode(DecodeError::EndOfFile));
            }
        }
        self.next_or_eof()
    }

    fn next_or_eof(&mut self) -> Result<Message, StreamError> {
        match self.session.next_message()? {
            Some(handle) => Ok(Message::new(handle, self.errors)),
            None => Err(StreamError::Decode(DecodeError::EndOfFile)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::{MemoryDecoder, MemoryMessage};
    use crate::source::KeyValue;

    fn decoder_with_multi_field_file() -> Arc<MemoryDecoder> {
        let decoder = MemoryDecoder::new();
        decoder.add_multi_field_file(
            "/synthetic/wave.grib",
            vec![
                vec![
                    MemoryMessage::new().with("paramId", KeyValue::Int(140)),
                    MemoryMessage::new().with("paramId", KeyValue::Int(141)),
                ],
                vec![MemoryMessage::new().with("paramId", KeyValue::Int(142))],
            ],
        );
        Arc::new(decoder)
    }

    #[test]
    fn scan_disambiguates_repeated_offsets() {
        let stream = FileStream::new(
            decoder_with_multi_field_file(),
            "/synthetic/wave.grib",
            ErrorPolicy::Raise,
        );

        let offsets: Vec<Offset> = stream
            .scan()
            .unwrap()
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(
            offsets,
            vec![
                Offset::new(0),
                Offset::with_field(0, 1),
                Offset::new(512)
            ]
        );
    }

    #[test]
    fn random_access_reaches_sub_fields() {
        let stream = FileStream::new(
            decoder_with_multi_field_file(),
            "/synthetic/wave.grib",
            ErrorPolicy::Raise,
        );

        let message = stream.get(Some(Offset::with_field(0, 1))).unwrap();
        assert_eq!(message.get("paramId").unwrap(), KeyValue::Int(141));

        let message = stream.get(Some(Offset::new(512))).unwrap();
        assert_eq!(message.get("paramId").unwrap(), KeyValue::Int(142));

        let message = stream.get(None).unwrap();
        assert_eq!(message.get("paramId").unwrap(), KeyValue::Int(140));
    }

    #[test]
    fn random_access_matches_scan() {
        let stream = FileStream::new(
            decoder_with_multi_field_file(),
            "/synthetic/wave.grib",
            ErrorPolicy::Raise,
        );

        for item in stream.scan().unwrap() {
            let (offset, scanned) = item.unwrap();
            let fetched = stream.get(Some(offset)).unwrap();
            assert_eq!(
                fetched.get("paramId").unwrap(),
                scanned.get("paramId").unwrap()
            );
        }
    }

    #[test]
    fn empty_file_is_fatal() {
        let decoder = MemoryDecoder::new();
        decoder.add_file("/synthetic/empty.grib", vec![]);
        let stream = FileStream::new(
            Arc::new(decoder),
            "/synthetic/empty.grib",
            ErrorPolicy::Warn,
        );

        assert!(matches!(
            stream.scan().unwrap().next(),
            Some(Err(StreamError::EmptyFile(_)))
        ));
    }

    #[test]
    fn corrupt_trailing_message_respects_policy() {
        let decoder = MemoryDecoder::new();
        decoder.add_file(
            "/synthetic/partly.grib",
            vec![
                MemoryMessage::new().with("paramId", KeyValue::Int(130)),
                MemoryMessage::new().corrupted(),
            ],
        );
        let decoder = Arc::new(decoder);

        let stream = FileStream::new(
            Arc::clone(&decoder) as Arc<dyn GribDecoder>,
            "/synthetic/partly.grib",
            ErrorPolicy::Warn,
        );
        let scanned: Result<Vec<_>, _> = stream.scan().unwrap().collect();
        assert_eq!(scanned.unwrap().len(), 1);

        let stream = FileStream::new(decoder, "/synthetic/partly.grib", ErrorPolicy::Raise);
        let scanned: Result<Vec<_>, _> = stream.scan().unwrap().collect();
        assert!(scanned.is_err());
    }
}
