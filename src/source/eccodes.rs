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

//! Decoder backend over the `eccodes` crate (ecCodes bindings).
//!
//! The binding exposes sequential typed reads, which is all the
//! index build needs. Random access is emulated by rescanning the
//! file up to the requested offset, and the capabilities the
//! binding does not surface (key iteration, writes, message
//! cloning, native multi-field support) report
//! [`DecodeError::Unsupported`].
//!
//! The ecCodes library keeps process-wide state, so every session
//! holds a process-global lock for its whole lifetime; open one
//! session at a time.

use eccodes::{CodesHandle, FallibleIterator, KeyType, KeyedMessage, ProductKind::GRIB};
use log::debug;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::errors::DecodeError;
use crate::source::{DecodeSession, GribDecoder, KeyValue, MessageHandle};

static ECCODES_LOCK: Mutex<()> = Mutex::new(());

/// Decoder backend reading GRIB files through ecCodes.
#[derive(Copy, Clone, Debug, Default)]
pub struct EccodesDecoder;

impl EccodesDecoder {
    pub fn new() -> Self {
        EccodesDecoder
    }
}

impl GribDecoder for EccodesDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn DecodeSession>, DecodeError> {
        let guard = ECCODES_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let handle = CodesHandle::new_from_file(path, GRIB)?;
        Ok(Box::new(EccodesSession {
            path: path.to_path_buf(),
            handle,
            target: 0,
            last: None,
            needs_reopen: false,
            _guard: guard,
        }))
    }
}

struct EccodesSession {
    path: PathBuf,
    handle: CodesHandle,
    /// Byte position the next message must start at or after.
    target: u64,
    /// Offset of the last message yielded.
    last: Option<u64>,
    needs_reopen: bool,
    _guard: MutexGuard<'static, ()>,
}

impl DecodeSession for EccodesSession {
    fn seek(&mut self, byte: u64) -> Result<(), DecodeError> {
        // The binding cannot reposition its descriptor; seeking
        // backwards reopens the file, seeking forwards just scans on.
        if self.last.map_or(false, |last| byte <= last) {
            self.needs_reopen = true;
            self.last = None;
        }
        self.target = byte;
        Ok(())
    }

    fn set_multi_field(&mut self, enabled: bool) -> Result<(), DecodeError> {
        if enabled {
            debug!("multi-field support is not available through the eccodes crate");
        }
        Ok(())
    }

    fn next_message(&mut self) -> Result<Option<Box<dyn MessageHandle>>, DecodeError> {
        if self.needs_reopen {
            self.handle = CodesHandle::new_from_file(&self.path, GRIB)?;
            self.needs_reopen = false;
        }
        loop {
            match self.handle.next()? {
                Some(message) => {
                    let handle = EccodesHandle { message };
                    let offset = match handle.get("offset")? {
                        KeyValue::Int(v) => v.max(0) as u64,
                        KeyValue::Float(v) => v.max(0.0) as u64,
                        _ => 0,
                    };
                    if offset < self.target {
                        continue;
                    }
                    self.last = Some(offset);
                    return Ok(Some(Box::new(handle)));
                }
                None => return Ok(None),
            }
        }
    }
}

struct EccodesHandle {
    message: KeyedMessage,
}

impl fmt::Debug for EccodesHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EccodesHandle").finish_non_exhaustive()
    }
}

impl MessageHandle for EccodesHandle {
    fn get(&self, key: &str) -> Result<KeyValue, DecodeError> {
        let read = self.message.read_key(key)?;
        match read.value {
            KeyType::Int(v) => Ok(KeyValue::Int(v)),
            KeyType::Float(v) => Ok(KeyValue::Float(v)),
            KeyType::Str(v) => Ok(KeyValue::Str(v)),
            KeyType::FloatArray(v) => Ok(KeyValue::FloatArray(v)),
            _ => Err(DecodeError::Unsupported("key type")),
        }
    }

    fn set(&mut self, _key: &str, _value: KeyValue) -> Result<(), DecodeError> {
        Err(DecodeError::Unsupported("key writes"))
    }

    fn keys(&self, _namespace: Option<&str>) -> Result<Vec<String>, DecodeError> {
        Err(DecodeError::Unsupported("key iteration"))
    }

    fn clone_handle(&self) -> Result<Box<dyn MessageHandle>, DecodeError> {
        Err(DecodeError::Unsupported("message cloning"))
    }

    fn write_to(&self, _sink: &mut dyn Write) -> Result<(), DecodeError> {
        Err(DecodeError::Unsupported("message write-back"))
    }
}
