//! The append-only record log.
//!
//! One file per repository, holding newline-delimited canonical JSON
//! records (one commit per line). Appends are buffered, written in a single
//! syscall, and followed by a durability barrier, so a reader that observes
//! a record observes all of its bytes. Scans tolerate a torn trailing
//! record: the tail is discarded and its offset reported so the owner can
//! truncate with intent. A corrupt record in the middle of the file
//! stops the scan with a recoverable `StorageError::Corruption`.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::StorageError;

/// Default number of records per cursor batch.
pub const DEFAULT_BATCH: usize = 256;

/// Write handle for one log file. A file is write-open by at most one owner;
/// any number of cursors may read concurrently and observe a monotonically
/// growing prefix.
pub struct RecordLog {
    path: PathBuf,
    file: Option<File>,
}

impl RecordLog {
    /// Open (creating if missing) the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::io(&path, e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(RecordLog {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append records: each entry becomes one JSON line. The whole batch is
    /// buffered, written once, and fenced with a durability barrier.
    pub fn append<T: Serialize>(&mut self, entries: &[T]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::io(&self.path, closed_err()))?;
        let mut buf = BytesMut::new();
        for entry in entries {
            let line = serde_json::to_vec(entry)
                .map_err(|e| StorageError::io(&self.path, std::io::Error::other(e)))?;
            buf.put_slice(&line);
            buf.put_u8(b'\n');
        }
        file.write_all(&buf)
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.sync_data().map_err(|e| StorageError::io(&self.path, e))?;
        Ok(())
    }

    /// Force buffered data to stable storage.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if let Some(file) = self.file.as_mut() {
            file.flush().map_err(|e| StorageError::io(&self.path, e))?;
            file.sync_data().map_err(|e| StorageError::io(&self.path, e))?;
        }
        Ok(())
    }

    /// Flush and release the handle. Idempotent.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if self.file.is_some() {
            self.flush()?;
            self.file = None;
        }
        Ok(())
    }

    /// Discard everything at and after `offset`. Explicit repair intent
    /// after a reported corruption or partial tail.
    pub fn truncate_to(&mut self, offset: u64) -> Result<(), StorageError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::io(&self.path, closed_err()))?;
        file.set_len(offset)
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.sync_data().map_err(|e| StorageError::io(&self.path, e))?;
        Ok(())
    }

    /// Current file size in bytes.
    pub fn len_bytes(&self) -> Result<u64, StorageError> {
        std::fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|e| StorageError::io(&self.path, e))
    }

    /// Open an independent forward scan from offset 0.
    pub fn cursor<T: DeserializeOwned>(&self) -> Result<LogCursor<T>, StorageError> {
        LogCursor::open(&self.path)
    }
}

fn closed_err() -> std::io::Error {
    std::io::Error::other("log is closed")
}

/// Forward scanner yielding decoded record batches.
pub struct LogCursor<T> {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    done: bool,
    partial_tail: Option<u64>,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> LogCursor<T> {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| StorageError::io(&path, e))?;
        Ok(LogCursor {
            path,
            reader: BufReader::new(file),
            offset: 0,
            done: false,
            partial_tail: None,
            _marker: PhantomData,
        })
    }

    /// Byte offset of the next unread record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of a discarded torn trailing record, if the scan hit one.
    pub fn partial_tail(&self) -> Option<u64> {
        self.partial_tail
    }

    /// Read up to `max` records. Returns the batch and a terminal flag; the
    /// flag is true once the scan has consumed every complete record.
    pub fn next_batch(&mut self, max: usize) -> Result<(Vec<T>, bool), StorageError> {
        let mut batch = Vec::new();
        if self.done {
            return Ok((batch, true));
        }
        let mut line = Vec::new();
        while batch.len() < max {
            line.clear();
            let record_start = self.offset;
            let read = self
                .reader
                .read_until(b'\n', &mut line)
                .map_err(|e| StorageError::io(&self.path, e))?;
            if read == 0 {
                self.done = true;
                break;
            }
            if line.last() != Some(&b'\n') {
                // Torn trailing record: discard without error, remember the
                // offset for the owner's truncation decision.
                self.partial_tail = Some(record_start);
                self.done = true;
                tracing::warn!(
                    "discarding partial trailing record in {} at byte {record_start}",
                    self.path.display()
                );
                break;
            }
            self.offset += read as u64;
            let payload = &line[..line.len() - 1];
            if payload.is_empty() {
                continue;
            }
            match serde_json::from_slice(payload) {
                Ok(record) => batch.push(record),
                Err(_) => {
                    self.done = true;
                    return Err(StorageError::Corruption {
                        path: self.path.clone(),
                        offset: record_start,
                    });
                }
            }
        }
        Ok((batch, self.done))
    }
}
