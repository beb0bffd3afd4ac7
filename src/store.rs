//! Durable storage primitives: append-only CSV journals and the cursor file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::model::Cursor;

/// Errors raised by the storage layer. All of them leave the in-memory state
/// untouched, so callers may retry.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("{}: {source}", path.display())]
    Csv { path: PathBuf, source: csv::Error },

    #[error("{}: corrupt record at line {line}", path.display())]
    Corrupt { path: PathBuf, line: u64 },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        StoreError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// An append-only CSV file of `R` rows, fsynced on every append.
///
/// A crash can leave at most one torn row at the tail; it is discarded and
/// truncated away when the journal is reopened.
pub struct Journal<R> {
    path: PathBuf,
    writer: csv::Writer<File>,
    /// Length of the file up to the last durable row.
    len: u64,
    _row: PhantomData<fn(R)>,
}

impl<R: Serialize + DeserializeOwned> Journal<R> {
    /// Open (or create) the journal at `path` and return it with every
    /// durable row in append order.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<R>), StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let (rows, len) = if path.exists() {
            Self::replay(&path)?
        } else {
            (Vec::new(), 0)
        };

        let writer = Self::writer(&path, len)?;
        let journal = Self {
            path,
            writer,
            len,
            _row: PhantomData,
        };
        Ok((journal, rows))
    }

    /// Durably append one row.
    pub fn append(&mut self, row: &R) -> Result<(), StoreError> {
        match self.write_synced(row) {
            Ok(len) => {
                self.len = len;
                Ok(())
            }
            Err(e) => {
                self.recover();
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_synced(&mut self, row: &R) -> Result<u64, StoreError> {
        self.writer
            .serialize(row)
            .map_err(|e| StoreError::csv(&self.path, e))?;
        self.writer
            .flush()
            .map_err(|e| StoreError::io(&self.path, e))?;
        let file = self.writer.get_ref();
        file.sync_data().map_err(|e| StoreError::io(&self.path, e))?;
        let len = file
            .metadata()
            .map_err(|e| StoreError::io(&self.path, e))?
            .len();
        Ok(len)
    }

    /// Drop whatever a failed append left behind and start a fresh writer at
    /// the last durable row.
    fn recover(&mut self) {
        let result = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|file| file.set_len(self.len));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to truncate journal after append error");
        }
        match Self::writer(&self.path, self.len) {
            Ok(writer) => self.writer = writer,
            Err(e) => warn!(error = %e, "failed to reopen journal after append error"),
        }
    }

    fn writer(path: &Path, len: u64) -> Result<csv::Writer<File>, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        Ok(csv::WriterBuilder::new()
            .has_headers(len == 0)
            .from_writer(file))
    }

    /// Read every complete row, truncating a torn tail.
    fn replay(path: &Path) -> Result<(Vec<R>, u64), StoreError> {
        let mut bytes = Vec::new();
        File::open(path)
            .and_then(|mut file| file.read_to_end(&mut bytes))
            .map_err(|e| StoreError::io(path, e))?;
        let file_len = bytes.len() as u64;

        // Every complete row ends with a newline
        let complete = bytes
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |idx| idx + 1);
        bytes.truncate(complete);

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes.as_slice());
        let headers = reader
            .headers()
            .map_err(|e| StoreError::csv(path, e))?
            .clone();
        let mut good_end = reader.position().byte();

        let mut rows = Vec::new();
        let mut record = csv::StringRecord::new();
        loop {
            let line = reader.position().line();
            let parsed = reader
                .read_record(&mut record)
                .and_then(|more| more.then(|| record.deserialize::<R>(Some(&headers))).transpose());
            match parsed {
                Ok(Some(row)) => {
                    rows.push(row);
                    good_end = reader.position().byte();
                }
                Ok(None) => break,
                Err(e) => {
                    // Only the last row may be torn; anything after it is corruption
                    if matches!(reader.read_record(&mut record), Ok(true)) {
                        return Err(StoreError::Corrupt {
                            path: path.to_path_buf(),
                            line,
                        });
                    }
                    warn!(path = %path.display(), line, error = %e, "discarding torn journal row");
                    break;
                }
            }
        }

        if good_end < file_len {
            warn!(
                path = %path.display(),
                discarded = file_len - good_end,
                "truncating incomplete journal tail"
            );
            OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|file| {
                    file.set_len(good_end)?;
                    file.sync_data()
                })
                .map_err(|e| StoreError::io(path, e))?;
        }

        Ok((rows, good_end))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorRow {
    cursor: Cursor,
    updated_at: DateTime<Utc>,
}

/// Persisted reconciliation cursor, replaced atomically on every save.
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the cursor; a missing file means nothing has been processed yet.
    pub fn load(&self) -> Result<Cursor, StoreError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let mut reader = csv::Reader::from_path(&self.path)
            .map_err(|e| StoreError::csv(&self.path, e))?;
        match reader.deserialize::<CursorRow>().next() {
            Some(row) => Ok(row.map_err(|e| StoreError::csv(&self.path, e))?.cursor),
            None => Err(StoreError::Corrupt {
                path: self.path.clone(),
                line: 2,
            }),
        }
    }

    /// Durably replace the stored cursor.
    pub fn save(&self, cursor: Cursor) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let tmp = self.path.with_extension("tmp");
        let file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .serialize(CursorRow {
                cursor,
                updated_at: Utc::now(),
            })
            .map_err(|e| StoreError::csv(&tmp, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::io(&tmp, e.into_error()))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }
}
