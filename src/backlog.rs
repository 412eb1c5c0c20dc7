//! Durable backlog of undelivered readings.
//!
//! On-disk format: a header row of schema field names followed by one row
//! per reading, fields in schema order. The file always reflects either the
//! complete set of undelivered readings or, after a confirmed flush, just
//! the header. Appends are encoded in memory first and written with a single
//! write plus fsync so a failed append cannot corrupt earlier rows.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{MeterError, Result};
use crate::reading::{field_names, Reading};

pub struct BacklogStore {
    path: PathBuf,
}

impl BacklogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty store with a header row if absent; never touches the
    /// rows of an existing store. An existing file whose header does not
    /// match the schema is rejected outright: the schema is the storage
    /// contract, and silently reinterpreting columns would corrupt replays.
    pub fn ensure_initialized(&self) -> Result<()> {
        let exists = self.path.exists();
        if !exists || self.file_len()? == 0 {
            self.write_header()?;
            if !exists {
                info!(path = %self.path.display(), "created empty backlog");
            }
            return Ok(());
        }

        let mut reader = csv::Reader::from_path(&self.path)
            .map_err(|e| self.persist_err("open", e.to_string()))?;
        let headers = reader
            .headers()
            .map_err(|e| self.persist_err("read", e.to_string()))?;
        if headers.iter().ne(field_names()) {
            return Err(self.persist_err(
                "open",
                format!("header does not match schema: {headers:?}"),
            ));
        }
        Ok(())
    }

    /// Durable single-record append.
    pub fn append(&self, reading: &Reading) -> Result<()> {
        let row = encode_row(&reading.to_record())
            .map_err(|e| self.persist_err("append", e.to_string()))?;

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| self.persist_err("append", e.to_string()))?;
        file.write_all(&row)
            .map_err(|e| self.persist_err("append", e.to_string()))?;
        file.sync_all()
            .map_err(|e| self.persist_err("append", e.to_string()))?;
        Ok(())
    }

    /// All stored readings in append order.
    pub fn read_all(&self) -> Result<Vec<Reading>> {
        let mut reader = csv::Reader::from_path(&self.path)
            .map_err(|e| self.persist_err("read", e.to_string()))?;

        let mut readings = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| self.persist_err("read", e.to_string()))?;
            let fields: Vec<String> = record.iter().map(str::to_string).collect();
            let reading = Reading::from_record(&fields)
                .map_err(|e| self.persist_err("read", e.to_string()))?;
            readings.push(reading);
        }
        Ok(readings)
    }

    /// Idempotent truncate back to just the header row.
    pub fn clear(&self) -> Result<()> {
        self.write_header()
    }

    fn write_header(&self) -> Result<()> {
        let header = encode_row(&field_names())
            .map_err(|e| self.persist_err("clear", e.to_string()))?;

        let mut file = std::fs::File::create(&self.path)
            .map_err(|e| self.persist_err("clear", e.to_string()))?;
        file.write_all(&header)
            .map_err(|e| self.persist_err("clear", e.to_string()))?;
        file.sync_all()
            .map_err(|e| self.persist_err("clear", e.to_string()))?;
        Ok(())
    }

    fn file_len(&self) -> Result<u64> {
        std::fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|e| self.persist_err("open", e.to_string()))
    }

    fn persist_err(&self, op: &'static str, reason: String) -> MeterError {
        MeterError::persist(op, self.path.display().to_string(), reason)
    }
}

/// Encode one row (terminator included) into an in-memory buffer.
fn encode_row<T: AsRef<[u8]>>(fields: &[T]) -> std::result::Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(fields.iter().map(AsRef::as_ref))?;
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(std::io::Error::other(e.to_string())))
}
