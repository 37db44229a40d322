// SPDX-License-Identifier: Apache-2.0

//! Newline-delimited JSON record writer, used for debug output such as
//! allocation records.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

/// Errors from [`NdjsonLogger`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to open or write the output file.
    #[error("ndjson I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to serialize a record.
    #[error("ndjson serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Writes one JSON object per line to a file.
pub struct NdjsonLogger {
    out: BufWriter<File>,
}

impl NdjsonLogger {
    /// Creates (truncating) the output file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = File::create(path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    /// Appends one record as a JSON line and flushes it.
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<(), Error> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}
