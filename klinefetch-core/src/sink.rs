//! Per-symbol CSV output.
//!
//! Each symbol owns one file, `<dir>/<BASE>_<QUOTE>-<timeframe>.csv`. Batches
//! are appended as they arrive, so an interrupted download keeps everything
//! fetched up to that point and a later run extends the same file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::Kline;
use crate::time::{render_timestamp, TimeError, TimestampStyle};
use crate::timeframe::Timeframe;

pub const CSV_HEADER: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV encoding failed: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Time(#[from] TimeError),
}

/// File name for a symbol's klines: `/` becomes `_`.
pub fn output_file_name(symbol: &str, timeframe: Timeframe) -> String {
    format!("{}-{}.csv", symbol.replace('/', "_"), timeframe)
}

/// Appends kline batches to one symbol's CSV file.
#[derive(Debug, Clone)]
pub struct CsvKlineSink {
    path: PathBuf,
    style: TimestampStyle,
    rows_written: usize,
}

impl CsvKlineSink {
    /// Sink for `symbol` inside `dir`. Nothing touches the disk until the first append.
    pub fn new(dir: &Path, symbol: &str, timeframe: Timeframe, style: TimestampStyle) -> Self {
        Self {
            path: dir.join(output_file_name(symbol, timeframe)),
            style,
            rows_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended through this sink.
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Append one batch. The header goes in only when the file starts out empty.
    pub fn append(&mut self, batch: &[Kline]) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let file = self.open()?;
        let needs_header = file.metadata().map_err(|e| self.io_error(e))?.len() == 0;

        let mut wtr = csv::Writer::from_writer(file);
        if needs_header {
            wtr.write_record(CSV_HEADER)?;
        }
        for k in batch {
            wtr.write_record([
                render_timestamp(k.timestamp, self.style)?,
                format!("{:?}", k.open),
                format!("{:?}", k.high),
                format!("{:?}", k.low),
                format!("{:?}", k.close),
                format!("{:?}", k.volume),
            ])?;
        }
        wtr.flush().map_err(|e| self.io_error(e))?;

        self.rows_written += batch.len();
        Ok(batch.len())
    }

    fn open(&self) -> Result<File, SinkError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
