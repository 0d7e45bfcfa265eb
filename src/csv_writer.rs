//! Writes [`TrialRecord`]s to a CSV file.
//!
//! The writer is a [`Component`], so it normally runs on its own thread
//! behind a [`ChannelSink`](crate::trial_record::ChannelSink) and file I/O
//! never stalls the experiment tick.

use crate::component::{Component, ComponentError};
use crate::trial_record::TrialRecord;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Appends trial rows to a CSV file, writing the header first if the file
/// is new or empty.
pub struct CsvTrialWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvTrialWriter<File> {
    /// Opens `path` for appending, creating it if needed.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut writer = Self::wrap(file);
        if fresh {
            writer.write_header()?;
        }
        Ok(writer)
    }
}

impl<W: Write> CsvTrialWriter<W> {
    /// Wraps an arbitrary writer and writes the header to it.
    pub fn with_header(writer: W) -> io::Result<Self> {
        let mut writer = Self::wrap(writer);
        writer.write_header()?;
        Ok(writer)
    }

    fn wrap(writer: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);
        Self { writer }
    }

    fn write_header(&mut self) -> io::Result<()> {
        self.writer.write_record(TrialRecord::HEADER)?;
        self.writer.flush()
    }

    /// Appends one row and flushes, so a crash loses at most the row in
    /// flight.
    pub fn write_record(&mut self, record: &TrialRecord) -> io::Result<()> {
        self.writer.write_record(record.values())?;
        self.writer.flush()
    }

    /// Flushes and gives back the underlying writer.
    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write> Component for CsvTrialWriter<W> {
    type InData = TrialRecord;
    type OutData = io::Result<()>;

    fn convert(&mut self, input: TrialRecord) -> io::Result<()> {
        self.write_record(&input)
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        self.writer.flush().map_err(ComponentError::IoError)
    }
}

impl<W: Write> ToString for CsvTrialWriter<W> {
    fn to_string(&self) -> String {
        "CsvTrialWriter".to_string()
    }
}
