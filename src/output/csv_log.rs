//! Append-only CSV log.

use super::{HEADER, LogError, Record, RecordSink};
use log::info;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// CSV file that only ever grows.
///
/// The file is opened per append so that external tools can rotate or
/// import it between writes; the header is written when the file is new or
/// empty.
#[derive(Debug, Clone)]
pub struct CsvLog {
    path: PathBuf,
}

impl CsvLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file (and its directory) with a header if it does not exist.
    pub fn ensure(&self) -> Result<(), LogError> {
        let file = self.open()?;
        if file.metadata()?.len() == 0 {
            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(HEADER)?;
            writer.flush()?;
            info!("Created {}", self.path.display());
        }
        Ok(())
    }

    fn open(&self) -> Result<File, LogError> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(file)
    }
}

impl RecordSink for CsvLog {
    fn append(&mut self, record: &Record) -> Result<(), LogError> {
        let row = record.to_row()?;
        let file = self.open()?;
        let is_new = file.metadata()?.len() == 0;

        let mut writer = csv::Writer::from_writer(file);
        if is_new {
            writer.write_record(HEADER)?;
        }
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }
}
