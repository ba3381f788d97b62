//! Resolution of the device the collector should talk to.
//!
//! The selection is owned by something outside this process (normally the
//! dashboard writing `config.json`), so it is polled rather than pushed and
//! any failure to read it simply means "nothing selected".

use crate::mac_address::{MacAddress, ParseMacError};
use log::{debug, info};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Why a selection could not be loaded. Only ever logged.
#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("cannot read selection file: {0}")]
    Io(#[from] io::Error),
    #[error("malformed selection file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad device address: {0}")]
    Address(#[from] ParseMacError),
}

/// Where the selected device address comes from.
pub trait SelectionSource: Send {
    /// Load the current selection; `Ok(None)` when nothing is selected.
    fn load(&self) -> Result<Option<MacAddress>, SelectionError>;
}

#[derive(Debug, Deserialize)]
struct SelectionFile {
    #[serde(default)]
    device_mac: Option<String>,
}

/// JSON file with a `device_mac` key, e.g. `{"device_mac": "A4:C1:38:12:34:56"}`.
#[derive(Debug, Clone)]
pub struct FileSelection {
    path: PathBuf,
}

impl FileSelection {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSelection { path: path.into() }
    }
}

impl SelectionSource for FileSelection {
    fn load(&self) -> Result<Option<MacAddress>, SelectionError> {
        let text = fs::read_to_string(&self.path)?;
        parse_selection(&text)
    }
}

/// Parse the contents of a selection file.
///
/// A missing or blank `device_mac` is no selection, not an error.
pub fn parse_selection(text: &str) -> Result<Option<MacAddress>, SelectionError> {
    let file: Option<SelectionFile> = serde_json::from_str(text)?;
    match file.and_then(|f| f.device_mac) {
        Some(mac) if !mac.trim().is_empty() => Ok(Some(mac.parse()?)),
        _ => Ok(None),
    }
}

/// A fixed address given on the command line.
#[derive(Debug, Clone, Copy)]
pub struct StaticSelection(pub MacAddress);

impl SelectionSource for StaticSelection {
    fn load(&self) -> Result<Option<MacAddress>, SelectionError> {
        Ok(Some(self.0))
    }
}

/// Caches the selection and re-reads the source at most once per `refresh`.
pub struct DeviceSelector {
    source: Box<dyn SelectionSource>,
    refresh: Duration,
    current: Option<MacAddress>,
    loaded_at: Option<Instant>,
}

impl DeviceSelector {
    pub fn new(source: Box<dyn SelectionSource>, refresh: Duration) -> Self {
        DeviceSelector {
            source,
            refresh,
            current: None,
            loaded_at: None,
        }
    }

    /// How often the source is re-read.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh
    }

    /// The selected address as of `now`, re-reading the source when the
    /// cached value is older than the refresh interval.
    pub fn resolve(&mut self, now: Instant) -> Option<MacAddress> {
        let due = self
            .loaded_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.refresh);
        if due {
            self.reload(now);
        }
        self.current
    }

    fn reload(&mut self, now: Instant) {
        let loaded = match self.source.load() {
            Ok(selection) => selection,
            Err(e) => {
                debug!("No device selection: {e}");
                None
            }
        };
        if loaded != self.current {
            match loaded {
                Some(mac) => info!("Selected device is now {mac}"),
                None => info!("Device selection cleared"),
            }
        }
        self.current = loaded;
        self.loaded_at = Some(now);
    }
}
