//! Core application runner for `mijia-logger`.
//!
//! This module is decoupled from logger installation and process exit codes
//! so it can be tested deterministically with an injected radio, selection
//! source and record sink.

pub use crate::acquire::Mode;
use crate::acquire::{AcquireConfig, Acquisition};
use crate::gate::{PersistenceGate, parse_duration};
use crate::mac_address::MacAddress;
use crate::output::RecordSink;
use crate::selector::{DeviceSelector, FileSelection, SelectionSource, StaticSelection};
use crate::session::{Radio, SessionConfig, Shutdown};
use crate::store::ReadingStore;
use clap::Parser;
use clap::builder::FalseyValueParser;
use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{MissedTickBehavior, interval, timeout};

/// Channel buffer size for decoded readings.
pub const READING_CHANNEL_BUFFER_SIZE: usize = 100;

/// Cadence at which the persistence gate is consulted.
pub const PERSIST_TICK: Duration = Duration::from_secs(1);

/// How long the acquisition task gets to release its link after shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Collector configuration.
///
/// Every option can also be set through the environment (or a `.env` file).
/// Durations accept a suffix: 3s, 1m, 500ms, 2h. Without suffix, the value
/// is interpreted as seconds.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Path of the CSV log
    #[arg(long, env = "OUTPUT", default_value = "/data/current.csv")]
    pub output: PathBuf,

    /// Minimum time between two log rows
    #[arg(long, env = "INTERVAL_SECONDS", default_value = "600", value_parser = parse_duration)]
    pub interval: Duration,

    /// Stop logging when nothing changed for this long [default: 3 x interval]
    #[arg(long, env = "STALE_AFTER", value_parser = parse_duration)]
    pub stale_after: Option<Duration>,

    /// Ignore advertisements weaker than this (dBm)
    #[arg(long, env = "MIN_RSSI", default_value_t = -120, allow_negative_numbers = true)]
    pub min_rssi: i16,

    /// How long to look for the device before giving up
    #[arg(long, env = "SCAN_TIMEOUT", default_value = "25", value_parser = parse_duration)]
    pub scan_timeout: Duration,

    #[arg(long, env = "CONNECT_TIMEOUT", default_value = "15", value_parser = parse_duration)]
    pub connect_timeout: Duration,

    /// How long one poll waits for notifications
    #[arg(long, env = "NOTIFY_WINDOW_SECS", default_value = "60", value_parser = parse_duration)]
    pub notify_window: Duration,

    /// Pause after a successful poll
    #[arg(long, env = "IDLE_BETWEEN_CYCLES", default_value = "8", value_parser = parse_duration)]
    pub idle_between_cycles: Duration,

    /// Upper bound of the retry delay
    #[arg(long, env = "MAX_BACKOFF", default_value = "60", value_parser = parse_duration)]
    pub max_backoff: Duration,

    /// Multiplier applied to the raw humidity byte of notifications
    #[arg(long, env = "HUMIDITY_SCALE", default_value_t = 1.70)]
    pub humidity_scale: f64,

    /// How readings are obtained
    #[arg(long, env = "COLLECTOR_MODE", default_value_t, value_enum)]
    pub mode: Mode,

    /// Log raw frame bytes in hex
    #[arg(long, env = "PRINT_RAW", value_parser = FalseyValueParser::new())]
    pub print_raw: bool,

    /// JSON file holding the selected device (`device_mac`)
    #[arg(long = "config", env = "SETUP_CONFIG_PATH", default_value = "/data/config.json")]
    pub config: PathBuf,

    /// Use this device and ignore the selection file
    #[arg(long, env = "DEVICE_MAC")]
    pub device: Option<MacAddress>,

    /// How often the selection file is re-read
    #[arg(long, env = "SELECTION_REFRESH", default_value = "2", value_parser = parse_duration)]
    pub selection_refresh: Duration,

    /// Verbose output, log session transitions and advertisement details
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    pub fn staleness_window(&self) -> Duration {
        self.stale_after
            .unwrap_or_else(|| self.interval.saturating_mul(3))
    }

    pub fn acquire_config(&self) -> AcquireConfig {
        AcquireConfig {
            mode: self.mode,
            session: SessionConfig {
                scan_timeout: self.scan_timeout,
                connect_timeout: self.connect_timeout,
                read_window: self.notify_window,
                humidity_scale: self.humidity_scale,
                min_rssi: self.min_rssi,
                print_raw: self.print_raw,
            },
            max_backoff: self.max_backoff,
            idle_between_cycles: self.idle_between_cycles,
        }
    }

    /// A fixed `--device` wins over the selection file.
    pub fn selection_source(&self) -> Box<dyn SelectionSource> {
        match self.device {
            Some(address) => Box::new(StaticSelection(address)),
            None => Box::new(FileSelection::new(&self.config)),
        }
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("cannot wait for shutdown signal: {0}")]
    Signal(#[from] io::Error),
    #[error("acquisition task failed: {0}")]
    Acquisition(#[from] JoinError),
}

/// Run the collector until `shutdown` completes.
///
/// - Readings from the acquisition task are merged into the store; changes are logged.
/// - Once per [`PERSIST_TICK`] the persistence gate may append a record to `sink`.
/// - Link and append failures never end the loop; only the shutdown future does.
/// - On shutdown the acquisition task is asked to stop and given [`SHUTDOWN_GRACE`]
///   to release its link before it is aborted.
pub async fn run_with_io<F>(
    options: &Options,
    radio: Arc<dyn Radio>,
    selection: Box<dyn SelectionSource>,
    sink: &mut dyn RecordSink,
    shutdown: F,
) -> Result<(), RunError>
where
    F: Future<Output = io::Result<()>>,
{
    let (tx, mut readings) = mpsc::channel(READING_CHANNEL_BUFFER_SIZE);
    let (stop_acquisition, stop_signal) = Shutdown::channel();
    let selector = DeviceSelector::new(selection, options.selection_refresh);
    let acquisition = Acquisition::new(radio, selector, options.acquire_config(), tx)
        .with_shutdown(stop_signal);
    let mut task = tokio::spawn(acquisition.run());

    let mut store = ReadingStore::new();
    let mut gate = PersistenceGate::new(options.interval, options.staleness_window());
    let mut ticker = interval(PERSIST_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            signal = &mut shutdown => {
                info!("Shutting down");
                break signal.map_err(RunError::from);
            }
            received = readings.recv() => match received {
                Some(reading) => {
                    if store.merge(&reading) {
                        info!("[DATA] {reading}");
                    } else {
                        debug!("[DATA] unchanged {reading}");
                    }
                }
                // The task only drops its sender when it ends.
                None => break Ok(()),
            },
            _ = ticker.tick() => {
                gate.tick(SystemTime::now(), &store, sink);
            }
        }
    };

    // Let the acquisition task close its session so the link is released.
    let _ = stop_acquisition.send(true);
    drop(readings);
    let joined = match timeout(SHUTDOWN_GRACE, &mut task).await {
        Ok(joined) => joined.map_err(RunError::from),
        Err(_) => {
            warn!("Acquisition did not stop within {SHUTDOWN_GRACE:?}, aborting it");
            task.abort();
            Ok(())
        }
    };

    match store.snapshot() {
        Some(last) => info!("Last known reading: {last}"),
        None => info!("No reading received"),
    }
    if let Some(written) = gate.last_written() {
        let age = SystemTime::now()
            .duration_since(written)
            .unwrap_or_default();
        debug!("Last record written {}s ago", age.as_secs());
    }

    result?;
    joined
}
