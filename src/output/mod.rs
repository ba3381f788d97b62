//! Persisted records and where they go.
//!
//! The durable log is the only product of this crate that other tools
//! consume, so the row format is fixed here: one row per record with
//! `timestamp_iso, epoch, temp_c, humidity_pct, battery_mv`, missing values
//! written as empty strings.

pub mod csv_log;

use crate::store::ReadingStore;
use std::io;
use std::time::SystemTime;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Column names, in order.
pub const HEADER: [&str; 5] = ["timestamp_iso", "epoch", "temp_c", "humidity_pct", "battery_mv"];

/// Errors raised while appending to the log.
#[derive(Error, Debug)]
pub enum LogError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("cannot format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// One row of the durable log.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// UTC, truncated to whole seconds
    pub timestamp: OffsetDateTime,
    pub epoch_seconds: i64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery_mv: Option<u16>,
}

impl Record {
    /// Snapshot of `store` stamped with `now`.
    pub fn new(now: SystemTime, store: &ReadingStore) -> Self {
        let exact = OffsetDateTime::from(now);
        let timestamp = exact.replace_nanosecond(0).unwrap_or(exact);
        Record {
            timestamp,
            epoch_seconds: timestamp.unix_timestamp(),
            temperature: store.temperature(),
            humidity: store.humidity(),
            battery_mv: store.battery_mv(),
        }
    }

    /// The record as the five string fields of a log row.
    pub fn to_row(&self) -> Result<[String; 5], LogError> {
        Ok([
            self.timestamp.format(&Rfc3339)?,
            self.epoch_seconds.to_string(),
            self.temperature.map(|t| format!("{t:.2}")).unwrap_or_default(),
            self.humidity.map(|h| format!("{h:.2}")).unwrap_or_default(),
            self.battery_mv.map(|mv| mv.to_string()).unwrap_or_default(),
        ])
    }
}

/// Destination for persisted records.
pub trait RecordSink: Send {
    /// Append one record. Must not retry internally.
    fn append(&mut self, record: &Record) -> Result<(), LogError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;
    use std::time::Duration;

    #[test]
    fn test_row_with_all_fields() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_750);
        let mut store = ReadingStore::new();
        store.merge(&Reading {
            temperature: Some(21.456),
            humidity: Some(55.0),
            battery_mv: Some(2950),
            observed_at: now,
        });

        let record = Record::new(now, &store);
        assert_eq!(record.epoch_seconds, 1_700_000_000);
        assert_eq!(
            record.to_row().unwrap(),
            [
                "2023-11-14T22:13:20Z".to_string(),
                "1700000000".to_string(),
                "21.46".to_string(),
                "55.00".to_string(),
                "2950".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_fields_are_empty() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(60);
        let mut store = ReadingStore::new();
        store.merge(&Reading {
            temperature: Some(-3.5),
            ..Reading::empty(now)
        });

        let row = Record::new(now, &store).to_row().unwrap();
        assert_eq!(row[0], "1970-01-01T00:01:00Z");
        assert_eq!(row[2], "-3.50");
        assert_eq!(row[3], "");
        assert_eq!(row[4], "");
    }
}
