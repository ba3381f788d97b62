//! Interval gate in front of the durable log.
//!
//! On every tick the gate decides whether a record is due: the write interval
//! must have elapsed since the last attempt and the store must hold fresh
//! data. At most one record is appended per interval, and a failed append is
//! not retried before the next interval.

use crate::output::{Record, RecordSink};
use crate::store::ReadingStore;
use log::{error, info};
use std::time::{Duration, SystemTime};

/// Decides when the current store contents are appended to the log.
#[derive(Debug)]
pub struct PersistenceGate {
    /// Minimum time between two appends
    interval: Duration,
    /// Maximum age of the last change that is still written out
    staleness_window: Duration,
    /// Time of the last append attempt
    last_written: Option<SystemTime>,
}

impl PersistenceGate {
    /// Create a gate; the first fresh tick writes immediately.
    pub fn new(interval: Duration, staleness_window: Duration) -> Self {
        PersistenceGate {
            interval,
            staleness_window,
            last_written: None,
        }
    }

    /// True when a record should be appended at `now`.
    pub fn is_due(&self, now: SystemTime, store: &ReadingStore) -> bool {
        let interval_elapsed = match self.last_written {
            // A clock that stepped back counts as "not yet".
            Some(last) => now
                .duration_since(last)
                .is_ok_and(|since| since >= self.interval),
            None => true,
        };
        interval_elapsed && store.has_fresh_data(now, self.staleness_window)
    }

    /// Append one record if due. Returns the record when it was written.
    ///
    /// Append failures are logged and the attempt still counts, so the next
    /// try happens one interval later.
    pub fn tick(
        &mut self,
        now: SystemTime,
        store: &ReadingStore,
        sink: &mut dyn RecordSink,
    ) -> Option<Record> {
        if !self.is_due(now, store) {
            return None;
        }
        self.last_written = Some(now);

        let record = Record::new(now, store);
        match sink.append(&record) {
            Ok(()) => {
                info!("[LOG] wrote record at {}", record.timestamp);
                Some(record)
            }
            Err(e) => {
                error!("Failed to append record: {e}; skipping until next interval");
                None
            }
        }
    }

    pub fn last_written(&self) -> Option<SystemTime> {
        self.last_written
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use mijia_logger::gate::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("600").unwrap(), Duration::from_secs(600));
/// assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, scale_ms) = if let Some(num) = src.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3_600_000)
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1_000)
    } else {
        (src, 1_000)
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;
    value
        .checked_mul(scale_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration too large: {}", src))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;
    use crate::test_utils::MemorySink;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn store_seen_at(secs: u64) -> ReadingStore {
        let mut store = ReadingStore::new();
        store.merge(&Reading {
            temperature: Some(21.5),
            humidity: Some(45.0),
            battery_mv: None,
            observed_at: at(secs),
        });
        store
    }

    fn gate() -> PersistenceGate {
        PersistenceGate::new(Duration::from_secs(600), Duration::from_secs(1800))
    }

    #[test]
    fn test_nothing_written_without_data() {
        let mut gate = gate();
        let mut sink = MemorySink::default();
        let store = ReadingStore::new();

        assert!(gate.tick(at(0), &store, &mut sink).is_none());
        assert!(sink.records.is_empty());
        assert_eq!(gate.last_written(), None);
    }

    #[test]
    fn test_first_fresh_tick_writes() {
        let mut gate = gate();
        let mut sink = MemorySink::default();
        let store = store_seen_at(0);

        let record = gate.tick(at(1), &store, &mut sink).unwrap();
        assert_eq!(record.temperature, Some(21.5));
        assert_eq!(record.humidity, Some(45.0));
        assert_eq!(record.battery_mv, None);
        assert_eq!(sink.records.len(), 1);
    }

    #[test]
    fn test_at_most_one_record_per_interval() {
        let mut gate = gate();
        let mut sink = MemorySink::default();
        let mut store = store_seen_at(0);

        for secs in 0..=1200 {
            // Keep the data fresh with a change every second.
            store.merge(&Reading {
                battery_mv: Some(secs as u16),
                ..Reading::empty(at(secs))
            });
            gate.tick(at(secs), &store, &mut sink);
        }

        let epochs: Vec<i64> = sink.records.iter().map(|r| r.epoch_seconds).collect();
        assert_eq!(
            epochs,
            vec![1_700_000_000, 1_700_000_600, 1_700_001_200]
        );
    }

    #[test]
    fn test_stale_data_is_not_written() {
        let mut gate = gate();
        let mut sink = MemorySink::default();
        let store = store_seen_at(0);

        assert!(gate.tick(at(1800), &store, &mut sink).is_none());
        assert!(gate.tick(at(5000), &store, &mut sink).is_none());
        assert!(sink.records.is_empty());
    }

    #[test]
    fn test_data_goes_stale_between_writes() {
        let mut gate = gate();
        let mut sink = MemorySink::default();
        let store = store_seen_at(0);

        assert!(gate.tick(at(0), &store, &mut sink).is_some());
        assert!(gate.tick(at(600), &store, &mut sink).is_some());
        assert!(gate.tick(at(1200), &store, &mut sink).is_some());
        // 1800 s after the last change
        assert!(gate.tick(at(1800), &store, &mut sink).is_none());
        assert_eq!(sink.records.len(), 3);
    }

    #[test]
    fn test_failed_append_waits_for_next_interval() {
        let mut gate = gate();
        let mut sink = MemorySink {
            fail: true,
            ..Default::default()
        };
        let store = store_seen_at(0);

        assert!(gate.tick(at(0), &store, &mut sink).is_none());
        assert_eq!(gate.last_written(), Some(at(0)));

        sink.fail = false;
        assert!(gate.tick(at(1), &store, &mut sink).is_none());
        assert!(gate.tick(at(600), &store, &mut sink).is_some());
        assert_eq!(sink.records.len(), 1);
    }

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("600").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration(" 25 ").unwrap(), Duration::from_secs(25));
        assert_eq!(parse_duration("3 s").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("1.5").is_err());
        assert!(parse_duration("18446744073709551615h").is_err());
    }
}
