//! Last-known-good reading.
//!
//! Fields are merged one by one: a field missing from a new reading never
//! clears the stored value. The time of the last actual change is tracked so
//! that values stop being persisted once the device has gone quiet.

use crate::reading::Reading;
use std::time::{Duration, SystemTime};

/// Last known value of every field plus the time any of them last changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingStore {
    temperature: Option<f64>,
    humidity: Option<f64>,
    battery_mv: Option<u16>,
    last_seen: Option<SystemTime>,
}

impl ReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the fields present in `incoming`.
    ///
    /// Returns `true` when at least one stored value changed; in that case
    /// `last_seen` becomes `incoming.observed_at`. Re-delivering identical
    /// values is a no-op.
    pub fn merge(&mut self, incoming: &Reading) -> bool {
        let mut changed = false;
        changed |= update(&mut self.temperature, incoming.temperature);
        changed |= update(&mut self.humidity, incoming.humidity);
        changed |= update(&mut self.battery_mv, incoming.battery_mv);
        if changed {
            self.last_seen = Some(incoming.observed_at);
        }
        changed
    }

    /// True iff something changed within `staleness_window` before `now`.
    ///
    /// A `last_seen` in the future (clock stepped back) counts as fresh.
    pub fn has_fresh_data(&self, now: SystemTime, staleness_window: Duration) -> bool {
        match self.last_seen {
            Some(seen) => now
                .duration_since(seen)
                .map_or(true, |age| age < staleness_window),
            None => false,
        }
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    pub fn humidity(&self) -> Option<f64> {
        self.humidity
    }

    pub fn battery_mv(&self) -> Option<u16> {
        self.battery_mv
    }

    pub fn last_seen(&self) -> Option<SystemTime> {
        self.last_seen
    }

    /// Current values as a reading stamped with `last_seen`.
    pub fn snapshot(&self) -> Option<Reading> {
        self.last_seen.map(|observed_at| Reading {
            temperature: self.temperature,
            humidity: self.humidity,
            battery_mv: self.battery_mv,
            observed_at,
        })
    }
}

fn update<T: PartialEq + Copy>(slot: &mut Option<T>, incoming: Option<T>) -> bool {
    match incoming {
        Some(value) if *slot != Some(value) => {
            *slot = Some(value);
            true
        }
        _ => false,
    }
}
