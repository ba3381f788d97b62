//! Sensor reading data structure.

use std::fmt;
use std::time::SystemTime;

/// A possibly partial reading decoded from one frame (or one read window).
///
/// Units:
/// - Temperature in Celsius
/// - Relative humidity in percent
/// - Battery in millivolts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Temperature in Celsius
    pub temperature: Option<f64>,
    /// Relative humidity in percent
    pub humidity: Option<f64>,
    /// Battery potential in millivolts
    pub battery_mv: Option<u16>,
    /// When the frame carrying these values was received
    pub observed_at: SystemTime,
}

impl Reading {
    /// A reading with no fields set.
    pub fn empty(observed_at: SystemTime) -> Self {
        Reading {
            temperature: None,
            humidity: None,
            battery_mv: None,
            observed_at,
        }
    }

    /// True when no field is present.
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.humidity.is_none() && self.battery_mv.is_none()
    }

    /// True when both temperature and humidity are present.
    pub fn has_climate(&self) -> bool {
        self.temperature.is_some() && self.humidity.is_some()
    }

    /// Overlay the fields present in `newer` onto `self`.
    pub fn absorb(&mut self, newer: &Reading) {
        if newer.temperature.is_some() {
            self.temperature = newer.temperature;
        }
        if newer.humidity.is_some() {
            self.humidity = newer.humidity;
        }
        if newer.battery_mv.is_some() {
            self.battery_mv = newer.battery_mv;
        }
        self.observed_at = newer.observed_at;
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        if let Some(t) = self.temperature {
            write!(f, "T={t:.2}°C")?;
            sep = " ";
        }
        if let Some(h) = self.humidity {
            write!(f, "{sep}H={h:.2}%")?;
            sep = " ";
        }
        if let Some(mv) = self.battery_mv {
            write!(f, "{sep}(batt={mv}mV)")?;
        }
        Ok(())
    }
}
