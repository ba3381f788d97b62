//! GATT notification decoder.
//!
//! Observed layout (little-endian):
//! - Bytes 0-1: temperature, `i16` hundredths of °C
//! - Byte 2: humidity in a device-specific unit, scaled by a configured factor
//! - Bytes 3-4: battery, `u16` millivolts

use crate::reading::Reading;
use std::time::SystemTime;

/// Shortest frame that carries all three values.
pub const MIN_FRAME_LEN: usize = 5;

/// Decode one notification payload.
///
/// Frames shorter than [`MIN_FRAME_LEN`] decode to an empty reading. Humidity
/// is `raw * humidity_scale` rounded to two decimals.
pub fn decode_notification(data: &[u8], humidity_scale: f64, observed_at: SystemTime) -> Reading {
    if data.len() < MIN_FRAME_LEN {
        return Reading::empty(observed_at);
    }

    let raw_temperature = i16::from_le_bytes([data[0], data[1]]);
    let humidity = (f64::from(data[2]) * humidity_scale * 100.0).round() / 100.0;

    Reading {
        temperature: Some(f64::from(raw_temperature) / 100.0),
        humidity: Some(humidity),
        battery_mv: Some(u16::from_le_bytes([data[3], data[4]])),
        observed_at,
    }
}
