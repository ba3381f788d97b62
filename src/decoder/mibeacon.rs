//! MiBeacon advertisement decoder.
//!
//! Frame layout (all multi-byte fields little-endian):
//! - Bytes 0-1: frame control word (bit 3 set = payload encrypted)
//! - Byte 2: device id
//! - Byte 3: rolling frame counter
//! - Byte 4: declared payload length
//! - Bytes 5..: sub-records `[id: u16][len: u8][payload: len bytes]`
//!
//! Recognized sub-records:
//! - `0x1004`: temperature, `i16` hundredths of °C
//! - `0x1006`: humidity, `u16` hundredths of %RH
//! - `0x100D`: temperature then humidity, same encodings

use crate::reading::Reading;
use std::fmt;
use std::time::SystemTime;

/// 16-bit service data UUID carrying MiBeacon frames.
pub const MIBEACON_SERVICE_UUID16: u16 = 0xFE95;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 5;

const ENCRYPTED_FLAG: u16 = 1 << 3;

const ID_TEMPERATURE: u16 = 0x1004;
const ID_HUMIDITY: u16 = 0x1006;
const ID_TEMPERATURE_HUMIDITY: u16 = 0x100D;

/// One sub-record as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRecord {
    pub id: u16,
    pub payload: Vec<u8>,
}

impl fmt::Display for SubRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id=0x{:04x} len={} hex={}}}",
            self.id,
            self.payload.len(),
            super::hex(&self.payload)
        )
    }
}

/// Header fields and sub-records of a frame, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    pub frame_control: u16,
    pub encrypted: bool,
    pub device_id: u8,
    pub counter: u8,
    pub declared_len: u8,
    /// The complete frame as received
    pub raw: Vec<u8>,
    /// Sub-records walked before parsing stopped (empty for encrypted frames)
    pub records: Vec<SubRecord>,
}

impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enc={} fc=0x{:04x} dev_id=0x{:02x} cnt={} len={} hex={}",
            self.encrypted,
            self.frame_control,
            self.device_id,
            self.counter,
            self.declared_len,
            super::hex(&self.raw)
        )?;
        if !self.records.is_empty() {
            write!(f, " events=[")?;
            for (i, record) in self.records.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{record}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Decode a MiBeacon service data payload.
///
/// Returns `(None, None)` for frames shorter than the header. Encrypted frames
/// return no reading but full header diagnostics. A sub-record whose declared
/// length runs past the end of the frame stops the walk; everything parsed
/// before it is kept. The reading is `None` unless at least one recognized
/// sub-record was found, so "nothing new" is distinguishable from zeros.
pub fn decode_advertisement(
    data: &[u8],
    observed_at: SystemTime,
) -> (Option<Reading>, Option<DebugInfo>) {
    if data.len() < HEADER_LEN {
        return (None, None);
    }

    let frame_control = u16::from_le_bytes([data[0], data[1]]);
    let encrypted = frame_control & ENCRYPTED_FLAG != 0;
    let mut info = DebugInfo {
        frame_control,
        encrypted,
        device_id: data[2],
        counter: data[3],
        declared_len: data[4],
        raw: data.to_vec(),
        records: Vec::new(),
    };

    if encrypted {
        return (None, Some(info));
    }

    let mut reading = Reading::empty(observed_at);
    let mut pos = HEADER_LEN;
    while pos + 3 <= data.len() {
        let id = u16::from_le_bytes([data[pos], data[pos + 1]]);
        let len = usize::from(data[pos + 2]);
        pos += 3;
        if pos + len > data.len() {
            break;
        }
        let payload = &data[pos..pos + len];
        pos += len;

        apply_record(&mut reading, id, payload);
        info.records.push(SubRecord {
            id,
            payload: payload.to_vec(),
        });
    }

    let reading = (!reading.is_empty()).then_some(reading);
    (reading, Some(info))
}

fn apply_record(reading: &mut Reading, id: u16, payload: &[u8]) {
    match id {
        ID_TEMPERATURE if payload.len() >= 2 => {
            reading.temperature = Some(temperature(payload[0], payload[1]));
        }
        ID_HUMIDITY if payload.len() >= 2 => {
            reading.humidity = Some(humidity(payload[0], payload[1]));
        }
        ID_TEMPERATURE_HUMIDITY if payload.len() >= 4 => {
            reading.temperature = Some(temperature(payload[0], payload[1]));
            reading.humidity = Some(humidity(payload[2], payload[3]));
        }
        _ => {}
    }
}

fn temperature(lo: u8, hi: u8) -> f64 {
    f64::from(i16::from_le_bytes([lo, hi])) / 100.0
}

fn humidity(lo: u8, hi: u8) -> f64 {
    f64::from(u16::from_le_bytes([lo, hi])) / 100.0
}
