//! Frame decoders for the two wire encodings the thermometer speaks.
//!
//! - [`mibeacon`]: unconnected advertisements (service data UUID `0xFE95`)
//! - [`notify`]: GATT notifications on the sensor characteristic
//!
//! Both are pure functions over byte slices. Anything that cannot be decoded
//! yields "no reading" instead of an error; there is nothing to retry once a
//! frame has been received.

pub mod mibeacon;
pub mod notify;

pub use mibeacon::{DebugInfo, SubRecord, decode_advertisement};
pub use notify::decode_notification;

/// Lower-case hex dump without separators, e.g. `e8032d5802`.
pub fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Writing into a String cannot fail.
        let _ = write!(out, "{b:02x}");
    }
    out
}
