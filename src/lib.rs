//! `mijia-logger` library.
//!
//! The binary (`src/main.rs`) is responsible for logger installation and process
//! exit codes. The core "business logic" lives in [`crate::app`] where it can be
//! tested deterministically with an injected radio, selection source and sink.

pub mod acquire;
pub mod app;
pub mod backoff;
pub mod decoder;
pub mod gate;
pub mod mac_address;
pub mod output;
pub mod reading;
pub mod selector;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use acquire::{AcquireConfig, Acquisition, Mode};
pub use app::{Options, RunError, run_with_io};
pub use decoder::{decode_advertisement, decode_notification};
pub use gate::{PersistenceGate, parse_duration};
pub use mac_address::MacAddress;
pub use output::csv_log::CsvLog;
pub use output::{Record, RecordSink};
pub use reading::Reading;
pub use selector::{DeviceSelector, FileSelection, SelectionSource, StaticSelection};
pub use session::{Radio, SessionConfig, SessionError};
pub use store::ReadingStore;
