#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Mock hardware drivers that replay recorded traffic through the capability layer.

/// Driver contract and replay samples.
#[path = "../driver.rs"]
pub mod driver;

/// DSRC comms replay driver.
#[path = "../dsrc.rs"]
pub mod dsrc;

/// Hex payload handling.
#[path = "../payload.rs"]
pub mod payload;

pub use driver::{DriverError, MockDriver, ReplaySample};
pub use dsrc::{BinaryMessage, DsrcReplayDriver, DsrcSettings, MessageHeader, PayloadMode};
pub use payload::{decode_hex_payload, sanitize_hex, STATIC_BSM_PAYLOADS};
