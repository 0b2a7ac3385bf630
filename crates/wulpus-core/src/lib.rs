//! Gateway side of the WULPUS ultrasound probe.
//!
//! The bridge accepts one TCP client at a time, executes its framed commands
//! against the acquisition MCU over SPI and a pair of handshake lines, and
//! pushes a sample frame to the client on every data-ready edge while
//! streaming is enabled.

pub mod bridge;
pub mod client;
pub mod command;
pub mod config;
pub mod context;
pub mod doctor;
pub mod error;
pub mod hal;
pub mod link;
pub mod logging;
pub mod pipeline;
pub mod retention;
pub mod session;
pub mod sim;
pub mod socket;
pub mod test_support;

pub use bridge::{Bridge, Hardware, Platform};
pub use error::{BridgeError, BridgeResult, StartupError};
