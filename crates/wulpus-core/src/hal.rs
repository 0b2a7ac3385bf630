//! Seams between the bridge and the board.
//!
//! The bridge only talks to hardware and platform services through these
//! traits. [`crate::sim`] provides host implementations; a firmware build
//! supplies ones backed by the vendor HAL.

use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

use crate::error::HalError;

/// An output pin with level retention across light sleep.
///
/// While retention is enabled the pin ignores level changes. Writes go
/// through [`crate::retention::HoldReleased`], never directly.
pub trait RetainedOutput: Send {
    fn set_level(&mut self, high: bool) -> Result<(), HalError>;
    fn hold_enable(&mut self) -> Result<(), HalError>;
    fn hold_disable(&mut self) -> Result<(), HalError>;
}

/// SPI device on the shared bus to the acquisition MCU.
///
/// Chip select is driven by [`crate::link::HardwareLink`]; implementations
/// only clock bytes.
pub trait SpiDevice: Send {
    fn write(&mut self, tx: &[u8]) -> Result<(), HalError>;
    fn read(&mut self, rx: &mut [u8]) -> Result<(), HalError>;
}

/// Wi-Fi power save negotiation (TWT on the gateway radio).
pub trait RadioPowerSave: Send + Sync {
    /// `true` keeps the radio awake for low latency, `false` hands control
    /// back to the power-save schedule.
    fn suspend(&self, suspend: bool) -> Result<(), HalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Off,
    Provisioning,
    Idle,
    Transmitting,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Off => "off",
            Status::Provisioning => "provisioning",
            Status::Idle => "idle",
            Status::Transmitting => "transmitting",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// Board status LED or equivalent. Fire-and-forget.
pub trait StatusIndicator: Send + Sync {
    fn set(&self, status: Status);
}

pub trait NetworkProvisioner: Send + Sync {
    /// Blocks until the station has an address.
    fn wait_ready(&self) -> Result<IpAddr, HalError>;
}

/// Service discovery (mDNS on the device).
pub trait ServiceAdvertiser: Send + Sync {
    fn advertise(&self, name: &str, proto: &str, port: u16) -> Result<(), HalError>;
}

pub trait SystemControl: Send + Sync {
    fn restart(&self) -> !;
}
