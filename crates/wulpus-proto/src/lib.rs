//! Wire definitions for the WULPUS command bridge.
//!
//! Every frame on the TCP link is a fixed 9-byte [`CommandHeader`] followed by
//! `data_length` payload bytes. The same header format is used in both
//! directions: client commands, the bridge's header echo, `PONG` replies and
//! pushed `GET_DATA` sample frames.

use std::fmt;

pub mod header;
pub mod sample;

pub use header::{CommandHeader, DecodeError, HEADER_LEN, MAGIC};
pub use sample::{Acquisition, BlockLengthError, SAMPLES_PER_BLOCK};

/// Size of the configuration block clocked to the acquisition MCU.
pub const CONFIG_BLOCK_LEN: usize = 68;

/// Size of one sample block clocked from the acquisition MCU.
pub const SAMPLE_BLOCK_LEN: usize = 804;

/// Payload sent after a `PONG` header.
pub const PONG_PAYLOAD: &[u8; 4] = b"pong";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    SetConfig = 0x57,
    /// Reserved as a request; reused by the bridge for pushed sample frames.
    GetData = 0x58,
    Ping = 0x59,
    /// Response only.
    Pong = 0x5A,
    Reset = 0x5B,
    Close = 0x5C,
    StartRx = 0x5D,
    StopRx = 0x5E,
}

impl Command {
    pub const MIN_ID: u8 = 0x57;
    pub const MAX_ID: u8 = 0x5E;

    pub const ALL: [Command; 8] = [
        Command::SetConfig,
        Command::GetData,
        Command::Ping,
        Command::Pong,
        Command::Reset,
        Command::Close,
        Command::StartRx,
        Command::StopRx,
    ];

    pub fn from_id(id: u8) -> Option<Self> {
        if !(Self::MIN_ID..=Self::MAX_ID).contains(&id) {
            return None;
        }
        Some(Self::ALL[(id - Self::MIN_ID) as usize])
    }

    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::SetConfig => "SET_CONFIG",
            Command::GetData => "GET_DATA",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::Reset => "RESET",
            Command::Close => "CLOSE",
            Command::StartRx => "START_RX",
            Command::StopRx => "STOP_RX",
        }
    }

    /// Name for a raw id, `UNKNOWN` when it is outside the command range.
    pub fn name_of(id: u8) -> &'static str {
        Self::from_id(id).map(Self::name).unwrap_or("UNKNOWN")
    }

    pub fn is_response_only(self) -> bool {
        matches!(self, Command::Pong)
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Command::from_id(value).ok_or(value)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
