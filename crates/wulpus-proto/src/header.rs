use std::fmt;

use crate::Command;

pub const MAGIC: [u8; 6] = *b"wulpus";

/// magic(6) || command(1) || data_length(2)
pub const HEADER_LEN: usize = 9;

/// Fixed-size frame header.
///
/// `command` is kept as the raw id so that a header carrying an unknown id can
/// still be echoed back unchanged. `data_length` is little-endian on the wire,
/// the native order of both MCUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub magic: [u8; 6],
    pub command: u8,
    pub data_length: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { actual: usize },
    BadMagic,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { actual } => {
                write!(f, "header truncated: expected {} bytes, got {}", HEADER_LEN, actual)
            }
            DecodeError::BadMagic => write!(f, "invalid header magic"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl CommandHeader {
    pub const fn new(command: Command, data_length: u16) -> Self {
        Self {
            magic: MAGIC,
            command: command.id(),
            data_length,
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_id(self.command)
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == MAGIC
    }

    /// The header as sent back to the client before any payload is handled.
    pub fn echo(&self) -> Self {
        Self {
            data_length: 0,
            ..*self
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..6].copy_from_slice(&self.magic);
        out[6] = self.command;
        out[7..].copy_from_slice(&self.data_length.to_le_bytes());
        out
    }

    /// Parses the raw fields without validating them.
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut magic = [0u8; 6];
        magic.copy_from_slice(&bytes[..6]);
        Self {
            magic,
            command: bytes[6],
            data_length: u16::from_le_bytes([bytes[7], bytes[8]]),
        }
    }

    /// Parses a header and checks its magic. Trailing bytes are ignored.
    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        let raw: &[u8; HEADER_LEN] = input
            .get(..HEADER_LEN)
            .and_then(|s| s.try_into().ok())
            .ok_or(DecodeError::Truncated {
                actual: input.len(),
            })?;
        let header = Self::from_bytes(raw);
        if !header.has_valid_magic() {
            return Err(DecodeError::BadMagic);
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_header_layout() {
        let bytes = CommandHeader::new(Command::Ping, 0).encode();
        assert_eq!(&bytes, b"wulpus\x59\x00\x00");
    }

    #[test]
    fn data_length_is_little_endian() {
        let bytes = CommandHeader::new(Command::GetData, 0x0324).encode();
        assert_eq!(bytes[7], 0x24);
        assert_eq!(bytes[8], 0x03);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert_eq!(
            CommandHeader::decode(b"wulpus\x59"),
            Err(DecodeError::Truncated { actual: 7 })
        );
    }

    #[test]
    fn decode_rejects_bad_magic() {
        assert_eq!(
            CommandHeader::decode(b"wulpuz\x59\x00\x00"),
            Err(DecodeError::BadMagic)
        );
    }

    #[test]
    fn echo_clears_length_only() {
        let header = CommandHeader::new(Command::SetConfig, 10);
        let echo = header.echo();
        assert_eq!(echo.magic, header.magic);
        assert_eq!(echo.command, header.command);
        assert_eq!(echo.data_length, 0);
    }
}
