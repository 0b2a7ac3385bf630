//! Error types for the bridge.
//!
//! Errors are grouped by how the session orchestrator reacts to them:
//! transport and protocol errors end the current session, handshake errors
//! are scoped to one operation and the session carries on.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Error reported by a hardware trait implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HalError(pub String);

impl HalError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("unable to bind/listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("unable to accept connection: {0}")]
    Accept(io::Error),

    #[error("socket io failed: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    Closed,

    /// The socket was never attached to a connection or has been closed.
    #[error("socket not connected")]
    NotConnected,

    #[error("timed out after {0:?} waiting for the socket lock")]
    LockTimeout(Duration),

    /// The peer stopped draining the socket; the write half has been dropped.
    #[error("send did not complete within {0:?}")]
    SendTimeout(Duration),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("header length mismatch: expected {expected}, got {actual}")]
    ShortHeader { expected: usize, actual: usize },

    #[error("invalid magic: expected 'wulpus'")]
    BadMagic,

    #[error("invalid command: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("data length exceeds buffer size: {declared} > {capacity}")]
    PayloadTooLarge { declared: usize, capacity: usize },

    #[error("data length mismatch: expected {expected}, got {actual}")]
    ShortPayload { expected: usize, actual: usize },

    #[error("declared data length {declared} does not match payload of {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("companion did not assert data ready within {0:?}")]
    DataReadyTimeout(Duration),

    #[error("spi bus busy after {0:?}")]
    SpiBusy(Duration),

    #[error("spi transfer failed: {0}")]
    Spi(#[from] HalError),

    #[error("payload of {len} bytes does not fit the {block}-byte transfer block")]
    PayloadTooLarge { len: usize, block: usize },
}

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("network not ready: {0}")]
    Network(HalError),

    #[error("listener setup failed: {0}")]
    Listener(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

impl BridgeError {
    /// Whether the error ends the current session.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, BridgeError::Handshake(_))
    }
}

impl From<io::Error> for BridgeError {
    fn from(value: io::Error) -> Self {
        BridgeError::Transport(TransportError::Io(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_errors_keep_session_alive() {
        let err: BridgeError = HandshakeError::DataReadyTimeout(Duration::from_millis(10)).into();
        assert!(!err.is_session_fatal());
        let err: BridgeError = HandshakeError::SpiBusy(Duration::from_millis(10)).into();
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn transport_and_protocol_errors_end_session() {
        assert!(BridgeError::from(TransportError::Closed).is_session_fatal());
        assert!(BridgeError::from(ProtocolError::BadMagic).is_session_fatal());
    }

    #[test]
    fn protocol_error_messages_carry_lengths() {
        let err = ProtocolError::PayloadTooLarge {
            declared: 200,
            capacity: 68,
        };
        assert_eq!(err.to_string(), "data length exceeds buffer size: 200 > 68");
    }
}
