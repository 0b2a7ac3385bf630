//! Per-connection command loop.
//!
//! ```text
//! IDLE -> AWAIT_HEADER -> DISPATCH -> AWAIT_HEADER
//!                                  \-> CLOSED
//! ```
//!
//! Transport and protocol errors close the session. Handshake errors
//! (data-ready timeout, busy SPI bus) are logged and the loop keeps going.

use tracing::{error, info, warn};
use wulpus_proto::{Command, CommandHeader, PONG_PAYLOAD};

use crate::command::{receive_command, send_command};
use crate::context::BridgeContext;
use crate::error::{BridgeError, BridgeResult, HandshakeError};
use crate::link::config_block;
use crate::pipeline::recover_missed_edge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitHeader,
    Dispatch(Command),
    Closed,
}

/// What the loop does after a command has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
    Restart,
}

#[derive(Debug)]
pub enum SessionEnd {
    /// Client sent `CLOSE`.
    Closed,
    /// Client sent `RESET`; the caller restarts the device after cleanup.
    Restart,
    Failed(BridgeError),
}

pub struct Session<'a> {
    ctx: &'a BridgeContext,
    state: SessionState,
    payload: Vec<u8>,
}

impl<'a> Session<'a> {
    pub fn new(ctx: &'a BridgeContext) -> Self {
        Self {
            ctx,
            state: SessionState::Idle,
            payload: vec![0u8; ctx.settings().max_payload],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run(&mut self) -> SessionEnd {
        loop {
            self.state = SessionState::AwaitHeader;
            let received = match receive_command(self.ctx.connection(), &mut self.payload).await {
                Ok(received) => received,
                Err(err) => {
                    self.state = SessionState::Closed;
                    return SessionEnd::Failed(err);
                }
            };

            self.state = SessionState::Dispatch(received.command);
            match self.dispatch(received.command, received.payload_len).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => {
                    self.state = SessionState::Closed;
                    return SessionEnd::Closed;
                }
                Ok(Flow::Restart) => {
                    self.state = SessionState::Closed;
                    return SessionEnd::Restart;
                }
                Err(err) if err.is_session_fatal() => {
                    error!(command = %received.command, error = %err, "command failed");
                    self.state = SessionState::Closed;
                    return SessionEnd::Failed(err);
                }
                Err(err) => {
                    warn!(command = %received.command, error = %err, "command failed, session continues");
                }
            }
        }
    }

    /// Handles one command whose payload is in the first `len` bytes of the
    /// session buffer.
    pub async fn dispatch(&mut self, command: Command, len: usize) -> BridgeResult<Flow> {
        match command {
            Command::SetConfig => {
                self.set_config(len).await?;
                Ok(Flow::Continue)
            }
            Command::GetData => {
                info!("GET_DATA requests are not served; samples are pushed while RX is on");
                Ok(Flow::Continue)
            }
            Command::Ping => {
                let header = CommandHeader::new(Command::Pong, PONG_PAYLOAD.len() as u16);
                send_command(self.ctx.connection(), &header, PONG_PAYLOAD).await?;
                Ok(Flow::Continue)
            }
            Command::Pong => {
                warn!("ignoring PONG sent by client");
                Ok(Flow::Continue)
            }
            Command::Reset => Ok(Flow::Restart),
            Command::Close => Ok(Flow::Close),
            Command::StartRx => {
                self.ctx.set_transmits_enabled(true);
                recover_missed_edge(self.ctx);
                Ok(Flow::Continue)
            }
            Command::StopRx => {
                self.ctx.set_transmits_enabled(false);
                Ok(Flow::Continue)
            }
        }
    }

    async fn set_config(&self, len: usize) -> Result<(), HandshakeError> {
        let block = config_block(&self.payload[..len])?;
        let link = self.ctx.link();
        let data_ready = self.ctx.data_ready();

        data_ready.clear();
        link.set_link_ready(true)?;

        let timeout = self.ctx.settings().handshake_timeout;
        let acked = data_ready.take(timeout).await;
        let result = if acked {
            link.write_config(&block).await
        } else {
            Err(HandshakeError::DataReadyTimeout(timeout))
        };

        if let Err(err) = link.set_link_ready(false) {
            warn!(error = %err, "failed to release link ready");
        }
        if result.is_ok() {
            info!(len, "configuration transferred");
        }
        result
    }
}
