//! Client side of the command protocol.
//!
//! Every command is answered by an echo of its header with `data_length = 0`.
//! Sample frames pushed by the bridge can arrive between a command and its
//! echo; [`BridgeClient`] queues them so [`BridgeClient::receive_sample`]
//! still sees them in order.
//!
//! Incoming bytes are buffered until a whole frame is present, so a read that
//! times out part way through a frame leaves the stream in sync.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use wulpus_proto::{
    Acquisition, BlockLengthError, Command, CommandHeader, DecodeError, HEADER_LEN, PONG_PAYLOAD,
    SAMPLE_BLOCK_LEN,
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("unable to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("bad sample block: {0}")]
    Sample(#[from] BlockLengthError),

    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),

    #[error("unexpected frame {command} with {len} bytes")]
    Unexpected { command: &'static str, len: usize },

    #[error("bridge closed the connection")]
    Closed,

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: CommandHeader,
    pub payload: Bytes,
}

impl Frame {
    fn is_echo_of(&self, command: Command) -> bool {
        self.header.command == command.id() && self.header.data_length == 0
    }

    fn is_sample(&self) -> bool {
        self.header.command() == Some(Command::GetData)
            && self.header.data_length as usize == SAMPLE_BLOCK_LEN
    }
}

pub struct BridgeClient {
    stream: TcpStream,
    buffer: BytesMut,
    pending: VecDeque<Frame>,
    reply_timeout: Duration,
}

impl BridgeClient {
    pub async fn connect(addr: &str, reply_timeout: Duration) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        debug!(addr, "connected to bridge");
        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(HEADER_LEN + SAMPLE_BLOCK_LEN),
            pending: VecDeque::new(),
            reply_timeout,
        })
    }

    /// Reads the next frame off the wire, bypassing the sample queue.
    ///
    /// Cancel safe: bytes read before a cancellation stay buffered.
    pub async fn read_frame(&mut self) -> Result<Frame, ClientError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(ClientError::Closed);
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>, ClientError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = CommandHeader::decode(&self.buffer)?;
        let len = header.data_length as usize;
        if self.buffer.len() < HEADER_LEN + len {
            self.buffer.reserve(HEADER_LEN + len - self.buffer.len());
            return Ok(None);
        }
        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(len).freeze();
        Ok(Some(Frame { header, payload }))
    }

    async fn next_reply(&mut self) -> Result<Frame, ClientError> {
        let limit = self.reply_timeout;
        loop {
            let frame = tokio::time::timeout(limit, self.read_frame())
                .await
                .map_err(|_| ClientError::Timeout(limit))??;
            if frame.is_sample() {
                self.pending.push_back(frame);
                continue;
            }
            return Ok(frame);
        }
    }

    /// Sends `command` with `payload` and waits for its echo.
    pub async fn command(&mut self, command: Command, payload: &[u8]) -> Result<(), ClientError> {
        let len = u16::try_from(payload.len()).map_err(|_| ClientError::PayloadTooLarge(payload.len()))?;
        let header = CommandHeader::new(command, len);
        self.stream.write_all(&header.encode()).await?;
        if !payload.is_empty() {
            self.stream.write_all(payload).await?;
        }
        let reply = self.next_reply().await?;
        if !reply.is_echo_of(command) {
            return Err(unexpected(&reply));
        }
        debug!(%command, "echo received");
        Ok(())
    }

    /// Round trip through `PING`/`PONG`.
    pub async fn ping(&mut self) -> Result<Duration, ClientError> {
        let start = Instant::now();
        self.command(Command::Ping, &[]).await?;
        let reply = self.next_reply().await?;
        if reply.header.command() != Some(Command::Pong) || reply.payload[..] != PONG_PAYLOAD[..] {
            return Err(unexpected(&reply));
        }
        Ok(start.elapsed())
    }

    pub async fn send_config(&mut self, config: &[u8]) -> Result<(), ClientError> {
        self.command(Command::SetConfig, config).await
    }

    pub async fn start_rx(&mut self) -> Result<(), ClientError> {
        self.command(Command::StartRx, &[]).await
    }

    pub async fn stop_rx(&mut self) -> Result<(), ClientError> {
        self.command(Command::StopRx, &[]).await
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.command(Command::Close, &[]).await
    }

    pub async fn reset(mut self) -> Result<(), ClientError> {
        self.command(Command::Reset, &[]).await
    }

    /// Next pushed sample frame, queued or fresh off the wire.
    pub async fn receive_sample(&mut self, wait: Duration) -> Result<Acquisition, ClientError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Acquisition::parse(&frame.payload)?);
        }
        loop {
            let frame = tokio::time::timeout(wait, self.read_frame())
                .await
                .map_err(|_| ClientError::Timeout(wait))??;
            if frame.is_sample() {
                return Ok(Acquisition::parse(&frame.payload)?);
            }
            debug!(command = Command::name_of(frame.header.command), "skipping non-sample frame");
        }
    }

    pub fn queued_samples(&self) -> usize {
        self.pending.len()
    }
}

fn unexpected(frame: &Frame) -> ClientError {
    ClientError::Unexpected {
        command: Command::name_of(frame.header.command),
        len: frame.payload.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn sample_frame(acq_nr: u16) -> Vec<u8> {
        let mut frame = CommandHeader::new(Command::GetData, SAMPLE_BLOCK_LEN as u16)
            .encode()
            .to_vec();
        let mut block = vec![0u8; SAMPLE_BLOCK_LEN];
        block[0] = 1;
        block[2..4].copy_from_slice(&acq_nr.to_le_bytes());
        frame.extend_from_slice(&block);
        frame
    }

    #[tokio::test]
    async fn timeout_mid_frame_keeps_stream_in_sync() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.expect("accept");
            let first = sample_frame(7);
            peer.write_all(&first[..HEADER_LEN + 100]).await.expect("head");
            release_rx.await.expect("release");
            peer.write_all(&first[HEADER_LEN + 100..]).await.expect("rest");
            peer.write_all(&sample_frame(8)).await.expect("second");
            peer
        });

        let mut client = BridgeClient::connect(&addr, Duration::from_secs(2))
            .await
            .expect("connect");
        let err = client
            .receive_sample(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));

        release_tx.send(()).expect("server waiting");
        let first = client.receive_sample(Duration::from_secs(2)).await.expect("first");
        let second = client.receive_sample(Duration::from_secs(2)).await.expect("second");
        assert_eq!((first.acq_nr, second.acq_nr), (7, 8));
        assert_eq!(first.data_valid, 1);
        drop(server.await.expect("server"));
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let server = tokio::spawn(async move {
            let (peer, _) = listener.accept().await.expect("accept");
            drop(peer);
        });
        let mut client = BridgeClient::connect(&addr, Duration::from_secs(1))
            .await
            .expect("connect");
        server.await.expect("server");
        assert!(matches!(client.read_frame().await, Err(ClientError::Closed)));
    }
}
