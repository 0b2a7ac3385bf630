//! TCP transport for the single client session.
//!
//! [`Listener`] owns bind/listen/accept. [`Connection`] is the process-wide
//! socket record: it is created once, attached to each accepted stream and
//! closed when the session ends. Receive and send directions have separate
//! locks so the streaming path can write while the orchestrator is blocked
//! in a read.
//!
//! Every write is bounded by the send deadline. A peer that stops reading
//! loses its write half when the deadline expires, so the send lock is never
//! held indefinitely and [`Connection::close`] always gets to drop the
//! descriptor.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::TransportError;

/// Pending connections beyond the active session are refused by the stack.
const LISTEN_BACKLOG: u32 = 1;

pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(addr: SocketAddrV4) -> Result<Self, TransportError> {
        let sock_addr = SocketAddr::V4(addr);
        let bind_err = |source| TransportError::Bind {
            addr: sock_addr,
            source,
        };
        let socket = TcpSocket::new_v4().map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(sock_addr).map_err(bind_err)?;
        let inner = socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
        info!(addr = %inner.local_addr().unwrap_or(sock_addr), "listening");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.local_addr()?)
    }

    /// Waits for the next client. Errors are per-attempt; callers retry.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TransportError> {
        let (stream, peer) = self.inner.accept().await.map_err(TransportError::Accept)?;
        info!(%peer, "accepted connection");
        Ok((stream, peer))
    }
}

pub struct Connection {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    peer: StdMutex<Option<SocketAddr>>,
    open: AtomicBool,
    lock_timeout: Duration,
}

/// Send lock held across several writes, so a header and its payload reach
/// the wire without another writer in between.
pub struct Persist<'a> {
    writer: MutexGuard<'a, Option<OwnedWriteHalf>>,
    deadline: Duration,
}

impl Persist<'_> {
    /// Writes all of `buf`. On deadline expiry the write half is dropped,
    /// which shuts down our side; later sends fail with `NotConnected`.
    pub async fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;
        let written = tokio::time::timeout(self.deadline, writer.write_all(buf)).await;
        match written {
            Ok(res) => res?,
            Err(_) => {
                // A partial frame may be on the wire; the stream is unusable.
                self.writer.take();
                warn!(len = buf.len(), deadline = ?self.deadline, "send stalled, dropping write half");
                return Err(TransportError::SendTimeout(self.deadline));
            }
        }
        debug!(len = buf.len(), "sent");
        Ok(())
    }
}

impl Connection {
    /// An unattached socket record; sends and receives fail until
    /// [`Connection::attach`].
    pub fn create(lock_timeout: Duration) -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            peer: StdMutex::new(None),
            open: AtomicBool::new(false),
            lock_timeout,
        }
    }

    pub async fn attach(&self, stream: TcpStream) -> Result<(), TransportError> {
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        *self.lock_reader().await? = Some(read_half);
        *self.lock_writer().await? = Some(write_half);
        *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = peer;
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reads until `buf` is full or the peer closes. Returns the byte count;
    /// a close before any byte arrives is [`TransportError::Closed`].
    ///
    /// There is no read deadline: a silent client keeps the caller waiting.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut reader = self.lock_reader().await?;
        let reader = reader.as_mut().ok_or(TransportError::NotConnected)?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 && !buf.is_empty() {
            return Err(TransportError::Closed);
        }
        debug!(len = filled, "received");
        Ok(filled)
    }

    pub async fn persist(&self) -> Result<Persist<'_>, TransportError> {
        let writer = self.lock_writer().await?;
        if writer.is_none() {
            return Err(TransportError::NotConnected);
        }
        Ok(Persist {
            writer,
            deadline: self.lock_timeout,
        })
    }

    /// Single write under the send lock.
    pub async fn send(&self, buf: &[u8]) -> Result<(), TransportError> {
        self.persist().await?.send(buf).await
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(TransportError::NotConnected);
        }
        match self.lock_reader().await {
            Ok(mut reader) => drop(reader.take()),
            Err(_) => warn!("receive lock still held while closing"),
        }
        // Sends are deadline-bounded, so the send lock is released within
        // two deadlines (header and payload) of the last frame starting.
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
        drop(writer);
        let peer = self.peer.lock().unwrap_or_else(|e| e.into_inner()).take();
        debug!(?peer, "closed socket");
        Ok(())
    }

    async fn lock_reader(&self) -> Result<MutexGuard<'_, Option<OwnedReadHalf>>, TransportError> {
        tokio::time::timeout(self.lock_timeout, self.reader.lock())
            .await
            .map_err(|_| TransportError::LockTimeout(self.lock_timeout))
    }

    async fn lock_writer(&self) -> Result<MutexGuard<'_, Option<OwnedWriteHalf>>, TransportError> {
        tokio::time::timeout(self.lock_timeout, self.writer.lock())
            .await
            .map_err(|_| TransportError::LockTimeout(self.lock_timeout))
    }
}
