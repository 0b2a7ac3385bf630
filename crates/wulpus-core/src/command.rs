//! Framed command codec on top of [`Connection`].

use tracing::{debug, info, warn};
use wulpus_proto::{Command, CommandHeader, HEADER_LEN};

use crate::error::{BridgeResult, ProtocolError};
use crate::socket::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedCommand {
    pub header: CommandHeader,
    pub command: Command,
    /// Number of payload bytes written to the caller's buffer.
    pub payload_len: usize,
}

/// Reads one command and its payload into `payload`.
///
/// The header is echoed back with `data_length = 0` as soon as the magic
/// checks out, before the command id is validated. A declared length larger
/// than `payload` fails without reading any payload bytes.
pub async fn receive_command(conn: &Connection, payload: &mut [u8]) -> BridgeResult<ReceivedCommand> {
    debug!("receiving command");
    let mut raw = [0u8; HEADER_LEN];
    let n = conn.recv(&mut raw).await?;
    if n != HEADER_LEN {
        warn!(expected = HEADER_LEN, actual = n, "header length mismatch");
        return Err(ProtocolError::ShortHeader {
            expected: HEADER_LEN,
            actual: n,
        }
        .into());
    }

    let header = CommandHeader::from_bytes(&raw);
    if !header.has_valid_magic() {
        warn!("invalid magic");
        return Err(ProtocolError::BadMagic.into());
    }

    send_command(conn, &header.echo(), &[]).await?;
    debug!("header echoed");

    let command = header.command().ok_or_else(|| {
        warn!(command = header.command, "invalid command");
        ProtocolError::UnknownCommand(header.command)
    })?;

    let declared = header.data_length as usize;
    if declared != 0 {
        if declared > payload.len() {
            warn!(declared, capacity = payload.len(), "data length exceeds buffer size");
            return Err(ProtocolError::PayloadTooLarge {
                declared,
                capacity: payload.len(),
            }
            .into());
        }
        let n = conn.recv(&mut payload[..declared]).await?;
        if n != declared {
            warn!(expected = declared, actual = n, "data length mismatch");
            return Err(ProtocolError::ShortPayload {
                expected: declared,
                actual: n,
            }
            .into());
        }
    }

    info!(%command, data_length = declared, "received command");
    Ok(ReceivedCommand {
        header,
        command,
        payload_len: declared,
    })
}

/// Writes `header` then `payload` under one send lock.
pub async fn send_command(conn: &Connection, header: &CommandHeader, payload: &[u8]) -> BridgeResult<()> {
    if header.data_length as usize != payload.len() {
        return Err(ProtocolError::LengthMismatch {
            declared: header.data_length as usize,
            actual: payload.len(),
        }
        .into());
    }

    let mut persist = conn.persist().await?;
    persist.send(&header.encode()).await?;
    if !payload.is_empty() {
        persist.send(payload).await?;
    }
    debug!(command = Command::name_of(header.command), len = payload.len(), "command sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BridgeError, TransportError};
    use crate::socket::Listener;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use wulpus_proto::MAGIC;

    async fn pair() -> (Connection, TcpStream) {
        let listener = Listener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr"))
            .await
            .expect("connect");
        let (stream, _) = listener.accept().await.expect("accept");
        let conn = Connection::create(Duration::from_millis(200));
        conn.attach(stream).await.expect("attach");
        (conn, client)
    }

    async fn read_header(client: &mut TcpStream) -> CommandHeader {
        let mut raw = [0u8; HEADER_LEN];
        client.read_exact(&mut raw).await.expect("read header");
        CommandHeader::decode(&raw).expect("decode")
    }

    #[tokio::test]
    async fn echoes_header_with_zero_length_and_reads_payload() {
        let (conn, mut client) = pair().await;
        let header = CommandHeader::new(Command::SetConfig, 3);
        client.write_all(&header.encode()).await.expect("header");
        client.write_all(&[7, 8, 9]).await.expect("payload");

        let mut buf = [0u8; 16];
        let received = receive_command(&conn, &mut buf).await.expect("receive");
        assert_eq!(received.command, Command::SetConfig);
        assert_eq!(received.payload_len, 3);
        assert_eq!(&buf[..3], &[7, 8, 9]);
        assert_eq!(read_header(&mut client).await, header.echo());
    }

    #[tokio::test]
    async fn bad_magic_is_not_echoed() {
        let (conn, mut client) = pair().await;
        client.write_all(b"hello\x00\x59\x00\x00").await.expect("write");
        let mut buf = [0u8; 4];
        let err = receive_command(&conn, &mut buf).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(ProtocolError::BadMagic)));

        conn.close().await.expect("close");
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.expect("read");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_echoed_then_rejected_without_payload_read() {
        let (conn, mut client) = pair().await;
        let mut raw = [0u8; HEADER_LEN];
        raw[..6].copy_from_slice(&MAGIC);
        raw[6] = 0x60;
        raw[7..].copy_from_slice(&4u16.to_le_bytes());
        client.write_all(&raw).await.expect("header");
        client.write_all(b"next").await.expect("trailing");

        let mut buf = [0u8; 16];
        let err = receive_command(&conn, &mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::UnknownCommand(0x60))
        ));
        let echo = read_header(&mut client).await;
        assert_eq!(echo.command, 0x60);
        assert_eq!(echo.data_length, 0);

        // The payload bytes are still unread on the socket.
        let mut left = [0u8; 4];
        assert_eq!(conn.recv(&mut left).await.expect("recv"), 4);
        assert_eq!(&left, b"next");
    }

    #[tokio::test]
    async fn oversized_payload_aborts_before_reading() {
        let (conn, mut client) = pair().await;
        let header = CommandHeader::new(Command::SetConfig, 32);
        client.write_all(&header.encode()).await.expect("header");
        client.write_all(&[1u8; 32]).await.expect("payload");

        let mut buf = [0u8; 8];
        let err = receive_command(&conn, &mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::PayloadTooLarge {
                declared: 32,
                capacity: 8
            })
        ));
        assert_eq!(buf, [0u8; 8]);
    }

    #[tokio::test]
    async fn short_header_is_protocol_error() {
        let (conn, mut client) = pair().await;
        client.write_all(b"wulp").await.expect("write");
        drop(client);
        let mut buf = [0u8; 4];
        let err = receive_command(&conn, &mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::ShortHeader {
                expected: HEADER_LEN,
                actual: 4
            })
        ));
    }

    #[tokio::test]
    async fn peer_close_is_transport_error() {
        let (conn, client) = pair().await;
        drop(client);
        let mut buf = [0u8; 4];
        let err = receive_command(&conn, &mut buf).await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(TransportError::Closed)));
    }

    #[tokio::test]
    async fn concurrent_frames_never_interleave() {
        let (conn, mut client) = pair().await;
        let conn = std::sync::Arc::new(conn);

        let sample = [0xABu8; wulpus_proto::SAMPLE_BLOCK_LEN];
        let streamer = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let header = CommandHeader::new(Command::GetData, sample.len() as u16);
                for _ in 0..20 {
                    send_command(&conn, &header, &sample).await.expect("sample");
                }
            })
        };
        let pong = CommandHeader::new(Command::Pong, 4);
        for _ in 0..20 {
            send_command(&conn, &pong, b"pong").await.expect("pong");
            tokio::task::yield_now().await;
        }
        streamer.await.expect("streamer");

        let (mut pongs, mut samples) = (0, 0);
        for _ in 0..40 {
            let header = read_header(&mut client).await;
            let mut payload = vec![0u8; header.data_length as usize];
            client.read_exact(&mut payload).await.expect("payload");
            match header.command() {
                Some(Command::Pong) => {
                    assert_eq!(payload, b"pong");
                    pongs += 1;
                }
                Some(Command::GetData) => {
                    assert!(payload.iter().all(|b| *b == 0xAB));
                    samples += 1;
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!((pongs, samples), (20, 20));
    }

    #[tokio::test]
    async fn send_rejects_length_mismatch() {
        let (conn, _client) = pair().await;
        let header = CommandHeader::new(Command::Pong, 4);
        let err = send_command(&conn, &header, b"po").await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::LengthMismatch {
                declared: 4,
                actual: 2
            })
        ));
    }
}
