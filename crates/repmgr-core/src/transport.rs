//! Connection I/O tasks
//!
//! Each connection runs a reader task that parses frames and drives the
//! negotiation state machine, and a writer task that drains the outbound
//! queue with vectored writes. Both hand their socket half back when they
//! stop, so only the select loop ever closes a socket.

use crate::address::AddressList;
use crate::connection::{ConnState, Connection};
use crate::dispatch::Inbound;
use crate::frame::{Frame, FrameCursor, InputState};
use crate::manager::{ManagerEvent, RepMgr};
use crate::protocol::{
    HandshakeParams, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, Message, VersionAgreement,
    VersionProposal,
};
use crate::site::Eid;
use crate::{Error, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Dial one address of `eid` and report the result to the select loop
pub(crate) async fn connect(
    ctx: Arc<RepMgr>,
    conn: Arc<Connection>,
    eid: Eid,
    host: String,
    port: u16,
) {
    let event = match establish(&ctx, eid, &host, port).await {
        Ok((stream, addr)) => ManagerEvent::Connected {
            conn: conn.id(),
            stream,
            addr,
        },
        Err(error) => ManagerEvent::ConnectFailed {
            conn: conn.id(),
            error,
        },
    };
    ctx.notify(event);
}

async fn establish(
    ctx: &RepMgr,
    eid: Eid,
    host: &str,
    port: u16,
) -> Result<(TcpStream, SocketAddr)> {
    let known = ctx.sites.lock().get(eid)?.addresses.current();
    let addr = match known {
        Some(addr) => addr,
        None => {
            let resolved = AddressList::resolve(host, port).await?;
            let mut sites = ctx.sites.lock();
            let site = sites.get_mut(eid)?;
            site.addresses.replace(resolved);
            site.addresses
                .current()
                .ok_or_else(|| Error::refused(format!("{}:{} has no addresses", host, port)))?
        }
    };

    tracing::debug!("Dialing site {} at {}", eid, addr);
    let stream = tokio::time::timeout(ctx.config().connect_timeout(), TcpStream::connect(addr))
        .await
        .map_err(|_| Error::refused(format!("connect to {} timed out", addr)))??;
    stream.set_nodelay(true)?;
    Ok((stream, addr))
}

/// Read frames until the connection fails or is cancelled
pub(crate) async fn read_loop(
    ctx: Arc<RepMgr>,
    conn: Arc<Connection>,
    mut half: OwnedReadHalf,
    cancel: CancellationToken,
) -> OwnedReadHalf {
    let mut input = InputState::new(ctx.config().max_message_size);
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = half.read(input.read_buf()) => read,
        };

        let outcome = match read {
            Ok(0) => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ))),
            Ok(n) => match input.advance(n) {
                Ok(Some(message)) => handle_message(&ctx, &conn, message),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            },
            Err(e) => Err(Error::Io(e)),
        };

        if let Err(e) = outcome {
            ctx.fail_connection(&conn, &e);
            break;
        }
        if conn.is_defunct() {
            break;
        }
    }
    half
}

/// Drain the outbound queue until the connection fails or is cancelled
pub(crate) async fn write_loop(
    ctx: Arc<RepMgr>,
    conn: Arc<Connection>,
    mut half: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Arc<Frame>>,
    cancel: CancellationToken,
) -> OwnedWriteHalf {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = write_frame(&mut half, &frame) => written,
        };
        if let Err(e) = written {
            ctx.fail_connection(&conn, &Error::Io(e));
            break;
        }

        if conn.queue_len() == 0 {
            conn.relieve();
        }
    }
    half
}

/// Write every segment of `frame`, resuming after partial writes
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut cursor = FrameCursor::new(frame);
    while !cursor.is_complete() {
        let slices = cursor.io_slices();
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        cursor.advance(n);
    }
    Ok(())
}

fn handle_message(ctx: &RepMgr, conn: &Connection, message: Message) -> Result<()> {
    if conn.is_defunct() {
        return Ok(());
    }
    let msg_type = message.message_type();
    let version = conn.version();
    if version != 0 && !msg_type.valid_in(version) {
        return Err(Error::malformed(format!(
            "{:?} not valid in protocol version {}",
            msg_type, version
        )));
    }
    if let Some(eid) = conn.eid() {
        ctx.touch(eid);
    }

    if let Message::Handshake(control) = message {
        return handle_handshake(ctx, conn, &control);
    }

    let eid = match (conn.is_ready(), conn.eid()) {
        (true, Some(eid)) => eid,
        _ => {
            return Err(Error::malformed(format!(
                "{:?} before handshake completed",
                msg_type
            )));
        }
    };
    match message {
        Message::Heartbeat => {
            tracing::trace!("Heartbeat from site {}", eid);
            Ok(())
        }
        message => {
            ctx.record_received();
            ctx.pool.submit(Inbound { from: eid, message })
        }
    }
}

/// Advance negotiation. Which payload a HANDSHAKE carries depends on the
/// state of the connection that receives it.
fn handle_handshake(ctx: &RepMgr, conn: &Connection, control: &[u8]) -> Result<()> {
    match conn.state() {
        ConnState::Negotiate => {
            let proposal = VersionProposal::decode(control)?;
            let version = proposal.agree(VersionProposal::local()).inspect_err(|e| {
                tracing::warn!(
                    "Rejecting connection {} from {:?}: {}",
                    conn.id(),
                    conn.peer_addr(),
                    e
                );
            })?;
            conn.mark_negotiated(version)?;
            conn.send_control(Arc::new(Frame::version_agreement(VersionAgreement {
                version,
            })))?;
            tracing::debug!("Connection {} agreed on protocol version {}", conn.id(), version);
            Ok(())
        }
        ConnState::Connected => {
            let VersionAgreement { version } = VersionAgreement::decode(control)?;
            if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&version) {
                return Err(Error::ProtocolVersionMismatch {
                    local_min: MIN_PROTOCOL_VERSION,
                    local_max: MAX_PROTOCOL_VERSION,
                    remote_min: version,
                    remote_max: version,
                });
            }
            let params = Frame::handshake_params(&ctx.local_params(version));
            conn.mark_ready(version, Arc::new(params))?;
            tracing::info!(
                "Negotiated protocol version {} with site {}",
                version,
                conn.eid().map_or_else(|| "?".to_string(), |e| e.to_string())
            );
            Ok(())
        }
        ConnState::Parameters => {
            let params = HandshakeParams::decode(control)?;
            if params.version != conn.version() {
                return Err(Error::malformed(format!(
                    "parameters claim version {}, negotiated {}",
                    params.version,
                    conn.version()
                )));
            }
            ctx.identify_incoming(conn, &params)
        }
        ConnState::Ready | ConnState::Congested => {
            let params = HandshakeParams::decode(control)?;
            let eid = conn.eid().ok_or(Error::NotReady)?;
            ctx.sites.lock().set_priority(eid, params.priority)?;
            tracing::debug!(
                "Site {} ({}:{}) has priority {}",
                eid,
                params.host,
                params.port,
                params.priority
            );
            Ok(())
        }
        state => Err(Error::malformed(format!("handshake in state {:?}", state))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LogPosition;
    use bytes::Bytes;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Accepts at most `chunk` bytes per write
    struct Trickle {
        written: Vec<u8>,
        chunk: usize,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.chunk);
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_frame_survives_partial_writes() {
        let frame = Frame::rep_message(
            Bytes::from_static(b"control blob"),
            Bytes::from(vec![7u8; 1000]),
        );
        let mut out = Trickle {
            written: Vec::new(),
            chunk: 3,
        };
        write_frame(&mut out, &frame).await.unwrap();
        assert_eq!(out.written, frame.to_vec());

        let mut input = InputState::new(1024 * 1024);
        let messages = input.feed(&out.written).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], Message::RepMessage { record, .. } if record.len() == 1000));
    }

    #[tokio::test]
    async fn test_write_frame_back_to_back() {
        let mut out = Trickle {
            written: Vec::new(),
            chunk: 64,
        };
        let frames = [
            Frame::ack(LogPosition::new(1, 10)),
            Frame::heartbeat(),
            Frame::ack(LogPosition::new(1, 20)),
        ];
        for frame in &frames {
            write_frame(&mut out, frame).await.unwrap();
        }
        let mut input = InputState::new(1024);
        let messages = input.feed(&out.written).unwrap();
        assert_eq!(
            messages,
            vec![
                Message::Ack(LogPosition::new(1, 10)),
                Message::Heartbeat,
                Message::Ack(LogPosition::new(1, 20)),
            ]
        );
    }
}
