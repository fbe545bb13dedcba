use super::connection::{TransportEvent, TransportSender};
use super::sip_addr::SipAddr;
use crate::message::framer::MessageFramer;
use crate::message::parse::{parse_error_response_context, parse_message};
use crate::message::{Response, SipMessage, StatusCode};
use crate::{Error, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    select,
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 4096;

struct TcpInner {
    local_addr: SipAddr,
    remote_addr: SipAddr,
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<OwnedWriteHalf>,
    cancel_token: CancellationToken,
}

/// One TCP signalling connection. Writes are serialized behind the write
/// lock; the read side runs in `serve_loop` feeding framed messages to
/// the transport event channel.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<TcpInner>,
}

impl TcpConnection {
    pub async fn connect(addr: SocketAddr, cancel_token: CancellationToken) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        info!("connected TCP transport: {} -> {}", stream.local_addr()?, addr);
        Self::from_stream(stream, cancel_token)
    }

    pub fn from_stream(stream: TcpStream, cancel_token: CancellationToken) -> Result<Self> {
        let local_addr = SipAddr::tcp(stream.local_addr()?);
        let remote_addr = SipAddr::tcp(stream.peer_addr()?);
        let (read_half, write_half) = stream.into_split();
        Ok(TcpConnection {
            inner: Arc::new(TcpInner {
                local_addr,
                remote_addr,
                read_half: Mutex::new(Some(read_half)),
                write_half: Mutex::new(write_half),
                cancel_token,
            }),
        })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    pub fn remote_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel_token.clone()
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        let data = msg.to_bytes();
        let mut write_half = self.inner.write_half.lock().await;
        write_half.write_all(&data).await?;
        write_half.flush().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.cancel_token.cancel();
        Ok(())
    }

    /// Reads bytes, frames them into messages and forwards each parsed
    /// message upward. A framing error (negative Content-Length,
    /// oversized header) is a peer error that closes the connection; a
    /// parse error drops the message, answering 400 when the top Via
    /// survived parsing.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut read_half = self
            .inner
            .read_half
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Error("serve_loop called twice".to_string()))?;

        let mut framer = MessageFramer::new();
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut read_buf = [0u8; READ_BUFFER_SIZE];
        let remote = self.inner.remote_addr.clone();

        loop {
            let n = select! {
                _ = self.inner.cancel_token.cancelled() => break,
                result = read_half.read(&mut read_buf) => match result {
                    Ok(0) => {
                        debug!("connection closed by peer: {}", remote);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        error!("error reading from {}: {}", remote, e);
                        break;
                    }
                },
            };
            buffer.extend_from_slice(&read_buf[..n]);

            let raw_messages = match framer.drain(&mut buffer) {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("peer error from {}, closing connection: {}", remote, e);
                    break;
                }
            };
            for raw in raw_messages {
                let header_text = String::from_utf8_lossy(&raw.header).into_owned();
                match parse_message(&header_text, raw.body) {
                    Ok(msg) => {
                        let msg = super::SipConnection::update_msg_received(msg, remote.addr);
                        sender.send(TransportEvent::Incoming(
                            msg,
                            self.clone().into(),
                            remote.clone(),
                        ))?;
                    }
                    Err(e) => {
                        warn!("peer error, discarding malformed message from {}: {}", remote, e);
                        if let Some(header) = parse_error_response_context(&header_text) {
                            let mut response = Response::new(StatusCode::BAD_REQUEST);
                            response.header = header.inherit_for_response();
                            self.send_message(response.into()).await.ok();
                        }
                    }
                }
            }
        }

        sender.send(TransportEvent::Closed(self.clone().into()))?;
        Ok(())
    }

    /// Accept loop for incoming signalling connections; each accepted
    /// stream gets its own serve loop task.
    pub async fn serve_listener(
        listener: TcpListener,
        sender: TransportSender,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        loop {
            let (stream, peer) = select! {
                _ = cancel_token.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            debug!("accepted TCP connection from {}", peer);
            let connection = match TcpConnection::from_stream(stream, cancel_token.child_token()) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("failed to set up accepted connection: {}", e);
                    continue;
                }
            };
            sender.send(TransportEvent::New(connection.clone().into()))?;
            let loop_sender = sender.clone();
            tokio::spawn(async move {
                connection.serve_loop(loop_sender).await.ok();
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpConnection({})", self.inner.local_addr)
    }
}

impl std::fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.inner.local_addr, self.inner.remote_addr)
    }
}
