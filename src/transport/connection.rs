use super::{channel::ChannelConnection, sip_addr::SipAddr, tcp::TcpConnection};
use crate::message::header::{Rport, TransportKind, Via};
use crate::message::{Request, SipMessage};
use crate::Result;
use std::net::SocketAddr;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// Events the transport layer raises toward the protocol layers: an
/// incoming message with the connection it arrived on and its source, a
/// newly established connection, or a closed one.
#[derive(Debug)]
pub enum TransportEvent {
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

/// Uniform interface over the transports this client speaks: TCP for the
/// wire and an in-memory channel for tests. Outgoing writes on one
/// connection are serialized behind its write lock, so composed messages
/// hit the wire in order.
#[derive(Clone, Debug)]
pub enum SipConnection {
    Tcp(TcpConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        true
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Tcp(connection) => connection.get_addr(),
            SipConnection::Channel(connection) => connection.get_addr(),
        }
    }

    pub fn cancel_token(&self) -> Option<CancellationToken> {
        match self {
            SipConnection::Tcp(connection) => Some(connection.cancel_token()),
            SipConnection::Channel(connection) => Some(connection.cancel_token()),
        }
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        match self {
            SipConnection::Tcp(connection) => connection.send_message(msg).await,
            SipConnection::Channel(connection) => connection.send_message(msg).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Tcp(connection) => connection.serve_loop(sender).await,
            SipConnection::Channel(connection) => connection.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Tcp(connection) => connection.close().await,
            SipConnection::Channel(connection) => connection.close().await,
        }
    }
}

impl SipConnection {
    /// Stamps `received`/`rport` into the top Via of an incoming request
    /// when the source address differs from what the peer wrote there
    /// (RFC 3261 section 18.2.1). Responses pass through untouched.
    pub fn update_msg_received(msg: SipMessage, source: SocketAddr) -> SipMessage {
        match msg {
            SipMessage::Request(mut req) => {
                if let Some(via) = req.header.top_via_mut() {
                    Self::build_via_received(via, source);
                }
                SipMessage::Request(req)
            }
            response => response,
        }
    }

    fn build_via_received(via: &mut Via, source: SocketAddr) {
        let sent_host_matches = via
            .sent_by
            .ip()
            .map(|ip| ip == source.ip())
            .unwrap_or(false);
        let sent_port_matches = via.sent_by.port.unwrap_or(0) == source.port();
        if sent_host_matches && sent_port_matches {
            return;
        }
        if !sent_host_matches {
            via.received = Some(source.ip().to_string());
        }
        via.rport = Some(Rport::Port(source.port()));
    }

    /// Computes where a composed message should be sent: the request URI
    /// for requests, the top Via (honoring `received`/`rport`) for
    /// responses.
    pub async fn get_destination(msg: &SipMessage) -> Result<SipAddr> {
        match msg {
            SipMessage::Request(req) => SipAddr::resolve(&req.uri).await,
            SipMessage::Response(resp) => {
                let via = resp.header.top_via().ok_or_else(|| {
                    crate::Error::MessageError("response without Via".to_string())
                })?;
                Ok(Self::parse_target_from_via(via))
            }
        }
    }

    pub fn parse_target_from_via(via: &Via) -> SipAddr {
        let mut host = via.sent_by.host.clone();
        let mut port = via.sent_by.port.unwrap_or(crate::config::DEFAULT_SIP_PORT);
        if let Some(received) = &via.received {
            host = received.clone();
        }
        if let Some(Rport::Port(rport)) = via.rport {
            port = rport;
        }
        let addr = host
            .parse()
            .map(|ip| SocketAddr::new(ip, port))
            .unwrap_or_else(|_| SocketAddr::new([0, 0, 0, 0].into(), port));
        SipAddr::new(via.transport.clone(), addr)
    }

    /// The Contact the routing layer fills for requests sent on this
    /// connection. TCP connections mark the URI with `transport=tcp`.
    pub fn local_contact_uri(&self, user: Option<&str>) -> crate::message::Uri {
        let addr = self.get_addr();
        let mut uri = crate::message::Uri::new(user, addr.addr.into());
        if addr.transport == TransportKind::Tcp {
            uri.ensure_tcp_transport();
        }
        uri
    }
}

/// Outgoing requests get the connection's Via on top, with a fresh branch
/// supplied by the caller.
pub fn push_via(request: &mut Request, local: &SipAddr, branch: String) {
    let via = Via::new(local.transport.clone(), local.addr.into(), branch);
    request.header.vias.insert(0, via);
}

impl std::fmt::Display for SipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipConnection::Tcp(connection) => write!(f, "TCP {}", connection),
            SipConnection::Channel(connection) => write!(f, "CHANNEL {}", connection),
        }
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}
