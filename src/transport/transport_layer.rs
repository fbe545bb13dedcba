use super::connection::{SipConnection, TransportSender};
use super::sip_addr::SipAddr;
use super::tcp::TcpConnection;
use crate::message::header::TransportKind;
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct TransportLayerInner {
    cancel_token: CancellationToken,
    connections: RwLock<HashMap<SipAddr, SipConnection>>,
    listen_addr: RwLock<Option<SipAddr>>,
}

/// Connection table for signalling transports. At most one connection per
/// remote address; outgoing lookups reuse the table before dialing.
#[derive(Clone)]
pub struct TransportLayer {
    inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        TransportLayer {
            inner: Arc::new(TransportLayerInner {
                cancel_token,
                connections: RwLock::new(HashMap::new()),
                listen_addr: RwLock::new(None),
            }),
        }
    }

    pub fn listen_addr(&self) -> Option<SipAddr> {
        self.inner.listen_addr.read().unwrap().clone()
    }

    pub fn add_connection(&self, connection: SipConnection) {
        let addr = connection.get_addr().clone();
        self.inner
            .connections
            .write()
            .unwrap()
            .insert(addr, connection);
    }

    /// Registers a connection under the peer's address so responses and
    /// in-dialog requests reuse it.
    pub fn add_peer_connection(&self, peer: SipAddr, connection: SipConnection) {
        self.inner
            .connections
            .write()
            .unwrap()
            .insert(peer, connection);
    }

    pub fn del_connection(&self, connection: &SipConnection) {
        let mut connections = self.inner.connections.write().unwrap();
        connections.retain(|_, existing| {
            existing.get_addr() != connection.get_addr()
        });
    }

    /// Finds or establishes a connection to the target. New TCP
    /// connections get their serve loop spawned with the given sender.
    pub async fn lookup(&self, target: &SipAddr, sender: TransportSender) -> Result<SipConnection> {
        if let Some(connection) = self.inner.connections.read().unwrap().get(target) {
            return Ok(connection.clone());
        }

        match target.transport {
            TransportKind::Tcp => {}
            _ => {
                return Err(Error::TransportLayerError(
                    "only TCP signalling is supported".to_string(),
                    target.clone(),
                ))
            }
        }

        debug!("dialing new connection: {}", target);
        let connection = TcpConnection::connect(
            target.addr,
            self.inner.cancel_token.child_token(),
        )
        .await?;
        let connection: SipConnection = connection.into();
        self.add_peer_connection(target.clone(), connection.clone());

        let serve_connection = connection.clone();
        tokio::spawn(async move {
            serve_connection.serve_loop(sender).await.ok();
        });
        Ok(connection)
    }

    /// Binds the signalling listener and starts accepting connections.
    /// Returns the bound address.
    pub async fn listen_tcp(
        &self,
        addr: SocketAddr,
        sender: TransportSender,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        *self.inner.listen_addr.write().unwrap() = Some(SipAddr::tcp(bound));
        info!("listening for SIP connections on {}", bound);

        let cancel_token = self.inner.cancel_token.child_token();
        tokio::spawn(async move {
            TcpConnection::serve_listener(listener, sender, cancel_token)
                .await
                .ok();
        });
        Ok(bound)
    }
}
