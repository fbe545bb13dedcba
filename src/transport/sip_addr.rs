use crate::message::header::TransportKind;
use crate::message::uri::Uri;
use crate::{config::DEFAULT_SIP_PORT, Error, Result};
use std::net::SocketAddr;

/// A resolved signalling address: transport kind plus socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipAddr {
    pub transport: TransportKind,
    pub addr: SocketAddr,
}

impl SipAddr {
    pub fn new(transport: TransportKind, addr: SocketAddr) -> Self {
        SipAddr { transport, addr }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        SipAddr {
            transport: TransportKind::Tcp,
            addr,
        }
    }

    /// Resolves a request URI to a signalling address. Numeric hosts
    /// resolve directly; names go through the system resolver.
    pub async fn resolve(uri: &Uri) -> Result<SipAddr> {
        let transport = uri
            .param("transport")
            .and_then(|p| p.value.as_deref())
            .map(TransportKind::from_token)
            .unwrap_or(TransportKind::Tcp);
        let port = uri.host_port.port.unwrap_or(DEFAULT_SIP_PORT);

        if let Some(addr) = uri.host_port.socket_addr(DEFAULT_SIP_PORT) {
            return Ok(SipAddr::new(transport, addr));
        }

        let host = uri.host_port.host.clone();
        let mut addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| Error::Error(format!("cannot resolve {}: {}", host, e)))?;
        match addrs.next() {
            Some(addr) => Ok(SipAddr::new(transport, addr)),
            None => Err(Error::Error(format!("no address for host: {}", host))),
        }
    }
}

impl std::fmt::Display for SipAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.transport, self.addr)
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        SipAddr::tcp(addr)
    }
}
