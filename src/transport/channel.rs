use super::connection::{TransportEvent, TransportSender};
use super::sip_addr::SipAddr;
use crate::message::SipMessage;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// In-memory transport for tests: messages written to one endpoint come
/// out of the paired endpoint's serve loop as if read from the wire.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    addr: SipAddr,
    peer_addr: SipAddr,
    outgoing: UnboundedSender<SipMessage>,
    incoming: Mutex<Option<UnboundedReceiver<SipMessage>>>,
    cancel_token: CancellationToken,
}

impl ChannelConnection {
    /// Builds two connected endpoints.
    pub fn pair(addr_a: SipAddr, addr_b: SipAddr, cancel_token: CancellationToken) -> (Self, Self) {
        let (a_to_b, b_from_a) = tokio::sync::mpsc::unbounded_channel();
        let (b_to_a, a_from_b) = tokio::sync::mpsc::unbounded_channel();
        let a = ChannelConnection {
            inner: Arc::new(ChannelInner {
                addr: addr_a.clone(),
                peer_addr: addr_b.clone(),
                outgoing: a_to_b,
                incoming: Mutex::new(Some(a_from_b)),
                cancel_token: cancel_token.child_token(),
            }),
        };
        let b = ChannelConnection {
            inner: Arc::new(ChannelInner {
                addr: addr_b,
                peer_addr: addr_a,
                outgoing: b_to_a,
                incoming: Mutex::new(Some(b_from_a)),
                cancel_token: cancel_token.child_token(),
            }),
        };
        (a, b)
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel_token.clone()
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner
            .outgoing
            .send(msg)
            .map_err(|e| Error::ChannelSendError(e.to_string()))
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut incoming = self
            .inner
            .incoming
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Error("serve_loop called twice".to_string()))?;
        loop {
            let msg = select! {
                _ = self.inner.cancel_token.cancelled() => break,
                msg = incoming.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let msg = super::SipConnection::update_msg_received(msg, self.inner.peer_addr.addr);
            sender.send(TransportEvent::Incoming(
                msg,
                self.clone().into(),
                self.inner.peer_addr.clone(),
            ))?;
        }
        sender.send(TransportEvent::Closed(self.clone().into()))?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.cancel_token.cancel();
        Ok(())
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelConnection({})", self.inner.addr)
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}
