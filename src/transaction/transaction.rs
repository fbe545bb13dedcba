use super::endpoint::EndpointInnerRef;
use super::key::TransactionKey;
use super::message::{make_ack_for_error, make_cancel, make_response};
use super::{TransactionState, TransactionTimer, TransactionType};
use crate::message::{Method, Request, Response, SipMessage, StatusCode, StatusKind};
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};

pub(super) const T1: Duration = Duration::from_millis(500);
pub(super) const T2: Duration = Duration::from_secs(4);
pub(super) const T4: Duration = Duration::from_secs(5);
pub(super) const T1X64: Duration = Duration::from_secs(32);
pub(super) const TIMER_D: Duration = Duration::from_secs(32);
pub(super) const TIMER_INTERVAL: Duration = Duration::from_millis(20);

pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    TransportClosed(SipAddr),
    /// Ask a client INVITE transaction to CANCEL itself; honored once a
    /// provisional response permits it.
    RequestCancel,
    Terminate,
}

pub type TransactionEventSender = UnboundedSender<TransactionEvent>;
pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;

/// One client or server transaction, driven by events from the endpoint:
/// matched messages, timer expiries and transport failures. The owner
/// pumps it with `receive()`; messages that belong to the application
/// come back out of that call.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub state: TransactionState,
    pub connection: Option<SipConnection>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub(crate) endpoint_inner: EndpointInnerRef,
    tu_receiver: TransactionEventReceiver,
    tu_sender: TransactionEventSender,
    cancel_requested: bool,
    cancel_sent: bool,
    timer_a: Option<u64>,
    timer_b: Option<u64>,
    timer_d: Option<u64>,
    timer_k: Option<u64>,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        connection: Option<SipConnection>,
        endpoint_inner: EndpointInnerRef,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        let state = match transaction_type {
            TransactionType::ClientInvite => TransactionState::Calling,
            TransactionType::ServerInvite => TransactionState::Proceeding,
            _ => TransactionState::Trying,
        };
        Self {
            transaction_type,
            key,
            original,
            state,
            connection,
            last_response: None,
            last_ack: None,
            endpoint_inner,
            tu_receiver,
            tu_sender,
            cancel_requested: false,
            cancel_sent: false,
            timer_a: None,
            timer_b: None,
            timer_d: None,
            timer_k: None,
        }
    }

    pub(crate) fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Transaction::new(transaction_type, key, original, connection, endpoint_inner)
    }

    pub(crate) fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        Transaction::new(transaction_type, key, original, connection, endpoint_inner)
    }

    pub fn event_sender(&self) -> TransactionEventSender {
        self.tu_sender.clone()
    }

    fn is_reliable(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_reliable())
            .unwrap_or(true)
    }

    /// Sends the client request and starts the state machine.
    pub async fn send(&mut self) -> Result<()> {
        if !self.transaction_type.is_client() {
            return Err(Error::TransactionError(
                "send is only valid for client transactions".to_string(),
                self.key.clone(),
            ));
        }

        if self.connection.is_none() {
            let target = SipAddr::resolve(&self.original.uri).await?;
            let connection = self
                .endpoint_inner
                .transport_layer
                .lookup(&target, self.endpoint_inner.transport_sender.clone())
                .await?;
            self.connection = Some(connection);
        }

        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no transport found".to_string(),
            self.key.clone(),
        ))?;
        connection.send(self.original.clone().into()).await?;
        self.endpoint_inner
            .attach_transaction(&self.key, self.tu_sender.clone());
        let start_state = match self.transaction_type {
            TransactionType::ClientInvite => TransactionState::Calling,
            _ => TransactionState::Trying,
        };
        self.start_client_timers(start_state);
        Ok(())
    }

    /// Sends a server response and advances the machine accordingly.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.transaction_type.is_client() {
            return Err(Error::TransactionError(
                "respond is only valid for server transactions".to_string(),
                self.key.clone(),
            ));
        }
        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no transport found".to_string(),
            self.key.clone(),
        ))?;

        let kind = response.status.kind();
        connection.send(response.clone().into()).await?;
        self.last_response = Some(response);
        match kind {
            StatusKind::Provisional => self.transition(TransactionState::Proceeding),
            _ => self.transition(TransactionState::Completed),
        }
        Ok(())
    }

    pub async fn respond_with(&mut self, status: StatusCode, body: Option<Vec<u8>>) -> Result<()> {
        let response = make_response(&self.original, status, body);
        self.respond(response).await
    }

    /// ACK for a 2xx is generated by the dialog but sent through the
    /// transaction's connection so ordering with the INVITE holds.
    pub async fn send_ack(&mut self, ack: Request) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "send_ack is only valid for client INVITE transactions".to_string(),
                self.key.clone(),
            ));
        }
        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no transport found".to_string(),
            self.key.clone(),
        ))?;
        connection.send(ack.clone().into()).await?;
        self.last_ack = Some(ack);
        Ok(())
    }

    /// Requests cancellation of a pending INVITE. The CANCEL is only put
    /// on the wire once a provisional response has arrived; before that
    /// the request is remembered and sent on the first 1xx.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "cancel is only valid for client INVITE transactions".to_string(),
                self.key.clone(),
            ));
        }
        self.cancel_requested = true;
        if self.state == TransactionState::Proceeding {
            self.send_cancel().await?;
        } else {
            debug!("{} cancel deferred until a provisional response", self.key);
        }
        Ok(())
    }

    async fn send_cancel(&mut self) -> Result<()> {
        if self.cancel_sent {
            return Ok(());
        }
        let cancel = make_cancel(&self.original);
        self.endpoint_inner
            .spawn_detached_client_transaction(cancel, self.connection.clone())?;
        self.cancel_sent = true;
        info!("{} CANCEL sent", self.key);
        Ok(())
    }

    /// Pumps the event loop; returns the next message the application
    /// should see, or None once the transaction terminates.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg, connection) => {
                    let surfaced = match msg {
                        SipMessage::Request(req) => self.on_received_request(req, connection).await,
                        SipMessage::Response(resp) => self.on_received_response(resp).await,
                    };
                    if let Some(msg) = surfaced {
                        return Some(msg);
                    }
                }
                TransactionEvent::Timer(timer) => {
                    self.on_timer(timer).await.ok();
                }
                TransactionEvent::TransportClosed(addr) => {
                    let ours = self
                        .connection
                        .as_ref()
                        .map(|c| c.get_addr() == &addr)
                        .unwrap_or(false);
                    if ours && self.state != TransactionState::Terminated {
                        warn!("{} transport error, terminating", self.key);
                        let response = make_response(
                            &self.original,
                            StatusCode::SERVICE_UNAVAILABLE,
                            None,
                        );
                        self.transition(TransactionState::Terminated);
                        return Some(SipMessage::Response(response));
                    }
                }
                TransactionEvent::RequestCancel => {
                    self.cancel().await.ok();
                }
                TransactionEvent::Terminate => return None,
            }
        }
        None
    }

    async fn on_received_request(
        &mut self,
        request: Request,
        _connection: Option<SipConnection>,
    ) -> Option<SipMessage> {
        if self.transaction_type.is_client() {
            return None;
        }
        match request.method {
            method if method == self.original.method => {
                // retransmission: replay the last response without
                // re-entering the application
                if let (Some(response), Some(connection)) =
                    (self.last_response.clone(), self.connection.as_ref())
                {
                    trace!("{} retransmitting last response", self.key);
                    connection.send(response.into()).await.ok();
                }
                None
            }
            Method::Ack => {
                match self.state {
                    TransactionState::Completed => {
                        self.last_ack = Some(request);
                        self.transition(TransactionState::Confirmed);
                    }
                    TransactionState::Confirmed => {
                        trace!("{} duplicate ACK absorbed", self.key);
                    }
                    _ => {}
                }
                None
            }
            Method::Cancel => self.on_received_cancel(request).await,
            _ => None,
        }
    }

    /// CANCEL matching this INVITE server transaction: 200 for the
    /// CANCEL itself, 487 for the INVITE, then the CANCEL is surfaced so
    /// the application can tear the dialog down.
    async fn on_received_cancel(&mut self, cancel: Request) -> Option<SipMessage> {
        if self.transaction_type != TransactionType::ServerInvite {
            return None;
        }
        if let Some(connection) = self.connection.as_ref() {
            let ok = make_response(&cancel, StatusCode::OK, None);
            connection.send(ok.into()).await.ok();
        }
        if self.state == TransactionState::Proceeding {
            self.respond_with(StatusCode::REQUEST_TERMINATED, None)
                .await
                .ok();
        }
        Some(SipMessage::Request(cancel))
    }

    async fn on_received_response(&mut self, response: Response) -> Option<SipMessage> {
        if !self.transaction_type.is_client() {
            return None;
        }
        let kind = response.status.kind();
        match self.state {
            TransactionState::Calling | TransactionState::Trying => match kind {
                StatusKind::Provisional => {
                    self.transition(TransactionState::Proceeding);
                    if self.cancel_requested {
                        self.send_cancel().await.ok();
                    }
                    Some(SipMessage::Response(response))
                }
                _ => {
                    self.complete_client(response.clone()).await;
                    Some(SipMessage::Response(response))
                }
            },
            TransactionState::Proceeding => match kind {
                StatusKind::Provisional => Some(SipMessage::Response(response)),
                _ => {
                    self.complete_client(response.clone()).await;
                    Some(SipMessage::Response(response))
                }
            },
            TransactionState::Completed => {
                // retransmitted final response
                if self.transaction_type == TransactionType::ClientInvite
                    && kind != StatusKind::Provisional
                    && kind != StatusKind::Successful
                {
                    if let Some(ack) = self.last_ack.clone() {
                        if let Some(connection) = self.connection.as_ref() {
                            connection.send(ack.into()).await.ok();
                        }
                    }
                }
                None
            }
            _ => None,
        }
    }

    async fn complete_client(&mut self, response: Response) {
        let kind = response.status.kind();
        self.last_response = Some(response.clone());
        match self.transaction_type {
            TransactionType::ClientInvite => match kind {
                StatusKind::Successful => {
                    // the dialog owns the ACK for a 2xx
                    self.transition(TransactionState::Terminated);
                }
                _ => {
                    let ack = make_ack_for_error(&self.original, &response);
                    if let Some(connection) = self.connection.as_ref() {
                        connection.send(ack.clone().into()).await.ok();
                    }
                    self.last_ack = Some(ack);
                    self.transition(TransactionState::Completed);
                }
            },
            _ => {
                self.transition(TransactionState::Completed);
            }
        }
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<()> {
        match timer {
            TransactionTimer::TimerA(key, duration) | TransactionTimer::TimerE(key, duration) => {
                if matches!(
                    self.state,
                    TransactionState::Calling | TransactionState::Trying
                ) {
                    if let Some(connection) = self.connection.as_ref() {
                        connection.send(self.original.clone().into()).await?;
                    }
                    let duration = (duration * 2).min(T2);
                    let timer = match self.transaction_type {
                        TransactionType::ClientInvite => TransactionTimer::TimerA(key, duration),
                        _ => TransactionTimer::TimerE(key, duration),
                    };
                    self.timer_a
                        .replace(self.endpoint_inner.timers.timeout(duration, timer));
                }
            }
            TransactionTimer::TimerB(_) | TransactionTimer::TimerF(_) => {
                if self.state != TransactionState::Terminated
                    && self.state != TransactionState::Completed
                {
                    // transaction timeout surfaces as a synthesized 408
                    let timeout = make_response(&self.original, StatusCode::REQUEST_TIMEOUT, None);
                    self.tu_sender
                        .send(TransactionEvent::Received(timeout.into(), None))
                        .map_err(|e| {
                            Error::TransactionError(e.to_string(), self.key.clone())
                        })?;
                    self.transition(TransactionState::Terminated);
                }
            }
            TransactionTimer::TimerG(key, duration) => {
                if self.state == TransactionState::Completed {
                    if let (Some(response), Some(connection)) =
                        (self.last_response.clone(), self.connection.as_ref())
                    {
                        connection.send(response.into()).await?;
                    }
                    let duration = (duration * 2).min(T2);
                    self.timer_a.replace(
                        self.endpoint_inner
                            .timers
                            .timeout(duration, TransactionTimer::TimerG(key, duration)),
                    );
                }
            }
            TransactionTimer::TimerH(_) => {
                if self.state == TransactionState::Completed {
                    warn!("{} no ACK before Timer H, terminating", self.key);
                    self.transition(TransactionState::Terminated);
                }
            }
            TransactionTimer::TimerD(_) | TransactionTimer::TimerI(_) | TransactionTimer::TimerK(_) => {
                if matches!(
                    self.state,
                    TransactionState::Completed | TransactionState::Confirmed
                ) {
                    self.transition(TransactionState::Terminated);
                }
            }
            TransactionTimer::TimerCleanup(_) => {}
        }
        Ok(())
    }

    fn start_client_timers(&mut self, state: TransactionState) {
        let timers = &self.endpoint_inner.timers;
        if !self.is_reliable() {
            let timer = match self.transaction_type {
                TransactionType::ClientInvite => TransactionTimer::TimerA(self.key.clone(), T1),
                _ => TransactionTimer::TimerE(self.key.clone(), T1),
            };
            self.timer_a.replace(timers.timeout(T1, timer));
        }
        let timeout = match self.transaction_type {
            TransactionType::ClientInvite => TransactionTimer::TimerB(self.key.clone()),
            _ => TransactionTimer::TimerF(self.key.clone()),
        };
        self.timer_b.replace(timers.timeout(T1X64, timeout));
        trace!("{} started in {}", self.key, state);
        self.state = state;
    }

    fn transition(&mut self, state: TransactionState) {
        if self.state == state {
            return;
        }
        let timers = &self.endpoint_inner.timers;
        match state {
            TransactionState::Calling | TransactionState::Trying => {}
            TransactionState::Proceeding => {
                self.timer_a.take().map(|id| timers.cancel(id));
            }
            TransactionState::Completed => {
                self.timer_a.take().map(|id| timers.cancel(id));
                self.timer_b.take().map(|id| timers.cancel(id));
                match self.transaction_type {
                    TransactionType::ClientInvite => {
                        let wait = if self.is_reliable() {
                            Duration::ZERO
                        } else {
                            TIMER_D
                        };
                        self.timer_d.replace(
                            timers.timeout(wait, TransactionTimer::TimerD(self.key.clone())),
                        );
                    }
                    TransactionType::ClientNonInvite => {
                        let wait = if self.is_reliable() { Duration::ZERO } else { T4 };
                        self.timer_k.replace(
                            timers.timeout(wait, TransactionTimer::TimerK(self.key.clone())),
                        );
                    }
                    TransactionType::ServerInvite => {
                        if !self.is_reliable() {
                            self.timer_a.replace(timers.timeout(
                                T1,
                                TransactionTimer::TimerG(self.key.clone(), T1),
                            ));
                        }
                        self.timer_b
                            .replace(timers.timeout(T1X64, TransactionTimer::TimerH(self.key.clone())));
                    }
                    TransactionType::ServerNonInvite => {
                        let wait = if self.is_reliable() { Duration::ZERO } else { T1X64 };
                        self.timer_k.replace(
                            timers.timeout(wait, TransactionTimer::TimerK(self.key.clone())),
                        );
                    }
                }
            }
            TransactionState::Confirmed => {
                self.timer_a.take().map(|id| timers.cancel(id));
                self.timer_b.take().map(|id| timers.cancel(id));
                let wait = if self.is_reliable() { Duration::ZERO } else { T4 };
                self.timer_k
                    .replace(timers.timeout(wait, TransactionTimer::TimerI(self.key.clone())));
            }
            TransactionState::Terminated => {
                self.cleanup();
                self.tu_sender.send(TransactionEvent::Terminate).ok();
            }
        }
        trace!("{} transition: {} -> {}", self.key, self.state, state);
        self.state = state;
    }

    fn cleanup_timers(&mut self) {
        let timers = &self.endpoint_inner.timers;
        self.timer_a.take().map(|id| timers.cancel(id));
        self.timer_b.take().map(|id| timers.cancel(id));
        self.timer_d.take().map(|id| timers.cancel(id));
        self.timer_k.take().map(|id| timers.cancel(id));
    }

    fn cleanup(&mut self) {
        self.cleanup_timers();
        let last_message = match self.transaction_type {
            // keep the ACK so retransmitted final responses are re-acked
            TransactionType::ClientInvite => self.last_ack.take().map(SipMessage::Request),
            // keep the final response so request retransmissions get it
            TransactionType::ServerNonInvite | TransactionType::ServerInvite => {
                self.last_response.take().map(SipMessage::Response)
            }
            _ => None,
        };
        self.endpoint_inner
            .detach_transaction(&self.key, last_message);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Terminated {
            self.cleanup();
        }
    }
}
