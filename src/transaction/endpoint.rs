use super::key::TransactionKey;
use super::message::make_response;
use super::timer::Timer;
use super::transaction::{
    Transaction, TransactionEvent, TransactionEventSender, TIMER_INTERVAL, T1X64, T4,
};
use super::{IncomingRequest, TransactionTimer};
use crate::message::{Method, Request, Response, SipMessage, StatusCode};
use crate::transport::{SipConnection, TransportEvent, TransportLayer, TransportReceiver, TransportSender};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("peercall/", env!("CARGO_PKG_VERSION"));

pub struct EndpointInner {
    pub user_agent: String,
    pub timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub transport_sender: TransportSender,
    pub(super) transactions: Mutex<HashMap<TransactionKey, TransactionEventSender>>,
    pub(super) finished_transactions: Mutex<HashMap<TransactionKey, Option<SipMessage>>>,
    incoming_sender: UnboundedSender<IncomingRequest>,
    cancel_token: CancellationToken,
    timer_interval: Duration,
}

pub type EndpointInnerRef = std::sync::Arc<EndpointInner>;

impl EndpointInner {
    pub(super) fn attach_transaction(&self, key: &TransactionKey, sender: TransactionEventSender) {
        self.transactions
            .lock()
            .unwrap()
            .insert(key.clone(), sender);
    }

    pub(super) fn detach_transaction(
        &self,
        key: &TransactionKey,
        last_message: Option<SipMessage>,
    ) {
        self.transactions.lock().unwrap().remove(key);

        if let Some(msg) = last_message {
            let mut finished = self.finished_transactions.lock().unwrap();
            if finished.contains_key(key) {
                return;
            }
            let linger = if matches!(msg, SipMessage::Request(_)) {
                T4
            } else {
                T1X64
            };
            self.timers
                .timeout(linger, TransactionTimer::TimerCleanup(key.clone()));
            finished.insert(key.clone(), Some(msg));
        }
    }

    /// Creates a client transaction that runs in its own task, used for
    /// fire-and-forget requests like CANCEL.
    pub(super) fn spawn_detached_client_transaction(
        self: &EndpointInnerRef,
        request: Request,
        connection: Option<SipConnection>,
    ) -> Result<()> {
        let key = TransactionKey::from_request(&request)?;
        let mut transaction = Transaction::new_client(key, request, self.clone(), connection);
        tokio::spawn(async move {
            if let Err(e) = transaction.send().await {
                warn!("detached transaction send failed: {}", e);
                return;
            }
            while transaction.receive().await.is_some() {}
        });
        Ok(())
    }

    async fn process_timer(&self) {
        while !self.cancel_token.is_cancelled() {
            for timer in self.timers.poll(Instant::now()) {
                if let TransactionTimer::TimerCleanup(key) = &timer {
                    self.transactions.lock().unwrap().remove(key);
                    self.finished_transactions.lock().unwrap().remove(key);
                    continue;
                }
                let sender = self
                    .transactions
                    .lock()
                    .unwrap()
                    .get(timer.key())
                    .cloned();
                if let Some(sender) = sender {
                    if sender.send(TransactionEvent::Timer(timer)).is_err() {
                        // receiver dropped without terminating cleanly
                    }
                }
            }
            tokio::time::sleep(self.timer_interval).await;
        }
    }

    async fn process_transport(&self, receiver: &mut TransportReceiver) -> Result<()> {
        while let Some(event) = receiver.recv().await {
            match event {
                TransportEvent::Incoming(msg, connection, from) => match msg {
                    SipMessage::Request(request) => {
                        self.dispatch_request(request, connection, from).await?;
                    }
                    SipMessage::Response(response) => {
                        self.dispatch_response(response)?;
                    }
                },
                TransportEvent::New(connection) => {
                    debug!("transport established: {}", connection);
                }
                TransportEvent::Closed(connection) => {
                    self.transport_layer.del_connection(&connection);
                    let addr = connection.get_addr().clone();
                    let senders: Vec<TransactionEventSender> =
                        self.transactions.lock().unwrap().values().cloned().collect();
                    for sender in senders {
                        sender
                            .send(TransactionEvent::TransportClosed(addr.clone()))
                            .ok();
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch_request(
        &self,
        request: Request,
        connection: SipConnection,
        from: crate::transport::SipAddr,
    ) -> Result<()> {
        let key = match TransactionKey::from_request(&request) {
            Ok(key) => key,
            Err(e) => {
                warn!("peer error, request without transaction key: {}", e);
                return Ok(());
            }
        };

        // live transaction: request retransmissions, ACK and CANCEL for
        // a pending INVITE all land in the matching machine
        let live = self.transactions.lock().unwrap().get(&key).cloned();
        if let Some(sender) = live {
            sender
                .send(TransactionEvent::Received(
                    request.into(),
                    Some(connection),
                ))
                .ok();
            return Ok(());
        }

        if request.method == Method::Cancel {
            let invite = self
                .transactions
                .lock()
                .unwrap()
                .get(&key.invite_key())
                .cloned();
            match invite {
                Some(sender) => {
                    sender
                        .send(TransactionEvent::Received(request.into(), Some(connection)))
                        .ok();
                }
                None => {
                    warn!("peer error, CANCEL for unknown transaction: {}", key);
                    let response = make_response(
                        &request,
                        StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
                        None,
                    );
                    connection.send(response.into()).await.ok();
                }
            }
            return Ok(());
        }

        // retransmission of a finished transaction's request
        let cached = self.finished_transactions.lock().unwrap().get(&key).cloned();
        if let Some(Some(SipMessage::Response(response))) = cached {
            debug!("replaying cached final response for {}", key);
            connection.send(response.into()).await.ok();
            return Ok(());
        }

        self.incoming_sender
            .send(IncomingRequest {
                request,
                connection,
                from,
            })
            .map_err(Error::from)
    }

    fn dispatch_response(&self, response: Response) -> Result<()> {
        let key = match TransactionKey::from_response(&response) {
            Ok(key) => key,
            Err(e) => {
                warn!("peer error, response without transaction key: {}", e);
                return Ok(());
            }
        };
        let sender = self.transactions.lock().unwrap().get(&key).cloned();
        match sender {
            Some(sender) => {
                sender
                    .send(TransactionEvent::Received(response.into(), None))
                    .ok();
            }
            None => {
                warn!("peer error, orphan response dropped: {}", key);
            }
        }
        Ok(())
    }
}

pub struct EndpointBuilder {
    user_agent: String,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<CancellationToken>,
    timer_interval: Option<Duration>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: USER_AGENT.to_string(),
            transport_layer: None,
            cancel_token: None,
            timer_interval: None,
        }
    }

    pub fn user_agent(&mut self, user_agent: &str) -> &mut Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn transport_layer(&mut self, transport_layer: TransportLayer) -> &mut Self {
        self.transport_layer.replace(transport_layer);
        self
    }

    pub fn cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn timer_interval(&mut self, timer_interval: Duration) -> &mut Self {
        self.timer_interval.replace(timer_interval);
        self
    }

    pub fn build(&mut self) -> Endpoint {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .take()
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));

        let (transport_sender, transport_receiver) = unbounded_channel();
        let (incoming_sender, incoming_receiver) = unbounded_channel();

        let inner = std::sync::Arc::new(EndpointInner {
            user_agent: self.user_agent.clone(),
            timers: Timer::new(),
            transport_layer,
            transport_sender,
            transactions: Mutex::new(HashMap::new()),
            finished_transactions: Mutex::new(HashMap::new()),
            incoming_sender,
            cancel_token: cancel_token.child_token(),
            timer_interval: self.timer_interval.unwrap_or(TIMER_INTERVAL),
        });

        Endpoint {
            inner,
            cancel_token,
            transport_receiver: Mutex::new(Some(transport_receiver)),
            incoming_receiver: Mutex::new(Some(incoming_receiver)),
        }
    }
}

/// The transaction layer entry point: owns the timer pump and the
/// transport event dispatch, creates client transactions and surfaces
/// unmatched incoming requests.
pub struct Endpoint {
    pub inner: EndpointInnerRef,
    cancel_token: CancellationToken,
    transport_receiver: Mutex<Option<TransportReceiver>>,
    incoming_receiver: Mutex<Option<UnboundedReceiver<IncomingRequest>>>,
}

impl Endpoint {
    pub fn transport_layer(&self) -> &TransportLayer {
        &self.inner.transport_layer
    }

    pub fn transport_sender(&self) -> TransportSender {
        self.inner.transport_sender.clone()
    }

    pub fn user_agent(&self) -> &str {
        &self.inner.user_agent
    }

    /// Takes the channel of requests that matched no transaction. Call
    /// once; the user agent owns the receiver.
    pub fn incoming_requests(&self) -> Option<UnboundedReceiver<IncomingRequest>> {
        self.incoming_receiver.lock().unwrap().take()
    }

    /// Runs the endpoint until cancelled: pumps transaction timers and
    /// dispatches transport events to their transactions.
    pub async fn serve(&self) {
        let mut transport_receiver = match self.transport_receiver.lock().unwrap().take() {
            Some(receiver) => receiver,
            None => {
                warn!("endpoint serve called twice");
                return;
            }
        };
        select! {
            _ = self.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            },
            _ = self.inner.process_timer() => {},
            _ = self.inner.process_transport(&mut transport_receiver) => {},
        }
        info!("endpoint shutdown");
    }

    pub fn shutdown(&self) {
        info!("endpoint shutdown requested");
        self.cancel_token.cancel();
    }

    pub fn client_transaction(&self, request: Request) -> Result<Transaction> {
        let key = TransactionKey::from_request(&request)?;
        Ok(Transaction::new_client(key, request, self.inner.clone(), None))
    }

    pub fn client_transaction_on(
        &self,
        request: Request,
        connection: SipConnection,
    ) -> Result<Transaction> {
        let key = TransactionKey::from_request(&request)?;
        Ok(Transaction::new_client(
            key,
            request,
            self.inner.clone(),
            Some(connection),
        ))
    }

    /// Builds the server transaction for an unmatched incoming request
    /// and attaches it; INVITE transactions immediately answer 100
    /// Trying.
    pub async fn server_transaction(&self, incoming: IncomingRequest) -> Result<Transaction> {
        let key = TransactionKey::from_request(&incoming.request)?;
        let mut transaction = Transaction::new_server(
            key.clone(),
            incoming.request,
            self.inner.clone(),
            Some(incoming.connection),
        );
        self.inner.attach_transaction(&key, transaction.event_sender());
        if transaction.original.method == Method::Invite {
            transaction.respond_with(StatusCode::TRYING, None).await?;
        }
        Ok(transaction)
    }
}
