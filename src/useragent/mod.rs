use crate::config::Config;
use crate::dialog::authenticate::{handle_client_authenticate, Credential};
use crate::dialog::dialog::{Dialog, DialogState};
use crate::dialog::{DialogId, DialogLayer, Registration};
use crate::ice::coordinator::{NominationCoordinator, SessionId};
use crate::ice::gatherer::CandidateGatherer;
use crate::ice::pair::IceRole;
use crate::ice::tester::{IceCredentials, IceOutcome};
use crate::message::header::{CSeq, ContactInfo, FromTo, NameAddr};
use crate::message::{ContentKind, Method, Request, SipMessage, StatusCode, StatusKind, Uri};
use crate::pipeline::{
    OptionsProcessor, Pipeline, PipelineVerdict, RoutingProcessor, SdpBodyProcessor,
};
use crate::sdp::{parse::parse_sdp, SdpNegotiation, SdpSession};
use crate::transaction::endpoint::{Endpoint, EndpointBuilder};
use crate::transaction::{
    make_branch, make_call_id, make_tag, random_text, IncomingRequest, Transaction,
};
use crate::transport::connection::push_via;
use crate::transport::{SipAddr, TransportLayer};
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod session;
pub use session::Session;

#[cfg(test)]
mod tests;

const ICE_UFRAG_LEN: usize = 8;
const ICE_PWD_LEN: usize = 24;
/// Audio and video.
const MEDIA_COUNT: usize = 2;

/// Call progress events delivered to the application.
#[derive(Debug)]
pub enum CallEvent {
    IncomingCall {
        session_id: SessionId,
        from: Uri,
    },
    Ringing(SessionId),
    Answered(SessionId),
    /// ICE finished and both SDP snapshots now carry the nominated media
    /// endpoints. Fired at most once per session.
    MediaReady {
        session_id: SessionId,
        local: SdpSession,
        remote: SdpSession,
    },
    Failed {
        session_id: SessionId,
        reason: String,
    },
    Terminated(SessionId),
}

pub type CallEventSender = UnboundedSender<CallEvent>;
pub type CallEventReceiver = UnboundedReceiver<CallEvent>;

/// The application surface: registration, outgoing and incoming calls,
/// and the serve loop wiring transports, transactions, dialogs, SDP
/// negotiation and ICE together.
pub struct UserAgent {
    pub config: Config,
    endpoint: Arc<Endpoint>,
    dialog_layer: DialogLayer,
    coordinator: NominationCoordinator,
    gatherer: Arc<CandidateGatherer>,
    pipeline: Mutex<Pipeline>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    dialog_sessions: Mutex<HashMap<DialogId, SessionId>>,
    pending_invites: Mutex<HashMap<SessionId, PendingInvite>>,
    next_session_id: AtomicU32,
    event_sender: CallEventSender,
    event_receiver: Mutex<Option<CallEventReceiver>>,
    cancel_token: CancellationToken,
    local_address: Mutex<Option<SocketAddr>>,
}

/// Commands the application can issue against a pending incoming INVITE.
enum InviteCommand {
    Ring,
    Accept,
    Reject(StatusCode),
}

/// An incoming INVITE waiting for the application's accept/reject. The
/// transaction itself is pumped by a background task so CANCELs are
/// honored while the call rings.
struct PendingInvite {
    commands: UnboundedSender<InviteCommand>,
}

impl UserAgent {
    pub fn new(config: Config, cancel_token: CancellationToken) -> Arc<Self> {
        let transport_layer = TransportLayer::new(cancel_token.child_token());
        let endpoint = Arc::new(
            EndpointBuilder::new()
                .transport_layer(transport_layer)
                .cancel_token(cancel_token.child_token())
                .build(),
        );
        let gatherer = Arc::new(CandidateGatherer::from_config(&config));
        let (event_sender, event_receiver) = unbounded_channel();

        // transport end first: routing below, the SDP boundary nearest
        // the application
        let mut pipeline = Pipeline::new();
        pipeline
            .push(Box::new(RoutingProcessor::new(endpoint.user_agent())))
            .push(Box::new(OptionsProcessor))
            .push(Box::new(SdpBodyProcessor));

        Arc::new(UserAgent {
            config,
            endpoint,
            dialog_layer: DialogLayer::new(),
            coordinator: NominationCoordinator::new(),
            gatherer,
            pipeline: Mutex::new(pipeline),
            sessions: Mutex::new(HashMap::new()),
            dialog_sessions: Mutex::new(HashMap::new()),
            pending_invites: Mutex::new(HashMap::new()),
            next_session_id: AtomicU32::new(1),
            event_sender,
            event_receiver: Mutex::new(Some(event_receiver)),
            cancel_token,
            local_address: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> Arc<Endpoint> {
        self.endpoint.clone()
    }

    /// Takes the call event channel; call once.
    pub fn events(&self) -> Option<CallEventReceiver> {
        self.event_receiver.lock().unwrap().take()
    }

    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let bound = self
            .endpoint
            .transport_layer()
            .listen_tcp(addr, self.endpoint.transport_sender())
            .await?;
        *self.local_address.lock().unwrap() = Some(bound);
        Ok(bound)
    }

    fn local_address(&self) -> Result<SocketAddr> {
        self.local_address
            .lock()
            .unwrap()
            .ok_or_else(|| Error::EndpointError("listen before placing calls".to_string()))
    }

    /// Registers with the configured registrar and keeps the binding
    /// fresh until cancellation.
    pub async fn register(&self) -> Result<()> {
        let username = self
            .config
            .username
            .clone()
            .ok_or_else(|| Error::ConfigError("sip.username not configured".to_string()))?;
        let server = self
            .config
            .server
            .clone()
            .ok_or_else(|| Error::ConfigError("sip.server not configured".to_string()))?;
        let credential = self.config.password.clone().map(|password| Credential {
            username: username.clone(),
            password,
        });
        let local = self.local_address()?;
        let mut contact = Uri::new(Some(&username), local.into());
        contact.ensure_tcp_transport();

        let mut registration = Registration::new(
            self.endpoint.clone(),
            username,
            server,
            credential,
            contact,
            self.config.expires,
        );
        registration.serve(self.cancel_token.child_token()).await
    }

    fn new_session(&self) -> Arc<Session> {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let credentials = IceCredentials {
            local_ufrag: random_text(ICE_UFRAG_LEN),
            local_pwd: random_text(ICE_PWD_LEN),
            remote_ufrag: String::new(),
            remote_pwd: String::new(),
        };
        let session = Arc::new(Session::new(session_id, credentials));
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id, session.clone());
        session
    }

    fn session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&session_id).cloned()
    }

    fn bind_dialog(&self, session_id: SessionId, dialog: &Dialog) {
        self.dialog_sessions
            .lock()
            .unwrap()
            .insert(dialog.id(), session_id);
    }

    fn drop_session(&self, session_id: SessionId) {
        self.coordinator.cleanup_session(session_id);
        if let Some(session) = self.sessions.lock().unwrap().remove(&session_id) {
            self.gatherer.release(&session.media_candidates());
        }
        self.dialog_sessions
            .lock()
            .unwrap()
            .retain(|_, id| *id != session_id);
    }

    /// Places a call: gathers candidates, generates the SDP offer, sends
    /// the INVITE and drives the session from a background task.
    pub async fn invite(self: &Arc<Self>, target: Uri) -> Result<SessionId> {
        let local = self.local_address()?;
        let username = self.config.username.clone().unwrap_or_else(|| "peercall".to_string());

        let media_candidates = self.gatherer.gather(MEDIA_COUNT).await?;
        let session = self.new_session();
        let mut negotiation = SdpNegotiation::new(local.ip());
        let credentials = session.credentials();
        let offer = negotiation.generate_offer(
            &username,
            media_candidates.clone(),
            &credentials.local_ufrag,
            &credentials.local_pwd,
        )?;
        session.set_negotiation(negotiation);
        session.set_media_candidates(media_candidates);

        let mut request = self.make_invite(&username, target, local, &offer)?;
        match self.pipeline.lock().unwrap().outgoing_request(&mut request)? {
            PipelineVerdict::Deliver => {}
            _ => return Err(Error::EndpointError("pipeline blocked the INVITE".to_string())),
        }

        let target_addr = SipAddr::resolve(&request.uri).await?;
        let connection = self
            .endpoint
            .transport_layer()
            .lookup(&target_addr, self.endpoint.transport_sender())
            .await?;

        let (state_sender, state_receiver) = unbounded_channel();
        let dialog = Dialog::new_client(
            request.clone(),
            connection.clone(),
            self.endpoint.inner.clone(),
            state_sender,
        )?;
        self.dialog_layer.insert(dialog.clone());
        self.bind_dialog(session.id(), &dialog);
        session.set_dialog(dialog.clone());
        self.spawn_dialog_state_watch(session.id(), state_receiver);

        let transaction = self.endpoint.client_transaction_on(request, connection)?;
        let agent = self.clone();
        let session_id = session.id();
        tokio::spawn(async move {
            if let Err(e) = agent.run_invite_client(session_id, dialog, transaction).await {
                warn!("call {} failed: {}", session_id, e);
                agent.fail_session(session_id, e.to_string());
            }
        });
        Ok(session_id)
    }

    fn make_invite(
        &self,
        username: &str,
        target: Uri,
        local: SocketAddr,
        offer: &SdpSession,
    ) -> Result<Request> {
        let mut contact = Uri::new(Some(username), local.into());
        contact.ensure_tcp_transport();
        let local_aor = Uri::new(Some(username), local.into()).aor();

        let mut request = Request::new(Method::Invite, target.clone());
        push_via(&mut request, &SipAddr::tcp(local), make_branch());
        request.header.max_forwards = Some(70);
        request.header.from =
            Some(FromTo::new(NameAddr::from_uri(local_aor)).with_tag(make_tag()));
        request.header.to = Some(FromTo::new(NameAddr::from_uri(target.aor())));
        request.header.call_id = Some(make_call_id(Some(&local.ip().to_string())));
        request.header.cseq = Some(CSeq::new(1, Method::Invite));
        request.header.contact = vec![ContactInfo::from_uri(contact)];
        request.header.accept = vec!["application/sdp".to_string()];
        request.header.content_type = ContentKind::Sdp;
        request.body = offer.to_string().into_bytes();
        Ok(request)
    }

    /// Drives the outgoing INVITE: dialog establishment, the SDP answer
    /// in the 200 OK, the ACK, and starting ICE in the controllee role.
    async fn run_invite_client(
        self: &Arc<Self>,
        session_id: SessionId,
        dialog: Dialog,
        mut transaction: Transaction,
    ) -> Result<()> {
        transaction.send().await?;
        if let Some(session) = self.session(session_id) {
            session.set_invite_events(transaction.event_sender());
        }

        let mut auth_sent = false;
        while let Some(msg) = transaction.receive().await {
            let mut response = match msg {
                SipMessage::Response(response) => response,
                _ => continue,
            };
            let verdict = {
                self.pipeline
                    .lock()
                    .unwrap()
                    .incoming_response(&mut response)?
            };
            if matches!(verdict, PipelineVerdict::Absorbed) {
                continue;
            }
            match response.status.kind() {
                StatusKind::Provisional => {
                    dialog.on_invite_response(&response)?;
                    if response.status == StatusCode::RINGING {
                        self.event_sender.send(CallEvent::Ringing(session_id)).ok();
                    }
                }
                StatusKind::Successful => {
                    let old_id = dialog.id();
                    dialog.on_invite_response(&response)?;
                    self.dialog_layer.confirm_id(&old_id, dialog.clone());
                    self.bind_dialog(session_id, &dialog);

                    let session = self
                        .session(session_id)
                        .ok_or_else(|| Error::EndpointError("session vanished".to_string()))?;
                    let remote_sdp = parse_sdp(&String::from_utf8_lossy(&response.body))?;
                    session.accept_answer(&remote_sdp)?;

                    let ack = dialog.make_ack(None);
                    dialog.send_ack(ack).await?;
                    self.event_sender.send(CallEvent::Answered(session_id)).ok();

                    // the caller follows the callee's nomination
                    self.start_ice(session_id, IceRole::Controllee)?;
                    return Ok(());
                }
                _ => {
                    let challenged = matches!(
                        response.status,
                        StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED
                    );
                    if challenged && !auth_sent {
                        if let Some(password) = self.config.password.clone() {
                            let username =
                                self.config.username.clone().unwrap_or_default();
                            let cseq = transaction.original.header.cseq.map(|c| c.seq).unwrap_or(1);
                            transaction = handle_client_authenticate(
                                cseq + 1,
                                transaction,
                                response,
                                &Credential { username, password },
                            )
                            .await?;
                            transaction.send().await?;
                            auth_sent = true;
                            continue;
                        }
                    }
                    dialog.on_invite_response(&response)?;
                    // a challenge with no credentials, or a second one
                    // after retrying, surfaces as an auth failure
                    let reason = if challenged {
                        "auth failed".to_string()
                    } else {
                        format!("call rejected: {} {}", response.status, response.reason)
                    };
                    self.fail_session(session_id, reason);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Starts (or reuses) one ICE run per medium. When the last medium
    /// nominates, the pairs are written back into both SDP snapshots
    /// through the negotiation and surface as a single MediaReady event.
    fn start_ice(self: &Arc<Self>, session_id: SessionId, role: IceRole) -> Result<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| Error::EndpointError("session vanished".to_string()))?;

        for media_index in 0..session.media_count() {
            let (local, remote, credentials) = session.ice_inputs_for_media(media_index)?;
            let agent = self.clone();
            let callback_session = session.clone();
            self.coordinator.request_nomination(
                session_id,
                role,
                credentials,
                local,
                remote,
                Box::new(move |outcome| match outcome {
                    IceOutcome::Success(selected) => {
                        match callback_session.complete_media_ice(&selected) {
                            Ok(Some((local, remote))) => {
                                agent
                                    .event_sender
                                    .send(CallEvent::MediaReady {
                                        session_id,
                                        local,
                                        remote,
                                    })
                                    .ok();
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!("ICE rewrite failed: {}", e);
                                agent.fail_session(session_id, format!("ICE failed: {}", e));
                            }
                        }
                    }
                    IceOutcome::Failure(reason) => {
                        agent.fail_session(session_id, format!("ICE failed: {}", reason));
                    }
                }),
            );
        }
        Ok(())
    }

    fn fail_session(&self, session_id: SessionId, reason: String) {
        self.event_sender
            .send(CallEvent::Failed {
                session_id,
                reason,
            })
            .ok();
        self.drop_session(session_id);
    }

    fn invite_command(&self, session_id: SessionId, command: InviteCommand) -> Result<()> {
        let pending = self.pending_invites.lock().unwrap();
        let pending = pending
            .get(&session_id)
            .ok_or_else(|| Error::EndpointError("no pending call".to_string()))?;
        pending
            .commands
            .send(command)
            .map_err(|_| Error::EndpointError("pending call is gone".to_string()))
    }

    /// Sends 180 Ringing for a pending incoming call.
    pub fn ring(&self, session_id: SessionId) -> Result<()> {
        self.invite_command(session_id, InviteCommand::Ring)
    }

    /// Accepts a pending incoming call: the SDP answer goes out in the
    /// 200 OK and ICE starts in the controller role.
    pub fn accept(&self, session_id: SessionId) -> Result<()> {
        self.invite_command(session_id, InviteCommand::Accept)
    }

    /// Rejects a pending incoming call with a final status.
    pub fn reject(&self, session_id: SessionId, status: StatusCode) -> Result<()> {
        self.invite_command(session_id, InviteCommand::Reject(status))
    }

    /// Hangs up a confirmed call.
    pub async fn bye(&self, session_id: SessionId) -> Result<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| Error::EndpointError("no such session".to_string()))?;
        let dialog = session
            .dialog()
            .ok_or_else(|| Error::EndpointError("session has no dialog".to_string()))?;
        dialog.bye().await?;
        self.dialog_layer.remove(&dialog.id());
        self.event_sender.send(CallEvent::Terminated(session_id)).ok();
        self.drop_session(session_id);
        Ok(())
    }

    /// Cancels an outgoing call that has not been answered yet.
    pub async fn cancel(&self, session_id: SessionId) -> Result<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| Error::EndpointError("no such session".to_string()))?;
        session.request_cancel();
        Ok(())
    }

    /// Serves incoming requests until cancelled. Run next to
    /// `endpoint().serve()`.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let mut incoming = self
            .endpoint
            .incoming_requests()
            .ok_or_else(|| Error::EndpointError("serve called twice".to_string()))?;
        loop {
            let request = select! {
                _ = self.cancel_token.cancelled() => break,
                request = incoming.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            if let Err(e) = self.on_incoming_request(request).await {
                warn!("failed to handle incoming request: {}", e);
            }
        }
        Ok(())
    }

    async fn on_incoming_request(self: &Arc<Self>, mut incoming: IncomingRequest) -> Result<()> {
        let verdict = {
            self.pipeline
                .lock()
                .unwrap()
                .incoming_request(&mut incoming.request)?
        };
        match verdict {
            PipelineVerdict::Deliver => {}
            PipelineVerdict::Respond(response) => {
                incoming.connection.send(response.into()).await?;
                return Ok(());
            }
            PipelineVerdict::Absorbed => return Ok(()),
        }

        let dialog_id = DialogId::from_incoming_request(&incoming.request)?;
        if !dialog_id.local_tag.is_empty() {
            // in-dialog request
            match self.dialog_layer.find(&dialog_id) {
                Some(dialog) => return self.on_in_dialog_request(dialog, incoming).await,
                None => {
                    warn!("peer error, {} for unknown dialog {}", incoming.request.method, dialog_id);
                    let response = crate::transaction::message::make_response(
                        &incoming.request,
                        StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
                        None,
                    );
                    incoming.connection.send(response.into()).await?;
                    return Ok(());
                }
            }
        }

        match incoming.request.method {
            Method::Invite => self.on_incoming_invite(incoming).await,
            Method::Ack => {
                debug!("ACK without a dialog, dropping");
                Ok(())
            }
            method => {
                debug!("out-of-dialog {} not supported", method);
                let mut transaction = self.endpoint.server_transaction(incoming).await?;
                transaction
                    .respond_with(StatusCode::NOT_IMPLEMENTED, None)
                    .await
            }
        }
    }

    async fn on_in_dialog_request(
        self: &Arc<Self>,
        dialog: Dialog,
        incoming: IncomingRequest,
    ) -> Result<()> {
        let request = incoming.request.clone();
        if request.method == Method::Ack {
            dialog.handle_in_dialog_request(&request);
            return Ok(());
        }
        let status = dialog.handle_in_dialog_request(&request);
        let mut transaction = self.endpoint.server_transaction(incoming).await?;
        if let Some(status) = status {
            transaction.respond_with(status, None).await?;
        }
        if request.method == Method::Bye {
            let session_id = self.dialog_sessions.lock().unwrap().get(&dialog.id()).copied();
            self.dialog_layer.remove(&dialog.id());
            if let Some(session_id) = session_id {
                self.event_sender.send(CallEvent::Terminated(session_id)).ok();
                self.drop_session(session_id);
            }
        }
        Ok(())
    }

    /// A new INVITE: gather candidates, validate the offer, build the
    /// answer and hand the call to the application as IncomingCall.
    async fn on_incoming_invite(self: &Arc<Self>, incoming: IncomingRequest) -> Result<()> {
        let local = self.local_address()?;
        let username = self.config.username.clone().unwrap_or_else(|| "peercall".to_string());
        let remote_sdp = match parse_sdp(&String::from_utf8_lossy(&incoming.request.body)) {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!("INVITE with unusable SDP offer: {}", e);
                let mut transaction = self.endpoint.server_transaction(incoming).await?;
                return transaction
                    .respond_with(StatusCode::NOT_ACCEPTABLE_HERE, None)
                    .await;
            }
        };
        let from = incoming
            .request
            .header
            .from
            .as_ref()
            .map(|f| f.address.uri.clone())
            .unwrap_or_default();

        let media_candidates = self.gatherer.gather(MEDIA_COUNT).await?;
        let session = self.new_session();
        let mut negotiation = SdpNegotiation::new(local.ip());
        let credentials = session.credentials();
        match negotiation.process_offer(
            remote_sdp,
            &username,
            media_candidates.clone(),
            &credentials.local_ufrag,
            &credentials.local_pwd,
        ) {
            Ok(_answer) => {}
            Err(e) => {
                warn!("rejecting offer: {}", e);
                self.drop_session(session.id());
                let mut transaction = self.endpoint.server_transaction(incoming).await?;
                return transaction
                    .respond_with(StatusCode::NOT_ACCEPTABLE_HERE, None)
                    .await;
            }
        }
        session.set_negotiation(negotiation);
        session.set_media_candidates(media_candidates);

        let mut contact = Uri::new(Some(&username), local.into());
        contact.ensure_tcp_transport();
        let (state_sender, state_receiver) = unbounded_channel();
        let dialog = Dialog::new_server(
            incoming.request.clone(),
            incoming.connection.clone(),
            self.endpoint.inner.clone(),
            state_sender,
            contact,
        )?;
        self.dialog_layer.insert(dialog.clone());
        self.bind_dialog(session.id(), &dialog);
        session.set_dialog(dialog.clone());
        self.spawn_dialog_state_watch(session.id(), state_receiver);

        let transaction = self.endpoint.server_transaction(incoming).await?;
        let (command_sender, command_receiver) = unbounded_channel();
        self.pending_invites.lock().unwrap().insert(
            session.id(),
            PendingInvite {
                commands: command_sender,
            },
        );

        let agent = self.clone();
        let session_id = session.id();
        tokio::spawn(async move {
            agent
                .run_invite_server(session_id, dialog, transaction, command_receiver)
                .await;
        });

        self.event_sender
            .send(CallEvent::IncomingCall {
                session_id: session.id(),
                from,
            })
            .ok();
        Ok(())
    }

    /// Pumps the INVITE server transaction while the application decides.
    /// A CANCEL from the peer terminates the call (the transaction has
    /// already answered 200 to the CANCEL and 487 to the INVITE).
    async fn run_invite_server(
        self: &Arc<Self>,
        session_id: SessionId,
        dialog: Dialog,
        mut transaction: Transaction,
        mut commands: UnboundedReceiver<InviteCommand>,
    ) {
        enum Step {
            Message(Option<SipMessage>),
            Command(Option<InviteCommand>),
        }
        loop {
            // resolve the select before touching the transaction again,
            // so its receive future is dropped first
            let step = select! {
                msg = transaction.receive() => Step::Message(msg),
                command = commands.recv() => Step::Command(command),
            };
            match step {
                Step::Message(Some(SipMessage::Request(request)))
                    if request.method == Method::Cancel =>
                {
                    // a CANCEL only has an effect while the INVITE is
                    // still unanswered
                    let was_pending = self
                        .pending_invites
                        .lock()
                        .unwrap()
                        .remove(&session_id)
                        .is_some();
                    if was_pending {
                        info!("call {} cancelled by peer", session_id);
                        dialog.on_cancelled();
                        self.dialog_layer.remove(&dialog.id());
                        self.event_sender.send(CallEvent::Terminated(session_id)).ok();
                        self.drop_session(session_id);
                        return;
                    }
                }
                Step::Message(Some(_)) => {}
                Step::Message(None) | Step::Command(None) => break,
                Step::Command(Some(InviteCommand::Ring)) => {
                    dialog
                        .respond_invite(&mut transaction, StatusCode::RINGING, None)
                        .await
                        .ok();
                }
                Step::Command(Some(InviteCommand::Accept)) => {
                    if let Err(e) = self
                        .accept_pending(session_id, &dialog, &mut transaction)
                        .await
                    {
                        warn!("accepting call {} failed: {}", session_id, e);
                        self.fail_session(session_id, e.to_string());
                        return;
                    }
                }
                Step::Command(Some(InviteCommand::Reject(status))) => {
                    dialog
                        .respond_invite(&mut transaction, status, None)
                        .await
                        .ok();
                    self.dialog_layer.remove(&dialog.id());
                    self.pending_invites.lock().unwrap().remove(&session_id);
                    self.drop_session(session_id);
                    return;
                }
            }
        }
        self.pending_invites.lock().unwrap().remove(&session_id);
    }

    async fn accept_pending(
        self: &Arc<Self>,
        session_id: SessionId,
        dialog: &Dialog,
        transaction: &mut Transaction,
    ) -> Result<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| Error::EndpointError("session vanished".to_string()))?;
        let answer = session.local_sdp()?;
        dialog
            .respond_invite(
                transaction,
                StatusCode::OK,
                Some((ContentKind::Sdp, answer.to_string().into_bytes())),
            )
            .await?;
        session.answer_delivered();
        self.pending_invites.lock().unwrap().remove(&session_id);
        // the callee controls nomination
        self.start_ice(session_id, IceRole::Controller)
    }

    fn spawn_dialog_state_watch(
        self: &Arc<Self>,
        session_id: SessionId,
        mut receiver: UnboundedReceiver<DialogState>,
    ) {
        let agent = self.clone();
        tokio::spawn(async move {
            while let Some(state) = receiver.recv().await {
                if let DialogState::Terminated(id, reason) = state {
                    info!("dialog {} terminated: {:?}", id, reason);
                    break;
                }
            }
            let _ = agent;
        });
    }
}

