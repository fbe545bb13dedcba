use super::DialogId;
use crate::message::header::{ContactInfo, FromTo, RouteEntry};
use crate::message::{ContentKind, Method, Request, Response, SipMessage, StatusCode, StatusKind, Uri};
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::TransactionKey;
use crate::transaction::message::make_response;
use crate::transaction::transaction::Transaction;
use crate::transaction::{make_branch, make_tag};
use crate::transport::connection::push_via;
use crate::transport::SipConnection;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Dialog lifecycle. A dialog is created by the first tagged provisional
/// or the 2xx to an INVITE, confirmed by the 2xx (client) or the ACK
/// (server), and torn down by BYE, CANCEL or a final error.
#[derive(Debug, Clone)]
pub enum DialogState {
    Calling(DialogId),
    Early(DialogId, StatusCode),
    WaitAck(DialogId),
    Confirmed(DialogId),
    Terminated(DialogId, TerminatedReason),
}

#[derive(Debug, Clone)]
pub enum TerminatedReason {
    UacCancel,
    UacBye,
    UasBye,
    Rejected(StatusCode),
    Timeout,
    TransportError,
}

impl DialogState {
    pub fn id(&self) -> &DialogId {
        match self {
            DialogState::Calling(id)
            | DialogState::Early(id, _)
            | DialogState::WaitAck(id)
            | DialogState::Confirmed(id)
            | DialogState::Terminated(id, _) => id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(_, _))
    }
}

pub type DialogStateSender = UnboundedSender<DialogState>;
pub type DialogStateReceiver = UnboundedReceiver<DialogState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    Client,
    Server,
}

pub(super) struct DialogInner {
    pub role: DialogRole,
    pub id: Mutex<DialogId>,
    pub state: Mutex<DialogState>,
    pub local_seq: AtomicU32,
    pub remote_seq: AtomicU32,
    pub from: FromTo,
    pub to: Mutex<FromTo>,
    pub local_contact: Uri,
    pub remote_target: Mutex<Uri>,
    pub route_set: Mutex<Vec<RouteEntry>>,
    pub connection: SipConnection,
    pub initial_request: Request,
    pub(super) endpoint_inner: EndpointInnerRef,
    state_sender: DialogStateSender,
}

/// A SIP dialog, client or server side. Cloneable handle over shared
/// state; request builders bump the local CSeq atomically.
#[derive(Clone)]
pub struct Dialog {
    inner: Arc<DialogInner>,
}

impl Dialog {
    /// Client dialog from the INVITE we are about to send. The remote
    /// tag is learned from the first tagged response.
    pub fn new_client(
        request: Request,
        connection: SipConnection,
        endpoint_inner: EndpointInnerRef,
        state_sender: DialogStateSender,
    ) -> Result<Dialog> {
        let from = request
            .header
            .from
            .clone()
            .ok_or_else(|| Error::MessageError("INVITE without From".to_string()))?;
        let to = request
            .header
            .to
            .clone()
            .ok_or_else(|| Error::MessageError("INVITE without To".to_string()))?;
        let call_id = request
            .header
            .call_id
            .clone()
            .ok_or_else(|| Error::MessageError("INVITE without Call-ID".to_string()))?;
        let local_contact = request
            .header
            .contact
            .first()
            .map(|c| c.address.uri.clone())
            .ok_or_else(|| Error::MessageError("INVITE without Contact".to_string()))?;
        let seq = request.header.cseq.map(|c| c.seq).unwrap_or(1);

        let id = DialogId {
            call_id,
            local_tag: from.tag.clone().unwrap_or_default(),
            remote_tag: String::new(),
        };
        let state = DialogState::Calling(id.clone());
        Ok(Dialog {
            inner: Arc::new(DialogInner {
                role: DialogRole::Client,
                id: Mutex::new(id),
                state: Mutex::new(state),
                local_seq: AtomicU32::new(seq),
                remote_seq: AtomicU32::new(0),
                from,
                to: Mutex::new(to),
                local_contact,
                remote_target: Mutex::new(request.uri.clone()),
                route_set: Mutex::new(Vec::new()),
                connection,
                initial_request: request,
                endpoint_inner,
                state_sender,
            }),
        })
    }

    /// Server dialog from an incoming INVITE; generates our To tag.
    pub fn new_server(
        request: Request,
        connection: SipConnection,
        endpoint_inner: EndpointInnerRef,
        state_sender: DialogStateSender,
        local_contact: Uri,
    ) -> Result<Dialog> {
        let remote_from = request
            .header
            .from
            .clone()
            .ok_or_else(|| Error::MessageError("INVITE without From".to_string()))?;
        let mut local_to = request
            .header
            .to
            .clone()
            .ok_or_else(|| Error::MessageError("INVITE without To".to_string()))?;
        let call_id = request
            .header
            .call_id
            .clone()
            .ok_or_else(|| Error::MessageError("INVITE without Call-ID".to_string()))?;
        let local_tag = make_tag();
        local_to.tag = Some(local_tag.clone());

        let remote_target = request
            .header
            .contact
            .first()
            .map(|c| c.address.uri.clone())
            .ok_or_else(|| Error::MessageError("INVITE without Contact".to_string()))?;

        // route set from Record-Route, kept in order for the server side
        let route_set = request.header.record_route.clone();
        let remote_seq = request.header.cseq.map(|c| c.seq).unwrap_or(1);

        let id = DialogId {
            call_id,
            local_tag,
            remote_tag: remote_from.tag.clone().unwrap_or_default(),
        };
        let state = DialogState::Calling(id.clone());
        Ok(Dialog {
            inner: Arc::new(DialogInner {
                role: DialogRole::Server,
                id: Mutex::new(id),
                state: Mutex::new(state),
                local_seq: AtomicU32::new(0),
                remote_seq: AtomicU32::new(remote_seq),
                from: local_to,
                to: Mutex::new(remote_from),
                local_contact,
                remote_target: Mutex::new(remote_target),
                route_set: Mutex::new(route_set),
                connection,
                initial_request: request,
                endpoint_inner,
                state_sender,
            }),
        })
    }

    pub fn id(&self) -> DialogId {
        self.inner.id.lock().unwrap().clone()
    }

    pub fn role(&self) -> DialogRole {
        self.inner.role
    }

    pub fn state(&self) -> DialogState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn initial_request(&self) -> &Request {
        &self.inner.initial_request
    }

    /// Our To tag for the responses this server dialog sends.
    pub fn local_tag(&self) -> String {
        self.inner.id.lock().unwrap().local_tag.clone()
    }

    fn transition(&self, state: DialogState) {
        let mut current = self.inner.state.lock().unwrap();
        if current.is_terminated() {
            return;
        }
        debug!("dialog {} -> {:?}", state.id(), state);
        *current = state.clone();
        drop(current);
        self.inner.state_sender.send(state).ok();
    }

    /// Client side: digest a response to our INVITE. Establishes the
    /// dialog on the first tagged 1xx/2xx, learns the route set from the
    /// reversed Record-Route list and the remote target from Contact.
    pub fn on_invite_response(&self, response: &Response) -> Result<()> {
        if self.inner.role != DialogRole::Client {
            return Ok(());
        }
        let mut id = self.inner.id.lock().unwrap();
        if id.remote_tag.is_empty() {
            if let Some(tag) = response.header.to_tag() {
                id.remote_tag = tag.to_string();
            }
        }
        let id = id.clone();

        if let Some(to) = &response.header.to {
            *self.inner.to.lock().unwrap() = to.clone();
        }
        if let Some(contact) = response.header.contact.first() {
            *self.inner.remote_target.lock().unwrap() = contact.address.uri.clone();
        }
        match response.status.kind() {
            StatusKind::Provisional => {
                if response.status != StatusCode::TRYING && !id.remote_tag.is_empty() {
                    self.transition(DialogState::Early(id, response.status));
                }
            }
            StatusKind::Successful => {
                let mut route_set: Vec<RouteEntry> = response.header.record_route.clone();
                route_set.reverse();
                *self.inner.route_set.lock().unwrap() = route_set;
                self.transition(DialogState::Confirmed(id));
            }
            _ => {
                self.transition(DialogState::Terminated(
                    id,
                    TerminatedReason::Rejected(response.status),
                ));
            }
        }
        Ok(())
    }

    /// Builds an in-dialog request: fresh branch, next CSeq (the ACK
    /// reuses the INVITE's number), request URI from the remote target,
    /// Route set copied from the dialog.
    pub fn make_request(&self, method: Method) -> Request {
        let seq = match method {
            Method::Ack => self.inner.local_seq.load(Ordering::SeqCst),
            _ => self.inner.local_seq.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let mut uri = self.inner.remote_target.lock().unwrap().clone();
        uri.ensure_tcp_transport();
        let mut request = Request::new(method, uri);
        push_via(
            &mut request,
            self.inner.connection.get_addr(),
            make_branch(),
        );
        request.header.max_forwards = Some(70);
        request.header.from = Some(self.inner.from.clone());
        request.header.to = Some(self.inner.to.lock().unwrap().clone());
        request.header.call_id = Some(self.inner.id.lock().unwrap().call_id.clone());
        request.header.cseq = Some(crate::message::header::CSeq::new(seq, method));
        request.header.route = self.inner.route_set.lock().unwrap().clone();
        request.header.contact = vec![ContactInfo::from_uri(self.inner.local_contact.clone())];
        request
    }

    /// ACK for the 2xx that confirmed this client dialog.
    pub fn make_ack(&self, body: Option<(ContentKind, Vec<u8>)>) -> Request {
        let mut ack = self.make_request(Method::Ack);
        ack.header.contact.clear();
        if let Some((kind, body)) = body {
            ack.header.content_type = kind;
            ack.body = body;
        }
        ack
    }

    pub async fn send_ack(&self, ack: Request) -> Result<()> {
        self.inner.connection.send(ack.into()).await?;
        if self.inner.role == DialogRole::Client {
            let id = self.id();
            self.transition(DialogState::Confirmed(id));
        }
        Ok(())
    }

    /// Sends BYE inside the dialog. Only valid once the dialog is
    /// confirmed; the transaction runs on the dialog's connection.
    pub async fn bye(&self) -> Result<()> {
        if !self.state().is_confirmed() {
            return Err(Error::DialogError(
                "BYE before dialog is confirmed".to_string(),
                self.id(),
            ));
        }
        let request = self.make_request(Method::Bye);
        let key = TransactionKey::from_request(&request)?;
        let mut tx = Transaction::new_client(
            key,
            request,
            self.inner.endpoint_inner.clone(),
            Some(self.inner.connection.clone()),
        );
        tx.send().await?;
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                match resp.status.kind() {
                    StatusKind::Provisional => continue,
                    _ => break,
                }
            }
        }
        self.transition(DialogState::Terminated(self.id(), TerminatedReason::UacBye));
        Ok(())
    }

    /// Server side: respond to the INVITE through its transaction,
    /// stamping our tag and Contact.
    pub async fn respond_invite(
        &self,
        tx: &mut Transaction,
        status: StatusCode,
        body: Option<(ContentKind, Vec<u8>)>,
    ) -> Result<()> {
        let mut response = make_response(&self.inner.initial_request, status, None);
        if let Some(to) = response.header.to.as_mut() {
            to.tag = Some(self.local_tag());
        }
        if status.kind() == StatusKind::Successful || status == StatusCode::RINGING {
            response.header.contact =
                vec![ContactInfo::from_uri(self.inner.local_contact.clone())];
        }
        if let Some((kind, body)) = body {
            response.header.content_type = kind;
            response.body = body;
        }
        tx.respond(response).await?;

        let id = self.id();
        match status.kind() {
            StatusKind::Provisional => {
                if status != StatusCode::TRYING {
                    self.transition(DialogState::Early(id, status));
                }
            }
            StatusKind::Successful => self.transition(DialogState::WaitAck(id)),
            _ => self.transition(DialogState::Terminated(
                id,
                TerminatedReason::Rejected(status),
            )),
        }
        Ok(())
    }

    /// Digests an in-dialog request (ACK after our 2xx, BYE, OPTIONS)
    /// and returns the status the caller should answer with through a
    /// server transaction; `None` means no response (ACK). The remote
    /// CSeq must be strictly increasing.
    pub fn handle_in_dialog_request(&self, request: &Request) -> Option<StatusCode> {
        let seq = request.header.cseq.map(|c| c.seq).unwrap_or(0);
        if request.method != Method::Ack {
            let last = self.inner.remote_seq.load(Ordering::SeqCst);
            if seq <= last && last != 0 {
                warn!("dialog {} out of order CSeq {} <= {}", self.id(), seq, last);
                return Some(StatusCode::SERVER_INTERNAL_ERROR);
            }
            self.inner.remote_seq.store(seq, Ordering::SeqCst);
        }

        match request.method {
            Method::Ack => {
                let id = self.id();
                info!("dialog {} confirmed by ACK", id);
                self.transition(DialogState::Confirmed(id));
                None
            }
            Method::Bye => {
                self.transition(DialogState::Terminated(self.id(), TerminatedReason::UasBye));
                Some(StatusCode::OK)
            }
            Method::Options => Some(StatusCode::OK),
            method => {
                debug!("dialog {} ignoring in-dialog {}", self.id(), method);
                Some(StatusCode::NOT_IMPLEMENTED)
            }
        }
    }

    pub fn on_cancelled(&self) {
        self.transition(DialogState::Terminated(self.id(), TerminatedReason::UacCancel));
    }

    pub fn on_transport_error(&self) {
        self.transition(DialogState::Terminated(
            self.id(),
            TerminatedReason::TransportError,
        ));
    }
}
