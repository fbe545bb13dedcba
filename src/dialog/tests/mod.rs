use super::authenticate::Credential;
use super::dialog::{Dialog, DialogState};
use super::dialog_layer::DialogLayer;
use super::registration::{Registration, RegistrationStatus};
use super::DialogId;
use crate::message::header::Rport;
use crate::message::{Method, Request, SipMessage, StatusCode, Uri};
use crate::transaction::endpoint::{Endpoint, EndpointBuilder};
use crate::transaction::message::make_response;
use crate::transport::channel::ChannelConnection;
use crate::transport::{SipAddr, SipConnection, TransportEvent};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn invite_request() -> Request {
    let text = "INVITE sip:bob@example.test SIP/2.0\r\n\
        Via: SIP/2.0/TCP 192.0.2.10:5060;branch=z9hG4bKdlg1\r\n\
        Max-Forwards: 70\r\n\
        From: <sip:alice@example.test>;tag=alice1\r\n\
        To: <sip:bob@example.test>\r\n\
        Call-ID: dialog-test@192.0.2.10\r\n\
        CSeq: 1 INVITE\r\n\
        Contact: <sip:alice@192.0.2.10:5060;transport=tcp>\r\n\
        Content-Length: 0\r\n\r\n";
    match SipMessage::try_from(text.as_bytes()).unwrap() {
        SipMessage::Request(req) => req,
        _ => unreachable!(),
    }
}

fn setup() -> (Arc<Endpoint>, SipConnection, ChannelConnection, CancellationToken) {
    let cancel_token = CancellationToken::new();
    let endpoint = Arc::new(
        EndpointBuilder::new()
            .cancel_token(cancel_token.child_token())
            .timer_interval(Duration::from_millis(5))
            .build(),
    );
    let local = SipAddr::tcp("192.0.2.10:5060".parse().unwrap());
    let remote = SipAddr::tcp("203.0.113.4:5060".parse().unwrap());
    let (ours, peer) = ChannelConnection::pair(local, remote.clone(), cancel_token.clone());

    let serve_side: SipConnection = ours.into();
    endpoint
        .transport_layer()
        .add_peer_connection(remote, serve_side.clone());
    let sender = endpoint.transport_sender();
    let spawn_side = serve_side.clone();
    tokio::spawn(async move {
        spawn_side.serve_loop(sender).await.ok();
    });
    (endpoint, serve_side, peer, cancel_token)
}

#[test]
fn test_dialog_id_sides_mirror() {
    let request = invite_request();
    let incoming = DialogId::from_incoming_request(&request).unwrap();
    assert_eq!(incoming.remote_tag, "alice1");
    assert!(incoming.local_tag.is_empty());

    let mut response = make_response(&request, StatusCode::OK, None);
    response.header.to.as_mut().unwrap().tag = Some("bob1".to_string());
    let outgoing = DialogId::from_response(&response).unwrap();
    assert_eq!(outgoing.local_tag, "alice1");
    assert_eq!(outgoing.remote_tag, "bob1");
}

#[tokio::test]
async fn test_client_dialog_establishment() -> Result<()> {
    let (endpoint, ours, _peer, cancel_token) = setup();
    let (state_sender, mut state_receiver) = unbounded_channel();
    let dialog = Dialog::new_client(
        invite_request(),
        ours,
        endpoint.inner.clone(),
        state_sender,
    )?;
    assert!(dialog.id().is_early());

    let mut ringing = make_response(dialog.initial_request(), StatusCode::RINGING, None);
    ringing.header.to.as_mut().unwrap().tag = Some("bob1".to_string());
    dialog.on_invite_response(&ringing)?;
    assert_eq!(dialog.id().remote_tag, "bob1");
    assert!(matches!(
        state_receiver.recv().await,
        Some(DialogState::Early(_, StatusCode::RINGING))
    ));

    let mut ok = make_response(dialog.initial_request(), StatusCode::OK, None);
    ok.header.to.as_mut().unwrap().tag = Some("bob1".to_string());
    dialog.on_invite_response(&ok)?;
    assert!(dialog.state().is_confirmed());

    // ACK reuses the INVITE CSeq number with method ACK
    let ack = dialog.make_ack(None);
    assert_eq!(ack.header.cseq.unwrap().seq, 1);
    assert_eq!(ack.header.cseq.unwrap().method, Method::Ack);

    // a later in-dialog request keeps the CSeq strictly increasing
    let bye = dialog.make_request(Method::Bye);
    assert_eq!(bye.header.cseq.unwrap().seq, 2);
    assert_eq!(bye.header.to_tag(), Some("bob1"));

    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_bye_requires_confirmed_dialog() -> Result<()> {
    let (endpoint, ours, _peer, cancel_token) = setup();
    let (state_sender, _state_receiver) = unbounded_channel();
    let dialog = Dialog::new_client(
        invite_request(),
        ours,
        endpoint.inner.clone(),
        state_sender,
    )?;
    assert!(dialog.bye().await.is_err());
    cancel_token.cancel();
    Ok(())
}

#[test]
fn test_dialog_layer_early_match() {
    let id = DialogId {
        call_id: "c1".to_string(),
        local_tag: "lt".to_string(),
        remote_tag: "rt".to_string(),
    };
    let layer = DialogLayer::new();
    assert!(layer.find(&id).is_none());
    assert!(layer.is_empty());
}

struct FakeRegistrar {
    peer: ChannelConnection,
    receiver: UnboundedReceiver<TransportEvent>,
}

impl FakeRegistrar {
    fn start(peer: ChannelConnection) -> Self {
        let (sender, receiver) = unbounded_channel();
        let serve_peer = peer.clone();
        tokio::spawn(async move {
            serve_peer.serve_loop(sender).await.ok();
        });
        FakeRegistrar { peer, receiver }
    }

    async fn expect_register(&mut self) -> Request {
        loop {
            match self.receiver.recv().await {
                Some(TransportEvent::Incoming(SipMessage::Request(req), _, _)) => {
                    assert_eq!(req.method, Method::Register);
                    return req;
                }
                Some(_) => continue,
                None => panic!("registrar channel closed"),
            }
        }
    }

    /// 200 OK echoing the Contact, with the given reflexive address in
    /// the top Via.
    async fn answer_ok(&self, request: &Request, reflexive: Option<(&str, u16)>) {
        let mut response = make_response(request, StatusCode::OK, None);
        response.header.contact = request.header.contact.clone();
        if let Some((host, port)) = reflexive {
            let via = response.header.top_via_mut().unwrap();
            via.received = Some(host.to_string());
            via.rport = Some(Rport::Port(port));
        }
        self.peer.send_message(response.into()).await.expect("send 200");
    }
}

/// Scenario: the first 200 OK reveals a NAT. The controller deregisters
/// the stale binding, re-registers with the reflexive address and ends
/// up Active.
#[tokio::test]
async fn test_register_nat_rebinding_dance() -> Result<()> {
    let (endpoint, _ours, peer, cancel_token) = setup();
    let mut registrar = FakeRegistrar::start(peer);

    let mut registration = Registration::new(
        endpoint.clone(),
        "u",
        "203.0.113.4:5060",
        None,
        Uri::parse("sip:u@192.0.2.10:5060;transport=tcp")?,
        3600,
    );

    let registrar_task = async {
        let first = registrar.expect_register().await;
        assert_eq!(first.header.expires, Some(3600));
        registrar.answer_ok(&first, Some(("198.51.100.7", 51000))).await;

        let dereg = registrar.expect_register().await;
        assert_eq!(dereg.header.expires, Some(0));
        registrar.answer_ok(&dereg, Some(("198.51.100.7", 51000))).await;

        let rereg = registrar.expect_register().await;
        assert_eq!(rereg.header.expires, Some(3600));
        let contact = &rereg.header.contact[0].address.uri;
        assert_eq!(contact.host_port.host, "198.51.100.7");
        assert_eq!(contact.host_port.port, Some(51000));
        registrar.answer_ok(&rereg, Some(("198.51.100.7", 51000))).await;
    };

    let bind_task = async {
        registration.bind().await.expect("bind succeeds");
        assert_eq!(registration.status, RegistrationStatus::Active);
        assert_eq!(registration.refresh_interval(), Duration::from_secs(3595));
    };

    select! {
        _ = async { tokio::join!(bind_task, registrar_task) } => {}
        _ = endpoint.serve() => panic!("endpoint exited"),
        _ = sleep(Duration::from_secs(2)) => panic!("timeout"),
    }
    cancel_token.cancel();
    Ok(())
}

/// Scenario: at refresh time the reflexive address changed. No second
/// deregistration dance; the new address is adopted and refreshing
/// continues.
#[tokio::test]
async fn test_refresh_adopts_new_nat_address_without_dance() -> Result<()> {
    let (endpoint, _ours, peer, cancel_token) = setup();
    let mut registrar = FakeRegistrar::start(peer);

    let mut registration = Registration::new(
        endpoint.clone(),
        "u",
        "203.0.113.4:5060",
        None,
        Uri::parse("sip:u@192.0.2.10:5060;transport=tcp")?,
        3600,
    );

    let registrar_task = async {
        // clean first registration: no reflexive mismatch
        let first = registrar.expect_register().await;
        registrar.answer_ok(&first, None).await;

        // refresh: the NAT binding moved
        let refresh = registrar.expect_register().await;
        assert_eq!(refresh.header.expires, Some(3600));
        registrar.answer_ok(&refresh, Some(("198.51.100.9", 52000))).await;
    };

    let client_task = async {
        registration.bind().await.expect("bind succeeds");
        assert_eq!(registration.status, RegistrationStatus::Active);

        registration.refresh().await.expect("refresh succeeds");
        assert_eq!(registration.status, RegistrationStatus::Active);
        assert_eq!(registration.contact.host_port.host, "198.51.100.9");
        assert_eq!(registration.contact.host_port.port, Some(52000));
    };

    select! {
        _ = async { tokio::join!(client_task, registrar_task) } => {}
        _ = endpoint.serve() => panic!("endpoint exited"),
        _ = sleep(Duration::from_secs(2)) => panic!("timeout"),
    }
    cancel_token.cancel();
    Ok(())
}

/// A 401 challenge is answered once with digest credentials.
#[tokio::test]
async fn test_register_digest_challenge() -> Result<()> {
    let (endpoint, _ours, peer, cancel_token) = setup();
    let mut registrar = FakeRegistrar::start(peer);

    let mut registration = Registration::new(
        endpoint.clone(),
        "alice",
        "203.0.113.4:5060",
        Some(Credential {
            username: "alice".to_string(),
            password: "secret".to_string(),
        }),
        Uri::parse("sip:alice@192.0.2.10:5060;transport=tcp")?,
        3600,
    );

    let registrar_task = async {
        let first = registrar.expect_register().await;
        let mut challenge = make_response(&first, StatusCode::UNAUTHORIZED, None);
        challenge.header.www_authenticate = Some(crate::message::header::DigestChallenge {
            realm: "example.test".to_string(),
            nonce: "84a4cc6f".to_string(),
            qop: vec!["auth".to_string()],
            ..Default::default()
        });
        registrar
            .peer
            .send_message(challenge.into())
            .await
            .expect("send 401");

        let retried = registrar.expect_register().await;
        let credentials = retried.header.authorization.as_ref().expect("authorization");
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.realm, "example.test");
        assert_eq!(credentials.qop.as_deref(), Some("auth"));
        assert!(retried.header.cseq.unwrap().seq > first.header.cseq.unwrap().seq);
        registrar.answer_ok(&retried, None).await;
    };

    let client_task = async {
        registration.bind().await.expect("bind succeeds");
        assert_eq!(registration.status, RegistrationStatus::Active);
    };

    select! {
        _ = async { tokio::join!(client_task, registrar_task) } => {}
        _ = endpoint.serve() => panic!("endpoint exited"),
        _ = sleep(Duration::from_secs(2)) => panic!("timeout"),
    }
    cancel_token.cancel();
    Ok(())
}
