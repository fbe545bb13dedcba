use super::{Endpoint, EndpointBuilder};
use crate::message::{Method, Request, SipMessage, StatusCode};
use crate::transport::channel::ChannelConnection;
use crate::transport::{SipAddr, SipConnection, TransportEvent};
use crate::Result;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn make_request(method: Method, branch: &str, cseq: u32) -> Request {
    let text = format!(
        "{} sip:bob@example.test SIP/2.0\r\n\
         Via: SIP/2.0/TCP 192.0.2.10:5060;branch={}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.test>;tag=8s7dfs\r\n\
         To: <sip:bob@example.test>\r\n\
         Call-ID: tx-test@192.0.2.10\r\n\
         CSeq: {} {}\r\n\
         Contact: <sip:alice@192.0.2.10:5060;transport=tcp>\r\n\
         Content-Length: 0\r\n\r\n",
        method, branch, cseq, method
    );
    match SipMessage::try_from(text.as_bytes()).expect("valid request") {
        SipMessage::Request(req) => req,
        _ => panic!("expected request"),
    }
}

/// Endpoint wired to one end of an in-memory channel; the other end acts
/// as the remote peer.
async fn endpoint_with_peer(
    cancel_token: &CancellationToken,
) -> Result<(Endpoint, SipConnection, ChannelConnection)> {
    let endpoint = EndpointBuilder::new()
        .cancel_token(cancel_token.child_token())
        .timer_interval(Duration::from_millis(5))
        .build();

    let local = SipAddr::tcp("192.0.2.10:5060".parse()?);
    let remote = SipAddr::tcp("203.0.113.4:5060".parse()?);
    let (ours, peer) = ChannelConnection::pair(local, remote, cancel_token.clone());

    let serve_side: SipConnection = ours.clone().into();
    let sender = endpoint.transport_sender();
    let spawn_side = serve_side.clone();
    tokio::spawn(async move {
        spawn_side.serve_loop(sender).await.ok();
    });

    Ok((endpoint, serve_side, peer))
}

#[tokio::test]
async fn test_client_non_invite_terminates_on_final_response() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let (endpoint, ours, peer) = endpoint_with_peer(&cancel_token).await?;

    let (peer_sender, mut peer_receiver) = unbounded_channel();
    let peer_loop = peer.clone();
    tokio::spawn(async move {
        peer_loop.serve_loop(peer_sender).await.ok();
    });

    let peer_task = async move {
        if let Some(TransportEvent::Incoming(SipMessage::Request(req), _, _)) =
            peer_receiver.recv().await
        {
            let trying = super::message::make_response(&req, StatusCode::TRYING, None);
            peer.send_message(trying.into()).await.expect("send trying");
            sleep(Duration::from_millis(20)).await;
            let ok = super::message::make_response(&req, StatusCode::OK, None);
            peer.send_message(ok.into()).await.expect("send ok");
        }
        sleep(Duration::from_secs(5)).await;
    };

    let client_task = async {
        let request = make_request(Method::Register, "z9hG4bKclient1", 1);
        let mut tx = endpoint
            .client_transaction_on(request, ours.clone())
            .expect("client transaction");
        tx.send().await.expect("send");

        let mut statuses = Vec::new();
        while let Some(SipMessage::Response(resp)) = tx.receive().await {
            statuses.push(resp.status);
        }
        assert_eq!(statuses, vec![StatusCode::TRYING, StatusCode::OK]);
    };

    select! {
        _ = client_task => {}
        _ = peer_task => panic!("peer finished first"),
        _ = endpoint.serve() => panic!("endpoint exited"),
        _ = sleep(Duration::from_secs(2)) => panic!("timeout"),
    }
    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_client_invite_error_response_is_acked_at_transaction_level() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let (endpoint, ours, peer) = endpoint_with_peer(&cancel_token).await?;

    let (peer_sender, mut peer_receiver) = unbounded_channel();
    let peer_loop = peer.clone();
    tokio::spawn(async move {
        peer_loop.serve_loop(peer_sender).await.ok();
    });

    let peer_task = async move {
        let invite = match peer_receiver.recv().await {
            Some(TransportEvent::Incoming(SipMessage::Request(req), _, _)) => req,
            other => panic!("expected INVITE, got {:?}", other.is_some()),
        };
        let ringing = super::message::make_response(&invite, StatusCode::RINGING, None);
        peer.send_message(ringing.into()).await.expect("send ringing");
        let mut busy = super::message::make_response(&invite, StatusCode::BUSY_HERE, None);
        if let Some(to) = busy.header.to.as_mut() {
            to.tag = Some("uastag1".to_string());
        }
        peer.send_message(busy.into()).await.expect("send busy");

        // the transaction must ACK the non-2xx final response itself
        match timeout(Duration::from_secs(1), peer_receiver.recv()).await {
            Ok(Some(TransportEvent::Incoming(SipMessage::Request(req), _, _))) => {
                assert_eq!(req.method, Method::Ack);
                assert_eq!(req.header.cseq.unwrap().seq, 2);
                assert_eq!(req.header.to_tag(), Some("uastag1"));
            }
            other => panic!("expected ACK, got {:?}", other.is_ok()),
        }
        sleep(Duration::from_secs(5)).await;
    };

    let client_task = async {
        let request = make_request(Method::Invite, "z9hG4bKclient2", 2);
        let mut tx = endpoint
            .client_transaction_on(request, ours.clone())
            .expect("client transaction");
        tx.send().await.expect("send");

        let mut statuses = Vec::new();
        while let Some(SipMessage::Response(resp)) = tx.receive().await {
            statuses.push(resp.status);
        }
        assert_eq!(statuses, vec![StatusCode::RINGING, StatusCode::BUSY_HERE]);
    };

    select! {
        _ = client_task => {}
        _ = peer_task => panic!("peer finished first"),
        _ = endpoint.serve() => panic!("endpoint exited"),
        _ = sleep(Duration::from_secs(2)) => panic!("timeout"),
    }
    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_server_invite_cancel_answers_200_and_487() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let (endpoint, _ours, peer) = endpoint_with_peer(&cancel_token).await?;

    let mut incoming = endpoint.incoming_requests().expect("incoming channel");

    let (peer_sender, mut peer_receiver) = unbounded_channel();
    let peer_loop = peer.clone();
    tokio::spawn(async move {
        peer_loop.serve_loop(peer_sender).await.ok();
    });

    let uas_task = async {
        let request = incoming.recv().await.expect("incoming INVITE");
        assert_eq!(request.request.method, Method::Invite);
        let mut tx = endpoint
            .server_transaction(request)
            .await
            .expect("server transaction");
        tx.respond_with(StatusCode::RINGING, None).await.expect("ringing");

        // pump until the CANCEL surfaces
        let msg = tx.receive().await.expect("cancel surfaces");
        match msg {
            SipMessage::Request(req) => assert_eq!(req.method, Method::Cancel),
            other => panic!("expected CANCEL, got {}", other),
        }
    };

    let peer_task = async move {
        peer.send_message(make_request(Method::Invite, "z9hG4bKserver1", 1).into())
            .await
            .expect("send invite");

        let mut statuses = Vec::new();
        // 100 from the endpoint, 180 from the UAS task
        while statuses.len() < 2 {
            match peer_receiver.recv().await {
                Some(TransportEvent::Incoming(SipMessage::Response(resp), _, _)) => {
                    statuses.push(resp.status)
                }
                Some(_) => {}
                None => panic!("peer channel closed"),
            }
        }
        assert_eq!(statuses, vec![StatusCode::TRYING, StatusCode::RINGING]);

        peer.send_message(make_request(Method::Cancel, "z9hG4bKserver1", 1).into())
            .await
            .expect("send cancel");

        // 200 for the CANCEL and 487 for the INVITE, in either order
        let mut final_statuses = Vec::new();
        while final_statuses.len() < 2 {
            match timeout(Duration::from_secs(1), peer_receiver.recv()).await {
                Ok(Some(TransportEvent::Incoming(SipMessage::Response(resp), _, _))) => {
                    final_statuses.push(resp.status)
                }
                Ok(Some(_)) => {}
                other => panic!("missing final responses: {:?}", other.is_ok()),
            }
        }
        final_statuses.sort();
        assert_eq!(
            final_statuses,
            vec![StatusCode::OK, StatusCode::REQUEST_TERMINATED]
        );
    };

    select! {
        _ = async { tokio::join!(uas_task, peer_task) } => {}
        _ = endpoint.serve() => panic!("endpoint exited"),
        _ = sleep(Duration::from_secs(2)) => panic!("timeout"),
    }
    cancel_token.cancel();
    Ok(())
}
