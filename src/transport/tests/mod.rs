use super::channel::ChannelConnection;
use super::connection::{SipConnection, TransportEvent};
use super::sip_addr::SipAddr;
use super::tcp::TcpConnection;
use super::transport_layer::TransportLayer;
use crate::message::header::Rport;
use crate::message::{Method, Request, SipMessage, Uri};
use crate::Result;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn test_request(target: &str, branch: &str) -> Request {
    let text = format!(
        "OPTIONS {} SIP/2.0\r\n\
         Via: SIP/2.0/TCP 192.0.2.10:5060;branch={}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.test>;tag=8s7dfs\r\n\
         To: <sip:bob@example.test>\r\n\
         Call-ID: transport-test@192.0.2.10\r\n\
         CSeq: 1 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n",
        target, branch
    );
    match SipMessage::try_from(text.as_bytes()).expect("valid request") {
        SipMessage::Request(req) => req,
        _ => panic!("expected request"),
    }
}

#[tokio::test]
async fn test_tcp_roundtrip() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let layer = TransportLayer::new(cancel_token.clone());
    let (server_sender, mut server_receiver) = unbounded_channel();
    let bound = layer.listen_tcp("127.0.0.1:0".parse()?, server_sender).await?;

    let (client_sender, _client_receiver) = unbounded_channel();
    let client = TcpConnection::connect(bound, cancel_token.child_token()).await?;
    let client: SipConnection = client.into();
    let spawn_client = client.clone();
    tokio::spawn(async move {
        spawn_client.serve_loop(client_sender).await.ok();
    });

    let uri = format!("sip:bob@{}", bound);
    client
        .send(test_request(&uri, "z9hG4bKtcp1").into())
        .await?;

    // the listener raises New for the accepted connection, then Incoming
    let mut incoming = None;
    for _ in 0..2 {
        match timeout(Duration::from_secs(2), server_receiver.recv()).await {
            Ok(Some(TransportEvent::Incoming(msg, _, _))) => {
                incoming = Some(msg);
                break;
            }
            Ok(Some(_)) => continue,
            other => panic!("unexpected transport event: {:?}", other),
        }
    }
    let msg = incoming.expect("incoming message");
    assert!(msg.is_request());
    assert_eq!(msg.header().call_id.as_deref(), Some("transport-test@192.0.2.10"));

    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_via_received_stamped_on_incoming_request() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let addr_a = SipAddr::tcp("192.0.2.10:5060".parse()?);
    let addr_b = SipAddr::tcp("198.51.100.7:51000".parse()?);
    let (a, b) = ChannelConnection::pair(addr_a, addr_b, cancel_token.clone());

    let (sender, mut receiver) = unbounded_channel();
    let serve_b = b.clone();
    tokio::spawn(async move {
        serve_b.serve_loop(sender).await.ok();
    });

    // the Via claims 192.0.2.10:5060 but the bytes arrive from a's address
    a.send_message(test_request("sip:bob@example.test", "z9hG4bKrecv").into())
        .await?;

    let event = timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("no timeout")
        .expect("event");
    match event {
        TransportEvent::Incoming(SipMessage::Request(req), _, source) => {
            assert_eq!(source.addr.port(), 5060);
            let via = req.header.top_via().unwrap();
            // host matches, port matches: nothing stamped
            assert!(via.received.is_none());
        }
        other => panic!("unexpected event: {:?}", other),
    }

    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_via_received_differs() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let addr_a = SipAddr::tcp("198.51.100.7:51000".parse()?);
    let addr_b = SipAddr::tcp("203.0.113.4:5060".parse()?);
    let (a, b) = ChannelConnection::pair(addr_a, addr_b, cancel_token.clone());

    let (sender, mut receiver) = unbounded_channel();
    let serve_b = b.clone();
    tokio::spawn(async move {
        serve_b.serve_loop(sender).await.ok();
    });

    a.send_message(test_request("sip:bob@example.test", "z9hG4bKnat").into())
        .await?;

    let event = timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("no timeout")
        .expect("event");
    match event {
        TransportEvent::Incoming(SipMessage::Request(req), _, _) => {
            let via = req.header.top_via().unwrap();
            assert_eq!(via.received.as_deref(), Some("198.51.100.7"));
            assert_eq!(via.rport, Some(Rport::Port(51000)));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_lookup_reuses_connection() -> Result<()> {
    let cancel_token = CancellationToken::new();
    let layer = TransportLayer::new(cancel_token.clone());
    let (server_sender, _server_receiver) = unbounded_channel();
    let bound = layer.listen_tcp("127.0.0.1:0".parse()?, server_sender).await?;

    let client_layer = TransportLayer::new(cancel_token.clone());
    let (sender, _receiver) = unbounded_channel();
    let target = SipAddr::tcp(bound);
    let first = client_layer.lookup(&target, sender.clone()).await?;
    let second = client_layer.lookup(&target, sender).await?;
    assert_eq!(first.get_addr(), second.get_addr());

    cancel_token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_resolve_uri_with_numeric_host() -> Result<()> {
    let uri = Uri::parse("sip:bob@192.0.2.55:5070;transport=tcp")?;
    let addr = SipAddr::resolve(&uri).await?;
    assert_eq!(addr.addr, "192.0.2.55:5070".parse()?);
    Ok(())
}

#[test]
fn test_request_helper_is_options() {
    assert_eq!(test_request("sip:x@example.test", "z9hG4bKx").method, Method::Options);
}
