use super::{CallEvent, CallEventReceiver, UserAgent};
use crate::config::Config;
use crate::message::Uri;
use crate::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn make_agent(
    min_port: u16,
    max_port: u16,
) -> Result<(Arc<UserAgent>, CallEventReceiver, SocketAddr, CancellationToken)> {
    let mut settings = HashMap::new();
    settings.insert("ice.allow_loopback".to_string(), "true".to_string());
    settings.insert("ice.min_port".to_string(), min_port.to_string());
    settings.insert("ice.max_port".to_string(), max_port.to_string());
    let config = Config::from_settings(&settings)?;

    let cancel_token = CancellationToken::new();
    let agent = UserAgent::new(config, cancel_token.child_token());
    let bound = agent.listen("127.0.0.1:0".parse()?).await?;

    let endpoint = agent.endpoint();
    tokio::spawn(async move {
        endpoint.serve().await;
    });
    let serve_agent = agent.clone();
    tokio::spawn(async move {
        serve_agent.serve().await.ok();
    });

    let events = agent.events().expect("events channel");
    Ok((agent, events, bound, cancel_token))
}

/// Waits for an event matching the predicate, skipping others.
async fn wait_for<F, T>(events: &mut CallEventReceiver, mut predicate: F) -> T
where
    F: FnMut(CallEvent) -> Option<T>,
{
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Some(event) => {
                    if let Some(value) = predicate(event) {
                        return value;
                    }
                }
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for call event")
}

/// Full call on loopback: INVITE with offer, answer in the 200 OK, ACK,
/// ICE connectivity checks and nomination, media rewrite, then BYE.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_basic_call_with_ice() -> Result<()> {
    let (callee, mut callee_events, callee_addr, callee_cancel) =
        make_agent(23000, 23100).await?;
    let (caller, mut caller_events, _caller_addr, caller_cancel) =
        make_agent(24000, 24100).await?;

    let target = Uri::parse(&format!("sip:callee@{}", callee_addr))?;
    let caller_session = caller.invite(target).await?;

    let callee_session = wait_for(&mut callee_events, |event| match event {
        CallEvent::IncomingCall { session_id, .. } => Some(session_id),
        _ => None,
    })
    .await;

    callee.ring(callee_session)?;
    wait_for(&mut caller_events, |event| match event {
        CallEvent::Ringing(id) if id == caller_session => Some(()),
        _ => None,
    })
    .await;

    callee.accept(callee_session)?;
    wait_for(&mut caller_events, |event| match event {
        CallEvent::Answered(id) if id == caller_session => Some(()),
        _ => None,
    })
    .await;

    // both sides nominate and rewrite their media endpoints
    let (caller_local, caller_remote) = wait_for(&mut caller_events, |event| match event {
        CallEvent::MediaReady { local, remote, .. } => Some((local, remote)),
        _ => None,
    })
    .await;
    let (callee_local, _callee_remote) = wait_for(&mut callee_events, |event| match event {
        CallEvent::MediaReady { local, remote, .. } => Some((local, remote)),
        _ => None,
    })
    .await;

    assert_eq!(caller_local.media.len(), 2);
    assert_eq!(callee_local.media.len(), 2);
    for media in caller_local.media.iter().chain(callee_local.media.iter()) {
        assert!(media.connection.is_some(), "nominated media has an address");
    }
    // what the caller sees as the remote endpoints is what the callee
    // nominated locally
    for (remote_media, callee_media) in
        caller_remote.media.iter().zip(callee_local.media.iter())
    {
        assert_eq!(remote_media.port, callee_media.port);
    }

    caller.bye(caller_session).await?;
    wait_for(&mut callee_events, |event| match event {
        CallEvent::Terminated(id) if id == callee_session => Some(()),
        _ => None,
    })
    .await;

    caller_cancel.cancel();
    callee_cancel.cancel();
    Ok(())
}

/// CANCEL before the final response: the callee answers 200 to the
/// CANCEL and 487 to the INVITE, both sides tear the call down.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_before_answer() -> Result<()> {
    let (callee, mut callee_events, callee_addr, callee_cancel) =
        make_agent(25000, 25100).await?;
    let (caller, mut caller_events, _caller_addr, caller_cancel) =
        make_agent(26000, 26100).await?;

    let target = Uri::parse(&format!("sip:callee@{}", callee_addr))?;
    let caller_session = caller.invite(target).await?;

    let callee_session = wait_for(&mut callee_events, |event| match event {
        CallEvent::IncomingCall { session_id, .. } => Some(session_id),
        _ => None,
    })
    .await;
    callee.ring(callee_session)?;
    wait_for(&mut caller_events, |event| match event {
        CallEvent::Ringing(id) if id == caller_session => Some(()),
        _ => None,
    })
    .await;

    caller.cancel(caller_session).await?;

    // the caller's INVITE ends with 487 Request Terminated
    let reason = wait_for(&mut caller_events, |event| match event {
        CallEvent::Failed { session_id, reason } if session_id == caller_session => Some(reason),
        _ => None,
    })
    .await;
    assert!(reason.contains("487"), "unexpected failure reason: {}", reason);

    // the callee side sees the call terminated by the CANCEL
    wait_for(&mut callee_events, |event| match event {
        CallEvent::Terminated(id) if id == callee_session => Some(()),
        _ => None,
    })
    .await;

    caller_cancel.cancel();
    callee_cancel.cancel();
    Ok(())
}

/// An INVITE whose offer lacks our mandatory codecs is answered 488,
/// checked over a raw TCP connection speaking the wire protocol.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unacceptable_offer_answered_488() -> Result<()> {
    use crate::message::framer::MessageFramer;
    use crate::message::{SipMessage, StatusCode};
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Decoder;

    let (_callee, _callee_events, callee_addr, callee_cancel) =
        make_agent(27000, 27100).await?;

    let sdp = "v=0\r\n\
        o=mallory 1 1 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        c=IN IP4 127.0.0.1\r\n\
        t=0 0\r\n\
        a=ice-ufrag:mUf\r\n\
        a=ice-pwd:malloryPassword0000000\r\n\
        m=audio 40000 RTP/AVP 97\r\n\
        a=rtpmap:97 opus/48000/2\r\n\
        a=candidate:1 1 UDP 2130706431 127.0.0.1 40000 typ host\r\n\
        m=video 40002 RTP/AVP 98\r\n\
        a=rtpmap:98 VP8/90000\r\n\
        a=candidate:2 1 UDP 2130706431 127.0.0.1 40002 typ host\r\n";
    let invite = format!(
        "INVITE sip:callee@{addr};transport=tcp SIP/2.0\r\n\
         Via: SIP/2.0/TCP 127.0.0.1:9;branch=z9hG4bKvp8only\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:mallory@example.test>;tag=m1\r\n\
         To: <sip:callee@example.test>\r\n\
         Call-ID: vp8only@127.0.0.1\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:mallory@127.0.0.1:9;transport=tcp>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {len}\r\n\r\n{sdp}",
        addr = callee_addr,
        len = sdp.len(),
        sdp = sdp
    );

    let mut stream = tokio::net::TcpStream::connect(callee_addr).await?;
    stream.write_all(invite.as_bytes()).await?;

    let mut framer = MessageFramer::new();
    let mut buffer = BytesMut::new();
    let mut read_buf = [0u8; 4096];
    let final_status = timeout(Duration::from_secs(5), async {
        loop {
            let n = stream.read(&mut read_buf).await.expect("read");
            assert!(n > 0, "connection closed before a final response");
            buffer.extend_from_slice(&read_buf[..n]);
            while let Some(raw) = framer.decode(&mut buffer).expect("frames") {
                let header = String::from_utf8_lossy(&raw.header).into_owned();
                let msg = crate::message::parse::parse_message(&header, raw.body).expect("parses");
                if let SipMessage::Response(resp) = msg {
                    if resp.status != StatusCode::TRYING {
                        return resp.status;
                    }
                }
            }
        }
    })
    .await
    .expect("timed out waiting for the final response");

    assert_eq!(final_status, StatusCode::NOT_ACCEPTABLE_HERE);
    callee_cancel.cancel();
    Ok(())
}
