use peercall::message::{Method, SipMessage};
use peercall::sdp::parse::parse_sdp;

/// Parsing and recomposing a canonical SIP message reproduces its bytes.
#[test]
fn sip_message_roundtrip() {
    let sdp = "v=0\r\n\
        o=alice 2890844526 2890844526 IN IP4 192.0.2.10\r\n\
        s=-\r\n\
        c=IN IP4 192.0.2.10\r\n\
        t=0 0\r\n\
        a=ice-ufrag:8hhY\r\n\
        a=ice-pwd:asd88fgpdd777uzjYhagZg\r\n\
        m=audio 20000 RTP/AVP 97 0\r\n\
        a=rtpmap:97 opus/48000/2\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=candidate:1 1 UDP 2130706431 192.0.2.10 20000 typ host\r\n\
        a=candidate:1 2 UDP 2130706430 192.0.2.10 20001 typ host\r\n\
        m=video 20002 RTP/AVP 96\r\n\
        a=rtpmap:96 H265/90000\r\n\
        a=candidate:2 1 UDP 2130706431 192.0.2.10 20002 typ host\r\n\
        a=candidate:2 2 UDP 2130706430 192.0.2.10 20003 typ host\r\n";
    let message = format!(
        "INVITE sip:bob@example.test;transport=tcp SIP/2.0\r\n\
         Via: SIP/2.0/TCP 192.0.2.10:5060;branch=z9hG4bK74bf9;rport\r\n\
         Max-Forwards: 70\r\n\
         From: \"Alice\" <sip:alice@example.test>;tag=9fxced76sl\r\n\
         To: <sip:bob@example.test>\r\n\
         Call-ID: 3848276298220188511@192.0.2.10\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:alice@192.0.2.10:5060;transport=tcp>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{}",
        sdp.len(),
        sdp
    );

    let parsed = SipMessage::try_from(message.as_bytes()).expect("parses");
    assert_eq!(parsed.to_string(), message);

    let request = match &parsed {
        SipMessage::Request(request) => request,
        _ => panic!("expected a request"),
    };
    assert_eq!(request.method, Method::Invite);

    // the body parses as SDP and recomposes identically too
    let body = String::from_utf8(request.body.clone()).expect("utf8");
    let session = parse_sdp(&body).expect("valid SDP");
    assert_eq!(session.to_string(), body);
    assert_eq!(session.all_candidates().count(), 4);
}

/// Unknown but optional fields do not break parsing; mandatory fields do.
#[test]
fn unknown_field_is_skipped() {
    let message = "OPTIONS sip:bob@example.test SIP/2.0\r\n\
        Via: SIP/2.0/TCP 192.0.2.10:5060;branch=z9hG4bKabc\r\n\
        Max-Forwards: 70\r\n\
        From: <sip:alice@example.test>;tag=1\r\n\
        To: <sip:bob@example.test>\r\n\
        Call-ID: x@y\r\n\
        CSeq: 1 OPTIONS\r\n\
        X-Custom-Header: anything at all\r\n\
        Content-Length: 0\r\n\r\n";
    assert!(SipMessage::try_from(message.as_bytes()).is_ok());

    let broken = message.replace("CSeq: 1 OPTIONS\r\n", "");
    assert!(SipMessage::try_from(broken.as_bytes()).is_err());
}
