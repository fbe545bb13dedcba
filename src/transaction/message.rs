use crate::message::{Method, Request, Response, StatusCode};

/// Builds a response inheriting Via, From, To, Call-ID and CSeq from the
/// request, per RFC 3261 section 8.2.6.
pub fn make_response(request: &Request, status: StatusCode, body: Option<Vec<u8>>) -> Response {
    let mut response = Response::new(status);
    response.header = request.header.inherit_for_response();
    if let Some(body) = body {
        response.body = body;
    }
    response
}

/// Transaction level ACK for a non-2xx final response (RFC 3261 section
/// 17.1.1.3): same request URI and branch as the INVITE, the To taken
/// from the response so its tag is echoed.
pub fn make_ack_for_error(original: &Request, response: &Response) -> Request {
    let mut ack = Request::new(Method::Ack, original.uri.clone());
    if let Some(via) = original.header.top_via() {
        ack.header.vias.push(via.clone());
    }
    ack.header.from = original.header.from.clone();
    ack.header.to = response.header.to.clone();
    ack.header.call_id = original.header.call_id.clone();
    ack.header.cseq = original
        .header
        .cseq
        .map(|cseq| crate::message::header::CSeq::new(cseq.seq, Method::Ack));
    ack.header.max_forwards = Some(70);
    ack.header.route = original.header.route.clone();
    ack
}

/// CANCEL for a pending INVITE (RFC 3261 section 9.1): identical Call-ID,
/// From tag, CSeq number and top Via branch; the method and CSeq method
/// become CANCEL.
pub fn make_cancel(original: &Request) -> Request {
    let mut cancel = Request::new(Method::Cancel, original.uri.clone());
    if let Some(via) = original.header.top_via() {
        cancel.header.vias.push(via.clone());
    }
    cancel.header.from = original.header.from.clone();
    cancel.header.to = original.header.to.clone();
    cancel.header.call_id = original.header.call_id.clone();
    cancel.header.cseq = original
        .header
        .cseq
        .map(|cseq| crate::message::header::CSeq::new(cseq.seq, Method::Cancel));
    cancel.header.max_forwards = Some(70);
    cancel.header.route = original.header.route.clone();
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMessage;

    fn invite() -> Request {
        let text = "INVITE sip:bob@example.test SIP/2.0\r\n\
            Via: SIP/2.0/TCP 192.0.2.10:5060;branch=z9hG4bK74bf9\r\n\
            Max-Forwards: 70\r\n\
            From: <sip:alice@example.test>;tag=9fxced76sl\r\n\
            To: <sip:bob@example.test>\r\n\
            Call-ID: callid1@192.0.2.10\r\n\
            CSeq: 7 INVITE\r\n\
            Contact: <sip:alice@192.0.2.10:5060>\r\n\
            Content-Length: 0\r\n\r\n";
        match SipMessage::try_from(text.as_bytes()).unwrap() {
            SipMessage::Request(req) => req,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_make_response_inherits_request_fields() {
        let request = invite();
        let response = make_response(&request, StatusCode::RINGING, None);
        assert_eq!(response.header.call_id, request.header.call_id);
        assert_eq!(response.header.cseq, request.header.cseq);
        assert_eq!(response.header.vias, request.header.vias);
        assert_eq!(response.header.from_tag(), Some("9fxced76sl"));
    }

    #[test]
    fn test_ack_for_error_reuses_branch_and_cseq_number() {
        let request = invite();
        let mut response = make_response(&request, StatusCode::REQUEST_TERMINATED, None);
        if let Some(to) = response.header.to.as_mut() {
            to.tag = Some("383874".to_string());
        }
        let ack = make_ack_for_error(&request, &response);
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.header.cseq.unwrap().seq, 7);
        assert_eq!(ack.header.cseq.unwrap().method, Method::Ack);
        assert_eq!(
            ack.header.top_via().unwrap().branch,
            request.header.top_via().unwrap().branch
        );
        assert_eq!(ack.header.to_tag(), Some("383874"));
    }

    #[test]
    fn test_cancel_shares_identifiers() {
        let request = invite();
        let cancel = make_cancel(&request);
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.header.cseq.unwrap().seq, 7);
        assert_eq!(cancel.header.cseq.unwrap().method, Method::Cancel);
        assert_eq!(cancel.header.call_id, request.header.call_id);
        assert_eq!(
            cancel.header.top_via().unwrap().branch,
            request.header.top_via().unwrap().branch
        );
        assert_eq!(cancel.header.to_tag(), None);
    }
}
