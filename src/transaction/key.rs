use crate::message::{Method, Request, Response};
use crate::{Error, Result};

/// Transaction matching key (RFC 3261 section 17.2.3). Messages carrying
/// the `z9hG4bK` cookie match on branch; anything else falls back to the
/// RFC 2543 tuple. An ACK matches the INVITE transaction it acknowledges,
/// so its key is built with the INVITE method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionKey {
    Rfc3261 {
        branch: String,
        method: Method,
        cseq: u32,
        from_tag: String,
        call_id: String,
    },
    Rfc2543 {
        method: Method,
        cseq: u32,
        from_tag: String,
        call_id: String,
        via_sent_by: String,
    },
    Invalid,
}

impl TransactionKey {
    pub fn from_request(request: &Request) -> Result<TransactionKey> {
        let via = request
            .header
            .top_via()
            .ok_or_else(|| key_error("request without Via"))?;
        let cseq = request
            .header
            .cseq
            .ok_or_else(|| key_error("request without CSeq"))?;
        let from_tag = request
            .header
            .from_tag()
            .ok_or_else(|| key_error("request without From tag"))?
            .to_string();
        let call_id = request
            .header
            .call_id
            .clone()
            .ok_or_else(|| key_error("request without Call-ID"))?;

        let method = match request.method {
            Method::Ack => Method::Invite,
            method => method,
        };

        match &via.branch {
            Some(branch) if branch.starts_with(crate::message::BRANCH_MAGIC_COOKIE) => {
                Ok(TransactionKey::Rfc3261 {
                    branch: branch.clone(),
                    method,
                    cseq: cseq.seq,
                    from_tag,
                    call_id,
                })
            }
            _ => Ok(TransactionKey::Rfc2543 {
                method,
                cseq: cseq.seq,
                from_tag,
                call_id,
                via_sent_by: via.sent_by.to_string(),
            }),
        }
    }

    pub fn from_response(response: &Response) -> Result<TransactionKey> {
        let via = response
            .header
            .top_via()
            .ok_or_else(|| key_error("response without Via"))?;
        let cseq = response
            .header
            .cseq
            .ok_or_else(|| key_error("response without CSeq"))?;
        let from_tag = response
            .header
            .from_tag()
            .ok_or_else(|| key_error("response without From tag"))?
            .to_string();
        let call_id = response
            .header
            .call_id
            .clone()
            .ok_or_else(|| key_error("response without Call-ID"))?;

        match &via.branch {
            Some(branch) if branch.starts_with(crate::message::BRANCH_MAGIC_COOKIE) => {
                Ok(TransactionKey::Rfc3261 {
                    branch: branch.clone(),
                    method: cseq.method,
                    cseq: cseq.seq,
                    from_tag,
                    call_id,
                })
            }
            _ => Ok(TransactionKey::Rfc2543 {
                method: cseq.method,
                cseq: cseq.seq,
                from_tag,
                call_id,
                via_sent_by: via.sent_by.to_string(),
            }),
        }
    }

    /// The key a CANCEL shares with its INVITE: same branch, method
    /// swapped back to INVITE.
    pub fn invite_key(&self) -> TransactionKey {
        match self {
            TransactionKey::Rfc3261 {
                branch,
                cseq,
                from_tag,
                call_id,
                ..
            } => TransactionKey::Rfc3261 {
                branch: branch.clone(),
                method: Method::Invite,
                cseq: *cseq,
                from_tag: from_tag.clone(),
                call_id: call_id.clone(),
            },
            TransactionKey::Rfc2543 {
                cseq,
                from_tag,
                call_id,
                via_sent_by,
                ..
            } => TransactionKey::Rfc2543 {
                method: Method::Invite,
                cseq: *cseq,
                from_tag: from_tag.clone(),
                call_id: call_id.clone(),
                via_sent_by: via_sent_by.clone(),
            },
            TransactionKey::Invalid => TransactionKey::Invalid,
        }
    }
}

fn key_error(reason: &str) -> Error {
    Error::TransactionError(reason.to_string(), TransactionKey::Invalid)
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::Rfc3261 {
                branch,
                method,
                cseq,
                from_tag,
                call_id,
            } => write!(f, "{} {}/{} {}({})", call_id, method, cseq, from_tag, branch),
            TransactionKey::Rfc2543 {
                method,
                cseq,
                from_tag,
                call_id,
                via_sent_by,
            } => write!(
                f,
                "{} {}/{} {}[{}]",
                call_id, method, cseq, from_tag, via_sent_by
            ),
            TransactionKey::Invalid => f.write_str("INVALID"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMessage;

    fn request(text: &str) -> Request {
        match SipMessage::try_from(text.as_bytes()).expect("parses") {
            SipMessage::Request(req) => req,
            _ => panic!("expected request"),
        }
    }

    const INVITE: &str = "INVITE sip:bob@example.test SIP/2.0\r\n\
        Via: SIP/2.0/TCP 192.0.2.10:5060;branch=z9hG4bK74bf9\r\n\
        Max-Forwards: 70\r\n\
        From: <sip:alice@example.test>;tag=9fxced76sl\r\n\
        To: <sip:bob@example.test>\r\n\
        Call-ID: callid1@192.0.2.10\r\n\
        CSeq: 1 INVITE\r\n\
        Contact: <sip:alice@192.0.2.10:5060>\r\n\
        Content-Length: 0\r\n\r\n";

    const ACK: &str = "ACK sip:bob@example.test SIP/2.0\r\n\
        Via: SIP/2.0/TCP 192.0.2.10:5060;branch=z9hG4bK74bf9\r\n\
        Max-Forwards: 70\r\n\
        From: <sip:alice@example.test>;tag=9fxced76sl\r\n\
        To: <sip:bob@example.test>;tag=383874\r\n\
        Call-ID: callid1@192.0.2.10\r\n\
        CSeq: 1 ACK\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_ack_matches_invite_transaction() {
        let invite_key = TransactionKey::from_request(&request(INVITE)).unwrap();
        let ack_key = TransactionKey::from_request(&request(ACK)).unwrap();
        assert_eq!(invite_key, ack_key);
    }

    #[test]
    fn test_cancel_maps_to_invite_key() {
        let cancel = INVITE
            .replace("INVITE sip:bob", "CANCEL sip:bob")
            .replace("CSeq: 1 INVITE", "CSeq: 1 CANCEL")
            .replace("Contact: <sip:alice@192.0.2.10:5060>\r\n", "");
        let cancel_key = TransactionKey::from_request(&request(&cancel)).unwrap();
        let invite_key = TransactionKey::from_request(&request(INVITE)).unwrap();
        assert_ne!(cancel_key, invite_key);
        assert_eq!(cancel_key.invite_key(), invite_key);
    }

    #[test]
    fn test_missing_branch_uses_rfc2543_key() {
        let old = INVITE.replace(";branch=z9hG4bK74bf9", "");
        let key = TransactionKey::from_request(&request(&old)).unwrap();
        assert!(matches!(key, TransactionKey::Rfc2543 { .. }));
    }
}
