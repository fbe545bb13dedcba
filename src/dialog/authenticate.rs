use crate::message::auth::answer_challenge;
use crate::message::header::CSeq;
use crate::message::{Response, StatusCode};
use crate::transaction::transaction::Transaction;
use crate::transaction::{make_branch, random_text, CNONCE_LEN};
use crate::{Error, Result};

/// Registrar/proxy account credentials.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Answers a 401/407 challenge by rebuilding the original request with
/// digest credentials, a fresh branch and the caller's new CSeq, and
/// wraps it in a new client transaction on the same connection.
pub async fn handle_client_authenticate(
    new_seq: u32,
    tx: Transaction,
    resp: Response,
    credential: &Credential,
) -> Result<Transaction> {
    let proxy = resp.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    let challenge = if proxy {
        resp.header.proxy_authenticate.as_ref()
    } else {
        resp.header.www_authenticate.as_ref()
    };
    let challenge = challenge.ok_or_else(|| {
        Error::TransactionError(
            format!("{} response without a digest challenge", resp.status),
            tx.key.clone(),
        )
    })?;

    let mut new_request = tx.original.clone();
    new_request.header.cseq = Some(CSeq::new(new_seq, new_request.method));

    let credentials = answer_challenge(
        &credential.username,
        &credential.password,
        challenge,
        new_request.method.as_str(),
        &new_request.uri.to_string(),
        &random_text(CNONCE_LEN),
        1,
    );
    if proxy {
        new_request.header.proxy_authorization = Some(credentials);
        new_request.header.authorization = None;
    } else {
        new_request.header.authorization = Some(credentials);
        new_request.header.proxy_authorization = None;
    }

    if let Some(via) = new_request.header.top_via_mut() {
        via.branch = Some(make_branch());
    }

    let key = crate::transaction::key::TransactionKey::from_request(&new_request)?;
    Ok(Transaction::new_client(
        key,
        new_request,
        tx.endpoint_inner.clone(),
        tx.connection.clone(),
    ))
}
