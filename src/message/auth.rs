use super::header::{DigestChallenge, DigestCredentials};

fn md5_hex(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

/// Computes the digest response value per RFC 2617 section 3.2.2 with the
/// MD5 algorithm. `qop=auth` requires a client nonce and a nonce count.
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<(&str, &str, u32)>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop {
        Some((qop, cnonce, nc)) => md5_hex(&format!(
            "{}:{}:{:08x}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// Answers a digest challenge with complete credentials. When the server
/// offered `qop=auth` the response carries cnonce and an incrementing
/// nonce count; otherwise the plain RFC 2069 form is used.
pub fn answer_challenge(
    username: &str,
    password: &str,
    challenge: &DigestChallenge,
    method: &str,
    uri: &str,
    cnonce: &str,
    nonce_count: u32,
) -> DigestCredentials {
    let qop = challenge.offers_qop_auth();
    let response = digest_response(
        username,
        password,
        &challenge.realm,
        &challenge.nonce,
        method,
        uri,
        qop.then_some(("auth", cnonce, nonce_count)),
    );
    DigestCredentials {
        username: username.to_string(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: uri.to_string(),
        response,
        algorithm: Some(challenge.algorithm.clone().unwrap_or_else(|| "MD5".to_string())),
        cnonce: qop.then(|| cnonce.to_string()),
        opaque: challenge.opaque.clone(),
        qop: qop.then(|| "auth".to_string()),
        nonce_count: qop.then_some(nonce_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 2617 section 3.5 worked example
    #[test]
    fn test_rfc2617_example_vector() {
        let response = digest_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some(("auth", "0a4f113b", 1)),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_answer_without_qop_has_no_cnonce() {
        let challenge = DigestChallenge {
            realm: "example.test".to_string(),
            nonce: "84a4cc6f".to_string(),
            ..DigestChallenge::default()
        };
        let credentials = answer_challenge(
            "alice",
            "secret",
            &challenge,
            "REGISTER",
            "sip:example.test",
            "ignored",
            1,
        );
        assert!(credentials.cnonce.is_none());
        assert!(credentials.qop.is_none());
        assert!(credentials.nonce_count.is_none());
        assert_eq!(credentials.realm, "example.test");
    }

    #[test]
    fn test_answer_with_qop_auth() {
        let challenge = DigestChallenge {
            realm: "example.test".to_string(),
            nonce: "84a4cc6f".to_string(),
            qop: vec!["auth".to_string()],
            ..DigestChallenge::default()
        };
        let credentials = answer_challenge(
            "alice",
            "secret",
            &challenge,
            "REGISTER",
            "sip:example.test",
            "abcd1234",
            2,
        );
        assert_eq!(credentials.qop.as_deref(), Some("auth"));
        assert_eq!(credentials.nonce_count, Some(2));
        assert_eq!(credentials.cnonce.as_deref(), Some("abcd1234"));
    }
}
