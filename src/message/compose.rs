use super::field::{Field, Parameter, ValueSet};
use super::header::{
    AuthenticationInfo, ContactInfo, DigestChallenge, DigestCredentials, FromTo, MessageHeader,
    NameAddr, RouteEntry, Rport, Via,
};
use super::{Request, Response, SIP_VERSION};

/// Composes the wire form of a request: request line, header fields in
/// canonical order, blank line, body.
pub fn compose_request(request: &Request) -> String {
    let mut message = format!("{} {} {}\r\n", request.method, request.uri, SIP_VERSION);
    message.push_str(&fields_to_string(&header_fields(
        &request.header,
        request.body.len(),
    )));
    message.push_str("\r\n");
    message.push_str(&String::from_utf8_lossy(&request.body));
    message
}

pub fn compose_response(response: &Response) -> String {
    let mut message = format!("{} {} {}\r\n", SIP_VERSION, response.status, response.reason);
    message.push_str(&fields_to_string(&header_fields(
        &response.header,
        response.body.len(),
    )));
    message.push_str("\r\n");
    message.push_str(&String::from_utf8_lossy(&response.body));
    message
}

fn fields_to_string(fields: &[Field]) -> String {
    let mut out = String::new();
    for field in fields {
        if field.value_sets.is_empty() {
            continue;
        }
        out.push_str(&field.name);
        out.push_str(": ");
        for (i, set) in field.value_sets.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            for (j, word) in set.words.iter().enumerate() {
                if j > 0 {
                    out.push(' ');
                }
                out.push_str(word);
            }
            for parameter in &set.parameters {
                out.push(';');
                out.push_str(&parameter.to_string());
            }
        }
        out.push_str("\r\n");
    }
    out
}

/// Emits every populated header slot as a field, Content-Length always
/// last. Slot order follows the conventional RFC 3261 layout the original
/// wire traces use.
fn header_fields(header: &MessageHeader, body_len: usize) -> Vec<Field> {
    let mut fields = Vec::new();

    for via in &header.vias {
        fields.push(compose_via(via));
    }
    if let Some(max_forwards) = header.max_forwards {
        fields.push(single_word_field("Max-Forwards", max_forwards.to_string()));
    }
    if !header.route.is_empty() {
        fields.push(compose_route_entries("Route", &header.route));
    }
    if !header.record_route.is_empty() {
        fields.push(compose_route_entries("Record-Route", &header.record_route));
    }
    if let Some(from) = &header.from {
        fields.push(compose_from_to("From", from));
    }
    if let Some(to) = &header.to {
        fields.push(compose_from_to("To", to));
    }
    if let Some(call_id) = &header.call_id {
        fields.push(single_word_field("Call-ID", call_id.clone()));
    }
    if let Some(cseq) = &header.cseq {
        fields.push(Field {
            name: "CSeq".to_string(),
            value_sets: vec![ValueSet {
                words: vec![cseq.seq.to_string(), cseq.method.to_string()],
                parameters: Vec::new(),
            }],
        });
    }
    for contact in &header.contact {
        fields.push(compose_contact(contact));
    }
    if let Some(expires) = header.expires {
        fields.push(single_word_field("Expires", expires.to_string()));
    }
    if let Some(min_expires) = header.min_expires {
        fields.push(single_word_field("Min-Expires", min_expires.to_string()));
    }
    if let Some(retry_after) = header.retry_after {
        fields.push(single_word_field("Retry-After", retry_after.to_string()));
    }
    if !header.allow.is_empty() {
        fields.push(token_list_field(
            "Allow",
            header.allow.iter().map(|m| m.to_string()).collect(),
        ));
    }
    if !header.supported.is_empty() {
        fields.push(token_list_field("Supported", header.supported.clone()));
    }
    if !header.require.is_empty() {
        fields.push(token_list_field("Require", header.require.clone()));
    }
    if !header.proxy_require.is_empty() {
        fields.push(token_list_field("Proxy-Require", header.proxy_require.clone()));
    }
    if !header.unsupported.is_empty() {
        fields.push(token_list_field("Unsupported", header.unsupported.clone()));
    }
    if !header.accept.is_empty() {
        fields.push(token_list_field("Accept", header.accept.clone()));
    }
    if !header.accept_encoding.is_empty() {
        fields.push(token_list_field("Accept-Encoding", header.accept_encoding.clone()));
    }
    if !header.accept_language.is_empty() {
        fields.push(token_list_field("Accept-Language", header.accept_language.clone()));
    }
    if !header.alert_info.is_empty() {
        fields.push(token_list_field("Alert-Info", header.alert_info.clone()));
    }
    if !header.call_info.is_empty() {
        fields.push(token_list_field("Call-Info", header.call_info.clone()));
    }
    if !header.error_info.is_empty() {
        fields.push(token_list_field("Error-Info", header.error_info.clone()));
    }
    for warning in &header.warning {
        fields.push(single_word_field("Warning", warning.clone()));
    }
    if let Some(reply_to) = &header.reply_to {
        fields.push(Field {
            name: "Reply-To".to_string(),
            value_sets: vec![ValueSet {
                words: name_addr_words(reply_to, true),
                parameters: Vec::new(),
            }],
        });
    }
    if !header.in_reply_to.is_empty() {
        fields.push(token_list_field("In-Reply-To", header.in_reply_to.clone()));
    }
    if let Some(date) = &header.date {
        fields.push(single_word_field("Date", date.clone()));
    }
    if let Some(timestamp) = &header.timestamp {
        fields.push(single_word_field("Timestamp", timestamp.clone()));
    }
    if let Some(organization) = &header.organization {
        fields.push(single_word_field("Organization", organization.clone()));
    }
    if let Some(priority) = &header.priority {
        fields.push(single_word_field("Priority", priority.clone()));
    }
    if let Some(subject) = &header.subject {
        fields.push(single_word_field("Subject", subject.clone()));
    }
    if let Some(server) = &header.server {
        fields.push(single_word_field("Server", server.clone()));
    }
    if let Some(user_agent) = &header.user_agent {
        fields.push(single_word_field("User-Agent", user_agent.clone()));
    }
    if let Some(mime_version) = &header.mime_version {
        fields.push(single_word_field("MIME-Version", mime_version.clone()));
    }
    if let Some(credentials) = &header.authorization {
        fields.push(compose_digest_credentials("Authorization", credentials));
    }
    if let Some(credentials) = &header.proxy_authorization {
        fields.push(compose_digest_credentials("Proxy-Authorization", credentials));
    }
    if let Some(challenge) = &header.www_authenticate {
        fields.push(compose_digest_challenge("WWW-Authenticate", challenge));
    }
    if let Some(challenge) = &header.proxy_authenticate {
        fields.push(compose_digest_challenge("Proxy-Authenticate", challenge));
    }
    if let Some(info) = &header.authentication_info {
        fields.push(compose_authentication_info(info));
    }
    if let Some(disposition) = &header.content_disposition {
        fields.push(single_word_field("Content-Disposition", disposition.clone()));
    }
    if !header.content_encoding.is_empty() {
        fields.push(token_list_field("Content-Encoding", header.content_encoding.clone()));
    }
    if !header.content_language.is_empty() {
        fields.push(token_list_field("Content-Language", header.content_language.clone()));
    }
    if let Some(media_type) = header.content_type.as_media_type() {
        fields.push(single_word_field("Content-Type", media_type.to_string()));
    }
    let content_length = header.content_length.unwrap_or(body_len as u32);
    fields.push(single_word_field("Content-Length", content_length.to_string()));

    fields
}

fn single_word_field(name: &str, word: String) -> Field {
    Field {
        name: name.to_string(),
        value_sets: vec![ValueSet {
            words: vec![word],
            parameters: Vec::new(),
        }],
    }
}

fn token_list_field(name: &str, tokens: Vec<String>) -> Field {
    Field {
        name: name.to_string(),
        value_sets: tokens
            .into_iter()
            .map(|token| ValueSet {
                words: vec![token],
                parameters: Vec::new(),
            })
            .collect(),
    }
}

/// Display names are emitted quoted; the URI is angle bracketed whenever a
/// display name or field parameters follow it.
fn name_addr_words(name_addr: &NameAddr, bracketed: bool) -> Vec<String> {
    let mut words = Vec::new();
    if let Some(display) = &name_addr.display_name {
        words.push(format!("\"{}\"", display));
    }
    if bracketed || name_addr.display_name.is_some() {
        words.push(format!("<{}>", name_addr.uri));
    } else {
        words.push(name_addr.uri.to_string());
    }
    words
}

fn compose_from_to(name: &str, from_to: &FromTo) -> Field {
    let mut parameters = Vec::new();
    if let Some(tag) = &from_to.tag {
        parameters.push(Parameter::with_value("tag", tag.clone()));
    }
    parameters.extend(from_to.params.iter().cloned());
    Field {
        name: name.to_string(),
        value_sets: vec![ValueSet {
            words: name_addr_words(&from_to.address, true),
            parameters,
        }],
    }
}

fn compose_contact(contact: &ContactInfo) -> Field {
    Field {
        name: "Contact".to_string(),
        value_sets: vec![ValueSet {
            words: name_addr_words(&contact.address, true),
            parameters: contact.params.clone(),
        }],
    }
}

fn compose_route_entries(name: &str, entries: &[RouteEntry]) -> Field {
    Field {
        name: name.to_string(),
        value_sets: entries
            .iter()
            .map(|entry| ValueSet {
                words: name_addr_words(&entry.address, true),
                parameters: entry.params.clone(),
            })
            .collect(),
    }
}

fn compose_via(via: &Via) -> Field {
    let mut parameters = Vec::new();
    if let Some(branch) = &via.branch {
        parameters.push(Parameter::with_value("branch", branch.clone()));
    }
    if let Some(received) = &via.received {
        parameters.push(Parameter::with_value("received", received.clone()));
    }
    match via.rport {
        Some(Rport::Flag) => parameters.push(Parameter::flag("rport")),
        Some(Rport::Port(port)) => {
            parameters.push(Parameter::with_value("rport", port.to_string()))
        }
        None => {}
    }
    parameters.extend(via.params.iter().cloned());
    Field {
        name: "Via".to_string(),
        value_sets: vec![ValueSet {
            words: vec![
                format!("SIP/{}/{}", via.version, via.transport),
                via.sent_by.to_string(),
            ],
            parameters,
        }],
    }
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value)
}

/// Digest string directives are double quoted per RFC 3261 section 25.1;
/// token directives (algorithm, qop in credentials, nc, stale) are not.
fn compose_digest_credentials(name: &str, credentials: &DigestCredentials) -> Field {
    let mut directives = vec![
        format!("username={}", quoted(&credentials.username)),
        format!("realm={}", quoted(&credentials.realm)),
        format!("nonce={}", quoted(&credentials.nonce)),
        format!("uri={}", quoted(&credentials.uri)),
        format!("response={}", quoted(&credentials.response)),
    ];
    if let Some(algorithm) = &credentials.algorithm {
        directives.push(format!("algorithm={}", algorithm));
    }
    if let Some(cnonce) = &credentials.cnonce {
        directives.push(format!("cnonce={}", quoted(cnonce)));
    }
    if let Some(opaque) = &credentials.opaque {
        directives.push(format!("opaque={}", quoted(opaque)));
    }
    if let Some(qop) = &credentials.qop {
        directives.push(format!("qop={}", qop));
    }
    if let Some(nc) = credentials.nonce_count {
        directives.push(format!("nc={:08x}", nc));
    }
    digest_field(name, directives)
}

fn compose_digest_challenge(name: &str, challenge: &DigestChallenge) -> Field {
    let mut directives = vec![
        format!("realm={}", quoted(&challenge.realm)),
        format!("nonce={}", quoted(&challenge.nonce)),
    ];
    if let Some(opaque) = &challenge.opaque {
        directives.push(format!("opaque={}", quoted(opaque)));
    }
    if challenge.stale {
        directives.push("stale=TRUE".to_string());
    }
    if let Some(algorithm) = &challenge.algorithm {
        directives.push(format!("algorithm={}", algorithm));
    }
    if !challenge.qop.is_empty() {
        directives.push(format!("qop={}", quoted(&challenge.qop.join(","))));
    }
    digest_field(name, directives)
}

fn compose_authentication_info(info: &AuthenticationInfo) -> Field {
    let mut directives = Vec::new();
    if let Some(nextnonce) = &info.nextnonce {
        directives.push(format!("nextnonce={}", quoted(nextnonce)));
    }
    if let Some(qop) = &info.qop {
        directives.push(format!("qop={}", qop));
    }
    if let Some(rspauth) = &info.rspauth {
        directives.push(format!("rspauth={}", quoted(rspauth)));
    }
    if let Some(cnonce) = &info.cnonce {
        directives.push(format!("cnonce={}", quoted(cnonce)));
    }
    if let Some(nc) = info.nonce_count {
        directives.push(format!("nc={:08x}", nc));
    }
    Field {
        name: "Authentication-Info".to_string(),
        value_sets: directives
            .into_iter()
            .map(|directive| ValueSet {
                words: vec![directive],
                parameters: Vec::new(),
            })
            .collect(),
    }
}

/// The scheme token shares the first value set with the first directive;
/// the remaining directives become one value set each so the composed
/// field reads `Digest a="1",b="2"`.
fn digest_field(name: &str, directives: Vec<String>) -> Field {
    let mut value_sets = Vec::new();
    for (i, directive) in directives.into_iter().enumerate() {
        if i == 0 {
            value_sets.push(ValueSet {
                words: vec!["Digest".to_string(), directive],
                parameters: Vec::new(),
            });
        } else {
            value_sets.push(ValueSet {
                words: vec![directive],
                parameters: Vec::new(),
            });
        }
    }
    Field {
        name: name.to_string(),
        value_sets,
    }
}
