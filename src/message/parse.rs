use super::field::{Field, Parameter};
use super::header::{
    AuthenticationInfo, CSeq, ContactInfo, DigestChallenge, DigestCredentials, FromTo,
    MessageHeader, NameAddr, RouteEntry, Rport, TransportKind, Via,
};
use super::uri::{HostPort, Uri};
use super::{ContentKind, Method, Request, Response, SipMessage, StatusCode, SIP_VERSION};
use crate::{Error, Result};
use tracing::{debug, warn};

type FieldParser = fn(&Field, &mut MessageHeader) -> Result<()>;

/// Canonical field names with their compact aliases and parsers. Unknown
/// names are logged and skipped; names listed with a `None` parser are
/// accepted but not interpreted beyond their slot type.
const PARSERS: &[(&str, Option<&str>, FieldParser)] = &[
    ("Accept", None, parse_accept),
    ("Accept-Encoding", None, parse_accept_encoding),
    ("Accept-Language", None, parse_accept_language),
    ("Alert-Info", None, parse_alert_info),
    ("Allow", None, parse_allow),
    ("Authentication-Info", None, parse_authentication_info),
    ("Authorization", None, parse_authorization),
    ("Call-ID", Some("i"), parse_call_id),
    ("Call-Info", None, parse_call_info),
    ("Contact", Some("m"), parse_contact),
    ("Content-Disposition", None, parse_content_disposition),
    ("Content-Encoding", Some("e"), parse_content_encoding),
    ("Content-Language", None, parse_content_language),
    ("Content-Length", Some("l"), parse_content_length),
    ("Content-Type", Some("c"), parse_content_type),
    ("CSeq", None, parse_cseq),
    ("Date", None, parse_date),
    ("Error-Info", None, parse_error_info),
    ("Expires", None, parse_expires),
    ("From", Some("f"), parse_from),
    ("In-Reply-To", None, parse_in_reply_to),
    ("Max-Forwards", None, parse_max_forwards),
    ("MIME-Version", None, parse_mime_version),
    ("Min-Expires", None, parse_min_expires),
    ("Organization", None, parse_organization),
    ("Priority", None, parse_priority),
    ("Proxy-Authenticate", None, parse_proxy_authenticate),
    ("Proxy-Authorization", None, parse_proxy_authorization),
    ("Proxy-Require", None, parse_proxy_require),
    ("Record-Route", None, parse_record_route),
    ("Reply-To", None, parse_reply_to),
    ("Require", None, parse_require),
    ("Retry-After", None, parse_retry_after),
    ("Route", None, parse_route),
    ("Server", None, parse_server),
    ("Subject", Some("s"), parse_subject),
    ("Supported", Some("k"), parse_supported),
    ("Timestamp", None, parse_timestamp),
    ("To", Some("t"), parse_to),
    ("Unsupported", None, parse_unsupported),
    ("User-Agent", None, parse_user_agent),
    ("Via", Some("v"), parse_via),
    ("Warning", None, parse_warning),
    ("WWW-Authenticate", None, parse_www_authenticate),
];

fn lookup_parser(name: &str) -> Option<FieldParser> {
    PARSERS
        .iter()
        .find(|(canonical, compact, _)| {
            name.eq_ignore_ascii_case(canonical)
                || compact.map(|c| name.eq_ignore_ascii_case(c)).unwrap_or(false)
        })
        .map(|(_, _, parser)| *parser)
}

/// Parses a complete header block plus body into a typed message.
pub fn parse_message(header: &str, body: Vec<u8>) -> Result<SipMessage> {
    let (first_line, fields) = super::field::header_to_fields(header)?;

    let mut message_header = MessageHeader::default();
    for field in &fields {
        match lookup_parser(&field.name) {
            Some(parser) => parser(field, &mut message_header)?,
            None => debug!("field not implemented, skipping: {}", field.name),
        }
    }

    if let Some(rest) = first_line.strip_prefix(SIP_VERSION) {
        let rest = rest.trim_start();
        let (code, reason) = rest
            .split_once(' ')
            .ok_or_else(|| Error::MessageError(format!("bad status line: {}", first_line)))?;
        let status = StatusCode(code.parse()?);
        if !status.is_valid() {
            return Err(Error::MessageError(format!("bad status code: {}", code)));
        }
        response_sanity_check(&message_header)?;
        Ok(SipMessage::Response(Response {
            status,
            reason: reason.to_string(),
            header: message_header,
            body,
        }))
    } else {
        let mut parts = first_line.split_whitespace();
        let method_token = parts
            .next()
            .ok_or_else(|| Error::MessageError("empty request line".to_string()))?;
        let uri_text = parts
            .next()
            .ok_or_else(|| Error::MessageError(format!("request line missing URI: {}", first_line)))?;
        let version = parts
            .next()
            .ok_or_else(|| Error::MessageError(format!("request line missing version: {}", first_line)))?;
        if version != SIP_VERSION || parts.next().is_some() {
            return Err(Error::MessageError(format!("bad request line: {}", first_line)));
        }
        let method = Method::from_token(method_token)
            .ok_or_else(|| Error::MessageError(format!("unknown method: {}", method_token)))?;
        let uri = Uri::parse(uri_text)?;
        request_sanity_check(method, &message_header)?;
        Ok(SipMessage::Request(Request {
            method,
            uri,
            header: message_header,
            body,
        }))
    }
}

/// Best-effort header recovery for a malformed request: parses whatever
/// fields survive so the caller can answer 400 Bad Request, but only when
/// the top Via (and the fields a response echoes) parsed. Anything less
/// and the message is dropped silently.
pub fn parse_error_response_context(header: &str) -> Option<MessageHeader> {
    let (first_line, fields) = super::field::header_to_fields(header).ok()?;
    if first_line.starts_with(SIP_VERSION) {
        // responses are never answered
        return None;
    }
    let mut message_header = MessageHeader::default();
    for field in &fields {
        if let Some(parser) = lookup_parser(&field.name) {
            parser(field, &mut message_header).ok();
        }
    }
    if message_header.top_via().is_some()
        && message_header.from.is_some()
        && message_header.to.is_some()
        && message_header.call_id.is_some()
        && message_header.cseq.is_some()
    {
        Some(message_header)
    } else {
        None
    }
}

fn request_sanity_check(method: Method, header: &MessageHeader) -> Result<()> {
    common_sanity_check(header)?;
    if header.max_forwards.is_none() {
        return Err(Error::MessageError("request missing Max-Forwards".to_string()));
    }
    let cseq = header.cseq.as_ref().expect("checked in common sanity");
    if cseq.method != method {
        return Err(Error::MessageError(format!(
            "CSeq method {} does not match request method {}",
            cseq.method, method
        )));
    }
    if method == Method::Invite && header.contact.is_empty() {
        return Err(Error::MessageError("INVITE missing Contact".to_string()));
    }
    Ok(())
}

fn response_sanity_check(header: &MessageHeader) -> Result<()> {
    common_sanity_check(header)
}

fn common_sanity_check(header: &MessageHeader) -> Result<()> {
    if header.vias.is_empty() {
        return Err(Error::MessageError("message missing Via".to_string()));
    }
    for name in ["To", "From", "Call-ID", "CSeq"] {
        let present = match name {
            "To" => header.to.is_some(),
            "From" => header.from.is_some(),
            "Call-ID" => header.call_id.is_some(),
            _ => header.cseq.is_some(),
        };
        if !present {
            return Err(Error::MessageError(format!("message missing {}", name)));
        }
    }
    if header.cseq.map(|c| c.seq) == Some(0) {
        return Err(Error::MessageError("CSeq number must be positive".to_string()));
    }
    Ok(())
}

fn require_words(field: &Field) -> Result<()> {
    if !field.has_words() {
        return Err(Error::MessageError(format!("field {} has no value", field.name)));
    }
    Ok(())
}

fn strip_quotes(word: &str) -> &str {
    word.strip_prefix('"')
        .and_then(|w| w.strip_suffix('"'))
        .unwrap_or(word)
}

/// A name-addr is an optional display name followed by `<uri>`, or a bare
/// URI word.
fn parse_name_addr(words: &[String]) -> Result<NameAddr> {
    if let Some(position) = words.iter().position(|w| w.starts_with('<')) {
        let inner = words[position]
            .strip_prefix('<')
            .and_then(|w| w.strip_suffix('>'))
            .ok_or_else(|| Error::MessageError(format!("bad angle URI: {}", words[position])))?;
        let display = if position > 0 {
            Some(
                words[..position]
                    .iter()
                    .map(|w| strip_quotes(w))
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        } else {
            None
        };
        Ok(NameAddr {
            display_name: display,
            uri: Uri::parse(inner)?,
        })
    } else if words.len() == 1 {
        Ok(NameAddr {
            display_name: None,
            uri: Uri::parse(&words[0])?,
        })
    } else {
        Err(Error::MessageError(format!(
            "cannot parse name-addr from: {:?}",
            words
        )))
    }
}

fn parse_from_to(field: &Field) -> Result<FromTo> {
    require_words(field)?;
    let set = &field.value_sets[0];
    let address = parse_name_addr(&set.words)?;
    let mut from_to = FromTo::new(address);
    for param in &set.parameters {
        if param.name.eq_ignore_ascii_case("tag") {
            from_to.tag = param.value.clone();
        } else {
            from_to.params.push(param.clone());
        }
    }
    Ok(from_to)
}

fn parse_to(field: &Field, header: &mut MessageHeader) -> Result<()> {
    header.to = Some(parse_from_to(field)?);
    Ok(())
}

fn parse_from(field: &Field, header: &mut MessageHeader) -> Result<()> {
    header.from = Some(parse_from_to(field)?);
    Ok(())
}

fn parse_contact(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    for set in &field.value_sets {
        if set.words.first().map(|w| w.as_str()) == Some("*") {
            warn!("wildcard Contact not supported, skipping");
            continue;
        }
        header.contact.push(ContactInfo {
            address: parse_name_addr(&set.words)?,
            params: set.parameters.clone(),
        });
    }
    Ok(())
}

fn parse_via(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    for set in &field.value_sets {
        if set.words.len() < 2 {
            return Err(Error::MessageError("Via needs protocol and sent-by".to_string()));
        }
        let mut protocol = set.words[0].split('/');
        let (name, version, transport) = (protocol.next(), protocol.next(), protocol.next());
        if name != Some("SIP") || protocol.next().is_some() {
            return Err(Error::MessageError(format!("bad Via protocol: {}", set.words[0])));
        }
        let version = version
            .ok_or_else(|| Error::MessageError("Via missing version".to_string()))?
            .to_string();
        let transport = TransportKind::from_token(
            transport.ok_or_else(|| Error::MessageError("Via missing transport".to_string()))?,
        );
        let sent_by = HostPort::parse(&set.words[1])?;

        let mut via = Via {
            version,
            transport,
            sent_by,
            branch: None,
            received: None,
            rport: None,
            params: Vec::new(),
        };
        for param in &set.parameters {
            if param.name.eq_ignore_ascii_case("branch") {
                via.branch = param.value.clone();
            } else if param.name.eq_ignore_ascii_case("received") {
                via.received = param.value.clone();
            } else if param.name.eq_ignore_ascii_case("rport") {
                via.rport = match &param.value {
                    Some(port) => Some(Rport::Port(port.parse()?)),
                    None => Some(Rport::Flag),
                };
            } else {
                via.params.push(param.clone());
            }
        }
        header.vias.push(via);
    }
    Ok(())
}

fn parse_cseq(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    let words = &field.value_sets[0].words;
    if words.len() != 2 {
        return Err(Error::MessageError(format!("bad CSeq: {:?}", words)));
    }
    let seq: u32 = words[0].parse()?;
    let method = Method::from_token(&words[1])
        .ok_or_else(|| Error::MessageError(format!("unknown CSeq method: {}", words[1])))?;
    header.cseq = Some(CSeq { seq, method });
    Ok(())
}

fn parse_call_id(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    header.call_id = Some(field.value_sets[0].words[0].clone());
    Ok(())
}

fn parse_content_length(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    let value: i64 = field.value_sets[0].words[0].parse()?;
    if value < 0 {
        return Err(Error::MessageError("negative Content-Length".to_string()));
    }
    header.content_length = Some(value as u32);
    Ok(())
}

fn parse_content_type(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    let media_type = &field.value_sets[0].words[0];
    if !media_type.contains('/') {
        return Err(Error::MessageError(format!("bad media type: {}", media_type)));
    }
    header.content_type = ContentKind::from_media_type(media_type);
    Ok(())
}

fn parse_max_forwards(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    let value: u32 = field.value_sets[0].words[0].parse()?;
    if value > 255 {
        return Err(Error::MessageError(format!("Max-Forwards out of range: {}", value)));
    }
    header.max_forwards = Some(value as u8);
    Ok(())
}

fn parse_unsigned(field: &Field) -> Result<u32> {
    require_words(field)?;
    Ok(field.value_sets[0].words[0].parse()?)
}

fn parse_expires(field: &Field, header: &mut MessageHeader) -> Result<()> {
    header.expires = Some(parse_unsigned(field)?);
    Ok(())
}

fn parse_min_expires(field: &Field, header: &mut MessageHeader) -> Result<()> {
    header.min_expires = Some(parse_unsigned(field)?);
    Ok(())
}

fn parse_retry_after(field: &Field, header: &mut MessageHeader) -> Result<()> {
    header.retry_after = Some(parse_unsigned(field)?);
    Ok(())
}

fn parse_route_entries(field: &Field) -> Result<Vec<RouteEntry>> {
    require_words(field)?;
    let mut entries = Vec::new();
    for set in &field.value_sets {
        entries.push(RouteEntry {
            address: parse_name_addr(&set.words)?,
            params: set.parameters.clone(),
        });
    }
    Ok(entries)
}

fn parse_route(field: &Field, header: &mut MessageHeader) -> Result<()> {
    header.route.extend(parse_route_entries(field)?);
    Ok(())
}

fn parse_record_route(field: &Field, header: &mut MessageHeader) -> Result<()> {
    header.record_route.extend(parse_route_entries(field)?);
    Ok(())
}

fn parse_reply_to(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    header.reply_to = Some(parse_name_addr(&field.value_sets[0].words)?);
    Ok(())
}

fn parse_allow(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    for set in &field.value_sets {
        for word in &set.words {
            match Method::from_token(word) {
                Some(method) => header.allow.push(method),
                None => debug!("unknown method in Allow, skipping: {}", word),
            }
        }
    }
    Ok(())
}

/// Digest directives: `Digest name=value, name="value", ...`. The scheme
/// word leads the first value set; every following word is a directive.
fn parse_digest_directives(field: &Field) -> Result<Vec<(String, String)>> {
    require_words(field)?;
    let mut words: Vec<&String> = field.value_sets.iter().flat_map(|s| s.words.iter()).collect();
    let scheme = words.remove(0);
    if !scheme.eq_ignore_ascii_case("Digest") {
        return Err(Error::MessageError(format!("unsupported auth scheme: {}", scheme)));
    }
    let mut directives = Vec::new();
    for word in words {
        let (name, value) = word
            .split_once('=')
            .ok_or_else(|| Error::MessageError(format!("bad digest directive: {}", word)))?;
        directives.push((name.to_ascii_lowercase(), strip_quotes(value).to_string()));
    }
    Ok(directives)
}

fn parse_digest_challenge(field: &Field) -> Result<DigestChallenge> {
    let mut challenge = DigestChallenge::default();
    for (name, value) in parse_digest_directives(field)? {
        match name.as_str() {
            "realm" => challenge.realm = value,
            "nonce" => challenge.nonce = value,
            "opaque" => challenge.opaque = Some(value),
            "algorithm" => challenge.algorithm = Some(value),
            "qop" => challenge.qop = value.split(',').map(|q| q.trim().to_string()).collect(),
            "stale" => challenge.stale = value.eq_ignore_ascii_case("true"),
            _ => debug!("ignoring digest challenge directive: {}", name),
        }
    }
    if challenge.realm.is_empty() || challenge.nonce.is_empty() {
        return Err(Error::MessageError("digest challenge missing realm or nonce".to_string()));
    }
    Ok(challenge)
}

fn parse_digest_credentials(field: &Field) -> Result<DigestCredentials> {
    let mut credentials = DigestCredentials::default();
    for (name, value) in parse_digest_directives(field)? {
        match name.as_str() {
            "username" => credentials.username = value,
            "realm" => credentials.realm = value,
            "nonce" => credentials.nonce = value,
            "uri" => credentials.uri = value,
            "response" => credentials.response = value,
            "algorithm" => credentials.algorithm = Some(value),
            "cnonce" => credentials.cnonce = Some(value),
            "opaque" => credentials.opaque = Some(value),
            "qop" => credentials.qop = Some(value),
            "nc" => credentials.nonce_count = Some(u32::from_str_radix(&value, 16)?),
            _ => debug!("ignoring digest credentials directive: {}", name),
        }
    }
    Ok(credentials)
}

fn parse_www_authenticate(field: &Field, header: &mut MessageHeader) -> Result<()> {
    header.www_authenticate = Some(parse_digest_challenge(field)?);
    Ok(())
}

fn parse_proxy_authenticate(field: &Field, header: &mut MessageHeader) -> Result<()> {
    header.proxy_authenticate = Some(parse_digest_challenge(field)?);
    Ok(())
}

fn parse_authorization(field: &Field, header: &mut MessageHeader) -> Result<()> {
    header.authorization = Some(parse_digest_credentials(field)?);
    Ok(())
}

fn parse_proxy_authorization(field: &Field, header: &mut MessageHeader) -> Result<()> {
    header.proxy_authorization = Some(parse_digest_credentials(field)?);
    Ok(())
}

fn parse_authentication_info(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    let mut info = AuthenticationInfo::default();
    for word in field.value_sets.iter().flat_map(|s| s.words.iter()) {
        let (name, value) = match word.split_once('=') {
            Some((name, value)) => (name.to_ascii_lowercase(), strip_quotes(value).to_string()),
            None => continue,
        };
        match name.as_str() {
            "nextnonce" => info.nextnonce = Some(value),
            "qop" => info.qop = Some(value),
            "rspauth" => info.rspauth = Some(value),
            "cnonce" => info.cnonce = Some(value),
            "nc" => info.nonce_count = Some(u32::from_str_radix(&value, 16)?),
            _ => debug!("ignoring Authentication-Info directive: {}", name),
        }
    }
    header.authentication_info = Some(info);
    Ok(())
}

fn collect_tokens(field: &Field, slot: &mut Vec<String>) -> Result<()> {
    require_words(field)?;
    for set in &field.value_sets {
        for word in &set.words {
            slot.push(word.clone());
        }
    }
    Ok(())
}

fn parse_accept(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.accept)
}

fn parse_accept_encoding(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.accept_encoding)
}

fn parse_accept_language(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.accept_language)
}

fn parse_alert_info(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.alert_info)
}

fn parse_call_info(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.call_info)
}

fn parse_content_encoding(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.content_encoding)
}

fn parse_content_language(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.content_language)
}

fn parse_error_info(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.error_info)
}

fn parse_in_reply_to(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.in_reply_to)
}

fn parse_proxy_require(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.proxy_require)
}

fn parse_require(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.require)
}

fn parse_supported(field: &Field, header: &mut MessageHeader) -> Result<()> {
    // Supported may legitimately be empty
    if !field.has_words() {
        return Ok(());
    }
    collect_tokens(field, &mut header.supported)
}

fn parse_unsupported(field: &Field, header: &mut MessageHeader) -> Result<()> {
    collect_tokens(field, &mut header.unsupported)
}

fn parse_warning(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    for set in &field.value_sets {
        header.warning.push(set.words.join(" "));
    }
    Ok(())
}

fn joined_text(field: &Field) -> Option<String> {
    let words: Vec<&str> = field
        .value_sets
        .iter()
        .flat_map(|s| s.words.iter())
        .map(|w| w.as_str())
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

fn parse_content_disposition(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    header.content_disposition = joined_text(field);
    Ok(())
}

fn parse_date(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    header.date = joined_text(field);
    Ok(())
}

fn parse_mime_version(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    header.mime_version = joined_text(field);
    Ok(())
}

fn parse_organization(field: &Field, header: &mut MessageHeader) -> Result<()> {
    // free text, may be empty
    header.organization = joined_text(field).or_else(|| Some(String::new()));
    Ok(())
}

fn parse_priority(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    header.priority = joined_text(field);
    Ok(())
}

fn parse_server(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    header.server = joined_text(field);
    Ok(())
}

fn parse_subject(field: &Field, header: &mut MessageHeader) -> Result<()> {
    // Subject may be empty
    header.subject = joined_text(field).or_else(|| Some(String::new()));
    Ok(())
}

fn parse_timestamp(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    header.timestamp = joined_text(field);
    Ok(())
}

fn parse_user_agent(field: &Field, header: &mut MessageHeader) -> Result<()> {
    require_words(field)?;
    header.user_agent = joined_text(field);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:bob@example.test SIP/2.0\r\n\
        Via: SIP/2.0/TCP 192.0.2.10:5060;branch=z9hG4bK74bf9\r\n\
        Max-Forwards: 70\r\n\
        From: \"Alice\" <sip:alice@example.test>;tag=9fxced76sl\r\n\
        To: <sip:bob@example.test>\r\n\
        Call-ID: 3848276298220188511@192.0.2.10\r\n\
        CSeq: 1 INVITE\r\n\
        Contact: <sip:alice@192.0.2.10:5060;transport=tcp>\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_request() {
        let msg = parse_message(INVITE, Vec::new()).expect("parses");
        let req = match msg {
            SipMessage::Request(req) => req,
            _ => panic!("expected request"),
        };
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.uri.user.as_deref(), Some("bob"));
        assert_eq!(req.header.from_tag(), Some("9fxced76sl"));
        assert_eq!(req.header.to_tag(), None);
        assert_eq!(req.header.cseq, Some(CSeq::new(1, Method::Invite)));
        assert_eq!(req.header.max_forwards, Some(70));
        let via = req.header.top_via().unwrap();
        assert_eq!(via.branch.as_deref(), Some("z9hG4bK74bf9"));
        assert_eq!(via.transport, TransportKind::Tcp);
    }

    #[test]
    fn test_parse_response() {
        let text = "SIP/2.0 180 Ringing\r\n\
            Via: SIP/2.0/TCP 192.0.2.10:5060;branch=z9hG4bK74bf9;received=198.51.100.7;rport=51000\r\n\
            From: <sip:alice@example.test>;tag=9fxced76sl\r\n\
            To: <sip:bob@example.test>;tag=8321234356\r\n\
            Call-ID: 3848276298220188511@192.0.2.10\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = parse_message(text, Vec::new()).expect("parses");
        let resp = match msg {
            SipMessage::Response(resp) => resp,
            _ => panic!("expected response"),
        };
        assert_eq!(resp.status, StatusCode::RINGING);
        assert_eq!(resp.header.to_tag(), Some("8321234356"));
        let via = resp.header.top_via().unwrap();
        assert_eq!(
            via.reflexive_addr(),
            Some(("198.51.100.7".to_string(), 51000))
        );
    }

    #[test]
    fn test_unknown_method_rejected() {
        let text = INVITE.replace("INVITE sip:bob@example.test SIP/2.0", "PUBLISH sip:bob@example.test SIP/2.0");
        assert!(parse_message(&text, Vec::new()).is_err());
    }

    #[test]
    fn test_missing_mandatory_field_rejected() {
        let text = INVITE.replace("Call-ID: 3848276298220188511@192.0.2.10\r\n", "");
        assert!(parse_message(&text, Vec::new()).is_err());
    }

    #[test]
    fn test_cseq_method_mismatch_rejected() {
        let text = INVITE.replace("CSeq: 1 INVITE", "CSeq: 1 BYE");
        assert!(parse_message(&text, Vec::new()).is_err());
    }

    #[test]
    fn test_compact_forms() {
        let text = "OPTIONS sip:bob@example.test SIP/2.0\r\n\
            v: SIP/2.0/TCP 192.0.2.10:5060;branch=z9hG4bK74bf9\r\n\
            Max-Forwards: 70\r\n\
            f: <sip:alice@example.test>;tag=88sja8x\r\n\
            t: <sip:bob@example.test>\r\n\
            i: 12345@192.0.2.10\r\n\
            CSeq: 2 OPTIONS\r\n\
            l: 0\r\n\r\n";
        let msg = parse_message(text, Vec::new()).expect("parses");
        assert_eq!(msg.header().call_id.as_deref(), Some("12345@192.0.2.10"));
        assert_eq!(msg.header().content_length, Some(0));
    }

    #[test]
    fn test_digest_challenge() {
        let text = "SIP/2.0 401 Unauthorized\r\n\
            Via: SIP/2.0/TCP 192.0.2.10:5060;branch=z9hG4bK74bf9\r\n\
            From: <sip:alice@example.test>;tag=88sja8x\r\n\
            To: <sip:alice@example.test>;tag=3816\r\n\
            Call-ID: 12345@192.0.2.10\r\n\
            CSeq: 1 REGISTER\r\n\
            WWW-Authenticate: Digest realm=\"example.test\", nonce=\"ea9c8e88df84f1cec4341ae6cbe5a359\", opaque=\"\", stale=FALSE, algorithm=MD5, qop=\"auth\"\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = parse_message(text, Vec::new()).expect("parses");
        let challenge = msg.header().www_authenticate.as_ref().unwrap();
        assert_eq!(challenge.realm, "example.test");
        assert_eq!(challenge.nonce, "ea9c8e88df84f1cec4341ae6cbe5a359");
        assert!(challenge.offers_qop_auth());
        assert!(!challenge.stale);
    }
}
