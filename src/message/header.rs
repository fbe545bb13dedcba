use super::field::Parameter;
use super::uri::{HostPort, Uri};
use super::{ContentKind, Method};

/// Transport token carried in Via and in URI `transport` parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
    Other(String),
}

impl TransportKind {
    pub fn from_token(token: &str) -> TransportKind {
        if token.eq_ignore_ascii_case("tcp") {
            TransportKind::Tcp
        } else if token.eq_ignore_ascii_case("udp") {
            TransportKind::Udp
        } else {
            TransportKind::Other(token.to_uppercase())
        }
    }

    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("TCP"),
            TransportKind::Udp => f.write_str("UDP"),
            TransportKind::Other(token) => f.write_str(token),
        }
    }
}

/// Optional display name plus URI. The composer emits the angle bracket
/// form whenever a display name or field parameters follow the URI.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
}

impl NameAddr {
    pub fn from_uri(uri: Uri) -> Self {
        NameAddr {
            display_name: None,
            uri,
        }
    }
}

/// Common shape of To and From: a name-addr plus field parameters, of
/// which `tag` is the one this stack reads and writes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FromTo {
    pub address: NameAddr,
    pub tag: Option<String>,
    pub params: Vec<Parameter>,
}

impl FromTo {
    pub fn new(address: NameAddr) -> Self {
        FromTo {
            address,
            tag: None,
            params: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContactInfo {
    pub address: NameAddr,
    pub params: Vec<Parameter>,
}

impl ContactInfo {
    pub fn from_uri(uri: Uri) -> Self {
        ContactInfo {
            address: NameAddr::from_uri(uri),
            params: Vec::new(),
        }
    }

    pub fn expires(&self) -> Option<u32> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case("expires"))
            .and_then(|p| p.value.as_ref())
            .and_then(|v| v.parse().ok())
    }
}

/// The `rport` Via parameter is a flag on requests and carries the source
/// port on responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rport {
    Flag,
    Port(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Via {
    pub version: String,
    pub transport: TransportKind,
    pub sent_by: HostPort,
    pub branch: Option<String>,
    pub received: Option<String>,
    pub rport: Option<Rport>,
    pub params: Vec<Parameter>,
}

impl Via {
    pub fn new(transport: TransportKind, sent_by: HostPort, branch: impl Into<String>) -> Self {
        Via {
            version: "2.0".to_string(),
            transport,
            sent_by,
            branch: Some(branch.into()),
            received: None,
            rport: Some(Rport::Flag),
            params: Vec::new(),
        }
    }

    /// The address the peer saw us at, if it differs from what we sent.
    pub fn reflexive_addr(&self) -> Option<(String, u16)> {
        let received = self.received.clone()?;
        let port = match self.rport {
            Some(Rport::Port(port)) => port,
            _ => return None,
        };
        Some((received, port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl std::fmt::Display for CSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// Route and Record-Route entry: a name-addr whose URI usually carries
/// the `lr` parameter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteEntry {
    pub address: NameAddr,
    pub params: Vec<Parameter>,
}

/// Digest challenge from WWW-Authenticate / Proxy-Authenticate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Vec<String>,
    pub stale: bool,
}

impl DigestChallenge {
    pub fn offers_qop_auth(&self) -> bool {
        self.qop.iter().any(|q| q.eq_ignore_ascii_case("auth"))
    }
}

/// Digest credentials for Authorization / Proxy-Authorization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub nonce_count: Option<u32>,
}

/// Authentication-Info directives from a 2xx after digest auth.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AuthenticationInfo {
    pub nextnonce: Option<String>,
    pub qop: Option<String>,
    pub rspauth: Option<String>,
    pub cnonce: Option<String>,
    pub nonce_count: Option<u32>,
}

/// Typed SIP message header: one slot per supported field (RFC 3261
/// section 20). Slots that may repeat hold vectors; everything else is
/// optional and left empty when the field is absent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageHeader {
    pub accept: Vec<String>,
    pub accept_encoding: Vec<String>,
    pub accept_language: Vec<String>,
    pub alert_info: Vec<String>,
    pub allow: Vec<Method>,
    pub authentication_info: Option<AuthenticationInfo>,
    pub authorization: Option<DigestCredentials>,
    pub call_id: Option<String>,
    pub call_info: Vec<String>,
    pub contact: Vec<ContactInfo>,
    pub content_disposition: Option<String>,
    pub content_encoding: Vec<String>,
    pub content_language: Vec<String>,
    pub content_length: Option<u32>,
    pub content_type: ContentKind,
    pub cseq: Option<CSeq>,
    pub date: Option<String>,
    pub error_info: Vec<String>,
    pub expires: Option<u32>,
    pub from: Option<FromTo>,
    pub in_reply_to: Vec<String>,
    pub max_forwards: Option<u8>,
    pub mime_version: Option<String>,
    pub min_expires: Option<u32>,
    pub organization: Option<String>,
    pub priority: Option<String>,
    pub proxy_authenticate: Option<DigestChallenge>,
    pub proxy_authorization: Option<DigestCredentials>,
    pub proxy_require: Vec<String>,
    pub record_route: Vec<RouteEntry>,
    pub reply_to: Option<NameAddr>,
    pub require: Vec<String>,
    pub retry_after: Option<u32>,
    pub route: Vec<RouteEntry>,
    pub server: Option<String>,
    pub subject: Option<String>,
    pub supported: Vec<String>,
    pub timestamp: Option<String>,
    pub to: Option<FromTo>,
    pub unsupported: Vec<String>,
    pub user_agent: Option<String>,
    pub vias: Vec<Via>,
    pub warning: Vec<String>,
    pub www_authenticate: Option<DigestChallenge>,
}

impl MessageHeader {
    pub fn top_via(&self) -> Option<&Via> {
        self.vias.first()
    }

    pub fn top_via_mut(&mut self) -> Option<&mut Via> {
        self.vias.first_mut()
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.as_ref().and_then(|f| f.tag.as_deref())
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.as_ref().and_then(|t| t.tag.as_deref())
    }

    /// Copies the fields a response inherits verbatim from its request
    /// (RFC 3261 section 8.2.6.2).
    pub fn inherit_for_response(&self) -> MessageHeader {
        MessageHeader {
            vias: self.vias.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            call_id: self.call_id.clone(),
            cseq: self.cseq,
            record_route: self.record_route.clone(),
            ..MessageHeader::default()
        }
    }
}
