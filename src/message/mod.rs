use crate::Result;

pub mod auth;
pub mod compose;
pub mod field;
pub mod framer;
pub mod header;
pub mod parse;
pub mod uri;

pub use field::{Field, Parameter, ValueSet};
pub use framer::{MessageFramer, RawMessage};
pub use header::MessageHeader;
pub use uri::{HostPort, Scheme, Uri};

pub const SIP_VERSION: &str = "SIP/2.0";
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// SIP request methods supported by this client (RFC 3261 plus OPTIONS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "REGISTER" => Some(Method::Register),
            "INVITE" => Some(Method::Invite),
            "ACK" => Some(Method::Ack),
            "BYE" => Some(Method::Bye),
            "CANCEL" => Some(Method::Cancel),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response status code classes per RFC 3261 section 7.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Provisional,
    Successful,
    Redirection,
    ClientError,
    ServerError,
    GlobalFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const TRYING: StatusCode = StatusCode(100);
    pub const RINGING: StatusCode = StatusCode(180);
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const PROXY_AUTHENTICATION_REQUIRED: StatusCode = StatusCode(407);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const UNSUPPORTED_MEDIA_TYPE: StatusCode = StatusCode(415);
    pub const TEMPORARILY_UNAVAILABLE: StatusCode = StatusCode(480);
    pub const CALL_OR_TRANSACTION_DOES_NOT_EXIST: StatusCode = StatusCode(481);
    pub const BUSY_HERE: StatusCode = StatusCode(486);
    pub const REQUEST_TERMINATED: StatusCode = StatusCode(487);
    pub const NOT_ACCEPTABLE_HERE: StatusCode = StatusCode(488);
    pub const SERVER_INTERNAL_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
    pub const DECLINE: StatusCode = StatusCode(603);

    pub fn kind(&self) -> StatusKind {
        match self.0 {
            100..=199 => StatusKind::Provisional,
            200..=299 => StatusKind::Successful,
            300..=399 => StatusKind::Redirection,
            400..=499 => StatusKind::ClientError,
            500..=599 => StatusKind::ServerError,
            _ => StatusKind::GlobalFailure,
        }
    }

    pub fn is_valid(&self) -> bool {
        (100..=699).contains(&self.0)
    }

    pub fn default_reason(&self) -> &'static str {
        match self.0 {
            100 => "Trying",
            180 => "Ringing",
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            415 => "Unsupported Media Type",
            480 => "Temporarily Unavailable",
            481 => "Call/Transaction Does Not Exist",
            486 => "Busy Here",
            487 => "Request Terminated",
            488 => "Not Acceptable Here",
            500 => "Server Internal Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            603 => "Decline",
            _ => "Unknown",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Body type marker derived from Content-Type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContentKind {
    #[default]
    None,
    Sdp,
    /// Unknown media type, body kept as opaque bytes.
    Opaque(String),
}

impl ContentKind {
    pub fn from_media_type(media_type: &str) -> ContentKind {
        if media_type.eq_ignore_ascii_case("application/sdp") {
            ContentKind::Sdp
        } else {
            ContentKind::Opaque(media_type.to_string())
        }
    }

    pub fn as_media_type(&self) -> Option<&str> {
        match self {
            ContentKind::None => None,
            ContentKind::Sdp => Some("application/sdp"),
            ContentKind::Opaque(media_type) => Some(media_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            header: MessageHeader::default(),
            body: Vec::new(),
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&compose::compose_request(self))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            reason: status.default_reason().to_string(),
            header: MessageHeader::default(),
            body: Vec::new(),
        }
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&compose::compose_response(self))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn header(&self) -> &MessageHeader {
        match self {
            SipMessage::Request(req) => &req.header,
            SipMessage::Response(resp) => &resp.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        match self {
            SipMessage::Request(req) => &mut req.header,
            SipMessage::Response(resp) => &mut resp.header,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl std::fmt::Display for SipMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipMessage::Request(req) => req.fmt(f),
            SipMessage::Response(resp) => resp.fmt(f),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        SipMessage::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(resp: Response) -> Self {
        SipMessage::Response(resp)
    }
}

impl TryFrom<&[u8]> for SipMessage {
    type Error = crate::Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| crate::Error::MessageError("message is not valid UTF-8".to_string()))?;
        let (header, body) = match text.find("\r\n\r\n") {
            Some(pos) => (&text[..pos + 4], &bytes[pos + 4..]),
            None => (text, &[][..]),
        };
        parse::parse_message(header, body.to_vec())
    }
}
