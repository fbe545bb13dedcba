use crate::ice::candidate::Candidate;
use crate::{Error, Result};

pub mod compose;
pub mod negotiation;
pub mod parse;

pub use negotiation::{NegotiationState, SdpNegotiation};

/// `o=` originator line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Origin {
    pub username: String,
    pub session_id: u64,
    pub session_version: u64,
    pub nettype: String,
    pub addrtype: String,
    pub address: String,
}

/// `c=` connection line, global or per media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub nettype: String,
    pub addrtype: String,
    pub address: String,
}

impl Connection {
    pub fn ip4(address: impl Into<String>) -> Self {
        Connection {
            nettype: "IN".to_string(),
            addrtype: "IP4".to_string(),
            address: address.into(),
        }
    }
}

/// `t=` time description with its optional `r=` repeat line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimeDescription {
    pub start: u64,
    pub stop: u64,
    pub repeat: Option<Repeat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Repeat {
    pub interval: String,
    pub duration: String,
    pub offsets: Vec<String>,
}

/// `z=` timezone adjustment pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimezoneAdjustment {
    pub adjustment: String,
    pub offset: String,
}

/// `a=rtpmap:` codec descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

impl std::fmt::Display for RtpMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.payload, self.encoding, self.clock_rate)?;
        if let Some(channels) = self.channels {
            write!(f, "/{}", channels)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Other(String),
}

impl MediaKind {
    pub fn from_token(token: &str) -> MediaKind {
        match token {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            other => MediaKind::Other(other.to_string()),
        }
    }

    pub fn as_token(&self) -> &str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Other(token) => token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_token(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    pub fn from_token(token: &str) -> Option<MediaDirection> {
        match token {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }
}

/// `a=` attribute other than rtpmap and candidate, which get their own
/// typed slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpAttribute {
    Direction(MediaDirection),
    IceUfrag(String),
    IcePwd(String),
    Value { name: String, value: String },
    Flag(String),
}

/// `m=` media description with everything nested under it.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescription {
    pub kind: MediaKind,
    pub port: u16,
    pub protocol: String,
    pub payloads: Vec<u8>,
    pub title: Option<String>,
    pub connection: Option<Connection>,
    pub bandwidth: Vec<String>,
    pub key: Option<String>,
    pub rtp_maps: Vec<RtpMap>,
    pub attributes: Vec<SdpAttribute>,
    pub candidates: Vec<Candidate>,
}

impl MediaDescription {
    pub fn new(kind: MediaKind, port: u16) -> Self {
        MediaDescription {
            kind,
            port,
            protocol: "RTP/AVP".to_string(),
            payloads: Vec::new(),
            title: None,
            connection: None,
            bandwidth: Vec::new(),
            key: None,
            rtp_maps: Vec::new(),
            attributes: Vec::new(),
            candidates: Vec::new(),
        }
    }

    pub fn rtp_map(&self, encoding: &str) -> Option<&RtpMap> {
        self.rtp_maps
            .iter()
            .find(|map| map.encoding.eq_ignore_ascii_case(encoding))
    }
}

/// A complete SDP session description (RFC 4566). ICE candidates are
/// collected here regardless of which section their lines appeared in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SdpSession {
    pub version: u8,
    pub origin: Origin,
    pub session_name: String,
    pub information: Option<String>,
    pub uri: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub connection: Option<Connection>,
    pub bandwidth: Vec<String>,
    pub times: Vec<TimeDescription>,
    pub timezones: Vec<TimezoneAdjustment>,
    pub key: Option<String>,
    pub attributes: Vec<SdpAttribute>,
    pub media: Vec<MediaDescription>,
    pub candidates: Vec<Candidate>,
}

impl SdpSession {
    /// Every ICE candidate in the description, regardless of whether its
    /// line appeared at session level or inside a media section.
    pub fn all_candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates
            .iter()
            .chain(self.media.iter().flat_map(|m| m.candidates.iter()))
    }

    pub fn ice_ufrag(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            SdpAttribute::IceUfrag(value) => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn ice_pwd(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            SdpAttribute::IcePwd(value) => Some(value.as_str()),
            _ => None,
        })
    }

    /// Checks the structural validity rules of section 5 of RFC 4566:
    /// version 0, a non-empty originator and session name, at least one
    /// time description and one media, and a connection address either
    /// globally or in every media section.
    pub fn check_validity(&self) -> Result<()> {
        if self.version != 0 {
            return Err(Error::SdpError(format!(
                "unsupported SDP version: {}",
                self.version
            )));
        }
        if self.origin.username.is_empty() || self.origin.address.is_empty() {
            return Err(Error::SdpError("originator is empty".to_string()));
        }
        if self.session_name.is_empty() {
            return Err(Error::SdpError("session name is empty".to_string()));
        }
        if self.times.is_empty() {
            return Err(Error::SdpError("no time description".to_string()));
        }
        if self.media.is_empty() {
            return Err(Error::SdpError("no media sections".to_string()));
        }
        if self.connection.is_none() {
            for (i, media) in self.media.iter().enumerate() {
                if media.connection.is_none() {
                    return Err(Error::SdpError(format!(
                        "media {} has no connection address and no global one exists",
                        i
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for SdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&compose::compose_sdp(self))
    }
}
