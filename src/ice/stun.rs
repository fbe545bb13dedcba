use crate::{Error, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::{IpAddr, SocketAddr};

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie (RFC 5389 section 6).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;
pub const BINDING_ERROR_RESPONSE: u16 = 0x0111;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const STUN_HEADER_SIZE: usize = 20;
const FINGERPRINT_XOR: u32 = 0x5354554e;

/// Error code for an ICE role conflict (RFC 8445 section 7.3.1.1).
pub const ERROR_ROLE_CONFLICT: u16 = 487;

// CRC-32 (IEEE, reflected) for the FINGERPRINT attribute; small enough
// to keep inline instead of pulling in a dependency.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    crc ^ 0xFFFFFFFF
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    BindingRequest,
    BindingResponse,
    BindingErrorResponse,
}

impl MessageKind {
    fn wire_type(&self) -> u16 {
        match self {
            MessageKind::BindingRequest => BINDING_REQUEST,
            MessageKind::BindingResponse => BINDING_RESPONSE,
            MessageKind::BindingErrorResponse => BINDING_ERROR_RESPONSE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    Username(String),
    Priority(u32),
    IceControlling(u64),
    IceControlled(u64),
    UseCandidate,
    XorMappedAddress(SocketAddr),
    ErrorCode { code: u16, reason: String },
    MessageIntegrity([u8; 20]),
    Fingerprint(u32),
    Unknown(u16, Vec<u8>),
}

/// A classic STUN message (RFC 5389) restricted to the Binding method
/// and the attributes ICE uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub kind: MessageKind,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    pub fn binding_request(transaction_id: [u8; 12]) -> Self {
        StunMessage {
            kind: MessageKind::BindingRequest,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn binding_response(transaction_id: [u8; 12]) -> Self {
        StunMessage {
            kind: MessageKind::BindingResponse,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn error_response(transaction_id: [u8; 12], code: u16, reason: &str) -> Self {
        StunMessage {
            kind: MessageKind::BindingErrorResponse,
            transaction_id,
            attributes: vec![StunAttribute::ErrorCode {
                code,
                reason: reason.to_string(),
            }],
        }
    }

    pub fn with_attribute(mut self, attribute: StunAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Username(username) => Some(username.as_str()),
            _ => None,
        })
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn priority(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Priority(priority) => Some(*priority),
            _ => None,
        })
    }

    pub fn use_candidate(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a, StunAttribute::UseCandidate))
    }

    pub fn controlling_tiebreaker(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::IceControlling(tiebreaker) => Some(*tiebreaker),
            _ => None,
        })
    }

    pub fn controlled_tiebreaker(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::IceControlled(tiebreaker) => Some(*tiebreaker),
            _ => None,
        })
    }

    pub fn error_code(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::ErrorCode { code, .. } => Some(*code),
            _ => None,
        })
    }

    /// Encodes the message. With a key, MESSAGE-INTEGRITY (HMAC-SHA1
    /// over the message with the length adjusted to cover the attribute)
    /// and FINGERPRINT are appended, per RFC 5389 sections 15.4/15.5.
    pub fn encode(&self, key: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&self.kind.wire_type().to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);

        for attribute in &self.attributes {
            match attribute {
                StunAttribute::Username(username) => {
                    append_attribute(&mut buf, ATTR_USERNAME, username.as_bytes())
                }
                StunAttribute::Priority(priority) => {
                    append_attribute(&mut buf, ATTR_PRIORITY, &priority.to_be_bytes())
                }
                StunAttribute::IceControlling(tiebreaker) => {
                    append_attribute(&mut buf, ATTR_ICE_CONTROLLING, &tiebreaker.to_be_bytes())
                }
                StunAttribute::IceControlled(tiebreaker) => {
                    append_attribute(&mut buf, ATTR_ICE_CONTROLLED, &tiebreaker.to_be_bytes())
                }
                StunAttribute::UseCandidate => append_attribute(&mut buf, ATTR_USE_CANDIDATE, &[]),
                StunAttribute::XorMappedAddress(addr) => {
                    let encoded = encode_xor_address(*addr, &self.transaction_id);
                    append_attribute(&mut buf, ATTR_XOR_MAPPED_ADDRESS, &encoded)
                }
                StunAttribute::ErrorCode { code, reason } => {
                    let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
                    value.extend_from_slice(reason.as_bytes());
                    append_attribute(&mut buf, ATTR_ERROR_CODE, &value)
                }
                // integrity and fingerprint are computed below
                StunAttribute::MessageIntegrity(_) | StunAttribute::Fingerprint(_) => {}
                StunAttribute::Unknown(attribute_type, value) => {
                    append_attribute(&mut buf, *attribute_type, value)
                }
            }
        }

        if let Some(key) = key {
            let integrity_length = (buf.len() - STUN_HEADER_SIZE + 24) as u16;
            buf[2..4].copy_from_slice(&integrity_length.to_be_bytes());
            let mut mac = HmacSha1::new_from_slice(key).expect("any key length works");
            mac.update(&buf);
            let digest = mac.finalize().into_bytes();
            append_attribute(&mut buf, ATTR_MESSAGE_INTEGRITY, &digest[..20]);

            let fingerprint_length = (buf.len() - STUN_HEADER_SIZE + 8) as u16;
            buf[2..4].copy_from_slice(&fingerprint_length.to_be_bytes());
            let fingerprint = crc32(&buf) ^ FINGERPRINT_XOR;
            append_attribute(&mut buf, ATTR_FINGERPRINT, &fingerprint.to_be_bytes());
        } else {
            let length = (buf.len() - STUN_HEADER_SIZE) as u16;
            buf[2..4].copy_from_slice(&length.to_be_bytes());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<StunMessage> {
        if !is_stun_message(data) {
            return Err(Error::StunError("not a STUN message".to_string()));
        }
        let message_type = u16::from_be_bytes([data[0], data[1]]);
        let kind = match message_type {
            BINDING_REQUEST => MessageKind::BindingRequest,
            BINDING_RESPONSE => MessageKind::BindingResponse,
            BINDING_ERROR_RESPONSE => MessageKind::BindingErrorResponse,
            other => {
                return Err(Error::StunError(format!(
                    "unsupported STUN message type: {:#06x}",
                    other
                )))
            }
        };
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < STUN_HEADER_SIZE + length {
            return Err(Error::StunError("truncated STUN message".to_string()));
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let mut attributes = Vec::new();
        let mut offset = STUN_HEADER_SIZE;
        let end = STUN_HEADER_SIZE + length;
        while offset + 4 <= end {
            let attribute_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let value_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let value_start = offset + 4;
            if value_start + value_length > end {
                return Err(Error::StunError("truncated STUN attribute".to_string()));
            }
            let value = &data[value_start..value_start + value_length];
            attributes.push(decode_attribute(attribute_type, value, &transaction_id)?);
            // attributes are 32-bit aligned
            offset = value_start + (value_length + 3) / 4 * 4;
        }

        Ok(StunMessage {
            kind,
            transaction_id,
            attributes,
        })
    }

    /// Checks MESSAGE-INTEGRITY over the raw datagram with the given
    /// short-term key. Messages without the attribute fail.
    pub fn verify_integrity(data: &[u8], key: &[u8]) -> bool {
        // find the MESSAGE-INTEGRITY attribute offset
        let length = match data.len() {
            n if n >= STUN_HEADER_SIZE => {
                u16::from_be_bytes([data[2], data[3]]) as usize
            }
            _ => return false,
        };
        let end = (STUN_HEADER_SIZE + length).min(data.len());
        let mut offset = STUN_HEADER_SIZE;
        while offset + 4 <= end {
            let attribute_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let value_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            if attribute_type == ATTR_MESSAGE_INTEGRITY {
                if offset + 4 + 20 > data.len() {
                    return false;
                }
                // the covered region ends right before this attribute,
                // with the length field counting it
                let mut covered = data[..offset].to_vec();
                let adjusted = (offset - STUN_HEADER_SIZE + 24) as u16;
                covered[2..4].copy_from_slice(&adjusted.to_be_bytes());
                let mut mac = HmacSha1::new_from_slice(key).expect("any key length works");
                mac.update(&covered);
                let digest = mac.finalize().into_bytes();
                return digest[..20] == data[offset + 4..offset + 24];
            }
            offset += 4 + (value_length + 3) / 4 * 4;
        }
        false
    }
}

fn append_attribute(buf: &mut Vec<u8>, attribute_type: u16, value: &[u8]) {
    buf.extend_from_slice(&attribute_type.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn decode_attribute(
    attribute_type: u16,
    value: &[u8],
    transaction_id: &[u8; 12],
) -> Result<StunAttribute> {
    let attribute = match attribute_type {
        ATTR_USERNAME => StunAttribute::Username(
            String::from_utf8(value.to_vec())
                .map_err(|_| Error::StunError("USERNAME is not UTF-8".to_string()))?,
        ),
        ATTR_PRIORITY => StunAttribute::Priority(u32::from_be_bytes(
            value
                .try_into()
                .map_err(|_| Error::StunError("bad PRIORITY length".to_string()))?,
        )),
        ATTR_ICE_CONTROLLING => StunAttribute::IceControlling(u64::from_be_bytes(
            value
                .try_into()
                .map_err(|_| Error::StunError("bad ICE-CONTROLLING length".to_string()))?,
        )),
        ATTR_ICE_CONTROLLED => StunAttribute::IceControlled(u64::from_be_bytes(
            value
                .try_into()
                .map_err(|_| Error::StunError("bad ICE-CONTROLLED length".to_string()))?,
        )),
        ATTR_USE_CANDIDATE => StunAttribute::UseCandidate,
        ATTR_XOR_MAPPED_ADDRESS => {
            StunAttribute::XorMappedAddress(decode_xor_address(value, transaction_id)?)
        }
        ATTR_ERROR_CODE => {
            if value.len() < 4 {
                return Err(Error::StunError("bad ERROR-CODE length".to_string()));
            }
            let code = (value[2] as u16) * 100 + value[3] as u16;
            StunAttribute::ErrorCode {
                code,
                reason: String::from_utf8_lossy(&value[4..]).into_owned(),
            }
        }
        ATTR_MESSAGE_INTEGRITY => {
            let digest: [u8; 20] = value
                .try_into()
                .map_err(|_| Error::StunError("bad MESSAGE-INTEGRITY length".to_string()))?;
            StunAttribute::MessageIntegrity(digest)
        }
        ATTR_FINGERPRINT => StunAttribute::Fingerprint(u32::from_be_bytes(
            value
                .try_into()
                .map_err(|_| Error::StunError("bad FINGERPRINT length".to_string()))?,
        )),
        other => StunAttribute::Unknown(other, value.to_vec()),
    };
    Ok(attribute)
}

/// XOR-MAPPED-ADDRESS encoding (RFC 5389 section 15.2): the port is
/// XORed with the upper cookie half, IPv4 with the cookie, IPv6 with
/// cookie plus transaction id.
fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    let xor_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.extend_from_slice(&[0, 0x01]);
            out.extend_from_slice(&xor_port.to_be_bytes());
            let raw = u32::from_be_bytes(ip.octets()) ^ MAGIC_COOKIE;
            out.extend_from_slice(&raw.to_be_bytes());
        }
        IpAddr::V6(ip) => {
            out.extend_from_slice(&[0, 0x02]);
            out.extend_from_slice(&xor_port.to_be_bytes());
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id);
            let octets = ip.octets();
            for i in 0..16 {
                out.push(octets[i] ^ mask[i]);
            }
        }
    }
    out
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr> {
    if value.len() < 8 {
        return Err(Error::StunError("bad XOR-MAPPED-ADDRESS length".to_string()));
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    match value[1] {
        0x01 => {
            let raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
            Ok(SocketAddr::new(IpAddr::from(raw.to_be_bytes()), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(Error::StunError("bad IPv6 XOR-MAPPED-ADDRESS".to_string()));
            }
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ mask[i];
            }
            Ok(SocketAddr::new(IpAddr::from(octets), port))
        }
        family => Err(Error::StunError(format!("unknown address family: {}", family))),
    }
}

pub fn is_stun_message(data: &[u8]) -> bool {
    if data.len() < STUN_HEADER_SIZE {
        return false;
    }
    if data[0] & 0xC0 != 0 {
        return false;
    }
    u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

pub fn make_transaction_id() -> [u8; 12] {
    let mut transaction_id = [0u8; 12];
    rand::Rng::fill(&mut rand::thread_rng(), &mut transaction_id);
    transaction_id
}

/// The short-term credential username for a check toward the peer:
/// `remote-ufrag:local-ufrag`.
pub fn check_username(remote_ufrag: &str, local_ufrag: &str) -> String {
    format!("{}:{}", remote_ufrag, local_ufrag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_binding_request_roundtrip() {
        let transaction_id = make_transaction_id();
        let message = StunMessage::binding_request(transaction_id)
            .with_attribute(StunAttribute::Username("peerUf:ourUf".to_string()))
            .with_attribute(StunAttribute::Priority(2130706431))
            .with_attribute(StunAttribute::IceControlling(0x1122334455667788))
            .with_attribute(StunAttribute::UseCandidate);

        let encoded = message.encode(Some(b"the-ice-password"));
        assert!(is_stun_message(&encoded));

        let decoded = StunMessage::decode(&encoded).expect("decodes");
        assert_eq!(decoded.kind, MessageKind::BindingRequest);
        assert_eq!(decoded.transaction_id, transaction_id);
        assert_eq!(decoded.username(), Some("peerUf:ourUf"));
        assert_eq!(decoded.priority(), Some(2130706431));
        assert!(decoded.use_candidate());
        assert_eq!(decoded.controlling_tiebreaker(), Some(0x1122334455667788));
    }

    #[test]
    fn test_message_integrity_verification() {
        let message = StunMessage::binding_request(make_transaction_id())
            .with_attribute(StunAttribute::Username("a:b".to_string()));
        let encoded = message.encode(Some(b"correct-password"));
        assert!(StunMessage::verify_integrity(&encoded, b"correct-password"));
        assert!(!StunMessage::verify_integrity(&encoded, b"wrong-password"));

        let unsigned = message.encode(None);
        assert!(!StunMessage::verify_integrity(&unsigned, b"correct-password"));
    }

    #[test]
    fn test_xor_mapped_address_roundtrip() {
        let transaction_id = make_transaction_id();
        for addr in ["198.51.100.7:51000", "[2001:db8::1]:40000"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let message = StunMessage::binding_response(transaction_id)
                .with_attribute(StunAttribute::XorMappedAddress(addr));
            let decoded = StunMessage::decode(&message.encode(None)).expect("decodes");
            assert_eq!(decoded.xor_mapped_address(), Some(addr));
        }
    }

    #[test]
    fn test_error_response_carries_code() {
        let message =
            StunMessage::error_response(make_transaction_id(), ERROR_ROLE_CONFLICT, "Role Conflict");
        let decoded = StunMessage::decode(&message.encode(None)).expect("decodes");
        assert_eq!(decoded.kind, MessageKind::BindingErrorResponse);
        assert_eq!(decoded.error_code(), Some(487));
    }

    #[test]
    fn test_non_stun_rejected() {
        assert!(!is_stun_message(b"OPTIONS sip:a SIP/2.0\r\n"));
        assert!(StunMessage::decode(&[0u8; 8]).is_err());
    }
}
