use crate::{Error, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

pub const COMPONENT_RTP: u8 = 1;
pub const COMPONENT_RTCP: u8 = 2;
pub const COMPONENTS_PER_MEDIA: u8 = 2;

/// Candidate types in server preference order (RFC 8445 section 5.1.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateKind {
    pub fn type_preference(&self) -> u8 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::PeerReflexive => 110,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relay => 0,
        }
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::Relay => "relay",
        }
    }

    pub fn from_token(token: &str) -> Option<CandidateKind> {
        match token {
            "host" => Some(CandidateKind::Host),
            "srflx" => Some(CandidateKind::ServerReflexive),
            "prflx" => Some(CandidateKind::PeerReflexive),
            "relay" => Some(CandidateKind::Relay),
            _ => None,
        }
    }
}

/// Candidate priority: `2^24·type-pref + 2^8·local-pref + (256 − component)`.
pub fn candidate_priority(kind: CandidateKind, local_preference: u16, component: u8) -> u32 {
    ((kind.type_preference() as u32) << 24)
        + ((local_preference as u32) << 8)
        + (256 - component as u32)
}

/// One transport address that might carry media (RFC 8445 section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u8,
    pub transport: String,
    pub priority: u32,
    pub address: IpAddr,
    pub port: u16,
    pub kind: CandidateKind,
    pub rel_address: Option<IpAddr>,
    pub rel_port: Option<u16>,
}

impl Candidate {
    pub fn host(foundation: String, component: u8, addr: SocketAddr, local_preference: u16) -> Self {
        Candidate {
            foundation,
            component,
            transport: "UDP".to_string(),
            priority: candidate_priority(CandidateKind::Host, local_preference, component),
            address: addr.ip(),
            port: addr.port(),
            kind: CandidateKind::Host,
            rel_address: None,
            rel_port: None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// The local socket this candidate is reachable through: its own
    /// address for host candidates, the related (base) address otherwise.
    pub fn base_addr(&self) -> SocketAddr {
        match (self.kind, self.rel_address, self.rel_port) {
            (CandidateKind::Host, _, _) | (_, None, _) | (_, _, None) => self.socket_addr(),
            (_, Some(address), Some(port)) => SocketAddr::new(address, port),
        }
    }

    /// Parses the token list of an SDP `candidate:` attribute value. The
    /// leading word carries the `candidate:<foundation>` prefix already
    /// stripped by the SDP parser, so `words[0]` is the foundation.
    pub fn from_words(words: &[&str]) -> Result<Candidate> {
        if words.len() < 8 || words[6] != "typ" {
            return Err(Error::SdpError(format!("bad candidate line: {:?}", words)));
        }
        let kind = CandidateKind::from_token(words[7])
            .ok_or_else(|| Error::SdpError(format!("unknown candidate type: {}", words[7])))?;
        let mut candidate = Candidate {
            foundation: words[0].to_string(),
            component: words[1].parse()?,
            transport: words[2].to_uppercase(),
            priority: words[3].parse()?,
            address: words[4]
                .parse()
                .map_err(|_| Error::SdpError(format!("bad candidate address: {}", words[4])))?,
            port: words[5].parse()?,
            kind,
            rel_address: None,
            rel_port: None,
        };
        let mut i = 8;
        while i + 1 < words.len() {
            match words[i] {
                "raddr" => {
                    candidate.rel_address = Some(words[i + 1].parse().map_err(|_| {
                        Error::SdpError(format!("bad raddr: {}", words[i + 1]))
                    })?)
                }
                "rport" => candidate.rel_port = Some(words[i + 1].parse()?),
                _ => {}
            }
            i += 2;
        }
        Ok(candidate)
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.kind.as_token()
        )?;
        if let (Some(address), Some(port)) = (self.rel_address, self.rel_port) {
            write!(f, " raddr {} rport {}", address, port)?;
        }
        Ok(())
    }
}

/// Hands out foundation strings so that candidates sharing the same type,
/// base address and gathering server end up in one foundation group.
#[derive(Debug, Default)]
pub struct FoundationRegistry {
    next: u32,
    assigned: HashMap<(CandidateKind, IpAddr, Option<SocketAddr>), String>,
}

impl FoundationRegistry {
    pub fn new() -> Self {
        FoundationRegistry {
            next: 1,
            assigned: HashMap::new(),
        }
    }

    pub fn foundation(
        &mut self,
        kind: CandidateKind,
        base_address: IpAddr,
        server: Option<SocketAddr>,
    ) -> String {
        if let Some(existing) = self.assigned.get(&(kind, base_address, server)) {
            return existing.clone();
        }
        let foundation = self.next.to_string();
        self.next += 1;
        self.assigned
            .insert((kind, base_address, server), foundation.clone());
        foundation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_formula() {
        assert_eq!(
            candidate_priority(CandidateKind::Host, 65535, COMPONENT_RTP),
            (126 << 24) + (65535 << 8) + 255
        );
        assert_eq!(
            candidate_priority(CandidateKind::Relay, 0, COMPONENT_RTCP),
            254
        );
        // RTP of the same type and preference outranks RTCP
        assert!(
            candidate_priority(CandidateKind::ServerReflexive, 100, COMPONENT_RTP)
                > candidate_priority(CandidateKind::ServerReflexive, 100, COMPONENT_RTCP)
        );
    }

    #[test]
    fn test_candidate_line_roundtrip() {
        let line = "candidate:1 1 UDP 2130706431 192.0.2.10 20000 typ host";
        let words: Vec<&str> = line.trim_start_matches("candidate:").split(' ').collect();
        let candidate = Candidate::from_words(&words).expect("parses");
        assert_eq!(candidate.to_string(), line);

        let line = "candidate:2 2 UDP 1694498814 198.51.100.7 51001 typ srflx raddr 192.0.2.10 rport 20001";
        let words: Vec<&str> = line.trim_start_matches("candidate:").split(' ').collect();
        let candidate = Candidate::from_words(&words).expect("parses");
        assert_eq!(candidate.kind, CandidateKind::ServerReflexive);
        assert_eq!(candidate.to_string(), line);
    }

    #[test]
    fn test_short_candidate_line_rejected() {
        let words: Vec<&str> = "1 1 UDP 2130706431 192.0.2.10 20000".split(' ').collect();
        assert!(Candidate::from_words(&words).is_err());
    }

    #[test]
    fn test_foundation_sharing() {
        let mut registry = FoundationRegistry::new();
        let base: IpAddr = "192.0.2.10".parse().unwrap();
        let other: IpAddr = "192.0.2.11".parse().unwrap();
        let rtp = registry.foundation(CandidateKind::Host, base, None);
        let rtcp = registry.foundation(CandidateKind::Host, base, None);
        assert_eq!(rtp, rtcp);
        assert_ne!(rtp, registry.foundation(CandidateKind::Host, other, None));
        let server = "203.0.113.1:3478".parse().ok();
        assert_ne!(
            rtp,
            registry.foundation(CandidateKind::ServerReflexive, base, server)
        );
    }
}
