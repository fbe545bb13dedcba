use super::candidate::{
    candidate_priority, Candidate, CandidateKind, FoundationRegistry, COMPONENT_RTP,
};
use super::stun::{make_transaction_id, StunMessage};
use crate::config::Config;
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const STUN_QUERY_RTO: Duration = Duration::from_millis(500);
const STUN_QUERY_ATTEMPTS: u32 = 3;

/// Process-wide allocator of consecutive media port pairs (RTP on the
/// even port, RTCP right above it). Pairs go back to the free list when
/// the owning session releases them.
pub struct PortPool {
    free: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(min_port: u16, max_port: u16) -> Arc<Self> {
        let mut free = BTreeSet::new();
        let mut port = min_port + (min_port % 2);
        while port + 1 <= max_port {
            free.insert(port);
            port += 2;
        }
        Arc::new(PortPool {
            free: Mutex::new(free),
        })
    }

    pub fn allocate_pair(&self) -> Option<(u16, u16)> {
        let mut free = self.free.lock().unwrap();
        let port = free.iter().next().copied()?;
        free.remove(&port);
        Some((port, port + 1))
    }

    pub fn release_pair(&self, rtp_port: u16) {
        self.free.lock().unwrap().insert(rtp_port & !1);
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// External TURN allocation hook. The actual relay protocol lives
/// outside this crate; an implementation hands back the relayed address
/// for a local socket.
pub trait RelayAllocator: Send + Sync {
    fn allocate(&self, local: SocketAddr) -> Option<SocketAddr>;
}

/// Enumerates host, server-reflexive and relay candidates for a session
/// (RFC 8445 section 5.1.1).
pub struct CandidateGatherer {
    pool: Arc<PortPool>,
    stun_server: Option<SocketAddr>,
    relay: Option<Arc<dyn RelayAllocator>>,
    allow_loopback: bool,
}

impl CandidateGatherer {
    pub fn new(
        pool: Arc<PortPool>,
        stun_server: Option<SocketAddr>,
        relay: Option<Arc<dyn RelayAllocator>>,
    ) -> Self {
        CandidateGatherer {
            pool,
            stun_server,
            relay,
            allow_loopback: false,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        CandidateGatherer {
            pool: PortPool::new(config.min_media_port, config.max_media_port),
            stun_server: config.stun_server,
            relay: None,
            allow_loopback: config.allow_loopback,
        }
    }

    /// Interfaces worth gathering on. Loopback and link-local addresses
    /// are excluded unless loopback was explicitly allowed.
    fn useful_interfaces(&self) -> Vec<IpAddr> {
        let mut addresses = Vec::new();
        let interfaces = match get_if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("cannot enumerate interfaces: {}", e);
                return addresses;
            }
        };
        for interface in interfaces {
            if interface.is_loopback() {
                if self.allow_loopback {
                    addresses.push(interface.ip());
                }
                continue;
            }
            let ip = interface.ip();
            let link_local = match ip {
                IpAddr::V4(v4) => v4.is_link_local(),
                IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
            };
            if link_local {
                continue;
            }
            addresses.push(ip);
        }
        addresses
    }

    /// Gathers candidates for `media_count` media sections, two
    /// components each. Port exhaustion fails the whole gathering and
    /// releases everything allocated so far.
    pub async fn gather(&self, media_count: usize) -> Result<Vec<Vec<Candidate>>> {
        let interfaces = self.useful_interfaces();
        if interfaces.is_empty() {
            return Err(Error::IceError("no usable network interfaces".to_string()));
        }
        self.gather_on(&interfaces, media_count).await
    }

    /// Same as `gather` with an explicit interface list, used directly
    /// by tests.
    pub async fn gather_on(
        &self,
        interfaces: &[IpAddr],
        media_count: usize,
    ) -> Result<Vec<Vec<Candidate>>> {
        let mut registry = FoundationRegistry::new();
        let mut media_candidates: Vec<Vec<Candidate>> = Vec::with_capacity(media_count);
        let mut allocated: Vec<u16> = Vec::new();

        for media_index in 0..media_count {
            let mut candidates = Vec::new();
            for (interface_index, &address) in interfaces.iter().enumerate() {
                let (rtp_port, rtcp_port) = match self.pool.allocate_pair() {
                    Some(ports) => ports,
                    None => {
                        for port in allocated {
                            self.pool.release_pair(port);
                        }
                        return Err(Error::PortExhausted);
                    }
                };
                allocated.push(rtp_port);
                let local_preference = 65535 - interface_index as u16;

                for (component, port) in
                    [(COMPONENT_RTP, rtp_port), (COMPONENT_RTP + 1, rtcp_port)]
                {
                    let foundation = registry.foundation(CandidateKind::Host, address, None);
                    candidates.push(Candidate {
                        foundation,
                        component,
                        transport: "UDP".to_string(),
                        priority: candidate_priority(
                            CandidateKind::Host,
                            local_preference,
                            component,
                        ),
                        address,
                        port,
                        kind: CandidateKind::Host,
                        rel_address: None,
                        rel_port: None,
                    });
                }

                if let Some(server) = self.stun_server {
                    self.gather_reflexive(
                        &mut registry,
                        &mut candidates,
                        address,
                        (rtp_port, rtcp_port),
                        server,
                    )
                    .await;
                }
                if let Some(relay) = &self.relay {
                    Self::gather_relay(
                        relay.as_ref(),
                        &mut registry,
                        &mut candidates,
                        address,
                        (rtp_port, rtcp_port),
                    );
                }
            }
            debug!(
                "media {} gathered {} candidates",
                media_index,
                candidates.len()
            );
            media_candidates.push(candidates);
        }

        info!(
            "gathered candidates for {} media, {} ports left in pool",
            media_count,
            self.pool.available()
        );
        Ok(media_candidates)
    }

    /// One STUN Binding per component; the mapped address becomes a
    /// server-reflexive candidate whose related address is the local
    /// socket it was learned from.
    async fn gather_reflexive(
        &self,
        registry: &mut FoundationRegistry,
        candidates: &mut Vec<Candidate>,
        address: IpAddr,
        ports: (u16, u16),
        server: SocketAddr,
    ) {
        for (component, port) in [(COMPONENT_RTP, ports.0), (COMPONENT_RTP + 1, ports.1)] {
            let local = SocketAddr::new(address, port);
            match stun_binding(local, server).await {
                Ok(mapped) if mapped != local => {
                    let foundation =
                        registry.foundation(CandidateKind::ServerReflexive, address, Some(server));
                    candidates.push(Candidate {
                        foundation,
                        component,
                        transport: "UDP".to_string(),
                        priority: candidate_priority(
                            CandidateKind::ServerReflexive,
                            65535,
                            component,
                        ),
                        address: mapped.ip(),
                        port: mapped.port(),
                        kind: CandidateKind::ServerReflexive,
                        rel_address: Some(address),
                        rel_port: Some(port),
                    });
                }
                Ok(_) => debug!("not behind NAT for {}", local),
                Err(e) => warn!("STUN query from {} failed: {}", local, e),
            }
        }
    }

    fn gather_relay(
        relay: &dyn RelayAllocator,
        registry: &mut FoundationRegistry,
        candidates: &mut Vec<Candidate>,
        address: IpAddr,
        ports: (u16, u16),
    ) {
        for (component, port) in [(COMPONENT_RTP, ports.0), (COMPONENT_RTP + 1, ports.1)] {
            let local = SocketAddr::new(address, port);
            if let Some(relayed) = relay.allocate(local) {
                let foundation = registry.foundation(CandidateKind::Relay, address, Some(relayed));
                candidates.push(Candidate {
                    foundation,
                    component,
                    transport: "UDP".to_string(),
                    priority: candidate_priority(CandidateKind::Relay, 65535, component),
                    address: relayed.ip(),
                    port: relayed.port(),
                    kind: CandidateKind::Relay,
                    rel_address: Some(address),
                    rel_port: Some(port),
                });
            }
        }
    }

    /// Returns the port pairs behind a gathered candidate set to the
    /// pool. Call when the session ends.
    pub fn release(&self, media_candidates: &[Vec<Candidate>]) {
        for candidates in media_candidates {
            for candidate in candidates {
                if candidate.kind == CandidateKind::Host && candidate.component == COMPONENT_RTP {
                    self.pool.release_pair(candidate.port);
                }
            }
        }
    }

    pub fn pool(&self) -> Arc<PortPool> {
        self.pool.clone()
    }
}

/// Plain STUN Binding query toward a configured server, with a short
/// retransmission schedule.
pub async fn stun_binding(local: SocketAddr, server: SocketAddr) -> Result<SocketAddr> {
    let socket = UdpSocket::bind(local).await?;
    socket.connect(server).await?;
    let transaction_id = make_transaction_id();
    let request = StunMessage::binding_request(transaction_id).encode(None);

    let mut rto = STUN_QUERY_RTO;
    let mut buffer = [0u8; 1024];
    for _ in 0..STUN_QUERY_ATTEMPTS {
        socket.send(&request).await?;
        match tokio::time::timeout(rto, socket.recv(&mut buffer)).await {
            Ok(Ok(n)) => {
                let response = StunMessage::decode(&buffer[..n])?;
                if response.transaction_id != transaction_id {
                    continue;
                }
                return response
                    .xor_mapped_address()
                    .ok_or_else(|| Error::StunError("response without mapped address".to_string()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => rto *= 2,
        }
    }
    Err(Error::StunError(format!("no answer from STUN server {}", server)))
}

#[cfg(test)]
mod tests {
    use super::super::candidate::COMPONENTS_PER_MEDIA;
    use super::*;

    #[test]
    fn test_port_pool_pairs() {
        let pool = PortPool::new(20001, 20008);
        // alignment starts the pool at the first even port
        let (rtp, rtcp) = pool.allocate_pair().unwrap();
        assert_eq!(rtp, 20002);
        assert_eq!(rtcp, 20003);
        assert_eq!(pool.available(), 2);

        let second = pool.allocate_pair().unwrap();
        let third = pool.allocate_pair().unwrap();
        assert_eq!(second.0, 20004);
        assert_eq!(third.0, 20006);
        assert!(pool.allocate_pair().is_none());

        pool.release_pair(second.0);
        assert_eq!(pool.allocate_pair().unwrap().0, 20004);
    }

    #[tokio::test]
    async fn test_gather_host_candidates_two_media() {
        let pool = PortPool::new(30000, 30100);
        let gatherer = CandidateGatherer::new(pool, None, None);
        let interfaces = vec!["192.0.2.10".parse().unwrap()];
        let media = gatherer.gather_on(&interfaces, 2).await.expect("gathers");
        assert_eq!(media.len(), 2);
        for candidates in &media {
            assert_eq!(candidates.len(), COMPONENTS_PER_MEDIA as usize);
            assert_eq!(candidates[0].component, COMPONENT_RTP);
            assert_eq!(candidates[1].port, candidates[0].port + 1);
            assert_eq!(candidates[0].foundation, candidates[1].foundation);
        }
        // distinct media get distinct ports
        assert_ne!(media[0][0].port, media[1][0].port);
    }

    #[tokio::test]
    async fn test_gather_fails_when_pool_is_exhausted() {
        let pool = PortPool::new(40000, 40001);
        let gatherer = CandidateGatherer::new(pool.clone(), None, None);
        let interfaces = vec!["192.0.2.10".parse().unwrap()];
        let result = gatherer.gather_on(&interfaces, 2).await;
        assert!(matches!(result, Err(Error::PortExhausted)));
        // partial allocations were returned to the pool
        assert_eq!(pool.available(), 1);
    }

    struct FixedRelay;
    impl RelayAllocator for FixedRelay {
        fn allocate(&self, local: SocketAddr) -> Option<SocketAddr> {
            Some(SocketAddr::new("203.0.113.99".parse().unwrap(), local.port() + 10000))
        }
    }

    #[tokio::test]
    async fn test_relay_candidates_carry_local_related_address() {
        let pool = PortPool::new(30000, 30100);
        let gatherer = CandidateGatherer::new(pool, None, Some(Arc::new(FixedRelay)));
        let interfaces: Vec<IpAddr> = vec!["192.0.2.10".parse().unwrap()];
        let media = gatherer.gather_on(&interfaces, 1).await.expect("gathers");
        let relay: Vec<&Candidate> = media[0]
            .iter()
            .filter(|c| c.kind == CandidateKind::Relay)
            .collect();
        assert_eq!(relay.len(), 2);
        assert_eq!(relay[0].rel_address, Some(interfaces[0]));
        assert_eq!(relay[0].rel_port, Some(media[0][0].port));
        // relay candidates rank below host candidates
        assert!(relay[0].priority < media[0][0].priority);
    }
}
