use super::{
    Connection, MediaDescription, MediaDirection, MediaKind, Origin, RtpMap, SdpAttribute,
    SdpSession, TimeDescription,
};
use crate::ice::candidate::{Candidate, CandidateKind, COMPONENT_RTP};
use crate::ice::pair::CandidatePair;
use crate::{Error, Result};
use std::net::IpAddr;
use tracing::{debug, info, warn};

pub const H265_PAYLOAD: u8 = 96;
pub const OPUS_PAYLOAD: u8 = 97;
pub const PCMU_PAYLOAD: u8 = 0;

/// Offer/answer progress for one session (RFC 3264).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    NoState,
    OfferGenerated,
    AnswerGenerated,
    Finished,
}

/// Candidates gathered for one media section, RTP first.
pub type MediaCandidates = Vec<Vec<Candidate>>;

/// Per-session SDP offer/answer state machine. Media policy is fixed to
/// two sections: Opus (with PCMU fallback) audio first, H265 video second.
pub struct SdpNegotiation {
    state: NegotiationState,
    local_address: IpAddr,
    local_sdp: Option<SdpSession>,
    remote_sdp: Option<SdpSession>,
}

fn audio_rtp_maps() -> Vec<RtpMap> {
    vec![
        RtpMap {
            payload: OPUS_PAYLOAD,
            encoding: "opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
        },
        RtpMap {
            payload: PCMU_PAYLOAD,
            encoding: "PCMU".to_string(),
            clock_rate: 8000,
            channels: None,
        },
    ]
}

fn video_rtp_maps() -> Vec<RtpMap> {
    vec![RtpMap {
        payload: H265_PAYLOAD,
        encoding: "H265".to_string(),
        clock_rate: 90000,
        channels: None,
    }]
}

impl SdpNegotiation {
    pub fn new(local_address: IpAddr) -> Self {
        SdpNegotiation {
            state: NegotiationState::NoState,
            local_address,
            local_sdp: None,
            remote_sdp: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_sdp(&self) -> Option<&SdpSession> {
        self.local_sdp.as_ref()
    }

    pub fn remote_sdp(&self) -> Option<&SdpSession> {
        self.remote_sdp.as_ref()
    }

    /// Builds the local offer with the gathered candidates and moves to
    /// OfferGenerated. `media_candidates` is ordered audio, video.
    pub fn generate_offer(
        &mut self,
        username: &str,
        media_candidates: MediaCandidates,
        ice_ufrag: &str,
        ice_pwd: &str,
    ) -> Result<SdpSession> {
        let local = self.build_local_sdp(
            username,
            media_candidates,
            ice_ufrag,
            ice_pwd,
            audio_rtp_maps(),
            video_rtp_maps(),
        )?;
        self.local_sdp = Some(local.clone());
        self.remote_sdp = None;
        self.state = NegotiationState::OfferGenerated;
        info!("local SDP offer generated");
        Ok(local)
    }

    /// Validates a remote offer and produces our answer; the caller then
    /// starts ICE in the controller role. Moves to AnswerGenerated.
    pub fn process_offer(
        &mut self,
        remote: SdpSession,
        username: &str,
        media_candidates: MediaCandidates,
        ice_ufrag: &str,
        ice_pwd: &str,
    ) -> Result<SdpSession> {
        remote.check_validity()?;
        if remote.all_candidates().next().is_none() {
            return Err(Error::NegotiationError(
                "remote offer carries no ICE candidates".to_string(),
            ));
        }
        let (audio_maps, video_maps) = negotiated_rtp_maps(&remote)?;
        let answer = self.build_local_sdp(
            username,
            media_candidates,
            ice_ufrag,
            ice_pwd,
            audio_maps,
            video_maps,
        )?;
        self.local_sdp = Some(answer.clone());
        self.remote_sdp = Some(remote);
        self.state = NegotiationState::AnswerGenerated;
        info!("remote SDP offer accepted, answer generated");
        Ok(answer)
    }

    /// Validates the remote answer to our offer; the caller then starts
    /// ICE in the controllee role. Moves to Finished.
    pub fn process_answer(&mut self, remote: SdpSession) -> Result<()> {
        if self.state != NegotiationState::OfferGenerated {
            return Err(Error::NegotiationError(format!(
                "answer received in state {:?}",
                self.state
            )));
        }
        remote.check_validity()?;
        if remote.all_candidates().next().is_none() {
            return Err(Error::NegotiationError(
                "remote answer carries no ICE candidates".to_string(),
            ));
        }
        negotiated_rtp_maps(&remote)?;
        self.remote_sdp = Some(remote);
        self.state = NegotiationState::Finished;
        info!("remote SDP answer accepted");
        Ok(())
    }

    /// Confirms the locally generated answer was delivered (in the 200 OK
    /// or the ACK). Moves AnswerGenerated to Finished.
    pub fn answer_delivered(&mut self) {
        if self.state == NegotiationState::AnswerGenerated {
            self.state = NegotiationState::Finished;
        }
    }

    /// Rewrites both SDP snapshots with the nominated pair endpoints and
    /// returns them. For a non-host local candidate the media moves to the
    /// candidate's related address and port (the local socket); for host
    /// candidates the candidate address itself is used. Remote media move
    /// to the remote candidate's own address.
    pub fn on_ice_complete(
        &mut self,
        nominated: &[CandidatePair],
    ) -> Result<(SdpSession, SdpSession)> {
        let mut local = self
            .local_sdp
            .clone()
            .ok_or_else(|| Error::NegotiationError("no local SDP to rewrite".to_string()))?;
        let mut remote = self
            .remote_sdp
            .clone()
            .ok_or_else(|| Error::NegotiationError("no remote SDP to rewrite".to_string()))?;

        for pair in nominated.iter().filter(|p| p.component() == COMPONENT_RTP) {
            let local_base = pair.local.base_addr();
            let media_index = local
                .media
                .iter()
                .position(|m| m.port == local_base.port())
                .ok_or_else(|| {
                    Error::NegotiationError(format!(
                        "nominated pair does not match any media port: {}",
                        local_base
                    ))
                })?;

            let (local_addr, local_port) = match pair.local.kind {
                CandidateKind::Host => (pair.local.address, pair.local.port),
                _ => (
                    pair.local.rel_address.unwrap_or(pair.local.address),
                    pair.local.rel_port.unwrap_or(pair.local.port),
                ),
            };
            let media = &mut local.media[media_index];
            media.port = local_port;
            media.connection = Some(Connection::ip4_or_ip6(local_addr));

            if let Some(media) = remote.media.get_mut(media_index) {
                media.port = pair.remote.port;
                media.connection = Some(Connection::ip4_or_ip6(pair.remote.address));
            }
            debug!(
                "media {} rewritten to {}:{} <-> {}:{}",
                media_index, local_addr, local_port, pair.remote.address, pair.remote.port
            );
        }

        self.local_sdp = Some(local.clone());
        self.remote_sdp = Some(remote.clone());
        Ok((local, remote))
    }

    fn build_local_sdp(
        &self,
        username: &str,
        media_candidates: MediaCandidates,
        ice_ufrag: &str,
        ice_pwd: &str,
        audio_maps: Vec<RtpMap>,
        video_maps: Vec<RtpMap>,
    ) -> Result<SdpSession> {
        if media_candidates.len() != 2 {
            return Err(Error::NegotiationError(format!(
                "expected candidates for 2 media, got {}",
                media_candidates.len()
            )));
        }

        let mut sdp = SdpSession {
            version: 0,
            origin: Origin {
                username: username.to_string(),
                session_id: rand::random::<u32>() as u64,
                session_version: 0,
                nettype: "IN".to_string(),
                addrtype: addrtype(self.local_address).to_string(),
                address: self.local_address.to_string(),
            },
            session_name: "-".to_string(),
            connection: Some(Connection {
                nettype: "IN".to_string(),
                addrtype: addrtype(self.local_address).to_string(),
                address: self.local_address.to_string(),
            }),
            times: vec![TimeDescription::default()],
            attributes: vec![
                SdpAttribute::IceUfrag(ice_ufrag.to_string()),
                SdpAttribute::IcePwd(ice_pwd.to_string()),
            ],
            ..SdpSession::default()
        };

        for (index, (kind, maps)) in [
            (MediaKind::Audio, audio_maps),
            (MediaKind::Video, video_maps),
        ]
        .into_iter()
        .enumerate()
        {
            let candidates = &media_candidates[index];
            let port = candidates
                .iter()
                .find(|c| c.component == COMPONENT_RTP && c.kind == CandidateKind::Host)
                .map(|c| c.port)
                .ok_or_else(|| {
                    Error::NegotiationError(format!(
                        "no host RTP candidate for media {}",
                        index
                    ))
                })?;
            let mut media = MediaDescription::new(kind, port);
            media.payloads = maps.iter().map(|m| m.payload).collect();
            media.rtp_maps = maps;
            media.attributes.push(SdpAttribute::Direction(MediaDirection::SendRecv));
            media.candidates = candidates.clone();
            sdp.media.push(media);
        }

        sdp.check_validity()?;
        Ok(sdp)
    }
}

fn addrtype(address: IpAddr) -> &'static str {
    if address.is_ipv4() {
        "IP4"
    } else {
        "IP6"
    }
}

impl Connection {
    fn ip4_or_ip6(address: IpAddr) -> Connection {
        Connection {
            nettype: "IN".to_string(),
            addrtype: addrtype(address).to_string(),
            address: address.to_string(),
        }
    }
}

/// Applies the codec policy to a remote description: video must carry
/// H265 and audio must carry Opus or the PCMU fallback. The returned maps
/// are the intersection with our supported set, used to build the answer.
fn negotiated_rtp_maps(remote: &SdpSession) -> Result<(Vec<RtpMap>, Vec<RtpMap>)> {
    let audio = remote
        .media
        .iter()
        .find(|m| m.kind == MediaKind::Audio)
        .ok_or_else(|| Error::NegotiationError("remote SDP has no audio media".to_string()))?;
    let video = remote
        .media
        .iter()
        .find(|m| m.kind == MediaKind::Video)
        .ok_or_else(|| Error::NegotiationError("remote SDP has no video media".to_string()))?;

    let audio_maps: Vec<RtpMap> = audio_rtp_maps()
        .into_iter()
        .filter(|ours| audio.rtp_map(&ours.encoding).is_some())
        .collect();
    let video_maps: Vec<RtpMap> = video_rtp_maps()
        .into_iter()
        .filter(|ours| video.rtp_map(&ours.encoding).is_some())
        .collect();

    if video_maps.is_empty() {
        warn!("remote offer does not include H265");
        return Err(Error::NegotiationError(
            "no common video codec (H265 required)".to_string(),
        ));
    }
    if audio_maps.is_empty() {
        warn!("remote offer does not include Opus or PCMU");
        return Err(Error::NegotiationError(
            "no common audio codec".to_string(),
        ));
    }
    Ok((audio_maps, video_maps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::pair::{CandidatePair, IceRole};

    fn host(component: u8, port: u16, foundation: &str) -> Candidate {
        Candidate::host(
            foundation.to_string(),
            component,
            format!("192.0.2.10:{}", port).parse().unwrap(),
            65535,
        )
    }

    fn media_candidates() -> MediaCandidates {
        vec![
            vec![host(1, 20000, "1"), host(2, 20001, "1")],
            vec![host(1, 20002, "2"), host(2, 20003, "2")],
        ]
    }

    fn remote_offer() -> SdpSession {
        let mut negotiation = SdpNegotiation::new("203.0.113.4".parse().unwrap());
        let candidates = vec![
            vec![
                Candidate::host("1".to_string(), 1, "203.0.113.4:30000".parse().unwrap(), 65535),
                Candidate::host("1".to_string(), 2, "203.0.113.4:30001".parse().unwrap(), 65535),
            ],
            vec![
                Candidate::host("2".to_string(), 1, "203.0.113.4:30002".parse().unwrap(), 65535),
                Candidate::host("2".to_string(), 2, "203.0.113.4:30003".parse().unwrap(), 65535),
            ],
        ];
        negotiation
            .generate_offer("bob", candidates, "remoteUf", "remotePassword0000000000")
            .expect("offer")
    }

    #[test]
    fn test_offer_layout() {
        let mut negotiation = SdpNegotiation::new("192.0.2.10".parse().unwrap());
        let offer = negotiation
            .generate_offer("alice", media_candidates(), "uf", "pwd4567890123456789012")
            .expect("offer");
        assert_eq!(negotiation.state(), NegotiationState::OfferGenerated);
        assert_eq!(offer.media.len(), 2);
        assert_eq!(offer.media[0].kind, MediaKind::Audio);
        assert_eq!(offer.media[0].port, 20000);
        assert_eq!(offer.media[1].kind, MediaKind::Video);
        assert_eq!(offer.media[1].port, 20002);
        assert!(offer.media[0].rtp_map("opus").is_some());
        assert!(offer.media[1].rtp_map("H265").is_some());
        assert_eq!(offer.all_candidates().count(), 4);
    }

    #[test]
    fn test_offer_answer_happy_path() {
        let mut negotiation = SdpNegotiation::new("192.0.2.10".parse().unwrap());
        let answer = negotiation
            .process_offer(remote_offer(), "alice", media_candidates(), "uf", "pwd456789012345678901")
            .expect("answer");
        assert_eq!(negotiation.state(), NegotiationState::AnswerGenerated);
        assert!(answer.media[1].rtp_map("H265").is_some());
        negotiation.answer_delivered();
        assert_eq!(negotiation.state(), NegotiationState::Finished);
    }

    #[test]
    fn test_offer_without_h265_rejected() {
        let mut offer = remote_offer();
        offer.media[1].rtp_maps.clear();
        offer.media[1].rtp_maps.push(RtpMap {
            payload: 98,
            encoding: "VP8".to_string(),
            clock_rate: 90000,
            channels: None,
        });
        let mut negotiation = SdpNegotiation::new("192.0.2.10".parse().unwrap());
        assert!(negotiation
            .process_offer(offer, "alice", media_candidates(), "uf", "pwd")
            .is_err());
    }

    #[test]
    fn test_answer_in_wrong_state_rejected() {
        let mut negotiation = SdpNegotiation::new("192.0.2.10".parse().unwrap());
        assert!(negotiation.process_answer(remote_offer()).is_err());
    }

    #[test]
    fn test_ice_rewrite_host_pair() {
        let mut negotiation = SdpNegotiation::new("192.0.2.10".parse().unwrap());
        negotiation
            .generate_offer("alice", media_candidates(), "uf", "pwd4567890123456789012")
            .expect("offer");
        negotiation.process_answer(remote_offer()).expect("answer");

        let remote_rtp =
            Candidate::host("1".to_string(), 1, "203.0.113.4:30000".parse().unwrap(), 65535);
        let nominated = vec![
            CandidatePair::new(host(1, 20000, "1"), remote_rtp.clone(), IceRole::Controllee),
            CandidatePair::new(
                host(1, 20002, "2"),
                Candidate::host("2".to_string(), 1, "203.0.113.4:30002".parse().unwrap(), 65535),
                IceRole::Controllee,
            ),
        ];
        let (local, remote) = negotiation.on_ice_complete(&nominated).expect("rewrite");
        assert_eq!(local.media[0].port, 20000);
        assert_eq!(
            local.media[0].connection.as_ref().unwrap().address,
            "192.0.2.10"
        );
        assert_eq!(remote.media[0].port, 30000);
        assert_eq!(
            remote.media[0].connection.as_ref().unwrap().address,
            "203.0.113.4"
        );
        assert_eq!(remote.media[1].port, 30002);
    }

    #[test]
    fn test_ice_rewrite_srflx_uses_related_address() {
        let mut negotiation = SdpNegotiation::new("192.0.2.10".parse().unwrap());
        negotiation
            .generate_offer("alice", media_candidates(), "uf", "pwd4567890123456789012")
            .expect("offer");
        negotiation.process_answer(remote_offer()).expect("answer");

        let mut srflx = host(1, 20000, "1");
        srflx.kind = CandidateKind::ServerReflexive;
        srflx.address = "198.51.100.7".parse().unwrap();
        srflx.port = 51000;
        srflx.rel_address = Some("192.0.2.10".parse().unwrap());
        srflx.rel_port = Some(20000);

        let remote_rtp =
            Candidate::host("1".to_string(), 1, "203.0.113.4:30000".parse().unwrap(), 65535);
        let nominated = vec![CandidatePair::new(srflx, remote_rtp, IceRole::Controllee)];
        let (local, _) = negotiation.on_ice_complete(&nominated).expect("rewrite");
        // the media keeps the local socket, which is the related address
        assert_eq!(local.media[0].port, 20000);
        assert_eq!(
            local.media[0].connection.as_ref().unwrap().address,
            "192.0.2.10"
        );
    }
}
