use super::{
    Connection, MediaDescription, MediaDirection, MediaKind, Origin, Repeat, RtpMap, SdpAttribute,
    SdpSession, TimeDescription, TimezoneAdjustment,
};
use crate::ice::candidate::Candidate;
use crate::{Error, Result};
use tracing::debug;

const MAX_SDP_LINES: usize = 1000;

/// One `x=value` line split into its type character and whitespace
/// separated words.
struct Line {
    kind: char,
    words: Vec<String>,
}

struct Lines {
    lines: std::vec::IntoIter<String>,
    current: Option<Line>,
}

impl Lines {
    fn new(content: &str) -> Result<Lines> {
        let lines: Vec<String> = content
            .split("\r\n")
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect();
        if lines.len() > MAX_SDP_LINES {
            return Err(Error::SdpError(format!(
                "SDP has too many lines: {}",
                lines.len()
            )));
        }
        let mut iterator = Lines {
            lines: lines.into_iter(),
            current: None,
        };
        iterator.advance()?;
        Ok(iterator)
    }

    /// Moves to the next line; at the end of input `current` becomes None.
    fn advance(&mut self) -> Result<()> {
        self.current = match self.lines.next() {
            Some(line) => {
                let (prefix, value) = line
                    .split_once('=')
                    .ok_or_else(|| Error::SdpError(format!("line without '=': {}", line)))?;
                let mut chars = prefix.chars();
                let kind = chars
                    .next()
                    .ok_or_else(|| Error::SdpError(format!("line without type: {}", line)))?;
                if chars.next().is_some() {
                    return Err(Error::SdpError(format!("bad line type: {}", line)));
                }
                Some(Line {
                    kind,
                    words: value.split_whitespace().map(|w| w.to_string()).collect(),
                })
            }
            None => None,
        };
        Ok(())
    }

    fn kind(&self) -> Option<char> {
        self.current.as_ref().map(|l| l.kind)
    }

    /// The raw value of the current line (words joined by single spaces).
    fn text(&self) -> String {
        self.current
            .as_ref()
            .map(|l| l.words.join(" "))
            .unwrap_or_default()
    }

    fn words(&self) -> &[String] {
        self.current.as_ref().map(|l| l.words.as_slice()).unwrap_or(&[])
    }

    fn expect(&self, kind: char) -> Result<()> {
        if self.kind() != Some(kind) {
            return Err(Error::SdpError(format!(
                "expected {}= line, found {:?}",
                kind,
                self.kind()
            )));
        }
        Ok(())
    }
}

/// Parses an SDP session description, enforcing the strict line ordering
/// of RFC 4566 section 5.
pub fn parse_sdp(content: &str) -> Result<SdpSession> {
    let mut lines = Lines::new(content)?;
    let mut sdp = SdpSession::default();

    lines.expect('v')?;
    if lines.words().len() != 1 {
        return Err(Error::SdpError("malformed v= line".to_string()));
    }
    sdp.version = lines.words()[0].parse()?;
    if sdp.version != 0 {
        return Err(Error::SdpError(format!("unsupported version: {}", sdp.version)));
    }
    lines.advance()?;

    lines.expect('o')?;
    let words = lines.words();
    if words.len() != 6 {
        return Err(Error::SdpError("malformed o= line".to_string()));
    }
    sdp.origin = Origin {
        username: words[0].clone(),
        session_id: words[1].parse()?,
        session_version: words[2].parse()?,
        nettype: words[3].clone(),
        addrtype: words[4].clone(),
        address: words[5].clone(),
    };
    lines.advance()?;

    lines.expect('s')?;
    sdp.session_name = lines.text();
    lines.advance()?;

    if lines.kind() == Some('i') {
        sdp.information = Some(lines.text());
        lines.advance()?;
    }
    if lines.kind() == Some('u') {
        sdp.uri = Some(lines.text());
        lines.advance()?;
    }
    if lines.kind() == Some('e') {
        sdp.email = Some(lines.text());
        lines.advance()?;
    }
    if lines.kind() == Some('p') {
        sdp.phone = Some(lines.text());
        lines.advance()?;
    }

    if lines.kind() == Some('c') {
        sdp.connection = Some(parse_connection(lines.words())?);
        lines.advance()?;
    }
    while lines.kind() == Some('b') {
        sdp.bandwidth.push(lines.text());
        lines.advance()?;
    }

    if lines.kind() != Some('t') {
        return Err(Error::SdpError("no time description".to_string()));
    }
    while lines.kind() == Some('t') {
        let words = lines.words();
        if words.len() != 2 {
            return Err(Error::SdpError("malformed t= line".to_string()));
        }
        let mut time = TimeDescription {
            start: words[0].parse()?,
            stop: words[1].parse()?,
            repeat: None,
        };
        lines.advance()?;
        if lines.kind() == Some('r') {
            let words = lines.words();
            if words.len() < 3 {
                return Err(Error::SdpError("malformed r= line".to_string()));
            }
            time.repeat = Some(Repeat {
                interval: words[0].clone(),
                duration: words[1].clone(),
                offsets: words[2..].to_vec(),
            });
            lines.advance()?;
        }
        sdp.times.push(time);
    }

    if lines.kind() == Some('z') {
        let words = lines.words().to_vec();
        if words.len() < 2 || words.len() % 2 != 0 {
            return Err(Error::SdpError("malformed z= line".to_string()));
        }
        for pair in words.chunks(2) {
            sdp.timezones.push(TimezoneAdjustment {
                adjustment: pair[0].clone(),
                offset: pair[1].clone(),
            });
        }
        lines.advance()?;
    }
    if lines.kind() == Some('k') {
        sdp.key = Some(lines.text());
        lines.advance()?;
    }

    let mut session_rtp_maps = Vec::new();
    let mut session_candidates = Vec::new();
    parse_attributes(
        &mut lines,
        &mut sdp.attributes,
        &mut session_rtp_maps,
        &mut session_candidates,
    )?;
    sdp.candidates = session_candidates;
    if !session_rtp_maps.is_empty() {
        return Err(Error::SdpError("rtpmap outside a media section".to_string()));
    }

    while lines.kind() == Some('m') {
        let words = lines.words();
        if words.len() < 4 {
            return Err(Error::SdpError("malformed m= line".to_string()));
        }
        let mut media = MediaDescription::new(MediaKind::from_token(&words[0]), words[1].parse()?);
        media.protocol = words[2].clone();
        for payload in &words[3..] {
            media.payloads.push(payload.parse()?);
        }
        lines.advance()?;

        if lines.kind() == Some('i') {
            media.title = Some(lines.text());
            lines.advance()?;
        }
        if lines.kind() == Some('c') {
            media.connection = Some(parse_connection(lines.words())?);
            lines.advance()?;
        }
        while lines.kind() == Some('b') {
            media.bandwidth.push(lines.text());
            lines.advance()?;
        }
        if lines.kind() == Some('k') {
            media.key = Some(lines.text());
            lines.advance()?;
        }
        let mut media_candidates = Vec::new();
        parse_attributes(
            &mut lines,
            &mut media.attributes,
            &mut media.rtp_maps,
            &mut media_candidates,
        )?;
        media.candidates = media_candidates;
        sdp.media.push(media);
    }

    if lines.kind().is_some() {
        return Err(Error::SdpError(format!(
            "unexpected {}= line after media sections",
            lines.kind().unwrap()
        )));
    }

    sdp.check_validity()?;
    Ok(sdp)
}

fn parse_connection(words: &[String]) -> Result<Connection> {
    if words.len() != 3 {
        return Err(Error::SdpError("malformed c= line".to_string()));
    }
    Ok(Connection {
        nettype: words[0].clone(),
        addrtype: words[1].clone(),
        address: words[2].clone(),
    })
}

/// Consumes consecutive `a=` lines. rtpmap descriptors and ICE candidates
/// get typed slots; direction flags and ice-ufrag/ice-pwd are recognized;
/// everything else is kept verbatim as flag or value attributes.
fn parse_attributes(
    lines: &mut Lines,
    attributes: &mut Vec<SdpAttribute>,
    rtp_maps: &mut Vec<RtpMap>,
    candidates: &mut Vec<Candidate>,
) -> Result<()> {
    while lines.kind() == Some('a') {
        let words = lines.words().to_vec();
        let first = match words.first() {
            Some(first) => first.clone(),
            None => {
                lines.advance()?;
                continue;
            }
        };
        match first.split_once(':') {
            Some(("rtpmap", payload)) => {
                rtp_maps.push(parse_rtp_map(payload, words.get(1).map(|w| w.as_str()))?)
            }
            Some(("candidate", foundation)) => {
                let mut candidate_words: Vec<&str> = vec![foundation];
                candidate_words.extend(words[1..].iter().map(|w| w.as_str()));
                match Candidate::from_words(&candidate_words) {
                    Ok(candidate) => candidates.push(candidate),
                    Err(e) => debug!("skipping bad candidate attribute: {}", e),
                }
            }
            Some(("ice-ufrag", value)) => attributes.push(SdpAttribute::IceUfrag(value.to_string())),
            Some(("ice-pwd", value)) => attributes.push(SdpAttribute::IcePwd(value.to_string())),
            Some((name, value)) => {
                let mut value = value.to_string();
                for word in &words[1..] {
                    value.push(' ');
                    value.push_str(word);
                }
                attributes.push(SdpAttribute::Value {
                    name: name.to_string(),
                    value,
                });
            }
            None => match MediaDirection::from_token(&first) {
                Some(direction) => attributes.push(SdpAttribute::Direction(direction)),
                None => attributes.push(SdpAttribute::Flag(first)),
            },
        }
        lines.advance()?;
    }
    Ok(())
}

fn parse_rtp_map(payload: &str, parameters: Option<&str>) -> Result<RtpMap> {
    let parameters =
        parameters.ok_or_else(|| Error::SdpError("rtpmap missing encoding".to_string()))?;
    let mut parts = parameters.split('/');
    let encoding = parts
        .next()
        .ok_or_else(|| Error::SdpError("rtpmap missing encoding name".to_string()))?
        .to_string();
    let clock_rate = parts
        .next()
        .ok_or_else(|| Error::SdpError("rtpmap missing clock rate".to_string()))?
        .parse()?;
    let channels = match parts.next() {
        Some(channels) => Some(channels.parse()?),
        None => None,
    };
    Ok(RtpMap {
        payload: payload.parse()?,
        encoding,
        clock_rate,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const OFFER: &str = "v=0\r\n\
        o=alice 2890844526 2890844526 IN IP4 192.0.2.10\r\n\
        s=-\r\n\
        c=IN IP4 192.0.2.10\r\n\
        t=0 0\r\n\
        a=ice-ufrag:8hhY\r\n\
        a=ice-pwd:asd88fgpdd777uzjYhagZg\r\n\
        m=audio 20000 RTP/AVP 97 0\r\n\
        a=rtpmap:97 opus/48000/2\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=sendrecv\r\n\
        a=candidate:1 1 UDP 2130706431 192.0.2.10 20000 typ host\r\n\
        a=candidate:1 2 UDP 2130706430 192.0.2.10 20001 typ host\r\n\
        m=video 20002 RTP/AVP 96\r\n\
        a=rtpmap:96 H265/90000\r\n\
        a=sendrecv\r\n\
        a=candidate:2 1 UDP 2130706431 192.0.2.10 20002 typ host\r\n\
        a=candidate:2 2 UDP 2130706430 192.0.2.10 20003 typ host\r\n";

    #[test]
    fn test_parse_offer() {
        let sdp = parse_sdp(OFFER).expect("parses");
        assert_eq!(sdp.version, 0);
        assert_eq!(sdp.origin.username, "alice");
        assert_eq!(sdp.media.len(), 2);
        assert_eq!(sdp.media[0].kind, MediaKind::Audio);
        assert_eq!(sdp.media[0].payloads, vec![97, 0]);
        assert_eq!(sdp.media[1].kind, MediaKind::Video);
        assert_eq!(sdp.all_candidates().count(), 4);
        assert_eq!(sdp.media[0].candidates.len(), 2);
        assert_eq!(sdp.ice_ufrag(), Some("8hhY"));
        let opus = sdp.media[0].rtp_map("opus").expect("opus present");
        assert_eq!(opus.clock_rate, 48000);
        assert_eq!(opus.channels, Some(2));
    }

    #[test]
    fn test_missing_time_rejected() {
        let content = OFFER.replace("t=0 0\r\n", "");
        assert!(parse_sdp(&content).is_err());
    }

    #[test]
    fn test_media_without_any_connection_rejected() {
        let content = OFFER.replace("c=IN IP4 192.0.2.10\r\n", "");
        assert!(parse_sdp(&content).is_err());
    }

    #[test]
    fn test_per_media_connection_accepted() {
        let content = OFFER
            .replace("c=IN IP4 192.0.2.10\r\n", "")
            .replace(
                "m=audio 20000 RTP/AVP 97 0\r\n",
                "m=audio 20000 RTP/AVP 97 0\r\nc=IN IP4 192.0.2.10\r\n",
            )
            .replace(
                "m=video 20002 RTP/AVP 96\r\n",
                "m=video 20002 RTP/AVP 96\r\nc=IN IP4 192.0.2.10\r\n",
            );
        let sdp = parse_sdp(&content).expect("parses");
        assert!(sdp.connection.is_none());
        assert!(sdp.media.iter().all(|m| m.connection.is_some()));
    }

    #[test]
    fn test_rtpmap_outside_media_rejected() {
        let content = OFFER.replace(
            "a=ice-ufrag:8hhY\r\n",
            "a=rtpmap:96 H265/90000\r\na=ice-ufrag:8hhY\r\n",
        );
        assert!(parse_sdp(&content).is_err());
    }

    #[test]
    fn test_wrong_order_rejected() {
        let content = "o=alice 1 1 IN IP4 192.0.2.10\r\nv=0\r\n";
        assert!(parse_sdp(content).is_err());
    }
}
