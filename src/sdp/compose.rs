use super::{Connection, MediaDescription, SdpAttribute, SdpSession};

const LINE_END: &str = "\r\n";

/// Composes the description back into its wire form, following the same
/// strict line ordering the parser enforces. Output is ASCII with CRLF
/// line endings.
pub fn compose_sdp(sdp: &SdpSession) -> String {
    let mut out = String::new();

    out.push_str(&format!("v={}{}", sdp.version, LINE_END));
    out.push_str(&format!(
        "o={} {} {} {} {} {}{}",
        sdp.origin.username,
        sdp.origin.session_id,
        sdp.origin.session_version,
        sdp.origin.nettype,
        sdp.origin.addrtype,
        sdp.origin.address,
        LINE_END
    ));
    out.push_str(&format!("s={}{}", sdp.session_name, LINE_END));
    if let Some(information) = &sdp.information {
        out.push_str(&format!("i={}{}", information, LINE_END));
    }
    if let Some(uri) = &sdp.uri {
        out.push_str(&format!("u={}{}", uri, LINE_END));
    }
    if let Some(email) = &sdp.email {
        out.push_str(&format!("e={}{}", email, LINE_END));
    }
    if let Some(phone) = &sdp.phone {
        out.push_str(&format!("p={}{}", phone, LINE_END));
    }
    if let Some(connection) = &sdp.connection {
        compose_connection(&mut out, connection);
    }
    for bandwidth in &sdp.bandwidth {
        out.push_str(&format!("b={}{}", bandwidth, LINE_END));
    }
    for time in &sdp.times {
        out.push_str(&format!("t={} {}{}", time.start, time.stop, LINE_END));
        if let Some(repeat) = &time.repeat {
            out.push_str(&format!("r={} {}", repeat.interval, repeat.duration));
            for offset in &repeat.offsets {
                out.push(' ');
                out.push_str(offset);
            }
            out.push_str(LINE_END);
        }
    }
    if !sdp.timezones.is_empty() {
        out.push_str("z=");
        for (i, timezone) in sdp.timezones.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&format!("{} {}", timezone.adjustment, timezone.offset));
        }
        out.push_str(LINE_END);
    }
    if let Some(key) = &sdp.key {
        out.push_str(&format!("k={}{}", key, LINE_END));
    }
    compose_attributes(&mut out, &sdp.attributes);
    for candidate in &sdp.candidates {
        out.push_str(&format!("a={}{}", candidate, LINE_END));
    }

    for media in &sdp.media {
        compose_media(&mut out, media);
    }

    out
}

fn compose_connection(out: &mut String, connection: &Connection) {
    out.push_str(&format!(
        "c={} {} {}{}",
        connection.nettype, connection.addrtype, connection.address, LINE_END
    ));
}

fn compose_media(out: &mut String, media: &MediaDescription) {
    out.push_str(&format!(
        "m={} {} {}",
        media.kind.as_token(),
        media.port,
        media.protocol
    ));
    for payload in &media.payloads {
        out.push_str(&format!(" {}", payload));
    }
    out.push_str(LINE_END);

    if let Some(title) = &media.title {
        out.push_str(&format!("i={}{}", title, LINE_END));
    }
    if let Some(connection) = &media.connection {
        compose_connection(out, connection);
    }
    for bandwidth in &media.bandwidth {
        out.push_str(&format!("b={}{}", bandwidth, LINE_END));
    }
    if let Some(key) = &media.key {
        out.push_str(&format!("k={}{}", key, LINE_END));
    }
    for rtp_map in &media.rtp_maps {
        out.push_str(&format!("a=rtpmap:{}{}", rtp_map, LINE_END));
    }
    compose_attributes(out, &media.attributes);
    for candidate in &media.candidates {
        out.push_str(&format!("a={}{}", candidate, LINE_END));
    }
}

fn compose_attributes(out: &mut String, attributes: &[SdpAttribute]) {
    for attribute in attributes {
        match attribute {
            SdpAttribute::Direction(direction) => {
                out.push_str(&format!("a={}{}", direction.as_token(), LINE_END))
            }
            SdpAttribute::IceUfrag(value) => {
                out.push_str(&format!("a=ice-ufrag:{}{}", value, LINE_END))
            }
            SdpAttribute::IcePwd(value) => {
                out.push_str(&format!("a=ice-pwd:{}{}", value, LINE_END))
            }
            SdpAttribute::Value { name, value } => {
                out.push_str(&format!("a={}:{}{}", name, value, LINE_END))
            }
            SdpAttribute::Flag(name) => out.push_str(&format!("a={}{}", name, LINE_END)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::parse::parse_sdp;

    const OFFER: &str = "v=0\r\n\
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
    fn test_compose_parse_roundtrip() {
        let sdp = parse_sdp(OFFER).expect("parses");
        assert_eq!(sdp.to_string(), OFFER);
    }

    #[test]
    fn test_roundtrip_with_optional_lines() {
        let content = "v=0\r\n\
            o=bob 1 2 IN IP4 203.0.113.4\r\n\
            s=call\r\n\
            i=a short session\r\n\
            u=https://example.test/call\r\n\
            b=AS:256\r\n\
            t=3724394400 3724398000\r\n\
            r=604800 3600 0 90000\r\n\
            z=2882844526 -1h\r\n\
            a=tool:peercall\r\n\
            m=audio 30000 RTP/AVP 0\r\n\
            c=IN IP4 203.0.113.4\r\n\
            a=rtpmap:0 PCMU/8000\r\n\
            a=recvonly\r\n";
        let sdp = parse_sdp(content).expect("parses");
        assert_eq!(sdp.to_string(), content);
    }
}
