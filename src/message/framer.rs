use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::field::MAX_HEADER_LINES;
use super::SipMessage;

/// Upper bound on messages drained from the buffer per call to
/// [`MessageFramer::drain`], so one read cannot starve the loop.
pub const MAX_MESSAGES_PER_DRAIN: usize = 20;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// One framed SIP message: the raw header block (terminated by CRLFCRLF)
/// and exactly Content-Length body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

/// Splits a continuous TCP byte stream into whole SIP messages using the
/// Content-Length field. Partial messages stay buffered until the rest of
/// the bytes arrive.
#[derive(Debug, Default)]
pub struct MessageFramer;

impl MessageFramer {
    pub fn new() -> Self {
        MessageFramer
    }

    /// Decodes up to [`MAX_MESSAGES_PER_DRAIN`] messages from the buffer.
    pub fn drain(&mut self, buffer: &mut BytesMut) -> Result<Vec<RawMessage>> {
        let mut messages = Vec::new();
        while messages.len() < MAX_MESSAGES_PER_DRAIN {
            match self.decode(buffer)? {
                Some(message) => messages.push(message),
                None => break,
            }
        }
        Ok(messages)
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Scans the header region for a Content-Length line (full or compact
/// form, case insensitive). Absence means a body length of zero; a
/// negative value is a peer error that fails the connection.
fn parse_content_length(header: &[u8]) -> Result<usize> {
    let text = String::from_utf8_lossy(header);
    let mut line_count = 0usize;
    let mut content_length = 0usize;
    for line in text.split("\r\n") {
        line_count += 1;
        if line_count > MAX_HEADER_LINES {
            return Err(Error::MessageError(format!(
                "header exceeds {} lines",
                MAX_HEADER_LINES
            )));
        }
        let (name, value) = match line.split_once(':') {
            Some(parts) => parts,
            None => continue,
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            let value: i64 = value
                .trim()
                .parse()
                .map_err(|_| Error::MessageError(format!("bad Content-Length: {}", value.trim())))?;
            if value < 0 {
                return Err(Error::MessageError(
                    "peer sent negative Content-Length".to_string(),
                ));
            }
            content_length = value as usize;
        }
    }
    Ok(content_length)
}

impl Decoder for MessageFramer {
    type Item = RawMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawMessage>> {
        let header_end = match find_header_end(src) {
            Some(end) => end,
            None => return Ok(None),
        };

        let body_length = parse_content_length(&src[..header_end])?;
        if src.len() < header_end + body_length {
            return Ok(None);
        }

        let header = src[..header_end].to_vec();
        src.advance(header_end);
        let body = src[..body_length].to_vec();
        src.advance(body_length);
        Ok(Some(RawMessage { header, body }))
    }
}

impl Encoder<SipMessage> for MessageFramer {
    type Error = Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}
