use crate::message::{ContentKind, Method, Request, Response, StatusCode};
use crate::sdp::parse::parse_sdp;
use crate::transaction::message::make_response;
use crate::Result;
use tracing::{debug, warn};

/// What a processor decided about a message.
pub enum ProcessorAction {
    /// Pass the (possibly modified) message to the next processor.
    Continue,
    /// Short-circuit with a locally generated response; the message does
    /// not travel further up.
    Respond(Response),
    /// Swallow the message entirely.
    Absorb,
}

/// One stage of the message pipeline. Implementations see outgoing and
/// incoming requests and responses in turn and may mutate them, answer
/// them locally or drop them. Default behavior is pass-through.
pub trait Processor: Send {
    fn name(&self) -> &'static str;

    fn outgoing_request(&mut self, _request: &mut Request) -> Result<ProcessorAction> {
        Ok(ProcessorAction::Continue)
    }

    fn outgoing_response(&mut self, _response: &mut Response) -> Result<ProcessorAction> {
        Ok(ProcessorAction::Continue)
    }

    fn incoming_request(&mut self, _request: &mut Request) -> Result<ProcessorAction> {
        Ok(ProcessorAction::Continue)
    }

    fn incoming_response(&mut self, _response: &mut Response) -> Result<ProcessorAction> {
        Ok(ProcessorAction::Continue)
    }
}

/// Result of pushing a message through the whole chain.
pub enum PipelineVerdict {
    /// Deliver the message to the layer above (or the wire, outgoing).
    Deliver,
    /// A processor answered locally; send this response instead.
    Respond(Response),
    /// A processor swallowed the message.
    Absorbed,
}

/// A linear chain of processors, transport end first. Incoming messages
/// traverse the chain in order; outgoing messages traverse it reversed.
#[derive(Default)]
pub struct Pipeline {
    processors: Vec<Box<dyn Processor>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            processors: Vec::new(),
        }
    }

    pub fn push(&mut self, processor: Box<dyn Processor>) -> &mut Self {
        self.processors.push(processor);
        self
    }

    pub fn incoming_request(&mut self, request: &mut Request) -> Result<PipelineVerdict> {
        for processor in self.processors.iter_mut() {
            match processor.incoming_request(request)? {
                ProcessorAction::Continue => {}
                ProcessorAction::Respond(response) => {
                    debug!("{} answered incoming {} locally", processor.name(), request.method);
                    return Ok(PipelineVerdict::Respond(response));
                }
                ProcessorAction::Absorb => return Ok(PipelineVerdict::Absorbed),
            }
        }
        Ok(PipelineVerdict::Deliver)
    }

    pub fn incoming_response(&mut self, response: &mut Response) -> Result<PipelineVerdict> {
        for processor in self.processors.iter_mut() {
            match processor.incoming_response(response)? {
                ProcessorAction::Continue => {}
                ProcessorAction::Respond(_) => {
                    warn!("{} cannot respond to a response", processor.name());
                }
                ProcessorAction::Absorb => return Ok(PipelineVerdict::Absorbed),
            }
        }
        Ok(PipelineVerdict::Deliver)
    }

    pub fn outgoing_request(&mut self, request: &mut Request) -> Result<PipelineVerdict> {
        for processor in self.processors.iter_mut().rev() {
            match processor.outgoing_request(request)? {
                ProcessorAction::Continue => {}
                ProcessorAction::Respond(response) => return Ok(PipelineVerdict::Respond(response)),
                ProcessorAction::Absorb => return Ok(PipelineVerdict::Absorbed),
            }
        }
        Ok(PipelineVerdict::Deliver)
    }

    pub fn outgoing_response(&mut self, response: &mut Response) -> Result<PipelineVerdict> {
        for processor in self.processors.iter_mut().rev() {
            match processor.outgoing_response(response)? {
                ProcessorAction::Continue => {}
                ProcessorAction::Respond(_) => {
                    warn!("{} cannot replace an outgoing response", processor.name());
                }
                ProcessorAction::Absorb => return Ok(PipelineVerdict::Absorbed),
            }
        }
        Ok(PipelineVerdict::Deliver)
    }
}

/// Request routing touches every outgoing request: the request URI gets
/// `transport=tcp` and defaults are filled in.
pub struct RoutingProcessor {
    user_agent: String,
}

impl RoutingProcessor {
    pub fn new(user_agent: impl Into<String>) -> Self {
        RoutingProcessor {
            user_agent: user_agent.into(),
        }
    }
}

impl Processor for RoutingProcessor {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn outgoing_request(&mut self, request: &mut Request) -> Result<ProcessorAction> {
        request.uri.ensure_tcp_transport();
        if request.header.max_forwards.is_none() {
            request.header.max_forwards = Some(70);
        }
        if request.header.user_agent.is_none() {
            request.header.user_agent = Some(self.user_agent.clone());
        }
        Ok(ProcessorAction::Continue)
    }
}

/// Answers out-of-dialog OPTIONS locally with our capability set.
pub struct OptionsProcessor;

impl Processor for OptionsProcessor {
    fn name(&self) -> &'static str {
        "options"
    }

    fn incoming_request(&mut self, request: &mut Request) -> Result<ProcessorAction> {
        if request.method != Method::Options || request.header.to_tag().is_some() {
            return Ok(ProcessorAction::Continue);
        }
        let mut response = make_response(request, StatusCode::OK, None);
        response.header.allow = vec![
            Method::Invite,
            Method::Ack,
            Method::Cancel,
            Method::Bye,
            Method::Options,
            Method::Register,
        ];
        response.header.accept = vec!["application/sdp".to_string()];
        Ok(ProcessorAction::Respond(response))
    }
}

/// Validates SDP bodies at the pipeline boundary: a request carrying a
/// body we cannot parse is answered 488 before it reaches the dialogs.
pub struct SdpBodyProcessor;

impl Processor for SdpBodyProcessor {
    fn name(&self) -> &'static str {
        "sdp-body"
    }

    fn incoming_request(&mut self, request: &mut Request) -> Result<ProcessorAction> {
        if request.header.content_type != ContentKind::Sdp || request.body.is_empty() {
            return Ok(ProcessorAction::Continue);
        }
        let body = String::from_utf8_lossy(&request.body);
        if let Err(e) = parse_sdp(&body) {
            warn!("rejecting request with malformed SDP: {}", e);
            return Ok(ProcessorAction::Respond(make_response(
                request,
                StatusCode::NOT_ACCEPTABLE_HERE,
                None,
            )));
        }
        Ok(ProcessorAction::Continue)
    }

    fn incoming_response(&mut self, response: &mut Response) -> Result<ProcessorAction> {
        if response.header.content_type != ContentKind::Sdp || response.body.is_empty() {
            return Ok(ProcessorAction::Continue);
        }
        let body = String::from_utf8_lossy(&response.body);
        if let Err(e) = parse_sdp(&body) {
            warn!("dropping response with malformed SDP: {}", e);
            return Ok(ProcessorAction::Absorb);
        }
        Ok(ProcessorAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SipMessage, Uri};

    fn options_request() -> Request {
        let text = "OPTIONS sip:bob@example.test SIP/2.0\r\n\
            Via: SIP/2.0/TCP 192.0.2.10:5060;branch=z9hG4bKopt1\r\n\
            Max-Forwards: 70\r\n\
            From: <sip:alice@example.test>;tag=8s7dfs\r\n\
            To: <sip:bob@example.test>\r\n\
            Call-ID: pipeline@192.0.2.10\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Length: 0\r\n\r\n";
        match SipMessage::try_from(text.as_bytes()).unwrap() {
            SipMessage::Request(req) => req,
            _ => unreachable!(),
        }
    }

    fn chain() -> Pipeline {
        let mut pipeline = Pipeline::new();
        pipeline
            .push(Box::new(RoutingProcessor::new("peercall/test")))
            .push(Box::new(OptionsProcessor))
            .push(Box::new(SdpBodyProcessor));
        pipeline
    }

    #[test]
    fn test_options_short_circuits() {
        let mut pipeline = chain();
        let mut request = options_request();
        match pipeline.incoming_request(&mut request).unwrap() {
            PipelineVerdict::Respond(response) => {
                assert_eq!(response.status, StatusCode::OK);
                assert!(response.header.allow.contains(&Method::Invite));
            }
            _ => panic!("OPTIONS must be answered locally"),
        }
    }

    #[test]
    fn test_outgoing_request_gains_transport_param() {
        let mut pipeline = chain();
        let mut request = Request::new(Method::Invite, Uri::parse("sip:bob@example.test").unwrap());
        match pipeline.outgoing_request(&mut request).unwrap() {
            PipelineVerdict::Deliver => {}
            _ => panic!("outgoing request must pass through"),
        }
        assert_eq!(
            request.uri.param("transport").unwrap().value.as_deref(),
            Some("tcp")
        );
        assert_eq!(request.header.max_forwards, Some(70));
        assert!(request.header.user_agent.is_some());
    }

    #[test]
    fn test_malformed_sdp_body_rejected() {
        let mut pipeline = chain();
        let mut request = options_request();
        request.method = Method::Invite;
        request.header.cseq = Some(crate::message::header::CSeq::new(1, Method::Invite));
        request.header.content_type = ContentKind::Sdp;
        request.body = b"o=missing version line\r\n".to_vec();
        match pipeline.incoming_request(&mut request).unwrap() {
            PipelineVerdict::Respond(response) => {
                assert_eq!(response.status, StatusCode::NOT_ACCEPTABLE_HERE);
            }
            _ => panic!("malformed SDP must be rejected"),
        }
    }
}
