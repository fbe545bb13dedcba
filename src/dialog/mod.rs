use crate::message::{Request, Response};
use crate::{Error, Result};

pub mod authenticate;
pub mod dialog;
pub mod dialog_layer;
pub mod registration;

pub use dialog::{Dialog, DialogState, DialogStateReceiver, DialogStateSender, TerminatedReason};
pub use dialog_layer::DialogLayer;
pub use registration::Registration;

#[cfg(test)]
mod tests;

/// Dialog identifier: Call-ID plus the two tags (RFC 3261 section 12).
/// `local_tag`/`remote_tag` are relative to this endpoint, so the same
/// wire dialog has mirrored ids on the two sides. The remote tag is
/// empty while the dialog is still early.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    /// Id from an incoming request: the peer's From tag is our remote
    /// tag, the To tag (if any) is ours.
    pub fn from_incoming_request(request: &Request) -> Result<DialogId> {
        let call_id = request
            .header
            .call_id
            .clone()
            .ok_or_else(|| Error::MessageError("request without Call-ID".to_string()))?;
        Ok(DialogId {
            call_id,
            local_tag: request.header.to_tag().unwrap_or_default().to_string(),
            remote_tag: request.header.from_tag().unwrap_or_default().to_string(),
        })
    }

    /// Id from a response to a request we sent: From is ours, To is the
    /// peer's.
    pub fn from_response(response: &Response) -> Result<DialogId> {
        let call_id = response
            .header
            .call_id
            .clone()
            .ok_or_else(|| Error::MessageError("response without Call-ID".to_string()))?;
        Ok(DialogId {
            call_id,
            local_tag: response.header.from_tag().unwrap_or_default().to_string(),
            remote_tag: response.header.to_tag().unwrap_or_default().to_string(),
        })
    }

    pub fn is_early(&self) -> bool {
        self.remote_tag.is_empty()
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.local_tag, self.remote_tag)
    }
}
