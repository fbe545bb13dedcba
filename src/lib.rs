//! A point-to-point SIP calling client: RFC 3261 signalling over TCP,
//! SDP offer/answer negotiation and ICE connectivity establishment.

pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;

pub mod config;
pub mod dialog;
pub mod error;
pub mod ice;
pub mod message;
pub mod pipeline;
pub mod sdp;
pub mod transaction;
pub mod transport;
pub mod useragent;

pub use config::Config;
pub use transaction::{Endpoint, EndpointBuilder};
pub use useragent::{CallEvent, UserAgent};
