pub mod channel;
pub mod connection;
pub mod sip_addr;
pub mod tcp;
pub mod transport_layer;

pub use connection::{SipConnection, TransportEvent, TransportReceiver, TransportSender};
pub use sip_addr::SipAddr;
pub use transport_layer::TransportLayer;

#[cfg(test)]
mod tests;
