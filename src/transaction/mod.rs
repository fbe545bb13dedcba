use key::TransactionKey;
use std::time::Duration;

pub mod endpoint;
pub mod key;
pub mod message;
mod timer;
pub mod transaction;

pub use endpoint::{Endpoint, EndpointBuilder};
pub use transaction::Transaction;

#[cfg(test)]
mod tests;

/// A request that matched no existing transaction, handed to the user
/// agent to become a server transaction (or, for a 2xx ACK, to be routed
/// into its dialog).
pub struct IncomingRequest {
    pub request: crate::message::Request,
    pub connection: crate::transport::SipConnection,
    pub from: crate::transport::SipAddr,
}

pub const TO_TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;
pub const CNONCE_LEN: usize = 8;
pub const CALL_ID_LEN: usize = 22;

/// RFC 3261 transaction states. Client INVITE transactions start in
/// Calling; everything else starts in Trying.
///
/// ```text
/// client INVITE:     Calling -> Proceeding -> Completed -> Terminated
/// client non-INVITE: Trying -> Proceeding -> Completed -> Terminated
/// server INVITE:     Proceeding -> Completed -> Confirmed -> Terminated
/// server non-INVITE: Trying -> Proceeding -> Completed -> Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionState::Calling => "Calling",
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Confirmed => "Confirmed",
            TransactionState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionType {
    pub fn is_client(&self) -> bool {
        matches!(self, TransactionType::ClientInvite | TransactionType::ClientNonInvite)
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, TransactionType::ClientInvite | TransactionType::ServerInvite)
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionType::ClientInvite => "ClientInvite",
            TransactionType::ClientNonInvite => "ClientNonInvite",
            TransactionType::ServerInvite => "ServerInvite",
            TransactionType::ServerNonInvite => "ServerNonInvite",
        };
        f.write_str(name)
    }
}

/// Wheel entries for the RFC 3261 transaction timers. Retransmission
/// timers (A, E, G) carry their current interval for the exponential
/// backoff.
pub enum TransactionTimer {
    TimerA(TransactionKey, Duration),
    TimerB(TransactionKey),
    TimerD(TransactionKey),
    TimerE(TransactionKey, Duration),
    TimerF(TransactionKey),
    TimerG(TransactionKey, Duration),
    TimerH(TransactionKey),
    TimerI(TransactionKey),
    TimerK(TransactionKey),
    TimerCleanup(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerCleanup(key) => key,
        }
    }
}

impl std::fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTimer::TimerA(key, duration) => {
                write!(f, "TimerA: {} {}ms", key, duration.as_millis())
            }
            TransactionTimer::TimerB(key) => write!(f, "TimerB: {}", key),
            TransactionTimer::TimerD(key) => write!(f, "TimerD: {}", key),
            TransactionTimer::TimerE(key, duration) => {
                write!(f, "TimerE: {} {}ms", key, duration.as_millis())
            }
            TransactionTimer::TimerF(key) => write!(f, "TimerF: {}", key),
            TransactionTimer::TimerG(key, duration) => {
                write!(f, "TimerG: {} {}ms", key, duration.as_millis())
            }
            TransactionTimer::TimerH(key) => write!(f, "TimerH: {}", key),
            TransactionTimer::TimerI(key) => write!(f, "TimerI: {}", key),
            TransactionTimer::TimerK(key) => write!(f, "TimerK: {}", key),
            TransactionTimer::TimerCleanup(key) => write!(f, "TimerCleanup: {}", key),
        }
    }
}

pub fn make_branch() -> String {
    format!("{}{}", crate::message::BRANCH_MAGIC_COOKIE, random_text(BRANCH_LEN))
}

pub fn make_call_id(domain: Option<&str>) -> String {
    format!(
        "{}@{}",
        random_text(CALL_ID_LEN),
        domain.unwrap_or("peercall.invalid")
    )
}

pub fn make_tag() -> String {
    random_text(TO_TAG_LEN)
}

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}
