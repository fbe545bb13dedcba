pub mod candidate;
pub mod coordinator;
pub mod gatherer;
pub mod pair;
pub mod stun;
pub mod tester;

pub use candidate::{Candidate, CandidateKind};
pub use coordinator::{NominationCoordinator, NominationDecision, SessionId};
pub use gatherer::{CandidateGatherer, PortPool};
pub use pair::{CandidatePair, IceRole, PairState};
pub use tester::{IceCredentials, IceOutcome, IceSessionTester};

#[cfg(test)]
mod tests;
