use super::candidate::Candidate;

/// Connectivity check state of one candidate pair (RFC 8445 section
/// 6.1.2.6). `Cancelled` marks the losers of a component once another
/// pair has been nominated for it; they are never probed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

/// Which side decides nomination. The controller is the side that
/// received the SIP INVITE (the answerer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controller,
    Controllee,
}

impl IceRole {
    pub fn flip(&self) -> IceRole {
        match self {
            IceRole::Controller => IceRole::Controllee,
            IceRole::Controllee => IceRole::Controller,
        }
    }
}

/// Pair priority per RFC 8445 section 6.1.2.3, with G the controller's
/// candidate priority and D the controllee's.
pub fn pair_priority(g: u32, d: u32) -> u64 {
    let (g, d) = (g as u64, d as u64);
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    pub priority: u64,
    pub state: PairState,
    pub nominated: bool,
}

impl CandidatePair {
    pub fn new(local: Candidate, remote: Candidate, role: IceRole) -> Self {
        let (g, d) = match role {
            IceRole::Controller => (local.priority, remote.priority),
            IceRole::Controllee => (remote.priority, local.priority),
        };
        let priority = pair_priority(g, d);
        CandidatePair {
            local,
            remote,
            priority,
            state: PairState::Frozen,
            nominated: false,
        }
    }

    pub fn component(&self) -> u8 {
        self.local.component
    }

    /// Foundation pair used for the unfreezing rule.
    pub fn foundation(&self) -> (String, String) {
        (self.local.foundation.clone(), self.remote.foundation.clone())
    }
}

/// Pairs every local candidate with every remote candidate of the same
/// component, sorted by pair priority descending.
pub fn make_pairs(local: &[Candidate], remote: &[Candidate], role: IceRole) -> Vec<CandidatePair> {
    let mut pairs = Vec::new();
    for local_candidate in local {
        for remote_candidate in remote {
            if local_candidate.component == remote_candidate.component {
                pairs.push(CandidatePair::new(
                    local_candidate.clone(),
                    remote_candidate.clone(),
                    role,
                ));
            }
        }
    }
    pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
    pairs
}
