use super::candidate::Candidate;
use super::pair::{CandidatePair, IceRole};
use super::tester::{IceCredentials, IceOutcome, IceSessionTester};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type SessionId = u32;

/// What happened to a nomination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NominationDecision {
    /// A fresh run was started; the callback fires on completion.
    Started,
    /// A finished run with the identical pair set was reused; the
    /// callback already fired with its selected pairs.
    Reused,
    /// The same pair set is being tested right now; request dropped.
    AlreadyRunning,
    /// The same pair set already failed; not trying again.
    Refused,
}

enum RunState {
    Running(CancellationToken),
    Finished(Vec<CandidatePair>),
    Failed,
}

pub type NominationCallback = Box<dyn FnOnce(IceOutcome) + Send + 'static>;

/// Per-session bookkeeping of connectivity check runs, keyed by the
/// offered pair set so identical re-offers reuse earlier results instead
/// of re-probing the network.
#[derive(Clone, Default)]
pub struct NominationCoordinator {
    runs: Arc<Mutex<HashMap<(SessionId, String), RunState>>>,
}

impl NominationCoordinator {
    pub fn new() -> Self {
        NominationCoordinator {
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Order-independent fingerprint of the offered candidate sets.
    fn pair_set_key(local: &[Candidate], remote: &[Candidate]) -> String {
        let mut lines: Vec<String> = local
            .iter()
            .map(|c| format!("L {}", c))
            .chain(remote.iter().map(|c| format!("R {}", c)))
            .collect();
        lines.sort();
        lines.join("\n")
    }

    /// Requests a nomination run. The callback is invoked exactly once
    /// for started and reused runs; ignored and refused requests never
    /// call it.
    pub fn request_nomination(
        &self,
        session_id: SessionId,
        role: IceRole,
        credentials: IceCredentials,
        local: Vec<Candidate>,
        remote: Vec<Candidate>,
        callback: NominationCallback,
    ) -> NominationDecision {
        let key = (session_id, Self::pair_set_key(&local, &remote));
        let cancel_token = CancellationToken::new();
        {
            let mut runs = self.runs.lock().unwrap();
            match runs.get(&key) {
                Some(RunState::Finished(selected)) => {
                    info!("session {} reusing finished nomination", session_id);
                    let selected = selected.clone();
                    drop(runs);
                    callback(IceOutcome::Success(selected));
                    return NominationDecision::Reused;
                }
                Some(RunState::Running(_)) => {
                    debug!("session {} nomination already running", session_id);
                    return NominationDecision::AlreadyRunning;
                }
                Some(RunState::Failed) => {
                    warn!(
                        "session {} refusing to re-run a failed pair set",
                        session_id
                    );
                    return NominationDecision::Refused;
                }
                None => {
                    runs.insert(key.clone(), RunState::Running(cancel_token.clone()));
                }
            }
        }

        let runs = self.runs.clone();
        tokio::spawn(async move {
            let tester = IceSessionTester::new(role, credentials, cancel_token);
            let outcome = tester.run(&local, &remote).await;
            {
                let mut runs = runs.lock().unwrap();
                match &outcome {
                    IceOutcome::Success(selected) => {
                        runs.insert(key, RunState::Finished(selected.clone()));
                    }
                    IceOutcome::Failure(reason) => {
                        debug!("nomination failed: {}", reason);
                        runs.insert(key, RunState::Failed);
                    }
                }
            }
            // success feeds straight back into the negotiation
            callback(outcome);
        });
        NominationDecision::Started
    }

    /// Cancels any running testers of the session and forgets its cache.
    pub fn cleanup_session(&self, session_id: SessionId) {
        let mut runs = self.runs.lock().unwrap();
        runs.retain(|(id, _), state| {
            if *id == session_id {
                if let RunState::Running(cancel_token) = state {
                    cancel_token.cancel();
                }
                false
            } else {
                true
            }
        });
    }

    /// Selected pairs of a finished run, when one exists for the session.
    pub fn nominated(&self, session_id: SessionId) -> Option<Vec<CandidatePair>> {
        let runs = self.runs.lock().unwrap();
        runs.iter().find_map(|((id, _), state)| match state {
            RunState::Finished(selected) if *id == session_id => Some(selected.clone()),
            _ => None,
        })
    }
}
