use crate::dialog::dialog::Dialog;
use crate::ice::candidate::Candidate;
use crate::ice::coordinator::SessionId;
use crate::ice::pair::CandidatePair;
use crate::ice::tester::IceCredentials;
use crate::sdp::{NegotiationState, SdpNegotiation, SdpSession};
use crate::transaction::transaction::{TransactionEvent, TransactionEventSender};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One call: negotiation state, gathered candidates, ICE credentials and
/// the dialog, created with the first INVITE in either direction and
/// destroyed when the dialog ends.
pub struct Session {
    id: SessionId,
    negotiation: Mutex<Option<SdpNegotiation>>,
    credentials: Mutex<IceCredentials>,
    media_candidates: Mutex<Vec<Vec<Candidate>>>,
    dialog: Mutex<Option<Dialog>>,
    invite_events: Mutex<Option<TransactionEventSender>>,
    nominated: Mutex<Vec<CandidatePair>>,
    media_ready: AtomicBool,
}

impl Session {
    pub fn new(id: SessionId, credentials: IceCredentials) -> Self {
        Session {
            id,
            negotiation: Mutex::new(None),
            credentials: Mutex::new(credentials),
            media_candidates: Mutex::new(Vec::new()),
            dialog: Mutex::new(None),
            invite_events: Mutex::new(None),
            nominated: Mutex::new(Vec::new()),
            media_ready: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn credentials(&self) -> IceCredentials {
        self.credentials.lock().unwrap().clone()
    }

    pub fn set_negotiation(&self, negotiation: SdpNegotiation) {
        *self.negotiation.lock().unwrap() = Some(negotiation);
    }

    pub fn set_media_candidates(&self, candidates: Vec<Vec<Candidate>>) {
        *self.media_candidates.lock().unwrap() = candidates;
    }

    pub fn media_candidates(&self) -> Vec<Vec<Candidate>> {
        self.media_candidates.lock().unwrap().clone()
    }

    pub fn set_dialog(&self, dialog: Dialog) {
        *self.dialog.lock().unwrap() = Some(dialog);
    }

    pub fn dialog(&self) -> Option<Dialog> {
        self.dialog.lock().unwrap().clone()
    }

    pub fn set_invite_events(&self, sender: TransactionEventSender) {
        *self.invite_events.lock().unwrap() = Some(sender);
    }

    /// Asks the pending INVITE transaction to CANCEL; deferred inside
    /// the transaction until a provisional response permits it.
    pub fn request_cancel(&self) {
        if let Some(sender) = self.invite_events.lock().unwrap().as_ref() {
            sender.send(TransactionEvent::RequestCancel).ok();
        }
    }

    pub fn negotiation_state(&self) -> Option<NegotiationState> {
        self.negotiation.lock().unwrap().as_ref().map(|n| n.state())
    }

    pub fn local_sdp(&self) -> Result<SdpSession> {
        self.negotiation
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|n| n.local_sdp().cloned())
            .ok_or_else(|| Error::NegotiationError("no local SDP yet".to_string()))
    }

    /// Caller side: validate the answer from the 200 OK and learn the
    /// peer's ICE credentials from it.
    pub fn accept_answer(&self, remote: &SdpSession) -> Result<()> {
        self.learn_remote_credentials(remote)?;
        let mut negotiation = self.negotiation.lock().unwrap();
        let negotiation = negotiation
            .as_mut()
            .ok_or_else(|| Error::NegotiationError("no negotiation".to_string()))?;
        negotiation.process_answer(remote.clone())
    }

    /// Callee side: our answer went out with the 200 OK.
    pub fn answer_delivered(&self) {
        if let Some(negotiation) = self.negotiation.lock().unwrap().as_mut() {
            negotiation.answer_delivered();
        }
    }

    fn learn_remote_credentials(&self, remote: &SdpSession) -> Result<()> {
        let ufrag = remote
            .ice_ufrag()
            .ok_or_else(|| Error::NegotiationError("remote SDP without ice-ufrag".to_string()))?;
        let pwd = remote
            .ice_pwd()
            .ok_or_else(|| Error::NegotiationError("remote SDP without ice-pwd".to_string()))?;
        let mut credentials = self.credentials.lock().unwrap();
        credentials.remote_ufrag = ufrag.to_string();
        credentials.remote_pwd = pwd.to_string();
        Ok(())
    }

    pub fn media_count(&self) -> usize {
        self.media_candidates.lock().unwrap().len()
    }

    /// Inputs for one medium's ICE run: its own candidates on both
    /// sides plus the full credential set. Each medium's components are
    /// checked independently.
    pub fn ice_inputs_for_media(
        &self,
        media_index: usize,
    ) -> Result<(Vec<Candidate>, Vec<Candidate>, IceCredentials)> {
        let remote_sdp = self
            .negotiation
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|n| n.remote_sdp().cloned())
            .ok_or_else(|| Error::NegotiationError("no remote SDP".to_string()))?;
        self.learn_remote_credentials(&remote_sdp)?;

        let remote: Vec<Candidate> = match remote_sdp.media.get(media_index) {
            Some(media) if !media.candidates.is_empty() => media.candidates.clone(),
            // some stacks put every candidate line at session level
            _ => remote_sdp.candidates.clone(),
        };
        let local = self
            .media_candidates
            .lock()
            .unwrap()
            .get(media_index)
            .cloned()
            .unwrap_or_default();
        if local.is_empty() || remote.is_empty() {
            return Err(Error::IceError(format!(
                "no candidates to pair for media {}",
                media_index
            )));
        }
        Ok((local, remote, self.credentials()))
    }

    /// Records one medium's nominated pairs. Once every medium has
    /// finished, both SDP snapshots are rewritten exactly once and
    /// returned.
    pub fn complete_media_ice(
        &self,
        selected: &[CandidatePair],
    ) -> Result<Option<(SdpSession, SdpSession)>> {
        let all_done = {
            let mut nominated = self.nominated.lock().unwrap();
            nominated.extend(selected.iter().cloned());
            let components_done = nominated.len();
            components_done
                >= self.media_count() * crate::ice::candidate::COMPONENTS_PER_MEDIA as usize
        };
        if !all_done {
            return Ok(None);
        }
        if self.media_ready.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let nominated = self.nominated.lock().unwrap().clone();
        let mut negotiation = self.negotiation.lock().unwrap();
        let negotiation = negotiation
            .as_mut()
            .ok_or_else(|| Error::NegotiationError("no negotiation".to_string()))?;
        negotiation.on_ice_complete(&nominated).map(Some)
    }
}
