use super::candidate::{Candidate, CandidateKind};
use super::pair::{make_pairs, CandidatePair, IceRole, PairState};
use super::stun::{
    check_username, make_transaction_id, MessageKind, StunAttribute, StunMessage,
    ERROR_ROLE_CONFLICT,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Connectivity check retransmission schedule: RTO starts at 500 ms and
/// doubles up to 8 s, at most 7 transmissions.
const CHECK_RTO: Duration = Duration::from_millis(500);
const CHECK_RTO_CAP: Duration = Duration::from_secs(8);
const CHECK_MAX_TRANSMISSIONS: u32 = 7;

/// Hard session deadlines; the controller gives up sooner.
pub const CONTROLLER_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONTROLLEE_TIMEOUT: Duration = Duration::from_secs(20);

/// Upper bound on concurrently probing check workers.
const MAX_CHECK_WORKERS: usize = 32;

/// Grace given to in-flight sockets when the session is cancelled.
const CANCEL_GRACE: Duration = Duration::from_millis(50);

/// Short-term credentials from the SDP exchange.
#[derive(Debug, Clone)]
pub struct IceCredentials {
    pub local_ufrag: String,
    pub local_pwd: String,
    pub remote_ufrag: String,
    pub remote_pwd: String,
}

#[derive(Debug)]
pub enum IceOutcome {
    Success(Vec<CandidatePair>),
    Failure(String),
}

enum SessionEvent {
    /// Datagram arrived on one of our check sockets.
    Incoming {
        local_base: SocketAddr,
        source: SocketAddr,
        data: Vec<u8>,
    },
    /// A check worker finished.
    CheckDone {
        pair_index: usize,
        nominating: bool,
        result: CheckResult,
    },
}

enum CheckResult {
    /// Response arrived and its source matched (or revealed) a peer.
    Succeeded { source: SocketAddr },
    RoleConflict,
    TimedOut,
}

/// Runs connectivity checks and nomination for one session
/// (RFC 8445 sections 6 and 7). The tester owns its check workers; the
/// run returns only after they are joined or cancelled.
pub struct IceSessionTester {
    role: IceRole,
    tiebreaker: u64,
    credentials: IceCredentials,
    cancel_token: CancellationToken,
}

struct SessionState {
    role: IceRole,
    pairs: Vec<CandidatePair>,
    /// Components that still need a selected pair.
    components: Vec<u8>,
    selected: HashMap<u8, usize>,
    in_flight: usize,
    nomination_in_flight: HashSet<u8>,
}

impl IceSessionTester {
    pub fn new(role: IceRole, credentials: IceCredentials, cancel_token: CancellationToken) -> Self {
        IceSessionTester {
            role,
            tiebreaker: rand::random(),
            credentials,
            cancel_token,
        }
    }

    pub fn role(&self) -> IceRole {
        self.role
    }

    /// Forms the check list from the candidate sets and drives it to an
    /// outcome: every component selected, the session deadline passed,
    /// or cancellation.
    pub async fn run(&self, local: &[Candidate], remote: &[Candidate]) -> IceOutcome {
        let pairs = make_pairs(local, remote, self.role);
        if pairs.is_empty() {
            return IceOutcome::Failure("no candidate pairs".to_string());
        }
        let timeout = match self.role {
            IceRole::Controller => CONTROLLER_TIMEOUT,
            IceRole::Controllee => CONTROLLEE_TIMEOUT,
        };
        // workers and socket readers hang off a child token so finishing
        // the checklist can stop them without tripping the session token
        let work_token = self.cancel_token.child_token();
        let outcome = select! {
            biased;
            outcome = self.run_checklist(pairs, &work_token) => outcome,
            _ = tokio::time::sleep(timeout) => {
                IceOutcome::Failure("session timeout".to_string())
            }
            _ = self.cancel_token.cancelled() => {
                IceOutcome::Failure("cancelled".to_string())
            }
        };
        work_token.cancel();
        if matches!(outcome, IceOutcome::Failure(_)) {
            // drain in-flight sockets before reporting failure
            tokio::time::sleep(CANCEL_GRACE).await;
        }
        outcome
    }

    async fn run_checklist(
        &self,
        mut pairs: Vec<CandidatePair>,
        work_token: &CancellationToken,
    ) -> IceOutcome {
        // one socket per distinct local base
        let mut sockets: HashMap<SocketAddr, Arc<UdpSocket>> = HashMap::new();
        for pair in &pairs {
            let base = pair.local.base_addr();
            if sockets.contains_key(&base) {
                continue;
            }
            match UdpSocket::bind(base).await {
                Ok(socket) => {
                    sockets.insert(base, Arc::new(socket));
                }
                Err(e) => {
                    warn!("cannot bind check socket {}: {}", base, e);
                }
            }
        }
        if sockets.is_empty() {
            return IceOutcome::Failure("no check sockets".to_string());
        }

        let (event_sender, mut event_receiver) = unbounded_channel();
        for (base, socket) in &sockets {
            spawn_socket_reader(
                *base,
                socket.clone(),
                event_sender.clone(),
                work_token.clone(),
            );
        }

        // initial unfreezing: the highest priority pair of every
        // (component, foundation) group goes Waiting
        let mut unfrozen: HashSet<(u8, (String, String))> = HashSet::new();
        for pair in pairs.iter_mut() {
            let group = (pair.component(), pair.foundation());
            if unfrozen.insert(group) {
                pair.state = PairState::Waiting;
            }
        }

        let mut components: Vec<u8> = pairs.iter().map(|p| p.component()).collect();
        components.sort_unstable();
        components.dedup();

        let mut state = SessionState {
            role: self.role,
            pairs,
            components,
            selected: HashMap::new(),
            in_flight: 0,
            nomination_in_flight: HashSet::new(),
        };
        let workers = Arc::new(Semaphore::new(MAX_CHECK_WORKERS));
        let response_routes: ResponseRoutes = Arc::new(Mutex::new(HashMap::new()));

        loop {
            self.launch_ready_checks(
                &mut state,
                &sockets,
                &workers,
                &response_routes,
                &event_sender,
                work_token,
            );

            if let Some(outcome) = self.conclude(&mut state) {
                return outcome;
            }

            let event = match event_receiver.recv().await {
                Some(event) => event,
                None => return IceOutcome::Failure("check sockets closed".to_string()),
            };
            match event {
                SessionEvent::Incoming {
                    local_base,
                    source,
                    data,
                } => {
                    self.on_incoming(&mut state, &sockets, &response_routes, local_base, source, &data)
                        .await;
                }
                SessionEvent::CheckDone {
                    pair_index,
                    nominating,
                    result,
                } => {
                    state.in_flight -= 1;
                    self.on_check_done(&mut state, pair_index, nominating, result);
                }
            }
        }
    }

    /// Starts a worker for every Waiting pair, highest priority first,
    /// and kicks off nominations once a component has a success.
    fn launch_ready_checks(
        &self,
        state: &mut SessionState,
        sockets: &HashMap<SocketAddr, Arc<UdpSocket>>,
        workers: &Arc<Semaphore>,
        routes: &ResponseRoutes,
        events: &UnboundedSender<SessionEvent>,
        work_token: &CancellationToken,
    ) {
        // ordinary checks; components that already nominated launch
        // nothing further
        let mut indices: Vec<usize> = (0..state.pairs.len())
            .filter(|&i| {
                state.pairs[i].state == PairState::Waiting
                    && !state.selected.contains_key(&state.pairs[i].component())
            })
            .collect();
        indices.sort_by(|&a, &b| state.pairs[b].priority.cmp(&state.pairs[a].priority));
        for index in indices {
            let base = state.pairs[index].local.base_addr();
            let socket = match sockets.get(&base) {
                Some(socket) => socket.clone(),
                None => {
                    state.pairs[index].state = PairState::Failed;
                    continue;
                }
            };
            state.pairs[index].state = PairState::InProgress;
            state.in_flight += 1;
            self.spawn_check(state, index, false, socket, workers, routes, events, work_token);
        }

        // nomination: the controller picks the best succeeded pair per
        // unselected component and re-checks it with USE-CANDIDATE
        if state.role == IceRole::Controller {
            let components: Vec<u8> = state.components.clone();
            for component in components {
                if state.selected.contains_key(&component)
                    || state.nomination_in_flight.contains(&component)
                {
                    continue;
                }
                let best = (0..state.pairs.len())
                    .filter(|&i| {
                        state.pairs[i].component() == component
                            && state.pairs[i].state == PairState::Succeeded
                    })
                    .max_by_key(|&i| state.pairs[i].priority);
                if let Some(index) = best {
                    let base = state.pairs[index].local.base_addr();
                    if let Some(socket) = sockets.get(&base) {
                        state.nomination_in_flight.insert(component);
                        state.in_flight += 1;
                        self.spawn_check(
                            state,
                            index,
                            true,
                            socket.clone(),
                            workers,
                            routes,
                            events,
                            work_token,
                        );
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_check(
        &self,
        state: &SessionState,
        pair_index: usize,
        nominating: bool,
        socket: Arc<UdpSocket>,
        workers: &Arc<Semaphore>,
        routes: &ResponseRoutes,
        events: &UnboundedSender<SessionEvent>,
        work_token: &CancellationToken,
    ) {
        let pair = &state.pairs[pair_index];
        let destination = pair.remote.socket_addr();
        let username = check_username(&self.credentials.remote_ufrag, &self.credentials.local_ufrag);
        // advertise the priority a peer-reflexive candidate would get
        let prflx_priority = super::candidate::candidate_priority(
            CandidateKind::PeerReflexive,
            65535,
            pair.component(),
        );
        let mut request = StunMessage::binding_request(make_transaction_id())
            .with_attribute(StunAttribute::Username(username))
            .with_attribute(StunAttribute::Priority(prflx_priority));
        request = match state.role {
            IceRole::Controller => {
                let mut message =
                    request.with_attribute(StunAttribute::IceControlling(self.tiebreaker));
                if nominating {
                    message = message.with_attribute(StunAttribute::UseCandidate);
                }
                message
            }
            IceRole::Controllee => {
                request.with_attribute(StunAttribute::IceControlled(self.tiebreaker))
            }
        };
        let payload = request.encode(Some(self.credentials.remote_pwd.as_bytes()));
        let transaction_id = request.transaction_id;

        let (response_sender, response_receiver) = unbounded_channel();
        routes
            .lock()
            .unwrap()
            .insert(transaction_id, response_sender);

        let workers = workers.clone();
        let routes = routes.clone();
        let events = events.clone();
        let cancel_token = work_token.clone();
        trace!(
            "check {} -> {} (nominating: {})",
            socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            destination,
            nominating
        );
        tokio::spawn(async move {
            let _permit = workers.acquire().await;
            let result = run_check(
                socket,
                destination,
                payload,
                response_receiver,
                cancel_token,
            )
            .await;
            routes.lock().unwrap().remove(&transaction_id);
            events
                .send(SessionEvent::CheckDone {
                    pair_index,
                    nominating,
                    result,
                })
                .ok();
        });
    }

    fn on_check_done(
        &self,
        state: &mut SessionState,
        pair_index: usize,
        nominating: bool,
        result: CheckResult,
    ) {
        let component = state.pairs[pair_index].component();
        if nominating {
            state.nomination_in_flight.remove(&component);
        }
        // the component nominated someone else while this check was in
        // flight; the outcome no longer matters
        if state.pairs[pair_index].state == PairState::Cancelled {
            return;
        }
        match result {
            CheckResult::Succeeded { source } => {
                let expected = state.pairs[pair_index].remote.socket_addr();
                let succeeded_index = if source == expected {
                    pair_index
                } else {
                    // response from an address we never offered: build a
                    // peer-reflexive candidate and pair it
                    debug!("peer reflexive remote discovered: {}", source);
                    let mut remote = state.pairs[pair_index].remote.clone();
                    remote.kind = CandidateKind::PeerReflexive;
                    remote.address = source.ip();
                    remote.port = source.port();
                    remote.priority = super::candidate::candidate_priority(
                        CandidateKind::PeerReflexive,
                        65535,
                        component,
                    );
                    remote.rel_address = None;
                    remote.rel_port = None;
                    let pair =
                        CandidatePair::new(state.pairs[pair_index].local.clone(), remote, state.role);
                    state.pairs.push(pair);
                    state.pairs.len() - 1
                };
                state.pairs[succeeded_index].state = PairState::Succeeded;
                if nominating {
                    state.pairs[succeeded_index].nominated = true;
                    state.selected.insert(component, succeeded_index);
                    cancel_other_pairs(state, component, succeeded_index);
                    info!(
                        "component {} nominated: {} -> {}",
                        component,
                        state.pairs[succeeded_index].local.socket_addr(),
                        state.pairs[succeeded_index].remote.socket_addr()
                    );
                }
                self.unfreeze_foundation(state, succeeded_index);
            }
            CheckResult::RoleConflict => {
                warn!("role conflict, switching from {:?}", state.role);
                state.role = state.role.flip();
                for pair in state.pairs.iter_mut() {
                    let (g, d) = match state.role {
                        IceRole::Controller => (pair.local.priority, pair.remote.priority),
                        IceRole::Controllee => (pair.remote.priority, pair.local.priority),
                    };
                    pair.priority = super::pair::pair_priority(g, d);
                }
                state.pairs[pair_index].state = PairState::Waiting;
            }
            CheckResult::TimedOut => {
                state.pairs[pair_index].state = PairState::Failed;
            }
        }
    }

    /// Successful checks thaw Frozen pairs that share a foundation.
    fn unfreeze_foundation(&self, state: &mut SessionState, succeeded_index: usize) {
        let foundation = state.pairs[succeeded_index].foundation();
        for pair in state.pairs.iter_mut() {
            if pair.state == PairState::Frozen && pair.foundation() == foundation {
                pair.state = PairState::Waiting;
            }
        }
    }

    async fn on_incoming(
        &self,
        state: &mut SessionState,
        sockets: &HashMap<SocketAddr, Arc<UdpSocket>>,
        routes: &ResponseRoutes,
        local_base: SocketAddr,
        source: SocketAddr,
        data: &[u8],
    ) {
        let message = match StunMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                trace!("non-STUN datagram from {}: {}", source, e);
                return;
            }
        };
        match message.kind {
            MessageKind::BindingRequest => {
                self.on_binding_request(state, sockets, local_base, source, data, message)
                    .await;
            }
            MessageKind::BindingResponse | MessageKind::BindingErrorResponse => {
                let route = routes.lock().unwrap().get(&message.transaction_id).cloned();
                match route {
                    Some(sender) => {
                        sender.send((message, source)).ok();
                    }
                    None => trace!("response for unknown check from {}", source),
                }
            }
        }
    }

    /// Answers a peer's connectivity check, resolving role conflicts by
    /// tiebreaker and honoring USE-CANDIDATE nominations.
    async fn on_binding_request(
        &self,
        state: &mut SessionState,
        sockets: &HashMap<SocketAddr, Arc<UdpSocket>>,
        local_base: SocketAddr,
        source: SocketAddr,
        raw: &[u8],
        message: StunMessage,
    ) {
        let socket = match sockets.get(&local_base) {
            Some(socket) => socket,
            None => return,
        };
        if !StunMessage::verify_integrity(raw, self.credentials.local_pwd.as_bytes()) {
            warn!("check from {} failed integrity, ignoring", source);
            return;
        }

        // role conflict resolution (RFC 8445 section 7.3.1.1)
        let conflict = match state.role {
            IceRole::Controller => message.controlling_tiebreaker(),
            IceRole::Controllee => message.controlled_tiebreaker(),
        };
        if let Some(their_tiebreaker) = conflict {
            if self.tiebreaker >= their_tiebreaker {
                let error = StunMessage::error_response(
                    message.transaction_id,
                    ERROR_ROLE_CONFLICT,
                    "Role Conflict",
                );
                socket
                    .send_to(&error.encode(Some(self.credentials.local_pwd.as_bytes())), source)
                    .await
                    .ok();
                return;
            }
            state.role = state.role.flip();
            debug!("switched role to {:?} after peer conflict", state.role);
        }

        let response = StunMessage::binding_response(message.transaction_id)
            .with_attribute(StunAttribute::XorMappedAddress(source));
        socket
            .send_to(
                &response.encode(Some(self.credentials.local_pwd.as_bytes())),
                source,
            )
            .await
            .ok();

        // find or create the pair this check exercises
        let pair_index = state.pairs.iter().position(|p| {
            p.local.base_addr() == local_base && p.remote.socket_addr() == source
        });
        let pair_index = match pair_index {
            Some(index) => index,
            None => {
                debug!("peer reflexive check source: {}", source);
                let local = match state
                    .pairs
                    .iter()
                    .find(|p| p.local.base_addr() == local_base)
                {
                    Some(pair) => pair.local.clone(),
                    None => return,
                };
                let mut remote = local.clone();
                remote.kind = CandidateKind::PeerReflexive;
                remote.address = source.ip();
                remote.port = source.port();
                remote.priority = message.priority().unwrap_or_else(|| {
                    super::candidate::candidate_priority(
                        CandidateKind::PeerReflexive,
                        65535,
                        local.component,
                    )
                });
                remote.rel_address = None;
                remote.rel_port = None;
                let pair = CandidatePair::new(local, remote, state.role);
                state.pairs.push(pair);
                state.pairs.len() - 1
            }
        };

        // a check from the peer makes this pair worth probing soon,
        // unless its component already nominated
        // TODO: triggered checks should go to the front of the queue
        // instead of ordinary Waiting order (RFC 8445 7.3.1.4)
        if state.pairs[pair_index].state == PairState::Frozen
            && !state
                .selected
                .contains_key(&state.pairs[pair_index].component())
        {
            state.pairs[pair_index].state = PairState::Waiting;
        }
        if message.use_candidate() && state.role == IceRole::Controllee {
            let component = state.pairs[pair_index].component();
            state.pairs[pair_index].nominated = true;
            if state.pairs[pair_index].state == PairState::Succeeded
                || state.pairs[pair_index].state == PairState::Waiting
                || state.pairs[pair_index].state == PairState::InProgress
            {
                state.selected.insert(component, pair_index);
                cancel_other_pairs(state, component, pair_index);
                info!("component {} nominated by controller", component);
            }
        }
    }

    /// Success once every component has a selected pair; failure when
    /// nothing is left to try.
    fn conclude(&self, state: &mut SessionState) -> Option<IceOutcome> {
        if state
            .components
            .iter()
            .all(|component| state.selected.contains_key(component))
        {
            let selected: Vec<CandidatePair> = state
                .components
                .iter()
                .map(|component| state.pairs[state.selected[component]].clone())
                .collect();
            return Some(IceOutcome::Success(selected));
        }

        let exhausted = state.in_flight == 0
            && state.pairs.iter().all(|p| {
                matches!(
                    p.state,
                    PairState::Failed | PairState::Succeeded | PairState::Cancelled
                )
            })
            && state.components.iter().any(|component| {
                !state.selected.contains_key(component)
                    && state
                        .pairs
                        .iter()
                        .filter(|p| p.component() == *component)
                        .all(|p| p.state == PairState::Failed)
            });
        if exhausted {
            return Some(IceOutcome::Failure(
                "all candidate pairs failed".to_string(),
            ));
        }
        None
    }
}

/// Once a component has its nominated pair, every other pair of that
/// component is cancelled and never probed again.
fn cancel_other_pairs(state: &mut SessionState, component: u8, keep_index: usize) {
    for (index, pair) in state.pairs.iter_mut().enumerate() {
        if index != keep_index && pair.component() == component {
            pair.state = PairState::Cancelled;
        }
    }
}

type ResponseRoutes =
    Arc<Mutex<HashMap<[u8; 12], UnboundedSender<(StunMessage, SocketAddr)>>>>;

fn spawn_socket_reader(
    local_base: SocketAddr,
    socket: Arc<UdpSocket>,
    events: UnboundedSender<SessionEvent>,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut buffer = [0u8; 1500];
        loop {
            let received = select! {
                _ = cancel_token.cancelled() => break,
                received = socket.recv_from(&mut buffer) => received,
            };
            match received {
                Ok((n, source)) => {
                    if events
                        .send(SessionEvent::Incoming {
                            local_base,
                            source,
                            data: buffer[..n].to_vec(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!("check socket {} read error: {}", local_base, e);
                    break;
                }
            }
        }
    });
}

/// One connectivity check: transmit with backoff until a response with
/// the matching transaction id arrives or the schedule is exhausted.
async fn run_check(
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
    payload: Vec<u8>,
    mut responses: UnboundedReceiver<(StunMessage, SocketAddr)>,
    cancel_token: CancellationToken,
) -> CheckResult {
    let mut rto = CHECK_RTO;
    for _ in 0..CHECK_MAX_TRANSMISSIONS {
        if socket.send_to(&payload, destination).await.is_err() {
            return CheckResult::TimedOut;
        }
        select! {
            _ = cancel_token.cancelled() => return CheckResult::TimedOut,
            response = responses.recv() => {
                match response {
                    Some((message, source)) => {
                        return match message.kind {
                            MessageKind::BindingResponse => CheckResult::Succeeded { source },
                            MessageKind::BindingErrorResponse
                                if message.error_code() == Some(ERROR_ROLE_CONFLICT) =>
                            {
                                CheckResult::RoleConflict
                            }
                            _ => CheckResult::TimedOut,
                        };
                    }
                    None => return CheckResult::TimedOut,
                }
            }
            _ = tokio::time::sleep(rto) => {
                rto = (rto * 2).min(CHECK_RTO_CAP);
            }
        }
    }
    CheckResult::TimedOut
}
