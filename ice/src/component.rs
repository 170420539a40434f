//! One ICE component: candidate gathering, pairing and connectivity checks.

use std::collections::VecDeque;
use std::net::{SocketAddr, SocketAddrV6};
use std::time::{Duration, Instant};

use crate::candidate::{
    candidate_priority, foundation, is_ipv6_link_local, random_token, Candidate, CandidatePair,
    CandidateType, LocalTransport, PairState,
};
use crate::error::Error;
use crate::stun::{
    demux, random_id, Class, Datagram, ErrorCode, Method, StunMessage, StunTransaction, SOFTWARE,
};
use crate::turn::{AllocationState, TurnAllocation, TurnEvent};

/// Interval between two connectivity checks.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// A TURN server and the long-term credentials to use on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    /// Server address
    pub address: SocketAddr,
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

/// A datagram to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Local socket to send from
    pub local: SocketAddr,
    /// Where to send it
    pub destination: SocketAddr,
    /// Payload
    pub data: Vec<u8>,
}

/// Progress of local candidate gathering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    /// No socket yet
    New,
    /// Waiting for STUN or TURN servers
    Busy,
    /// All local candidates are known
    Complete,
}

/// Things that happened to an [`IceComponent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentEvent {
    /// A pair was selected, sent once
    Connected,
    /// New local candidates were gathered
    LocalCandidatesChanged,
    /// Gathering progressed
    GatheringStateChanged(GatheringState),
    /// Media received from the peer
    DatagramReceived(Vec<u8>),
}

/// A Binding request to a STUN server, to learn a server-reflexive address.
#[derive(Debug)]
struct StunQuery {
    local: SocketAddr,
    server: SocketAddr,
    transaction: StunTransaction,
}

type PairKey = (LocalTransport, SocketAddr);

/// ICE for a single component, without any I/O.
///
/// The component is given the addresses of its bound UDP sockets with
/// [`set_sockets`][Self::set_sockets], and everything received on them with
/// [`handle_datagram`][Self::handle_datagram]. It asks for datagrams to be
/// sent through [`poll_transmit`][Self::poll_transmit]. When a TURN server
/// is configured, the allocation shares the first IPv4 socket.
#[derive(Debug)]
pub struct IceComponent {
    id: u8,
    controlling: bool,
    tie_breaker: u64,
    local_user: String,
    local_password: String,
    remote_user: String,
    remote_password: String,
    sockets: Vec<SocketAddr>,
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    pairs: Vec<CandidatePair>,
    active: Option<PairKey>,
    fallback: Option<PairKey>,
    stun_servers: Vec<SocketAddr>,
    stun_queries: Vec<StunQuery>,
    turn_server: Option<TurnServer>,
    turn: Option<(SocketAddr, TurnAllocation)>,
    checking: bool,
    check_at: Option<Instant>,
    gathering: GatheringState,
    closed: bool,
    transmits: VecDeque<Transmit>,
    events: VecDeque<ComponentEvent>,
}

impl IceComponent {
    /// A component with fresh local credentials.
    pub fn new(id: u8, controlling: bool) -> Self {
        IceComponent {
            id,
            controlling,
            tie_breaker: rand::random(),
            local_user: random_token(4),
            local_password: random_token(22),
            remote_user: String::new(),
            remote_password: String::new(),
            sockets: Vec::new(),
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            pairs: Vec::new(),
            active: None,
            fallback: None,
            stun_servers: Vec::new(),
            stun_queries: Vec::new(),
            turn_server: None,
            turn: None,
            checking: false,
            check_at: None,
            gathering: GatheringState::New,
            closed: false,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Component id, 1 for RTP and 2 for RTCP.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Whether a pair was selected.
    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    /// The selected pair.
    pub fn active_pair(&self) -> Option<&CandidatePair> {
        self.active.and_then(|key| self.pair(key))
    }

    /// All pairs, highest priority first.
    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    /// Local candidates gathered so far.
    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    /// Addresses of the sockets of this component.
    pub fn sockets(&self) -> &[SocketAddr] {
        &self.sockets
    }

    /// Local user fragment.
    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Local password.
    pub fn local_password(&self) -> &str {
        &self.local_password
    }

    /// Gathering progress.
    pub fn gathering_state(&self) -> GatheringState {
        self.gathering
    }

    /// Whether we are the controlling agent.
    pub fn is_controlling(&self) -> bool {
        self.controlling
    }

    /// Change role.
    pub fn set_ice_controlling(&mut self, controlling: bool) {
        self.controlling = controlling;
        for pair in &mut self.pairs {
            pair.set_controlling(controlling);
        }
        self.sort_pairs();
    }

    /// Replace the local user fragment.
    pub fn set_local_user<S: Into<String>>(&mut self, user: S) {
        self.local_user = user.into();
    }

    /// Replace the local password.
    pub fn set_local_password<S: Into<String>>(&mut self, password: S) {
        self.local_password = password.into();
    }

    /// Set the peer's user fragment.
    pub fn set_remote_user<S: Into<String>>(&mut self, user: S) {
        self.remote_user = user.into();
    }

    /// Set the peer's password.
    pub fn set_remote_password<S: Into<String>>(&mut self, password: S) {
        self.remote_password = password.into();
    }

    /// STUN servers to learn server-reflexive candidates from, used by the
    /// next [`set_sockets`][Self::set_sockets].
    pub fn set_stun_servers(&mut self, servers: Vec<SocketAddr>) {
        self.stun_servers = servers;
    }

    /// TURN server to allocate a relayed candidate on, used by the next
    /// [`set_sockets`][Self::set_sockets].
    pub fn set_turn_server(&mut self, server: Option<TurnServer>) {
        self.turn_server = server;
    }

    /// Start using the given bound sockets: advertise them as host
    /// candidates and start querying the STUN and TURN servers.
    pub fn set_sockets(&mut self, sockets: Vec<SocketAddr>, now: Instant) {
        self.local_candidates.clear();
        self.pairs.clear();
        self.stun_queries.clear();
        self.active = None;
        self.fallback = None;
        if let Some((socket, mut turn)) = self.turn.take() {
            // Release the old allocation before dropping it.
            turn.disconnect(now);
            while let Some(data) = turn.poll_transmit() {
                self.transmits.push_back(Transmit {
                    local: socket,
                    destination: turn.server(),
                    data,
                });
            }
        }
        self.sockets = sockets;

        for socket in &self.sockets {
            let mut address = *socket;
            if let SocketAddr::V6(v6) = &mut address {
                if !is_ipv6_link_local(&socket.ip()) {
                    v6.set_scope_id(0);
                }
            }
            self.local_candidates.push(Candidate::new(
                self.id,
                CandidateType::Host,
                address,
                socket.ip(),
            ));
        }

        for socket in self.sockets.iter().filter(|socket| socket.is_ipv4()) {
            for server in self.stun_servers.iter().filter(|server| server.is_ipv4()) {
                let mut request = StunMessage::new(Method::Binding, Class::Request, random_id());
                request.software = Some(String::from(SOFTWARE));
                self.stun_queries.push(StunQuery {
                    local: *socket,
                    server: *server,
                    transaction: StunTransaction::new(request, now),
                });
            }
        }

        let turn_socket = self.sockets.iter().find(|socket| socket.is_ipv4()).copied();
        if let (Some(server), Some(socket)) = (&self.turn_server, turn_socket) {
            let mut turn = TurnAllocation::new(server.address, &server.username, &server.password);
            turn.connect(now);
            self.turn = Some((socket, turn));
        }

        let remote_candidates = self.remote_candidates.clone();
        for candidate in &remote_candidates {
            self.pair_remote(candidate);
        }
        self.events.push_back(ComponentEvent::LocalCandidatesChanged);
        self.flush(now);
    }

    /// Add a candidate signaled by the peer. Returns false if it is not
    /// usable by this component or already known.
    pub fn add_remote_candidate(&mut self, candidate: Candidate) -> bool {
        if candidate.component != self.id
            || candidate.kind == CandidateType::PeerReflexive
            || !candidate.protocol.eq_ignore_ascii_case("udp")
            || self
                .remote_candidates
                .iter()
                .any(|known| known.address == candidate.address)
        {
            return false;
        }
        self.pair_remote(&candidate);
        self.remote_candidates.push(candidate);
        true
    }

    /// Start connectivity checks.
    pub fn connect_to_host(&mut self, now: Instant) {
        if self.active.is_some() || self.closed {
            return;
        }
        self.checking = true;
        for pair in &mut self.pairs {
            if pair.state == PairState::Frozen {
                pair.state = PairState::Waiting;
            }
        }
        self.check_next(now);
        self.check_at = Some(now + CHECK_INTERVAL);
        self.flush(now);
    }

    /// Stop everything. The TURN allocation, if any, is released.
    pub fn close(&mut self, now: Instant) {
        self.closed = true;
        self.checking = false;
        self.check_at = None;
        self.stun_queries.clear();
        for pair in &mut self.pairs {
            pair.check = None;
        }
        if let Some((_, turn)) = &mut self.turn {
            turn.disconnect(now);
        }
        self.active = None;
        self.fallback = None;
        self.flush(now);
    }

    /// Send media to the peer, over the selected pair or, before one is
    /// selected, over the pair the peer last sent media on.
    pub fn send_datagram(&mut self, data: &[u8], now: Instant) -> Result<(), Error> {
        let (local, remote) = self.active.or(self.fallback).ok_or(Error::NotConnected)?;
        self.send(local, remote, data.to_vec(), now)?;
        self.flush(now);
        Ok(())
    }

    /// Feed a datagram received on the socket bound to `local`.
    pub fn handle_datagram(&mut self, local: SocketAddr, from: SocketAddr, data: &[u8], now: Instant) {
        if let Some((socket, turn)) = &mut self.turn {
            if *socket == local && from == turn.server() {
                turn.handle_datagram(data, now);
                self.flush(now);
                return;
            }
        }
        if self.closed {
            return;
        }
        self.handle_peer_datagram(LocalTransport::Host(local), from, data, now);
        self.flush(now);
    }

    /// Next datagram to send.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next event.
    pub fn poll_event(&mut self) -> Option<ComponentEvent> {
        self.events.pop_front()
    }

    /// When [`handle_timeout`][Self::handle_timeout] should be called next.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let queries = self
            .stun_queries
            .iter()
            .filter_map(|query| query.transaction.poll_timeout());
        let checks = self
            .pairs
            .iter()
            .filter_map(|pair| pair.check.as_ref()?.poll_timeout());
        let turn = self.turn.as_ref().and_then(|(_, turn)| turn.poll_timeout());
        queries.chain(checks).chain(self.check_at).chain(turn).min()
    }

    /// Run the retransmission and check timers.
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some((_, turn)) = &mut self.turn {
            turn.handle_timeout(now);
        }
        if !self.closed {
            for query in &mut self.stun_queries {
                query.transaction.handle_timeout(now);
            }
            let (finished, pending): (Vec<_>, Vec<_>) = self
                .stun_queries
                .drain(..)
                .partition(|query| query.transaction.is_finished());
            self.stun_queries = pending;
            for query in finished {
                self.stun_query_finished(query);
            }

            for pair in &mut self.pairs {
                let Some(check) = &mut pair.check else {
                    continue;
                };
                check.handle_timeout(now);
                if check.is_finished() {
                    log::debug!("ICE check timed out {}", pair);
                    pair.check = None;
                    pair.state = PairState::Failed;
                }
            }

            if matches!(self.check_at, Some(at) if at <= now) {
                self.check_next(now);
                self.check_at = Some(now + CHECK_INTERVAL);
            }
        }
        self.flush(now);
    }

    fn pair(&self, (local, remote): PairKey) -> Option<&CandidatePair> {
        self.pairs.iter().find(|pair| pair.is(local, remote))
    }

    fn pair_index(&self, local: LocalTransport, remote: SocketAddr) -> Option<usize> {
        self.pairs.iter().position(|pair| pair.is(local, remote))
    }

    fn sort_pairs(&mut self) {
        self.pairs.sort_by_key(|pair| core::cmp::Reverse(pair.priority()));
    }

    fn add_pair(&mut self, local: LocalTransport, remote: Candidate) {
        let mut pair = CandidatePair::new(local, remote, self.controlling);
        if self.checking {
            pair.state = PairState::Waiting;
        }
        log::debug!("Added candidate pair {}", pair);
        if self.fallback.is_none() {
            if let LocalTransport::Host(_) = local {
                self.fallback = Some((local, pair.remote.address));
            }
        }
        self.pairs.push(pair);
    }

    /// Pair a remote candidate with every compatible local transport. An
    /// IPv6 link-local address is only paired with another link-local one.
    fn pair_remote(&mut self, candidate: &Candidate) {
        let remote_ip = candidate.address.ip();
        let sockets = self.sockets.clone();
        for socket in sockets {
            if socket.is_ipv4() != remote_ip.is_ipv4()
                || is_ipv6_link_local(&socket.ip()) != is_ipv6_link_local(&remote_ip)
            {
                continue;
            }
            let mut remote = candidate.clone();
            if let (SocketAddr::V6(address), SocketAddr::V6(local)) = (&mut remote.address, socket) {
                if is_ipv6_link_local(&remote_ip) {
                    *address = SocketAddrV6::new(
                        *address.ip(),
                        address.port(),
                        address.flowinfo(),
                        local.scope_id(),
                    );
                }
            }
            if self.pair_index(LocalTransport::Host(socket), remote.address).is_none() {
                self.add_pair(LocalTransport::Host(socket), remote);
            }
        }
        if self.turn.is_some()
            && remote_ip.is_ipv4()
            && self.pair_index(LocalTransport::Relayed, candidate.address).is_none()
        {
            self.add_pair(LocalTransport::Relayed, candidate.clone());
        }
        self.sort_pairs();
    }

    /// The pair for a check request from `from`, learning a peer-reflexive
    /// candidate if the address is new.
    fn find_or_learn_pair(
        &mut self,
        local: LocalTransport,
        from: SocketAddr,
        priority: Option<u32>,
    ) -> usize {
        if let Some(index) = self.pair_index(local, from) {
            return index;
        }
        let kind = CandidateType::PeerReflexive;
        let candidate = Candidate {
            component: self.id,
            foundation: foundation(kind, "udp", from.ip()),
            id: random_token(10),
            address: from,
            protocol: String::from("udp"),
            kind,
            priority: priority.unwrap_or_else(|| candidate_priority(kind, self.id)),
        };
        log::debug!("Learned peer-reflexive candidate {}", candidate);
        self.remote_candidates.push(candidate.clone());
        let mut pair = CandidatePair::new(local, candidate, self.controlling);
        pair.state = PairState::Waiting;
        self.pairs.push(pair);
        self.sort_pairs();
        self.pair_index(local, from).unwrap_or(0)
    }

    /// Check the best waiting pair.
    fn check_next(&mut self, now: Instant) {
        if let Some(index) = self
            .pairs
            .iter()
            .position(|pair| pair.state == PairState::Waiting)
        {
            self.start_check(index, now);
        }
    }

    fn start_check(&mut self, index: usize, now: Instant) {
        if self.remote_user.is_empty() || self.remote_password.is_empty() {
            return;
        }
        let mut request = StunMessage::new(Method::Binding, Class::Request, random_id());
        request.priority = Some(candidate_priority(CandidateType::PeerReflexive, self.id));
        request.username = Some(format!("{}:{}", self.remote_user, self.local_user));
        if self.controlling {
            request.ice_controlling = Some(self.tie_breaker);
            request.use_candidate = true;
        } else {
            request.ice_controlled = Some(self.tie_breaker);
        }
        let pair = &mut self.pairs[index];
        log::debug!("Checking {}", pair);
        pair.state = PairState::InProgress;
        pair.check = Some(StunTransaction::new(request, now));
    }

    fn handle_peer_datagram(&mut self, local: LocalTransport, from: SocketAddr, data: &[u8], now: Instant) {
        let (message_type, id) = match demux(data) {
            Datagram::Stun { message_type, id } => (message_type, id),
            _ => {
                if self.pair_index(local, from).is_some() {
                    self.fallback = Some((local, from));
                }
                self.events
                    .push_back(ComponentEvent::DatagramReceived(data.to_vec()));
                return;
            }
        };

        if let LocalTransport::Host(socket) = local {
            if let Some(index) = self.stun_queries.iter().position(|query| {
                query.local == socket && query.server == from && query.transaction.request().id == id
            }) {
                match StunMessage::decode(data, None) {
                    Ok(message) => {
                        log::trace!("STUN packet from {}\n{}", from, message);
                        if self.stun_queries[index].transaction.handle_response(message) {
                            let query = self.stun_queries.remove(index);
                            self.stun_query_finished(query);
                        }
                    }
                    Err(e) => log::warn!("Dropping packet from STUN server {}: {}", from, e),
                }
                return;
            }
        }

        let key = match Class::from_type(message_type) {
            Class::Request | Class::Indication => &self.local_password,
            Class::Response | Class::Error => &self.remote_password,
        };
        if key.is_empty() {
            log::debug!("No credentials yet, ignoring STUN packet from {}", from);
            return;
        }
        let message = match StunMessage::decode(data, Some(key.as_bytes())) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping STUN packet from {}: {}", from, e);
                return;
            }
        };
        log::trace!("STUN packet from {}\n{}", from, message);

        match (message.method(), message.class()) {
            (Method::Binding, Class::Request) => self.handle_check_request(local, from, message, now),
            (Method::Binding, Class::Response | Class::Error) => {
                self.handle_check_response(from, message)
            }
            _ => log::debug!("Ignoring {} {} from {}", message.method(), message.class(), from),
        }
    }

    fn handle_check_request(
        &mut self,
        local: LocalTransport,
        from: SocketAddr,
        request: StunMessage,
        now: Instant,
    ) {
        let prefix = format!("{}:", self.local_user);
        if !request
            .username
            .as_deref()
            .map_or(false, |username| username.starts_with(&prefix))
        {
            log::warn!("Check from {} with a bad username {:?}", from, request.username);
            return;
        }

        let conflict = if self.controlling {
            request.use_candidate
        } else {
            request.ice_controlled.is_some()
        };
        if conflict {
            log::warn!("Rejecting check from {}, role conflict", from);
            let mut response = StunMessage::new(Method::Binding, Class::Error, request.id);
            response.username = request.username;
            response.error = Some(ErrorCode::new(ErrorCode::ROLE_CONFLICT, "Role Conflict"));
            let data = response.encode(Some(self.local_password.as_bytes()), true);
            self.send_or_warn(local, from, data, now);
            return;
        }

        let index = self.find_or_learn_pair(local, from, request.priority);

        let mut response = StunMessage::new(Method::Binding, Class::Response, request.id);
        response.username = request.username;
        response.xor_mapped_address = Some(from);
        let data = response.encode(Some(self.local_password.as_bytes()), true);
        self.send_or_warn(local, from, data, now);

        if request.use_candidate {
            self.pairs[index].nominated = true;
        }
        let triggered = !self.controlling
            && self.active.is_none()
            && matches!(
                self.pairs[index].state,
                PairState::Frozen | PairState::Waiting | PairState::Failed
            );
        if triggered {
            self.start_check(index, now);
        }
        self.promote(index);
    }

    fn handle_check_response(&mut self, from: SocketAddr, response: StunMessage) {
        let Some(index) = self.pairs.iter().position(|pair| {
            pair.check
                .as_ref()
                .map_or(false, |check| check.matches(&response))
        }) else {
            log::debug!("Unknown transaction from {}", from);
            return;
        };
        let controlling = self.controlling;
        let pair = &mut self.pairs[index];
        if pair.remote.address != from {
            log::warn!("Check response for {} came from {}", pair, from);
            return;
        }
        pair.check = None;
        match response.class() {
            Class::Response => {
                pair.state = PairState::Succeeded;
                pair.reflexive = response.xor_mapped_address;
                if controlling {
                    pair.nominated = true;
                }
                log::debug!("ICE check complete {}", pair);
                self.promote(index);
            }
            _ => {
                let reason = response.error.map(|error| error.code).unwrap_or(0);
                log::warn!("ICE check failed {} ({})", pair, reason);
                pair.state = PairState::Failed;
            }
        }
    }

    /// Select the pair if it is nominated, succeeded and better than the
    /// currently selected one.
    fn promote(&mut self, index: usize) {
        let pair = &self.pairs[index];
        if pair.state != PairState::Succeeded || !pair.nominated {
            return;
        }
        let priority = pair.priority();
        let key = (pair.local, pair.remote.address);
        let current = self.active_pair().map(CandidatePair::priority);
        if current.map_or(true, |current| priority > current) {
            log::info!("ICE pair selected {} (priority: {})", self.pairs[index], priority);
            let was_connected = self.active.is_some();
            self.active = Some(key);
            if !was_connected {
                self.events.push_back(ComponentEvent::Connected);
            }
        }
    }

    fn stun_query_finished(&mut self, query: StunQuery) {
        let Some(response) = query.transaction.response() else {
            return;
        };
        if response.class() != Class::Response {
            let reason = response.error.as_ref().map(|error| error.reason.as_str());
            log::warn!("STUN server {} failed: {:?}", query.server, reason);
            return;
        }
        let Some(reflexive) = response.xor_mapped_address.or(response.mapped_address) else {
            log::warn!("STUN server {} did not provide a reflexive address", query.server);
            return;
        };
        if self.local_candidates.iter().any(|candidate| {
            candidate.kind == CandidateType::ServerReflexive && candidate.address == reflexive
        }) {
            return;
        }
        log::debug!("Adding server-reflexive candidate {}", reflexive);
        self.local_candidates.push(Candidate::new(
            self.id,
            CandidateType::ServerReflexive,
            reflexive,
            query.local.ip(),
        ));
        self.events.push_back(ComponentEvent::LocalCandidatesChanged);
    }

    fn send(&mut self, local: LocalTransport, destination: SocketAddr, data: Vec<u8>, now: Instant) -> Result<(), Error> {
        match local {
            LocalTransport::Host(local) => {
                self.transmits.push_back(Transmit {
                    local,
                    destination,
                    data,
                });
                Ok(())
            }
            LocalTransport::Relayed => match &mut self.turn {
                Some((_, turn)) => turn.send_to(&data, destination, now),
                None => Err(Error::NotConnected),
            },
        }
    }

    fn send_or_warn(&mut self, local: LocalTransport, destination: SocketAddr, data: Vec<u8>, now: Instant) {
        if let Err(e) = self.send(local, destination, data, now) {
            log::warn!("Could not send to {} ({}): {}", destination, local, e);
        }
    }

    /// Queue due requests, handle what the TURN allocation did and update
    /// the gathering state.
    fn flush(&mut self, now: Instant) {
        while let Some(event) = self.turn.as_mut().and_then(|(_, turn)| turn.poll_event()) {
            match event {
                TurnEvent::Connected => {
                    let Some((socket, turn)) = &self.turn else {
                        continue;
                    };
                    let Some(relayed) = turn.relayed_address() else {
                        continue;
                    };
                    log::debug!("Adding relayed candidate {}", relayed);
                    self.local_candidates.push(Candidate::new(
                        self.id,
                        CandidateType::Relayed,
                        relayed,
                        socket.ip(),
                    ));
                    self.events.push_back(ComponentEvent::LocalCandidatesChanged);
                }
                TurnEvent::Disconnected => log::debug!("TURN allocation closed"),
                TurnEvent::DatagramReceived { data, peer } => {
                    if !self.closed {
                        self.handle_peer_datagram(LocalTransport::Relayed, peer, &data, now);
                    }
                }
            }
        }

        let mut outgoing = Vec::new();
        for query in &mut self.stun_queries {
            if let Some(request) = query.transaction.poll_transmit() {
                log::trace!("STUN packet to {}\n{}", query.server, request);
                self.transmits.push_back(Transmit {
                    local: query.local,
                    destination: query.server,
                    data: request.encode(None, true),
                });
            }
        }
        for pair in &mut self.pairs {
            let Some(check) = &mut pair.check else {
                continue;
            };
            if let Some(request) = check.poll_transmit() {
                log::trace!("STUN packet to {}\n{}", pair.remote.address, request);
                let data = request.encode(Some(self.remote_password.as_bytes()), true);
                outgoing.push((pair.local, pair.remote.address, data));
            }
        }
        for (local, destination, data) in outgoing {
            self.send_or_warn(local, destination, data, now);
        }

        if let Some((socket, turn)) = &mut self.turn {
            while let Some(data) = turn.poll_transmit() {
                self.transmits.push_back(Transmit {
                    local: *socket,
                    destination: turn.server(),
                    data,
                });
            }
        }

        self.update_gathering();
    }

    fn update_gathering(&mut self) {
        if self.closed {
            return;
        }
        let turn_busy = self
            .turn
            .as_ref()
            .map_or(false, |(_, turn)| turn.state() == AllocationState::Connecting);
        let state = if self.sockets.is_empty() {
            GatheringState::New
        } else if turn_busy || !self.stun_queries.is_empty() {
            GatheringState::Busy
        } else {
            GatheringState::Complete
        };
        if state != self.gathering {
            log::debug!("Component {} gathering {:?}", self.id, state);
            self.gathering = state;
            self.events
                .push_back(ComponentEvent::GatheringStateChanged(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_PASSWORD: &[u8] = b"localpassword";
    const REMOTE_PASSWORD: &[u8] = b"remotepassword";

    fn local() -> SocketAddr {
        "10.0.0.1:5000".parse().unwrap()
    }

    fn component(controlling: bool, now: Instant) -> IceComponent {
        let mut component = IceComponent::new(1, controlling);
        component.set_local_user("LOCL");
        component.set_local_password("localpassword");
        component.set_remote_user("REMO");
        component.set_remote_password("remotepassword");
        component.set_sockets(vec![local()], now);
        while component.poll_event().is_some() {}
        component
    }

    fn remote(address: &str, kind: CandidateType, priority: u32) -> Candidate {
        let address: SocketAddr = address.parse().unwrap();
        Candidate {
            component: 1,
            foundation: String::from("1"),
            id: String::from("remote"),
            address,
            protocol: String::from("udp"),
            kind,
            priority,
        }
    }

    fn next_check(component: &mut IceComponent) -> (Transmit, StunMessage) {
        let transmit = component.poll_transmit().expect("nothing sent");
        let message = StunMessage::decode(&transmit.data, Some(REMOTE_PASSWORD)).unwrap();
        (transmit, message)
    }

    /// Answer a check the way the peer would.
    fn answer(component: &mut IceComponent, transmit: &Transmit, request: &StunMessage, now: Instant) {
        let mut response = StunMessage::new(Method::Binding, Class::Response, request.id);
        response.xor_mapped_address = Some(transmit.local);
        let data = response.encode(Some(REMOTE_PASSWORD), true);
        component.handle_datagram(transmit.local, transmit.destination, &data, now);
    }

    fn check_from_peer(use_candidate: bool, controlling: bool) -> (StunMessage, Vec<u8>) {
        let mut request = StunMessage::new(Method::Binding, Class::Request, random_id());
        request.username = Some(String::from("LOCL:REMO"));
        request.priority = Some(12345);
        request.use_candidate = use_candidate;
        if controlling {
            request.ice_controlling = Some(7);
        } else {
            request.ice_controlled = Some(7);
        }
        let data = request.encode(Some(LOCAL_PASSWORD), true);
        (request, data)
    }

    #[test]
    fn nomination_is_monotonic() {
        let now = Instant::now();
        let mut component = component(true, now);
        let host = candidate_priority(CandidateType::Host, 1);
        let srflx = candidate_priority(CandidateType::ServerReflexive, 1);
        assert!(component.add_remote_candidate(remote("10.0.0.2:6000", CandidateType::Host, host)));
        assert!(component.add_remote_candidate(remote(
            "203.0.113.9:7000",
            CandidateType::ServerReflexive,
            srflx
        )));

        component.connect_to_host(now);
        let (transmit, request) = next_check(&mut component);
        assert_eq!(transmit.destination, "10.0.0.2:6000".parse().unwrap());
        assert_eq!(request.username.as_deref(), Some("REMO:LOCL"));
        assert!(request.use_candidate);
        assert!(request.ice_controlling.is_some());
        answer(&mut component, &transmit, &request, now);
        assert_eq!(component.poll_event(), Some(ComponentEvent::Connected));
        let best = component.active_pair().unwrap().priority();
        assert_eq!(
            component.active_pair().unwrap().remote.address,
            transmit.destination
        );

        // A lower priority nomination does not replace the selected pair.
        let now = now + CHECK_INTERVAL;
        component.handle_timeout(now);
        let (transmit, request) = next_check(&mut component);
        assert_eq!(transmit.destination, "203.0.113.9:7000".parse().unwrap());
        answer(&mut component, &transmit, &request, now);
        let lower = component
            .pairs()
            .iter()
            .find(|pair| pair.remote.address == transmit.destination)
            .unwrap();
        assert_eq!(lower.state, PairState::Succeeded);
        assert!(lower.nominated);
        assert!(lower.priority() < best);
        assert_eq!(component.active_pair().unwrap().priority(), best);

        // A higher one does.
        assert!(component.add_remote_candidate(remote(
            "10.0.0.3:6000",
            CandidateType::Host,
            host + 1000
        )));
        let now = now + CHECK_INTERVAL;
        component.handle_timeout(now);
        let (transmit, request) = next_check(&mut component);
        assert_eq!(transmit.destination, "10.0.0.3:6000".parse().unwrap());
        answer(&mut component, &transmit, &request, now);
        let active = component.active_pair().unwrap();
        assert_eq!(active.remote.address, transmit.destination);
        assert!(active.priority() > best);

        // Connected is only reported once.
        assert_eq!(component.poll_event(), None);
    }

    #[test]
    fn role_conflict_is_rejected() {
        let now = Instant::now();
        let mut component = component(true, now);
        let from: SocketAddr = "10.0.0.2:6000".parse().unwrap();
        let (request, data) = check_from_peer(true, false);
        component.handle_datagram(local(), from, &data, now);

        let transmit = component.poll_transmit().unwrap();
        assert_eq!(transmit.destination, from);
        let response = StunMessage::decode(&transmit.data, Some(LOCAL_PASSWORD)).unwrap();
        assert_eq!(response.id, request.id);
        assert_eq!(response.class(), Class::Error);
        assert_eq!(response.error.unwrap().code, ErrorCode::ROLE_CONFLICT);
        assert!(component.pairs().is_empty());
        assert!(!component.is_connected());
    }

    #[test]
    fn controlled_learns_peer_reflexive_and_triggers_check() {
        let now = Instant::now();
        let mut component = component(false, now);
        let from: SocketAddr = "10.0.0.9:7000".parse().unwrap();
        let (request, data) = check_from_peer(true, true);
        component.handle_datagram(local(), from, &data, now);

        let transmit = component.poll_transmit().unwrap();
        let response = StunMessage::decode(&transmit.data, Some(LOCAL_PASSWORD)).unwrap();
        assert_eq!(response.id, request.id);
        assert_eq!(response.class(), Class::Response);
        assert_eq!(response.xor_mapped_address, Some(from));

        let pair = &component.pairs()[0];
        assert_eq!(pair.remote.kind, CandidateType::PeerReflexive);
        assert_eq!(pair.remote.priority, 12345);
        assert!(pair.nominated);
        assert_eq!(pair.state, PairState::InProgress);

        // The triggered check.
        let (transmit, check) = next_check(&mut component);
        assert_eq!(transmit.destination, from);
        assert!(check.ice_controlled.is_some());
        assert!(!check.use_candidate);
        answer(&mut component, &transmit, &check, now);
        assert!(component.is_connected());
        assert_eq!(component.poll_event(), Some(ComponentEvent::Connected));
    }

    #[test]
    fn bad_username_is_ignored() {
        let now = Instant::now();
        let mut component = component(false, now);
        let from: SocketAddr = "10.0.0.9:7000".parse().unwrap();
        let mut request = StunMessage::new(Method::Binding, Class::Request, random_id());
        request.username = Some(String::from("OTHR:REMO"));
        component.handle_datagram(local(), from, &request.encode(Some(LOCAL_PASSWORD), true), now);
        assert_eq!(component.poll_transmit(), None);
        assert!(component.pairs().is_empty());
    }

    #[test]
    fn server_reflexive_gathering() {
        let now = Instant::now();
        let first: SocketAddr = "198.51.100.1:3478".parse().unwrap();
        let second: SocketAddr = "198.51.100.2:3478".parse().unwrap();
        let mapped: SocketAddr = "203.0.113.7:40000".parse().unwrap();

        let mut component = IceComponent::new(1, false);
        component.set_stun_servers(vec![first, second]);
        component.set_sockets(vec![local()], now);
        assert_eq!(component.gathering_state(), GatheringState::Busy);
        assert_eq!(
            component.poll_event(),
            Some(ComponentEvent::LocalCandidatesChanged)
        );
        assert_eq!(
            component.poll_event(),
            Some(ComponentEvent::GatheringStateChanged(GatheringState::Busy))
        );

        let mut requests = Vec::new();
        while let Some(transmit) = component.poll_transmit() {
            let request = StunMessage::decode(&transmit.data, None).unwrap();
            assert_eq!(request.method(), Method::Binding);
            requests.push((transmit.destination, request));
        }
        assert_eq!(requests.len(), 2);

        for (server, request) in requests {
            let mut response = StunMessage::new(Method::Binding, Class::Response, request.id);
            response.xor_mapped_address = Some(mapped);
            component.handle_datagram(local(), server, &response.encode(None, true), now);
        }
        assert_eq!(
            component.poll_event(),
            Some(ComponentEvent::LocalCandidatesChanged)
        );
        assert_eq!(
            component.poll_event(),
            Some(ComponentEvent::GatheringStateChanged(GatheringState::Complete))
        );
        let kinds: Vec<_> = component
            .local_candidates()
            .iter()
            .map(|candidate| candidate.kind)
            .collect();
        assert_eq!(kinds, [CandidateType::Host, CandidateType::ServerReflexive]);
        assert_eq!(component.local_candidates()[1].address, mapped);
    }

    #[test]
    fn stun_server_timeout_completes_gathering() {
        let start = Instant::now();
        let mut component = IceComponent::new(1, false);
        component.set_stun_servers(vec!["198.51.100.1:3478".parse().unwrap()]);
        component.set_sockets(vec![local()], start);
        while let Some(deadline) = component.poll_timeout() {
            component.handle_timeout(deadline);
        }
        assert_eq!(component.gathering_state(), GatheringState::Complete);
        assert_eq!(component.local_candidates().len(), 1);
    }

    #[test]
    fn media_and_fallback_pair() {
        let now = Instant::now();
        let mut component = component(false, now);
        assert!(matches!(
            component.send_datagram(b"rtp", now),
            Err(Error::NotConnected)
        ));

        let peer: SocketAddr = "10.0.0.2:6000".parse().unwrap();
        let host = candidate_priority(CandidateType::Host, 1);
        assert!(component.add_remote_candidate(remote("10.0.0.2:6000", CandidateType::Host, host)));
        assert!(!component.add_remote_candidate(remote("10.0.0.2:6000", CandidateType::Host, host)));

        component.send_datagram(b"rtp", now).unwrap();
        assert_eq!(
            component.poll_transmit(),
            Some(Transmit {
                local: local(),
                destination: peer,
                data: b"rtp".to_vec()
            })
        );

        component.handle_datagram(local(), peer, b"\x80\x60media", now);
        assert_eq!(
            component.poll_event(),
            Some(ComponentEvent::DatagramReceived(b"\x80\x60media".to_vec()))
        );
    }

    #[test]
    fn candidate_validation_and_link_local_pairing() {
        let now = Instant::now();
        let link_local = SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 5000, 0, 2));
        let global: SocketAddr = "[2001:db8::1]:5000".parse().unwrap();
        let mut component = IceComponent::new(1, true);
        component.set_sockets(vec![local(), link_local, global], now);

        let host = candidate_priority(CandidateType::Host, 1);
        let mut wrong_component = remote("10.0.0.2:6000", CandidateType::Host, host);
        wrong_component.component = 2;
        assert!(!component.add_remote_candidate(wrong_component));
        let mut tcp = remote("10.0.0.2:6000", CandidateType::Host, host);
        tcp.protocol = String::from("tcp");
        assert!(!component.add_remote_candidate(tcp));
        assert!(!component.add_remote_candidate(remote(
            "10.0.0.2:6000",
            CandidateType::PeerReflexive,
            host
        )));

        assert!(component.add_remote_candidate(remote("[fe80::2]:6000", CandidateType::Host, host)));
        assert_eq!(component.pairs().len(), 1);
        let pair = &component.pairs()[0];
        assert_eq!(pair.local, LocalTransport::Host(link_local));
        match pair.remote.address {
            SocketAddr::V6(address) => assert_eq!(address.scope_id(), 2),
            SocketAddr::V4(_) => panic!("IPv6 expected"),
        }

        assert!(component.add_remote_candidate(remote("[2001:db8::2]:6000", CandidateType::Host, host)));
        assert!(component.add_remote_candidate(remote("10.0.0.2:6000", CandidateType::Host, host)));
        assert_eq!(component.pairs().len(), 3);
        for pair in component.pairs() {
            let LocalTransport::Host(socket) = pair.local else {
                panic!("no TURN configured");
            };
            assert_eq!(socket.is_ipv4(), pair.remote.address.is_ipv4());
            assert_eq!(
                is_ipv6_link_local(&socket.ip()),
                is_ipv6_link_local(&pair.remote.address.ip())
            );
        }
    }

    #[test]
    fn new_sockets_release_the_old_allocation() {
        let now = Instant::now();
        let server: SocketAddr = "198.51.100.9:3478".parse().unwrap();
        let mut component = IceComponent::new(1, false);
        component.set_turn_server(Some(TurnServer {
            address: server,
            username: String::from("user"),
            password: String::from("secret"),
        }));
        component.set_sockets(vec![local()], now);

        let transmit = component.poll_transmit().unwrap();
        assert_eq!(transmit.destination, server);
        let allocate = StunMessage::decode(&transmit.data, None).unwrap();
        assert_eq!(allocate.method(), Method::Allocate);
        let mut response = StunMessage::new(Method::Allocate, Class::Response, allocate.id);
        response.xor_relayed_address = Some("203.0.113.5:50000".parse().unwrap());
        response.lifetime = Some(600);
        component.handle_datagram(local(), server, &response.encode(None, true), now);
        assert!(component
            .local_candidates()
            .iter()
            .any(|candidate| candidate.kind == CandidateType::Relayed));
        while component.poll_transmit().is_some() {}

        let moved: SocketAddr = "10.0.0.1:6000".parse().unwrap();
        component.set_sockets(vec![moved], now);
        let mut released = false;
        while let Some(transmit) = component.poll_transmit() {
            if transmit.local != local() {
                continue;
            }
            assert_eq!(transmit.destination, server);
            let refresh = StunMessage::decode(&transmit.data, None).unwrap();
            assert_eq!(refresh.method(), Method::Refresh);
            assert_eq!(refresh.lifetime, Some(0));
            released = true;
        }
        assert!(released);
    }

    #[test]
    fn close_stops_timers() {
        let now = Instant::now();
        let mut component = component(true, now);
        let host = candidate_priority(CandidateType::Host, 1);
        component.add_remote_candidate(remote("10.0.0.2:6000", CandidateType::Host, host));
        component.connect_to_host(now);
        assert!(component.poll_timeout().is_some());
        component.close(now);
        assert_eq!(component.poll_timeout(), None);
    }
}
