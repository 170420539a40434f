//! A multi-component ICE session.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::candidate::{random_token, Candidate};
use crate::component::{ComponentEvent, GatheringState, IceComponent, Transmit, TurnServer};
use crate::error::Error;

/// How long [`IceConnection::connect_to_host`] waits for every component.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings of an [`IceConnection`].
#[derive(Debug, Clone)]
pub struct IceConfig {
    /// Whether we are the controlling agent, usually the Jingle initiator
    pub controlling: bool,
    /// Component ids, in any order
    pub components: Vec<u8>,
    /// STUN servers used to gather server-reflexive candidates
    pub stun_servers: Vec<SocketAddr>,
    /// TURN server used to gather a relayed candidate
    pub turn_server: Option<TurnServer>,
    /// Local user fragment
    pub local_user: String,
    /// Local password
    pub local_password: String,
}

impl Default for IceConfig {
    fn default() -> Self {
        IceConfig {
            controlling: false,
            components: vec![1],
            stun_servers: Vec::new(),
            turn_server: None,
            local_user: random_token(4),
            local_password: random_token(22),
        }
    }
}

/// Things that happened to an [`IceConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceEvent {
    /// Every component selected a pair
    Connected,
    /// Connecting timed out, or the connection was closed
    Disconnected,
    /// Gathering progressed, taken over all components
    GatheringStateChanged(GatheringState),
    /// New local candidates are available for signaling
    LocalCandidatesChanged,
    /// Media received on a component
    DatagramReceived {
        /// Component id
        component: u8,
        /// Payload
        data: Vec<u8>,
    },
}

/// A set of [`IceComponent`]s sharing credentials and role.
#[derive(Debug)]
pub struct IceConnection {
    config: IceConfig,
    components: Vec<IceComponent>,
    connect_deadline: Option<Instant>,
    connected: bool,
    gathering: GatheringState,
    events: VecDeque<IceEvent>,
}

impl IceConnection {
    /// A connection with the components of `config`.
    pub fn new(config: IceConfig) -> Self {
        let mut connection = IceConnection {
            components: Vec::new(),
            connect_deadline: None,
            connected: false,
            gathering: GatheringState::New,
            events: VecDeque::new(),
            config: IceConfig {
                components: Vec::new(),
                ..config.clone()
            },
        };
        for id in config.components {
            connection.add_component(id);
        }
        connection
    }

    /// Add a component, if not present already.
    pub fn add_component(&mut self, id: u8) {
        if self.component(id).is_some() {
            log::warn!("Already have component {}", id);
            return;
        }
        let mut component = IceComponent::new(id, self.config.controlling);
        component.set_local_user(self.config.local_user.as_str());
        component.set_local_password(self.config.local_password.as_str());
        component.set_stun_servers(self.config.stun_servers.clone());
        component.set_turn_server(self.config.turn_server.clone());
        self.components.push(component);
        self.components.sort_by_key(IceComponent::id);
        self.config.components.push(id);
        self.config.components.sort_unstable();
    }

    /// The component with the given id.
    pub fn component(&self, id: u8) -> Option<&IceComponent> {
        self.components.iter().find(|component| component.id() == id)
    }

    fn component_mut(&mut self, id: u8) -> Result<&mut IceComponent, Error> {
        self.components
            .iter_mut()
            .find(|component| component.id() == id)
            .ok_or(Error::NoComponent(id))
    }

    /// All components, sorted by id.
    pub fn components(&self) -> &[IceComponent] {
        &self.components
    }

    /// Change role on every component.
    pub fn set_ice_controlling(&mut self, controlling: bool) {
        self.config.controlling = controlling;
        for component in &mut self.components {
            component.set_ice_controlling(controlling);
        }
    }

    /// Local candidates of all components.
    pub fn local_candidates(&self) -> Vec<Candidate> {
        self.components
            .iter()
            .flat_map(|component| component.local_candidates().iter().cloned())
            .collect()
    }

    /// Local user fragment.
    pub fn local_user(&self) -> &str {
        &self.config.local_user
    }

    /// Local password.
    pub fn local_password(&self) -> &str {
        &self.config.local_password
    }

    /// Replace the local user fragment.
    pub fn set_local_user<S: Into<String>>(&mut self, user: S) {
        self.config.local_user = user.into();
        for component in &mut self.components {
            component.set_local_user(self.config.local_user.as_str());
        }
    }

    /// Replace the local password.
    pub fn set_local_password<S: Into<String>>(&mut self, password: S) {
        self.config.local_password = password.into();
        for component in &mut self.components {
            component.set_local_password(self.config.local_password.as_str());
        }
    }

    /// Set the peer's user fragment.
    pub fn set_remote_user(&mut self, user: &str) {
        for component in &mut self.components {
            component.set_remote_user(user);
        }
    }

    /// Set the peer's password.
    pub fn set_remote_password(&mut self, password: &str) {
        for component in &mut self.components {
            component.set_remote_password(password);
        }
    }

    /// Give a remote candidate to its component.
    pub fn add_remote_candidate(&mut self, candidate: Candidate) -> Result<bool, Error> {
        let component = self.component_mut(candidate.component)?;
        Ok(component.add_remote_candidate(candidate))
    }

    /// STUN servers, used by the next [`bind`][Self::bind].
    pub fn set_stun_servers(&mut self, servers: Vec<SocketAddr>) {
        for component in &mut self.components {
            component.set_stun_servers(servers.clone());
        }
        self.config.stun_servers = servers;
    }

    /// TURN server, used by the next [`bind`][Self::bind].
    pub fn set_turn_server(&mut self, server: Option<TurnServer>) {
        for component in &mut self.components {
            component.set_turn_server(server.clone());
        }
        self.config.turn_server = server;
    }

    /// Hand bound sockets out to the components, `sockets.len() /
    /// components` each: the first slice goes to the lowest component id.
    pub fn bind(&mut self, sockets: Vec<SocketAddr>, now: Instant) {
        let count = self.components.len().max(1);
        let per_component = sockets.len() / count;
        let mut sockets = sockets.into_iter();
        for component in &mut self.components {
            let own = sockets.by_ref().take(per_component).collect();
            component.set_sockets(own, now);
        }
        self.collect_events();
    }

    /// Start connectivity checks on every component, failing after
    /// [`CONNECT_TIMEOUT`].
    pub fn connect_to_host(&mut self, now: Instant) {
        if self.connected || self.connect_deadline.is_some() {
            return;
        }
        for component in &mut self.components {
            component.connect_to_host(now);
        }
        self.connect_deadline = Some(now + CONNECT_TIMEOUT);
        self.collect_events();
    }

    /// Stop everything.
    pub fn close(&mut self, now: Instant) {
        for component in &mut self.components {
            component.close(now);
        }
        self.connect_deadline = None;
        self.connected = false;
        self.collect_events();
    }

    /// Whether every component selected a pair.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Gathering progress over all components.
    pub fn gathering_state(&self) -> GatheringState {
        self.gathering
    }

    /// Feed a datagram received on the socket bound to `local`.
    pub fn handle_datagram(&mut self, local: SocketAddr, from: SocketAddr, data: &[u8], now: Instant) {
        match self
            .components
            .iter_mut()
            .find(|component| component.sockets().contains(&local))
        {
            Some(component) => component.handle_datagram(local, from, data, now),
            None => log::warn!("Datagram on unknown socket {}", local),
        }
        self.collect_events();
    }

    /// Send media on a component.
    pub fn send_datagram(&mut self, component: u8, data: &[u8], now: Instant) -> Result<(), Error> {
        self.component_mut(component)?.send_datagram(data, now)
    }

    /// Next datagram to send, from any component.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.components
            .iter_mut()
            .find_map(IceComponent::poll_transmit)
    }

    /// Next event.
    pub fn poll_event(&mut self) -> Option<IceEvent> {
        self.collect_events();
        self.events.pop_front()
    }

    /// When [`handle_timeout`][Self::handle_timeout] should be called next.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.components
            .iter()
            .filter_map(IceComponent::poll_timeout)
            .chain(self.connect_deadline)
            .min()
    }

    /// Run the timers of every component, and give up connecting once the
    /// deadline passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        if matches!(self.connect_deadline, Some(deadline) if deadline <= now) {
            log::warn!("ICE negotiation timed out");
            self.connect_deadline = None;
            for component in &mut self.components {
                component.close(now);
            }
            self.events.push_back(IceEvent::Disconnected);
        }
        for component in &mut self.components {
            component.handle_timeout(now);
        }
        self.collect_events();
    }

    fn collect_events(&mut self) {
        let mut connected = false;
        let mut gathering_changed = false;
        for component in &mut self.components {
            while let Some(event) = component.poll_event() {
                match event {
                    ComponentEvent::Connected => connected = true,
                    ComponentEvent::LocalCandidatesChanged => {
                        self.events.push_back(IceEvent::LocalCandidatesChanged)
                    }
                    ComponentEvent::GatheringStateChanged(_) => gathering_changed = true,
                    ComponentEvent::DatagramReceived(data) => {
                        self.events.push_back(IceEvent::DatagramReceived {
                            component: component.id(),
                            data,
                        })
                    }
                }
            }
        }

        if gathering_changed {
            let states: Vec<_> = self
                .components
                .iter()
                .map(IceComponent::gathering_state)
                .collect();
            let state = if states.contains(&GatheringState::Busy) {
                GatheringState::Busy
            } else if states.iter().all(|state| *state == GatheringState::Complete) {
                GatheringState::Complete
            } else {
                GatheringState::New
            };
            if state != self.gathering {
                self.gathering = state;
                self.events.push_back(IceEvent::GatheringStateChanged(state));
            }
        }

        if connected
            && !self.connected
            && self.components.iter().all(IceComponent::is_connected)
        {
            log::info!("ICE connected");
            self.connected = true;
            self.connect_deadline = None;
            self.events.push_back(IceEvent::Connected);
        }
    }
}
