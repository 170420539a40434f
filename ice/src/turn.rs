//! Relayed transport addresses allocated on a TURN server
//! ([RFC 5766](https://www.rfc-editor.org/rfc/rfc5766)).

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};

use crate::error::Error;
use crate::stun::{
    demux, random_id, Class, Datagram, ErrorCode, Method, StunMessage, StunTransaction, SOFTWARE,
};

/// Lifetime we ask for, in seconds.
const DEFAULT_LIFETIME: u32 = 600;

/// How long before expiry the allocation is refreshed, in seconds.
const REFRESH_MARGIN: u32 = 60;

/// Channel bindings expire after 10 minutes.
const CHANNEL_REFRESH_INTERVAL: Duration = Duration::from_secs(500);

const FIRST_CHANNEL: u16 = 0x4000;
const LAST_CHANNEL: u16 = 0x7ffe;

/// REQUESTED-TRANSPORT value for UDP.
const TRANSPORT_UDP: u8 = 0x11;

/// State of a [`TurnAllocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    /// No allocation
    Unconnected,
    /// Allocate request in flight
    Connecting,
    /// A relayed address is allocated
    Connected,
    /// Releasing the allocation
    Closing,
}

/// Things that happened to a [`TurnAllocation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// The relayed address is available
    Connected,
    /// The allocation failed, expired or was released
    Disconnected,
    /// Data relayed from a peer
    DatagramReceived {
        /// Payload
        data: Vec<u8>,
        /// Peer that sent it to the relayed address
        peer: SocketAddr,
    },
}

/// A TURN allocation, without any I/O.
///
/// Everything [`poll_transmit`][Self::poll_transmit] returns goes to the
/// TURN server, and everything received from the server must be fed to
/// [`handle_datagram`][Self::handle_datagram].
#[derive(Debug)]
pub struct TurnAllocation {
    server: SocketAddr,
    username: String,
    password: String,
    realm: Option<String>,
    nonce: Option<Vec<u8>>,
    key: Option<Vec<u8>>,
    state: AllocationState,
    relayed: Option<SocketAddr>,
    lifetime: u32,
    refresh_at: Option<Instant>,
    channels: BTreeMap<u16, SocketAddr>,
    next_channel: u16,
    channel_refresh_at: Option<Instant>,
    transactions: Vec<StunTransaction>,
    transmits: VecDeque<Vec<u8>>,
    events: VecDeque<TurnEvent>,
}

impl TurnAllocation {
    /// An allocation on `server`, authenticated with the long-term
    /// credentials `username` and `password`.
    pub fn new<U: Into<String>, P: Into<String>>(server: SocketAddr, username: U, password: P) -> Self {
        TurnAllocation {
            server,
            username: username.into(),
            password: password.into(),
            realm: None,
            nonce: None,
            key: None,
            state: AllocationState::Unconnected,
            relayed: None,
            lifetime: DEFAULT_LIFETIME,
            refresh_at: None,
            channels: BTreeMap::new(),
            next_channel: FIRST_CHANNEL,
            channel_refresh_at: None,
            transactions: Vec::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Address of the TURN server.
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Current state.
    pub fn state(&self) -> AllocationState {
        self.state
    }

    /// The relayed transport address, once connected.
    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.relayed
    }

    /// Lifetime granted by the server, in seconds.
    pub fn lifetime(&self) -> u32 {
        self.lifetime
    }

    /// Ask the server for an allocation.
    pub fn connect(&mut self, now: Instant) {
        if self.state != AllocationState::Unconnected {
            return;
        }
        let mut request = self.request(Method::Allocate);
        request.lifetime = Some(self.lifetime);
        request.requested_transport = Some(TRANSPORT_UDP);
        self.start(request, now);
        self.set_state(AllocationState::Connecting);
        self.process(now);
    }

    /// Release the allocation. All timers stop, except the one of the
    /// releasing request.
    pub fn disconnect(&mut self, now: Instant) {
        self.refresh_at = None;
        self.channel_refresh_at = None;
        self.channels.clear();
        self.transactions.clear();
        if self.state == AllocationState::Connected {
            let mut request = self.request(Method::Refresh);
            request.lifetime = Some(0);
            self.start(request, now);
            self.set_state(AllocationState::Closing);
        } else {
            self.set_state(AllocationState::Unconnected);
        }
        self.process(now);
    }

    /// Relay `data` to `peer`, binding a channel to it first if needed.
    pub fn send_to(&mut self, data: &[u8], peer: SocketAddr, now: Instant) -> Result<(), Error> {
        if self.state != AllocationState::Connected {
            return Err(Error::NotConnected);
        }
        let length = u16::try_from(data.len())
            .map_err(|_| Error::Turn(format!("datagram of {} bytes too large", data.len())))?;
        let channel = match self.channels.iter().find(|(_, address)| **address == peer) {
            Some((channel, _)) => *channel,
            None => {
                if self.next_channel > LAST_CHANNEL {
                    return Err(Error::Turn(String::from("no channel number left")));
                }
                let channel = self.next_channel;
                self.next_channel += 1;
                self.channels.insert(channel, peer);
                self.bind_channel(channel, peer, now);
                if self.channel_refresh_at.is_none() {
                    self.channel_refresh_at = Some(now + CHANNEL_REFRESH_INTERVAL);
                }
                self.process(now);
                channel
            }
        };
        let mut frame = BytesMut::with_capacity(4 + data.len());
        frame.put_u16(channel);
        frame.put_u16(length);
        frame.put_slice(data);
        self.transmits.push_back(frame.to_vec());
        Ok(())
    }

    /// Feed a datagram received from the TURN server.
    pub fn handle_datagram(&mut self, buffer: &[u8], now: Instant) {
        match demux(buffer) {
            Datagram::ChannelData { channel, data } => {
                if self.state != AllocationState::Connected {
                    return;
                }
                match self.channels.get(&channel) {
                    Some(peer) => self.events.push_back(TurnEvent::DatagramReceived {
                        data: data.to_vec(),
                        peer: *peer,
                    }),
                    None => log::debug!("Data on unknown channel 0x{:04x}", channel),
                }
            }
            Datagram::Stun { .. } => {
                let message = match StunMessage::decode(buffer, None) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Dropping TURN packet: {}", e);
                        return;
                    }
                };
                log::trace!("TURN packet from {}\n{}", self.server, message);
                if let Some(transaction) = self
                    .transactions
                    .iter_mut()
                    .find(|transaction| transaction.matches(&message))
                {
                    transaction.handle_response(message);
                }
                self.process(now);
            }
            Datagram::Other(_) => log::debug!("Ignoring non-STUN packet from TURN server"),
        }
    }

    /// Next datagram to send to the server.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.transmits.pop_front()
    }

    /// Next event.
    pub fn poll_event(&mut self) -> Option<TurnEvent> {
        self.events.pop_front()
    }

    /// When [`handle_timeout`][Self::handle_timeout] should be called next.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.transactions
            .iter()
            .filter_map(StunTransaction::poll_timeout)
            .chain(self.refresh_at)
            .chain(self.channel_refresh_at)
            .min()
    }

    /// Retransmit requests and refresh the allocation and channels.
    pub fn handle_timeout(&mut self, now: Instant) {
        for transaction in &mut self.transactions {
            transaction.handle_timeout(now);
        }
        if matches!(self.refresh_at, Some(at) if at <= now) {
            self.refresh_at = None;
            let mut request = self.request(Method::Refresh);
            request.lifetime = Some(self.lifetime);
            self.start(request, now);
        }
        if matches!(self.channel_refresh_at, Some(at) if at <= now) {
            let channels: Vec<(u16, SocketAddr)> =
                self.channels.iter().map(|(c, p)| (*c, *p)).collect();
            for (channel, peer) in channels {
                self.bind_channel(channel, peer, now);
            }
            self.channel_refresh_at = Some(now + CHANNEL_REFRESH_INTERVAL);
        }
        self.process(now);
    }

    fn request(&self, method: Method) -> StunMessage {
        let mut request = StunMessage::new(method, Class::Request, random_id());
        request.software = Some(String::from(SOFTWARE));
        if self.nonce.is_some() {
            request.nonce.clone_from(&self.nonce);
            request.realm.clone_from(&self.realm);
            request.username = Some(self.username.clone());
        }
        request
    }

    fn bind_channel(&mut self, channel: u16, peer: SocketAddr, now: Instant) {
        let mut request = self.request(Method::ChannelBind);
        request.channel_number = Some(channel);
        request.xor_peer_address = Some(peer);
        self.start(request, now);
    }

    fn start(&mut self, request: StunMessage, now: Instant) {
        log::trace!("TURN packet to {}\n{}", self.server, request);
        self.transactions.push(StunTransaction::new(request, now));
    }

    /// Handle finished transactions, then queue due transmissions.
    fn process(&mut self, now: Instant) {
        let (finished, pending): (Vec<_>, Vec<_>) = self
            .transactions
            .drain(..)
            .partition(StunTransaction::is_finished);
        self.transactions = pending;
        for transaction in finished {
            self.transaction_finished(transaction, now);
        }
        for transaction in &mut self.transactions {
            if let Some(request) = transaction.poll_transmit() {
                self.transmits
                    .push_back(request.encode(self.key.as_deref(), true));
            }
        }
    }

    fn transaction_finished(&mut self, transaction: StunTransaction, now: Instant) {
        let Some(reply) = transaction.response() else {
            return;
        };
        let request = transaction.request();
        let error = match (reply.class(), &reply.error) {
            (Class::Error, Some(error)) => Some(error.clone()),
            (Class::Error, None) => Some(ErrorCode::new(0, "")),
            _ => None,
        };

        if let Some(ErrorCode {
            code: ErrorCode::UNAUTHORIZED,
            ..
        }) = error
        {
            let fresh_nonce = reply.nonce.is_some() && reply.nonce != self.nonce;
            let fresh_realm = reply.realm.is_some() && reply.realm != self.realm;
            if fresh_nonce || fresh_realm {
                self.nonce.clone_from(&reply.nonce);
                self.realm.clone_from(&reply.realm);
                let credentials = format!(
                    "{}:{}:{}",
                    self.username,
                    self.realm.as_deref().unwrap_or(""),
                    self.password
                );
                self.key = Some(Md5::digest(credentials.as_bytes()).to_vec());

                let mut retry = request.clone();
                retry.id = random_id();
                retry.nonce.clone_from(&self.nonce);
                retry.realm.clone_from(&self.realm);
                retry.username = Some(self.username.clone());
                self.start(retry, now);
                return;
            }
        }

        match request.method() {
            Method::Allocate => {
                if let Some(error) = error {
                    log::warn!("Allocation failed: {} {}", error.code, error.reason);
                    self.set_state(AllocationState::Unconnected);
                    return;
                }
                match reply.xor_relayed_address {
                    Some(relayed) if relayed.is_ipv4() && relayed.port() != 0 => {
                        self.relayed = Some(relayed);
                    }
                    _ => {
                        log::warn!("Allocation did not yield a valid relayed address");
                        self.set_state(AllocationState::Unconnected);
                        return;
                    }
                }
                self.schedule_refresh(reply.lifetime, now);
                log::debug!(
                    "Allocated {:?} on {} for {}s",
                    self.relayed,
                    self.server,
                    self.lifetime
                );
                self.set_state(AllocationState::Connected);
            }
            Method::ChannelBind => {
                if let Some(error) = error {
                    log::warn!("ChannelBind failed: {} {}", error.code, error.reason);
                    if let Some(channel) = request.channel_number {
                        self.channels.remove(&channel);
                    }
                    if self.channels.is_empty() {
                        self.channel_refresh_at = None;
                    }
                }
            }
            Method::Refresh => {
                if let Some(error) = error {
                    log::warn!("Refresh failed: {} {}", error.code, error.reason);
                    self.set_state(AllocationState::Unconnected);
                } else if self.state == AllocationState::Closing {
                    self.set_state(AllocationState::Unconnected);
                } else {
                    self.schedule_refresh(reply.lifetime, now);
                }
            }
            method => log::debug!("Unexpected {} transaction finished", method),
        }
    }

    fn schedule_refresh(&mut self, lifetime: Option<u32>, now: Instant) {
        if let Some(lifetime) = lifetime {
            self.lifetime = lifetime;
        }
        let delay = self.lifetime.saturating_sub(REFRESH_MARGIN);
        self.refresh_at = Some(now + Duration::from_secs(u64::from(delay)));
    }

    fn set_state(&mut self, state: AllocationState) {
        if state == self.state {
            return;
        }
        self.state = state;
        match state {
            AllocationState::Connected => self.events.push_back(TurnEvent::Connected),
            AllocationState::Unconnected => {
                self.refresh_at = None;
                self.channel_refresh_at = None;
                self.channels.clear();
                self.transactions.clear();
                self.relayed = None;
                self.events.push_back(TurnEvent::Disconnected);
            }
            AllocationState::Connecting | AllocationState::Closing => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> SocketAddr {
        "198.51.100.1:3478".parse().unwrap()
    }

    fn relayed() -> SocketAddr {
        "203.0.113.5:50000".parse().unwrap()
    }

    /// Decode the next request sent to the server.
    fn next_request(turn: &mut TurnAllocation) -> StunMessage {
        let packet = turn.poll_transmit().expect("no packet sent");
        StunMessage::decode(&packet, None).unwrap()
    }

    fn reply(turn: &mut TurnAllocation, request: &StunMessage, class: Class, now: Instant) -> StunMessage {
        let mut response = StunMessage::new(request.method(), class, request.id);
        if request.method() == Method::Allocate && class == Class::Response {
            response.xor_relayed_address = Some(relayed());
            response.lifetime = Some(600);
        }
        if class == Class::Error {
            response.error = Some(ErrorCode::new(400, "Bad Request"));
        }
        turn.handle_datagram(&response.encode(None, true), now);
        response
    }

    fn connected(now: Instant) -> TurnAllocation {
        let mut turn = TurnAllocation::new(server(), "user", "secret");
        turn.connect(now);
        let request = next_request(&mut turn);
        reply(&mut turn, &request, Class::Response, now);
        assert_eq!(turn.poll_event(), Some(TurnEvent::Connected));
        turn
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let now = Instant::now();
        let mut turn = connected(now);
        let peer: SocketAddr = "192.0.2.7:6000".parse().unwrap();

        match turn.send_to(&vec![0; 70000], peer, now) {
            Err(Error::Turn(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        // No channel was bound for it.
        assert_eq!(turn.poll_transmit(), None);

        turn.send_to(&vec![0; 65535], peer, now).unwrap();
        let bind = next_request(&mut turn);
        assert_eq!(bind.channel_number, Some(0x4000));
        let frame = turn.poll_transmit().unwrap();
        assert_eq!(&frame[..4], b"\x40\x00\xff\xff");
        assert_eq!(frame.len(), 4 + 65535);
    }

    #[test]
    fn channel_data_both_ways() {
        let now = Instant::now();
        let mut turn = connected(now);
        let peer: SocketAddr = "192.0.2.7:6000".parse().unwrap();

        turn.send_to(b"hello", peer, now).unwrap();
        let bind = next_request(&mut turn);
        assert_eq!(bind.method(), Method::ChannelBind);
        assert_eq!(bind.channel_number, Some(0x4000));
        assert_eq!(bind.xor_peer_address, Some(peer));
        assert_eq!(turn.poll_transmit().unwrap(), b"\x40\x00\x00\x05hello");

        // Same peer, same channel, no new binding.
        turn.send_to(b"again", peer, now).unwrap();
        assert_eq!(turn.poll_transmit().unwrap(), b"\x40\x00\x00\x05again");
        assert_eq!(turn.poll_transmit(), None);

        turn.handle_datagram(b"\x40\x00\x00\x03abc", now);
        assert_eq!(
            turn.poll_event(),
            Some(TurnEvent::DatagramReceived {
                data: b"abc".to_vec(),
                peer
            })
        );

        // Unknown channel.
        turn.handle_datagram(b"\x40\x07\x00\x03abc", now);
        assert_eq!(turn.poll_event(), None);
    }

    #[test]
    fn failed_channel_bind_removes_only_that_channel() {
        let now = Instant::now();
        let mut turn = connected(now);
        let first: SocketAddr = "192.0.2.7:6000".parse().unwrap();
        let second: SocketAddr = "192.0.2.8:6000".parse().unwrap();

        turn.send_to(b"1", first, now).unwrap();
        let first_bind = next_request(&mut turn);
        turn.poll_transmit();
        turn.send_to(b"2", second, now).unwrap();
        let second_bind = next_request(&mut turn);
        turn.poll_transmit();

        reply(&mut turn, &first_bind, Class::Response, now);
        reply(&mut turn, &second_bind, Class::Error, now);

        turn.handle_datagram(b"\x40\x00\x00\x01a", now);
        turn.handle_datagram(b"\x40\x01\x00\x01b", now);
        assert!(matches!(
            turn.poll_event(),
            Some(TurnEvent::DatagramReceived { peer, .. }) if peer == first
        ));
        assert_eq!(turn.poll_event(), None);
        assert_eq!(turn.state(), AllocationState::Connected);
    }

    #[test]
    fn channels_are_refreshed() {
        let now = Instant::now();
        let mut turn = connected(now);
        let peer: SocketAddr = "192.0.2.7:6000".parse().unwrap();
        turn.send_to(b"x", peer, now).unwrap();
        let bind = next_request(&mut turn);
        turn.poll_transmit();
        reply(&mut turn, &bind, Class::Response, now);

        let later = now + CHANNEL_REFRESH_INTERVAL;
        turn.handle_timeout(later);
        let rebind = next_request(&mut turn);
        assert_eq!(rebind.method(), Method::ChannelBind);
        assert_eq!(rebind.channel_number, Some(0x4000));
        assert_ne!(rebind.id, bind.id);
    }

    #[test]
    fn disconnect_releases_allocation() {
        let now = Instant::now();
        let mut turn = connected(now);
        turn.disconnect(now);
        assert_eq!(turn.state(), AllocationState::Closing);
        let refresh = next_request(&mut turn);
        assert_eq!(refresh.method(), Method::Refresh);
        assert_eq!(refresh.lifetime, Some(0));

        reply(&mut turn, &refresh, Class::Response, now);
        assert_eq!(turn.state(), AllocationState::Unconnected);
        assert_eq!(turn.poll_event(), Some(TurnEvent::Disconnected));
        assert_eq!(turn.poll_timeout(), None);
        assert!(matches!(
            turn.send_to(b"x", relayed(), now),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn allocate_timeout() {
        let start = Instant::now();
        let mut turn = TurnAllocation::new(server(), "user", "secret");
        turn.connect(start);
        let mut sent = 0;
        while let Some(deadline) = turn.poll_timeout() {
            while turn.poll_transmit().is_some() {
                sent += 1;
            }
            turn.handle_timeout(deadline);
        }
        assert_eq!(sent, 8);
        assert_eq!(turn.state(), AllocationState::Unconnected);
        assert_eq!(turn.poll_event(), Some(TurnEvent::Disconnected));
    }

    #[test]
    fn repeated_challenge_is_a_failure() {
        let now = Instant::now();
        let mut turn = TurnAllocation::new(server(), "user", "secret");
        turn.connect(now);
        for _ in 0..2 {
            let request = next_request(&mut turn);
            let mut challenge = StunMessage::new(Method::Allocate, Class::Error, request.id);
            challenge.error = Some(ErrorCode::new(401, "Unauthorized"));
            challenge.nonce = Some(b"abc".to_vec());
            challenge.realm = Some(String::from("example.com"));
            turn.handle_datagram(&challenge.encode(None, false), now);
        }
        assert_eq!(turn.state(), AllocationState::Unconnected);
        assert_eq!(turn.poll_event(), Some(TurnEvent::Disconnected));
    }
}
