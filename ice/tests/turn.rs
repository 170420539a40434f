use std::net::SocketAddr;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};

use xmpp_ice::candidate::{candidate_priority, LocalTransport};
use xmpp_ice::stun::{demux, Class, Datagram, ErrorCode, Method, StunMessage};
use xmpp_ice::turn::{AllocationState, TurnEvent};
use xmpp_ice::{
    Candidate, CandidateType, GatheringState, IceComponent, PairState, TurnAllocation, TurnServer,
};

const REMOTE_PASSWORD: &[u8] = b"remotepassword";

fn server() -> SocketAddr {
    "198.51.100.10:3478".parse().unwrap()
}

fn relayed() -> SocketAddr {
    "203.0.113.5:50000".parse().unwrap()
}

#[test]
fn allocation_with_long_term_credentials() {
    let now = Instant::now();
    let mut turn = TurnAllocation::new(server(), "alice", "secret");
    turn.connect(now);
    assert_eq!(turn.state(), AllocationState::Connecting);

    let request = StunMessage::decode(&turn.poll_transmit().unwrap(), None).unwrap();
    assert_eq!(request.method(), Method::Allocate);
    assert_eq!(request.class(), Class::Request);
    assert_eq!(request.requested_transport, Some(0x11));
    assert_eq!(request.username, None);

    let mut challenge = StunMessage::new(Method::Allocate, Class::Error, request.id);
    challenge.error = Some(ErrorCode::new(ErrorCode::UNAUTHORIZED, "Unauthorized"));
    challenge.nonce = Some(b"abc".to_vec());
    challenge.realm = Some(String::from("example.com"));
    turn.handle_datagram(&challenge.encode(None, true), now);

    let key = Md5::digest(b"alice:example.com:secret");
    let data = turn.poll_transmit().unwrap();
    assert!(StunMessage::decode(&data, Some(&b"wrong"[..])).is_err());
    let retry = StunMessage::decode(&data, Some(key.as_slice())).unwrap();
    assert_eq!(retry.method(), Method::Allocate);
    assert_ne!(retry.id, request.id);
    assert_eq!(retry.username.as_deref(), Some("alice"));
    assert_eq!(retry.realm.as_deref(), Some("example.com"));
    assert_eq!(retry.nonce.as_deref(), Some(&b"abc"[..]));

    let mut success = StunMessage::new(Method::Allocate, Class::Response, retry.id);
    success.xor_relayed_address = Some(relayed());
    success.xor_mapped_address = Some("192.0.2.1:40000".parse().unwrap());
    success.lifetime = Some(600);
    turn.handle_datagram(&success.encode(Some(key.as_slice()), true), now);

    assert_eq!(turn.poll_event(), Some(TurnEvent::Connected));
    assert_eq!(turn.state(), AllocationState::Connected);
    assert_eq!(turn.relayed_address(), Some(relayed()));
    assert_eq!(turn.poll_timeout(), Some(now + Duration::from_secs(540)));

    // The refresh is authenticated the same way.
    let now = now + Duration::from_secs(540);
    turn.handle_timeout(now);
    let refresh = StunMessage::decode(&turn.poll_transmit().unwrap(), Some(key.as_slice())).unwrap();
    assert_eq!(refresh.method(), Method::Refresh);
    assert_eq!(refresh.lifetime, Some(600));
}

#[test]
fn connectivity_check_through_relay() {
    let now = Instant::now();
    let local: SocketAddr = "10.0.0.1:5000".parse().unwrap();
    let peer: SocketAddr = "192.0.2.7:6000".parse().unwrap();

    let mut component = IceComponent::new(1, true);
    component.set_remote_user("REMO");
    component.set_remote_password("remotepassword");
    component.set_turn_server(Some(TurnServer {
        address: server(),
        username: String::from("alice"),
        password: String::from("secret"),
    }));
    component.set_sockets(vec![local], now);
    assert_eq!(component.gathering_state(), GatheringState::Busy);

    let transmit = component.poll_transmit().unwrap();
    assert_eq!((transmit.local, transmit.destination), (local, server()));
    let allocate = StunMessage::decode(&transmit.data, None).unwrap();
    let mut success = StunMessage::new(Method::Allocate, Class::Response, allocate.id);
    success.xor_relayed_address = Some(relayed());
    success.lifetime = Some(600);
    component.handle_datagram(local, server(), &success.encode(None, true), now);

    assert_eq!(component.gathering_state(), GatheringState::Complete);
    let relay = component
        .local_candidates()
        .iter()
        .find(|candidate| candidate.kind == CandidateType::Relayed)
        .unwrap();
    assert_eq!(relay.address, relayed());
    assert_eq!(relay.priority, candidate_priority(CandidateType::Relayed, 1));

    let candidate = Candidate::new(1, CandidateType::Host, peer, peer.ip());
    assert!(component.add_remote_candidate(candidate));
    assert_eq!(component.pairs().len(), 2);
    assert_eq!(component.pairs()[1].local, LocalTransport::Relayed);

    // The host pair goes first, the relayed one on the next tick.
    component.connect_to_host(now);
    let transmit = component.poll_transmit().unwrap();
    assert_eq!((transmit.local, transmit.destination), (local, peer));
    let now = now + Duration::from_millis(500);
    component.handle_timeout(now);

    let mut check = None;
    let mut channel_bind = None;
    while let Some(transmit) = component.poll_transmit() {
        if transmit.destination != server() {
            continue;
        }
        match demux(&transmit.data) {
            Datagram::ChannelData { channel, data } => {
                assert_eq!(channel, 0x4000);
                check = Some(StunMessage::decode(data, Some(REMOTE_PASSWORD)).unwrap());
            }
            Datagram::Stun { .. } => {
                channel_bind = Some(StunMessage::decode(&transmit.data, None).unwrap());
            }
            Datagram::Other(_) => panic!("unexpected datagram to the TURN server"),
        }
    }
    let channel_bind = channel_bind.unwrap();
    assert_eq!(channel_bind.method(), Method::ChannelBind);
    assert_eq!(channel_bind.channel_number, Some(0x4000));
    assert_eq!(channel_bind.xor_peer_address, Some(peer));
    let check = check.unwrap();
    assert_eq!(check.method(), Method::Binding);
    assert!(check.use_candidate);

    // The peer answers through the relay.
    let mut response = StunMessage::new(Method::Binding, Class::Response, check.id);
    response.xor_mapped_address = Some(relayed());
    let payload = response.encode(Some(REMOTE_PASSWORD), true);
    let mut frame = vec![0x40, 0x00];
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    component.handle_datagram(local, server(), &frame, now);

    let active = component.active_pair().unwrap();
    assert_eq!(active.local, LocalTransport::Relayed);
    assert_eq!(active.state, PairState::Succeeded);
    assert_eq!(active.reflexive, Some(relayed()));
}
