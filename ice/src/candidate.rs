//! ICE candidates ([RFC 5245](https://www.rfc-editor.org/rfc/rfc5245)) and
//! candidate pairs.

use core::fmt;
use core::str::FromStr;
use std::net::{IpAddr, SocketAddr};

use crc::{Crc, CRC_32_ISO_HDLC};
use rand::{distributions::Alphanumeric, Rng};

use crate::stun::StunTransaction;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Local preference used for every candidate, we do not rank interfaces.
const LOCAL_PREFERENCE: u32 = 65535;

/// Random alphanumeric string, for candidate ids and credentials.
pub(crate) fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Whether `ip` is an IPv6 link-local address (fe80::/10).
pub fn is_ipv6_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => false,
        IpAddr::V6(ip) => ip.segments()[0] & 0xffc0 == 0xfe80,
    }
}

/// How a candidate was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Address of a local interface
    Host,
    /// Learned from a connectivity check of the peer
    PeerReflexive,
    /// Our address as seen by a STUN server
    ServerReflexive,
    /// Allocated on a TURN server
    Relayed,
}

impl CandidateType {
    /// Type preference of RFC 5245, section 4.1.2.2.
    pub fn preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }

    /// Name used in SDP and Jingle.
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relayed => "relay",
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for CandidateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "host" => CandidateType::Host,
            "prflx" => CandidateType::PeerReflexive,
            "srflx" => CandidateType::ServerReflexive,
            "relay" => CandidateType::Relayed,
            _ => return Err(format!("unknown candidate type {}", s)),
        })
    }
}

/// Priority of a candidate, per RFC 5245, section 4.1.2.1.
pub fn candidate_priority(kind: CandidateType, component: u8) -> u32 {
    (1 << 24) * kind.preference() + (1 << 8) * LOCAL_PREFERENCE + (256 - u32::from(component))
}

/// Foundation shared by candidates of the same type, protocol and base.
pub fn foundation(kind: CandidateType, protocol: &str, base: IpAddr) -> String {
    let key = format!("{} {} {}", kind, protocol, base);
    CRC32.checksum(key.as_bytes()).to_string()
}

/// A transport address one side may be reached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Component, 1 for RTP and 2 for RTCP
    pub component: u8,
    /// Groups candidates of the same type, protocol and base
    pub foundation: String,
    /// Unique identifier, as carried by Jingle
    pub id: String,
    /// Transport address
    pub address: SocketAddr,
    /// Transport protocol, only "udp" is supported
    pub protocol: String,
    /// How the candidate was obtained
    pub kind: CandidateType,
    /// Priority, higher is better
    pub priority: u32,
}

impl Candidate {
    /// A local UDP candidate, with its priority and foundation computed
    /// from its type and base address.
    pub fn new(component: u8, kind: CandidateType, address: SocketAddr, base: IpAddr) -> Self {
        Candidate {
            component,
            foundation: foundation(kind, "udp", base),
            id: random_token(10),
            address,
            protocol: String::from("udp"),
            kind,
            priority: candidate_priority(kind, component),
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} {} {}", self.kind, self.protocol, self.address)
    }
}

/// Where the local end of a pair sends from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalTransport {
    /// A bound UDP socket
    Host(SocketAddr),
    /// Through the TURN allocation
    Relayed,
}

impl fmt::Display for LocalTransport {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LocalTransport::Host(address) => write!(fmt, "local {}", address),
            LocalTransport::Relayed => write!(fmt, "relayed"),
        }
    }
}

/// Connectivity check state of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// Checks have not started
    Frozen,
    /// Ready to be checked
    Waiting,
    /// A check is in flight
    InProgress,
    /// A check got a valid response
    Succeeded,
    /// A check failed or timed out
    Failed,
}

/// Priority of a pair, per RFC 5245, section 5.7.2.
///
/// `controlling` tells which of `local` and `remote` is the controlling
/// agent's candidate priority.
pub fn pair_priority(controlling: bool, local: u32, remote: u32) -> u64 {
    let (g, d) = if controlling {
        (local, remote)
    } else {
        (remote, local)
    };
    (1u64 << 32) * u64::from(g.min(d)) + 2 * u64::from(g.max(d)) + u64::from(g > d)
}

/// A local transport and a remote candidate, checked together.
#[derive(Debug)]
pub struct CandidatePair {
    /// Local end
    pub local: LocalTransport,
    /// Remote end
    pub remote: Candidate,
    /// Check state
    pub state: PairState,
    /// Selected for use by the controlling agent
    pub nominated: bool,
    /// Our address as seen by the peer, from the check response
    pub reflexive: Option<SocketAddr>,
    local_priority: u32,
    controlling: bool,
    pub(crate) check: Option<StunTransaction>,
}

impl CandidatePair {
    pub(crate) fn new(local: LocalTransport, remote: Candidate, controlling: bool) -> Self {
        let kind = match local {
            LocalTransport::Host(_) => CandidateType::Host,
            LocalTransport::Relayed => CandidateType::Relayed,
        };
        CandidatePair {
            local,
            local_priority: candidate_priority(kind, remote.component),
            remote,
            state: PairState::Frozen,
            nominated: false,
            reflexive: None,
            controlling,
            check: None,
        }
    }

    /// Pair priority, from the controlling agent's point of view.
    pub fn priority(&self) -> u64 {
        pair_priority(self.controlling, self.local_priority, self.remote.priority)
    }

    pub(crate) fn set_controlling(&mut self, controlling: bool) {
        self.controlling = controlling;
    }

    /// Whether this pair joins `local` to `remote`.
    pub fn is(&self, local: LocalTransport, remote: SocketAddr) -> bool {
        self.local == local && self.remote.address == remote
    }
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} ({})", self.remote.address, self.local)?;
        if let Some(reflexive) = self.reflexive {
            write!(fmt, " (reflexive {})", reflexive)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities() {
        assert_eq!(candidate_priority(CandidateType::Host, 1), 2130706431);
        assert_eq!(candidate_priority(CandidateType::Host, 2), 2130706430);
        assert_eq!(candidate_priority(CandidateType::PeerReflexive, 1), 1862270975);
        assert_eq!(candidate_priority(CandidateType::ServerReflexive, 1), 1694498815);
        assert_eq!(candidate_priority(CandidateType::Relayed, 1), 16777215);
    }

    #[test]
    fn pair_priority_ordering() {
        let host = candidate_priority(CandidateType::Host, 1);
        let relay = candidate_priority(CandidateType::Relayed, 1);

        // host/host: G == D.
        let host_host = pair_priority(true, host, host);
        assert_eq!(host_host, (1u64 << 32) * 2130706431 + 2 * 2130706431);

        // host/relay, from both roles.
        let controlling = pair_priority(true, host, relay);
        assert_eq!(controlling, (1u64 << 32) * 16777215 + 2 * 2130706431 + 1);
        let controlled = pair_priority(false, host, relay);
        assert_eq!(controlled, (1u64 << 32) * 16777215 + 2 * 2130706431);

        for controlling in [true, false] {
            assert!(pair_priority(controlling, host, host) > pair_priority(controlling, host, relay));
            assert!(pair_priority(controlling, host, relay) > pair_priority(controlling, relay, relay));
        }
    }

    #[test]
    fn link_local() {
        assert!(is_ipv6_link_local(&"fe80::1".parse().unwrap()));
        assert!(is_ipv6_link_local(&"febf::1".parse().unwrap()));
        assert!(!is_ipv6_link_local(&"fec0::1".parse().unwrap()));
        assert!(!is_ipv6_link_local(&"2001:db8::1".parse().unwrap()));
        assert!(!is_ipv6_link_local(&"169.254.0.1".parse().unwrap()));
    }

    #[test]
    fn candidate() {
        let base: IpAddr = "192.0.2.1".parse().unwrap();
        let host = Candidate::new(1, CandidateType::Host, "192.0.2.1:49152".parse().unwrap(), base);
        let srflx = Candidate::new(
            1,
            CandidateType::ServerReflexive,
            "203.0.113.1:40000".parse().unwrap(),
            base,
        );
        assert_eq!(host.priority, 2130706431);
        assert_eq!(host.id.len(), 10);
        assert_ne!(host.foundation, srflx.foundation);
        assert_eq!(
            host.foundation,
            Candidate::new(2, CandidateType::Host, "192.0.2.1:49153".parse().unwrap(), base).foundation
        );
        assert_eq!(host.to_string(), "host udp 192.0.2.1:49152");
        assert_eq!("srflx".parse::<CandidateType>(), Ok(CandidateType::ServerReflexive));
    }
}
