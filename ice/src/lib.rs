//! [ICE](https://www.rfc-editor.org/rfc/rfc5245) for XMPP Jingle sessions,
//! with the [STUN](https://www.rfc-editor.org/rfc/rfc5389) and
//! [TURN](https://www.rfc-editor.org/rfc/rfc5766) pieces it needs.
//!
//! # Design
//!
//! [`IceConnection`] and everything below it do no I/O: they are fed the
//! datagrams received on their sockets and the current time, and hand out
//! the datagrams to send, the events and the next deadline. The
//! [`UdpIceDriver`] runs a connection over tokio UDP sockets.
//!
//! ```no_run
//! # async fn run() -> Result<(), xmpp_ice::Error> {
//! use xmpp_ice::{IceConfig, IceConnection, IceEvent, UdpIceDriver};
//!
//! let connection = IceConnection::new(IceConfig {
//!     controlling: true,
//!     ..IceConfig::default()
//! });
//! let mut driver = UdpIceDriver::bind(connection, &["127.0.0.1".parse().unwrap()])?;
//! // Signal our credentials and candidates, add the peer's ones, then:
//! driver.connect_to_host().await;
//! loop {
//!     match driver.next_event().await? {
//!         IceEvent::Connected => driver.send_datagram(1, b"hello").await?,
//!         IceEvent::DatagramReceived { data, .. } => println!("{:?}", data),
//!         IceEvent::Disconnected => break,
//!         _ => (),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! Supported:
//! - [x] Host, server-reflexive, peer-reflexive and relayed candidates
//! - [x] UDP over IPv4 and IPv6, with link-local addresses
//! - [x] Aggressive nomination by the controlling agent
//! - [ ] TCP candidates
//! - [ ] Tie-breaker based role conflict resolution

#![deny(unsafe_code, missing_docs, bare_trait_objects)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod candidate;
pub mod component;
pub mod connection;
pub mod driver;
/// Detailed error types
pub mod error;
pub mod stun;
pub mod turn;

pub use candidate::{Candidate, CandidatePair, CandidateType, PairState};
pub use component::{GatheringState, IceComponent, Transmit, TurnServer};
pub use connection::{IceConfig, IceConnection, IceEvent};
pub use driver::UdpIceDriver;
#[doc(inline)]
/// Generic xmpp_ice Error
pub use crate::error::Error;
pub use turn::TurnAllocation;
