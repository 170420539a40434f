//! [XMPP](https://xmpp.org/) stream negotiation, for both ends of a client
//! stream, with asynchronous I/O using [tokio](https://tokio.rs/).
//!
//! # Getting started
//!
//! In most cases, you want to start with a [`Client`], that will connect to
//! a server over TCP/IP with StartTLS encryption. Then, you can build an
//! event loop by calling the client's `next` method repeatedly. Servers
//! accept connections with [`server::ClientListener`] and get one
//! [`server::IncomingClient`] per connection.
//!
//! # Design
//!
//! The protocol logic lives in sans-IO state machines,
//! [`client::ClientNegotiator`] and [`server::ServerNegotiator`]: they are
//! fed received text, elapsed time and transport events, and produce
//! [`Output`]s. They can be driven by any I/O loop, and are tested without
//! any network. The tokio drivers in [`client`] and [`server`] are thin
//! loops around them.
//!
//! # Features
//!
//! Supported:
//! - [x] Clients, with automatic reconnection and XEP-0198 resumption
//! - [x] Servers accepting clients (SASL PLAIN and DIGEST-MD5, SASL2 with
//!   inline binding)
//! - [x] Plaintext TCP (IPv4/IPv6)
//! - [x] StartTLS TCP (IPv4/IPv6 with [happy eyeballs](https://en.wikipedia.org/wiki/Happy_Eyeballs) support)
//! - [x] Custom connectors via the [`connect::ServerConnector`] trait
//! - [ ] Components
//! - [ ] Websockets
//! - [ ] BOSH

#![deny(unsafe_code, missing_docs, bare_trait_objects)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod auth;
/// Client side: the negotiator and its tokio driver
pub mod client;
pub mod config;
pub mod connect;
/// Detailed error types
pub mod error;
mod event;
pub mod framer;
pub mod ns;
pub mod reconnect;
pub mod server;
mod stream_management;
pub mod stream_start;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig, StreamSecurityMode};
#[doc(inline)]
/// Generic xmpp_stream Error
pub use crate::error::Error;
pub use event::{Event, Output};
pub use reconnect::{ReconnectPolicy, ReconnectionSupervisor};

// Re-exports
pub use xmpp_parsers::{jid, minidom};
