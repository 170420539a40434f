// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Client side of stream negotiation, without any I/O.
//!
//! The negotiator is fed with transport events ([`connected`],
//! [`handle_data`], [`tls_established`], [`transport_closed`]) and the
//! passage of time ([`handle_timeout`]). Whatever it wants to write, and the
//! events for the application, are collected with [`poll_output`].
//!
//! Security steps are strictly sequential: STARTTLS completes before any
//! credential is sent, SASL completes before binding, and binding completes
//! before stanzas can be exchanged.
//!
//! [`connected`]: ClientNegotiator::connected
//! [`handle_data`]: ClientNegotiator::handle_data
//! [`tls_established`]: ClientNegotiator::tls_established
//! [`transport_closed`]: ClientNegotiator::transport_closed
//! [`handle_timeout`]: ClientNegotiator::handle_timeout
//! [`poll_output`]: ClientNegotiator::poll_output

use std::collections::VecDeque;
use std::time::Instant;

use rand::{thread_rng, Rng};

use super::bind::{self, BIND_REQ_ID, SESSION_REQ_ID};
use crate::auth::{self, ClientCredentials, ClientMechanism, SaslCondition};
use crate::config::{ClientConfig, StreamSecurityMode};
use crate::error::{AuthError, Error, ProtocolError, StreamErrorCondition};
use crate::event::{Event, Output};
use crate::framer::{FramerEvent, XmlFramer};
use crate::jid::{FullJid, Jid};
use crate::minidom::Element;
use crate::ns;
use crate::stream_management::{self as sm, SmState};
use crate::stream_start::{StreamHeader, STREAM_END};

/// Where the negotiation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No transport, or the stream ended.
    Disconnected,
    /// Our stream header is sent, waiting for the server's.
    Connecting,
    /// Stream headers exchanged, waiting for features.
    StreamOpened,
    /// `<starttls/>` sent, waiting for `<proceed/>` and the handshake.
    TlsNegotiating,
    /// SASL or SASL2 exchange in progress.
    SaslNegotiating,
    /// Binding, stream management or session establishment in progress.
    ResourceBinding,
    /// Stanzas can be exchanged.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Nothing,
    Bind,
    Session,
    SmEnable,
    SmResume,
}

/// Sans-IO client stream negotiator.
#[derive(Debug)]
pub struct ClientNegotiator {
    config: ClientConfig,
    tls_available: bool,
    state: ClientState,
    framer: XmlFramer,
    outputs: VecDeque<Output>,

    /// Whether we sent a stream header not closed yet.
    stream_open: bool,
    stream_id: Option<String>,
    tls_active: bool,
    authenticated: bool,
    bound: bool,
    mechanism: Option<ClientMechanism>,
    sasl2: bool,
    features: Option<Element>,
    pending: Pending,
    sm_attempted: bool,
    session_done: bool,

    /// Survives reconnections, for stream resumption.
    bound_jid: Option<FullJid>,
    /// Survives reconnections, for stream resumption.
    sm: Option<SmState>,
    sm_active: bool,

    user_agent_id: String,
    next_ping: Option<Instant>,
    ping_deadline: Option<Instant>,
    ping_counter: u64,
}

fn make_user_agent_id() -> String {
    let mut bytes: [u8; 16] = thread_rng().gen();
    // UUID version 4, variant 1
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn mechanism_names(list: &Element, namespace: &str) -> Vec<String> {
    list.children()
        .filter(|child| child.is("mechanism", namespace))
        .map(|child| child.text().trim().to_owned())
        .collect()
}

fn is_ping_response(elem: &Element) -> bool {
    elem.name() == "iq"
        && elem.attr("id").map_or(false, |id| id.starts_with("ping_"))
        && matches!(elem.attr("type"), Some("result") | Some("error"))
}

impl ClientNegotiator {
    /// Create a negotiator. `tls_available` tells whether the transport can
    /// be upgraded when the server offers STARTTLS.
    pub fn new(config: ClientConfig, tls_available: bool) -> Self {
        ClientNegotiator {
            config,
            tls_available,
            state: ClientState::Disconnected,
            framer: XmlFramer::new(),
            outputs: VecDeque::new(),
            stream_open: false,
            stream_id: None,
            tls_active: false,
            authenticated: false,
            bound: false,
            mechanism: None,
            sasl2: false,
            features: None,
            pending: Pending::Nothing,
            sm_attempted: false,
            session_done: false,
            bound_jid: None,
            sm: None,
            sm_active: false,
            user_agent_id: make_user_agent_id(),
            next_ping: None,
            ping_deadline: None,
            ping_counter: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// JID the last session was bound to.
    pub fn bound_jid(&self) -> Option<&FullJid> {
        self.bound_jid.as_ref()
    }

    /// Stream id the server assigned to the current stream.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// Whether the transport is encrypted.
    pub fn is_secure(&self) -> bool {
        self.tls_active
    }

    /// Whether a previous session can be resumed on the next connection.
    pub fn is_resumable(&self) -> bool {
        self.sm
            .as_ref()
            .map_or(false, |sm| sm.resume_info().is_some())
    }

    /// Next output for the transport owner.
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    /// When [`Self::handle_timeout`] must be called next.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state != ClientState::Ready {
            return None;
        }
        match (self.next_ping, self.ping_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The transport connected: open a fresh stream.
    pub fn connected(&mut self, _now: Instant) {
        log::debug!("Transport connected, opening stream to {}", self.config.domain());
        self.tls_active = false;
        self.authenticated = false;
        self.bound = false;
        self.mechanism = None;
        self.sasl2 = false;
        self.features = None;
        self.pending = Pending::Nothing;
        self.sm_attempted = false;
        self.session_done = false;
        self.sm_active = false;
        self.next_ping = None;
        self.ping_deadline = None;
        self.open_stream();
    }

    /// The TLS handshake requested with [`Output::StartTls`] completed.
    pub fn tls_established(&mut self) -> Result<(), Error> {
        if self.state != ClientState::TlsNegotiating {
            return Err(Error::InvalidState);
        }
        log::debug!("TLS established, restarting stream");
        self.tls_active = true;
        self.open_stream();
        Ok(())
    }

    /// Feed text received from the transport.
    pub fn handle_data(&mut self, data: &str, now: Instant) {
        if self.state == ClientState::Disconnected {
            log::warn!("Dropping {} bytes received while disconnected", data.len());
            return;
        }
        self.ping_deadline = None;
        for event in self.framer.feed(data) {
            if self.state == ClientState::Disconnected {
                break;
            }
            match event {
                FramerEvent::Ping => log::trace!("Whitespace ping received"),
                FramerEvent::StreamOpen(header) => self.handle_stream_open(header),
                FramerEvent::Element(elem) => self.handle_element(elem, now),
                FramerEvent::StreamClose => {
                    let error = if self.state == ClientState::Ready {
                        Error::Disconnected
                    } else {
                        ProtocolError::StreamFooterReceived.into()
                    };
                    self.fail(error);
                }
            }
        }
    }

    /// The transport went away.
    pub fn transport_closed(&mut self, error: Option<Error>) {
        self.framer.reset();
        self.stream_open = false;
        if self.state == ClientState::Disconnected {
            return;
        }
        self.enter_disconnected(error.unwrap_or(Error::Disconnected));
    }

    /// Send a stanza on a ready stream.
    pub fn send_stanza(&mut self, stanza: Element) -> Result<(), Error> {
        if self.state != ClientState::Ready {
            return Err(Error::InvalidState);
        }
        self.send(&stanza);
        if self.sm_active {
            if let Some(sm) = self.sm.as_mut() {
                sm.enqueue(stanza);
            }
        }
        Ok(())
    }

    /// Close the stream on request of the application. A closed stream
    /// cannot be resumed.
    pub fn disconnect(&mut self) {
        self.sm = None;
        self.sm_active = false;
        if self.state == ClientState::Disconnected {
            return;
        }
        log::debug!("Closing stream on request");
        if self.stream_open {
            self.send_raw(STREAM_END.to_owned());
            self.stream_open = false;
        }
        self.outputs.push_back(Output::Close);
        self.enter_disconnected(Error::Disconnected);
    }

    /// Time passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state != ClientState::Ready {
            return;
        }
        if self.ping_deadline.map_or(false, |deadline| now >= deadline) {
            log::warn!("No data received since the last keep-alive ping");
            self.fail(Error::KeepAliveTimeout);
            return;
        }
        if self.next_ping.map_or(false, |at| now >= at) {
            self.ping_counter += 1;
            let ping = Element::builder("iq", ns::JABBER_CLIENT)
                .attr("type", "get")
                .attr("id", format!("ping_{}", self.ping_counter))
                .attr("to", self.config.domain())
                .append(Element::builder("ping", ns::PING).build())
                .build();
            self.send(&ping);
            if self.sm_active {
                self.send(&sm::request());
            }
            self.ping_deadline = Some(now + self.config.keep_alive_timeout);
            self.next_ping = Some(now + self.config.keep_alive_interval);
        }
    }

    fn open_stream(&mut self) {
        self.framer.reset();
        self.stream_id = None;
        self.state = ClientState::Connecting;
        self.stream_open = true;
        let header = StreamHeader::client(self.config.domain());
        self.send_raw(header.to_xml());
    }

    fn send_raw(&mut self, text: String) {
        log::trace!("SEND {}", text);
        self.outputs.push_back(Output::Send(text));
    }

    fn send(&mut self, elem: &Element) {
        self.send_raw(String::from(elem));
    }

    fn emit(&mut self, event: Event) {
        self.outputs.push_back(Output::Event(event));
    }

    fn enter_disconnected(&mut self, error: Error) {
        self.state = ClientState::Disconnected;
        self.mechanism = None;
        self.pending = Pending::Nothing;
        self.next_ping = None;
        self.ping_deadline = None;
        self.emit(Event::Disconnected(error));
    }

    fn fail(&mut self, error: Error) {
        if self.state == ClientState::Disconnected {
            return;
        }
        log::debug!("Stream negotiation failed in state {:?}: {}", self.state, error);
        if self.stream_open {
            self.send_raw(STREAM_END.to_owned());
            self.stream_open = false;
        }
        self.outputs.push_back(Output::Close);
        self.enter_disconnected(error);
    }

    fn unexpected(&mut self, elem: &Element) {
        self.fail(ProtocolError::UnexpectedElement(elem.name().to_owned()).into());
    }

    fn handle_stream_open(&mut self, header: StreamHeader) {
        if self.state != ClientState::Connecting {
            self.fail(ProtocolError::InvalidStreamStart.into());
            return;
        }
        if header.version.as_deref() != Some("1.0") {
            self.fail(ProtocolError::UnsupportedVersion.into());
            return;
        }
        let Some(id) = header.id else {
            self.fail(ProtocolError::NoStreamId.into());
            return;
        };
        log::debug!("Server opened stream {}", id);
        self.stream_id = Some(id);
        self.state = ClientState::StreamOpened;
    }

    fn handle_element(&mut self, elem: Element, now: Instant) {
        if elem.is("error", ns::STREAM) {
            let condition = StreamErrorCondition::from_element(&elem);
            log::warn!("Received stream error: {}", condition);
            self.fail(condition.into());
            return;
        }
        match self.state {
            ClientState::StreamOpened if elem.is("features", ns::STREAM) => {
                self.process_features(elem, now)
            }
            ClientState::TlsNegotiating if elem.is("proceed", ns::TLS) => {
                self.outputs.push_back(Output::StartTls);
            }
            ClientState::TlsNegotiating if elem.is("failure", ns::TLS) => {
                self.fail(Error::Tls(String::from("server refused STARTTLS")))
            }
            ClientState::SaslNegotiating => self.handle_sasl(elem, now),
            ClientState::ResourceBinding => self.handle_binding(elem, now),
            ClientState::Ready => self.handle_ready(elem),
            _ => self.unexpected(&elem),
        }
    }

    fn process_features(&mut self, features: Element, now: Instant) {
        if !self.tls_active {
            if let Some(starttls) = features.get_child("starttls", ns::TLS) {
                if self.tls_available && self.config.security != StreamSecurityMode::TlsDisabled {
                    self.send(&Element::builder("starttls", ns::TLS).build());
                    self.state = ClientState::TlsNegotiating;
                    return;
                }
                if starttls.has_child("required", ns::TLS) {
                    self.fail(ProtocolError::TlsUnavailable.into());
                    return;
                }
            }
            if self.config.security == StreamSecurityMode::TlsRequired {
                self.fail(ProtocolError::TlsRequired.into());
                return;
            }
        }

        if !self.authenticated {
            self.start_authentication(&features);
            return;
        }

        self.features = Some(features);
        if self.bound {
            self.post_bind(now);
            return;
        }
        let resume_request = if self.sm_offered() && self.config.stream_management {
            self.sm.as_ref().and_then(SmState::resume_request)
        } else {
            None
        };
        if let Some(request) = resume_request {
            log::debug!("Attempting stream resumption");
            self.send(&request);
            self.pending = Pending::SmResume;
            self.state = ClientState::ResourceBinding;
            return;
        }
        self.request_bind();
    }

    fn sm_offered(&self) -> bool {
        self.features
            .as_ref()
            .map_or(false, |features| features.has_child("sm", ns::SM))
    }

    fn credentials(&self) -> ClientCredentials {
        ClientCredentials {
            username: self
                .config
                .jid
                .node()
                .map(|node| node.as_str().to_owned())
                .unwrap_or_default(),
            password: self.config.password.clone(),
            domain: self.config.domain().to_owned(),
        }
    }

    fn start_authentication(&mut self, features: &Element) {
        let credentials = self.credentials();

        let sasl2 = features
            .get_child("authentication", ns::SASL2)
            .filter(|_| self.config.use_sasl2);
        if let Some(authentication) = sasl2 {
            let offered = mechanism_names(authentication, ns::SASL2);
            let bind2 = authentication
                .get_child("inline", ns::SASL2)
                .map_or(false, |inline| inline.has_child("bind", ns::BIND2));
            let mut mechanism =
                match ClientMechanism::select(&offered, &self.config.mechanisms, &credentials) {
                    Ok(mechanism) => mechanism,
                    Err(e) => return self.fail(e.into()),
                };
            log::debug!("Authenticating with SASL2 {}", mechanism.name());

            let mut authenticate =
                Element::builder("authenticate", ns::SASL2).attr("mechanism", mechanism.name());
            let initial = mechanism.initial();
            if !mechanism.server_first() {
                authenticate = authenticate.append(auth::data_element(
                    "initial-response",
                    ns::SASL2,
                    &initial,
                ));
            }
            authenticate = authenticate.append(
                Element::builder("user-agent", ns::SASL2)
                    .attr("id", self.user_agent_id.as_str())
                    .append(
                        Element::builder("software", ns::SASL2)
                            .append(String::from("xmpp-stream"))
                            .build(),
                    )
                    .build(),
            );
            if bind2 {
                let mut bind = Element::builder("bind", ns::BIND2);
                if let Some(tag) = &self.config.resource_prefix {
                    bind = bind.append(Element::builder("tag", ns::BIND2).append(tag.clone()).build());
                }
                authenticate = authenticate.append(bind.build());
            }
            self.send(&authenticate.build());
            self.mechanism = Some(mechanism);
            self.sasl2 = true;
            self.state = ClientState::SaslNegotiating;
            return;
        }

        if let Some(mechanisms) = features.get_child("mechanisms", ns::SASL) {
            let offered = mechanism_names(mechanisms, ns::SASL);
            let mut mechanism =
                match ClientMechanism::select(&offered, &self.config.mechanisms, &credentials) {
                    Ok(mechanism) => mechanism,
                    Err(e) => return self.fail(e.into()),
                };
            log::debug!("Authenticating with SASL {}", mechanism.name());
            let initial = mechanism.initial();
            let auth = if mechanism.server_first() {
                Element::builder("auth", ns::SASL)
                    .attr("mechanism", mechanism.name())
                    .build()
            } else {
                Element::builder("auth", ns::SASL)
                    .attr("mechanism", mechanism.name())
                    .append(auth::encode_data(&initial))
                    .build()
            };
            self.send(&auth);
            self.mechanism = Some(mechanism);
            self.sasl2 = false;
            self.state = ClientState::SaslNegotiating;
            return;
        }

        self.fail(AuthError::NoMechanism.into());
    }

    fn handle_sasl(&mut self, elem: Element, now: Instant) {
        let sasl_ns = if self.sasl2 { ns::SASL2 } else { ns::SASL };
        if elem.ns() != sasl_ns {
            return self.unexpected(&elem);
        }
        match elem.name() {
            "challenge" => {
                let challenge = match auth::decode_data(&elem.text()) {
                    Ok(data) => data,
                    Err(condition) => return self.fail(AuthError::Fail(condition).into()),
                };
                let Some(mechanism) = self.mechanism.as_mut() else {
                    return self.fail(Error::InvalidState);
                };
                match mechanism.response(&challenge) {
                    Ok(response) => self.send(&auth::data_element("response", sasl_ns, &response)),
                    Err(e) => self.fail(e.into()),
                }
            }
            "success" => {
                let additional = if self.sasl2 {
                    elem.get_child("additional-data", ns::SASL2)
                        .map(Element::text)
                        .unwrap_or_default()
                } else {
                    elem.text()
                };
                let data = match auth::decode_data(&additional) {
                    Ok(data) => data,
                    Err(condition) => return self.fail(AuthError::Fail(condition).into()),
                };
                let Some(mut mechanism) = self.mechanism.take() else {
                    return self.fail(Error::InvalidState);
                };
                if let Err(e) = mechanism.success(&data) {
                    return self.fail(e.into());
                }
                log::debug!("Authenticated with {}", mechanism.name());
                self.authenticated = true;

                if !self.sasl2 {
                    self.open_stream();
                    return;
                }
                let identifier = elem
                    .get_child("authorization-identifier", ns::SASL2)
                    .map(Element::text);
                if elem.has_child("bound", ns::BIND2) {
                    match identifier.and_then(|jid| FullJid::new(jid.trim()).ok()) {
                        Some(jid) => {
                            self.bound_jid = Some(jid);
                            self.bound = true;
                            self.sm = None;
                            self.finish(now, false);
                        }
                        None => self.fail(ProtocolError::InvalidBindResponse.into()),
                    }
                } else {
                    // No stream restart with SASL2, fresh features follow.
                    self.state = ClientState::StreamOpened;
                }
            }
            "failure" => {
                let condition = SaslCondition::from_failure(&elem);
                log::warn!("Authentication failed: {}", condition);
                self.fail(AuthError::Fail(condition).into());
            }
            _ => self.unexpected(&elem),
        }
    }

    fn request_bind(&mut self) {
        let offered = self
            .features
            .as_ref()
            .map_or(false, |features| features.has_child("bind", ns::BIND));
        if !offered {
            self.fail(ProtocolError::InvalidBindResponse.into());
            return;
        }
        let resource = bind::requested_resource(
            self.config.jid.resource().map(|r| r.as_str()),
            self.config.resource_prefix.as_deref(),
        );
        self.send(&bind::bind_request(resource.as_deref()));
        self.pending = Pending::Bind;
        self.state = ClientState::ResourceBinding;
    }

    fn post_bind(&mut self, now: Instant) {
        let session_needed = self
            .features
            .as_ref()
            .and_then(|features| features.get_child("session", ns::SESSION))
            .map_or(false, |session| !session.has_child("optional", ns::SESSION));

        if self.sm_offered() && self.config.stream_management && !self.sm_attempted {
            self.sm_attempted = true;
            self.send(&sm::enable());
            self.pending = Pending::SmEnable;
            self.state = ClientState::ResourceBinding;
            return;
        }
        if session_needed && !self.session_done {
            self.session_done = true;
            self.send(&bind::session_request());
            self.pending = Pending::Session;
            self.state = ClientState::ResourceBinding;
            return;
        }
        self.finish(now, false);
    }

    fn finish(&mut self, now: Instant, resumed: bool) {
        let Some(jid) = self.bound_jid.clone() else {
            return self.fail(ProtocolError::InvalidBindResponse.into());
        };
        log::info!("Stream ready as {} (resumed: {})", jid, resumed);
        self.state = ClientState::Ready;
        self.pending = Pending::Nothing;
        self.next_ping = Some(now + self.config.keep_alive_interval);
        self.ping_deadline = None;
        self.emit(Event::Connected {
            jid: Jid::from(jid),
            resumed,
        });
    }

    fn handle_binding(&mut self, elem: Element, now: Instant) {
        match self.pending {
            Pending::Bind if bind::is_response_to(&elem, BIND_REQ_ID) => {
                match bind::parse_bind_response(&elem) {
                    Ok(jid) => {
                        log::debug!("Bound to {}", jid);
                        self.bound_jid = Some(jid);
                        self.bound = true;
                        // A fresh session, whatever was unacked is lost.
                        self.sm = None;
                        self.pending = Pending::Nothing;
                        self.post_bind(now);
                    }
                    Err(e) => self.fail(e.into()),
                }
            }
            Pending::Session if bind::is_response_to(&elem, SESSION_REQ_ID) => {
                if elem.attr("type") == Some("result") {
                    self.pending = Pending::Nothing;
                    self.post_bind(now);
                } else {
                    self.fail(ProtocolError::InvalidSessionResponse.into());
                }
            }
            Pending::SmEnable if elem.is("enabled", ns::SM) => {
                self.sm = Some(SmState::from_enabled(&elem));
                self.sm_active = true;
                self.pending = Pending::Nothing;
                self.post_bind(now);
            }
            Pending::SmEnable if elem.is("failed", ns::SM) => {
                log::warn!("Server refused to enable stream management");
                self.sm = None;
                self.pending = Pending::Nothing;
                self.post_bind(now);
            }
            Pending::SmResume if elem.is("resumed", ns::SM) => {
                let h = sm::parse_h(&elem).unwrap_or(0);
                let resent: Option<Vec<Element>> = self
                    .sm
                    .as_mut()
                    .and_then(|sm| sm.resume(h).map(|drain| drain.collect()).ok());
                let Some(resent) = resent else {
                    log::warn!("Inconsistent counter in <resumed/>, binding a new session");
                    self.sm = None;
                    return self.request_bind();
                };
                log::debug!("Stream resumed, retransmitting {} stanzas", resent.len());
                for stanza in resent {
                    self.send(&stanza);
                    if let Some(sm) = self.sm.as_mut() {
                        sm.enqueue(stanza);
                    }
                }
                self.bound = true;
                self.sm_active = true;
                self.finish(now, true);
            }
            Pending::SmResume if elem.is("failed", ns::SM) => {
                log::info!("Stream resumption failed, binding a new session");
                self.sm = None;
                self.request_bind();
            }
            _ => log::warn!("Ignoring <{}/> while binding", elem.name()),
        }
    }

    fn handle_ready(&mut self, elem: Element) {
        if elem.ns() == ns::SM {
            match elem.name() {
                "r" => {
                    let h = self.sm.as_ref().map(SmState::inbound_ctr);
                    if let Some(h) = h {
                        self.send(&sm::ack(h));
                    }
                }
                "a" => {
                    let h = sm::parse_h(&elem);
                    if let (Some(sm), Some(h)) = (self.sm.as_mut(), h) {
                        if let Err(e) = sm.remote_acked(h) {
                            log::warn!("Stream management error: {}", e);
                            self.fail(StreamErrorCondition::UndefinedCondition.into());
                        }
                    }
                }
                other => log::warn!("Ignoring stream management element <{}/>", other),
            }
            return;
        }

        if !sm::is_stanza(&elem) {
            log::warn!("Ignoring unknown top-level element <{}/>", elem.name());
            return;
        }
        if self.sm_active {
            if let Some(sm) = self.sm.as_mut() {
                sm.stanza_received();
            }
        }
        if is_ping_response(&elem) {
            log::trace!("Keep-alive answered");
            return;
        }
        self.emit(Event::Stanza(elem));
    }
}
