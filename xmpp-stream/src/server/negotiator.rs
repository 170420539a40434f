//! Server side of the negotiation of a client stream, without any I/O.
//!
//! Mirrors the client negotiator: transport events go in, [`Output`]s come
//! out. The server offers STARTTLS (when available), SASL and SASL2 with
//! inline binding, then resource binding, an optional session and stream
//! management without resumption.

use std::collections::VecDeque;
use std::time::Instant;

use crate::auth::{self, PasswordChecker, SaslCondition, ServerMechanism, ServerStep};
use crate::client::bind::random_suffix;
use crate::config::ServerConfig;
use crate::error::{Error, ProtocolError, StreamErrorCondition};
use crate::event::{Event, Output};
use crate::framer::{FramerEvent, XmlFramer};
use crate::jid::{BareJid, FullJid, Jid};
use crate::minidom::Element;
use crate::ns;
use crate::stream_management as sm;
use crate::stream_start::{StreamHeader, STREAM_END};

/// Where the negotiation of an incoming stream stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for the client's stream header.
    Connecting,
    /// Features sent, waiting for the client to pick one.
    StreamOpened,
    /// `<proceed/>` sent, waiting for the TLS handshake.
    TlsNegotiating,
    /// SASL or SASL2 exchange in progress.
    SaslNegotiating,
    /// The client is bound to a resource.
    Ready,
    /// The stream ended.
    Disconnected,
}

/// Sans-IO negotiator for one incoming client connection.
#[derive(Debug)]
pub struct ServerNegotiator {
    config: ServerConfig,
    state: ServerState,
    framer: XmlFramer,
    outputs: VecDeque<Output>,
    stream_open: bool,
    tls_active: bool,
    mechanism: Option<ServerMechanism>,
    sasl2: bool,
    /// `Some(tag)` when the client asked for a bind2 inline binding.
    inline_bind: Option<Option<String>>,
    username: Option<String>,
    jid: Option<FullJid>,
    sm_enabled: bool,
    inbound_ctr: u32,
}

impl ServerNegotiator {
    /// Create a negotiator for a freshly accepted connection.
    pub fn new(config: ServerConfig) -> Self {
        ServerNegotiator {
            config,
            state: ServerState::Connecting,
            framer: XmlFramer::new(),
            outputs: VecDeque::new(),
            stream_open: false,
            tls_active: false,
            mechanism: None,
            sasl2: false,
            inline_bind: None,
            username: None,
            jid: None,
            sm_enabled: false,
            inbound_ctr: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// JID the client is bound to.
    pub fn jid(&self) -> Option<&FullJid> {
        self.jid.as_ref()
    }

    /// Next output for the transport owner.
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    /// The TLS handshake requested with [`Output::StartTls`] completed.
    pub fn tls_established(&mut self) -> Result<(), Error> {
        if self.state != ServerState::TlsNegotiating {
            return Err(Error::InvalidState);
        }
        self.tls_active = true;
        self.expect_restart();
        Ok(())
    }

    /// Feed text received from the client.
    pub fn handle_data(&mut self, data: &str, _now: Instant) {
        if self.state == ServerState::Disconnected {
            return;
        }
        for event in self.framer.feed(data) {
            if self.state == ServerState::Disconnected {
                break;
            }
            match event {
                FramerEvent::Ping => log::trace!("Whitespace ping from client"),
                FramerEvent::StreamOpen(header) => self.handle_stream_open(header),
                FramerEvent::Element(elem) => self.handle_element(elem),
                FramerEvent::StreamClose => {
                    log::debug!("Client closed the stream");
                    self.close(Error::Disconnected);
                }
            }
        }
    }

    /// Send a stanza to the bound client.
    pub fn send_stanza(&mut self, stanza: Element) -> Result<(), Error> {
        if self.state != ServerState::Ready {
            return Err(Error::InvalidState);
        }
        self.send(&stanza);
        Ok(())
    }

    /// Close the stream.
    pub fn disconnect(&mut self) {
        self.close(Error::Disconnected);
    }

    /// The transport went away.
    pub fn transport_closed(&mut self, error: Option<Error>) {
        self.stream_open = false;
        if self.state == ServerState::Disconnected {
            return;
        }
        self.state = ServerState::Disconnected;
        self.emit(Event::Disconnected(error.unwrap_or(Error::Disconnected)));
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

    fn expect_restart(&mut self) {
        self.framer.reset();
        self.state = ServerState::Connecting;
    }

    fn close(&mut self, error: Error) {
        if self.state == ServerState::Disconnected {
            return;
        }
        if self.stream_open {
            self.send_raw(STREAM_END.to_owned());
            self.stream_open = false;
        }
        self.outputs.push_back(Output::Close);
        self.state = ServerState::Disconnected;
        self.mechanism = None;
        self.emit(Event::Disconnected(error));
    }

    fn stream_error(&mut self, condition: StreamErrorCondition, error: Error) {
        log::warn!("Closing client stream with {}: {}", condition, error);
        let elem = Element::builder("error", ns::STREAM)
            .append(Element::builder(condition.as_str(), ns::XMPP_STREAMS).build())
            .build();
        self.send(&elem);
        self.close(error);
    }

    fn handle_stream_open(&mut self, header: StreamHeader) {
        if self.state != ServerState::Connecting {
            self.stream_error(
                StreamErrorCondition::BadFormat,
                ProtocolError::InvalidStreamStart.into(),
            );
            return;
        }
        let reply = StreamHeader::server_reply(&self.config.domain);
        self.send_raw(reply.to_xml());
        self.stream_open = true;

        if let Some(to) = header.to.as_deref() {
            if to != self.config.domain {
                self.stream_error(
                    StreamErrorCondition::HostUnknown,
                    ProtocolError::HostUnknown.into(),
                );
                return;
            }
        }
        if header.version.as_deref() != Some("1.0") {
            self.stream_error(
                StreamErrorCondition::UnsupportedVersion,
                ProtocolError::UnsupportedVersion.into(),
            );
            return;
        }
        self.send_features();
        self.state = ServerState::StreamOpened;
    }

    fn checker(&self) -> Option<&dyn PasswordChecker> {
        self.config.checker.as_deref()
    }

    fn send_features(&mut self) {
        let mut features = Element::builder("features", ns::STREAM);
        if self.config.tls_available && !self.tls_active {
            features = features.append(Element::builder("starttls", ns::TLS).build());
        }
        if self.username.is_none() {
            let offered = match self.checker() {
                Some(checker) => ServerMechanism::available(checker),
                None => vec!["PLAIN"],
            };
            let mut mechanisms = Element::builder("mechanisms", ns::SASL);
            let mut authentication = Element::builder("authentication", ns::SASL2);
            for name in offered {
                mechanisms = mechanisms.append(
                    Element::builder("mechanism", ns::SASL)
                        .append(name.to_owned())
                        .build(),
                );
                authentication = authentication.append(
                    Element::builder("mechanism", ns::SASL2)
                        .append(name.to_owned())
                        .build(),
                );
            }
            authentication = authentication.append(
                Element::builder("inline", ns::SASL2)
                    .append(Element::builder("bind", ns::BIND2).build())
                    .build(),
            );
            features = features
                .append(mechanisms.build())
                .append(authentication.build());
        } else {
            features = features
                .append(Element::builder("bind", ns::BIND).build())
                .append(
                    Element::builder("session", ns::SESSION)
                        .append(Element::builder("optional", ns::SESSION).build())
                        .build(),
                )
                .append(Element::builder("sm", ns::SM).build());
        }
        self.send(&features.build());
    }

    fn handle_element(&mut self, elem: Element) {
        match self.state {
            ServerState::StreamOpened if elem.is("starttls", ns::TLS) => {
                if !self.config.tls_available || self.tls_active {
                    self.send(&Element::builder("failure", ns::TLS).build());
                    self.close(ProtocolError::TlsUnavailable.into());
                    return;
                }
                self.send(&Element::builder("proceed", ns::TLS).build());
                self.outputs.push_back(Output::StartTls);
                self.state = ServerState::TlsNegotiating;
            }
            ServerState::StreamOpened if self.username.is_none() && elem.is("auth", ns::SASL) => {
                self.sasl2 = false;
                self.inline_bind = None;
                let mechanism = elem.attr("mechanism").unwrap_or_default().to_owned();
                let payload = elem.text();
                self.start_sasl(&mechanism, Some(payload));
            }
            ServerState::StreamOpened
                if self.username.is_none() && elem.is("authenticate", ns::SASL2) =>
            {
                self.sasl2 = true;
                self.inline_bind = elem.get_child("bind", ns::BIND2).map(|bind| {
                    bind.get_child("tag", ns::BIND2)
                        .map(|tag| tag.text().trim().to_owned())
                        .filter(|tag| !tag.is_empty())
                });
                let mechanism = elem.attr("mechanism").unwrap_or_default().to_owned();
                let payload = elem
                    .get_child("initial-response", ns::SASL2)
                    .map(Element::text);
                self.start_sasl(&mechanism, payload);
            }
            ServerState::SaslNegotiating if elem.name() == "response" && elem.ns() == self.sasl_ns() => {
                self.sasl_step(&elem.text());
            }
            ServerState::SaslNegotiating if elem.name() == "abort" && elem.ns() == self.sasl_ns() => {
                self.sasl_failure(SaslCondition::Aborted);
            }
            ServerState::StreamOpened if self.username.is_some() && elem.name() == "iq" => {
                self.handle_setup_iq(elem);
            }
            ServerState::StreamOpened | ServerState::Ready if elem.is("enable", ns::SM) => {
                self.sm_enabled = true;
                self.send(&Element::builder("enabled", ns::SM).build());
            }
            ServerState::Ready if elem.is("r", ns::SM) => {
                self.send(&sm::ack(self.inbound_ctr));
            }
            ServerState::Ready if elem.is("a", ns::SM) => {
                log::trace!("Client acknowledged {:?} stanzas", sm::parse_h(&elem));
            }
            ServerState::Ready if sm::is_stanza(&elem) => self.handle_stanza(elem),
            _ => {
                log::warn!(
                    "Unexpected <{}/> from client in state {:?}",
                    elem.name(),
                    self.state
                );
                let error = ProtocolError::UnexpectedElement(elem.name().to_owned()).into();
                let condition = if self.username.is_none() {
                    StreamErrorCondition::NotAuthorized
                } else {
                    StreamErrorCondition::UnsupportedStanzaType
                };
                self.stream_error(condition, error);
            }
        }
    }

    fn sasl_ns(&self) -> &'static str {
        if self.sasl2 {
            ns::SASL2
        } else {
            ns::SASL
        }
    }

    fn start_sasl(&mut self, name: &str, payload: Option<String>) {
        let Some(checker) = self.config.checker.clone() else {
            log::warn!("No password checker configured, refusing authentication");
            return self.sasl_failure(SaslCondition::TemporaryAuthFailure);
        };
        let Some(mechanism) = ServerMechanism::new(name, &self.config.domain, checker.as_ref())
        else {
            return self.sasl_failure(SaslCondition::InvalidMechanism);
        };
        log::debug!("Client authenticates with {}", mechanism.name());
        self.mechanism = Some(mechanism);
        self.state = ServerState::SaslNegotiating;
        self.sasl_step(payload.as_deref().unwrap_or(""));
    }

    fn sasl_step(&mut self, text: &str) {
        let payload = match auth::decode_data(text) {
            Ok(payload) => payload,
            Err(condition) => return self.sasl_failure(condition),
        };
        let (Some(checker), Some(mechanism)) =
            (self.config.checker.clone(), self.mechanism.as_mut())
        else {
            return self.sasl_failure(SaslCondition::TemporaryAuthFailure);
        };
        match mechanism.respond(&payload, checker.as_ref()) {
            ServerStep::Challenge(data) => {
                let challenge = auth::data_element("challenge", self.sasl_ns(), &data);
                self.send(&challenge);
            }
            ServerStep::Success {
                username,
                additional_data,
            } => self.sasl_success(username, additional_data),
            ServerStep::Failure(condition) => self.sasl_failure(condition),
        }
    }

    fn sasl_failure(&mut self, condition: SaslCondition) {
        log::info!("Authentication failed: {}", condition);
        self.mechanism = None;
        let failure = condition.to_failure(self.sasl_ns());
        self.send(&failure);
        self.state = ServerState::StreamOpened;
    }

    fn sasl_success(&mut self, username: String, additional_data: Vec<u8>) {
        log::debug!("Client authenticated as {}", username);
        self.mechanism = None;
        let bare = match BareJid::new(&format!("{}@{}", username, self.config.domain)) {
            Ok(bare) => bare,
            Err(e) => {
                self.sasl_failure(SaslCondition::MalformedRequest);
                log::warn!("Authenticated user does not form a valid JID: {}", e);
                return;
            }
        };
        self.username = Some(username);

        if !self.sasl2 {
            let mut success = Element::builder("success", ns::SASL);
            if !additional_data.is_empty() {
                success = success.append(auth::encode_data(&additional_data));
            }
            self.send(&success.build());
            self.expect_restart();
            return;
        }

        let mut success = Element::builder("success", ns::SASL2);
        if !additional_data.is_empty() {
            success = success.append(auth::data_element(
                "additional-data",
                ns::SASL2,
                &additional_data,
            ));
        }
        match self.inline_bind.take() {
            Some(tag) => {
                let resource = match tag {
                    Some(tag) => format!("{}.{}", tag, random_suffix(8)),
                    None => random_suffix(16),
                };
                let Ok(jid) = bare.with_resource_str(&resource) else {
                    return self.sasl_failure(SaslCondition::MalformedRequest);
                };
                success = success
                    .append(
                        Element::builder("authorization-identifier", ns::SASL2)
                            .append(jid.to_string())
                            .build(),
                    )
                    .append(Element::builder("bound", ns::BIND2).build());
                self.send(&success.build());
                self.bound(jid);
            }
            None => {
                success = success.append(
                    Element::builder("authorization-identifier", ns::SASL2)
                        .append(bare.to_string())
                        .build(),
                );
                self.send(&success.build());
                self.state = ServerState::StreamOpened;
                self.send_features();
            }
        }
    }

    fn bound(&mut self, jid: FullJid) {
        log::info!("Client bound to {}", jid);
        self.jid = Some(jid.clone());
        self.state = ServerState::Ready;
        self.emit(Event::Connected {
            jid: Jid::from(jid),
            resumed: false,
        });
    }

    fn iq_result(id: &str, payload: Option<Element>) -> Element {
        let mut iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "result")
            .attr("id", id);
        if let Some(payload) = payload {
            iq = iq.append(payload);
        }
        iq.build()
    }

    /// Binding and session requests right after authentication.
    fn handle_setup_iq(&mut self, iq: Element) {
        let id = iq.attr("id").unwrap_or_default().to_owned();
        if iq.attr("type") != Some("set") {
            return self.stream_error(
                StreamErrorCondition::NotAuthorized,
                ProtocolError::UnexpectedElement(String::from("iq")).into(),
            );
        }
        if let Some(bind) = iq.get_child("bind", ns::BIND) {
            let requested = bind
                .get_child("resource", ns::BIND)
                .map(|resource| resource.text().trim().to_owned())
                .filter(|resource| !resource.is_empty());
            let resource = requested.unwrap_or_else(|| random_suffix(16));
            let username = self.username.clone().unwrap_or_default();
            let jid = match FullJid::new(&format!(
                "{}@{}/{}",
                username, self.config.domain, resource
            )) {
                Ok(jid) => jid,
                Err(_) => {
                    let error = Element::builder("iq", ns::JABBER_CLIENT)
                        .attr("type", "error")
                        .attr("id", id.as_str())
                        .append(
                            Element::builder("error", ns::JABBER_CLIENT)
                                .attr("type", "modify")
                                .append(Element::builder("bad-request", ns::XMPP_STANZAS).build())
                                .build(),
                        )
                        .build();
                    self.send(&error);
                    return;
                }
            };
            let payload = Element::builder("bind", ns::BIND)
                .append(
                    Element::builder("jid", ns::BIND)
                        .append(jid.to_string())
                        .build(),
                )
                .build();
            self.send(&Self::iq_result(&id, Some(payload)));
            self.bound(jid);
        } else if iq.has_child("session", ns::SESSION) {
            self.send(&Self::iq_result(&id, None));
        } else {
            self.stream_error(
                StreamErrorCondition::NotAuthorized,
                ProtocolError::UnexpectedElement(String::from("iq")).into(),
            );
        }
    }

    fn handle_stanza(&mut self, mut stanza: Element) {
        if self.sm_enabled {
            self.inbound_ctr = self.inbound_ctr.wrapping_add(1);
        }
        let Some(jid) = self.jid.clone() else {
            return;
        };
        if stanza.is("iq", ns::JABBER_CLIENT)
            && stanza.attr("type") == Some("set")
            && stanza.has_child("session", ns::SESSION)
        {
            let id = stanza.attr("id").unwrap_or_default().to_owned();
            self.send(&Self::iq_result(&id, None));
            return;
        }
        match stanza.attr("from") {
            None | Some("") => stanza.set_attr("from", jid.to_string()),
            Some(from) if from == jid.to_string() => (),
            Some(from) => {
                log::warn!("Dropping stanza from {} on a stream bound to {}", from, jid);
                return;
            }
        }
        self.emit(Event::Stanza(stanza));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryPasswordChecker;
    use std::sync::Arc;

    const CLIENT_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>";

    fn negotiator() -> ServerNegotiator {
        let checker = MemoryPasswordChecker::new().with_user("user", "pencil");
        ServerNegotiator::new(ServerConfig::new("example.com", Arc::new(checker)))
    }

    fn drain(neg: &mut ServerNegotiator) -> (Vec<Element>, Vec<Event>) {
        let mut sent = Vec::new();
        let mut events = Vec::new();
        while let Some(output) = neg.poll_output() {
            match output {
                Output::Send(text) if text.starts_with("<?xml") || text == STREAM_END => (),
                Output::Send(text) => sent.push(text.parse().unwrap()),
                Output::Event(event) => events.push(event),
                Output::StartTls | Output::Close => (),
            }
        }
        (sent, events)
    }

    #[test]
    fn unknown_host() {
        let mut neg = negotiator();
        neg.handle_data(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.org' version='1.0'>",
            Instant::now(),
        );
        let (sent, events) = drain(&mut neg);
        assert!(sent[0].is("error", ns::STREAM));
        assert!(sent[0].has_child("host-unknown", ns::XMPP_STREAMS));
        assert!(matches!(
            &events[..],
            [Event::Disconnected(Error::Protocol(ProtocolError::HostUnknown))]
        ));
        assert_eq!(neg.state(), ServerState::Disconnected);
    }

    #[test]
    fn features_before_authentication() {
        let mut neg = negotiator();
        neg.handle_data(CLIENT_HEADER, Instant::now());
        let (sent, _) = drain(&mut neg);
        let features = &sent[0];
        let mechanisms: Vec<String> = features
            .get_child("mechanisms", ns::SASL)
            .unwrap()
            .children()
            .map(Element::text)
            .collect();
        assert_eq!(mechanisms, ["DIGEST-MD5", "PLAIN"]);
        assert!(features
            .get_child("authentication", ns::SASL2)
            .unwrap()
            .get_child("inline", ns::SASL2)
            .unwrap()
            .has_child("bind", ns::BIND2));
        assert!(!features.has_child("starttls", ns::TLS));
    }

    #[test]
    fn classic_sasl_then_bind() {
        let now = Instant::now();
        let mut neg = negotiator();
        neg.handle_data(CLIENT_HEADER, now);
        neg.handle_data(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AHVzZXIAcGVuY2ls</auth>",
            now,
        );
        let (sent, _) = drain(&mut neg);
        assert!(sent.last().unwrap().is("success", ns::SASL));
        assert_eq!(neg.state(), ServerState::Connecting);

        neg.handle_data(CLIENT_HEADER, now);
        let (sent, _) = drain(&mut neg);
        assert!(sent[0].has_child("bind", ns::BIND));
        assert!(sent[0].has_child("sm", ns::SM));

        neg.handle_data("<iq type='set' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>balcony</resource></bind></iq>", now);
        let (sent, events) = drain(&mut neg);
        assert_eq!(sent[0].attr("type"), Some("result"));
        match &events[..] {
            [Event::Connected { jid, .. }] => assert_eq!(jid.to_string(), "user@example.com/balcony"),
            other => panic!("unexpected {:?}", other),
        }

        neg.handle_data("<message to='juliet@example.com'><body>hi</body></message><message from='mallory@example.com/x'/>", now);
        let (_, events) = drain(&mut neg);
        assert_eq!(events.len(), 1);
        let stanza = events[0].as_stanza().unwrap();
        assert_eq!(stanza.attr("from"), Some("user@example.com/balcony"));
    }

    #[test]
    fn bad_credentials_and_unknown_mechanism() {
        let now = Instant::now();
        let mut neg = negotiator();
        neg.handle_data(CLIENT_HEADER, now);
        neg.handle_data(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='X-OAUTH2'/>",
            now,
        );
        let (sent, _) = drain(&mut neg);
        assert_eq!(
            SaslCondition::from_failure(sent.last().unwrap()),
            SaslCondition::InvalidMechanism
        );

        // AHVzZXIAd3Jvbmc= is "\0user\0wrong"
        neg.handle_data(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AHVzZXIAd3Jvbmc=</auth>",
            now,
        );
        let (sent, _) = drain(&mut neg);
        assert_eq!(
            SaslCondition::from_failure(&sent[0]),
            SaslCondition::NotAuthorized
        );
        assert_eq!(neg.state(), ServerState::StreamOpened);
    }

    #[test]
    fn no_checker_is_temporary_failure() {
        let now = Instant::now();
        let mut neg = ServerNegotiator::new(ServerConfig {
            domain: String::from("example.com"),
            tls_available: false,
            checker: None,
        });
        neg.handle_data(CLIENT_HEADER, now);
        neg.handle_data(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AHVzZXIAcGVuY2ls</auth>",
            now,
        );
        let (sent, _) = drain(&mut neg);
        assert_eq!(
            SaslCondition::from_failure(sent.last().unwrap()),
            SaslCondition::TemporaryAuthFailure
        );
    }

    #[test]
    fn sasl2_inline_bind_with_tag() {
        let now = Instant::now();
        let mut neg = negotiator();
        neg.handle_data(CLIENT_HEADER, now);
        neg.handle_data(
            "<authenticate xmlns='urn:xmpp:sasl:2' mechanism='PLAIN'><initial-response>AHVzZXIAcGVuY2ls</initial-response><bind xmlns='urn:xmpp:bind:0'><tag>mobile</tag></bind></authenticate>",
            now,
        );
        let (sent, events) = drain(&mut neg);
        let success = sent.last().unwrap();
        assert!(success.is("success", ns::SASL2));
        assert!(success.has_child("bound", ns::BIND2));
        let identifier = success
            .get_child("authorization-identifier", ns::SASL2)
            .unwrap()
            .text();
        assert!(identifier.starts_with("user@example.com/mobile."));
        assert!(matches!(&events[..], [Event::Connected { .. }]));
        assert_eq!(neg.state(), ServerState::Ready);
    }

    #[test]
    fn starttls_when_available() {
        let now = Instant::now();
        let checker = MemoryPasswordChecker::new();
        let mut config = ServerConfig::new("example.com", Arc::new(checker));
        config.tls_available = true;
        let mut neg = ServerNegotiator::new(config);
        neg.handle_data(CLIENT_HEADER, now);
        let (sent, _) = drain(&mut neg);
        assert!(sent[0].has_child("starttls", ns::TLS));

        neg.handle_data("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>", now);
        let mut saw_starttls = false;
        while let Some(output) = neg.poll_output() {
            saw_starttls |= matches!(output, Output::StartTls);
        }
        assert!(saw_starttls);
        neg.tls_established().unwrap();
        neg.handle_data(CLIENT_HEADER, now);
        let (sent, _) = drain(&mut neg);
        assert!(!sent[0].has_child("starttls", ns::TLS));
    }

    #[test]
    fn stanza_before_auth_is_rejected() {
        let now = Instant::now();
        let mut neg = negotiator();
        neg.handle_data(CLIENT_HEADER, now);
        neg.handle_data("<message to='juliet@example.com'/>", now);
        let (sent, events) = drain(&mut neg);
        assert!(sent.last().unwrap().has_child("not-authorized", ns::XMPP_STREAMS));
        assert!(matches!(&events[..], [Event::Disconnected(_)]));
    }
}
