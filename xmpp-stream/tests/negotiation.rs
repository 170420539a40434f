use std::time::Instant;

use xmpp_stream::client::{ClientNegotiator, ClientState};
use xmpp_stream::jid::Jid;
use xmpp_stream::minidom::Element;
use xmpp_stream::{ns, ClientConfig, Event, Output};

const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='abc' version='1.0'>";

/// What the negotiator produced since the last call.
#[derive(Default)]
struct Drained {
    headers: usize,
    sent: Vec<Element>,
    events: Vec<Event>,
    starttls: bool,
}

fn drain(neg: &mut ClientNegotiator) -> Drained {
    let mut drained = Drained::default();
    while let Some(output) = neg.poll_output() {
        match output {
            Output::Send(text) if text.starts_with("<?xml") => drained.headers += 1,
            Output::Send(text) => drained.sent.push(text.parse().unwrap()),
            Output::Event(event) => drained.events.push(event),
            Output::StartTls => drained.starttls = true,
            Output::Close => (),
        }
    }
    drained
}

#[test]
fn starttls_then_sasl2_with_inline_bind() {
    let now = Instant::now();
    let jid: Jid = "user@example.com".parse().unwrap();
    let config = ClientConfig::new(jid, "pencil").with_resource_prefix("mobile");
    let mut neg = ClientNegotiator::new(config, true);

    neg.connected(now);
    assert_eq!(drain(&mut neg).headers, 1);

    neg.handle_data(
        &format!(
            "{}<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>",
            SERVER_HEADER
        ),
        now,
    );
    let out = drain(&mut neg);
    assert!(out.sent[0].is("starttls", ns::TLS));
    assert_eq!(neg.state(), ClientState::TlsNegotiating);

    neg.handle_data("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>", now);
    assert!(drain(&mut neg).starttls);
    neg.tls_established().unwrap();
    assert_eq!(drain(&mut neg).headers, 1);
    assert!(neg.is_secure());

    neg.handle_data(
        &format!(
            "{}<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms><authentication xmlns='urn:xmpp:sasl:2'><mechanism>PLAIN</mechanism><inline><bind xmlns='urn:xmpp:bind:0'/></inline></authentication></stream:features>",
            SERVER_HEADER
        ),
        now,
    );
    let out = drain(&mut neg);
    let authenticate = &out.sent[0];
    assert!(authenticate.is("authenticate", ns::SASL2));
    assert_eq!(authenticate.attr("mechanism"), Some("PLAIN"));
    assert_eq!(
        authenticate
            .get_child("initial-response", ns::SASL2)
            .unwrap()
            .text(),
        "AHVzZXIAcGVuY2ls"
    );
    assert_eq!(
        authenticate
            .get_child("bind", ns::BIND2)
            .unwrap()
            .get_child("tag", ns::BIND2)
            .unwrap()
            .text(),
        "mobile"
    );
    assert!(authenticate.has_child("user-agent", ns::SASL2));

    neg.handle_data(
        "<success xmlns='urn:xmpp:sasl:2'><authorization-identifier>user@example.com/mobile</authorization-identifier><bound xmlns='urn:xmpp:bind:0'/></success>",
        now,
    );
    let out = drain(&mut neg);
    // No stream restart after SASL2.
    assert_eq!(out.headers, 0);
    assert_eq!(out.events.len(), 1);
    match &out.events[0] {
        Event::Connected { jid, resumed } => {
            assert_eq!(jid.to_string(), "user@example.com/mobile");
            assert!(!resumed);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(neg.state(), ClientState::Ready);
    assert_eq!(
        neg.bound_jid().map(ToString::to_string).as_deref(),
        Some("user@example.com/mobile")
    );
}

#[test]
fn sasl2_failure_is_reported_with_its_condition() {
    let now = Instant::now();
    let jid: Jid = "user@example.com".parse().unwrap();
    let mut neg = ClientNegotiator::new(ClientConfig::new(jid, "wrong"), false);
    neg.connected(now);
    neg.handle_data(
        &format!(
            "{}<stream:features><authentication xmlns='urn:xmpp:sasl:2'><mechanism>PLAIN</mechanism></authentication></stream:features>",
            SERVER_HEADER
        ),
        now,
    );
    drain(&mut neg);
    neg.handle_data(
        "<failure xmlns='urn:xmpp:sasl:2'><not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/></failure>",
        now,
    );
    let out = drain(&mut neg);
    match &out.events[..] {
        [Event::Disconnected(e)] => assert_eq!(e.condition(), "not-authorized"),
        other => panic!("unexpected events {:?}", other),
    }
    assert_eq!(neg.state(), ClientState::Disconnected);
}
