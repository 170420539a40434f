// Copyright (c) 2017-2018 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XML namespaces used during stream negotiation.

/// RFC 6120: XMPP Core, default namespace of client streams
pub const JABBER_CLIENT: &str = "jabber:client";

/// RFC 6120: XMPP Core, default namespace of server streams
pub const JABBER_SERVER: &str = "jabber:server";

/// RFC 6120: XMPP Core, the `stream:` prefix
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// RFC 6120: XMPP Core, stream error conditions
pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// RFC 6120: XMPP Core, STARTTLS
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// RFC 6120: XMPP Core, SASL
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// RFC 6120: XMPP Core, resource binding
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// RFC 3921: legacy session establishment
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// RFC 6120: XMPP Core, stanza error conditions
pub const XMPP_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// XEP-0198: Stream Management
pub const SM: &str = "urn:xmpp:sm:3";

/// XEP-0199: XMPP Ping
pub const PING: &str = "urn:xmpp:ping";

/// XEP-0388: Extensible SASL Profile
pub const SASL2: &str = "urn:xmpp:sasl:2";

/// XEP-0386: Bind 2
pub const BIND2: &str = "urn:xmpp:bind:0";
