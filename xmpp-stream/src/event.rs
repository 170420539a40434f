// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::time::Duration;

use crate::jid::Jid;
use crate::minidom::Element;
use crate::Error;

/// High-level event on the stream, produced by the negotiators and the
/// connection drivers.
#[derive(Debug)]
pub enum Event {
    /// Stream is connected and initialized
    Connected {
        /// Server-set Jabber-Id for your session
        ///
        /// This may turn out to be a different JID resource than
        /// expected, so use this one instead of the JID with which
        /// the connection was setup.
        jid: Jid,
        /// Was this session resumed?
        ///
        /// When false after a reconnection, any state derived from the
        /// previous session (roster cache, presence) must be refreshed.
        resumed: bool,
    },
    /// Stream end
    Disconnected(Error),
    /// Received stanza
    Stanza(Element),
    /// A reconnection attempt is scheduled after `delay`.
    Reconnecting {
        /// Time until the next attempt.
        delay: Duration,
    },
    /// A reconnection attempt starts now.
    ReconnectingNow,
}

impl Event {
    /// `Connected` event?
    pub fn is_online(&self) -> bool {
        matches!(self, Event::Connected { .. })
    }

    /// Get the server-assigned JID for the `Connected` event
    pub fn get_jid(&self) -> Option<&Jid> {
        match *self {
            Event::Connected { ref jid, .. } => Some(jid),
            _ => None,
        }
    }

    /// If this is a `Stanza` event, get its data
    pub fn as_stanza(&self) -> Option<&Element> {
        match *self {
            Event::Stanza(ref stanza) => Some(stanza),
            _ => None,
        }
    }

    /// If this is a `Stanza` event, unwrap into its data
    pub fn into_stanza(self) -> Option<Element> {
        match self {
            Event::Stanza(stanza) => Some(stanza),
            _ => None,
        }
    }
}

/// Instruction from a negotiator to whoever owns the transport.
#[derive(Debug)]
pub enum Output {
    /// Write this text to the transport.
    Send(String),
    /// Everything queued so far has been written; now upgrade the transport
    /// to TLS and report back with `tls_established()`.
    StartTls,
    /// Hand this event to the application.
    Event(Event),
    /// Close the transport once everything queued has been written.
    Close,
}

impl Output {
    /// Wrap a serialisable element.
    pub fn element(elem: &Element) -> Self {
        Output::Send(String::from(elem))
    }
}
