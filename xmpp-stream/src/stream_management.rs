// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0198 stream management counters and the queue of unacknowledged
//! stanzas.

use core::fmt;
use std::collections::{vec_deque, VecDeque};

use crate::minidom::Element;
use crate::ns;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SmResumeInfo {
    NotResumable,
    Resumable {
        /// XEP-0198 stream ID
        id: String,

        /// Preferred IP and port for resumption as indicated by the peer.
        location: Option<String>,
    },
}

/// State for stream management
pub(crate) struct SmState {
    /// Last value seen from the remote stanza counter.
    outbound_base: u32,

    /// Counter for received stanzas
    inbound_ctr: u32,

    /// Information about resumability of the stream
    resumption: SmResumeInfo,

    /// Unacked stanzas in the order they were sent
    unacked_stanzas: VecDeque<Element>,
}

impl fmt::Debug for SmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SmState")
            .field("outbound_base", &self.outbound_base)
            .field("inbound_ctr", &self.inbound_ctr)
            .field("resumption", &self.resumption)
            .field("len(unacked_stanzas)", &self.unacked_stanzas.len())
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SmError {
    RemoteAckedMoreStanzas {
        local_base: u32,
        queue_len: u32,
        remote_ctr: u32,
    },
    RemoteAckWentBackwards {
        local_base: u32,
        remote_ctr: u32,
    },
}

impl fmt::Display for SmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RemoteAckedMoreStanzas {
                local_base,
                queue_len,
                remote_ctr,
            } => {
                let local_tip = local_base.wrapping_add(*queue_len);
                write!(f, "remote acked more stanzas than we sent: remote counter = {}. queue covers range {}..<{}", remote_ctr, local_base, local_tip)
            }
            Self::RemoteAckWentBackwards {
                local_base,
                remote_ctr,
            } => {
                write!(f, "remote acked less stanzas than before: remote counter = {}, local queue starts at {}", remote_ctr, local_base)
            }
        }
    }
}

/// Whether an element counts as a stanza for the XEP-0198 counters.
pub(crate) fn is_stanza(elem: &Element) -> bool {
    matches!(elem.name(), "message" | "presence" | "iq")
        && (elem.ns() == ns::JABBER_CLIENT || elem.ns() == ns::JABBER_SERVER)
}

/// Parse the `h` attribute of `<a/>`, `<resumed/>` or `<failed/>`.
pub(crate) fn parse_h(elem: &Element) -> Option<u32> {
    elem.attr("h").and_then(|h| h.parse().ok())
}

/// `<enable resume='true'/>`
pub(crate) fn enable() -> Element {
    Element::builder("enable", ns::SM)
        .attr("resume", "true")
        .build()
}

/// `<r/>`
pub(crate) fn request() -> Element {
    Element::builder("r", ns::SM).build()
}

/// `<a h='...'/>`
pub(crate) fn ack(h: u32) -> Element {
    Element::builder("a", ns::SM)
        .attr("h", h.to_string())
        .build()
}

impl SmState {
    /// Initialize stream management state from the `<enabled/>` the peer
    /// sent.
    pub fn from_enabled(enabled: &Element) -> Self {
        let resume = matches!(enabled.attr("resume"), Some("true") | Some("1"));
        let resumption = match (resume, enabled.attr("id")) {
            (true, Some(id)) => SmResumeInfo::Resumable {
                id: id.to_owned(),
                location: enabled.attr("location").map(str::to_owned),
            },
            (true, None) => {
                log::warn!("peer replied with <enabled resume='true'/>, but without an ID! cannot make this stream resumable.");
                SmResumeInfo::NotResumable
            }
            (false, _) => SmResumeInfo::NotResumable,
        };
        SmState {
            outbound_base: 0,
            inbound_ctr: 0,
            resumption,
            unacked_stanzas: VecDeque::new(),
        }
    }

    /// Mark a stanza as sent and keep it in the stream management queue.
    pub fn enqueue(&mut self, stanza: Element) {
        self.unacked_stanzas.push_back(stanza);
        log::trace!(
            "Stored stanza in SmState. We are now at {} unacked stanzas.",
            self.unacked_stanzas.len()
        );
    }

    /// Count one received stanza.
    pub fn stanza_received(&mut self) {
        self.inbound_ctr = self.inbound_ctr.wrapping_add(1);
    }

    /// Process resumption.
    ///
    /// Updates the internal state according to the received remote counter.
    /// Returns an iterator which yields the stanzas which need to be
    /// retransmitted.
    pub fn resume(&mut self, h: u32) -> Result<vec_deque::Drain<'_, Element>, SmError> {
        self.remote_acked(h)?;
        // The peer has not seen whatever is left, they got lost in the
        // previous unclean disconnect. The caller enqueues them again when
        // retransmitting.
        Ok(self.unacked_stanzas.drain(..))
    }

    /// Process remote `<a/>`
    pub fn remote_acked(&mut self, h: u32) -> Result<(), SmError> {
        log::debug!("remote_acked: {self:?}::remote_acked({h})");
        // XEP-0198 specifies that counters are mod 2^32.
        let to_drop = h.wrapping_sub(self.outbound_base) as usize;
        if to_drop == 0 {
            log::trace!("remote_acked: no stanzas to drop");
            return Ok(());
        }
        if to_drop > self.unacked_stanzas.len() {
            // As RFC 1982 serial numbers, a wrapping difference greater
            // than half the number space is negative.
            if to_drop as u32 > u32::MAX / 2 {
                return Err(SmError::RemoteAckWentBackwards {
                    local_base: self.outbound_base,
                    remote_ctr: h,
                });
            }
            return Err(SmError::RemoteAckedMoreStanzas {
                local_base: self.outbound_base,
                queue_len: self.unacked_stanzas.len() as u32,
                remote_ctr: h,
            });
        }
        self.unacked_stanzas.drain(..to_drop);
        self.outbound_base = h;
        log::debug!("remote_acked: remote acked {to_drop} stanzas");
        Ok(())
    }

    /// Get the current inbound counter.
    #[inline(always)]
    pub fn inbound_ctr(&self) -> u32 {
        self.inbound_ctr
    }

    /// Number of stanzas the peer has not acknowledged yet.
    pub fn unacked_len(&self) -> usize {
        self.unacked_stanzas.len()
    }

    /// Get the info necessary for resumption.
    ///
    /// Returns the stream ID and the current inbound counter if resumption is
    /// available and None otherwise.
    pub fn resume_info(&self) -> Option<(&str, u32)> {
        match self.resumption {
            SmResumeInfo::Resumable { ref id, .. } => Some((id, self.inbound_ctr)),
            SmResumeInfo::NotResumable => None,
        }
    }

    /// Build the `<resume/>` request for this state.
    pub fn resume_request(&self) -> Option<Element> {
        let (id, h) = self.resume_info()?;
        Some(
            Element::builder("resume", ns::SM)
                .attr("previd", id)
                .attr("h", h.to_string())
                .build(),
        )
    }

    /// Location the peer prefers for resumption, if any.
    pub fn location(&self) -> Option<&str> {
        match self.resumption {
            SmResumeInfo::Resumable { ref location, .. } => location.as_deref(),
            SmResumeInfo::NotResumable => None,
        }
    }
}
