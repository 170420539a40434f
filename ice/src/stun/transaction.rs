use std::time::{Duration, Instant};

use super::{Class, ErrorCode, StunMessage, RTO_INTERVAL, RTO_MAX};

/// A STUN request awaiting its answer.
///
/// The request is due for transmission as soon as the transaction is
/// created, then again each time the retransmission timer expires, with the
/// interval doubling each time. After [`RTO_MAX`] retransmissions, the
/// transaction finishes with a locally made error response.
#[derive(Debug)]
pub struct StunTransaction {
    request: StunMessage,
    response: Option<StunMessage>,
    retransmits: u32,
    interval: Duration,
    deadline: Option<Instant>,
    due: bool,
}

impl StunTransaction {
    /// Start a transaction, with the first transmission due now.
    pub fn new(request: StunMessage, now: Instant) -> Self {
        StunTransaction {
            request,
            response: None,
            retransmits: 0,
            interval: RTO_INTERVAL,
            deadline: Some(now + RTO_INTERVAL),
            due: true,
        }
    }

    /// The request.
    pub fn request(&self) -> &StunMessage {
        &self.request
    }

    /// Returns the request when it is due for (re)transmission.
    pub fn poll_transmit(&mut self) -> Option<&StunMessage> {
        if !self.due {
            return None;
        }
        self.due = false;
        Some(&self.request)
    }

    /// Whether `response` answers this transaction.
    pub fn matches(&self, response: &StunMessage) -> bool {
        response.id == self.request.id && response.method() == self.request.method()
    }

    /// Feed a message received from the peer. Returns true if it finished
    /// the transaction.
    pub fn handle_response(&mut self, response: StunMessage) -> bool {
        if self.is_finished()
            || !self.matches(&response)
            || !matches!(response.class(), Class::Response | Class::Error)
        {
            return false;
        }
        self.finish(response);
        true
    }

    /// When [`handle_timeout`][Self::handle_timeout] should be called next.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.deadline
    }

    /// Retransmit, or give up once all retransmissions are spent.
    pub fn handle_timeout(&mut self, now: Instant) {
        match self.deadline {
            Some(deadline) if deadline <= now => (),
            _ => return,
        }
        if self.retransmits >= RTO_MAX {
            log::debug!("STUN request {} timed out", self.request.method());
            let mut response = self.request.clone();
            response.set_class(Class::Error);
            response.error = Some(ErrorCode::new(ErrorCode::TIMED_OUT, "Request timed out"));
            self.finish(response);
            return;
        }
        self.retransmits += 1;
        self.interval *= 2;
        self.deadline = Some(now + self.interval);
        self.due = true;
    }

    /// Whether a response arrived or the transaction timed out.
    pub fn is_finished(&self) -> bool {
        self.response.is_some()
    }

    /// The final response, if any.
    pub fn response(&self) -> Option<&StunMessage> {
        self.response.as_ref()
    }

    /// Number of retransmissions so far.
    pub fn retransmits(&self) -> u32 {
        self.retransmits
    }

    fn finish(&mut self, response: StunMessage) {
        self.response = Some(response);
        self.deadline = None;
        self.due = false;
    }
}
