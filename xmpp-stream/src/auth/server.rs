use super::checker::{PasswordChecker, PasswordError};
use super::digest_md5::{self, DigestMessage};
use super::SaslCondition;

/// Outcome of feeding one client message into a [`ServerMechanism`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStep {
    /// Send this challenge and wait for another response.
    Challenge(Vec<u8>),
    /// The client is authenticated.
    Success {
        /// Authenticated local part.
        username: String,
        /// Data to attach to the success element.
        additional_data: Vec<u8>,
    },
    /// Authentication failed.
    Failure(SaslCondition),
}

impl From<PasswordError> for SaslCondition {
    fn from(e: PasswordError) -> Self {
        match e {
            PasswordError::AuthorizationError => SaslCondition::NotAuthorized,
            PasswordError::TemporaryError => SaslCondition::TemporaryAuthFailure,
        }
    }
}

#[derive(Debug)]
enum DigestStep {
    Start,
    AwaitingResponse { nonce: Vec<u8> },
    AwaitingAck { username: String },
}

#[derive(Debug)]
enum Kind {
    /// PLAIN, RFC 4616. The flag records whether we already sent the empty
    /// challenge asking for the credentials.
    Plain { challenged: bool },
    /// DIGEST-MD5, RFC 2831.
    DigestMd5 { realm: String, step: DigestStep },
}

/// Server side of a SASL exchange.
#[derive(Debug)]
pub struct ServerMechanism {
    kind: Kind,
}

impl ServerMechanism {
    /// Mechanism names the server can offer, strongest first.
    pub fn available(checker: &dyn PasswordChecker) -> Vec<&'static str> {
        let mut mechanisms = Vec::new();
        if checker.has_get_password() {
            mechanisms.push(digest_md5::NAME);
        }
        mechanisms.push("PLAIN");
        mechanisms
    }

    /// Instantiate the mechanism the client asked for, if we support it.
    pub fn new(name: &str, realm: &str, checker: &dyn PasswordChecker) -> Option<Self> {
        match name {
            "PLAIN" => Some(Kind::Plain { challenged: false }),
            digest_md5::NAME if checker.has_get_password() => Some(Kind::DigestMd5 {
                realm: realm.to_owned(),
                step: DigestStep::Start,
            }),
            _ => None,
        }
        .map(|kind| ServerMechanism { kind })
    }

    /// Name of the mechanism on the wire.
    pub fn name(&self) -> &'static str {
        match self.kind {
            Kind::Plain { .. } => "PLAIN",
            Kind::DigestMd5 { .. } => digest_md5::NAME,
        }
    }

    /// Process the initial response (possibly empty) or a later response.
    pub fn respond(&mut self, payload: &[u8], checker: &dyn PasswordChecker) -> ServerStep {
        match &mut self.kind {
            Kind::Plain { challenged } => {
                if payload.is_empty() && !*challenged {
                    *challenged = true;
                    return ServerStep::Challenge(Vec::new());
                }
                let mut parts = payload.split(|&c| c == 0);
                let (Some(_authzid), Some(username), Some(password), None) =
                    (parts.next(), parts.next(), parts.next(), parts.next())
                else {
                    log::warn!("Malformed PLAIN response");
                    return ServerStep::Failure(SaslCondition::NotAuthorized);
                };
                let (Ok(username), Ok(password)) =
                    (core::str::from_utf8(username), core::str::from_utf8(password))
                else {
                    return ServerStep::Failure(SaslCondition::IncorrectEncoding);
                };
                match checker.check_password(username, password) {
                    Ok(()) => ServerStep::Success {
                        username: username.to_owned(),
                        additional_data: Vec::new(),
                    },
                    Err(e) => {
                        log::debug!("PLAIN authentication of {username} failed: {e}");
                        ServerStep::Failure(e.into())
                    }
                }
            }

            Kind::DigestMd5 { realm, step } => match step {
                DigestStep::Start => {
                    let nonce = digest_md5::generate_nonce();
                    let challenge = digest_md5::serialize_message(&[
                        ("realm", realm.as_bytes()),
                        ("nonce", &nonce),
                        ("qop", b"auth"),
                        ("charset", b"utf-8"),
                        ("algorithm", b"md5-sess"),
                    ]);
                    *step = DigestStep::AwaitingResponse { nonce };
                    ServerStep::Challenge(challenge)
                }

                DigestStep::AwaitingResponse { nonce } => {
                    let response = digest_md5::parse_message(payload);
                    match Self::verify_digest(realm, nonce, &response, checker) {
                        Ok((username, rspauth)) => {
                            *step = DigestStep::AwaitingAck { username };
                            ServerStep::Challenge(digest_md5::serialize_message(&[(
                                "rspauth",
                                rspauth.as_bytes(),
                            )]))
                        }
                        Err(condition) => ServerStep::Failure(condition),
                    }
                }

                DigestStep::AwaitingAck { username } => ServerStep::Success {
                    username: core::mem::take(username),
                    additional_data: Vec::new(),
                },
            },
        }
    }

    fn verify_digest(
        realm: &str,
        nonce: &[u8],
        response: &DigestMessage,
        checker: &dyn PasswordChecker,
    ) -> Result<(String, String), SaslCondition> {
        let expected_uri = format!("xmpp/{realm}");
        if response.get("digest-uri").map(Vec::as_slice) != Some(expected_uri.as_bytes()) {
            log::warn!("DIGEST-MD5 digest-uri does not match our domain");
            return Err(SaslCondition::NotAuthorized);
        }
        if response.get("nonce").map(Vec::as_slice) != Some(nonce) {
            log::warn!("DIGEST-MD5 nonce mismatch");
            return Err(SaslCondition::NotAuthorized);
        }
        let username = response
            .get("username")
            .and_then(|u| String::from_utf8(u.clone()).ok())
            .ok_or(SaslCondition::MalformedRequest)?;
        let secret = checker.get_digest(&username, realm)?;
        let expected = digest_md5::calculate_digest("AUTHENTICATE", &secret, response)
            .map_err(|_| SaslCondition::MalformedRequest)?;
        if response.get("response").map(Vec::as_slice) != Some(expected.as_bytes()) {
            return Err(SaslCondition::NotAuthorized);
        }
        let rspauth = digest_md5::calculate_digest("", &secret, response)
            .map_err(|_| SaslCondition::MalformedRequest)?;
        Ok((username, rspauth))
    }
}
