use sasl::client::mechanisms::{Anonymous, Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};

use super::digest_md5::{self, DigestMd5Client};
use crate::error::AuthError;

/// What a client knows about itself when authenticating.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    /// Local part of the JID.
    pub username: String,
    /// Password, if any. Without one only ANONYMOUS is attempted.
    pub password: Option<String>,
    /// Domain of the server, used by DIGEST-MD5.
    pub domain: String,
}

impl ClientCredentials {
    fn sasl_credentials(&self, password: &str) -> Credentials {
        Credentials::default()
            .with_username(self.username.clone())
            .with_password(password.to_owned())
            .with_channel_binding(ChannelBinding::None)
    }
}

/// Mechanism names in order of decreasing strength.
pub const MECHANISM_PREFERENCE: &[&str] = &[
    "SCRAM-SHA-256",
    "SCRAM-SHA-1",
    digest_md5::NAME,
    "PLAIN",
    "ANONYMOUS",
];

/// A client SASL mechanism in progress.
pub enum ClientMechanism {
    /// Mechanism provided by the `sasl` crate.
    Sasl(Box<dyn Mechanism + Send + Sync>),
    /// DIGEST-MD5.
    DigestMd5(DigestMd5Client),
}

impl core::fmt::Debug for ClientMechanism {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_tuple("ClientMechanism").field(&self.name()).finish()
    }
}

impl ClientMechanism {
    /// Instantiate the mechanism called `name` with the given credentials.
    pub fn new(name: &str, credentials: &ClientCredentials) -> Option<Self> {
        let password = credentials.password.as_deref();
        match (name, password) {
            ("SCRAM-SHA-256", Some(password)) => {
                Scram::<Sha256>::from_credentials(credentials.sasl_credentials(password))
                    .ok()
                    .map(|m| ClientMechanism::Sasl(Box::new(m)))
            }
            ("SCRAM-SHA-1", Some(password)) => {
                Scram::<Sha1>::from_credentials(credentials.sasl_credentials(password))
                    .ok()
                    .map(|m| ClientMechanism::Sasl(Box::new(m)))
            }
            (digest_md5::NAME, Some(password)) => Some(ClientMechanism::DigestMd5(
                DigestMd5Client::new(&credentials.username, password, &credentials.domain),
            )),
            ("PLAIN", Some(password)) => {
                Plain::from_credentials(credentials.sasl_credentials(password))
                    .ok()
                    .map(|m| ClientMechanism::Sasl(Box::new(m)))
            }
            ("ANONYMOUS", None) => Some(ClientMechanism::Sasl(Box::new(Anonymous::new()))),
            _ => None,
        }
    }

    /// Pick the strongest mechanism offered by the server which is also in
    /// `allowed` (all known mechanisms when `allowed` is empty).
    pub fn select<S: AsRef<str>>(
        offered: &[S],
        allowed: &[String],
        credentials: &ClientCredentials,
    ) -> Result<Self, AuthError> {
        MECHANISM_PREFERENCE
            .iter()
            .filter(|name| allowed.is_empty() || allowed.iter().any(|a| a.as_str() == **name))
            .filter(|name| offered.iter().any(|o| o.as_ref() == **name))
            .find_map(|name| Self::new(name, credentials))
            .ok_or(AuthError::NoMechanism)
    }

    /// Name of the mechanism on the wire.
    pub fn name(&self) -> &str {
        match self {
            ClientMechanism::Sasl(mechanism) => mechanism.name(),
            ClientMechanism::DigestMd5(_) => digest_md5::NAME,
        }
    }

    /// Whether the server speaks first, in which case no initial response
    /// is sent at all.
    pub fn server_first(&self) -> bool {
        matches!(self, ClientMechanism::DigestMd5(_))
    }

    /// Initial response, sent along with the mechanism name.
    pub fn initial(&mut self) -> Vec<u8> {
        match self {
            ClientMechanism::Sasl(mechanism) => mechanism.initial(),
            ClientMechanism::DigestMd5(_) => Vec::new(),
        }
    }

    /// Answer a challenge.
    pub fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        match self {
            ClientMechanism::Sasl(mechanism) => Ok(mechanism.response(challenge)?),
            ClientMechanism::DigestMd5(mechanism) => mechanism.response(challenge),
        }
    }

    /// Process the additional data of a success.
    pub fn success(&mut self, data: &[u8]) -> Result<(), AuthError> {
        match self {
            ClientMechanism::Sasl(mechanism) => Ok(mechanism.success(data)?),
            ClientMechanism::DigestMd5(mechanism) => mechanism.success(data),
        }
    }
}
