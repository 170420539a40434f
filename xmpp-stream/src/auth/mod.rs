// Copyright (c) 2017 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SASL plumbing shared by both ends of a stream.
//!
//! The client side reuses the mechanisms of the [`sasl`] crate where it has
//! them and adds DIGEST-MD5. The server side implements PLAIN and
//! DIGEST-MD5 on top of a [`PasswordChecker`].

use core::fmt;

use base64::{engine::general_purpose::STANDARD as Base64, Engine};

use crate::minidom::Element;
use crate::ns;

mod checker;
mod client;
pub(crate) mod digest_md5;
mod server;

pub use checker::{MemoryPasswordChecker, PasswordChecker, PasswordError};
pub use client::{ClientCredentials, ClientMechanism};
pub use server::{ServerMechanism, ServerStep};

/// Defined conditions of a SASL `<failure/>`, RFC 6120 section 6.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslCondition {
    /// The receiving entity acknowledges that the authentication handshake
    /// has been aborted by the initiating entity.
    Aborted,
    /// The account of the initiating entity has been temporarily disabled.
    AccountDisabled,
    /// The authentication failed because the credentials have expired.
    CredentialsExpired,
    /// The mechanism requested can only be used over an encrypted stream.
    EncryptionRequired,
    /// The data provided could not be processed because of bad base64.
    IncorrectEncoding,
    /// The authzid provided is invalid.
    InvalidAuthzid,
    /// The initiating entity did not specify a supported mechanism.
    InvalidMechanism,
    /// The request is malformed.
    MalformedRequest,
    /// The mechanism requested is weaker than server policy permits.
    MechanismTooWeak,
    /// The credentials provided were wrong.
    NotAuthorized,
    /// A temporary error on the receiving side, the initiating entity may
    /// retry later.
    TemporaryAuthFailure,
}

const SASL_CONDITIONS: &[(SaslCondition, &str)] = &[
    (SaslCondition::Aborted, "aborted"),
    (SaslCondition::AccountDisabled, "account-disabled"),
    (SaslCondition::CredentialsExpired, "credentials-expired"),
    (SaslCondition::EncryptionRequired, "encryption-required"),
    (SaslCondition::IncorrectEncoding, "incorrect-encoding"),
    (SaslCondition::InvalidAuthzid, "invalid-authzid"),
    (SaslCondition::InvalidMechanism, "invalid-mechanism"),
    (SaslCondition::MalformedRequest, "malformed-request"),
    (SaslCondition::MechanismTooWeak, "mechanism-too-weak"),
    (SaslCondition::NotAuthorized, "not-authorized"),
    (SaslCondition::TemporaryAuthFailure, "temporary-auth-failure"),
];

impl SaslCondition {
    /// The element name of this condition.
    pub fn as_str(&self) -> &'static str {
        SASL_CONDITIONS
            .iter()
            .find(|(c, _)| c == self)
            .map(|(_, name)| *name)
            .unwrap_or("not-authorized")
    }

    /// Look up a condition by element name.
    pub fn from_name(name: &str) -> Option<Self> {
        SASL_CONDITIONS
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(c, _)| *c)
    }

    /// Extract the condition of a SASL or SASL2 `<failure/>`. Servers
    /// sending garbage are treated as refusing the credentials.
    pub fn from_failure(elem: &Element) -> Self {
        elem.children()
            .filter(|child| child.ns() == ns::SASL)
            .find_map(|child| Self::from_name(child.name()))
            .unwrap_or(SaslCondition::NotAuthorized)
    }

    /// Build the `<failure/>` element carrying this condition.
    pub fn to_failure(&self, namespace: &str) -> Element {
        let condition = Element::builder(self.as_str(), ns::SASL).build();
        Element::builder("failure", namespace)
            .append(condition)
            .build()
    }
}

impl fmt::Display for SaslCondition {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// Encode SASL data for transport inside an element. Empty data is
/// represented as `=` as mandated by RFC 6120 section 6.4.2.
pub(crate) fn encode_data(data: &[u8]) -> String {
    if data.is_empty() {
        String::from("=")
    } else {
        Base64.encode(data)
    }
}

/// Decode the base64 text of a SASL element.
pub(crate) fn decode_data(text: &str) -> Result<Vec<u8>, SaslCondition> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    Base64
        .decode(text)
        .map_err(|_| SaslCondition::IncorrectEncoding)
}

/// Build an element in the given namespace whose text is base64 SASL data.
pub(crate) fn data_element(name: &str, namespace: &str, data: &[u8]) -> Element {
    Element::builder(name, namespace)
        .append(encode_data(data))
        .build()
}
