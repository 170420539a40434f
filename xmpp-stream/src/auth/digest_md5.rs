// Copyright (c) 2017 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! DIGEST-MD5, RFC 2831.
//!
//! Only the `auth` quality of protection is supported, integrity and
//! confidentiality layers are left to TLS.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use rand::{distributions::Alphanumeric, thread_rng, Rng};

use crate::error::AuthError;

/// Name of the mechanism on the wire.
pub const NAME: &str = "DIGEST-MD5";

/// Parsed `key=value` list of a DIGEST-MD5 challenge or response.
pub type DigestMessage = BTreeMap<String, Vec<u8>>;

/// Parse a comma-separated list of `key=value` or `key="quoted value"`
/// directives.
pub fn parse_message(data: &[u8]) -> DigestMessage {
    let mut map = DigestMessage::new();
    let mut pos = 0;
    while pos < data.len() {
        while pos < data.len() && (data[pos] == b',' || data[pos].is_ascii_whitespace()) {
            pos += 1;
        }
        let key_start = pos;
        while pos < data.len() && data[pos] != b'=' && data[pos] != b',' {
            pos += 1;
        }
        let key = String::from_utf8_lossy(&data[key_start..pos])
            .trim()
            .to_owned();
        if pos >= data.len() || data[pos] == b',' {
            if !key.is_empty() {
                map.insert(key, Vec::new());
            }
            continue;
        }
        // skip '='
        pos += 1;

        let mut value = Vec::new();
        if pos < data.len() && data[pos] == b'"' {
            pos += 1;
            while pos < data.len() && data[pos] != b'"' {
                if data[pos] == b'\\' && pos + 1 < data.len() {
                    pos += 1;
                }
                value.push(data[pos]);
                pos += 1;
            }
            // skip closing quote
            pos += 1;
        } else {
            while pos < data.len() && data[pos] != b',' {
                value.push(data[pos]);
                pos += 1;
            }
            while value.last().map_or(false, |c| c.is_ascii_whitespace()) {
                value.pop();
            }
        }
        if !key.is_empty() {
            map.insert(key, value);
        }
    }
    map
}

/// Serialize directives, quoting all values except the tokens RFC 2831
/// defines as unquoted.
pub fn serialize_message(directives: &[(&str, &[u8])]) -> Vec<u8> {
    const UNQUOTED: &[&str] = &["algorithm", "charset", "nc", "qop", "response", "rspauth"];
    let mut out = Vec::new();
    for (key, value) in directives {
        if !out.is_empty() {
            out.push(b',');
        }
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        if UNQUOTED.contains(key) {
            out.extend_from_slice(value);
        } else {
            out.push(b'"');
            for &c in value.iter() {
                if c == b'"' || c == b'\\' {
                    out.push(b'\\');
                }
                out.push(c);
            }
            out.push(b'"');
        }
    }
    out
}

/// Compute `H(username:realm:password)`, the secret both sides need.
pub fn credentials_digest(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn hex_md5(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// Compute the `response` (with `a2_prefix` = `AUTHENTICATE`) or the
/// `rspauth` (with an empty `a2_prefix`) value.
pub fn calculate_digest(
    a2_prefix: &str,
    secret: &[u8; 16],
    message: &DigestMessage,
) -> Result<String, AuthError> {
    let get = |key: &str| {
        message
            .get(key)
            .ok_or_else(|| AuthError::Sasl(format!("DIGEST-MD5 directive {key} missing")))
    };
    let nonce = get("nonce")?;
    let cnonce = get("cnonce")?;
    let nc = get("nc")?;
    let qop = get("qop")?;
    let digest_uri = get("digest-uri")?;

    let mut a1 = secret.to_vec();
    a1.push(b':');
    a1.extend_from_slice(nonce);
    a1.push(b':');
    a1.extend_from_slice(cnonce);
    if let Some(authzid) = message.get("authzid") {
        if !authzid.is_empty() {
            a1.push(b':');
            a1.extend_from_slice(authzid);
        }
    }

    let mut a2 = a2_prefix.as_bytes().to_vec();
    a2.push(b':');
    a2.extend_from_slice(digest_uri);

    let mut kd = hex_md5(&a1).into_bytes();
    for part in [nonce, nc, cnonce, qop] {
        kd.push(b':');
        kd.extend_from_slice(part);
    }
    kd.push(b':');
    kd.extend_from_slice(hex_md5(&a2).as_bytes());
    Ok(hex_md5(&kd))
}

/// Generate a fresh nonce.
pub fn generate_nonce() -> Vec<u8> {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .collect()
}

#[derive(Debug)]
enum ClientStep {
    Initial,
    AwaitingRspAuth { expected: String },
    Done,
}

/// Client side of DIGEST-MD5.
#[derive(Debug)]
pub struct DigestMd5Client {
    username: String,
    password: String,
    service: String,
    host: String,
    cnonce: Vec<u8>,
    step: ClientStep,
}

impl DigestMd5Client {
    /// Create the mechanism. `host` is the domain of the server, used to
    /// build the `digest-uri`.
    pub fn new(username: &str, password: &str, host: &str) -> Self {
        DigestMd5Client {
            username: username.to_owned(),
            password: password.to_owned(),
            service: String::from("xmpp"),
            host: host.to_owned(),
            cnonce: generate_nonce(),
            step: ClientStep::Initial,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_cnonce(mut self, cnonce: &[u8]) -> Self {
        self.cnonce = cnonce.to_vec();
        self
    }

    /// Answer a server challenge.
    pub fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        match &self.step {
            ClientStep::Initial => {
                let input = parse_message(challenge);
                let nonce = input
                    .get("nonce")
                    .ok_or_else(|| AuthError::Sasl("DIGEST-MD5 challenge has no nonce".into()))?
                    .clone();
                let realm = input
                    .get("realm")
                    .map(|r| String::from_utf8_lossy(r).into_owned())
                    .unwrap_or_else(|| self.host.clone());
                let digest_uri = format!("{}/{}", self.service, self.host);

                let mut output = DigestMessage::new();
                output.insert("nonce".into(), nonce.clone());
                output.insert("cnonce".into(), self.cnonce.clone());
                output.insert("nc".into(), b"00000001".to_vec());
                output.insert("qop".into(), b"auth".to_vec());
                output.insert("digest-uri".into(), digest_uri.clone().into_bytes());

                let secret = credentials_digest(&self.username, &realm, &self.password);
                let response = calculate_digest("AUTHENTICATE", &secret, &output)?;
                let expected = calculate_digest("", &secret, &output)?;
                self.step = ClientStep::AwaitingRspAuth { expected };

                Ok(serialize_message(&[
                    ("username", self.username.as_bytes()),
                    ("realm", realm.as_bytes()),
                    ("nonce", &nonce),
                    ("cnonce", &self.cnonce),
                    ("nc", b"00000001"),
                    ("qop", b"auth"),
                    ("digest-uri", digest_uri.as_bytes()),
                    ("response", response.as_bytes()),
                    ("charset", b"utf-8"),
                ]))
            }
            ClientStep::AwaitingRspAuth { .. } => {
                self.success(challenge)?;
                Ok(Vec::new())
            }
            ClientStep::Done => Err(AuthError::Sasl("DIGEST-MD5 already completed".into())),
        }
    }

    /// Verify the `rspauth` the server sent, either as a second challenge or
    /// as additional data of the success.
    pub fn success(&mut self, data: &[u8]) -> Result<(), AuthError> {
        match &self.step {
            ClientStep::AwaitingRspAuth { expected } => {
                let input = parse_message(data);
                match input.get("rspauth") {
                    Some(rspauth) if rspauth.as_slice() == expected.as_bytes() => {
                        self.step = ClientStep::Done;
                        Ok(())
                    }
                    Some(_) => Err(AuthError::Sasl("DIGEST-MD5 rspauth mismatch".into())),
                    // The server already verified our response, and sent no
                    // proof of its own.
                    None => {
                        self.step = ClientStep::Done;
                        Ok(())
                    }
                }
            }
            ClientStep::Done => Ok(()),
            ClientStep::Initial => Err(AuthError::Sasl(
                "DIGEST-MD5 success before any challenge".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_quoted_and_plain_directives() {
        let message = parse_message(
            br#"realm="example.com",nonce="OA6MG9tEQGm2hh",qop="auth",charset=utf-8,algorithm=md5-sess"#,
        );
        assert_eq!(message["realm"], b"example.com");
        assert_eq!(message["nonce"], b"OA6MG9tEQGm2hh");
        assert_eq!(message["qop"], b"auth");
        assert_eq!(message["charset"], b"utf-8");
        assert_eq!(message["algorithm"], b"md5-sess");
    }

    #[test]
    fn parse_escaped_quote() {
        let message = parse_message(br#"username="a\"b",nc=00000001"#);
        assert_eq!(message["username"], b"a\"b");
        assert_eq!(message["nc"], b"00000001");
    }

    #[test]
    fn serialized_message_parses_back() {
        let data = serialize_message(&[("username", b"ju\"liet"), ("nc", b"00000001")]);
        assert_eq!(data, br#"username="ju\"liet",nc=00000001"#.to_vec());
        let message = parse_message(&data);
        assert_eq!(message["username"], b"ju\"liet");
    }

    // Example from RFC 2831 section 4, adapted for the xmpp service.
    #[test]
    fn response_matches_independent_computation() {
        let mut client =
            DigestMd5Client::new("chris", "secret", "elwood.innosoft.com").with_cnonce(b"OA6MHXh6VqTrRk");
        let response = client
            .response(br#"realm="elwood.innosoft.com",nonce="OA6MG9tEQGm2hh",qop="auth",algorithm=md5-sess,charset=utf-8"#)
            .unwrap();
        let response = parse_message(&response);
        assert_eq!(response["username"], b"chris");
        assert_eq!(response["digest-uri"], b"xmpp/elwood.innosoft.com");

        let secret = credentials_digest("chris", "elwood.innosoft.com", "secret");
        let expected = calculate_digest("AUTHENTICATE", &secret, &response).unwrap();
        assert_eq!(response["response"], expected.as_bytes());
        let rspauth = calculate_digest("", &secret, &response).unwrap();

        let proof = serialize_message(&[("rspauth", rspauth.as_bytes())]);
        assert!(client.response(&proof).unwrap().is_empty());
    }

    #[test]
    fn wrong_rspauth_is_rejected() {
        let mut client = DigestMd5Client::new("chris", "secret", "example.com");
        client.response(br#"nonce="abc",qop="auth""#).unwrap();
        assert!(client.success(b"rspauth=0123456789abcdef0123456789abcdef").is_err());
    }
}
