//! Configuration of both ends of a stream.

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::PasswordChecker;
use crate::jid::Jid;

/// How a client treats STARTTLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamSecurityMode {
    /// Upgrade to TLS whenever the server offers it.
    #[default]
    TlsEnabled,
    /// Never upgrade. Servers which require TLS cannot be used.
    TlsDisabled,
    /// Refuse to authenticate unless TLS was negotiated.
    TlsRequired,
}

/// Configuration of a client stream.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Our JID. A resource, if present, is requested when binding.
    pub jid: Jid,
    /// Password. Without one, ANONYMOUS is the only option.
    pub password: Option<String>,
    /// Client-chosen prefix of the resource. Sent as the bind2 tag with
    /// SASL2, and completed with a random suffix with classic binding.
    pub resource_prefix: Option<String>,
    /// STARTTLS policy.
    pub security: StreamSecurityMode,
    /// Mechanisms we are willing to use. Empty means all supported.
    pub mechanisms: Vec<String>,
    /// Interval between keep-alive pings once the stream is ready.
    pub keep_alive_interval: Duration,
    /// How long to wait for any data after a ping.
    pub keep_alive_timeout: Duration,
    /// Whether to enable XEP-0198 stream management when offered.
    pub stream_management: bool,
    /// Whether to prefer SASL2 when offered.
    pub use_sasl2: bool,
}

impl ClientConfig {
    /// Default configuration for `jid` with `password`.
    pub fn new(jid: Jid, password: impl Into<String>) -> Self {
        ClientConfig {
            jid,
            password: Some(password.into()),
            resource_prefix: None,
            security: StreamSecurityMode::default(),
            mechanisms: Vec::new(),
            keep_alive_interval: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(20),
            stream_management: true,
            use_sasl2: true,
        }
    }

    /// Configuration for an anonymous login on `domain`.
    pub fn anonymous(domain: Jid) -> Self {
        ClientConfig {
            password: None,
            ..Self::new(domain, "")
        }
    }

    /// Set the resource prefix.
    pub fn with_resource_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.resource_prefix = Some(prefix.into());
        self
    }

    /// Set the STARTTLS policy.
    pub fn with_security(mut self, security: StreamSecurityMode) -> Self {
        self.security = security;
        self
    }

    /// Domain of the account.
    pub fn domain(&self) -> &str {
        self.jid.domain().as_str()
    }
}

/// Configuration of the server end of client streams.
#[derive(Clone)]
pub struct ServerConfig {
    /// Domain we serve.
    pub domain: String,
    /// Whether STARTTLS can be offered.
    pub tls_available: bool,
    /// Credential backend. Without one, every authentication attempt fails
    /// with `temporary-auth-failure`.
    pub checker: Option<Arc<dyn PasswordChecker>>,
}

impl ServerConfig {
    /// Serve `domain` with the given credential backend.
    pub fn new(domain: impl Into<String>, checker: Arc<dyn PasswordChecker>) -> Self {
        ServerConfig {
            domain: domain.into(),
            tls_available: false,
            checker: Some(checker),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("domain", &self.domain)
            .field("tls_available", &self.tls_available)
            .field("checker", &self.checker.is_some())
            .finish()
    }
}
