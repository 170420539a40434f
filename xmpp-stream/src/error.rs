use core::fmt;
#[cfg(feature = "dns")]
use hickory_resolver::{
    error::ResolveError as DnsResolveError, proto::error::ProtoError as DnsProtoError,
};
use sasl::client::MechanismError as SaslMechanismError;
use std::error::Error as StdError;
use std::io::Error as IoError;
use std::net::AddrParseError;

use crate::{auth::SaslCondition, jid, minidom};

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(IoError),
    /// Error parsing Jabber-Id
    JidParse(jid::Error),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// Authentication error
    Auth(AuthError),
    /// `<stream:error/>` received from the peer
    Stream(StreamErrorCondition),
    /// TLS handshake or configuration error
    Tls(String),
    /// The keep-alive ping was not answered in time
    KeepAliveTimeout,
    /// Connection closed
    Disconnected,
    /// Operation not allowed in the current negotiation state
    InvalidState,
    /// DNS protocol error
    #[cfg(feature = "dns")]
    Dns(DnsProtoError),
    /// DNS resolution error
    #[cfg(feature = "dns")]
    Resolve(DnsResolveError),
    /// DNS label conversion error, no details available from module
    /// `idna`
    #[cfg(feature = "dns")]
    Idna,
    /// Invalid IP/Port address
    Addr(AddrParseError),
}

impl Error {
    /// Stable, machine-checkable identifier of the failure, suitable for
    /// branching on the reason of a disconnect.
    pub fn condition(&self) -> &'static str {
        match self {
            Error::Io(_) => "socket-error",
            Error::JidParse(_) => "jid-malformed",
            Error::Protocol(e) => e.condition(),
            Error::Auth(AuthError::Fail(c)) => c.as_str(),
            Error::Auth(AuthError::NoMechanism) => "invalid-mechanism",
            Error::Auth(AuthError::Sasl(_)) => "sasl-mechanism-error",
            Error::Stream(c) => c.as_str(),
            Error::Tls(_) => "tls-error",
            Error::KeepAliveTimeout => "keepalive-timeout",
            Error::Disconnected => "disconnected",
            Error::InvalidState => "invalid-state",
            #[cfg(feature = "dns")]
            Error::Dns(_) | Error::Resolve(_) | Error::Idna => "remote-server-not-found",
            Error::Addr(_) => "remote-server-not-found",
        }
    }

    /// Whether the peer told us another session replaced ours, in which case
    /// reconnecting would just kick that session out again.
    pub fn is_fatal_for_reconnect(&self) -> bool {
        matches!(self, Error::Stream(StreamErrorCondition::Conflict))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Stream(c) => write!(fmt, "stream error: {}", c),
            Error::Tls(e) => write!(fmt, "TLS error: {}", e),
            Error::KeepAliveTimeout => write!(fmt, "keep-alive ping timed out"),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::InvalidState => write!(fmt, "invalid state"),
            #[cfg(feature = "dns")]
            Error::Dns(e) => write!(fmt, "{:?}", e),
            #[cfg(feature = "dns")]
            Error::Resolve(e) => write!(fmt, "{:?}", e),
            #[cfg(feature = "dns")]
            Error::Idna => write!(fmt, "IDNA error"),
            Error::Addr(e) => write!(fmt, "Wrong network address: {e}"),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<StreamErrorCondition> for Error {
    fn from(e: StreamErrorCondition) -> Self {
        Error::Stream(e)
    }
}

#[cfg(feature = "dns")]
impl From<idna::Errors> for Error {
    fn from(_e: idna::Errors) -> Self {
        Error::Idna
    }
}

#[cfg(feature = "dns")]
impl From<DnsResolveError> for Error {
    fn from(e: DnsResolveError) -> Error {
        Error::Resolve(e)
    }
}

#[cfg(feature = "dns")]
impl From<DnsProtoError> for Error {
    fn from(e: DnsProtoError) -> Error {
        Error::Dns(e)
    }
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Error {
        Error::Addr(e)
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// XML parser error
    Parser(minidom::Error),
    /// The stream was addressed to a domain we do not serve
    HostUnknown,
    /// The peer opened a stream with a version other than 1.0
    UnsupportedVersion,
    /// Local policy requires TLS but the peer does not offer it
    TlsRequired,
    /// The peer requires TLS but it is not available locally
    TlsUnavailable,
    /// Invalid response to resource binding
    InvalidBindResponse,
    /// Invalid response to session establishment
    InvalidSessionResponse,
    /// Unexpected <stream:stream>
    InvalidStreamStart,
    /// Encountered an element which is not valid at this point of the
    /// negotiation
    UnexpectedElement(String),
    /// The peer closed the stream in the middle of negotiation
    StreamFooterReceived,
    /// No id attribute in <stream:stream>
    NoStreamId,
}

impl ProtocolError {
    fn condition(&self) -> &'static str {
        match self {
            ProtocolError::Parser(_) => "not-well-formed",
            ProtocolError::HostUnknown => "host-unknown",
            ProtocolError::UnsupportedVersion => "unsupported-version",
            ProtocolError::TlsRequired => "policy-violation",
            ProtocolError::TlsUnavailable => "encryption-required",
            ProtocolError::InvalidBindResponse | ProtocolError::InvalidSessionResponse => {
                "undefined-condition"
            }
            ProtocolError::InvalidStreamStart | ProtocolError::NoStreamId => "invalid-xml",
            ProtocolError::UnexpectedElement(_) => "unsupported-stanza-type",
            ProtocolError::StreamFooterReceived => "disconnected",
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::HostUnknown => write!(fmt, "stream addressed to an unknown host"),
            ProtocolError::UnsupportedVersion => write!(fmt, "unsupported stream version"),
            ProtocolError::TlsRequired => {
                write!(fmt, "TLS is required locally but not offered by the peer")
            }
            ProtocolError::TlsUnavailable => {
                write!(fmt, "the peer requires TLS but it is not available")
            }
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::InvalidSessionResponse => {
                write!(fmt, "invalid response to session establishment")
            }
            ProtocolError::InvalidStreamStart => write!(fmt, "unexpected <stream:stream>"),
            ProtocolError::UnexpectedElement(name) => {
                write!(fmt, "unexpected <{}/> during negotiation", name)
            }
            ProtocolError::StreamFooterReceived => {
                write!(fmt, "stream footer received during negotiation")
            }
            ProtocolError::NoStreamId => write!(fmt, "no id attribute in <stream:stream>"),
        }
    }
}

impl StdError for ProtocolError {}

impl From<minidom::Error> for ProtocolError {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e).into()
    }
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available
    NoMechanism,
    /// Local SASL implementation error
    Sasl(String),
    /// Failure from server
    Fail(SaslCondition),
}

impl StdError for AuthError {}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(s) => write!(fmt, "local SASL implementation error: {}", s),
            AuthError::Fail(c) => write!(fmt, "failure from the server: {}", c),
        }
    }
}

impl From<SaslMechanismError> for AuthError {
    fn from(e: SaslMechanismError) -> Self {
        AuthError::Sasl(e.to_string())
    }
}

/// Defined conditions of `<stream:error/>`, RFC 6120 section 4.9.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    /// bad-format
    BadFormat,
    /// conflict: a new session with the same resource replaced this one
    Conflict,
    /// connection-timeout
    ConnectionTimeout,
    /// host-unknown
    HostUnknown,
    /// internal-server-error
    InternalServerError,
    /// invalid-from
    InvalidFrom,
    /// invalid-namespace
    InvalidNamespace,
    /// not-authorized
    NotAuthorized,
    /// not-well-formed
    NotWellFormed,
    /// policy-violation
    PolicyViolation,
    /// reset
    Reset,
    /// see-other-host
    SeeOtherHost,
    /// system-shutdown
    SystemShutdown,
    /// unsupported-stanza-type
    UnsupportedStanzaType,
    /// unsupported-version
    UnsupportedVersion,
    /// undefined-condition, or any condition we do not know about
    UndefinedCondition,
}

const STREAM_CONDITIONS: &[(StreamErrorCondition, &str)] = &[
    (StreamErrorCondition::BadFormat, "bad-format"),
    (StreamErrorCondition::Conflict, "conflict"),
    (StreamErrorCondition::ConnectionTimeout, "connection-timeout"),
    (StreamErrorCondition::HostUnknown, "host-unknown"),
    (StreamErrorCondition::InternalServerError, "internal-server-error"),
    (StreamErrorCondition::InvalidFrom, "invalid-from"),
    (StreamErrorCondition::InvalidNamespace, "invalid-namespace"),
    (StreamErrorCondition::NotAuthorized, "not-authorized"),
    (StreamErrorCondition::NotWellFormed, "not-well-formed"),
    (StreamErrorCondition::PolicyViolation, "policy-violation"),
    (StreamErrorCondition::Reset, "reset"),
    (StreamErrorCondition::SeeOtherHost, "see-other-host"),
    (StreamErrorCondition::SystemShutdown, "system-shutdown"),
    (StreamErrorCondition::UnsupportedStanzaType, "unsupported-stanza-type"),
    (StreamErrorCondition::UnsupportedVersion, "unsupported-version"),
    (StreamErrorCondition::UndefinedCondition, "undefined-condition"),
];

impl StreamErrorCondition {
    /// The element name of this condition.
    pub fn as_str(&self) -> &'static str {
        STREAM_CONDITIONS
            .iter()
            .find(|(c, _)| c == self)
            .map(|(_, name)| *name)
            .unwrap_or("undefined-condition")
    }

    /// Look up a condition by element name, mapping unknown names to
    /// [`Self::UndefinedCondition`].
    pub fn from_name(name: &str) -> Self {
        STREAM_CONDITIONS
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(c, _)| *c)
            .unwrap_or(StreamErrorCondition::UndefinedCondition)
    }

    /// Extract the condition from a received `<stream:error/>`.
    pub fn from_element(elem: &minidom::Element) -> Self {
        elem.children()
            .find(|child| child.ns() == crate::ns::XMPP_STREAMS && child.name() != "text")
            .map(|child| Self::from_name(child.name()))
            .unwrap_or(StreamErrorCondition::UndefinedCondition)
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_condition_from_element() {
        let elem: minidom::Element = "<error xmlns='http://etherx.jabber.org/streams'><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/><text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>Replaced by new connection</text></error>"
            .parse()
            .unwrap();
        let condition = StreamErrorCondition::from_element(&elem);
        assert_eq!(condition, StreamErrorCondition::Conflict);
        assert!(Error::Stream(condition).is_fatal_for_reconnect());
        assert_eq!(Error::Stream(condition).condition(), "conflict");
    }

    #[test]
    fn unknown_stream_error_is_undefined() {
        assert_eq!(
            StreamErrorCondition::from_name("frobnicated"),
            StreamErrorCondition::UndefinedCondition
        );
    }

    #[test]
    fn auth_failures_keep_their_condition() {
        let err: Error = AuthError::Fail(SaslCondition::NotAuthorized).into();
        assert_eq!(err.condition(), "not-authorized");
        let err: Error = ProtocolError::TlsUnavailable.into();
        assert_eq!(err.condition(), "encryption-required");
    }
}
