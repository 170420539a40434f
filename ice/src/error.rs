use core::fmt;
use std::error::Error as StdError;
use std::io::Error as IoError;

/// Reasons a datagram could not be decoded as a STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    /// Shorter than the fixed header, or an attribute runs past the end
    Truncated,
    /// The header's length field does not match the datagram size
    LengthMismatch {
        /// Length announced in the header
        declared: usize,
        /// Length of the attributes actually received
        actual: usize,
    },
    /// An attribute has a size its type does not allow
    BadAttribute {
        /// Attribute type
        attr: u16,
    },
    /// An address attribute with an unknown family or a bad size
    BadAddress {
        /// Attribute type
        attr: u16,
    },
    /// MESSAGE-INTEGRITY does not match the key
    BadIntegrity,
    /// FINGERPRINT does not match the message
    BadFingerprint,
}

impl fmt::Display for StunError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StunError::Truncated => write!(fmt, "truncated STUN packet"),
            StunError::LengthMismatch { declared, actual } => write!(
                fmt,
                "STUN length {} does not match the {} bytes received",
                declared, actual
            ),
            StunError::BadAttribute { attr } => write!(fmt, "bad STUN attribute 0x{:04x}", attr),
            StunError::BadAddress { attr } => write!(fmt, "bad STUN address 0x{:04x}", attr),
            StunError::BadIntegrity => write!(fmt, "bad message integrity"),
            StunError::BadFingerprint => write!(fmt, "bad fingerprint"),
        }
    }
}

impl StdError for StunError {}

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Socket error
    Io(IoError),
    /// Malformed STUN message
    Stun(StunError),
    /// No pair or allocation is usable to send data yet
    NotConnected,
    /// The component id is not part of this connection
    NoComponent(u8),
    /// The TURN allocation failed
    Turn(String),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::Stun(e) => write!(fmt, "STUN error: {}", e),
            Error::NotConnected => write!(fmt, "not connected"),
            Error::NoComponent(component) => write!(fmt, "unknown component {}", component),
            Error::Turn(e) => write!(fmt, "TURN error: {}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Stun(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<StunError> for Error {
    fn from(e: StunError) -> Self {
        Error::Stun(e)
    }
}
