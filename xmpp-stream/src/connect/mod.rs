//! `ServerConnector` provides the byte streams the client driver negotiates
//! over, and upgrades them to TLS when asked to.

use core::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, ProtocolError};
use crate::jid::Jid;

mod dns;
pub use dns::DnsConfig;

pub mod tcp;
pub use tcp::TcpServerConnector;

#[cfg(feature = "starttls-rust")]
pub mod starttls;
#[cfg(feature = "starttls-rust")]
pub use starttls::StartTlsServerConnector;

/// Any bidirectional byte stream a negotiation can run over.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// Type-erased transport, so that a plain stream and its TLS upgrade can be
/// held in the same place.
pub type BoxedStream = Box<dyn AsyncReadAndWrite>;

/// Trait called to connect to an XMPP server, perhaps called multiple times
/// when reconnecting.
pub trait ServerConnector: Clone + core::fmt::Debug + Send + Sync + Unpin + 'static {
    /// Open a transport to the server of `jid`. The stream header is sent
    /// by the negotiator, not by the connector.
    fn connect(&self, jid: &Jid) -> impl Future<Output = Result<BoxedStream, Error>> + Send;

    /// Whether [`Self::starttls`] can upgrade a stream.
    fn tls_available(&self) -> bool {
        false
    }

    /// Run a TLS handshake over `stream` once the server sent
    /// `<proceed/>`.
    fn starttls(
        &self,
        stream: BoxedStream,
        domain: &str,
    ) -> impl Future<Output = Result<BoxedStream, Error>> + Send {
        let _ = (stream, domain);
        async { Err(ProtocolError::TlsUnavailable.into()) }
    }
}
