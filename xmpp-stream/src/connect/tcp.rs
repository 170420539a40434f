//! Plaintext TCP connector.

use crate::connect::{BoxedStream, DnsConfig, ServerConnector};
use crate::error::Error;
use crate::jid::Jid;

/// Connect via insecure plaintext TCP to an XMPP server.
///
/// This should only be used over localhost or otherwise when you know what
/// you are doing: servers offering STARTTLS are still used in the clear,
/// and servers requiring it cannot be used at all.
#[derive(Debug, Clone)]
pub struct TcpServerConnector(pub DnsConfig);

impl From<DnsConfig> for TcpServerConnector {
    fn from(dns_config: DnsConfig) -> TcpServerConnector {
        Self(dns_config)
    }
}

impl ServerConnector for TcpServerConnector {
    async fn connect(&self, jid: &Jid) -> Result<BoxedStream, Error> {
        log::debug!("Connecting to {} for {}", self.0, jid.domain());
        let stream = self.0.resolve().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
