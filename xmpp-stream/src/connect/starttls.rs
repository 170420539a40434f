//! `StartTlsServerConnector` connects over TCP and upgrades with rustls
//! when the server offers STARTTLS.

use std::sync::Arc;

use tokio_rustls::{
    rustls::pki_types::ServerName,
    rustls::{ClientConfig, RootCertStore},
    TlsConnector,
};

use crate::connect::{BoxedStream, DnsConfig, ServerConnector};
use crate::error::Error;
use crate::jid::Jid;

/// Connect via TCP+StartTLS to an XMPP server
#[derive(Debug, Clone)]
pub struct StartTlsServerConnector(pub DnsConfig);

impl From<DnsConfig> for StartTlsServerConnector {
    fn from(dns_config: DnsConfig) -> StartTlsServerConnector {
        Self(dns_config)
    }
}

fn tls_config() -> Result<ClientConfig, Error> {
    let mut root_store = RootCertStore::empty();
    #[cfg(feature = "webpki-roots")]
    {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    #[cfg(feature = "rustls-native-certs")]
    {
        let (added, ignored) =
            root_store.add_parsable_certificates(rustls_native_certs::load_native_certs()?);
        log::trace!("Loaded {} native roots, ignored {}", added, ignored);
    }
    if root_store.is_empty() {
        return Err(Error::Tls(String::from("no trusted root certificates")));
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

impl ServerConnector for StartTlsServerConnector {
    async fn connect(&self, jid: &Jid) -> Result<BoxedStream, Error> {
        log::debug!("Connecting to {} for {}", self.0, jid.domain());
        let stream = self.0.resolve().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn tls_available(&self) -> bool {
        true
    }

    async fn starttls(&self, stream: BoxedStream, domain: &str) -> Result<BoxedStream, Error> {
        let name =
            ServerName::try_from(domain.to_owned()).map_err(|e| Error::Tls(e.to_string()))?;
        let connector = TlsConnector::from(Arc::new(tls_config()?));
        let tls_stream = connector.connect(name, stream).await?;
        log::debug!("TLS established with {}", domain);
        Ok(Box::new(tls_stream))
    }
}
