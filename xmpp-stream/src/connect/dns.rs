#[cfg(feature = "dns")]
use futures::{future::select_ok, FutureExt};
#[cfg(feature = "dns")]
use hickory_resolver::{
    config::LookupIpStrategy, name_server::TokioConnectionProvider, IntoName, TokioAsyncResolver,
};
use std::net::SocketAddr;
use tokio::net::TcpStream;

use crate::Error;

/// Where the client driver finds the server.
#[derive(Clone, Debug)]
pub enum DnsConfig {
    /// Look up SRV records, then connect to the targets by priority
    #[cfg(feature = "dns")]
    UseSrv {
        /// Domain the SRV records are looked up under
        host: String,
        /// Service label, eg. `_xmpp-client._tcp`
        srv: String,
        /// Port used on the domain itself when no SRV record exists
        fallback_port: u16,
    },

    /// Resolve a host name and connect to all its addresses in parallel
    #[cfg(feature = "dns")]
    NoSrv {
        /// Server host name
        host: String,
        /// Server port
        port: u16,
    },

    /// A literal socket address
    Addr {
        /// IP and port
        addr: SocketAddr,
    },
}

impl std::fmt::Display for DnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "dns")]
            Self::UseSrv { host, srv, .. } => write!(f, "{}.{}", srv, host),
            #[cfg(feature = "dns")]
            Self::NoSrv { host, port } => write!(f, "{}:{}", host, port),
            Self::Addr { addr } => write!(f, "{}", addr),
        }
    }
}

/// One SRV answer: priority, weight, target and port.
#[cfg(any(feature = "dns", test))]
type SrvTarget = (u16, u16, String, u16);

/// Order SRV answers by increasing priority, and by decreasing weight within
/// the same priority, per RFC 2782.
#[cfg(any(feature = "dns", test))]
fn order_srv_targets(mut targets: Vec<SrvTarget>) -> Vec<(String, u16)> {
    targets.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
    targets
        .into_iter()
        // "." means the service is decidedly not available.
        .filter(|(_, _, target, _)| target != ".")
        .map(|(_, _, target, port)| (target.trim_end_matches('.').to_owned(), port))
        .collect()
}

impl DnsConfig {
    /// Constructor for DnsConfig::UseSrv variant
    #[cfg(feature = "dns")]
    pub fn srv(host: &str, srv: &str, fallback_port: u16) -> Self {
        Self::UseSrv {
            host: host.to_owned(),
            srv: srv.to_owned(),
            fallback_port,
        }
    }

    /// The usual `_xmpp-client._tcp` lookup with a fallback to port 5222
    #[cfg(feature = "dns")]
    pub fn srv_default_client(host: &str) -> Self {
        Self::srv(host, "_xmpp-client._tcp", 5222)
    }

    /// Constructor for DnsConfig::NoSrv variant
    #[cfg(feature = "dns")]
    pub fn no_srv(host: &str, port: u16) -> Self {
        Self::NoSrv {
            host: host.to_owned(),
            port,
        }
    }

    /// Parse a literal `ip:port`.
    pub fn addr(addr: &str) -> Result<Self, Error> {
        Ok(Self::Addr {
            addr: addr.parse()?,
        })
    }

    /// Resolve and connect.
    pub async fn resolve(&self) -> Result<TcpStream, Error> {
        match self {
            #[cfg(feature = "dns")]
            Self::UseSrv {
                host,
                srv,
                fallback_port,
            } => Self::connect_srv(host, srv, *fallback_port).await,
            #[cfg(feature = "dns")]
            Self::NoSrv { host, port } => Self::connect_host(host, *port).await,
            Self::Addr { addr } => Ok(TcpStream::connect(addr).await?),
        }
    }

    #[cfg(feature = "dns")]
    async fn connect_srv(host: &str, srv: &str, fallback_port: u16) -> Result<TcpStream, Error> {
        let ascii_domain = idna::domain_to_ascii(host)?;
        if let Ok(ip) = ascii_domain.parse() {
            log::debug!("Connecting to literal address {ip}:{fallback_port}");
            return Ok(TcpStream::connect(SocketAddr::new(ip, fallback_port)).await?);
        }

        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        let srv_domain = format!("{}.{}.", srv, ascii_domain).into_name()?;
        let lookup = match resolver.srv_lookup(srv_domain.clone()).await {
            Ok(lookup) => lookup,
            Err(e) => {
                log::debug!("No SRV record under {srv_domain} ({e}), using {host}:{fallback_port}");
                return Self::connect_host(host, fallback_port).await;
            }
        };
        let targets = order_srv_targets(
            lookup
                .iter()
                .map(|record| {
                    (
                        record.priority(),
                        record.weight(),
                        record.target().to_ascii(),
                        record.port(),
                    )
                })
                .collect(),
        );
        for (target, port) in targets {
            log::debug!("Attempting connection to {target}:{port}");
            match Self::connect_host(&target, port).await {
                Ok(stream) => return Ok(stream),
                Err(e) => log::warn!("Connection to {target}:{port} failed: {e}"),
            }
        }
        Err(Error::Disconnected)
    }

    #[cfg(feature = "dns")]
    async fn connect_host(host: &str, port: u16) -> Result<TcpStream, Error> {
        let ascii_domain = idna::domain_to_ascii(host)?;
        if let Ok(ip) = ascii_domain.parse() {
            return Ok(TcpStream::connect(SocketAddr::new(ip, port)).await?);
        }

        let (config, mut options) = hickory_resolver::system_conf::read_system_conf()?;
        options.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        let resolver = TokioAsyncResolver::new(config, options, TokioConnectionProvider::default());
        let ips = resolver.lookup_ip(ascii_domain).await?;

        // Happy Eyeballs: race all addresses, keep the first to connect.
        select_ok(
            ips.into_iter()
                .map(|ip| TcpStream::connect(SocketAddr::new(ip, port)).boxed()),
        )
        .await
        .map(|(stream, _)| stream)
        .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srv_targets_by_priority_then_weight() {
        let ordered = order_srv_targets(vec![
            (20, 0, String::from("backup.example.com."), 5222),
            (10, 10, String::from("light.example.com."), 5222),
            (10, 60, String::from("heavy.example.com."), 5223),
            (30, 0, String::from("."), 5222),
        ]);
        assert_eq!(
            ordered,
            vec![
                (String::from("heavy.example.com"), 5223),
                (String::from("light.example.com"), 5222),
                (String::from("backup.example.com"), 5222),
            ]
        );
    }

    #[test]
    fn literal_address() {
        let config = DnsConfig::addr("127.0.0.1:5222").unwrap();
        assert_eq!(config.to_string(), "127.0.0.1:5222");
        assert!(matches!(DnsConfig::addr("not an address"), Err(Error::Addr(_))));
    }

    #[tokio::test]
    async fn connects_to_literal_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = DnsConfig::Addr {
            addr: listener.local_addr().unwrap(),
        };
        let (connected, accepted) = tokio::join!(config.resolve(), listener.accept());
        assert!(connected.is_ok());
        assert!(accepted.is_ok());
    }
}
