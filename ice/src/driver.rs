//! Running an [`IceConnection`] over tokio UDP sockets.

use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::task::Poll;
use std::time::Instant;

use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::time::sleep_until;

use crate::candidate::is_ipv6_link_local;
use crate::connection::{IceConnection, IceEvent};
use crate::error::Error;

/// First port of the dynamic range of RFC 6335.
const FIRST_PORT: u16 = 49152;

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 65536;

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Whether an interface address can carry host candidates. IPv6
/// link-local addresses are left out, as many peers cannot use them.
fn is_host_address(ip: &IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified() && !ip.is_multicast() && !is_ipv6_link_local(ip)
}

/// The addresses of this host's interfaces that can carry host candidates.
///
/// Loopback interfaces and IPv6 link-local addresses are skipped.
pub fn discover_addresses() -> io::Result<Vec<IpAddr>> {
    let mut addresses = Vec::new();
    for interface in if_addrs::get_if_addrs()? {
        let ip = interface.ip();
        if interface.is_loopback() || !is_host_address(&ip) {
            log::trace!("Skipping {} on {}", ip, interface.name);
            continue;
        }
        if !addresses.contains(&ip) {
            addresses.push(ip);
        }
    }
    Ok(addresses)
}

/// Bind `count` consecutive ports, starting on an even one, on every one of
/// `addresses`. The sockets are returned port by port, and address by
/// address within a port.
///
/// If any bind fails, every socket of the attempt is closed and the next
/// even port is tried.
pub fn reserve_ports(addresses: &[IpAddr], count: usize) -> io::Result<Vec<std::net::UdpSocket>> {
    if addresses.is_empty() || count == 0 {
        return Ok(Vec::new());
    }
    let mut port = u32::from(FIRST_PORT);
    'ranges: while port + count as u32 <= 65536 {
        let mut sockets = Vec::with_capacity(addresses.len() * count);
        for offset in 0..count as u32 {
            for address in addresses {
                match std::net::UdpSocket::bind(SocketAddr::new(*address, (port + offset) as u16)) {
                    Ok(socket) => sockets.push(socket),
                    Err(e) => {
                        log::debug!("Could not bind {} port {}: {}", address, port + offset, e);
                        port += 2;
                        continue 'ranges;
                    }
                }
            }
        }
        return Ok(sockets);
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no free range of ports",
    ))
}

/// An [`IceConnection`] with its UDP sockets.
#[derive(Debug)]
pub struct UdpIceDriver {
    connection: IceConnection,
    sockets: Vec<(SocketAddr, UdpSocket)>,
    buffer: Vec<u8>,
}

impl UdpIceDriver {
    /// Reserve one port per component on each of `addresses` and start
    /// gathering. With no addresses, the ones of [`discover_addresses`] are
    /// used.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(mut connection: IceConnection, addresses: &[IpAddr]) -> Result<Self, Error> {
        let discovered;
        let addresses = if addresses.is_empty() {
            discovered = discover_addresses()?;
            log::debug!("Discovered {:?}", discovered);
            &discovered[..]
        } else {
            addresses
        };
        let mut sockets = Vec::new();
        for socket in reserve_ports(addresses, connection.components().len())? {
            socket.set_nonblocking(true)?;
            let local = socket.local_addr()?;
            sockets.push((local, UdpSocket::from_std(socket)?));
        }
        log::debug!(
            "Bound {:?}",
            sockets.iter().map(|(local, _)| *local).collect::<Vec<_>>()
        );
        connection.bind(sockets.iter().map(|(local, _)| *local).collect(), now());
        Ok(UdpIceDriver {
            connection,
            sockets,
            buffer: vec![0; MAX_DATAGRAM],
        })
    }

    /// The connection.
    pub fn connection(&self) -> &IceConnection {
        &self.connection
    }

    /// The connection, to add remote candidates or start connecting.
    pub fn connection_mut(&mut self) -> &mut IceConnection {
        &mut self.connection
    }

    /// Start connectivity checks.
    pub async fn connect_to_host(&mut self) {
        self.connection.connect_to_host(now());
        self.flush().await;
    }

    /// Send media on a component.
    pub async fn send_datagram(&mut self, component: u8, data: &[u8]) -> Result<(), Error> {
        self.connection.send_datagram(component, data, now())?;
        self.flush().await;
        Ok(())
    }

    /// Close the connection, releasing the TURN allocations.
    pub async fn close(&mut self) {
        self.connection.close(now());
        self.flush().await;
    }

    /// Drive the connection until it has something to report.
    pub async fn next_event(&mut self) -> Result<IceEvent, Error> {
        loop {
            self.flush().await;
            if let Some(event) = self.connection.poll_event() {
                return Ok(event);
            }

            let deadline = self.connection.poll_timeout();
            let sockets = &self.sockets;
            let buffer = &mut self.buffer;
            let received = poll_fn(|cx| {
                for (local, socket) in sockets {
                    let mut read = ReadBuf::new(&mut buffer[..]);
                    match socket.poll_recv_from(cx, &mut read) {
                        Poll::Ready(Ok(from)) => {
                            return Poll::Ready(Ok((*local, from, read.filled().len())))
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => (),
                    }
                }
                Poll::Pending
            });
            let timer = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            };
            let received = tokio::select! {
                received = received => Some(received),
                () = timer => None,
            };

            match received {
                Some(Ok((local, from, len))) => {
                    self.connection
                        .handle_datagram(local, from, &self.buffer[..len], now());
                }
                // ICMP errors show up on the next receive, they do not
                // concern the other pairs.
                Some(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                    log::debug!("Ignoring receive error: {}", e)
                }
                Some(Err(e)) => return Err(e.into()),
                None => self.connection.handle_timeout(now()),
            }
        }
    }

    async fn flush(&mut self) {
        while let Some(transmit) = self.connection.poll_transmit() {
            let Some((_, socket)) = self
                .sockets
                .iter()
                .find(|(local, _)| *local == transmit.local)
            else {
                log::warn!("No socket bound to {}", transmit.local);
                continue;
            };
            if let Err(e) = socket.send_to(&transmit.data, transmit.destination).await {
                log::warn!("Could not send to {}: {}", transmit.destination, e);
            }
        }
    }
}
