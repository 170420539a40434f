//! Accepting client streams.
//!
//! [`IncomingClient`] drives a [`ServerNegotiator`] over an accepted
//! connection in a spawned task, and yields its events as a `futures`
//! [`Stream`].

use core::pin::Pin;
use core::task::{Context, Poll};
use std::net::SocketAddr;
use std::time::Instant;

use futures::{ready, Stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[cfg(feature = "starttls-rust")]
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;
use crate::connect::{AsyncReadAndWrite, BoxedStream};
use crate::error::{Error, ProtocolError};
use crate::event::{Event, Output};
use crate::framer::Utf8Decoder;
use crate::jid::Jid;
use crate::minidom::Element;

mod negotiator;

pub use negotiator::{ServerNegotiator, ServerState};

#[cfg(feature = "starttls-rust")]
type Acceptor = TlsAcceptor;
#[cfg(not(feature = "starttls-rust"))]
type Acceptor = core::convert::Infallible;

enum Command {
    Send(Element, oneshot::Sender<Result<(), Error>>),
    Close,
}

/// One client connected to us.
///
/// Yields [`Event::Connected`] once the client is authenticated and bound,
/// then its stanzas, and finally [`Event::Disconnected`].
pub struct IncomingClient {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    jid: Option<Jid>,
    task: Option<JoinHandle<()>>,
}

impl IncomingClient {
    /// Negotiate over an accepted stream, without STARTTLS.
    ///
    /// Must be called from within a tokio runtime.
    pub fn accept<S: AsyncReadAndWrite + 'static>(stream: S, mut config: ServerConfig) -> Self {
        config.tls_available = false;
        Self::spawn(Box::new(stream), config, None)
    }

    /// Negotiate over an accepted stream, offering STARTTLS with the given
    /// acceptor.
    #[cfg(feature = "starttls-rust")]
    pub fn accept_with_tls<S: AsyncReadAndWrite + 'static>(
        stream: S,
        mut config: ServerConfig,
        acceptor: TlsAcceptor,
    ) -> Self {
        config.tls_available = true;
        Self::spawn(Box::new(stream), config, Some(acceptor))
    }

    fn spawn(stream: BoxedStream, config: ServerConfig, acceptor: Option<Acceptor>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let worker = Worker {
            negotiator: ServerNegotiator::new(config),
            acceptor,
            commands: command_rx,
            events: event_tx,
        };
        IncomingClient {
            commands,
            events,
            jid: None,
            task: Some(tokio::spawn(worker.run(stream))),
        }
    }

    /// JID the client is bound to, once [`Event::Connected`] was yielded.
    pub fn jid(&self) -> Option<&Jid> {
        self.jid.as_ref()
    }

    /// Send a stanza to the client.
    pub async fn send_stanza(&mut self, stanza: Element) -> Result<(), Error> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Send(stanza, reply))
            .map_err(|_| Error::Disconnected)?;
        result.await.map_err(|_| Error::Disconnected)?
    }

    /// Close the stream and wait for the connection task to finish.
    pub async fn close(mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Incoming client task failed: {}", e);
            }
        }
    }
}

impl Stream for IncomingClient {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let event = ready!(self.events.poll_recv(cx));
        if let Some(Event::Connected { jid, .. }) = &event {
            self.jid = Some(jid.clone());
        }
        Poll::Ready(event)
    }
}

/// Current time on the runtime's clock, which follows paused time in tests.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

struct Worker {
    negotiator: ServerNegotiator,
    acceptor: Option<Acceptor>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
}

impl Worker {
    async fn run(mut self, stream: BoxedStream) {
        let mut stream = Some(stream);
        let mut decoder = Utf8Decoder::default();
        let mut buf = vec![0u8; 4096];
        loop {
            if self.flush(&mut stream).await {
                break;
            }
            let Some(transport) = stream.as_mut() else {
                break;
            };
            tokio::select! {
                read = transport.read(&mut buf) => match read {
                    Ok(0) => self.negotiator.transport_closed(None),
                    Ok(n) => match decoder.decode(&buf[..n]) {
                        Ok(text) => {
                            log::trace!("RECV {}", text);
                            self.negotiator.handle_data(&text, now());
                        }
                        Err(e) => self.negotiator.transport_closed(Some(e.into())),
                    },
                    Err(e) => self.negotiator.transport_closed(Some(e.into())),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send(stanza, reply)) => {
                        let _ = reply.send(self.negotiator.send_stanza(stanza));
                    }
                    Some(Command::Close) | None => self.negotiator.disconnect(),
                },
            }
        }
        if let Some(mut transport) = stream.take() {
            let _ = transport.shutdown().await;
        }
    }

    /// Carry out the negotiator's outputs. Returns true once the stream
    /// ended.
    async fn flush(&mut self, stream: &mut Option<BoxedStream>) -> bool {
        let mut ended = false;
        while let Some(output) = self.negotiator.poll_output() {
            match output {
                Output::Send(text) => {
                    if let Some(transport) = stream.as_mut() {
                        if let Err(e) = transport.write_all(text.as_bytes()).await {
                            self.negotiator.transport_closed(Some(e.into()));
                        }
                    }
                }
                Output::StartTls => {
                    let Some(transport) = stream.take() else {
                        continue;
                    };
                    match self.upgrade(transport).await {
                        Ok(tls) => {
                            *stream = Some(tls);
                            if let Err(e) = self.negotiator.tls_established() {
                                self.negotiator.transport_closed(Some(e));
                            }
                        }
                        Err(e) => self.negotiator.transport_closed(Some(e)),
                    }
                }
                Output::Close => {
                    if let Some(mut transport) = stream.take() {
                        let _ = transport.shutdown().await;
                    }
                }
                Output::Event(event) => {
                    ended |= matches!(event, Event::Disconnected(_));
                    let _ = self.events.send(event);
                }
            }
        }
        if let Some(transport) = stream.as_mut() {
            if transport.flush().await.is_err() {
                return true;
            }
        }
        ended
    }

    #[cfg(feature = "starttls-rust")]
    async fn upgrade(&self, mut stream: BoxedStream) -> Result<BoxedStream, Error> {
        let acceptor = self
            .acceptor
            .clone()
            .ok_or(Error::Protocol(ProtocolError::TlsUnavailable))?;
        stream.flush().await?;
        let tls_stream = acceptor.accept(stream).await?;
        log::debug!("TLS established with client");
        Ok(Box::new(tls_stream))
    }

    #[cfg(not(feature = "starttls-rust"))]
    async fn upgrade(&self, _stream: BoxedStream) -> Result<BoxedStream, Error> {
        Err(ProtocolError::TlsUnavailable.into())
    }
}

/// Listens for client connections on a TCP socket.
#[derive(Debug)]
pub struct ClientListener {
    listener: TcpListener,
    config: ServerConfig,
}

impl ClientListener {
    /// Bind to `addr`, serving `config.domain`.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: ServerConfig) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        log::info!(
            "Serving {} on {}",
            config.domain,
            listener.local_addr()?
        );
        Ok(ClientListener { listener, config })
    }

    /// Address we listen on.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next client and start negotiating with it.
    pub async fn accept(&self) -> Result<(IncomingClient, SocketAddr), Error> {
        let (stream, peer) = self.listener.accept().await?;
        log::debug!("Accepted connection from {}", peer);
        stream.set_nodelay(true)?;
        Ok((IncomingClient::accept(stream, self.config.clone()), peer))
    }
}
