// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::Instant;

use futures::{ready, Stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::connect::{BoxedStream, ServerConnector};
use crate::error::Error;
use crate::event::{Event, Output};
use crate::framer::Utf8Decoder;
use crate::jid::Jid;
use crate::minidom::Element;
use crate::reconnect::{ReconnectPolicy, ReconnectionSupervisor};

#[cfg(all(feature = "starttls-rust", feature = "dns"))]
use crate::connect::{DnsConfig, StartTlsServerConnector};

pub(crate) mod bind;
mod negotiator;

pub use negotiator::{ClientNegotiator, ClientState};

/// XMPP client connection and state
///
/// This implements the `futures` crate's [`Stream`](#impl-Stream) to receive
/// stream state changes as well as stanzas received via the stream.
///
/// The connection lives in a task spawned on the current tokio runtime. It
/// reconnects on its own after unexpected disconnects, announcing it with
/// [`Event::Reconnecting`] and [`Event::ReconnectingNow`], and resumes the
/// previous session when the server allows it.
///
/// To send stanzas, the [`send_stanza`][`Client::send_stanza`] method can be
/// used.
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    bound_jid: Option<Jid>,
    task: Option<JoinHandle<()>>,
}

enum Command {
    Send(Element, oneshot::Sender<Result<(), Error>>),
    Disconnect,
}

impl Client {
    /// Start a new XMPP client using StartTLS transport and autoreconnect
    ///
    /// Start polling the returned instance so that it will connect
    /// and yield events.
    #[cfg(all(feature = "starttls-rust", feature = "dns"))]
    pub fn new<J: Into<Jid>, P: Into<String>>(jid: J, password: P) -> Self {
        let config = ClientConfig::new(jid.into(), password);
        let dns_config = DnsConfig::srv_default_client(config.domain());
        Self::new_with_connector(
            config,
            StartTlsServerConnector::from(dns_config),
            ReconnectPolicy::default(),
        )
    }

    /// Start a client with a custom connector and reconnection policy.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new_with_connector<C: ServerConnector>(
        config: ClientConfig,
        connector: C,
        policy: ReconnectPolicy,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let worker = Worker {
            negotiator: ClientNegotiator::new(config, connector.tls_available()),
            connector,
            supervisor: ReconnectionSupervisor::new(policy),
            commands: command_rx,
            events: event_tx,
            closing: false,
        };
        Client {
            commands,
            events,
            bound_jid: None,
            task: Some(tokio::spawn(worker.run())),
        }
    }

    /// Get the client's bound JID (the one reported by the XMPP
    /// server).
    pub fn bound_jid(&self) -> Option<&Jid> {
        self.bound_jid.as_ref()
    }

    /// Send a stanza.
    ///
    /// Returns once the stanza has been handed to the stream, which only
    /// accepts stanzas when it is fully negotiated. With stream management
    /// the stanza is kept until the server acknowledges it, and retransmitted
    /// if the session gets resumed.
    pub async fn send_stanza(&mut self, stanza: Element) -> Result<(), Error> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Send(stanza, reply))
            .map_err(|_| Error::Disconnected)?;
        result.await.map_err(|_| Error::Disconnected)?
    }

    /// Close the client cleanly.
    ///
    /// This sends the stream footer, cancels any pending reconnection and
    /// waits for the connection task to finish.
    pub async fn send_end(mut self) -> Result<(), Error> {
        let _ = self.commands.send(Command::Disconnect);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Client task failed: {}", e);
                return Err(Error::Disconnected);
            }
        }
        Ok(())
    }
}

impl Stream for Client {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let event = ready!(self.events.poll_recv(cx));
        match &event {
            Some(Event::Connected { jid, .. }) => self.bound_jid = Some(jid.clone()),
            Some(Event::Disconnected(_)) => self.bound_jid = None,
            _ => (),
        }
        Poll::Ready(event)
    }
}

/// Current time on the runtime's clock, which follows paused time in tests.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// What to do once a connection ended.
enum Flow {
    Reconnect,
    Stop,
}

struct Worker<C: ServerConnector> {
    connector: C,
    negotiator: ClientNegotiator,
    supervisor: ReconnectionSupervisor,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    /// The application asked to close, or went away.
    closing: bool,
}

impl<C: ServerConnector> Worker<C> {
    async fn run(mut self) {
        loop {
            let flow = match self.connect().await {
                Some(Ok(stream)) => self.drive(stream).await,
                Some(Err(e)) => {
                    log::warn!("Connection to {} failed: {}", self.negotiator.config().domain(), e);
                    self.connection_lost(e)
                }
                None => {
                    self.emit(Event::Disconnected(Error::Disconnected));
                    Flow::Stop
                }
            };
            match flow {
                Flow::Stop => break,
                Flow::Reconnect => {
                    if !self.wait_for_retry().await {
                        break;
                    }
                    self.emit(Event::ReconnectingNow);
                }
            }
        }
        log::debug!("Client task finished");
    }

    /// Open a transport, unless the application gives up first.
    async fn connect(&mut self) -> Option<Result<BoxedStream, Error>> {
        let connector = self.connector.clone();
        let jid = self.negotiator.config().jid.clone();
        let connecting = connector.connect(&jid);
        tokio::pin!(connecting);
        loop {
            tokio::select! {
                result = &mut connecting => return Some(result),
                command = self.commands.recv() => match command {
                    Some(Command::Send(_, reply)) => {
                        let _ = reply.send(Err(Error::InvalidState));
                    }
                    Some(Command::Disconnect) | None => {
                        self.closing = true;
                        return None;
                    }
                },
            }
        }
    }

    /// Sleep until the supervisor's deadline. Returns false when the
    /// application disconnected in the meantime.
    async fn wait_for_retry(&mut self) -> bool {
        while let Some(deadline) = self.supervisor.poll_timeout() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline.into()) => {
                    if self.supervisor.handle_timeout(now()) {
                        return true;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Send(_, reply)) => {
                        let _ = reply.send(Err(Error::InvalidState));
                    }
                    Some(Command::Disconnect) | None => {
                        self.supervisor.cancel();
                        self.closing = true;
                        return false;
                    }
                },
            }
        }
        false
    }

    async fn drive(&mut self, stream: BoxedStream) -> Flow {
        let mut stream = Some(stream);
        let mut decoder = Utf8Decoder::default();
        let mut buf = vec![0u8; 4096];
        self.negotiator.connected(now());
        loop {
            if let Some(flow) = self.flush(&mut stream).await {
                return flow;
            }
            let Some(transport) = stream.as_mut() else {
                return Flow::Stop;
            };
            let timeout = self.negotiator.poll_timeout();
            let sleep = async move {
                match timeout {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => core::future::pending::<()>().await,
                }
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
                    Some(Command::Disconnect) | None => {
                        self.closing = true;
                        self.negotiator.disconnect();
                    }
                },
                _ = sleep => self.negotiator.handle_timeout(now()),
            }
        }
    }

    /// Carry out everything the negotiator asked for. Returns what to do
    /// next once the connection ended.
    async fn flush(&mut self, stream: &mut Option<BoxedStream>) -> Option<Flow> {
        let mut ended = None;
        loop {
            while let Some(output) = self.negotiator.poll_output() {
                if let Some(flow) = self.carry_out(output, stream).await {
                    ended = Some(flow);
                }
            }
            let Some(transport) = stream.as_mut() else {
                break;
            };
            match transport.flush().await {
                Ok(()) => break,
                // The transport is gone. The disconnect event this queues is
                // handled on the next round, which then stops.
                Err(e) => {
                    stream.take();
                    self.negotiator.transport_closed(Some(e.into()));
                }
            }
        }
        if ended.is_some() {
            if let Some(mut transport) = stream.take() {
                let _ = transport.shutdown().await;
            }
        }
        ended
    }

    async fn carry_out(
        &mut self,
        output: Output,
        stream: &mut Option<BoxedStream>,
    ) -> Option<Flow> {
        match output {
            Output::Send(text) => {
                if let Some(transport) = stream.as_mut() {
                    if let Err(e) = transport.write_all(text.as_bytes()).await {
                        self.negotiator.transport_closed(Some(e.into()));
                    }
                }
            }
            Output::StartTls => {
                let mut transport = stream.take()?;
                if let Err(e) = transport.flush().await {
                    self.negotiator.transport_closed(Some(e.into()));
                    return None;
                }
                let domain = self.negotiator.config().domain().to_owned();
                match self.connector.starttls(transport, &domain).await {
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
            Output::Event(event) => return self.dispatch(event),
        }
        None
    }

    fn dispatch(&mut self, event: Event) -> Option<Flow> {
        match event {
            Event::Connected { .. } => {
                self.supervisor.connected();
                self.emit(event);
                None
            }
            Event::Disconnected(error) if self.closing => {
                self.emit(Event::Disconnected(error));
                Some(Flow::Stop)
            }
            Event::Disconnected(error) => Some(self.connection_lost(error)),
            event => {
                self.emit(event);
                None
            }
        }
    }

    fn connection_lost(&mut self, error: Error) -> Flow {
        if self.closing {
            self.emit(Event::Disconnected(error));
            return Flow::Stop;
        }
        let delay = self.supervisor.connection_lost(&error, now());
        self.emit(Event::Disconnected(error));
        match delay {
            Some(delay) => {
                self.emit(Event::Reconnecting { delay });
                Flow::Reconnect
            }
            None => Flow::Stop,
        }
    }

    fn emit(&mut self, event: Event) {
        if self.events.send(event).is_err() && !self.closing {
            log::debug!("Client dropped, closing the stream");
            self.closing = true;
            self.supervisor.cancel();
            self.negotiator.disconnect();
        }
    }
}
