//! Per-connection lifecycle.
//!
//! A connection moves through `Connecting → Active → Closing → Closed`. The
//! read loop runs on the connection's own task; a writer task drains the
//! client's outbound queue so that no relay operation ever waits on a
//! socket.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use murmur_core::{ClientId, OutboundReceiver, Relay, RelayError, SendHandle};
use murmur_protocol::{codec, Command, ErrorCode, Event, ProtocolError};
use murmur_transport::{Connection, FrameReader, FrameWriter, TransportError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Settings a [`ConnectionHandler`] needs.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Outbound queue capacity.
    pub outbound_queue: usize,
    /// Whether the first command must be `username`.
    pub require_username: bool,
    /// Time allowed to register.
    pub handshake_timeout: Option<Duration>,
    /// Time allowed per outbound write.
    pub write_timeout: Duration,
    /// Close after this long without an inbound frame.
    pub idle_timeout: Option<Duration>,
}

impl HandlerConfig {
    /// Handler settings from the server configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            outbound_queue: config.limits.outbound_queue,
            require_username: config.relay.require_username,
            handshake_timeout: config.timeouts.handshake(),
            write_timeout: config.timeouts.write(),
            idle_timeout: config.timeouts.idle(),
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepted, waiting for registration.
    Connecting,
    /// Registered; frames are routed.
    Active,
    /// Leaving the registry and flushing output.
    Closing,
    /// Done.
    Closed,
}

/// Unregisters the client when dropped, on every exit path.
struct Registration {
    relay: Arc<Relay>,
    id: ClientId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.relay.disconnect(self.id) {
            metrics::set_registered_clients(self.relay.registry().len());
        } else {
            // Already evicted by the broadcaster, which announced it.
            debug!(client = %self.id, "Client was already unregistered");
        }
    }
}

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    ReadFailed,
    HandshakeTimeout,
    IdleTimeout,
    WriterFinished,
    Evicted,
}

/// Drives one connection from accept to close.
pub struct ConnectionHandler {
    relay: Arc<Relay>,
    config: HandlerConfig,
    peer: String,
    transport: &'static str,
    phase: Phase,
}

impl ConnectionHandler {
    /// Create a handler for an accepted connection.
    #[must_use]
    pub fn new(relay: Arc<Relay>, config: HandlerConfig, connection: &dyn Connection) -> Self {
        Self {
            relay,
            config,
            peer: connection
                .remote_addr()
                .unwrap_or_else(|| "unknown".to_string()),
            transport: connection.transport(),
            phase: Phase::Connecting,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn transition(&mut self, next: Phase) {
        trace!(peer = %self.peer, from = ?self.phase, to = ?next, "Connection phase");
        self.phase = next;
    }

    /// Run the connection to completion.
    pub async fn run(mut self, connection: Box<dyn Connection>) {
        let _metrics_guard = ConnectionMetricsGuard::new();
        debug!(peer = %self.peer, transport = self.transport, "Connection accepted");

        let (mut reader, writer) = connection.split();
        let (handle, rx) = SendHandle::channel(self.config.outbound_queue);
        let mut writer_task = tokio::spawn(write_loop(
            writer,
            rx,
            self.config.write_timeout,
            self.peer.clone(),
        ));

        let mut registration = None;
        let reason = self
            .read_loop(reader.as_mut(), handle, &mut writer_task, &mut registration)
            .await;

        self.transition(Phase::Closing);
        match reason {
            CloseReason::PeerClosed => debug!(peer = %self.peer, "Peer closed connection"),
            CloseReason::WriterFinished => debug!(peer = %self.peer, "Writer finished"),
            CloseReason::Evicted => info!(peer = %self.peer, "Closing evicted client"),
            CloseReason::HandshakeTimeout => {
                info!(peer = %self.peer, "Handshake timed out");
                metrics::record_error("handshake_timeout");
            }
            CloseReason::IdleTimeout => {
                info!(peer = %self.peer, "Idle timeout");
                metrics::record_error("idle_timeout");
            }
            CloseReason::ReadFailed => metrics::record_error("read"),
        }

        // Leaving the registry drops the last sender, so the writer drains
        // what is queued and stops.
        drop(registration);
        if !matches!(reason, CloseReason::WriterFinished | CloseReason::Evicted)
            && tokio::time::timeout(self.config.write_timeout, &mut writer_task)
                .await
                .is_err()
        {
            debug!(peer = %self.peer, "Writer did not finish in time, aborting");
            writer_task.abort();
        }

        self.transition(Phase::Closed);
        debug!(peer = %self.peer, "Connection closed");
    }

    /// Read and route frames until the connection should close.
    ///
    /// `handle` is only kept until registration; afterwards the registry
    /// holds the sole sender, so an eviction ends the writer.
    async fn read_loop(
        &mut self,
        reader: &mut dyn FrameReader,
        handle: SendHandle,
        writer_task: &mut JoinHandle<()>,
        registration: &mut Option<Registration>,
    ) -> CloseReason {
        let mut handle = Some(handle);
        let handshake_deadline = self
            .config
            .handshake_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            let deadline = match registration {
                None => handshake_deadline,
                Some(_) => self
                    .config
                    .idle_timeout
                    .map(|timeout| tokio::time::Instant::now() + timeout),
            };

            let read = tokio::select! {
                biased;
                _ = &mut *writer_task => {
                    let evicted = registration
                        .as_ref()
                        .is_some_and(|reg| !self.relay.registry().contains(reg.id));
                    return if evicted { CloseReason::Evicted } else { CloseReason::WriterFinished };
                }
                read = read_until(reader, deadline) => read,
            };

            let frame = match read {
                Ok(Some(frame)) => frame,
                Ok(None) | Err(TransportError::ConnectionClosed) => return CloseReason::PeerClosed,
                Err(TransportError::Timeout) if registration.is_none() => {
                    return CloseReason::HandshakeTimeout;
                }
                Err(TransportError::Timeout) => return CloseReason::IdleTimeout,
                Err(TransportError::Protocol(error)) => {
                    warn!(peer = %self.peer, error = %error, "Rejected inbound frame");
                    self.refuse(handle.as_ref(), registration.as_ref(), &error);
                    continue;
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Read failed");
                    return CloseReason::ReadFailed;
                }
            };

            let command = match codec::decode(&frame) {
                Ok(command) => command,
                Err(error) => {
                    debug!(peer = %self.peer, error = %error, "Undecodable frame");
                    metrics::record_frame(frame.len(), "inbound", "invalid");
                    self.refuse(handle.as_ref(), registration.as_ref(), &error);
                    continue;
                }
            };
            metrics::record_frame(frame.len(), "inbound", command.kind());

            if let Some(reg) = registration.as_ref() {
                self.submit(reg.id, command);
                continue;
            }

            let Some(local) = handle.as_ref() else {
                return CloseReason::WriterFinished;
            };
            if let Some(id) = self.handshake(local, command) {
                *registration = Some(Registration {
                    relay: self.relay.clone(),
                    id,
                });
                handle = None;
                self.transition(Phase::Active);
            }
        }
    }

    /// Handle one command from an unregistered client. Returns the new id if
    /// the command registered it.
    fn handshake(&self, handle: &SendHandle, command: Command) -> Option<ClientId> {
        match command {
            Command::Username { username } => match self.register(handle, Some(username.as_str())) {
                Ok(id) => Some(id),
                Err(RelayError::InvalidName(reason)) => {
                    reply(handle, Event::error(ErrorCode::InvalidName, reason));
                    None
                }
            },
            Command::Ping { timestamp } => {
                reply(handle, Event::Pong { timestamp });
                None
            }
            Command::Help {} => {
                reply(handle, Event::help());
                None
            }
            other if !self.config.require_username => {
                let id = self.register(handle, None).ok()?;
                self.submit(id, other);
                Some(id)
            }
            other => {
                debug!(peer = %self.peer, command = other.kind(), "Command before registration");
                reply(
                    handle,
                    Event::error(
                        ErrorCode::NotRegistered,
                        "send a username command before anything else",
                    ),
                );
                None
            }
        }
    }

    fn register(&self, handle: &SendHandle, name: Option<&str>) -> Result<ClientId, RelayError> {
        let id = self.relay.connect(handle.clone(), name)?;
        metrics::set_registered_clients(self.relay.registry().len());
        info!(
            client = %id,
            peer = %self.peer,
            transport = self.transport,
            "Client registered"
        );
        Ok(id)
    }

    fn submit(&self, id: ClientId, command: Command) {
        let start = Instant::now();
        let report = self.relay.submit(id, command);
        metrics::record_dispatch(start.elapsed().as_secs_f64());
        metrics::record_delivery(&report);
        if !report.evicted.is_empty() {
            metrics::set_registered_clients(self.relay.registry().len());
        }
    }

    fn refuse(
        &self,
        handle: Option<&SendHandle>,
        registration: Option<&Registration>,
        error: &ProtocolError,
    ) {
        match (registration, handle) {
            (Some(reg), _) => {
                let report = self.relay.reject(reg.id, error);
                metrics::record_delivery(&report);
            }
            (None, Some(handle)) => reply(handle, Event::error(error.code(), error.to_string())),
            (None, None) => {}
        }
    }
}

/// Reply to a client that is not in the registry yet.
fn reply(handle: &SendHandle, event: Event) {
    if handle.try_deliver(Arc::new(event)).is_err() {
        debug!("Dropping reply to unregistered client");
    }
}

async fn read_until(
    reader: &mut dyn FrameReader,
    deadline: Option<tokio::time::Instant>,
) -> Result<Option<bytes::Bytes>, TransportError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, reader.read_frame())
            .await
            .map_err(|_| TransportError::Timeout)?,
        None => reader.read_frame().await,
    }
}

/// Drain the outbound queue onto the connection.
async fn write_loop(
    mut writer: Box<dyn FrameWriter>,
    mut rx: OutboundReceiver,
    write_timeout: Duration,
    peer: String,
) {
    while let Some(event) = rx.recv().await {
        let data = match codec::encode(&*event) {
            Ok(data) => data,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to encode event");
                continue;
            }
        };
        let len = data.len();

        match tokio::time::timeout(write_timeout, writer.write_frame(data)).await {
            Ok(Ok(())) => metrics::record_frame(len, "outbound", event.kind()),
            Ok(Err(TransportError::ConnectionClosed)) => {
                debug!(peer = %peer, "Connection closed while writing");
                return;
            }
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "Write failed");
                metrics::record_error("write");
                return;
            }
            Err(_) => {
                warn!(peer = %peer, timeout = ?write_timeout, "Write timed out");
                metrics::record_error("write_timeout");
                return;
            }
        }
    }

    if let Err(e) = writer.close().await {
        trace!(peer = %peer, error = %e, "Close after drain failed");
    }
}
