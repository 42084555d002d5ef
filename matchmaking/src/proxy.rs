//! Connection proxy: authenticate, matchmake, then relay
//!
//! Every accepted client goes through
//! `AwaitingAuth → Matchmaking → Relaying → Closed`. Nothing is relayed until
//! both sides are established, and a client that fails before that gets at
//! most one error packet.

use crate::cancel::CancelToken;
use crate::coordinator::{Coordinator, CoordinatorError};
use async_trait::async_trait;
use log::{debug, info, warn};
use protocol::{
    frame_with_reader, write_packet, ClientId, Packet, PacketError, PacketReceiver, PacketType,
};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;

pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Duplex byte stream the proxy can own
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// Dials game servers by `host:port`
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, addr: &str) -> io::Result<BoxedTransport>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnectionFactory;

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self, addr: &str) -> io::Result<BoxedTransport> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no auth packet within {0:?}")]
    AuthTimeout(Duration),

    #[error("expected client auth, got {0}")]
    NotAuthenticated(PacketType),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Matchmaking(#[from] CoordinatorError),

    #[error("could not reach game server at {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("proxy is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Bound on the wait for the first client packet
    pub auth_timeout: Duration,
    /// Reject clients whose first packet is not ClientAuth
    pub strict_auth: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            strict_auth: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingAuth,
    Matchmaking,
    Relaying,
    Closed,
}

/// Why a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    ClientClosed,
    ServerClosed,
    ClientDisconnected,
    ServerDisconnected,
    Cancelled,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Termination::ClientClosed => "client sent close",
            Termination::ServerClosed => "server sent close",
            Termination::ClientDisconnected => "client disconnected",
            Termination::ServerDisconnected => "server disconnected",
            Termination::Cancelled => "cancelled",
        };
        f.write_str(reason)
    }
}

/// Outcome of waiting for the first client packet
enum Greeting {
    Client(Option<ClientId>),
    Gone,
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Client,
    Server,
}

/// A client paired with its game server
///
/// Owns both transports and their framers. The cancellation token is shared
/// with whoever started the relay; closing is idempotent and shuts each write
/// side down once, and dropping the receivers stops both reader tasks.
pub struct ProxiedConnection {
    id: u64,
    server_id: String,
    client_w: WriteHalf<BoxedTransport>,
    server_w: WriteHalf<BoxedTransport>,
    client_rx: PacketReceiver,
    server_rx: PacketReceiver,
    cancel: CancelToken,
    state: ConnectionState,
}

impl ProxiedConnection {
    pub fn new(
        id: u64,
        server_id: impl Into<String>,
        client: (PacketReceiver, WriteHalf<BoxedTransport>),
        server: (PacketReceiver, WriteHalf<BoxedTransport>),
        cancel: CancelToken,
    ) -> Self {
        Self {
            id,
            server_id: server_id.into(),
            client_rx: client.0,
            client_w: client.1,
            server_rx: server.0,
            server_w: server.1,
            cancel,
            state: ConnectionState::Relaying,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Writes a packet to the client
    pub async fn send_to_client(&mut self, packet: &Packet) -> io::Result<()> {
        write_packet(&mut self.client_w, packet).await
    }

    /// Forwards packets both ways until one side closes, fails, or the token fires
    pub async fn relay(&mut self) -> Result<Termination, ProxyError> {
        let outcome = self.relay_loop().await;

        if let Err(ProxyError::Packet(e)) = &outcome {
            if e.is_protocol_fatal() {
                let report = Packet::error(&e.to_string());
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = write_packet(&mut self.client_w, &report) => {}
                }
            }
        }

        self.close().await;
        outcome
    }

    async fn relay_loop(&mut self) -> Result<Termination, ProxyError> {
        loop {
            let (side, next) = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Termination::Cancelled),
                next = self.client_rx.recv() => (Side::Client, next),
                next = self.server_rx.recv() => (Side::Server, next),
            };

            let packet = match (side, next) {
                (Side::Client, None) => return Ok(Termination::ClientDisconnected),
                (Side::Server, None) => return Ok(Termination::ServerDisconnected),
                (_, Some(Err(e))) => {
                    warn!("Connection {}: {:?} stream failed: {}", self.id, side, e);
                    return Err(e.into());
                }
                (_, Some(Ok(packet))) => packet,
            };

            let closing = packet.is_close();
            let peer = match side {
                Side::Client => &mut self.server_w,
                Side::Server => &mut self.client_w,
            };
            // A peer that stops reading must not hold the relay past cancellation
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Termination::Cancelled),
                written = write_packet(peer, &packet) => written?,
            }

            if closing {
                return Ok(match side {
                    Side::Client => Termination::ClientClosed,
                    Side::Server => Termination::ServerClosed,
                });
            }
        }
    }

    /// Closes both transports; later calls do nothing
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.cancel.cancel();

        if let Err(e) = self.client_w.shutdown().await {
            debug!("Connection {}: client shutdown: {}", self.id, e);
        }
        if let Err(e) = self.server_w.shutdown().await {
            debug!("Connection {}: server {} shutdown: {}", self.id, self.server_id, e);
        }
        self.client_rx.close();
        self.server_rx.close();
    }
}

/// Decrements the live-connection count when a handler finishes
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs the per-connection state machine for every accepted client
pub struct ConnectionProxy {
    coordinator: Arc<Coordinator>,
    factory: Arc<dyn ConnectionFactory>,
    config: ProxyConfig,
    shutdown: CancelToken,
    active: AtomicUsize,
}

impl ConnectionProxy {
    pub fn new(
        coordinator: Arc<Coordinator>,
        factory: Arc<dyn ConnectionFactory>,
        config: ProxyConfig,
        shutdown: CancelToken,
    ) -> Self {
        Self {
            coordinator,
            factory,
            config,
            shutdown,
            active: AtomicUsize::new(0),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops every connection, now and in the future
    pub fn close(&self) {
        warn!("Proxy closing down");
        self.shutdown.cancel();
    }

    /// Drives one client connection to completion
    pub async fn handle(&self, id: u64, client: BoxedTransport) -> Result<Termination, ProxyError> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let cancel = self.shutdown.child_token();
        let (client_r, mut client_w) = tokio::io::split(client);
        let mut client_rx = frame_with_reader(client_r);

        debug!("Connection {}: {:?}", id, ConnectionState::AwaitingAuth);
        let client_id = match self.authenticate(id, &mut client_rx, &cancel).await {
            Ok(Greeting::Client(client_id)) => client_id,
            Ok(Greeting::Gone) => {
                debug!("Connection {}: closed before auth", id);
                cancel.cancel();
                if let Err(e) = client_w.shutdown().await {
                    debug!("Connection {}: client shutdown: {}", id, e);
                }
                return Ok(Termination::ClientDisconnected);
            }
            Err(e) => return Err(Self::reject(id, &mut client_w, &cancel, e).await),
        };

        debug!("Connection {}: {:?}", id, ConnectionState::Matchmaking);
        let (server_id, server) = match self.connect_server(client_id.as_ref(), &cancel).await {
            Ok(found) => found,
            Err(e) => return Err(Self::reject(id, &mut client_w, &cancel, e).await),
        };

        let (server_r, server_w) = tokio::io::split(server);
        let server_rx = frame_with_reader(server_r);
        let mut connection =
            ProxiedConnection::new(id, &server_id, (client_rx, client_w), (server_rx, server_w), cancel);

        let accepted = match Packet::server_auth_response(true, &server_id) {
            Ok(packet) => connection.send_to_client(&packet).await.map_err(ProxyError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = accepted {
            warn!("Connection {}: could not confirm server {}: {}", id, server_id, e);
            let _ = connection.send_to_client(&Packet::error(&e.to_string())).await;
            connection.close().await;
            return Err(e);
        }

        info!("Connection {}: relaying to server {}", id, server_id);
        let outcome = connection.relay().await;
        match &outcome {
            Ok(reason) => info!("Connection {}: closed ({})", id, reason),
            Err(e) => warn!("Connection {}: closed with error: {}", id, e),
        }
        outcome
    }

    async fn authenticate(
        &self,
        id: u64,
        client_rx: &mut PacketReceiver,
        cancel: &CancelToken,
    ) -> Result<Greeting, ProxyError> {
        let timeout = self.config.auth_timeout;
        let first = tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::ShuttingDown),
            first = tokio::time::timeout(timeout, client_rx.recv()) => {
                first.map_err(|_| ProxyError::AuthTimeout(timeout))?
            }
        };

        let packet = match first {
            None => return Ok(Greeting::Gone),
            Some(result) => result?,
        };

        match packet.packet_type() {
            PacketType::ClientAuth => {
                let client_id = ClientId::from_packet(&packet)?;
                debug!("Connection {}: client {} authenticated", id, client_id);
                Ok(Greeting::Client(Some(client_id)))
            }
            other if self.config.strict_auth => Err(ProxyError::NotAuthenticated(other)),
            other => {
                warn!(
                    "Connection {}: first packet was {}, continuing without a client id",
                    id, other
                );
                Ok(Greeting::Client(None))
            }
        }
    }

    async fn connect_server(
        &self,
        client_id: Option<&ClientId>,
        cancel: &CancelToken,
    ) -> Result<(String, BoxedTransport), ProxyError> {
        let found = self.coordinator.matchmake(client_id, cancel).await?;

        let transport = self
            .factory
            .connect(&found.addr)
            .await
            .map_err(|source| ProxyError::Dial {
                addr: found.addr.clone(),
                source,
            })?;

        Ok((found.server_id, transport))
    }

    /// Reports `error` to a client that never reached the relay, then closes it
    async fn reject(
        id: u64,
        client_w: &mut WriteHalf<BoxedTransport>,
        cancel: &CancelToken,
        error: ProxyError,
    ) -> ProxyError {
        cancel.cancel();

        warn!("Connection {}: rejected: {}", id, error);
        if let Err(e) = write_packet(client_w, &Packet::error(&error.to_string())).await {
            debug!("Connection {}: could not deliver error packet: {}", id, e);
        }

        if let Err(e) = client_w.shutdown().await {
            debug!("Connection {}: client shutdown: {}", id, e);
        }
        error
    }
}
