use log::{debug, info, warn};
use protocol::{
    frame_with_reader, write_packet, AuthResponse, ClientId, Packet, PacketError,
    PacketReceiver, PacketType, CLIENT_ID_SIZE,
};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("matchmaking refused the connection: {0}")]
    Rejected(String),

    #[error("unexpected {0} packet")]
    UnexpectedPacket(PacketType),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("client is {0}, not connected")]
    NotConnected(ClientState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Initialized => "initialized",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Scripted client that goes through matchmaking and talks to its game server
pub struct DummyClient {
    id: ClientId,
    matchmaking_addr: String,
    state: ClientState,
    server_id: Option<String>,
    writer: Option<BoxedWriter>,
    packets: Option<PacketReceiver>,
}

impl DummyClient {
    /// Client with a random id
    pub fn new(matchmaking_addr: &str) -> Self {
        Self::with_id(matchmaking_addr, ClientId::new(rand::random::<[u8; CLIENT_ID_SIZE]>()))
    }

    pub fn with_id(matchmaking_addr: &str, id: ClientId) -> Self {
        Self {
            id,
            matchmaking_addr: matchmaking_addr.to_string(),
            state: ClientState::Initialized,
            server_id: None,
            writer: None,
            packets: None,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Game server picked by matchmaking, once connected
    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    /// Dials matchmaking and authenticates
    pub async fn connect(&mut self) -> Result<AuthResponse, ClientError> {
        self.state = ClientState::Connecting;
        info!("Client {} connecting to {}", self.id, self.matchmaking_addr);

        let stream = match TcpStream::connect(&self.matchmaking_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.state = ClientState::Disconnected;
                return Err(e.into());
            }
        };
        stream.set_nodelay(true)?;

        self.handshake(stream).await
    }

    /// Authenticates over an already open transport
    pub async fn handshake<T>(&mut self, transport: T) -> Result<AuthResponse, ClientError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.state = ClientState::Connecting;

        let (reader, writer) = tokio::io::split(transport);
        self.writer = Some(Box::new(writer));
        self.packets = Some(frame_with_reader(reader));

        match self.authenticate().await {
            Ok(response) => {
                info!("Client {} connected to server {}", self.id, response.server_id);
                self.server_id = Some(response.server_id.clone());
                self.state = ClientState::Connected;
                Ok(response)
            }
            Err(e) => {
                warn!("Client {} handshake failed: {}", self.id, e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn authenticate(&mut self) -> Result<AuthResponse, ClientError> {
        let auth = Packet::client_auth(&self.id);
        self.write(&auth).await?;

        let packet = self.next_packet().await?.ok_or(ClientError::ConnectionClosed)?;
        match packet.packet_type() {
            PacketType::ServerAuthResponse => {
                let response = AuthResponse::from_packet(&packet)?;
                if !response.accepted {
                    return Err(ClientError::Rejected(response.server_id));
                }
                Ok(response)
            }
            PacketType::Error => Err(ClientError::Rejected(packet.error_message()?)),
            other => Err(ClientError::UnexpectedPacket(other)),
        }
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        if self.state != ClientState::Connected {
            return Err(ClientError::NotConnected(self.state));
        }
        self.write(packet).await
    }

    pub async fn send_message(&mut self, text: &str) -> Result<(), ClientError> {
        let packet = Packet::message(text)?;
        self.send(&packet).await
    }

    /// Next packet from the game server, `None` once the relay is gone
    ///
    /// A CloseConnection from the server is returned to the caller and leaves
    /// the client Disconnected.
    pub async fn recv(&mut self) -> Result<Option<Packet>, ClientError> {
        if self.state != ClientState::Connected {
            return Err(ClientError::NotConnected(self.state));
        }

        match self.next_packet().await {
            Ok(Some(packet)) => {
                if packet.is_close() {
                    debug!("Client {}: server closed the connection", self.id);
                    self.teardown().await;
                }
                Ok(Some(packet))
            }
            Ok(None) => {
                self.teardown().await;
                Ok(None)
            }
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Sends CloseConnection and closes the transport
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        if self.state == ClientState::Disconnected {
            return Ok(());
        }

        let result = match self.state {
            ClientState::Connected => self.write(&Packet::close_connection()).await,
            _ => Ok(()),
        };
        self.teardown().await;
        info!("Client {} disconnected", self.id);
        result
    }

    async fn write(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or(ClientError::NotConnected(self.state))?;
        write_packet(writer, packet).await?;
        Ok(())
    }

    async fn next_packet(&mut self) -> Result<Option<Packet>, ClientError> {
        let packets = self
            .packets
            .as_mut()
            .ok_or(ClientError::NotConnected(self.state))?;
        match packets.recv().await {
            Some(result) => Ok(Some(result?)),
            None => Ok(None),
        }
    }

    async fn teardown(&mut self) {
        self.state = ClientState::Disconnected;
        self.packets = None;
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}
