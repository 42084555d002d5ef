//! Packet codec for the matchmaking wire format
//!
//! Every packet starts with a fixed 4-byte header followed by the payload:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 1 | Protocol version (always [`VERSION`]) |
//! | 1 | 1 | Encoding in the top 2 bits, packet type in the low 6 bits |
//! | 2 | 2 | Payload length (`u16`, big-endian, header excluded) |
//! | 4 | N | Payload |
//!
//! A [`Packet`] keeps its encoded bytes, so relaying a packet forwards exactly
//! the bytes that were received.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Protocol version carried in the first header byte
pub const VERSION: u8 = 1;
/// Size of the fixed packet header in bytes
pub const HEADER_SIZE: usize = 4;
/// Largest frame the protocol will ever produce, header included
pub const PACKET_MAX_SIZE: usize = 1024;
/// Payload bound; a payload must be strictly shorter than this
pub const PACKET_PAYLOAD_MAX: usize = PACKET_MAX_SIZE - HEADER_SIZE;
/// Length of the client identifier carried by [`PacketType::ClientAuth`]
pub const CLIENT_ID_SIZE: usize = 16;

const TYPE_MASK: u8 = 0b0011_1111;
const ENCODING_SHIFT: u8 = 6;

/// Errors produced while encoding or decoding packets
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("max size exceeded: payload of {0} bytes")]
    MaxSizeExceeded(usize),

    #[error("length mismatch: header declares {declared} bytes, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("packet type {0} does not fit in 6 bits")]
    TypeOutOfRange(u8),

    #[error("expected {expected} packet, found {found}")]
    UnexpectedType {
        expected: PacketType,
        found: PacketType,
    },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl PacketError {
    /// Whether the error means the peer broke the wire protocol
    ///
    /// Protocol-fatal errors end the connection immediately and are never retried.
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(
            self,
            PacketError::VersionMismatch { .. }
                | PacketError::MaxSizeExceeded(_)
                | PacketError::LengthMismatch { .. }
        )
    }
}

/// Packet kinds understood by the relay
///
/// Types 8..=63 are legal on the wire and carried as [`PacketType::Other`];
/// the relay forwards them without interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Error,
    Message,
    ClientAuth,
    ServerAuthResponse,
    GameSettings,
    Item,
    ItemUpdate,
    CloseConnection,
    Other(u8),
}

impl PacketType {
    /// Decodes the low 6 bits of the type/encoding header byte
    pub fn from_bits(bits: u8) -> Self {
        match bits & TYPE_MASK {
            0 => PacketType::Error,
            1 => PacketType::Message,
            2 => PacketType::ClientAuth,
            3 => PacketType::ServerAuthResponse,
            4 => PacketType::GameSettings,
            5 => PacketType::Item,
            6 => PacketType::ItemUpdate,
            7 => PacketType::CloseConnection,
            other => PacketType::Other(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            PacketType::Error => 0,
            PacketType::Message => 1,
            PacketType::ClientAuth => 2,
            PacketType::ServerAuthResponse => 3,
            PacketType::GameSettings => 4,
            PacketType::Item => 5,
            PacketType::ItemUpdate => 6,
            PacketType::CloseConnection => 7,
            PacketType::Other(bits) => bits,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Other(bits) => write!(f, "Other({})", bits),
            kind => write!(f, "{:?}", kind),
        }
    }
}

/// Payload encoding tag stored in the top 2 bits of the second header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Json,
    String,
    Bytes,
    Reserved,
}

impl Encoding {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Encoding::Json,
            1 => Encoding::String,
            2 => Encoding::Bytes,
            _ => Encoding::Reserved,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Encoding::Json => 0,
            Encoding::String => 1,
            Encoding::Bytes => 2,
            Encoding::Reserved => 3,
        }
    }
}

/// An encoded packet, header and payload in one contiguous buffer
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Vec<u8>,
}

impl Packet {
    /// Encodes a packet from its parts
    ///
    /// Fails with [`PacketError::MaxSizeExceeded`] when the payload is not
    /// strictly shorter than [`PACKET_PAYLOAD_MAX`], and with
    /// [`PacketError::TypeOutOfRange`] when the type does not fit in 6 bits.
    pub fn new(
        packet_type: PacketType,
        encoding: Encoding,
        payload: &[u8],
    ) -> Result<Self, PacketError> {
        if payload.len() >= PACKET_PAYLOAD_MAX {
            return Err(PacketError::MaxSizeExceeded(payload.len()));
        }

        let type_bits = packet_type.bits();
        if type_bits > TYPE_MASK {
            return Err(PacketError::TypeOutOfRange(type_bits));
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.push(VERSION);
        bytes.push((encoding.bits() << ENCODING_SHIFT) | type_bits);
        bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(payload);

        Ok(Self { bytes })
    }

    /// Decodes one complete frame
    ///
    /// The slice must hold exactly one packet: the header's declared length has
    /// to match the bytes that follow it.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::LengthMismatch {
                declared: HEADER_SIZE,
                actual: data.len(),
            });
        }

        if data[0] != VERSION {
            return Err(PacketError::VersionMismatch {
                expected: VERSION,
                found: data[0],
            });
        }

        let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
        if declared >= PACKET_PAYLOAD_MAX {
            return Err(PacketError::MaxSizeExceeded(declared));
        }

        let actual = data.len() - HEADER_SIZE;
        if declared != actual {
            return Err(PacketError::LengthMismatch { declared, actual });
        }

        Ok(Self {
            bytes: data.to_vec(),
        })
    }

    /// Client handshake carrying the 16-byte client identifier
    pub fn client_auth(client_id: &ClientId) -> Self {
        Self::unchecked(PacketType::ClientAuth, Encoding::Bytes, client_id.as_bytes())
    }

    /// Handshake reply: one accept byte followed by the selected server id
    pub fn server_auth_response(accepted: bool, server_id: &str) -> Result<Self, PacketError> {
        let mut payload = Vec::with_capacity(1 + server_id.len());
        payload.push(accepted as u8);
        payload.extend_from_slice(server_id.as_bytes());
        Self::new(PacketType::ServerAuthResponse, Encoding::Bytes, &payload)
    }

    /// Control packet that ends a relayed session
    pub fn close_connection() -> Self {
        Self::unchecked(PacketType::CloseConnection, Encoding::Bytes, &[])
    }

    /// Error report for the client
    ///
    /// Descriptions longer than the payload limit are cut at a character
    /// boundary so building an error packet never fails.
    pub fn error(description: &str) -> Self {
        let mut end = description.len().min(PACKET_PAYLOAD_MAX - 1);
        while !description.is_char_boundary(end) {
            end -= 1;
        }
        Self::unchecked(
            PacketType::Error,
            Encoding::String,
            description[..end].as_bytes(),
        )
    }

    /// Plain text message
    pub fn message(text: &str) -> Result<Self, PacketError> {
        Self::new(PacketType::Message, Encoding::String, text.as_bytes())
    }

    /// Serializes `value` as a JSON payload
    pub fn json<T: Serialize>(packet_type: PacketType, value: &T) -> Result<Self, PacketError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| PacketError::MalformedPayload(e.to_string()))?;
        Self::new(packet_type, Encoding::Json, &payload)
    }

    fn unchecked(packet_type: PacketType, encoding: Encoding, payload: &[u8]) -> Self {
        debug_assert!(payload.len() < PACKET_PAYLOAD_MAX);
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.push(VERSION);
        bytes.push((encoding.bits() << ENCODING_SHIFT) | packet_type.bits());
        bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(payload);
        Self { bytes }
    }

    pub fn version(&self) -> u8 {
        self.bytes[0]
    }

    pub fn packet_type(&self) -> PacketType {
        PacketType::from_bits(self.bytes[1])
    }

    pub fn encoding(&self) -> Encoding {
        Encoding::from_bits(self.bytes[1] >> ENCODING_SHIFT)
    }

    /// Declared payload length
    pub fn len(&self) -> usize {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]]) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// The full encoded frame, header included
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn is_close(&self) -> bool {
        self.packet_type() == PacketType::CloseConnection
    }

    /// Reads an error packet's description
    pub fn error_message(&self) -> Result<String, PacketError> {
        self.expect_type(PacketType::Error)?;
        Ok(String::from_utf8_lossy(self.payload()).into_owned())
    }

    /// Deserializes a JSON-encoded payload
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, PacketError> {
        if self.encoding() != Encoding::Json {
            return Err(PacketError::MalformedPayload(format!(
                "expected JSON encoding, found {:?}",
                self.encoding()
            )));
        }
        serde_json::from_slice(self.payload())
            .map_err(|e| PacketError::MalformedPayload(e.to_string()))
    }

    fn expect_type(&self, expected: PacketType) -> Result<(), PacketError> {
        let found = self.packet_type();
        if found != expected {
            return Err(PacketError::UnexpectedType { expected, found });
        }
        Ok(())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.packet_type())
            .field("encoding", &self.encoding())
            .field("len", &self.len())
            .finish()
    }
}

/// 16-byte identifier a client presents in its [`PacketType::ClientAuth`] packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId([u8; CLIENT_ID_SIZE]);

impl ClientId {
    pub fn new(bytes: [u8; CLIENT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_SIZE] {
        &self.0
    }

    /// Extracts the identifier from a client auth packet
    pub fn from_packet(packet: &Packet) -> Result<Self, PacketError> {
        packet.expect_type(PacketType::ClientAuth)?;
        let bytes: [u8; CLIENT_ID_SIZE] = packet.payload().try_into().map_err(|_| {
            PacketError::MalformedPayload(format!(
                "client id must be {} bytes, found {}",
                CLIENT_ID_SIZE,
                packet.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Parsed [`PacketType::ServerAuthResponse`] payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub accepted: bool,
    pub server_id: String,
}

impl AuthResponse {
    pub fn from_packet(packet: &Packet) -> Result<Self, PacketError> {
        packet.expect_type(PacketType::ServerAuthResponse)?;
        let (accept, id) = packet
            .payload()
            .split_first()
            .ok_or_else(|| PacketError::MalformedPayload("empty auth response".to_string()))?;
        let server_id = String::from_utf8(id.to_vec())
            .map_err(|e| PacketError::MalformedPayload(e.to_string()))?;

        Ok(Self {
            accepted: *accept == 1,
            server_id,
        })
    }
}
