//! # Matchmaking Wire Protocol
//!
//! Shared by the matchmaking proxy, the game servers behind it and the clients
//! in front of it. Every control and relay message is a [`Packet`]: a 4-byte
//! header (version, packed type/encoding byte, big-endian payload length)
//! followed by at most 1019 payload bytes.
//!
//! ## Handshake
//!
//! 1. Client sends [`PacketType::ClientAuth`] with its 16-byte [`ClientId`]
//! 2. Proxy answers [`PacketType::ServerAuthResponse`]: one accept byte and the
//!    id of the game server it selected
//! 3. Everything after that is relayed untouched until either side sends
//!    [`PacketType::CloseConnection`]
//!
//! ## Framing
//!
//! [`PacketFramer`] reassembles packets from a byte stream split at arbitrary
//! points, and [`frame_with_reader`] runs one on a dedicated task.

pub mod framer;
pub mod packet;

pub use framer::{frame_with_reader, FrameResult, PacketFramer, PacketReceiver};
pub use packet::{
    AuthResponse, ClientId, Encoding, Packet, PacketError, PacketType, CLIENT_ID_SIZE,
    HEADER_SIZE, PACKET_MAX_SIZE, PACKET_PAYLOAD_MAX, VERSION,
};

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Writes one encoded packet to a transport
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(packet.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_packet_emits_exact_frame() {
        let packet = Packet::server_auth_response(true, "s1").unwrap();

        let mut writer = tokio_test::io::Builder::new()
            .write(&[VERSION, 0b1000_0011, 0, 3, 1, b's', b'1'])
            .build();

        write_packet(&mut writer, &packet).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_then_frame_over_duplex() {
        let (mut near, far) = tokio::io::duplex(64);
        let mut rx = frame_with_reader(far);

        let sent = vec![
            Packet::client_auth(&ClientId::new([3; CLIENT_ID_SIZE])),
            Packet::message("after auth").unwrap(),
        ];
        for packet in &sent {
            write_packet(&mut near, packet).await.unwrap();
        }
        drop(near);

        let mut received = Vec::new();
        while let Some(item) = rx.recv().await {
            received.push(item.unwrap());
        }
        assert_eq!(received, sent);
    }
}
