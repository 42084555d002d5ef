//! Stream reassembly: turns an arbitrary byte stream into packets
//!
//! TCP delivers bytes, not packets. A [`PacketFramer`] buffers whatever has
//! arrived and hands back complete packets in arrival order. [`frame_with_reader`]
//! wraps that in a task that owns the read half of a transport and publishes
//! decoded packets on a bounded channel, so a slow consumer throttles the reader
//! instead of growing a buffer.

use crate::packet::{Packet, PacketError, HEADER_SIZE, PACKET_MAX_SIZE, PACKET_PAYLOAD_MAX, VERSION};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Capacity of the channel between a reader task and its consumer
pub const FRAMER_CHANNEL_CAPACITY: usize = 10;

/// Items published by a framing task: a packet, or the error that stopped it
pub type FrameResult = Result<Packet, PacketError>;

/// Receiving end of a framing task
pub type PacketReceiver = mpsc::Receiver<FrameResult>;

/// Incremental packet decoder for one direction of one connection
///
/// The buffer holds the unconsumed tail of the stream; its length is the write
/// cursor. Consumed frames are compacted away after every successful pull.
#[derive(Debug, Default)]
pub struct PacketFramer {
    buffer: Vec<u8>,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(PACKET_MAX_SIZE),
        }
    }

    /// Appends freshly received bytes, growing the buffer if needed
    ///
    /// Call [`PacketFramer::pull`] until it returns `Ok(None)` to drain every
    /// packet the new bytes completed.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extracts the next complete packet, if one is buffered
    ///
    /// `Ok(None)` means more bytes are needed. Errors are fatal for the
    /// connection: the stream cannot be resynchronised after a bad header.
    pub fn pull(&mut self) -> Result<Option<Packet>, PacketError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        if self.buffer[0] != VERSION {
            return Err(PacketError::VersionMismatch {
                expected: VERSION,
                found: self.buffer[0],
            });
        }

        let declared = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if declared >= PACKET_PAYLOAD_MAX {
            return Err(PacketError::MaxSizeExceeded(declared));
        }

        let total = HEADER_SIZE + declared;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let packet = Packet::decode(&self.buffer[..total])?;
        self.buffer.drain(..total);

        Ok(Some(packet))
    }

    /// Number of buffered bytes not yet returned as packets
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Spawns a task that frames everything read from `reader`
///
/// The returned channel yields packets in stream order. It closes after end of
/// stream, after the first error (which is delivered first), or once the
/// receiver is dropped; dropping the receiver also drops `reader`.
pub fn frame_with_reader<R>(reader: R) -> PacketReceiver
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(FRAMER_CHANNEL_CAPACITY);
    tokio::spawn(feed(PacketFramer::new(), reader, tx));
    rx
}

/// Reads from `reader` into `framer` until the stream ends or fails
pub async fn feed<R>(mut framer: PacketFramer, mut reader: R, tx: mpsc::Sender<FrameResult>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; PACKET_MAX_SIZE];

    loop {
        let read = tokio::select! {
            read = reader.read(&mut chunk) => read,
            _ = tx.closed() => {
                debug!("Framer consumer dropped, stopping reader");
                return;
            }
        };

        let n = match read {
            Ok(0) => {
                debug!("Framer reached end of stream ({} bytes left over)", framer.buffered());
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Framer read failed: {}", e);
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        framer.push(&chunk[..n]);

        loop {
            match framer.pull() {
                Ok(Some(packet)) => {
                    if tx.send(Ok(packet)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Framer stopped: {}", e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Encoding, PacketType};

    fn sample_packets() -> Vec<Packet> {
        vec![
            Packet::message("first").unwrap(),
            Packet::new(PacketType::Item, Encoding::Bytes, &[7u8; 600]).unwrap(),
            Packet::close_connection(),
            Packet::new(PacketType::ItemUpdate, Encoding::Json, b"{\"hp\":3}").unwrap(),
        ]
    }

    fn concat(packets: &[Packet]) -> Vec<u8> {
        packets.iter().flat_map(|p| p.as_bytes().to_vec()).collect()
    }

    fn drain(framer: &mut PacketFramer, out: &mut Vec<Packet>) {
        while let Some(packet) = framer.pull().unwrap() {
            out.push(packet);
        }
    }

    #[test]
    fn test_needs_full_header() {
        let mut framer = PacketFramer::new();
        framer.push(&[VERSION, 1, 0]);
        assert!(framer.pull().unwrap().is_none());
        assert_eq!(framer.buffered(), 3);
    }

    #[test]
    fn test_reassembly_one_byte_at_a_time() {
        let packets = sample_packets();
        let stream = concat(&packets);

        let mut framer = PacketFramer::new();
        let mut decoded = Vec::new();
        for byte in &stream {
            framer.push(std::slice::from_ref(byte));
            drain(&mut framer, &mut decoded);
        }

        assert_eq!(decoded, packets);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_reassembly_uneven_splits() {
        let packets = sample_packets();
        let stream = concat(&packets);

        for split in [1usize, 3, 5, 17, 511, 1024, stream.len()] {
            let mut framer = PacketFramer::new();
            let mut decoded = Vec::new();
            for piece in stream.chunks(split) {
                framer.push(piece);
                drain(&mut framer, &mut decoded);
            }
            assert_eq!(decoded, packets, "split size {}", split);
        }
    }

    #[test]
    fn test_version_mismatch_is_reported() {
        let mut bytes = Packet::message("hi").unwrap().into_bytes();
        bytes[0] = 0x7f;

        let mut framer = PacketFramer::new();
        framer.push(&bytes);
        assert!(matches!(
            framer.pull(),
            Err(PacketError::VersionMismatch { found: 0x7f, .. })
        ));
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let declared = (PACKET_PAYLOAD_MAX as u16).to_be_bytes();
        let mut framer = PacketFramer::new();
        framer.push(&[VERSION, 1, declared[0], declared[1]]);

        assert!(matches!(
            framer.pull(),
            Err(PacketError::MaxSizeExceeded(1020))
        ));
    }

    #[tokio::test]
    async fn test_feed_from_mock_reader() {
        let packets = sample_packets();
        let stream = concat(&packets);
        let (head, tail) = stream.split_at(7);

        let reader = tokio_test::io::Builder::new()
            .read(head)
            .read(tail)
            .build();

        let mut rx = frame_with_reader(reader);
        let mut decoded = Vec::new();
        while let Some(item) = rx.recv().await {
            decoded.push(item.unwrap());
        }

        assert_eq!(decoded, packets);
    }

    #[tokio::test]
    async fn test_feed_delivers_error_then_closes() {
        let good = Packet::message("ok").unwrap();
        let mut bad = Packet::message("bad").unwrap().into_bytes();
        bad[0] = 9;

        let reader = tokio_test::io::Builder::new()
            .read(good.as_bytes())
            .read(&bad)
            .build();

        let mut rx = frame_with_reader(reader);

        assert_eq!(rx.recv().await.unwrap().unwrap(), good);
        assert!(matches!(
            rx.recv().await,
            Some(Err(PacketError::VersionMismatch { found: 9, .. }))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_feed_reports_read_errors() {
        let reader = tokio_test::io::Builder::new()
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))
            .build();

        let mut rx = frame_with_reader(reader);
        assert!(matches!(rx.recv().await, Some(Err(PacketError::Io(_)))));
        assert!(rx.recv().await.is_none());
    }
}
