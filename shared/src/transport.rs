//! Frame-level reads and writes over any tokio byte stream

use crate::codec::{self, CodecError, FrameDecoder, RawPacket};
use crate::crypto::SessionKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Buffers a read half and hands out decoded frames
///
/// Bytes belonging to frames after the one returned stay buffered, so a client
/// that pipelines its login right behind the handshake loses nothing.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Box<[u8; READ_CHUNK]>,
    total_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            chunk: Box::new([0u8; READ_CHUNK]),
            total_read: 0,
        }
    }

    /// Waits for exactly one frame; any per-frame decode error is returned
    pub async fn read_frame(
        &mut self,
        key: Option<&SessionKey>,
    ) -> Result<RawPacket, TransportError> {
        loop {
            if let Some(result) = self.decoder.next_frame(key) {
                return Ok(result?);
            }
            self.fill().await?;
        }
    }

    /// Performs one read and returns every frame that became complete
    ///
    /// Per-frame errors are handed back for the caller to log and skip; a fatal
    /// codec error ends the stream and is returned as `Err`. The returned
    /// vector may be empty when the read only delivered part of a frame.
    pub async fn read_batch(
        &mut self,
        key: Option<&SessionKey>,
    ) -> Result<Vec<Result<RawPacket, CodecError>>, TransportError> {
        self.fill().await?;

        let mut frames = self.decoder.drain(key);
        if matches!(frames.last(), Some(Err(e)) if e.is_fatal()) {
            if let Some(Err(fatal)) = frames.pop() {
                return Err(fatal.into());
            }
        }
        Ok(frames)
    }

    /// Bytes read past the last returned frame
    pub fn buffered(&self) -> usize {
        self.decoder.buffered()
    }

    /// Bytes pulled off the stream since this reader was created
    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    async fn fill(&mut self) -> Result<usize, TransportError> {
        let read = self.inner.read(&mut self.chunk[..]).await?;
        if read == 0 {
            return Err(TransportError::Closed);
        }
        self.decoder.extend(&self.chunk[..read]);
        self.total_read += read as u64;
        Ok(read)
    }
}

/// Encodes one frame and writes it out, returning the number of bytes sent
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet_type: u8,
    payload: &[u8],
    key: Option<&SessionKey>,
) -> Result<usize, TransportError> {
    let frame = codec::encode(packet_type, payload, key)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame_across_writes() {
        let key = SessionKey::generate();
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        let frame = codec::encode(3, &[9u8; 200], Some(&key)).unwrap();
        let writer = tokio::spawn(async move {
            for chunk in frame.chunks(7) {
                client.write_all(chunk).await.unwrap();
            }
            client
        });

        let packet = reader.read_frame(Some(&key)).await.unwrap();
        assert_eq!(packet.packet_type, 3);
        assert_eq!(packet.payload, vec![9u8; 200]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_frames_are_kept() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);

        let mut bytes = codec::encode(2, b"first", None).unwrap();
        bytes.extend(codec::encode(1, b"second", None).unwrap());
        client.write_all(&bytes).await.unwrap();

        assert_eq!(reader.read_frame(None).await.unwrap().payload, b"first");
        assert!(reader.buffered() > 0);
        assert_eq!(reader.read_frame(None).await.unwrap().payload, b"second");
        assert_eq!(reader.total_read(), bytes.len() as u64);
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let key = SessionKey::generate();
        let first = codec::encode(3, b"north", Some(&key)).unwrap();
        let second = codec::encode(0, &[], Some(&key)).unwrap();
        let (head, tail) = first.split_at(3);

        let mock = tokio_test::io::Builder::new()
            .read(head)
            .read(tail)
            .read(&second)
            .build();
        let mut reader = FrameReader::new(mock);

        let packet = reader.read_frame(Some(&key)).await.unwrap();
        assert_eq!(packet, RawPacket::new(3, b"north".to_vec()));
        assert_eq!(reader.total_read(), first.len() as u64);

        let batch = reader.read_batch(Some(&key)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(reader.read_frame(Some(&key)).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_frame(None).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_read_batch_surfaces_fatal_frame() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);

        client.write_all(&[0xFF, 0xFF, 0xFF, 0xFF, 1, 2]).await.unwrap();
        match reader.read_batch(None).await {
            Err(TransportError::Codec(e)) => assert!(e.is_fatal()),
            other => panic!("expected fatal codec error, got {:?}", other.map(|v| v.len())),
        }
    }

    #[tokio::test]
    async fn test_write_frame_roundtrip() {
        let key = SessionKey::generate();
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);

        let sent = write_frame(&mut client, 0, &[], Some(&key)).await.unwrap();
        assert!(sent > 4);

        let packet = reader.read_frame(Some(&key)).await.unwrap();
        assert_eq!(packet, RawPacket::new(0, vec![]));
    }
}
