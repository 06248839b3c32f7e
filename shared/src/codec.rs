//! Length-prefixed frame codec
//!
//! Every frame on the wire is a big-endian `u32` body length followed by the
//! body. An unkeyed body is the type tag byte followed by the payload. A keyed
//! body is the same bytes sealed with [`SessionKey::seal`], so the type tag is
//! never visible on the wire once a key exists.
//!
//! Streaming transports do not preserve message boundaries, so decoding goes
//! through [`FrameDecoder`], which buffers whatever a receive returned and
//! yields frames only once they are complete. A frame that fails to decrypt or
//! is structurally broken is reported as an error for that frame alone and the
//! decoder moves on to the next one. A length prefix above [`MAX_FRAME_LEN`]
//! is fatal because there is no way to find the next frame boundary.

use crate::crypto::{CryptoError, SessionKey};

/// Size of the length prefix in front of every frame body
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Largest body accepted in either direction
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame body of {0} bytes exceeds the 64 KiB limit")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("frame could not be decrypted")]
    Decrypt,
    #[error("frame could not be encrypted")]
    Encrypt,
}

impl CodecError {
    /// True when the byte stream can no longer be split into frames
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::FrameTooLarge(_))
    }
}

impl From<CryptoError> for CodecError {
    fn from(error: CryptoError) -> Self {
        match error {
            CryptoError::Truncated(_) => {
                CodecError::Malformed("sealed body shorter than nonce and tag")
            }
            CryptoError::Encrypt => CodecError::Encrypt,
            _ => CodecError::Decrypt,
        }
    }
}

/// A decoded frame: numeric type tag plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub packet_type: u8,
    pub payload: Vec<u8>,
}

impl RawPacket {
    pub fn new(packet_type: u8, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            payload,
        }
    }
}

/// Frames `payload` under `packet_type`, sealing the body when a key is given
pub fn encode(
    packet_type: u8,
    payload: &[u8],
    key: Option<&SessionKey>,
) -> Result<Vec<u8>, CodecError> {
    let mut plain = Vec::with_capacity(1 + payload.len());
    plain.push(packet_type);
    plain.extend_from_slice(payload);

    let body = match key {
        Some(key) => key.seal(&plain)?,
        None => plain,
    };

    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn decode_body(body: &[u8], key: Option<&SessionKey>) -> Result<RawPacket, CodecError> {
    let plain = match key {
        Some(key) => key.open(body)?,
        None => body.to_vec(),
    };

    match plain.split_first() {
        Some((&packet_type, payload)) => Ok(RawPacket::new(packet_type, payload.to_vec())),
        None => Err(CodecError::Malformed("empty frame body")),
    }
}

/// Reassembles frames from arbitrarily split receive buffers
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next complete frame, if one is buffered
    ///
    /// A fatal error leaves the buffer untouched, so calling again returns the
    /// same error; callers are expected to drop the connection.
    pub fn next_frame(
        &mut self,
        key: Option<&SessionKey>,
    ) -> Option<Result<RawPacket, CodecError>> {
        if self.buffer.len() < LENGTH_PREFIX_LEN {
            return None;
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_LEN]);
        let body_len = u32::from_be_bytes(prefix) as usize;

        if body_len > MAX_FRAME_LEN {
            return Some(Err(CodecError::FrameTooLarge(body_len)));
        }

        let frame_len = LENGTH_PREFIX_LEN + body_len;
        if self.buffer.len() < frame_len {
            return None;
        }

        let result = decode_body(&self.buffer[LENGTH_PREFIX_LEN..frame_len], key);
        self.buffer.drain(..frame_len);
        Some(result)
    }

    /// Decodes every complete frame currently buffered
    ///
    /// Stops after the first fatal error, which is returned as the last element.
    pub fn drain(&mut self, key: Option<&SessionKey>) -> Vec<Result<RawPacket, CodecError>> {
        let mut frames = Vec::new();
        while let Some(result) = self.next_frame(key) {
            let fatal = matches!(&result, Err(e) if e.is_fatal());
            frames.push(result);
            if fatal {
                break;
            }
        }
        frames
    }
}

/// One-shot decode of a self-contained buffer, such as a datagram
///
/// Returns the decoded frames and the number of trailing bytes that did not
/// form a complete frame.
pub fn decode(
    bytes: &[u8],
    key: Option<&SessionKey>,
) -> (Vec<Result<RawPacket, CodecError>>, usize) {
    let mut decoder = FrameDecoder::new();
    decoder.extend(bytes);
    let frames = decoder.drain(key);
    (frames, decoder.buffered())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_packets(results: Vec<Result<RawPacket, CodecError>>) -> Vec<RawPacket> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_roundtrip_unkeyed() {
        for packet_type in [0u8, 1, 3, 127, 255] {
            for payload in [vec![], vec![0u8], b"{\"x\":1}".to_vec(), vec![0xFF; 1000]] {
                let frame = encode(packet_type, &payload, None).unwrap();
                let (frames, rest) = decode(&frame, None);
                assert_eq!(rest, 0);
                assert_eq!(ok_packets(frames), vec![RawPacket::new(packet_type, payload)]);
            }
        }
    }

    #[test]
    fn test_roundtrip_keyed() {
        let key = SessionKey::generate();
        for packet_type in [0u8, 2, 5, 200] {
            for payload in [vec![], b"#1#$data$".to_vec(), vec![0u8; 4096]] {
                let frame = encode(packet_type, &payload, Some(&key)).unwrap();
                let (frames, rest) = decode(&frame, Some(&key));
                assert_eq!(rest, 0);
                assert_eq!(ok_packets(frames), vec![RawPacket::new(packet_type, payload)]);
            }
        }
    }

    #[test]
    fn test_keyed_frame_hides_type_and_payload() {
        let key = SessionKey::generate();
        let frame = encode(3, b"plain-text-payload", Some(&key)).unwrap();
        assert!(!frame
            .windows(b"plain-text-payload".len())
            .any(|w| w == b"plain-text-payload"));
    }

    #[test]
    fn test_concatenated_frames_decode_in_order() {
        let key = SessionKey::generate();
        let mut buffer = Vec::new();
        for i in 0..10u8 {
            buffer.extend(encode(i % 4, &[i; 3], Some(&key)).unwrap());
        }

        let (frames, rest) = decode(&buffer, Some(&key));
        let packets = ok_packets(frames);
        assert_eq!(rest, 0);
        assert_eq!(packets.len(), 10);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.packet_type, i as u8 % 4);
            assert_eq!(packet.payload, vec![i as u8; 3]);
        }
    }

    #[test]
    fn test_arbitrary_split_points() {
        let key = SessionKey::generate();
        let mut stream = Vec::new();
        for i in 0..6u8 {
            stream.extend(encode(i, &vec![i; i as usize * 7], Some(&key)).unwrap());
        }

        for chunk_size in [1usize, 2, 3, 5, 7, 13, 64, stream.len()] {
            let mut decoder = FrameDecoder::new();
            let mut packets = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                decoder.extend(chunk);
                packets.extend(ok_packets(decoder.drain(Some(&key))));
            }
            assert_eq!(packets.len(), 6, "chunk size {}", chunk_size);
            for (i, packet) in packets.iter().enumerate() {
                assert_eq!(packet.packet_type, i as u8);
                assert_eq!(packet.payload.len(), i * 7);
            }
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let frame = encode(1, b"hello", None).unwrap();
        let (frames, rest) = decode(&frame[..frame.len() - 2], None);
        assert!(frames.is_empty());
        assert_eq!(rest, frame.len() - 2);

        let (frames, rest) = decode(&frame[..3], None);
        assert!(frames.is_empty());
        assert_eq!(rest, 3);
    }

    #[test]
    fn test_empty_buffer_yields_nothing() {
        let (frames, rest) = decode(&[], None);
        assert!(frames.is_empty());
        assert_eq!(rest, 0);
    }

    #[test]
    fn test_bad_frame_does_not_stop_siblings() {
        let key = SessionKey::generate();
        let other_key = SessionKey::generate();

        let mut buffer = encode(0, b"first", Some(&key)).unwrap();
        buffer.extend(encode(3, b"wrong key", Some(&other_key)).unwrap());
        buffer.extend([0, 0, 0, 0]); // empty body
        buffer.extend(encode(1, b"last", Some(&key)).unwrap());

        let (frames, rest) = decode(&buffer, Some(&key));
        assert_eq!(rest, 0);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].as_ref().unwrap().payload, b"first");
        assert!(matches!(frames[1], Err(CodecError::Decrypt)));
        assert!(matches!(frames[2], Err(CodecError::Malformed(_))));
        assert_eq!(frames[3].as_ref().unwrap().payload, b"last");
    }

    #[test]
    fn test_unkeyed_empty_body_is_malformed() {
        let (frames, _) = decode(&[0, 0, 0, 0], None);
        assert!(matches!(frames[0], Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_oversized_prefix_is_fatal() {
        let mut buffer = encode(0, b"ok", None).unwrap();
        buffer.extend(((MAX_FRAME_LEN + 1) as u32).to_be_bytes());
        buffer.extend(encode(0, b"never reached", None).unwrap());

        let (frames, rest) = decode(&buffer, None);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        match &frames[1] {
            Err(e) => assert!(e.is_fatal()),
            Ok(_) => panic!("oversized frame accepted"),
        }
        assert!(rest > 0);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_LEN];
        assert!(matches!(
            encode(1, &payload, None),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let frame = encode(9, &[1, 2, 3], None).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 4]);
        assert_eq!(frame[4], 9);
    }
}
